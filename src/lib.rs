pub mod config;
pub mod data;
pub mod models;
pub mod trainers;

pub use config::{Args, TrainingConfig};

pub mod logging {
    use env_logger::Builder;
    use log::LevelFilter;
    use std::io::Write;

    /// Install the global logger. `RUST_LOG` overrides the `Info` default.
    pub fn init_logger() {
        Builder::new()
            .format(|buf, record| {
                writeln!(
                    buf,
                    "{} [{}] - {}",
                    chrono::Local::now().format("%Y-%m-%d %H:%M:%S"),
                    record.level(),
                    record.args()
                )
            })
            .filter(None, LevelFilter::Info)
            .parse_default_env()
            .init();
    }
}
