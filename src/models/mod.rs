//! ControlLDM model: architecture config, ControlNet, text conditioning and
//! the trainable wrapper tying them to a frozen Stable Diffusion

pub mod cldm;
pub mod config;
pub mod controlnet;
pub mod text_encoder;

pub use cldm::{load_state_dict, ControlLdm, ModelSettings};
pub use config::ControlLdmConfig;
pub use controlnet::{ControlNet, ControlNetOutput};
pub use text_encoder::{ClipConditioner, TextConditioner};
