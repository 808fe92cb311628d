//! DDPM noise schedule for training and a deterministic DDIM sampler for
//! image logging

use anyhow::Result;
use candle_core::{Device, Tensor};
use rand::Rng;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BetaSchedule {
    Linear,
    /// Linear in `sqrt(beta)`, the Stable Diffusion schedule.
    ScaledLinear,
    SquaredCosCapV2,
}

impl std::str::FromStr for BetaSchedule {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "linear" => Ok(Self::Linear),
            "scaled_linear" => Ok(Self::ScaledLinear),
            "squaredcos_cap_v2" => Ok(Self::SquaredCosCapV2),
            other => anyhow::bail!("unknown beta schedule '{}'", other),
        }
    }
}

#[derive(Debug, Clone)]
pub struct DDPMScheduler {
    num_timesteps: usize,
    alphas_cumprod: Vec<f64>,
}

impl DDPMScheduler {
    pub fn new(
        num_timesteps: usize,
        beta_start: f64,
        beta_end: f64,
        beta_schedule: BetaSchedule,
    ) -> Result<Self> {
        anyhow::ensure!(num_timesteps > 1, "need at least two diffusion timesteps");
        let betas = match beta_schedule {
            BetaSchedule::Linear => linspace(beta_start, beta_end, num_timesteps),
            BetaSchedule::ScaledLinear => linspace(beta_start.sqrt(), beta_end.sqrt(), num_timesteps)
                .into_iter()
                .map(|b| b * b)
                .collect(),
            BetaSchedule::SquaredCosCapV2 => {
                let alpha_bar =
                    |t: f64| f64::cos((t + 0.008) / 1.008 * std::f64::consts::FRAC_PI_2).powi(2);
                (0..num_timesteps)
                    .map(|i| {
                        let t1 = i as f64 / num_timesteps as f64;
                        let t2 = (i + 1) as f64 / num_timesteps as f64;
                        (1.0 - alpha_bar(t2) / alpha_bar(t1)).min(0.999)
                    })
                    .collect()
            }
        };

        let mut alphas_cumprod = Vec::with_capacity(num_timesteps);
        let mut cumprod = 1.0;
        for beta in betas {
            cumprod *= 1.0 - beta;
            alphas_cumprod.push(cumprod);
        }

        Ok(Self {
            num_timesteps,
            alphas_cumprod,
        })
    }

    pub fn num_train_timesteps(&self) -> usize {
        self.num_timesteps
    }

    pub fn alphas_cumprod(&self) -> &[f64] {
        &self.alphas_cumprod
    }

    /// `sqrt(a_t) * x0 + sqrt(1 - a_t) * noise`, with one timestep shared by
    /// the whole batch.
    pub fn add_noise(&self, original: &Tensor, noise: &Tensor, timestep: usize) -> Result<Tensor> {
        let alpha = self.alphas_cumprod[timestep];
        let scaled_original = (original * alpha.sqrt())?;
        let scaled_noise = (noise * (1.0 - alpha).sqrt())?;
        Ok((scaled_original + scaled_noise)?)
    }

    /// Uniform training timestep in `0..num_timesteps`.
    pub fn sample_timestep<R: Rng>(&self, rng: &mut R) -> usize {
        rng.gen_range(0..self.num_timesteps)
    }

    /// `(batch_size,)` tensor holding `timestep`, for modules that embed a
    /// per-sample timestep.
    pub fn timestep_tensor(timestep: usize, batch_size: usize, device: &Device) -> Result<Tensor> {
        Ok(Tensor::full(timestep as f32, batch_size, device)?)
    }
}

fn linspace(start: f64, end: f64, n: usize) -> Vec<f64> {
    (0..n)
        .map(|i| start + (end - start) * i as f64 / (n as f64 - 1.0))
        .collect()
}

/// DDIM sampler with `eta = 0` over uniformly spaced timesteps.
#[derive(Debug, Clone)]
pub struct DDIMSampler {
    timesteps: Vec<usize>,
    alphas: Vec<f64>,
    alphas_prev: Vec<f64>,
}

impl DDIMSampler {
    /// Timesteps are `1, 1 + c, 1 + 2c, ...` with `c = T / steps`, and each
    /// step's previous alpha is the cumulative alpha of the step below it
    /// (the first falls back to `alphas_cumprod[0]`).
    pub fn new(scheduler: &DDPMScheduler, num_steps: usize) -> Result<Self> {
        let total = scheduler.num_train_timesteps();
        anyhow::ensure!(
            num_steps > 0 && num_steps <= total,
            "DDIM steps must be in 1..={}, got {}",
            total,
            num_steps
        );
        let stride = total / num_steps;
        let timesteps: Vec<usize> = (0..num_steps)
            .map(|i| (i * stride + 1).min(total - 1))
            .collect();

        let ac = scheduler.alphas_cumprod();
        let alphas: Vec<f64> = timesteps.iter().map(|&t| ac[t]).collect();
        let alphas_prev: Vec<f64> = std::iter::once(ac[0])
            .chain(timesteps[..num_steps - 1].iter().map(|&t| ac[t]))
            .collect();

        Ok(Self {
            timesteps,
            alphas,
            alphas_prev,
        })
    }

    /// Timesteps in sampling order (descending).
    pub fn timesteps(&self) -> Vec<usize> {
        self.timesteps.iter().rev().copied().collect()
    }

    pub fn num_steps(&self) -> usize {
        self.timesteps.len()
    }

    /// One denoising step. `index` counts down from `num_steps() - 1`, in step
    /// with [`Self::timesteps`].
    pub fn step(&self, sample: &Tensor, eps: &Tensor, index: usize) -> Result<Tensor> {
        let a_t = self.alphas[index];
        let a_prev = self.alphas_prev[index];

        let pred_x0 = ((sample - (eps * (1.0 - a_t).sqrt())?)? / a_t.sqrt())?;
        let dir_xt = (eps * (1.0 - a_prev).sqrt())?;
        Ok(((pred_x0 * a_prev.sqrt())? + dir_xt)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    fn sd_scheduler() -> DDPMScheduler {
        DDPMScheduler::new(1000, 0.00085, 0.012, BetaSchedule::ScaledLinear).unwrap()
    }

    #[test]
    fn test_scaled_linear_schedule() {
        let scheduler = sd_scheduler();
        let ac = scheduler.alphas_cumprod();
        assert_eq!(ac.len(), 1000);
        assert!((ac[0] - (1.0 - 0.00085)).abs() < 1e-9);
        assert!(ac.windows(2).all(|w| w[1] < w[0]));
        // Known endpoint of the SD 1.x schedule.
        assert!((ac[999] - 0.0047).abs() < 1e-4);
    }

    #[test]
    fn test_schedule_names() {
        assert_eq!("scaled_linear".parse::<BetaSchedule>().unwrap(), BetaSchedule::ScaledLinear);
        assert_eq!("linear".parse::<BetaSchedule>().unwrap(), BetaSchedule::Linear);
        assert!("cubic".parse::<BetaSchedule>().is_err());
    }

    #[test]
    fn test_add_noise() -> Result<()> {
        let scheduler = sd_scheduler();
        let device = Device::Cpu;
        let x0 = Tensor::ones((1, 4, 2, 2), candle_core::DType::F32, &device)?;
        let noise = Tensor::zeros((1, 4, 2, 2), candle_core::DType::F32, &device)?;

        let noisy = scheduler.add_noise(&x0, &noise, 500)?;
        let expected = scheduler.alphas_cumprod()[500].sqrt() as f32;
        let got = noisy.mean_all()?.to_scalar::<f32>()?;
        assert!((got - expected).abs() < 1e-6);
        Ok(())
    }

    #[test]
    fn test_sampled_timesteps_in_range() {
        let scheduler = sd_scheduler();
        let mut rng = StdRng::seed_from_u64(0);
        for _ in 0..1000 {
            assert!(scheduler.sample_timestep(&mut rng) < 1000);
        }
    }

    #[test]
    fn test_ddim_timesteps() -> Result<()> {
        let scheduler = sd_scheduler();
        let sampler = DDIMSampler::new(&scheduler, 50)?;
        let ts = sampler.timesteps();
        assert_eq!(ts.len(), 50);
        assert_eq!(ts[0], 981);
        assert_eq!(ts[49], 1);
        assert_eq!(sampler.alphas_prev[0], scheduler.alphas_cumprod()[0]);
        assert_eq!(sampler.alphas_prev[1], scheduler.alphas_cumprod()[1]);
        assert!(DDIMSampler::new(&scheduler, 0).is_err());
        Ok(())
    }

    #[test]
    fn test_ddim_step_recovers_clean_sample() -> Result<()> {
        // With the true noise as prediction, stepping from x_t lands on the
        // forward-noised sample at the previous alpha.
        let scheduler = sd_scheduler();
        let sampler = DDIMSampler::new(&scheduler, 50)?;
        let device = Device::Cpu;
        let x0 = Tensor::randn(0f32, 1., (1, 4, 4, 4), &device)?;
        let eps = Tensor::randn(0f32, 1., (1, 4, 4, 4), &device)?;

        let index = 10;
        let t = sampler.timesteps[index];
        let x_t = scheduler.add_noise(&x0, &eps, t)?;
        let x_prev = sampler.step(&x_t, &eps, index)?;

        let a_prev = sampler.alphas_prev[index];
        let expected = ((&x0 * a_prev.sqrt())? + (&eps * (1.0 - a_prev).sqrt())?)?;
        let diff = (x_prev - expected)?.abs()?.max_keepdim(0)?.flatten_all()?.max(0)?;
        assert!(diff.to_scalar::<f32>()? < 1e-4);
        Ok(())
    }
}
