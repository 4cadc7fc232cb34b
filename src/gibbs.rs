//! Noise-then-denoise Gibbs chain.
use tch::{Device, Tensor};
use tracing::{debug, info_span, warn};

use crate::config::DenoiserConfig;
use crate::error::Result;
use crate::utils::has_nan;

/// Runs `steps` iterations of `x <- backward_sampler(x + noise_std * eps)`
/// starting from `x_init` and returns every visited state, concatenated along
/// the first dimension on the CPU.
///
/// A `[batch, n]` start therefore yields a `[steps * batch, n]` trajectory.
pub fn gibbs_sampler<F>(
    x_init: &Tensor,
    mut backward_sampler: F,
    steps: usize,
    noise_std: f64,
    device: Device,
) -> Result<Tensor>
where
    F: FnMut(&Tensor) -> Result<Tensor>,
{
    let _span = info_span!("gibbs", steps, noise_std).entered();
    let mut x = x_init.to_device(device);
    let mut samples = Vec::with_capacity(steps);
    for step in 0..steps {
        let noisy_x = &x + Tensor::randn_like(&x) * noise_std;
        x = backward_sampler(&noisy_x)?.detach();
        if has_nan(&x) {
            warn!(step, "gibbs chain produced NaN");
        }
        debug!(step, "gibbs step");
        samples.push(x.to_device(Device::Cpu));
    }
    if samples.is_empty() {
        let mut size = x_init.size();
        if let Some(first) = size.first_mut() {
            *first = 0;
        }
        return Ok(Tensor::zeros(size.as_slice(), (x_init.kind(), Device::Cpu)));
    }
    Ok(Tensor::cat(&samples, 0))
}

/// [`gibbs_sampler`] with the step count, noise level and device taken from
/// the config.
pub fn gibbs_sampler_from_config<F>(
    x_init: &Tensor,
    backward_sampler: F,
    cfg: &DenoiserConfig,
) -> Result<Tensor>
where
    F: FnMut(&Tensor) -> Result<Tensor>,
{
    gibbs_sampler(x_init, backward_sampler, cfg.gibbs_steps, cfg.noise_std, cfg.device())
}
