use std::fs;

use serde::{Deserialize, Serialize};
use tch::Device;

use crate::net::Activation;
use crate::utils::get_device;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum DeviceSpec {
    /// MPS when present, then CUDA, then CPU.
    Auto,
    Cpu,
    Mps,
    Cuda(usize),
}

impl DeviceSpec {
    pub fn device(&self) -> Device {
        match self {
            DeviceSpec::Auto => get_device(),
            DeviceSpec::Cpu => Device::Cpu,
            DeviceSpec::Mps => Device::Mps,
            DeviceSpec::Cuda(idx) => Device::Cuda(*idx),
        }
    }
}

/// Shared settings for the denoisers and the Gibbs sampler.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DenoiserConfig {
    pub x_dim: i64,
    pub device: DeviceSpec,
    /// Standard deviation of the corruption `x + noise_std * eps`.
    pub noise_std: f64,
    pub hidden_dim: i64,
    // number of hidden layers
    pub layer_num: i64,
    pub act: Activation,
    pub lr: f64,
    pub gibbs_steps: usize,
}

impl Default for DenoiserConfig {
    fn default() -> Self {
        Self {
            x_dim: 2,
            device: DeviceSpec::Auto,
            noise_std: 0.3,
            hidden_dim: 128,
            layer_num: 3,
            act: Activation::Swish,
            lr: 1e-3,
            gibbs_steps: 1000,
        }
    }
}

impl DenoiserConfig {
    pub fn from_file<T: AsRef<std::path::Path>>(path: T) -> anyhow::Result<Self> {
        let file = fs::read_to_string(path)?;
        let cfg: DenoiserConfig = toml::from_str(&file)?;
        Ok(cfg)
    }

    pub fn device(&self) -> Device {
        self.device.device()
    }
}
