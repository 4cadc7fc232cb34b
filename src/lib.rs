pub mod config;
pub mod data;
pub mod denoiser;
pub mod distributions;
pub mod error;
pub mod gibbs;
pub mod mmd;
pub mod net;
pub mod utils;

pub use config::{DenoiserConfig, DeviceSpec};
pub use error::{DenoiseError, Result};
