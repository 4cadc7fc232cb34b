//! Models of the denoising posterior `p(x | x̃)`.
mod ebm;
pub use ebm::{DenoisingEbm, IsotropicDenoiser};

mod learned_var;
pub use learned_var::DenoiserLearnedVar;
