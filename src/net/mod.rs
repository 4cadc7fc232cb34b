//! Small building blocks for the energy and denoising networks.
mod activation;
pub use activation::Activation;

mod feedforward;
pub use feedforward::FeedForwardNet;
