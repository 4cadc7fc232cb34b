use thiserror::Error;

#[derive(Debug, Error)]
pub enum DenoiseError {
    /// Isotropic quantities were requested before `estimate_isotropic_cov` ran.
    #[error("isotropic covariance has not been estimated, call estimate_isotropic_cov first")]
    IsotropicCovNotEstimated,

    #[error("expected a single sample, got a batch of {batch}")]
    BatchedInput { batch: i64 },

    #[error("unexpected shape {got:?} for {what}, expected {expected}")]
    Shape {
        what: &'static str,
        got: Vec<i64>,
        expected: String,
    },

    #[error("covariance is not positive semi-definite after adding {jitter} to the diagonal")]
    NotPositiveDefinite { jitter: f64 },

    #[error(transparent)]
    Torch(#[from] tch::TchError),
}

pub type Result<T> = std::result::Result<T, DenoiseError>;
