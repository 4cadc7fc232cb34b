//! Gaussian distributions over the last tensor dimension.
use std::f64::consts::PI;

use tch::{Kind, Tensor};

use crate::error::Result;

/// Independent normal, one scale per coordinate.
pub struct Normal {
    mean: Tensor,
    std: Tensor,
}

impl Normal {
    pub fn new(mean: Tensor, std: Tensor) -> Self {
        Normal { mean, std }
    }

    /// Element-wise log-density, same shape as `xs`.
    pub fn log_prob(&self, xs: &Tensor) -> Tensor {
        let z = (xs - &self.mean) / &self.std;
        z.square() * -0.5 - self.std.log() - 0.5 * (2. * PI).ln()
    }

    pub fn sample(&self) -> Tensor {
        let eps = Tensor::randn_like(&self.mean);
        &self.mean + &self.std * eps
    }
}

/// Batched multivariate normal parameterised by its covariance.
///
/// `loc` is `[batch, n]` and `covariance` `[batch, n, n]`. The Cholesky
/// factor is computed once on construction, which fails when the covariance
/// is not positive definite.
pub struct MultivariateNormal {
    loc: Tensor,
    covariance: Tensor,
    scale_tril: Tensor,
}

impl MultivariateNormal {
    pub fn new(loc: Tensor, covariance: Tensor) -> Result<Self> {
        let scale_tril = covariance.f_linalg_cholesky(false)?;
        Ok(Self { loc, covariance, scale_tril })
    }

    pub fn loc(&self) -> &Tensor {
        &self.loc
    }

    pub fn covariance(&self) -> &Tensor {
        &self.covariance
    }

    /// Log-density of `xs` (`[batch, n]`), returns `[batch]`.
    pub fn log_prob(&self, xs: &Tensor) -> Result<Tensor> {
        let n = *self.loc.size().last().unwrap_or(&0) as f64;
        let diff = (xs - &self.loc).unsqueeze(-1);
        // L z = x - loc
        let z = self.scale_tril.f_linalg_solve_triangular(&diff, false, true, false)?.squeeze_dim(-1);
        let maha = z.square().sum_dim_intlist(-1, false, Kind::Float);
        let half_log_det =
            self.scale_tril.diagonal(0, -2, -1).log().sum_dim_intlist(-1, false, Kind::Float);
        Ok((maha + n * (2. * PI).ln()) * -0.5 - half_log_det)
    }

    pub fn sample(&self) -> Tensor {
        let eps = Tensor::randn_like(&self.loc).unsqueeze(-1);
        &self.loc + self.scale_tril.matmul(&eps).squeeze_dim(-1)
    }
}
