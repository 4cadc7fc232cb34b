use tch::{Device, Kind, Tensor};

use crate::error::{DenoiseError, Result};

/// Smallest real eigenvalue part a covariance may have to count as PSD.
pub const PSD_EPS: f64 = 1e-7;

pub fn get_device() -> Device {
    let accelerator_device =
            if tch::utils::has_mps() { Device::Mps } else { Device::cuda_if_available() };

    return accelerator_device
}

pub fn has_nan(xs: &Tensor) -> bool {
    xs.isnan().any().to_kind(Kind::Int64).int64_value(&[]) != 0
}

/// Returns true when every eigenvalue of `q` has a real part above [`PSD_EPS`].
///
/// `q` is a single `[n, n]` matrix. The check goes through the general
/// eigen-decomposition so that a slightly asymmetric Jacobian is judged on
/// what it is rather than on its lower triangle.
pub fn is_psd(q: &Tensor) -> Result<bool> {
    let (e, _) = q.f_linalg_eig()?;
    let below = e.real().le(PSD_EPS).any().to_kind(Kind::Int64).int64_value(&[]);
    Ok(below == 0)
}

/// Diagonal term added to a covariance that fails [`is_psd`].
pub const PSD_JITTER: f64 = 1e-2;
const MAX_PSD_REPAIRS: usize = 10;

/// Adds `PSD_JITTER * I` to a `[n, n]` covariance that is not PSD.
///
/// A single jitter is enough for covariances that are only slightly off, the
/// jitter doubles for the rare matrix that still fails.
pub fn repair_psd(cov: Tensor) -> Result<Tensor> {
    if is_psd(&cov)? {
        return Ok(cov);
    }
    let n = cov.size()[0];
    let eye = Tensor::eye(n, (cov.kind(), cov.device()));
    let mut jitter = PSD_JITTER;
    for _ in 0..MAX_PSD_REPAIRS {
        let repaired = &cov + &eye * jitter;
        if is_psd(&repaired)? {
            tracing::debug!(jitter, "covariance repaired");
            return Ok(repaired);
        }
        jitter *= 2.;
    }
    Err(DenoiseError::NotPositiveDefinite { jitter })
}

/// Builds a `[batch, n, n]` stack of `value * I`.
pub fn batched_diag(batch: i64, n: i64, value: f64, (kind, device): (Kind, Device)) -> Tensor {
    Tensor::full([batch, n], value, (kind, device)).diag_embed(0, -2, -1)
}

/// Checks that `xs` is `[batch, n]` and returns both sizes.
pub fn check_2d(what: &'static str, xs: &Tensor, n: i64) -> Result<(i64, i64)> {
    let size = xs.size();
    if let [batch, dim] = size[..] {
        if dim == n {
            return Ok((batch, dim));
        }
    }
    Err(DenoiseError::Shape { what, got: size, expected: format!("[batch, {n}]") })
}
