//! Maximum mean discrepancy between two sample sets.
use tch::{Kind, Tensor};

use crate::error::{DenoiseError, Result};

pub const DEFAULT_BANDWIDTHS: [f64; 4] = [0.1, 0.5, 1.0, 2.0];

fn sq_dists(a: &Tensor, b: &Tensor) -> Tensor {
    let aa = a.square().sum_dim_intlist(-1, true, Kind::Float);
    let bb = b.square().sum_dim_intlist(-1, true, Kind::Float).transpose(0, 1);
    (aa + bb - a.matmul(&b.transpose(0, 1)) * 2.).clamp_min(0.)
}

fn rbf_mean(d2: &Tensor, bandwidths: &[f64]) -> f64 {
    bandwidths
        .iter()
        .map(|h| (d2 / (-2. * h * h)).exp().mean(Kind::Float).double_value(&[]))
        .sum()
}

/// Biased estimate of MMD² under a sum of RBF kernels, one per bandwidth.
pub fn mmd_rbf(x: &Tensor, y: &Tensor, bandwidths: &[f64]) -> Result<f64> {
    let (xs, ys) = (x.size(), y.size());
    if xs.len() != 2 || ys.len() != 2 || xs[1] != ys[1] {
        return Err(DenoiseError::Shape {
            what: "mmd samples",
            got: ys,
            expected: format!("[m, n] matching {xs:?}"),
        });
    }
    let y = y.to_device(x.device()).to_kind(x.kind());
    let kxx = rbf_mean(&sq_dists(x, x), bandwidths);
    let kyy = rbf_mean(&sq_dists(&y, &y), bandwidths);
    let kxy = rbf_mean(&sq_dists(x, &y), bandwidths);
    Ok(kxx + kyy - 2. * kxy)
}
