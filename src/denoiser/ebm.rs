//! Denoising energy-based model.
//!
//! The network assigns a scalar energy `E(x̃)` to a noisy point. Its score
//! `s(x̃) = -∇E(x̃)` gives the posterior mean through Tweedie's formula
//!
//! ```text
//! E[x | x̃] = x̃ + σ² s(x̃)
//! ```
//!
//! and the Jacobian of the score gives the posterior covariance
//!
//! ```text
//! Cov[x | x̃] = σ⁴ ∇s(x̃) + σ² I
//! ```
//!
//! The covariance can also be collapsed to a single isotropic value estimated
//! once from a reference dataset.
use tch::{nn, nn::Module, nn::OptimizerConfig, Device, Kind, Tensor};
use tracing::info;

use crate::config::DenoiserConfig;
use crate::distributions::MultivariateNormal;
use crate::error::{DenoiseError, Result};
use crate::net::FeedForwardNet;
use crate::utils::{batched_diag, check_2d, repair_psd};

pub struct DenoisingEbm {
    pub x_dim: i64,
    pub device: Device,
    pub noise_std: f64,
    vs: nn::VarStore,
    net: FeedForwardNet,
    optimizer: nn::Optimizer,
    iso_cov: Option<f64>,
}

impl DenoisingEbm {
    pub fn new(cfg: &DenoiserConfig) -> Result<Self> {
        let device = cfg.device();
        let vs = nn::VarStore::new(device);
        let net =
            FeedForwardNet::new(vs.root() / "net", cfg.x_dim, 1, cfg.hidden_dim, cfg.layer_num, cfg.act);
        let optimizer = nn::Adam::default().build(&vs, cfg.lr)?;
        Ok(Self {
            x_dim: cfg.x_dim,
            device,
            noise_std: cfg.noise_std,
            vs,
            net,
            optimizer,
            iso_cov: None,
        })
    }

    pub fn var_store(&self) -> &nn::VarStore {
        &self.vs
    }

    fn variance(&self) -> f64 {
        self.noise_std * self.noise_std
    }

    /// A fresh leaf on the model device that autograd can differentiate against.
    fn leaf(&self, noisy_x: &Tensor) -> Tensor {
        noisy_x.to_device(self.device).detach().contiguous().set_requires_grad(true)
    }

    fn score_at(&self, leaf: &Tensor, create_graph: bool) -> Result<Tensor> {
        let energy = self.net.forward(leaf).sum(Kind::Float);
        let grads = Tensor::f_run_backward(&[&energy], &[leaf], true, create_graph)?;
        Ok(-&grads[0])
    }

    /// One energy per row of `noisy_x`.
    pub fn energy(&self, noisy_x: &Tensor) -> Tensor {
        self.net.forward(&noisy_x.to_device(self.device)).squeeze_dim(-1)
    }

    /// `-∇E(noisy_x)`, still attached to the network parameters.
    pub fn score(&self, noisy_x: &Tensor) -> Result<Tensor> {
        tch::with_grad(|| {
            let leaf = self.leaf(noisy_x);
            self.score_at(&leaf, true)
        })
    }

    /// Tweedie estimate of the clean mean.
    pub fn forward(&self, noisy_x: &Tensor) -> Result<Tensor> {
        tch::with_grad(|| {
            let leaf = self.leaf(noisy_x);
            let score = self.score_at(&leaf, true)?;
            Ok(&leaf + score * self.variance())
        })
    }

    /// Denoising score matching on a batch of clean points, returns the loss
    /// before the update.
    pub fn train_step(&mut self, x: &Tensor) -> Result<f64> {
        let x = x.to_device(self.device);
        let noisy_x = &x + Tensor::randn_like(&x) * self.noise_std;
        let mean = self.forward(&noisy_x)?;
        let loss = (mean - &x).square().sum_dim_intlist(-1, false, Kind::Float).mean(Kind::Float);
        self.optimizer.backward_step(&loss);
        Ok(loss.double_value(&[]))
    }

    pub fn iso_cov(&self) -> Option<f64> {
        self.iso_cov
    }

    /// Estimates the isotropic posterior variance `σ² - σ⁴ E‖s‖² / d` on a
    /// freshly noised copy of `dataset` and caches it on the model.
    ///
    /// `d` is `x_dim`, so for 2-D data this is `σ² - σ⁴ E‖s‖² / 2`.
    pub fn estimate_isotropic_cov(&mut self, dataset: &Tensor) -> Result<f64> {
        check_2d("dataset", dataset, self.x_dim)?;
        let dataset = dataset.to_device(self.device);
        let noisy = &dataset + Tensor::randn_like(&dataset) * self.noise_std;
        let score = tch::with_grad(|| {
            let leaf = self.leaf(&noisy);
            self.score_at(&leaf, false)
        })?;
        let sq_norm = score
            .detach()
            .square()
            .sum_dim_intlist(-1, false, Kind::Float)
            .mean(Kind::Float)
            .double_value(&[]);
        let var = self.variance();
        let iso_cov = var - var * var * sq_norm / self.x_dim as f64;
        info!(iso_cov, sq_norm, "estimated isotropic covariance");
        self.iso_cov = Some(iso_cov);
        Ok(iso_cov)
    }

    /// View over the model with its isotropic covariance, only available once
    /// [`DenoisingEbm::estimate_isotropic_cov`] has run.
    pub fn isotropic(&self) -> Result<IsotropicDenoiser<'_>> {
        match self.iso_cov {
            Some(iso_cov) => Ok(IsotropicDenoiser { model: self, iso_cov }),
            None => Err(DenoiseError::IsotropicCovNotEstimated),
        }
    }

    pub fn dist_p_x_tx_isotropic_cov(&self, noisy_x: &Tensor) -> Result<MultivariateNormal> {
        self.isotropic()?.dist(noisy_x)
    }

    pub fn logp_x_tx_isotropic_cov(&self, x: &Tensor, noisy_x: &Tensor) -> Result<Tensor> {
        self.isotropic()?.logp_x_tx(x, noisy_x)
    }

    pub fn sample_isotropic_cov(&self, noisy_x: &Tensor) -> Result<Tensor> {
        self.isotropic()?.sample(noisy_x)
    }

    /// Per-sample Jacobian of the score, `[batch, n, n]` with
    /// `J[b, i, j] = ∂s_i / ∂x̃_j`, i.e. minus the Hessian of the energy.
    ///
    /// Rows of the batch do not interact, so differentiating the batch-summed
    /// score component `i` yields row `i` of every per-sample block at once.
    pub fn score_jacobian(&self, noisy_x: &Tensor) -> Result<Tensor> {
        let (_, n) = check_2d("noisy_x", noisy_x, self.x_dim)?;
        tch::with_grad(|| {
            let leaf = self.leaf(noisy_x);
            let score = self.score_at(&leaf, true)?;
            // keeps `leaf` in the graph when the score is constant (linear energy),
            // the Jacobian rows then come out as zeros
            let anchor = leaf.sum(Kind::Float) * 0.;
            let mut rows = Vec::with_capacity(n as usize);
            for i in 0..n {
                let s_i = score.select(1, i).sum(Kind::Float) + &anchor;
                let grads = Tensor::f_run_backward(&[&s_i], &[&leaf], true, false)?;
                rows.push(grads[0].detach());
            }
            Ok(Tensor::stack(&rows, 1))
        })
    }

    /// `σ⁴ J + σ² I` per row of `noisy_x`.
    fn full_cov(&self, noisy_x: &Tensor) -> Result<Tensor> {
        let (batch, n) = check_2d("noisy_x", noisy_x, self.x_dim)?;
        let jac = self.score_jacobian(noisy_x)?;
        let var = self.variance();
        let diag = batched_diag(batch, n, var, (jac.kind(), jac.device()));
        Ok(jac * (var * var) + diag)
    }

    /// Batched full-covariance posterior. The covariance is used as is, a
    /// non positive definite one surfaces as a Cholesky error.
    pub fn dist_p_x_tx_full_cov(&self, noisy_x: &Tensor) -> Result<MultivariateNormal> {
        check_2d("noisy_x", noisy_x, self.x_dim)?;
        let x_mu = self.forward(noisy_x)?;
        let x_cov = self.full_cov(noisy_x)?;
        MultivariateNormal::new(x_mu, x_cov)
    }

    pub fn logp_x_tx_full_cov(&self, x: &Tensor, noisy_x: &Tensor) -> Result<Tensor> {
        check_2d("x", x, self.x_dim)?;
        let dist = self.dist_p_x_tx_full_cov(noisy_x)?;
        Ok(dist.log_prob(&x.to_device(self.device))?.detach())
    }

    /// Reshapes a single noisy point to `[1, n]`, refusing batches.
    fn single(&self, noisy_x: &Tensor) -> Result<Tensor> {
        let size = noisy_x.size();
        match size[..] {
            [n] if n == self.x_dim => Ok(noisy_x.view((1, n))),
            [1, n] if n == self.x_dim => Ok(noisy_x.shallow_clone()),
            [batch, n] if n == self.x_dim => Err(DenoiseError::BatchedInput { batch }),
            _ => Err(DenoiseError::Shape {
                what: "noisy_x",
                got: noisy_x.size(),
                expected: format!("[{}] or [1, {}]", self.x_dim, self.x_dim),
            }),
        }
    }

    /// Full covariance of a single noisy point, `[n, n]`, made PSD by adding
    /// a small diagonal term when needed.
    pub fn repaired_full_cov(&self, noisy_x: &Tensor) -> Result<Tensor> {
        let noisy_x = self.single(noisy_x)?;
        repair_psd(self.full_cov(&noisy_x)?.squeeze_dim(0))
    }

    /// Draws one sample from the full-covariance posterior of a single noisy
    /// point. Batched input is rejected, see [`DenoiseError::BatchedInput`].
    pub fn sample_full_cov(&self, noisy_x: &Tensor) -> Result<Tensor> {
        let noisy_x = self.single(noisy_x)?;
        let x_mu = self.forward(&noisy_x)?.detach();
        let x_cov = self.repaired_full_cov(&noisy_x)?;
        let dist = MultivariateNormal::new(x_mu, x_cov.unsqueeze(0))?;
        Ok(tch::no_grad(|| dist.sample()))
    }
}

/// A [`DenoisingEbm`] together with its estimated isotropic covariance.
pub struct IsotropicDenoiser<'a> {
    model: &'a DenoisingEbm,
    iso_cov: f64,
}

impl<'a> IsotropicDenoiser<'a> {
    pub fn iso_cov(&self) -> f64 {
        self.iso_cov
    }

    /// `N(μ(x̃), iso_cov · I)` for every row of `noisy_x`.
    pub fn dist(&self, noisy_x: &Tensor) -> Result<MultivariateNormal> {
        let (batch, n) = check_2d("noisy_x", noisy_x, self.model.x_dim)?;
        let x_mu = self.model.forward(noisy_x)?;
        let x_cov = batched_diag(batch, n, self.iso_cov, (x_mu.kind(), x_mu.device()));
        MultivariateNormal::new(x_mu, x_cov)
    }

    pub fn logp_x_tx(&self, x: &Tensor, noisy_x: &Tensor) -> Result<Tensor> {
        check_2d("x", x, self.model.x_dim)?;
        let dist = self.dist(noisy_x)?;
        Ok(dist.log_prob(&x.to_device(self.model.device))?.detach())
    }

    pub fn sample(&self, noisy_x: &Tensor) -> Result<Tensor> {
        let dist = self.dist(noisy_x)?;
        Ok(tch::no_grad(|| dist.sample()).detach())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::DeviceSpec;
    use crate::utils::is_psd;

    const OPTS: (Kind, Device) = (Kind::Float, Device::Cpu);

    fn cfg(noise_std: f64) -> DenoiserConfig {
        DenoiserConfig {
            device: DeviceSpec::Cpu,
            noise_std,
            hidden_dim: 32,
            layer_num: 2,
            ..Default::default()
        }
    }

    fn zero_weights(model: &DenoisingEbm) {
        tch::no_grad(|| {
            for (_, mut v) in model.var_store().variables() {
                let _ = v.zero_();
            }
        });
    }

    fn close(a: &Tensor, b: &Tensor, tol: f64) -> bool {
        (a - b).abs().max().double_value(&[]) < tol
    }

    #[test]
    fn test_constant_energy_is_identity_denoiser() {
        let model = DenoisingEbm::new(&cfg(0.5)).unwrap();
        zero_weights(&model);
        let noisy_x = Tensor::randn([4, 2], OPTS);
        assert!(close(&model.forward(&noisy_x).unwrap(), &noisy_x, 1e-6));
        assert!(close(&model.energy(&noisy_x), &Tensor::zeros([4], OPTS), 1e-6));
        let jac = model.score_jacobian(&noisy_x).unwrap();
        assert_eq!(jac.size(), vec![4, 2, 2]);
        assert!(close(&jac, &Tensor::zeros([4, 2, 2], OPTS), 1e-6));
        let cov = model.full_cov(&noisy_x).unwrap();
        assert!(close(&cov, &batched_diag(4, 2, 0.25, OPTS), 1e-6));
    }

    #[test]
    fn test_linear_energy_shifts_mean() {
        // no hidden layer: E(x) = w·x + b, so s = -w everywhere
        let cfg = DenoiserConfig { layer_num: 0, ..cfg(0.5) };
        let mut model = DenoisingEbm::new(&cfg).unwrap();
        let w = Tensor::from_slice(&[1f32, -2.]).view((1, 2));
        tch::no_grad(|| {
            let mut vars = model.var_store().variables();
            vars.get_mut("net.out.weight").unwrap().copy_(&w);
        });
        let noisy_x = Tensor::randn([3, 2], OPTS);
        let expected = &noisy_x - &w * 0.25;
        assert!(close(&model.forward(&noisy_x).unwrap(), &expected, 1e-5));

        let iso = model.estimate_isotropic_cov(&Tensor::randn([16, 2], OPTS)).unwrap();
        // 0.25 - 0.0625 * 5 / 2
        assert!((iso - 0.09375).abs() < 1e-6);
    }

    #[test]
    fn test_isotropic_requires_estimation() {
        let model = DenoisingEbm::new(&cfg(0.1)).unwrap();
        let noisy_x = Tensor::randn([2, 2], OPTS);
        assert!(model.iso_cov().is_none());
        assert!(matches!(model.isotropic(), Err(DenoiseError::IsotropicCovNotEstimated)));
        assert!(matches!(
            model.sample_isotropic_cov(&noisy_x),
            Err(DenoiseError::IsotropicCovNotEstimated)
        ));
        assert!(matches!(
            model.logp_x_tx_isotropic_cov(&noisy_x, &noisy_x),
            Err(DenoiseError::IsotropicCovNotEstimated)
        ));
    }

    #[test]
    fn test_isotropic_cov_is_positive() {
        tch::manual_seed(0);
        let mut model = DenoisingEbm::new(&cfg(0.1)).unwrap();
        let dataset = Tensor::randn([512, 2], OPTS);
        let iso = model.estimate_isotropic_cov(&dataset).unwrap();
        assert!(iso > 0. && iso <= 0.01, "iso_cov {iso}");
        assert_eq!(model.iso_cov(), Some(iso));
        assert_eq!(model.isotropic().unwrap().iso_cov(), iso);
    }

    #[test]
    fn test_isotropic_cov_of_constant_energy_is_noise_variance() {
        let mut model = DenoisingEbm::new(&cfg(0.3)).unwrap();
        zero_weights(&model);
        let iso = model.estimate_isotropic_cov(&Tensor::randn([64, 2], OPTS)).unwrap();
        assert!((iso - 0.09).abs() < 1e-7);
    }

    #[test]
    fn test_score_jacobian_matches_finite_differences() {
        tch::manual_seed(1);
        let model = DenoisingEbm::new(&cfg(0.3)).unwrap();
        let noisy_x = Tensor::from_slice(&[0.4f32, -0.7]).view((1, 2));
        let jac = model.score_jacobian(&noisy_x).unwrap();
        let h = 1e-2;
        for j in 0..2 {
            let e = Tensor::zeros([1, 2], OPTS).index_fill(1, &Tensor::from_slice(&[j]), h);
            let plus = model.score(&(&noisy_x + &e)).unwrap().detach();
            let minus = model.score(&(&noisy_x - &e)).unwrap().detach();
            let column = (plus - minus) / (2. * h);
            assert!(close(&jac.select(2, j), &column, 5e-3), "column {j}");
        }
        // Hessian of a smooth energy
        assert!(close(&jac, &jac.transpose(1, 2), 1e-4));
    }

    #[test]
    fn test_full_cov_samples_pass_psd_check() {
        tch::manual_seed(2);
        let model = DenoisingEbm::new(&cfg(1.0)).unwrap();
        for _ in 0..20 {
            let noisy_x = Tensor::randn([2], OPTS) * 2.;
            let cov = model.repaired_full_cov(&noisy_x).unwrap();
            assert!(is_psd(&cov).unwrap());
            let sample = model.sample_full_cov(&noisy_x).unwrap();
            assert_eq!(sample.size(), vec![1, 2]);
            assert!(!crate::utils::has_nan(&sample));
        }
    }

    fn set_var(model: &DenoisingEbm, name: &str, value: &Tensor) {
        tch::no_grad(|| {
            let mut vars = model.var_store().variables();
            vars.get_mut(name).unwrap().copy_(value);
        });
    }

    #[test]
    fn test_linear_energy_full_cov_is_noise_variance() {
        tch::manual_seed(6);
        let cfg = DenoiserConfig { layer_num: 0, ..cfg(0.5) };
        let model = DenoisingEbm::new(&cfg).unwrap();
        let noisy_x = Tensor::randn([3, 2], OPTS);
        let jac = model.score_jacobian(&noisy_x).unwrap();
        assert!(close(&jac, &Tensor::zeros([3, 2, 2], OPTS), 1e-7));
        let cov = model.full_cov(&noisy_x).unwrap();
        assert!(close(&cov, &batched_diag(3, 2, 0.25, OPTS), 1e-7));
        let dist = model.dist_p_x_tx_full_cov(&noisy_x).unwrap();
        assert!(close(dist.covariance(), &cov, 1e-7));
        assert_eq!(model.logp_x_tx_full_cov(&noisy_x, &noisy_x).unwrap().size(), vec![3]);
        let sample = model.sample_full_cov(&Tensor::zeros([2], OPTS)).unwrap();
        assert_eq!(sample.size(), vec![1, 2]);
    }

    #[test]
    fn test_convex_energy_covariance_is_repaired() {
        // E(x) = 12 * (softplus(x_0) + softplus(x_1)), at the origin the
        // Hessian is 3 I so with σ = 1 the covariance is I - 3 I = -2 I
        let cfg = DenoiserConfig {
            layer_num: 1,
            hidden_dim: 2,
            act: crate::net::Activation::Softplus,
            ..cfg(1.0)
        };
        let model = DenoisingEbm::new(&cfg).unwrap();
        set_var(&model, "net.hidden.0.weight", &Tensor::eye(2, OPTS));
        set_var(&model, "net.hidden.0.bias", &Tensor::zeros([2], OPTS));
        set_var(&model, "net.out.weight", &Tensor::from_slice(&[12f32, 12.]).view((1, 2)));
        set_var(&model, "net.out.bias", &Tensor::zeros([1], OPTS));

        let noisy_x = Tensor::zeros([1, 2], OPTS);
        let cov = model.full_cov(&noisy_x).unwrap();
        assert!(close(&cov, &batched_diag(1, 2, -2., OPTS), 1e-4));
        assert!(!is_psd(&cov.squeeze_dim(0)).unwrap());

        let repaired = model.repaired_full_cov(&noisy_x).unwrap();
        assert!(is_psd(&repaired).unwrap());
        let sample = model.sample_full_cov(&noisy_x).unwrap();
        assert!(!crate::utils::has_nan(&sample));

        // the batched path keeps the covariance as is
        assert!(matches!(
            model.logp_x_tx_full_cov(&noisy_x, &noisy_x),
            Err(DenoiseError::Torch(_))
        ));
    }

    #[test]
    fn test_sample_full_cov_rejects_batches() {
        let model = DenoisingEbm::new(&cfg(0.3)).unwrap();
        let noisy_x = Tensor::randn([3, 2], OPTS);
        assert!(matches!(
            model.sample_full_cov(&noisy_x),
            Err(DenoiseError::BatchedInput { batch: 3 })
        ));
        assert!(model.sample_full_cov(&Tensor::randn([1, 2], OPTS)).is_ok());
        assert!(matches!(
            model.sample_full_cov(&Tensor::randn([3], OPTS)),
            Err(DenoiseError::Shape { .. })
        ));
    }

    /// Uniform Monte-Carlo estimate of the integral of `exp(logp)` over a box
    /// centred on `center` with the given half width.
    fn box_integral(
        logp: impl Fn(&Tensor, &Tensor) -> Result<Tensor>,
        noisy_x: &Tensor,
        center: &Tensor,
        half_width: f64,
    ) -> f64 {
        let n = 400_000;
        let u = (Tensor::rand([n, 2], OPTS) * 2. - 1.) * half_width + center.expand([n, 2], false);
        let mut total = 0.;
        // chunked so the batched covariances stay small
        for (xs, tx) in u.split(50_000, 0).iter().zip(noisy_x.expand([n, 2], false).split(50_000, 0)) {
            let lp = logp(xs, &tx).unwrap();
            total += lp.exp().sum(Kind::Float).double_value(&[]);
        }
        total / n as f64 * (2. * half_width).powi(2)
    }

    #[test]
    fn test_isotropic_logp_integrates_to_one() {
        tch::manual_seed(3);
        let mut model = DenoisingEbm::new(&cfg(0.3)).unwrap();
        let iso = model.estimate_isotropic_cov(&Tensor::randn([512, 2], OPTS)).unwrap();
        let noisy_x = Tensor::from_slice(&[0.2f32, 0.1]).view((1, 2));
        let center = model.forward(&noisy_x).unwrap().detach();
        let integral = box_integral(
            |x, tx| model.logp_x_tx_isotropic_cov(x, tx),
            &noisy_x,
            &center,
            8. * iso.sqrt(),
        );
        assert!((integral - 1.).abs() < 0.05, "integral {integral}");
    }

    #[test]
    fn test_full_cov_logp_integrates_to_one() {
        tch::manual_seed(4);
        let model = DenoisingEbm::new(&cfg(0.3)).unwrap();
        let noisy_x = Tensor::from_slice(&[-0.3f32, 0.5]).view((1, 2));
        let dist = model.dist_p_x_tx_full_cov(&noisy_x).unwrap();
        let center = dist.loc().detach();
        let max_var = dist.covariance().diagonal(0, -2, -1).max().double_value(&[]);
        let integral = box_integral(
            |x, tx| model.logp_x_tx_full_cov(x, tx),
            &noisy_x,
            &center,
            8. * max_var.sqrt(),
        );
        assert!((integral - 1.).abs() < 0.05, "integral {integral}");
    }

    #[test]
    fn test_train_step_reduces_loss() {
        tch::manual_seed(5);
        let mut model = DenoisingEbm::new(&cfg(0.3)).unwrap();
        let x = Tensor::randn([256, 2], OPTS) * 0.2 + 1.;
        let first = model.train_step(&x).unwrap();
        let mut last = first;
        for _ in 0..200 {
            last = model.train_step(&x).unwrap();
        }
        assert!(last < first, "loss went from {first} to {last}");
    }
}
