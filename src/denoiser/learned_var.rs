use tch::{nn, nn::Module, nn::OptimizerConfig, Device, Kind, Tensor};

use crate::config::DenoiserConfig;
use crate::distributions::Normal;
use crate::error::Result;
use crate::net::FeedForwardNet;
use crate::utils::check_2d;

/// Direct regression of `p(x | noisy_x)` as an independent Gaussian whose
/// mean and log standard deviation come out of one network.
pub struct DenoiserLearnedVar {
    pub x_dim: i64,
    pub device: Device,
    noise_std: f64,
    vs: nn::VarStore,
    net: FeedForwardNet,
    optimizer: nn::Optimizer,
}

impl DenoiserLearnedVar {
    pub fn new(cfg: &DenoiserConfig) -> Result<Self> {
        let device = cfg.device();
        let vs = nn::VarStore::new(device);
        let net = FeedForwardNet::new(
            vs.root() / "net",
            cfg.x_dim,
            cfg.x_dim * 2,
            cfg.hidden_dim,
            cfg.layer_num,
            cfg.act,
        );
        let optimizer = nn::Adam::default().build(&vs, cfg.lr)?;
        Ok(Self { x_dim: cfg.x_dim, device, noise_std: cfg.noise_std, vs, net, optimizer })
    }

    pub fn var_store(&self) -> &nn::VarStore {
        &self.vs
    }

    /// Returns `(mu, sigma)`, both shaped like `noisy_x`.
    pub fn forward(&self, noisy_x: &Tensor) -> (Tensor, Tensor) {
        let out = self.net.forward(noisy_x).chunk(2, -1);
        let mu = out[0].shallow_clone();
        let sigma = out[1].exp();
        (mu, sigma)
    }

    pub fn dist(&self, noisy_x: &Tensor) -> Normal {
        let (mu, sigma) = self.forward(&noisy_x.to_device(self.device));
        Normal::new(mu, sigma)
    }

    /// `log p(x | noisy_x)` summed over dimensions, one value per row.
    pub fn logp_x_tx(&self, x: &Tensor, noisy_x: &Tensor) -> Result<Tensor> {
        check_2d("x", x, self.x_dim)?;
        check_2d("noisy_x", noisy_x, self.x_dim)?;
        let x = x.to_device(self.device);
        Ok(self.dist(noisy_x).log_prob(&x).sum_dim_intlist(-1, false, Kind::Float))
    }

    pub fn sample(&self, noisy_x: &Tensor) -> Tensor {
        tch::no_grad(|| self.dist(noisy_x).sample())
    }

    /// One maximum-likelihood step on a batch of clean points, returns the
    /// mean negative log-likelihood before the update.
    pub fn train_step(&mut self, x: &Tensor) -> Result<f64> {
        let x = x.to_device(self.device);
        let noisy_x = &x + Tensor::randn_like(&x) * self.noise_std;
        let loss = -self.logp_x_tx(&x, &noisy_x)?.mean(Kind::Float);
        self.optimizer.backward_step(&loss);
        Ok(loss.double_value(&[]))
    }
}
