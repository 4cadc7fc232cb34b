use tch::{nn, nn::Module, Tensor};

use super::Activation;

/// Multi-layer perceptron: `layer_num` hidden layers of width `hidden_dim`,
/// each followed by `act`, then a linear read-out.
#[derive(Debug)]
pub struct FeedForwardNet {
    hidden: Vec<nn::Linear>,
    out: nn::Linear,
    act: Activation,
}

impl FeedForwardNet {
    pub fn new(
        vs: nn::Path,
        input_dim: i64,
        output_dim: i64,
        hidden_dim: i64,
        layer_num: i64,
        act: Activation,
    ) -> Self {
        let mut hidden = Vec::with_capacity(layer_num as usize);
        let mut in_dim = input_dim;
        for idx in 0..layer_num {
            hidden.push(nn::linear(&vs / "hidden" / idx, in_dim, hidden_dim, Default::default()));
            in_dim = hidden_dim;
        }
        let out = nn::linear(&vs / "out", in_dim, output_dim, Default::default());
        Self { hidden, out, act }
    }
}

impl Module for FeedForwardNet {
    fn forward(&self, xs: &Tensor) -> Tensor {
        let mut xs = xs.shallow_clone();
        for layer in self.hidden.iter() {
            xs = xs.apply(layer).apply(&self.act);
        }
        xs.apply(&self.out)
    }
}
