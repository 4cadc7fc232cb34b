use serde::{Deserialize, Serialize};
use tch::{nn::Module, Tensor};

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum Activation {
    Relu,
    /// x * sigmoid(x), a.k.a. SiLU.
    Swish,
    Tanh,
    Softplus,
    Elu,
    Gelu,
}

impl Module for Activation {
    fn forward(&self, xs: &Tensor) -> Tensor {
        match self {
            Activation::Relu => xs.relu(),
            Activation::Swish => xs * xs.sigmoid(),
            Activation::Tanh => xs.tanh(),
            Activation::Softplus => xs.softplus(),
            Activation::Elu => xs.elu(),
            Activation::Gelu => xs.gelu("none"),
        }
    }
}
