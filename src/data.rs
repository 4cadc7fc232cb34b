//! Two dimensional toy distributions.
use std::f64::consts::PI;

use serde::{Deserialize, Serialize};
use tch::{Device, Kind, Tensor};

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, clap::ValueEnum)]
#[serde(rename_all = "kebab-case")]
pub enum ToyDataset {
    /// Eight tight modes on a circle of radius 2.
    EightGaussians,
    TwoMoons,
}

impl ToyDataset {
    pub fn sample(&self, n: i64, device: Device) -> Tensor {
        let opts = (Kind::Float, device);
        match self {
            ToyDataset::EightGaussians => {
                let idx = Tensor::randint(8, [n], (Kind::Int64, device)).to_kind(Kind::Float);
                let theta = idx * (2. * PI / 8.);
                let centers = Tensor::stack(&[theta.cos(), theta.sin()], 1) * 2.;
                centers + Tensor::randn([n, 2], opts) * 0.1
            }
            ToyDataset::TwoMoons => {
                let t = Tensor::rand([n], opts) * PI;
                // 1 for the upper moon, 0 for the lower one
                let upper = Tensor::rand([n], opts).lt(0.5).to_kind(Kind::Float);
                let lower = upper.ones_like() - &upper;
                let x = &upper * t.cos() + &lower * (t.cos() * -1. + 1.);
                let y = &upper * t.sin() + &lower * (t.sin() * -1. + 0.5);
                let moons = Tensor::stack(&[x - 0.5, y - 0.25], 1) * 1.5;
                moons + Tensor::randn([n, 2], opts) * 0.05
            }
        }
    }
}
