use std::time::SystemTime;

use clap::{Parser, ValueEnum};
use tch::{Device, Tensor};

use tweedie_rs::data::ToyDataset;
use tweedie_rs::denoiser::{DenoiserLearnedVar, DenoisingEbm};
use tweedie_rs::gibbs::gibbs_sampler_from_config;
use tweedie_rs::mmd::{mmd_rbf, DEFAULT_BANDWIDTHS};
use tweedie_rs::DenoiserConfig;

#[derive(Debug, Clone, Copy, ValueEnum)]
enum ModelChoice {
    /// Direct regression of mean and std.
    LearnedVar,
    /// Energy model, Tweedie mean only.
    EbmMean,
    /// Energy model with an isotropic covariance.
    EbmIso,
    /// Energy model with the score-Jacobian covariance.
    EbmFull,
}

#[derive(Parser)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// TOML file with the model settings, defaults are used when missing.
    #[arg(long)]
    config: Option<String>,

    #[arg(long, value_enum, default_value = "eight-gaussians")]
    dataset: ToyDataset,

    #[arg(long, value_enum, default_value = "ebm-iso")]
    model: ModelChoice,

    #[arg(long, default_value = "2000")]
    train_steps: usize,

    #[arg(long, default_value = "256")]
    batch_size: i64,

    /// Overrides the number of Gibbs steps of the config.
    #[arg(long)]
    gibbs_steps: Option<usize>,

    #[arg(long, default_value = "9527")]
    seed: i64,

    /// Enable tracing (generates a trace-timestamp.json file).
    #[arg(long)]
    tracing: bool,
}

fn train<F>(steps: usize, mut step: F) -> anyhow::Result<()>
where
    F: FnMut() -> tweedie_rs::Result<f64>,
{
    for idx in 0..steps {
        let loss = step()?;
        if idx % 200 == 0 || idx + 1 == steps {
            println!("step {idx}/{steps} loss {loss:.4}");
        }
    }
    Ok(())
}

fn run(args: Args) -> anyhow::Result<()> {
    let mut cfg = match &args.config {
        Some(path) => DenoiserConfig::from_file(path)?,
        None => DenoiserConfig::default(),
    };
    if let Some(steps) = args.gibbs_steps {
        cfg.gibbs_steps = steps;
    }
    if cfg.x_dim != 2 {
        anyhow::bail!("toy datasets are two dimensional, got x_dim = {}", cfg.x_dim);
    }
    tch::manual_seed(args.seed);
    let device = cfg.device();
    println!("Device: {:?}", device);

    let start = SystemTime::now();
    let x_init = args.dataset.sample(1, device);
    let trajectory: Tensor = match args.model {
        ModelChoice::LearnedVar => {
            let mut model = DenoiserLearnedVar::new(&cfg)?;
            train(args.train_steps, || model.train_step(&args.dataset.sample(args.batch_size, device)))?;
            gibbs_sampler_from_config(&x_init, |x| Ok(model.sample(x)), &cfg)?
        }
        ModelChoice::EbmMean | ModelChoice::EbmIso | ModelChoice::EbmFull => {
            let mut model = DenoisingEbm::new(&cfg)?;
            train(args.train_steps, || model.train_step(&args.dataset.sample(args.batch_size, device)))?;
            match args.model {
                ModelChoice::EbmMean => {
                    gibbs_sampler_from_config(&x_init, |x| Ok(model.forward(x)?.detach()), &cfg)?
                }
                ModelChoice::EbmIso => {
                    let iso_cov = model.estimate_isotropic_cov(&args.dataset.sample(4096, device))?;
                    println!("isotropic covariance: {iso_cov:.6}");
                    let iso = model.isotropic()?;
                    gibbs_sampler_from_config(&x_init, |x| iso.sample(x), &cfg)?
                }
                _ => gibbs_sampler_from_config(&x_init, |x| model.sample_full_cov(x), &cfg)?,
            }
        }
    };
    println!("=== Trained and sampled: {:?}", SystemTime::now().duration_since(start)?);

    let reference = args.dataset.sample(trajectory.size()[0].max(1), Device::Cpu);
    let mmd = mmd_rbf(&reference, &trajectory, &DEFAULT_BANDWIDTHS)?;
    println!("gibbs samples: {}, mmd to data: {mmd:.5}", trajectory.size()[0]);
    Ok(())
}

fn main() -> anyhow::Result<()> {
    use tracing_chrome::ChromeLayerBuilder;
    use tracing_subscriber::prelude::*;

    let args = Args::parse();
    let _guard = if args.tracing {
        let (chrome_layer, guard) = ChromeLayerBuilder::new().build();
        tracing_subscriber::registry().with(chrome_layer).init();
        Some(guard)
    } else {
        tracing_subscriber::fmt::init();
        None
    };
    run(args)
}
