//! `train` binary: runs one adaptation paradigm on the synthetic
//! multi-domain dataset, checkpoints the step and evaluates the target.
//!
//! # Usage
//!
//! ```bash
//! cargo run --bin train -- --paradigm dann --iterations 200
//! cargo run --bin train -- --config step.json --cuda
//! cargo run --bin train -- --freeze-backbone --finetune-iterations 100 --finetune-lr 1e-4
//! ```
//!
//! With `--finetune-iterations` the run has two stages: the first trains
//! with the configured freezing, the second restores its checkpoint into a
//! step with the backbone unfrozen and continues at the fine-tuning rate.

use clap::Parser;
use std::path::PathBuf;
use tracing::{error, info};

use msda_train::augment::SelfEnsemblingPreprocessor;
use msda_train::batch::TrainBatch;
use msda_train::checkpoint::{restore_test_step, restore_train_step, save_train_step};
use msda_train::config::{Paradigm, StepConfig};
use msda_train::dataset::{BalancedLoader, SyntheticConfig, SyntheticDomainDataset, TestLoader};
use msda_train::metrics::summary;
use msda_train::model::{ConvBackboneFactory, DenseTopFactory};
use msda_train::steps::{build_test_step, build_train_step, TrainStep};
use msda_train::{TrainError, TrainResult};

/// Hidden width of every dense head built by the runner.
const TOP_HIDDEN: i64 = 256;

/// Command-line arguments for the training binary.
#[derive(Parser, Debug)]
#[command(
    name = "train",
    version,
    about = "Multi-source domain-adaptation training steps",
    long_about = None
)]
struct Args {
    /// Path to a JSON step configuration.
    ///
    /// If not provided, the default `StepConfig` is used.
    #[arg(short, long, value_name = "FILE")]
    config: Option<PathBuf>,

    /// Override the paradigm (source, dann, m3sda, self_ensembling,
    /// domain_classifier).
    #[arg(long)]
    paradigm: Option<Paradigm>,

    /// Override the number of training iterations.
    #[arg(long)]
    iterations: Option<usize>,

    /// Override how often metrics are logged and reset.
    #[arg(long)]
    log_every: Option<usize>,

    /// Train the first stage with the backbone frozen.
    #[arg(long, default_value_t = false)]
    freeze_backbone: bool,

    /// Override the fine-tuning stage length (0 disables the stage).
    #[arg(long)]
    finetune_iterations: Option<usize>,

    /// Override the fine-tuning stage learning rate.
    #[arg(long, value_name = "LR")]
    finetune_lr: Option<f64>,

    /// Synthetic samples generated per domain.
    #[arg(long, default_value_t = 64)]
    samples_per_domain: usize,

    /// Directory receiving the checkpoint and the effective config.
    #[arg(long, value_name = "DIR", default_value = "checkpoints")]
    checkpoint_dir: PathBuf,

    /// Enable CUDA (overrides config `use_gpu`).
    #[arg(long, default_value_t = false)]
    cuda: bool,

    /// Log level (trace, debug, info, warn, error).
    #[arg(long, default_value = "info")]
    log_level: String,
}

fn main() {
    let args = Args::parse();

    // Initialise tracing subscriber.
    let log_level_filter = args
        .log_level
        .parse::<tracing_subscriber::filter::LevelFilter>()
        .unwrap_or(tracing_subscriber::filter::LevelFilter::INFO);

    tracing_subscriber::fmt()
        .with_max_level(log_level_filter)
        .with_target(false)
        .with_thread_ids(false)
        .init();

    info!("msda-train v{}", msda_train::VERSION);

    if let Err(e) = run(args) {
        error!("Run failed: {e}");
        std::process::exit(1);
    }
}

fn load_config(args: &Args) -> TrainResult<StepConfig> {
    let mut config = match args.config.as_deref() {
        Some(path) => {
            info!("Loading configuration from {}", path.display());
            StepConfig::from_json(path)?
        }
        None => {
            info!("No configuration file provided, using defaults");
            StepConfig::default()
        }
    };

    // Apply CLI overrides.
    if let Some(paradigm) = args.paradigm {
        config.paradigm = paradigm;
    }
    if let Some(n) = args.iterations {
        config.num_iterations = n;
    }
    if let Some(n) = args.log_every {
        config.log_every = n;
    }
    if args.freeze_backbone {
        config.freeze_backbone = true;
    }
    if let Some(n) = args.finetune_iterations {
        config.finetune_iterations = n;
    }
    if let Some(lr) = args.finetune_lr {
        config.finetune_learning_rate = lr;
    }
    if args.cuda {
        config.use_gpu = true;
    }
    config.validate()?;
    Ok(config)
}

fn run(args: Args) -> TrainResult<()> {
    let config = load_config(&args)?;
    let device = config.device();
    tch::manual_seed(config.seed as i64);

    info!("Configuration validated successfully");
    info!("  paradigm     : {}", config.paradigm);
    info!("  domains      : {} (target: {})", config.domains.join(", "), config.domains[config.n_sources()]);
    info!("  backbone     : {}", config.backbone);
    info!("  batch size   : {}", config.batch_size);
    info!("  learning rate: {}", config.learning_rate);
    info!("  iterations   : {}", config.num_iterations);
    info!("  frozen       : {}", config.freeze_backbone);
    if config.finetune_iterations > 0 {
        info!(
            "  fine-tuning  : {} iterations at lr {}",
            config.finetune_iterations, config.finetune_learning_rate
        );
    }
    info!("  device       : {:?}", device);

    let dataset = SyntheticDomainDataset::new(
        config.domains.clone(),
        SyntheticConfig {
            num_classes: config.num_classes,
            image_size: config.image_size,
            channels: config.image_channels,
            samples_per_domain: args.samples_per_domain,
            seed: config.seed,
            ..SyntheticConfig::default()
        },
    )?;

    let feature_dim = ConvBackboneFactory::feature_dim(&config.backbone)
        .ok_or_else(|| TrainError::UnknownBackbone(config.backbone.clone()))?;
    let backbones = ConvBackboneFactory::new(config.image_channels as i64, device);
    let tops = DenseTopFactory::new(feature_dim, TOP_HIDDEN, device);

    let mut step = build_train_step(&config, &backbones, &tops)?;
    let mut loader = BalancedLoader::new(&dataset, config.batch_size, config.seed, device)?;
    let preprocessor = (config.paradigm == Paradigm::SelfEnsembling)
        .then(SelfEnsemblingPreprocessor::default);
    let mut next_batch = || -> TrainResult<TrainBatch> {
        let mut batch = loader.next_batch()?;
        if let Some(pre) = &preprocessor {
            pre.apply(&mut batch)?;
        }
        Ok(batch)
    };

    train_stage(step.as_mut(), &config, &mut next_batch)?;
    save_train_step(step.as_ref(), &args.checkpoint_dir)?;
    config.to_json(&args.checkpoint_dir.join("config.json"))?;

    if config.finetune_iterations > 0 {
        let stage = config.finetune_stage();
        info!("Fine-tuning from iteration {} with the backbone unfrozen", step.iteration());
        let mut tuned = build_train_step(&stage, &backbones, &tops)?;
        restore_train_step(tuned.as_mut(), &args.checkpoint_dir)?;
        train_stage(tuned.as_mut(), &stage, &mut next_batch)?;
        save_train_step(tuned.as_ref(), &args.checkpoint_dir)?;
    }

    let mut test = build_test_step(&config, &backbones, &tops)?;
    restore_test_step(test.as_mut(), &args.checkpoint_dir)?;
    let target_index = config.n_sources();
    let mut test_loader = TestLoader::new(&dataset, &config.domains[target_index], config.batch_size, device)?;
    if config.paradigm == Paradigm::DomainClassifier {
        test_loader = test_loader.with_domain_label(target_index);
    }
    for batch in test_loader.iter() {
        test.test(&batch?)?;
    }
    info!("Target evaluation: {}", summary(&test.metrics()));
    Ok(())
}

/// Run `config.num_iterations` train calls, logging and resetting metrics
/// every `config.log_every` iterations.
fn train_stage(
    step: &mut dyn TrainStep,
    config: &StepConfig,
    next_batch: &mut dyn FnMut() -> TrainResult<TrainBatch>,
) -> TrainResult<()> {
    for _ in 0..config.num_iterations {
        step.train(&next_batch()?)?;
        if step.iteration() as usize % config.log_every == 0 {
            info!("[{:>5}] {}", step.iteration(), summary(&step.metrics()));
            step.reset_metrics();
        }
    }
    Ok(())
}
