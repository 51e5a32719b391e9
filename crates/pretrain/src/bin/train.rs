use std::{path::PathBuf, str::FromStr, sync::Arc, thread};

use anyhow::{anyhow, Context};
use clap::Parser;
use pretrain::{
    config::DeviceSpec,
    data::ShardOptions,
    distributed::{Collective, DistributedModel, LocalGroup},
    BigramConfig, BigramLm, ModelHandle, TokenShardLoader, TrainData, Trainer, TrainingConfig,
    TrainingError,
};
use serde_json::{Number, Value};
use tracing::{error, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

fn main() {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "pretrain=info,info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    if let Err(err) = run() {
        error!("training failed: {:#}", err);
        std::process::exit(1);
    }
}

#[derive(Parser, Debug)]
#[command(author, version, about = "Language-model pretraining CLI", long_about = None)]
struct Args {
    #[arg(
        short,
        long,
        value_name = "PATH",
        help = "Path to training config file (TOML or JSON)"
    )]
    config: PathBuf,

    #[arg(
        long = "override",
        value_name = "KEY=VALUE",
        help = "Override configuration value using dot-separated paths"
    )]
    overrides: Vec<OverrideArg>,

    #[arg(long, help = "Resume from the latest checkpoint if available")]
    resume: bool,

    #[arg(
        long,
        value_name = "N",
        help = "Number of in-process workers; overrides distributed.world_size"
    )]
    world_size: Option<usize>,
}

#[derive(Debug, Clone)]
struct OverrideArg {
    path: String,
    value: String,
}

impl FromStr for OverrideArg {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (path, value) = s
            .split_once('=')
            .ok_or_else(|| "override must be in the form key=value".to_string())?;
        if path.trim().is_empty() {
            return Err("override key must not be empty".into());
        }
        Ok(Self {
            path: path.trim().to_string(),
            value: value.trim().to_string(),
        })
    }
}

fn run() -> anyhow::Result<()> {
    let args = Args::parse();

    let mut config = TrainingConfig::from_path(&args.config)
        .with_context(|| format!("loading {}", args.config.display()))?;
    if !args.overrides.is_empty() {
        config = apply_overrides(config, &args.overrides)?;
    }
    if let Some(world_size) = args.world_size {
        config.distributed.world_size = world_size;
    }
    if args.resume && config.checkpoint.resume.is_none() {
        config.checkpoint.resume = Some("latest".to_string());
    }
    config.validate()?;

    let world_size = config.distributed.world_size.max(1);
    info!(
        world_size,
        precision = %config.runtime.precision,
        run_dir = %config.logging.run_dir().display(),
        "starting pretraining"
    );

    if world_size == 1 {
        return run_worker(config, None).map_err(Into::into);
    }

    let workers = LocalGroup::new(world_size)?
        .into_iter()
        .map(|collective| {
            let mut config = config.clone();
            config.distributed.rank = collective.rank();
            config.distributed.local_rank = collective.rank();
            let collective: Arc<dyn Collective> = Arc::new(collective);
            thread::Builder::new()
                .name(format!("rank-{}", config.distributed.rank))
                .spawn(move || {
                    let guard = AbortOnDrop(Some(Arc::clone(&collective)));
                    let result = run_worker(config, Some(collective));
                    if result.is_ok() {
                        guard.disarm();
                    }
                    result
                })
                .context("spawning worker thread")
        })
        .collect::<anyhow::Result<Vec<_>>>()?;

    // Peers released by an abort report a collective error; prefer the
    // worker that failed first.
    let mut failure: Option<(bool, anyhow::Error)> = None;
    for (rank, handle) in workers.into_iter().enumerate() {
        let (released, err) = match handle.join() {
            Ok(Ok(())) => continue,
            Ok(Err(err)) => {
                error!(rank, "worker failed: {}", err);
                let released = matches!(err, TrainingError::Collective(_));
                (released, anyhow!("rank {} failed: {}", rank, err))
            }
            Err(_) => (false, anyhow!("rank {} panicked", rank)),
        };
        if failure.as_ref().map_or(true, |(previous, _)| *previous && !released) {
            failure = Some((released, err));
        }
    }
    match failure {
        Some((_, err)) => Err(err),
        None => Ok(()),
    }
}

/// Aborts the worker's group when dropped armed, which covers both error
/// returns and panics.
struct AbortOnDrop(Option<Arc<dyn Collective>>);

impl AbortOnDrop {
    fn disarm(mut self) {
        self.0 = None;
    }
}

impl Drop for AbortOnDrop {
    fn drop(&mut self) {
        if let Some(collective) = self.0.take() {
            collective.abort();
        }
    }
}

fn run_worker(
    config: TrainingConfig,
    collective: Option<Arc<dyn Collective>>,
) -> Result<(), TrainingError> {
    let rank = config.distributed.rank;
    let world_size = config.distributed.world_size.max(1);
    let device = DeviceSpec::parse(&config.runtime.device)?.open(config.distributed.local_rank)?;

    let shard_options = |shuffle: bool| ShardOptions {
        batch_size: config.data.batch_size,
        seq_len: config.data.seq_len,
        rank,
        world_size,
        seed: config.runtime.seed,
        shuffle,
    };
    let mut train = TokenShardLoader::open(&config.data.train_shards, &shard_options(config.data.shuffle))?;
    let mut validation = if config.data.val_shards.is_empty() {
        None
    } else {
        Some(TokenShardLoader::open(&config.data.val_shards, &shard_options(false))?)
    };

    let model = BigramLm::new(
        &BigramConfig {
            vocab_size: config.data.vocab_size,
            hidden_size: config.model.hidden_size,
            precision: config.runtime.precision,
            seed: config.runtime.seed,
        },
        &device,
    )?;
    let model = match collective {
        Some(collective) => {
            ModelHandle::Wrapped(DistributedModel::new(model, collective, config.sharding()))
        }
        None => ModelHandle::Plain(model),
    };

    let mut trainer = Trainer::new(config, model, &train)?;
    let summary = trainer.fit(
        &mut train,
        validation.as_mut().map(|data| data as &mut dyn TrainData),
    )?;

    if trainer.is_coordinator() {
        let final_loss = summary.epochs.last().map_or(f64::NAN, |epoch| epoch.average_loss);
        let final_perplexity = summary
            .evaluations
            .last()
            .map(|evaluation| evaluation.perplexity);
        info!(
            epochs = summary.epochs.len(),
            checkpoints = summary.checkpoints.len(),
            final_loss,
            final_perplexity = ?final_perplexity,
            "training finished"
        );
    }
    Ok(())
}

fn apply_overrides(
    config: TrainingConfig,
    overrides: &[OverrideArg],
) -> Result<TrainingConfig, TrainingError> {
    let mut value = serde_json::to_value(config).map_err(|err| {
        TrainingError::runtime(format!("failed to serialize config for overrides: {err}"))
    })?;

    for override_arg in overrides {
        let new_value = parse_override_value(&override_arg.value);
        let segments = parse_path(&override_arg.path)?;
        assign_at_path(&mut value, &segments, new_value)?;
    }

    serde_json::from_value(value).map_err(|err| {
        TrainingError::configuration(format!(
            "config is invalid after overrides: {err}"
        ))
    })
}

fn parse_override_value(raw: &str) -> Value {
    let trimmed = raw.trim();
    if trimmed.eq_ignore_ascii_case("true") {
        return Value::Bool(true);
    }
    if trimmed.eq_ignore_ascii_case("false") {
        return Value::Bool(false);
    }
    if trimmed.eq_ignore_ascii_case("null") {
        return Value::Null;
    }
    if let Ok(int_val) = trimmed.parse::<i64>() {
        return Value::Number(Number::from(int_val));
    }
    if let Ok(float_val) = trimmed.parse::<f64>() {
        if let Some(number) = Number::from_f64(float_val) {
            return Value::Number(number);
        }
    }
    if trimmed.starts_with('[') || trimmed.starts_with('{') {
        if let Ok(json_val) = serde_json::from_str::<Value>(trimmed) {
            return json_val;
        }
    }
    Value::String(trimmed.to_string())
}

#[derive(Debug)]
struct PathSegment {
    key: String,
    index: Option<usize>,
}

fn parse_path(path: &str) -> Result<Vec<PathSegment>, TrainingError> {
    let segments = path
        .split('.')
        .map(|segment| match segment.split_once('[') {
            Some((base, idx_part)) => {
                let index = idx_part.trim_end_matches(']').parse::<usize>().map_err(|err| {
                    TrainingError::configuration(format!(
                        "invalid index in override path '{}': {}",
                        segment, err
                    ))
                })?;
                Ok(PathSegment {
                    key: base.to_string(),
                    index: Some(index),
                })
            }
            None => Ok(PathSegment {
                key: segment.to_string(),
                index: None,
            }),
        })
        .collect::<Result<Vec<_>, TrainingError>>()?;
    if segments.iter().any(|segment| segment.key.is_empty()) {
        return Err(TrainingError::configuration(format!(
            "override path '{}' has an empty segment",
            path
        )));
    }
    Ok(segments)
}

fn assign_at_path(
    target: &mut Value,
    segments: &[PathSegment],
    new_value: Value,
) -> Result<(), TrainingError> {
    let Some((segment, rest)) = segments.split_first() else {
        *target = new_value;
        return Ok(());
    };

    if target.is_null() {
        *target = Value::Object(serde_json::Map::new());
    }
    let map = target.as_object_mut().ok_or_else(|| {
        TrainingError::configuration(format!(
            "override path segment '{}' points into a non-object value",
            segment.key
        ))
    })?;
    let entry = map.entry(segment.key.clone()).or_insert(Value::Null);

    let slot = match segment.index {
        Some(array_index) => {
            if entry.is_null() {
                *entry = Value::Array(Vec::new());
            }
            let array = entry.as_array_mut().ok_or_else(|| {
                TrainingError::configuration(format!(
                    "override path segment '{}' expects an array value",
                    segment.key
                ))
            })?;
            if array.len() <= array_index {
                array.resize(array_index + 1, Value::Null);
            }
            &mut array[array_index]
        }
        None => entry,
    };
    assign_at_path(slot, rest, new_value)
}
