use std::{
    fs,
    path::{Path, PathBuf},
};

use candle_core::Device;
use serde::{Deserialize, Serialize};

use crate::{distributed::Sharding, precision::Precision, TrainingError};

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TrainingConfig {
    #[serde(default)]
    pub data: DataConfig,
    #[serde(default)]
    pub optimizer: OptimizerConfig,
    #[serde(default)]
    pub scheduler: SchedulerConfig,
    #[serde(default)]
    pub runtime: RuntimeConfig,
    #[serde(default)]
    pub distributed: DistributedConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
    #[serde(default)]
    pub checkpoint: CheckpointConfig,
    #[serde(default)]
    pub model: ModelConfig,
}

impl TrainingConfig {
    /// Reads a TOML or JSON file; relative paths inside it resolve against
    /// the file's directory. The result is not validated.
    pub fn from_path(path: impl AsRef<Path>) -> Result<Self, TrainingError> {
        let path = path.as_ref();
        let contents = fs::read_to_string(path)?;
        let mut config: TrainingConfig = match path.extension().and_then(|ext| ext.to_str()) {
            Some("json") => serde_json::from_str(&contents)?,
            Some("toml") | Some("tml") | None => toml::from_str(&contents)?,
            Some(other) => {
                return Err(TrainingError::ConfigFormat(format!(
                    "unsupported configuration extension '{}'",
                    other
                )));
            }
        };

        let base_dir = path.parent().unwrap_or_else(|| Path::new("."));
        config.apply_base_path(base_dir);
        Ok(config)
    }

    pub fn load(path: impl AsRef<Path>) -> Result<Self, TrainingError> {
        let config = Self::from_path(path)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), TrainingError> {
        let mut errors = Vec::new();

        let data = &self.data;
        if data.train_shards.is_empty() {
            errors.push("data.train_shards must not be empty".to_string());
        }
        if data.batch_size == 0 {
            errors.push("data.batch_size must be greater than 0".to_string());
        }
        if data.seq_len < 2 {
            errors.push("data.seq_len must be at least 2".to_string());
        }
        if data.vocab_size == 0 {
            errors.push("data.vocab_size must be greater than 0".to_string());
        }
        if data.train_num_samples == Some(0) {
            errors.push("data.train_num_samples must be greater than 0 when set".to_string());
        }

        let optimizer = &self.optimizer;
        if !(optimizer.learning_rate > 0.0) {
            errors.push("optimizer.learning_rate must be greater than 0".to_string());
        }
        if !(0.0..1.0).contains(&optimizer.beta1) {
            errors.push("optimizer.beta1 must be in [0, 1)".to_string());
        }
        if !(0.0..1.0).contains(&optimizer.beta2) {
            errors.push("optimizer.beta2 must be in [0, 1)".to_string());
        }
        if !(optimizer.epsilon > 0.0) {
            errors.push("optimizer.epsilon must be greater than 0".to_string());
        }
        if optimizer.weight_decay < 0.0 {
            errors.push("optimizer.weight_decay must be non-negative".to_string());
        }
        if let Some(norm) = optimizer.grad_clip_norm {
            if !(norm > 0.0) || !norm.is_finite() {
                errors.push("optimizer.grad_clip_norm must be a positive number".to_string());
            }
        }

        let scheduler = &self.scheduler;
        if scheduler.force_min_lr < 0.0 || scheduler.force_min_lr > optimizer.learning_rate {
            errors.push("scheduler.force_min_lr must be in [0, learning_rate]".to_string());
        }
        if scheduler.strategy == ScheduleStrategy::ConstCooldown {
            match scheduler.epochs_cooldown {
                None => errors.push(
                    "scheduler.epochs_cooldown is required by the const_cooldown strategy"
                        .to_string(),
                ),
                Some(cooldown) if cooldown > self.runtime.epochs => errors.push(format!(
                    "scheduler.epochs_cooldown ({}) exceeds runtime.epochs ({})",
                    cooldown, self.runtime.epochs
                )),
                Some(_) => {}
            }
        }
        if scheduler.cooldown_end_lr < 0.0 {
            errors.push("scheduler.cooldown_end_lr must be non-negative".to_string());
        }
        if !(scheduler.cooldown_power > 0.0) {
            errors.push("scheduler.cooldown_power must be greater than 0".to_string());
        }

        let runtime = &self.runtime;
        if runtime.epochs == 0 {
            errors.push("runtime.epochs must be greater than 0".to_string());
        }
        if runtime.accum_freq == 0 {
            errors.push("runtime.accum_freq must be greater than 0".to_string());
        } else if data.batch_size % runtime.accum_freq != 0 {
            errors.push(format!(
                "data.batch_size ({}) must be divisible by runtime.accum_freq ({})",
                data.batch_size, runtime.accum_freq
            ));
        }
        if runtime.log_every_n_steps == 0 {
            errors.push("runtime.log_every_n_steps must be greater than 0".to_string());
        }
        if runtime.val_frequency == 0 {
            errors.push("runtime.val_frequency must be greater than 0".to_string());
        }
        if !(runtime.z_loss_coefficient >= 0.0) {
            errors.push("runtime.z_loss_coefficient must be non-negative".to_string());
        }
        match DeviceSpec::parse(&runtime.device) {
            Ok(DeviceSpec::Cpu) if runtime.precision.uses_bf16() => errors.push(format!(
                "runtime.precision '{}' is not supported on the cpu device",
                runtime.precision
            )),
            Ok(_) => {}
            Err(err) => errors.push(err.to_string()),
        }

        let distributed = &self.distributed;
        if distributed.world_size == 0 {
            errors.push("distributed.world_size must be greater than 0".to_string());
        } else if distributed.rank >= distributed.world_size {
            errors.push(format!(
                "distributed.rank ({}) must be below world_size ({})",
                distributed.rank, distributed.world_size
            ));
        }

        if self.logging.name.trim().is_empty() {
            errors.push("logging.name must not be empty".to_string());
        }
        if self.checkpoint.save_frequency == 0 {
            errors.push("checkpoint.save_frequency must be greater than 0".to_string());
        }
        if self.model.hidden_size == 0 {
            errors.push("model.hidden_size must be greater than 0".to_string());
        }

        if errors.is_empty() {
            Ok(())
        } else {
            Err(TrainingError::validation(errors))
        }
    }

    pub fn apply_base_path(&mut self, base: &Path) {
        for shard in self
            .data
            .train_shards
            .iter_mut()
            .chain(self.data.val_shards.iter_mut())
        {
            absolutize_in_place(shard, base);
        }
        absolutize_in_place(&mut self.logging.directory, base);
    }

    pub fn checkpoint_dir(&self) -> PathBuf {
        self.logging.run_dir().join("checkpoints")
    }

    pub fn sharding(&self) -> Sharding {
        if self.distributed.sharded {
            Sharding::Sharded
        } else {
            Sharding::Replicated
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DataConfig {
    #[serde(default)]
    pub train_shards: Vec<PathBuf>,
    #[serde(default)]
    pub val_shards: Vec<PathBuf>,
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,
    #[serde(default = "default_seq_len")]
    pub seq_len: usize,
    #[serde(default = "default_vocab_size")]
    pub vocab_size: usize,
    /// Samples per epoch reported in progress and token accounting; falls
    /// back to what the training data reports.
    #[serde(default)]
    pub train_num_samples: Option<usize>,
    #[serde(default = "default_true")]
    pub shuffle: bool,
}

impl Default for DataConfig {
    fn default() -> Self {
        Self {
            train_shards: Vec::new(),
            val_shards: Vec::new(),
            batch_size: default_batch_size(),
            seq_len: default_seq_len(),
            vocab_size: default_vocab_size(),
            train_num_samples: None,
            shuffle: true,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OptimizerConfig {
    #[serde(default = "default_learning_rate")]
    pub learning_rate: f64,
    #[serde(default = "default_beta1")]
    pub beta1: f64,
    #[serde(default = "default_beta2")]
    pub beta2: f64,
    #[serde(default = "default_adam_eps")]
    pub epsilon: f64,
    #[serde(default = "default_weight_decay")]
    pub weight_decay: f64,
    #[serde(default)]
    pub grad_clip_norm: Option<f64>,
}

impl Default for OptimizerConfig {
    fn default() -> Self {
        Self {
            learning_rate: default_learning_rate(),
            beta1: default_beta1(),
            beta2: default_beta2(),
            epsilon: default_adam_eps(),
            weight_decay: default_weight_decay(),
            grad_clip_norm: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SchedulerConfig {
    #[serde(default)]
    pub strategy: ScheduleStrategy,
    #[serde(default = "default_warmup_steps")]
    pub warmup_steps: usize,
    #[serde(default)]
    pub skip_scheduler: bool,
    #[serde(default)]
    pub epochs_cooldown: Option<usize>,
    #[serde(default)]
    pub cooldown_end_lr: f64,
    #[serde(default = "default_cooldown_power")]
    pub cooldown_power: f64,
    #[serde(default)]
    pub force_min_lr: f64,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            strategy: ScheduleStrategy::default(),
            warmup_steps: default_warmup_steps(),
            skip_scheduler: false,
            epochs_cooldown: None,
            cooldown_end_lr: 0.0,
            cooldown_power: default_cooldown_power(),
            force_min_lr: 0.0,
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum ScheduleStrategy {
    #[default]
    Cosine,
    Const,
    #[serde(alias = "const-cooldown")]
    ConstCooldown,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RuntimeConfig {
    #[serde(default = "default_epochs")]
    pub epochs: usize,
    #[serde(default)]
    pub precision: Precision,
    #[serde(default = "default_one")]
    pub accum_freq: usize,
    #[serde(default)]
    pub seed: u64,
    #[serde(default = "default_device")]
    pub device: String,
    #[serde(default = "default_log_every_n_steps")]
    pub log_every_n_steps: usize,
    #[serde(default = "default_one")]
    pub val_frequency: usize,
    #[serde(default)]
    pub log_logit_mean: bool,
    #[serde(default)]
    pub z_loss_coefficient: f64,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            epochs: default_epochs(),
            precision: Precision::default(),
            accum_freq: 1,
            seed: 0,
            device: default_device(),
            log_every_n_steps: default_log_every_n_steps(),
            val_frequency: 1,
            log_logit_mean: false,
            z_loss_coefficient: 0.0,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DistributedConfig {
    #[serde(default = "default_one")]
    pub world_size: usize,
    #[serde(default)]
    pub rank: usize,
    #[serde(default)]
    pub local_rank: usize,
    #[serde(default)]
    pub sharded: bool,
}

impl Default for DistributedConfig {
    fn default() -> Self {
        Self {
            world_size: 1,
            rank: 0,
            local_rank: 0,
            sharded: false,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    #[serde(default = "default_log_dir")]
    pub directory: PathBuf,
    #[serde(default = "default_run_name")]
    pub name: String,
    #[serde(default)]
    pub tensorboard: bool,
    #[serde(default)]
    pub wandb: bool,
    /// Emit from local rank 0 of every node instead of only global rank 0.
    #[serde(default)]
    pub log_local: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            directory: default_log_dir(),
            name: default_run_name(),
            tensorboard: false,
            wandb: false,
            log_local: false,
        }
    }
}

impl LoggingConfig {
    pub fn run_dir(&self) -> PathBuf {
        self.directory.join(&self.name)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CheckpointConfig {
    #[serde(default = "default_one")]
    pub save_frequency: usize,
    #[serde(default)]
    pub save_most_recent: bool,
    #[serde(default)]
    pub delete_previous_checkpoint: bool,
    /// `latest`, or a path to a checkpoint directory.
    #[serde(default)]
    pub resume: Option<String>,
}

impl Default for CheckpointConfig {
    fn default() -> Self {
        Self {
            save_frequency: 1,
            save_most_recent: false,
            delete_previous_checkpoint: false,
            resume: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelConfig {
    #[serde(default = "default_hidden_size")]
    pub hidden_size: usize,
}

impl Default for ModelConfig {
    fn default() -> Self {
        Self {
            hidden_size: default_hidden_size(),
        }
    }
}

/// Parsed form of `runtime.device`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeviceSpec {
    Cpu,
    /// CUDA device; `None` selects the worker's local rank.
    Cuda(Option<usize>),
    Metal,
}

impl DeviceSpec {
    pub fn parse(raw: &str) -> Result<Self, TrainingError> {
        let lowered = raw.trim().to_ascii_lowercase();
        match lowered.as_str() {
            "cpu" => Ok(DeviceSpec::Cpu),
            "cuda" | "gpu" => Ok(DeviceSpec::Cuda(None)),
            "metal" | "mps" => Ok(DeviceSpec::Metal),
            other => match other.strip_prefix("cuda:") {
                Some(index) => index
                    .parse::<usize>()
                    .map(|index| DeviceSpec::Cuda(Some(index)))
                    .map_err(|_| {
                        TrainingError::configuration(format!("invalid cuda device '{}'", raw))
                    }),
                None => Err(TrainingError::configuration(format!(
                    "unrecognized device '{}' (expected cpu, cuda, cuda:N or metal)",
                    raw
                ))),
            },
        }
    }

    pub fn open(self, local_rank: usize) -> Result<Device, TrainingError> {
        match self {
            DeviceSpec::Cpu => Ok(Device::Cpu),
            DeviceSpec::Cuda(index) => Device::new_cuda(index.unwrap_or(local_rank)).map_err(|err| {
                TrainingError::configuration(format!("cuda device unavailable: {err}"))
            }),
            DeviceSpec::Metal => Device::new_metal(local_rank).map_err(|err| {
                TrainingError::configuration(format!("metal device unavailable: {err}"))
            }),
        }
    }
}

fn absolutize_in_place(path: &mut PathBuf, base: &Path) {
    if path.is_relative() {
        *path = base.join(&*path);
    }
}

fn default_batch_size() -> usize {
    64
}

fn default_seq_len() -> usize {
    2048
}

fn default_vocab_size() -> usize {
    50_432
}

fn default_true() -> bool {
    true
}

fn default_one() -> usize {
    1
}

fn default_learning_rate() -> f64 {
    5e-4
}

fn default_beta1() -> f64 {
    0.9
}

fn default_beta2() -> f64 {
    0.999
}

fn default_adam_eps() -> f64 {
    1e-8
}

fn default_weight_decay() -> f64 {
    0.2
}

fn default_warmup_steps() -> usize {
    10_000
}

fn default_cooldown_power() -> f64 {
    1.0
}

fn default_epochs() -> usize {
    32
}

fn default_device() -> String {
    "cpu".to_string()
}

fn default_log_every_n_steps() -> usize {
    100
}

fn default_log_dir() -> PathBuf {
    PathBuf::from("./logs")
}

fn default_run_name() -> String {
    "pretrain".to_string()
}

fn default_hidden_size() -> usize {
    64
}
