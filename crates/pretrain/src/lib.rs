pub mod checkpoint;
pub mod config;
pub mod data;
pub mod distributed;
pub mod error;
pub mod logging;
pub mod loss;
pub mod metrics;
pub mod model;
pub mod optimizer;
pub mod precision;
pub mod scheduler;
pub mod step;
pub mod trainer;

pub use config::TrainingConfig;
pub use data::{InMemoryData, TokenBatch, TokenShardLoader, TrainData};
pub use distributed::{Collective, DistributedModel, LocalGroup, Sharding, SingleProcess};
pub use error::{Result, TrainingError};
pub use loss::{CrossEntropyLoss, LossMetrics, LossOutput};
pub use metrics::{AverageMeter, EpochSummary, EvaluationSummary};
pub use model::{BigramConfig, BigramLm, LanguageModel, ModelHandle};
pub use optimizer::{AdamW, AdamWConfig, GradientScaler, Optimizer, OptimizerState};
pub use precision::Precision;
pub use scheduler::{LrScheduler, SchedulerConfig};
pub use step::{StepExecutor, StepOptions, StepReport, StepStrategy};
pub use trainer::{FitSummary, Trainer};
