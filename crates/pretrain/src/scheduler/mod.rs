use std::f64::consts::PI;

use crate::{config, TrainingError};

/// Learning-rate schedule indexed by the global step counter.
pub trait LrScheduler: Send {
    /// Computes the learning rate for `step` and remembers it.
    fn adjust(&mut self, step: usize) -> f64;

    /// Rate returned by the most recent [`LrScheduler::adjust`] call.
    fn learning_rate(&self) -> f64;
}

#[derive(Debug, Clone, PartialEq)]
pub enum SchedulerConfig {
    Cosine {
        base_lr: f64,
        warmup_steps: usize,
        total_steps: usize,
        min_lr: f64,
    },
    Const {
        base_lr: f64,
        warmup_steps: usize,
    },
    ConstCooldown {
        base_lr: f64,
        warmup_steps: usize,
        total_steps: usize,
        cooldown_steps: usize,
        end_lr: f64,
        power: f64,
    },
}

impl SchedulerConfig {
    /// `total_steps` is `num_batches * epochs`; the cooldown window spans the
    /// last `epochs_cooldown` epochs.
    pub fn from_training_config(
        cfg: &config::SchedulerConfig,
        base_lr: f64,
        num_batches: usize,
        epochs: usize,
    ) -> Result<Self, TrainingError> {
        let total_steps = num_batches * epochs;
        if total_steps == 0 {
            return Err(TrainingError::initialization(
                "scheduler requires total_steps greater than zero",
            ));
        }
        if base_lr <= 0.0 {
            return Err(TrainingError::initialization(
                "scheduler requires base learning rate > 0",
            ));
        }

        match cfg.strategy {
            config::ScheduleStrategy::Cosine => Ok(SchedulerConfig::Cosine {
                base_lr,
                warmup_steps: cfg.warmup_steps,
                total_steps,
                min_lr: cfg.force_min_lr,
            }),
            config::ScheduleStrategy::Const => Ok(SchedulerConfig::Const {
                base_lr,
                warmup_steps: cfg.warmup_steps,
            }),
            config::ScheduleStrategy::ConstCooldown => {
                let epochs_cooldown = cfg.epochs_cooldown.ok_or_else(|| {
                    TrainingError::configuration(
                        "const_cooldown schedule requires scheduler.epochs_cooldown",
                    )
                })?;
                if epochs_cooldown > epochs {
                    return Err(TrainingError::configuration(format!(
                        "epochs_cooldown ({}) exceeds epochs ({})",
                        epochs_cooldown, epochs
                    )));
                }
                Ok(SchedulerConfig::ConstCooldown {
                    base_lr,
                    warmup_steps: cfg.warmup_steps,
                    total_steps,
                    cooldown_steps: num_batches * epochs_cooldown,
                    end_lr: cfg.cooldown_end_lr,
                    power: if cfg.cooldown_power > 0.0 {
                        cfg.cooldown_power
                    } else {
                        1.0
                    },
                })
            }
        }
    }

    pub fn build(self) -> Box<dyn LrScheduler> {
        Box::new(Schedule {
            config: self,
            current_lr: 0.0,
        })
    }

    pub fn learning_rate_at(&self, step: usize) -> f64 {
        match *self {
            SchedulerConfig::Cosine {
                base_lr,
                warmup_steps,
                total_steps,
                min_lr,
            } => {
                if step < warmup_steps {
                    return warmup_lr(base_lr, warmup_steps, step);
                }
                let elapsed = (step - warmup_steps) as f64;
                let span = total_steps.saturating_sub(warmup_steps).max(1) as f64;
                let cosine = 0.5 * (1.0 + f64::cos(PI * (elapsed / span).min(1.0)));
                (cosine * (base_lr - min_lr) + min_lr).max(min_lr)
            }
            SchedulerConfig::Const {
                base_lr,
                warmup_steps,
            } => {
                if step < warmup_steps {
                    warmup_lr(base_lr, warmup_steps, step)
                } else {
                    base_lr
                }
            }
            SchedulerConfig::ConstCooldown {
                base_lr,
                warmup_steps,
                total_steps,
                cooldown_steps,
                end_lr,
                power,
            } => {
                let cooldown_start = total_steps.saturating_sub(cooldown_steps);
                if step < warmup_steps {
                    warmup_lr(base_lr, warmup_steps, step)
                } else if step < cooldown_start {
                    base_lr
                } else {
                    let elapsed = (step - cooldown_start) as f64;
                    let span = (total_steps - cooldown_start).max(1) as f64;
                    let decay = (1.0 - (elapsed / span).min(1.0)).powf(power);
                    decay * (base_lr - end_lr) + end_lr
                }
            }
        }
    }
}

fn warmup_lr(base_lr: f64, warmup_steps: usize, step: usize) -> f64 {
    base_lr * (step + 1) as f64 / warmup_steps as f64
}

struct Schedule {
    config: SchedulerConfig,
    current_lr: f64,
}

impl LrScheduler for Schedule {
    fn adjust(&mut self, step: usize) -> f64 {
        self.current_lr = self.config.learning_rate_at(step);
        self.current_lr
    }

    fn learning_rate(&self) -> f64 {
        self.current_lr
    }
}
