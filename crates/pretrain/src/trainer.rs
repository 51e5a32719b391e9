use std::path::{Path, PathBuf};

use tracing::info;

use crate::{
    checkpoint::{
        apply_model_weights, delete_checkpoint, epoch_dir_name, latest_checkpoint,
        load_checkpoint, save_checkpoint, SaveRequest, TrainingProgress, LATEST_DIR,
    },
    config::TrainingConfig,
    data::TrainData,
    distributed::is_coordinator,
    error::Result,
    logging::{build_sinks, LogRecord, SinkSet, Split},
    loss::CrossEntropyLoss,
    metrics::{throughput, AverageMeter, EpochSummary, EvaluationSummary, StepTimer},
    model::{LanguageModel, ModelHandle},
    optimizer::{AdamW, AdamWConfig, Optimizer, OptimizerState},
    precision::Autocast,
    scheduler::{LrScheduler, SchedulerConfig},
    step::StepExecutor,
    TrainingError,
};

/// Results of a multi-epoch [`Trainer::fit`] run.
#[derive(Debug, Clone, Default)]
pub struct FitSummary {
    pub epochs: Vec<EpochSummary>,
    pub evaluations: Vec<EvaluationSummary>,
    pub checkpoints: Vec<PathBuf>,
}

/// Per-worker driver for the epoch loop and evaluation passes.
///
/// Every worker runs the same sequence of calls; only the coordinator writes
/// console lines, sinks and checkpoints.
pub struct Trainer<M: LanguageModel> {
    config: TrainingConfig,
    model: ModelHandle<M>,
    optimizer: AdamW,
    scheduler: Box<dyn LrScheduler>,
    executor: StepExecutor,
    sinks: SinkSet,
    coordinator: bool,
    world_size: usize,
    train_num_samples: usize,
    start_epoch: usize,
    global_step: usize,
    checkpoint_dir: PathBuf,
    previous_checkpoint: Option<PathBuf>,
}

impl<M: LanguageModel> Trainer<M> {
    /// `train_data` only provides the batch and sample counts used to size the
    /// schedule and the token accounting.
    pub fn new(
        config: TrainingConfig,
        model: ModelHandle<M>,
        train_data: &dyn TrainData,
    ) -> Result<Self> {
        let (rank, world_size) = match model.distributed() {
            Some(wrapper) => (wrapper.rank(), wrapper.world_size()),
            None => (config.distributed.rank, config.distributed.world_size.max(1)),
        };
        config
            .runtime
            .precision
            .check_device(model.underlying().device())?;
        let coordinator = is_coordinator(
            rank,
            config.distributed.local_rank,
            config.logging.log_local,
        );

        let optimizer = AdamW::new(model.parameters(), AdamWConfig::from(&config.optimizer))?;
        let scheduler = SchedulerConfig::from_training_config(
            &config.scheduler,
            config.optimizer.learning_rate,
            train_data.num_batches(),
            config.runtime.epochs,
        )?
        .build();
        let executor = StepExecutor::from_config(&config)?;
        let sinks = build_sinks(&config.logging, coordinator)?;
        let train_num_samples = config
            .data
            .train_num_samples
            .unwrap_or_else(|| train_data.num_samples());
        let checkpoint_dir = config.checkpoint_dir();

        Ok(Self {
            config,
            model,
            optimizer,
            scheduler,
            executor,
            sinks,
            coordinator,
            world_size,
            train_num_samples,
            start_epoch: 0,
            global_step: 0,
            checkpoint_dir,
            previous_checkpoint: None,
        })
    }

    pub fn with_scheduler(mut self, scheduler: Box<dyn LrScheduler>) -> Self {
        self.scheduler = scheduler;
        self
    }

    pub fn with_sinks(mut self, sinks: SinkSet) -> Self {
        self.sinks = sinks;
        self
    }

    pub fn with_executor(mut self, executor: StepExecutor) -> Self {
        self.executor = executor;
        self
    }

    pub fn with_checkpoint_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.checkpoint_dir = dir.into();
        self
    }

    pub fn model(&self) -> &ModelHandle<M> {
        &self.model
    }

    pub fn optimizer(&self) -> &AdamW {
        &self.optimizer
    }

    pub fn executor(&self) -> &StepExecutor {
        &self.executor
    }

    pub fn is_coordinator(&self) -> bool {
        self.coordinator
    }

    pub fn start_epoch(&self) -> usize {
        self.start_epoch
    }

    pub fn checkpoint_dir(&self) -> &Path {
        &self.checkpoint_dir
    }

    /// Runs one pass over `data`, stepping the optimizer once per batch.
    pub fn train_one_epoch(
        &mut self,
        data: &mut dyn TrainData,
        epoch: usize,
    ) -> Result<EpochSummary> {
        self.model.set_training(true);
        data.set_epoch(epoch);

        let num_batches = data.num_batches();
        let batch_size = self.config.data.batch_size;
        let seq_len = self.config.data.seq_len;
        let log_every = self.config.runtime.log_every_n_steps.max(1);
        let skip_scheduler = self.config.scheduler.skip_scheduler;
        let world_size = self.world_size;

        let mut loss_m = AverageMeter::new();
        let mut data_time_m = AverageMeter::new();
        let mut batch_time_m = AverageMeter::new();

        let mut summary = EpochSummary {
            epoch,
            ..EpochSummary::default()
        };
        let mut timer = StepTimer::start();
        let mut index = 0usize;

        while let Some(batch) = data.next_batch()? {
            let step = num_batches * epoch + index;
            if !skip_scheduler {
                let lr = self.scheduler.adjust(step);
                self.optimizer.set_learning_rate(lr);
            }

            data_time_m.update_one(timer.elapsed().as_secs_f64());
            let report = self
                .executor
                .execute(&self.model, &batch, &mut self.optimizer)?;
            batch_time_m.update_one(timer.lap().as_secs_f64());
            if report.optimizer_stepped && self.model.is_sharded() {
                if let Some(wrapper) = self.model.distributed() {
                    self.optimizer.refresh_masters(|index| !wrapper.owns(index))?;
                }
            }

            self.global_step = step + 1;
            summary.batches += 1;
            summary.last_step = Some(step);
            if report.optimizer_stepped {
                summary.optimizer_steps += 1;
            } else {
                summary.skipped_steps += 1;
            }

            let batch_count = index + 1;
            if index % log_every == 0 || batch_count == num_batches {
                loss_m.update(report.loss, report.batch_rows as f64);

                let batch_seconds = batch_time_m.val();
                let samples_per_second = throughput(report.input_tokens, world_size, batch_seconds);
                let samples_per_second_per_gpu = throughput(report.input_tokens, 1, batch_seconds);

                if self.coordinator {
                    let lr = self.optimizer.learning_rate();
                    let samples_seen = batch_count * batch_size * world_size;
                    let samples_per_epoch = data.num_samples();
                    let percent = if num_batches > 0 {
                        100.0 * batch_count as f64 / num_batches as f64
                    } else {
                        100.0
                    };
                    info!(
                        "Train Epoch: {} [{}/{} ({:.0}%)] Loss: {:.3} Data (t): {:.3} Batch (t): {:.3}, {:.1}/s, {:.1}/s/gpu LR: {:.6}",
                        epoch,
                        samples_seen,
                        samples_per_epoch,
                        percent,
                        loss_m.avg(),
                        data_time_m.avg(),
                        batch_time_m.avg(),
                        samples_per_second,
                        samples_per_second_per_gpu,
                        lr
                    );

                    let tokens = ((step + 1) * batch_size * seq_len * world_size) as u64;
                    let mut record = LogRecord::new(Split::Train, step, epoch, tokens)
                        .with("loss", loss_m.val())
                        .with("data_time", data_time_m.val())
                        .with("batch_time", batch_time_m.val())
                        .with("samples_per_second", samples_per_second)
                        .with("samples_per_second_per_gpu", samples_per_second_per_gpu)
                        .with("lr", lr)
                        .with("tokens", tokens as f64)
                        .with("grad_norm", report.grad_norm)
                        .with("loss_scale", report.loss_scale as f64);
                    if let Some(logit_mean) = report.logit_mean {
                        record.insert("logit_mean", logit_mean);
                    }
                    self.sinks.emit(&record);
                    summary.records_emitted += 1;
                }

                batch_time_m.reset();
                data_time_m.reset();
            }

            index += 1;
        }

        if self.coordinator {
            self.sinks.flush();
        }
        summary.average_loss = loss_m.avg();
        Ok(summary)
    }

    /// One pass over `data` in inference mode. The model's previous training
    /// mode is restored afterwards, also on error.
    pub fn evaluate(&mut self, data: &mut dyn TrainData, epoch: usize) -> Result<EvaluationSummary> {
        let was_training = self.model.is_training();
        self.model.set_training(false);
        data.set_epoch(epoch);
        let result = self.evaluate_internal(data, epoch);
        self.model.set_training(was_training);
        result
    }

    fn evaluate_internal(
        &mut self,
        data: &mut dyn TrainData,
        epoch: usize,
    ) -> Result<EvaluationSummary> {
        let seq_len = self.config.data.seq_len;
        let autocast: Autocast = self.config.runtime.precision.autocast();
        let loss_fn = CrossEntropyLoss::new();
        let device = self.model.underlying().device().clone();
        let world_size = self.world_size;

        let mut loss_m = AverageMeter::new();
        let mut data_time_m = AverageMeter::new();
        let mut batch_time_m = AverageMeter::new();
        let mut samples_per_second_m = AverageMeter::new();
        let mut samples_per_second_per_gpu_m = AverageMeter::new();
        let mut batches = 0usize;
        let mut timer = StepTimer::start();

        while let Some(batch) = data.next_batch()? {
            data_time_m.update_one(timer.elapsed().as_secs_f64());
            let (inputs, targets) = batch.split(seq_len, &device)?;
            let model = &self.model;
            let output = autocast.scope(|ctx| {
                let logits = model.forward(&inputs, ctx)?.detach();
                loss_fn.compute(&logits, &targets)
            })?;
            let input_tokens = inputs.elem_count();
            loss_m.update(output.metrics.loss(), input_tokens as f64);

            let batch_seconds = timer.lap().as_secs_f64();
            batch_time_m.update_one(batch_seconds);
            samples_per_second_m.update_one(throughput(input_tokens, world_size, batch_seconds));
            samples_per_second_per_gpu_m.update_one(throughput(input_tokens, 1, batch_seconds));
            batches += 1;
        }

        if batches == 0 {
            return Err(TrainingError::runtime(
                "evaluation data produced no batches",
            ));
        }

        let average_loss = loss_m.avg();
        let summary = EvaluationSummary {
            epoch,
            average_loss,
            perplexity: average_loss.exp(),
            data_time: data_time_m.avg(),
            batch_time: batch_time_m.avg(),
            samples_per_second: samples_per_second_m.avg(),
            samples_per_second_per_gpu: samples_per_second_per_gpu_m.avg(),
            tokens: (epoch * self.train_num_samples * seq_len) as u64,
            batches,
        };

        if self.coordinator {
            info!(
                "Eval Epoch: {} loss: {:.4} perplexity: {:.4} batches: {} {:.1}/s/gpu",
                epoch,
                summary.average_loss,
                summary.perplexity,
                summary.batches,
                summary.samples_per_second_per_gpu
            );
            let record = LogRecord::new(Split::Valid, epoch, epoch, summary.tokens)
                .with("loss", summary.average_loss)
                .with("perplexity", summary.perplexity)
                .with("data_time", summary.data_time)
                .with("batch_time", summary.batch_time)
                .with("samples_per_second", summary.samples_per_second)
                .with("samples_per_second_per_gpu", summary.samples_per_second_per_gpu)
                .with("tokens", summary.tokens as f64);
            self.sinks.emit(&record);
            self.sinks.flush();
        }

        Ok(summary)
    }

    /// Loads `target` (`latest` or a checkpoint directory) and positions the
    /// run at the epoch after it. Returns `None` when `latest` finds nothing.
    pub fn resume(&mut self, target: &str) -> Result<Option<TrainingProgress>> {
        let directory = if target == "latest" {
            match latest_checkpoint(&self.checkpoint_dir)? {
                Some(descriptor) => descriptor.directory,
                None => {
                    info!(dir = %self.checkpoint_dir.display(), "no checkpoint to resume from");
                    return Ok(None);
                }
            }
        } else {
            PathBuf::from(target)
        };

        let outcome = load_checkpoint(&directory)?;
        apply_model_weights(self.model.underlying(), &outcome.model_weights_path)?;
        self.optimizer.load_state(outcome.optimizer_state)?;
        if let (Some(state), Some(scaler)) = (
            outcome.scaler_state,
            self.executor.strategy_mut().scaler_mut(),
        ) {
            scaler.load_state(state)?;
        }

        let progress = outcome.manifest.progress;
        self.start_epoch = progress.completed_epochs;
        self.global_step = progress.global_step;
        let is_latest = directory
            .file_name()
            .is_some_and(|name| name == LATEST_DIR);
        if !is_latest {
            self.previous_checkpoint = Some(directory.clone());
        }
        if self.coordinator {
            info!(
                dir = %directory.display(),
                epoch = progress.completed_epochs,
                "resumed from checkpoint"
            );
        }
        Ok(Some(progress))
    }

    /// Trains from the start (or resumed) epoch through `runtime.epochs`,
    /// evaluating and checkpointing on the configured cadence.
    ///
    /// A failing worker aborts its collective group so the other workers
    /// return an error instead of waiting on it.
    pub fn fit(
        &mut self,
        train: &mut dyn TrainData,
        validation: Option<&mut dyn TrainData>,
    ) -> Result<FitSummary> {
        let result = self.fit_epochs(train, validation);
        if result.is_err() {
            if let Some(collective) = self.model.collective() {
                collective.abort();
            }
        }
        result
    }

    fn fit_epochs(
        &mut self,
        train: &mut dyn TrainData,
        mut validation: Option<&mut dyn TrainData>,
    ) -> Result<FitSummary> {
        if let Some(target) = self.config.checkpoint.resume.clone() {
            self.resume(&target)?;
        }

        let epochs = self.config.runtime.epochs;
        let val_frequency = self.config.runtime.val_frequency.max(1);
        let save_frequency = self.config.checkpoint.save_frequency.max(1);
        let mut fit = FitSummary::default();

        for epoch in self.start_epoch..epochs {
            if self.coordinator {
                info!(epoch, "start epoch");
            }
            fit.epochs.push(self.train_one_epoch(train, epoch)?);
            let completed = epoch + 1;

            if let Some(val) = validation.as_deref_mut() {
                if completed % val_frequency == 0 || completed == epochs {
                    fit.evaluations.push(self.evaluate(val, completed)?);
                }
            }

            let save_epoch = completed % save_frequency == 0 || completed == epochs;
            let save_latest = self.config.checkpoint.save_most_recent;
            if save_epoch || save_latest {
                // Every worker takes part in gathering sharded optimizer state.
                let state = self.optimizer_state()?;
                if self.coordinator {
                    if save_epoch {
                        let path = self.save(epoch_dir_name(completed), completed, &state)?;
                        if self.config.checkpoint.delete_previous_checkpoint {
                            if let Some(previous) = self.previous_checkpoint.take() {
                                delete_checkpoint(&previous)?;
                            }
                        }
                        self.previous_checkpoint = Some(path.clone());
                        fit.checkpoints.push(path);
                    }
                    if save_latest {
                        self.save(LATEST_DIR.to_string(), completed, &state)?;
                    }
                }
            }
            self.start_epoch = completed;
        }

        Ok(fit)
    }

    /// Optimizer state covering every parameter. Sharded runs collect the
    /// slots owned by other workers, so all workers must call this together.
    pub fn optimizer_state(&self) -> Result<OptimizerState> {
        let mut state = self.optimizer.state()?;
        if let Some(wrapper) = self.model.distributed() {
            wrapper.gather_optimizer_state(&mut state)?;
        }
        Ok(state)
    }

    fn save(
        &self,
        dir_name: String,
        completed_epochs: usize,
        optimizer: &OptimizerState,
    ) -> Result<PathBuf> {
        let descriptor = save_checkpoint(SaveRequest {
            base_dir: &self.checkpoint_dir,
            dir_name,
            config: &self.config,
            model: self.model.underlying(),
            optimizer,
            scaler: self.executor.strategy().scaler(),
            progress: TrainingProgress {
                completed_epochs,
                global_step: self.global_step,
            },
        })?;
        info!(dir = %descriptor.directory.display(), "saved checkpoint");
        Ok(descriptor.directory)
    }
}
