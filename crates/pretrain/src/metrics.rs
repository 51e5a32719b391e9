use std::time::{Duration, Instant};

/// Running mean over weighted scalar samples.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct AverageMeter {
    val: f64,
    sum: f64,
    count: f64,
    avg: f64,
}

impl AverageMeter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn reset(&mut self) {
        *self = Self::default();
    }

    pub fn update(&mut self, value: f64, weight: f64) {
        self.val = value;
        self.sum += value * weight;
        self.count += weight;
        self.avg = if self.count > 0.0 {
            self.sum / self.count
        } else {
            0.0
        };
    }

    pub fn update_one(&mut self, value: f64) {
        self.update(value, 1.0);
    }

    pub fn val(&self) -> f64 {
        self.val
    }

    pub fn avg(&self) -> f64 {
        self.avg
    }

    pub fn sum(&self) -> f64 {
        self.sum
    }

    pub fn count(&self) -> f64 {
        self.count
    }
}

/// Wall-clock split between waiting for data and running a step.
#[derive(Debug)]
pub struct StepTimer {
    end: Instant,
}

impl StepTimer {
    pub fn start() -> Self {
        Self {
            end: Instant::now(),
        }
    }

    /// Time since the previous batch finished.
    pub fn elapsed(&self) -> Duration {
        self.end.elapsed()
    }

    /// Marks the end of a batch, returning its total duration.
    pub fn lap(&mut self) -> Duration {
        let now = Instant::now();
        let elapsed = now.duration_since(self.end);
        self.end = now;
        elapsed
    }
}

pub fn throughput(tokens: usize, workers: usize, seconds: f64) -> f64 {
    if seconds > 0.0 {
        (tokens * workers) as f64 / seconds
    } else {
        0.0
    }
}

#[derive(Debug, Clone)]
pub struct EvaluationSummary {
    pub epoch: usize,
    pub average_loss: f64,
    pub perplexity: f64,
    pub data_time: f64,
    pub batch_time: f64,
    pub samples_per_second: f64,
    pub samples_per_second_per_gpu: f64,
    pub tokens: u64,
    pub batches: usize,
}

#[derive(Debug, Clone, Default)]
pub struct EpochSummary {
    pub epoch: usize,
    pub batches: usize,
    pub optimizer_steps: usize,
    pub skipped_steps: usize,
    pub average_loss: f64,
    pub last_step: Option<usize>,
    pub records_emitted: usize,
}
