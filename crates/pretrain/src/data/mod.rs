use std::{
    fs::File,
    io::{BufRead, BufReader},
    path::{Path, PathBuf},
};

use candle_core::{Device, Tensor};
use rand::{rngs::StdRng, seq::SliceRandom, SeedableRng};

use crate::TrainingError;

/// Result alias for data pipeline fallible operations.
pub type Result<T> = std::result::Result<T, TrainingError>;

/// Fixed-width batch of token-id sequences.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TokenBatch {
    rows: Vec<Vec<u32>>,
    row_len: usize,
}

impl TokenBatch {
    pub fn new(rows: Vec<Vec<u32>>) -> Result<Self> {
        let row_len = rows
            .first()
            .map(Vec::len)
            .ok_or_else(|| TrainingError::runtime("batch must contain at least one sequence"))?;
        if let Some(index) = rows.iter().position(|row| row.len() != row_len) {
            return Err(TrainingError::runtime(format!(
                "ragged batch: sequence {} has {} tokens, expected {}",
                index,
                rows[index].len(),
                row_len
            )));
        }
        Ok(Self { rows, row_len })
    }

    pub fn rows(&self) -> &[Vec<u32>] {
        &self.rows
    }

    pub fn num_rows(&self) -> usize {
        self.rows.len()
    }

    pub fn row_len(&self) -> usize {
        self.row_len
    }

    pub fn to_tensor(&self, device: &Device) -> Result<Tensor> {
        let flat: Vec<u32> = self.rows.iter().flatten().copied().collect();
        Ok(Tensor::from_vec(flat, (self.rows.len(), self.row_len), device)?)
    }

    /// Next-token split over the first `seq_len` positions: inputs are
    /// `[:, 0..seq_len-1]` and targets `[:, 1..seq_len]`.
    pub fn split(&self, seq_len: usize, device: &Device) -> Result<(Tensor, Tensor)> {
        if seq_len < 2 {
            return Err(TrainingError::configuration(
                "seq_len must be at least 2 to form input/target pairs",
            ));
        }
        if self.row_len < seq_len {
            return Err(TrainingError::configuration(format!(
                "batch sequences have {} tokens but seq_len is {}",
                self.row_len, seq_len
            )));
        }
        let tokens = self.to_tensor(device)?;
        let inputs = tokens.narrow(1, 0, seq_len - 1)?;
        let targets = tokens.narrow(1, 1, seq_len - 1)?;
        Ok((inputs, targets))
    }
}

/// Source of batches for one worker.
pub trait TrainData {
    /// Prepares the stream for `epoch`; iteration restarts from the beginning.
    fn set_epoch(&mut self, epoch: usize);

    /// Batches this worker yields per epoch.
    fn num_batches(&self) -> usize;

    /// Samples consumed per epoch across all workers.
    fn num_samples(&self) -> usize;

    fn next_batch(&mut self) -> Result<Option<TokenBatch>>;
}

impl<T: TrainData + ?Sized> TrainData for Box<T> {
    fn set_epoch(&mut self, epoch: usize) {
        (**self).set_epoch(epoch)
    }

    fn num_batches(&self) -> usize {
        (**self).num_batches()
    }

    fn num_samples(&self) -> usize {
        (**self).num_samples()
    }

    fn next_batch(&mut self) -> Result<Option<TokenBatch>> {
        (**self).next_batch()
    }
}

/// Pre-built batches replayed in order every epoch.
#[derive(Debug, Clone)]
pub struct InMemoryData {
    batches: Vec<TokenBatch>,
    world_size: usize,
    cursor: usize,
    epochs_seen: Vec<usize>,
}

impl InMemoryData {
    pub fn new(batches: Vec<TokenBatch>) -> Self {
        Self::with_world_size(batches, 1)
    }

    pub fn with_world_size(batches: Vec<TokenBatch>, world_size: usize) -> Self {
        Self {
            batches,
            world_size: world_size.max(1),
            cursor: 0,
            epochs_seen: Vec::new(),
        }
    }

    /// Epochs passed to `set_epoch`, in call order.
    pub fn epochs_seen(&self) -> &[usize] {
        &self.epochs_seen
    }
}

impl TrainData for InMemoryData {
    fn set_epoch(&mut self, epoch: usize) {
        self.cursor = 0;
        self.epochs_seen.push(epoch);
    }

    fn num_batches(&self) -> usize {
        self.batches.len()
    }

    fn num_samples(&self) -> usize {
        self.batches.iter().map(TokenBatch::num_rows).sum::<usize>() * self.world_size
    }

    fn next_batch(&mut self) -> Result<Option<TokenBatch>> {
        let batch = self.batches.get(self.cursor).cloned();
        if batch.is_some() {
            self.cursor += 1;
        }
        Ok(batch)
    }
}

/// Loader for pre-tokenized JSONL shards, one JSON array of token ids per line.
///
/// Sample `i` (counted across all shards in order) belongs to rank
/// `i % world_size`. Every rank keeps the same number of samples so that
/// workers stay in lockstep, and only full batches are produced.
#[derive(Debug)]
pub struct TokenShardLoader {
    samples: Vec<Vec<u32>>,
    order: Vec<usize>,
    batch_size: usize,
    world_size: usize,
    seed: u64,
    shuffle: bool,
    cursor: usize,
}

#[derive(Debug, Clone)]
pub struct ShardOptions {
    pub batch_size: usize,
    pub seq_len: usize,
    pub rank: usize,
    pub world_size: usize,
    pub seed: u64,
    pub shuffle: bool,
}

impl TokenShardLoader {
    pub fn open(paths: &[PathBuf], options: &ShardOptions) -> Result<Self> {
        if options.batch_size == 0 {
            return Err(TrainingError::initialization(
                "batch size must be greater than zero",
            ));
        }
        if options.world_size == 0 || options.rank >= options.world_size {
            return Err(TrainingError::initialization(format!(
                "rank {} is outside a world of size {}",
                options.rank, options.world_size
            )));
        }
        if paths.is_empty() {
            return Err(TrainingError::initialization("no shard paths configured"));
        }

        let mut all = Vec::new();
        for path in paths {
            read_shard(path, options.seq_len, &mut all)?;
        }

        let per_rank = all.len() / options.world_size;
        let samples: Vec<Vec<u32>> = all
            .into_iter()
            .enumerate()
            .filter(|(index, _)| index % options.world_size == options.rank)
            .map(|(_, sample)| sample)
            .take(per_rank)
            .collect();
        if samples.len() < options.batch_size {
            return Err(TrainingError::initialization(format!(
                "rank {} holds {} samples, fewer than one batch of {}",
                options.rank,
                samples.len(),
                options.batch_size
            )));
        }

        let order = (0..samples.len()).collect();
        Ok(Self {
            samples,
            order,
            batch_size: options.batch_size,
            world_size: options.world_size,
            seed: options.seed,
            shuffle: options.shuffle,
            cursor: 0,
        })
    }
}

fn read_shard(path: &Path, seq_len: usize, out: &mut Vec<Vec<u32>>) -> Result<()> {
    let reader = BufReader::new(File::open(path)?);
    for (line_no, line) in reader.lines().enumerate() {
        let line = line?;
        if line.trim().is_empty() {
            continue;
        }
        let tokens: Vec<u32> = serde_json::from_str(&line).map_err(|err| {
            TrainingError::initialization(format!(
                "{}:{}: invalid token array: {}",
                path.display(),
                line_no + 1,
                err
            ))
        })?;
        if tokens.len() < seq_len {
            return Err(TrainingError::initialization(format!(
                "{}:{}: sample has {} tokens, expected at least {}",
                path.display(),
                line_no + 1,
                tokens.len(),
                seq_len
            )));
        }
        out.push(tokens[..seq_len].to_vec());
    }
    Ok(())
}

fn epoch_seed(seed: u64, epoch: usize) -> u64 {
    seed.wrapping_mul(0x9E37_79B9_7F4A_7C15) ^ epoch as u64
}

impl TrainData for TokenShardLoader {
    fn set_epoch(&mut self, epoch: usize) {
        self.cursor = 0;
        self.order = (0..self.samples.len()).collect();
        if self.shuffle {
            let mut rng = StdRng::seed_from_u64(epoch_seed(self.seed, epoch));
            self.order.shuffle(&mut rng);
        }
    }

    fn num_batches(&self) -> usize {
        self.samples.len() / self.batch_size
    }

    fn num_samples(&self) -> usize {
        self.num_batches() * self.batch_size * self.world_size
    }

    fn next_batch(&mut self) -> Result<Option<TokenBatch>> {
        if self.cursor + self.batch_size > self.order.len() {
            return Ok(None);
        }
        let rows = self.order[self.cursor..self.cursor + self.batch_size]
            .iter()
            .map(|&index| self.samples[index].clone())
            .collect();
        self.cursor += self.batch_size;
        TokenBatch::new(rows).map(Some)
    }
}
