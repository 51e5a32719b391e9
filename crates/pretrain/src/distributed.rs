use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError};

use candle_core::{backprop::GradStore, DType, Tensor};
use serde::{Deserialize, Serialize};

use crate::{error::Result, model::LanguageModel, optimizer::OptimizerState, TrainingError};

/// Blocking collective operations shared by every worker of a run.
///
/// Each call must be made by all ranks in the same order; a call returns once
/// every participant has arrived, or with an error once the group is aborted.
pub trait Collective: Send + Sync {
    fn rank(&self) -> usize;

    fn world_size(&self) -> usize;

    /// Every rank's buffer, indexed by rank.
    fn all_gather(&self, values: &[f32]) -> Result<Vec<Vec<f32>>>;

    /// Replaces `values` on every rank with the buffer held by `root`.
    fn broadcast(&self, values: &mut Vec<f32>, root: usize) -> Result<()>;

    fn barrier(&self) -> Result<()>;

    /// Releases every rank blocked in (or later entering) a collective call
    /// with an error. Called by a worker that is about to fail.
    fn abort(&self) {}

    /// Element-wise sum across ranks, written back into `values`. Ranks are
    /// summed in order so every replica sees identical bits.
    fn all_reduce_sum(&self, values: &mut [f32]) -> Result<()> {
        let gathered = self.all_gather(values)?;
        for (rank, slot) in gathered.iter().enumerate() {
            if slot.len() != values.len() {
                return Err(TrainingError::collective(format!(
                    "rank {} contributed {} values to an all-reduce of {}",
                    rank,
                    slot.len(),
                    values.len()
                )));
            }
        }
        for (index, value) in values.iter_mut().enumerate() {
            *value = gathered.iter().map(|slot| slot[index]).sum();
        }
        Ok(())
    }

    /// Sum of one f64 per rank, carried as three f32 words so no precision
    /// is lost on the way.
    fn all_reduce_sum_f64(&self, value: f64) -> Result<f64> {
        let gathered = self.all_gather(&split_f64(value))?;
        let mut total = 0f64;
        for (rank, words) in gathered.iter().enumerate() {
            match words.as_slice() {
                [hi, mid, lo] => total += *hi as f64 + *mid as f64 + *lo as f64,
                other => {
                    return Err(TrainingError::collective(format!(
                        "rank {} contributed {} words to an f64 all-reduce",
                        rank,
                        other.len()
                    )))
                }
            }
        }
        Ok(total)
    }

    /// True when any rank reports `flag`.
    fn any(&self, flag: bool) -> Result<bool> {
        let mut buffer = [if flag { 1.0 } else { 0.0 }];
        self.all_reduce_sum(&mut buffer)?;
        Ok(buffer[0] > 0.0)
    }
}

/// Splits `value` into f32 words whose f64 sum reproduces it exactly for
/// finite values in f32 range.
fn split_f64(value: f64) -> [f32; 3] {
    if !value.is_finite() {
        return [value as f32, 0.0, 0.0];
    }
    let hi = value as f32;
    let rest = value - hi as f64;
    let mid = rest as f32;
    let lo = (rest - mid as f64) as f32;
    [hi, mid, lo]
}

/// Degenerate group of one.
#[derive(Debug, Clone, Copy, Default)]
pub struct SingleProcess;

impl Collective for SingleProcess {
    fn rank(&self) -> usize {
        0
    }

    fn world_size(&self) -> usize {
        1
    }

    fn all_gather(&self, values: &[f32]) -> Result<Vec<Vec<f32>>> {
        Ok(vec![values.to_vec()])
    }

    fn all_reduce_sum(&self, _values: &mut [f32]) -> Result<()> {
        Ok(())
    }

    fn all_reduce_sum_f64(&self, value: f64) -> Result<f64> {
        Ok(value)
    }

    fn broadcast(&self, _values: &mut Vec<f32>, root: usize) -> Result<()> {
        if root != 0 {
            return Err(TrainingError::collective(format!(
                "broadcast root {} outside a world of size 1",
                root
            )));
        }
        Ok(())
    }

    fn barrier(&self) -> Result<()> {
        Ok(())
    }
}

struct BarrierState {
    arrived: usize,
    generation: u64,
    aborted: bool,
}

/// Reusable barrier that can be aborted. Waiters released by an abort get an
/// error instead of blocking forever.
struct GroupBarrier {
    parties: usize,
    state: Mutex<BarrierState>,
    released: Condvar,
}

impl GroupBarrier {
    fn new(parties: usize) -> Self {
        Self {
            parties,
            state: Mutex::new(BarrierState {
                arrived: 0,
                generation: 0,
                aborted: false,
            }),
            released: Condvar::new(),
        }
    }

    fn wait(&self) -> Result<()> {
        let mut state = self.state.lock().map_err(|_| poisoned())?;
        if state.aborted {
            return Err(aborted());
        }
        state.arrived += 1;
        if state.arrived == self.parties {
            state.arrived = 0;
            state.generation = state.generation.wrapping_add(1);
            self.released.notify_all();
            return Ok(());
        }
        let generation = state.generation;
        let state = self
            .released
            .wait_while(state, |state| state.generation == generation && !state.aborted)
            .map_err(|_| poisoned())?;
        if state.generation == generation {
            Err(aborted())
        } else {
            Ok(())
        }
    }

    fn abort(&self) {
        self.state
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .aborted = true;
        self.released.notify_all();
    }
}

fn poisoned() -> TrainingError {
    TrainingError::collective("collective group poisoned")
}

fn aborted() -> TrainingError {
    TrainingError::collective("collective group aborted by a failing worker")
}

struct GroupState {
    barrier: GroupBarrier,
    slots: Mutex<Vec<Vec<f32>>>,
}

/// In-process group whose ranks run on separate threads.
pub struct LocalGroup;

impl LocalGroup {
    /// Creates one handle per rank; hand each to its own thread.
    pub fn new(world_size: usize) -> Result<Vec<LocalCollective>> {
        if world_size == 0 {
            return Err(TrainingError::collective("world size must be at least 1"));
        }
        let state = Arc::new(GroupState {
            barrier: GroupBarrier::new(world_size),
            slots: Mutex::new(vec![Vec::new(); world_size]),
        });
        Ok((0..world_size)
            .map(|rank| LocalCollective {
                rank,
                world_size,
                state: Arc::clone(&state),
            })
            .collect())
    }
}

pub struct LocalCollective {
    rank: usize,
    world_size: usize,
    state: Arc<GroupState>,
}

impl LocalCollective {
    fn slots(&self) -> Result<MutexGuard<'_, Vec<Vec<f32>>>> {
        self.state.slots.lock().map_err(|_| poisoned())
    }

    fn publish(&self, values: &[f32]) -> Result<()> {
        let mut slots = self.slots()?;
        slots[self.rank].clear();
        slots[self.rank].extend_from_slice(values);
        Ok(())
    }
}

impl Collective for LocalCollective {
    fn rank(&self) -> usize {
        self.rank
    }

    fn world_size(&self) -> usize {
        self.world_size
    }

    fn all_gather(&self, values: &[f32]) -> Result<Vec<Vec<f32>>> {
        self.publish(values)?;
        self.state.barrier.wait()?;
        let gathered = self.slots()?.clone();
        self.state.barrier.wait()?;
        Ok(gathered)
    }

    fn broadcast(&self, values: &mut Vec<f32>, root: usize) -> Result<()> {
        if root >= self.world_size {
            return Err(TrainingError::collective(format!(
                "broadcast root {} outside a world of size {}",
                root, self.world_size
            )));
        }
        if self.rank == root {
            self.publish(values)?;
        }
        self.state.barrier.wait()?;
        if self.rank != root {
            let slots = self.slots()?;
            values.clear();
            values.extend_from_slice(&slots[root]);
        }
        self.state.barrier.wait()
    }

    fn barrier(&self) -> Result<()> {
        self.state.barrier.wait()
    }

    fn abort(&self) {
        self.state.barrier.abort();
    }
}

/// How parameter state is split across workers.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum Sharding {
    /// Every worker updates every parameter.
    #[default]
    Replicated,
    /// Parameter `i` is updated only by worker `i % world_size`.
    Sharded,
}

/// Picks the worker allowed to write console lines, sinks and checkpoints.
pub fn is_coordinator(rank: usize, local_rank: usize, log_local: bool) -> bool {
    if log_local {
        local_rank == 0
    } else {
        rank == 0
    }
}

/// Data-parallel wrapper around a model replica.
pub struct DistributedModel<M> {
    module: M,
    collective: Arc<dyn Collective>,
    sharding: Sharding,
}

impl<M: LanguageModel> DistributedModel<M> {
    pub fn new(module: M, collective: Arc<dyn Collective>, sharding: Sharding) -> Self {
        Self {
            module,
            collective,
            sharding,
        }
    }

    pub fn module(&self) -> &M {
        &self.module
    }

    pub fn collective(&self) -> &Arc<dyn Collective> {
        &self.collective
    }

    pub fn sharding(&self) -> Sharding {
        self.sharding
    }

    pub fn world_size(&self) -> usize {
        self.collective.world_size()
    }

    pub fn rank(&self) -> usize {
        self.collective.rank()
    }

    /// Whether this worker updates the parameter at `index`.
    pub fn owns(&self, index: usize) -> bool {
        match self.sharding {
            Sharding::Replicated => true,
            Sharding::Sharded => index % self.world_size() == self.rank(),
        }
    }

    /// Replaces local gradients with their cross-worker mean. In sharded mode
    /// gradients of parameters owned elsewhere are dropped afterwards.
    pub fn synchronize_gradients(&self, grads: &mut GradStore) -> Result<()> {
        let parameters = self.module.parameters();
        let mut layout = Vec::with_capacity(parameters.len());
        let mut buffer = Vec::new();

        for (_, var) in &parameters {
            let tensor = var.as_tensor();
            let values = match grads.get(tensor) {
                Some(grad) => grad.flatten_all()?.to_dtype(DType::F32)?.to_vec1::<f32>()?,
                None => vec![0.0; tensor.elem_count()],
            };
            layout.push((buffer.len(), values.len()));
            buffer.extend(values);
        }

        self.collective.all_reduce_sum(&mut buffer)?;
        let scale = 1.0 / self.world_size() as f32;

        for (index, ((_, var), (offset, len))) in parameters.iter().zip(layout).enumerate() {
            let tensor = var.as_tensor();
            if !self.owns(index) {
                grads.remove(tensor);
                continue;
            }
            let averaged: Vec<f32> = buffer[offset..offset + len]
                .iter()
                .map(|value| value * scale)
                .collect();
            let grad = Tensor::from_vec(averaged, tensor.shape(), tensor.device())?
                .to_dtype(tensor.dtype())?;
            grads.insert(tensor, grad);
        }
        Ok(())
    }

    /// Re-gathers sharded parameters from their owners after an update.
    pub fn gather_parameters(&self) -> Result<()> {
        if self.sharding == Sharding::Replicated || self.world_size() == 1 {
            return Ok(());
        }
        for (index, (_, var)) in self.module.parameters().iter().enumerate() {
            let owner = index % self.world_size();
            let tensor = var.as_tensor();
            let mut values = if owner == self.rank() {
                tensor.flatten_all()?.to_dtype(DType::F32)?.to_vec1::<f32>()?
            } else {
                Vec::new()
            };
            self.collective.broadcast(&mut values, owner)?;
            if owner != self.rank() {
                let updated = Tensor::from_vec(values, tensor.shape(), tensor.device())?
                    .to_dtype(tensor.dtype())?;
                var.set(&updated)?;
            }
        }
        Ok(())
    }

    /// Fills in moments and master weights of parameters owned by other
    /// workers, so `state` describes the whole optimizer. Every rank must call
    /// this with its own state; each owner broadcasts its slots in turn.
    pub fn gather_optimizer_state(&self, state: &mut OptimizerState) -> Result<()> {
        if self.sharding == Sharding::Replicated || self.world_size() == 1 {
            return Ok(());
        }
        let world_size = self.world_size();
        for (index, parameter) in state.parameters.iter_mut().enumerate() {
            let owner = index % world_size;
            let len = parameter.first_moment.len();
            let mut values = Vec::new();
            if owner == self.rank() {
                values.reserve(len * 3);
                values.extend_from_slice(&parameter.first_moment);
                values.extend_from_slice(&parameter.second_moment);
                if let Some(master) = &parameter.master {
                    values.extend_from_slice(master);
                }
            }
            self.collective.broadcast(&mut values, owner)?;
            if owner == self.rank() {
                continue;
            }
            let has_master = match values.len() {
                n if n == len * 2 => false,
                n if n == len * 3 => true,
                n => {
                    return Err(TrainingError::collective(format!(
                        "optimizer state for '{}' arrived with {} values, expected {} or {}",
                        parameter.name,
                        n,
                        len * 2,
                        len * 3
                    )))
                }
            };
            parameter.master = has_master.then(|| values[len * 2..].to_vec());
            values.truncate(len * 2);
            parameter.second_moment = values.split_off(len);
            parameter.first_moment = values;
        }
        Ok(())
    }
}
