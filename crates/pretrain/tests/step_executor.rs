mod common;

use std::{sync::Arc, thread};

use approx::assert_relative_eq;
use pretrain::{
    distributed::{Collective, DistributedModel, LocalGroup, Sharding},
    optimizer::{global_grad_norm, LossScaleConfig},
    CrossEntropyLoss, GradientScaler, LanguageModel, ModelHandle, Optimizer, Precision,
    StepExecutor, StepOptions, StepStrategy, TokenBatch,
};

use common::{batch, bigram, CountingModel, RecordingOptimizer};

const VOCAB: usize = 16;

fn executor(seq_len: usize, accum_freq: usize, grad_clip_norm: Option<f64>) -> StepExecutor {
    StepExecutor::new(
        Precision::Fp32,
        CrossEntropyLoss::new(),
        StepOptions {
            seq_len,
            accum_freq,
            grad_clip_norm,
            log_logit_mean: false,
        },
    )
    .unwrap()
}

#[test]
fn accumulated_loss_matches_full_batch_loss() {
    let model = ModelHandle::Plain(bigram(VOCAB, 5));
    let mut optimizer = RecordingOptimizer::new(model.parameters());
    let data = batch(8, 9, VOCAB, 0);

    let full = executor(9, 1, None)
        .execute(&model, &data, &mut optimizer)
        .unwrap();
    let full_grads = optimizer.last_grads.clone();
    let chunked = executor(9, 4, None)
        .execute(&model, &data, &mut optimizer)
        .unwrap();

    assert_relative_eq!(full.loss, chunked.loss, epsilon = 1e-5);
    assert_relative_eq!(full.grad_norm, chunked.grad_norm, epsilon = 1e-5);
    for (a, b) in full_grads.iter().zip(&optimizer.last_grads) {
        let (a, b) = (a.as_ref().unwrap(), b.as_ref().unwrap());
        for (x, y) in a.iter().zip(b) {
            assert_relative_eq!(*x, *y, epsilon = 1e-5);
        }
    }
}

#[test]
fn indivisible_batch_fails_before_any_forward() {
    let model = CountingModel::new(VOCAB);
    let forwards = model.forward_counter();
    let model = ModelHandle::Plain(model);
    let mut optimizer = RecordingOptimizer::new(model.parameters());

    let err = executor(8, 4, None)
        .execute(&model, &batch(6, 8, VOCAB, 0), &mut optimizer)
        .unwrap_err();

    assert!(err.is_configuration());
    assert_eq!(forwards.load(std::sync::atomic::Ordering::SeqCst), 0);
    assert_eq!(optimizer.steps_taken(), 0);
}

#[test]
fn eight_rows_in_four_chunks_take_one_step() {
    let model = CountingModel::new(VOCAB);
    let forwards = model.forward_counter();
    let model = ModelHandle::Plain(model);
    let mut optimizer = RecordingOptimizer::new(model.parameters());

    let report = executor(16, 4, None)
        .execute(&model, &batch(8, 16, VOCAB, 0), &mut optimizer)
        .unwrap();

    assert_eq!(report.chunks, 4);
    assert_eq!(report.chunk_rows, 2);
    assert_eq!(report.backward_passes, 4);
    assert_eq!(forwards.load(std::sync::atomic::Ordering::SeqCst), 4);
    assert!(report.optimizer_stepped);
    assert_eq!(optimizer.steps_taken(), 1);
    assert_eq!(report.batch_rows, 8);
    assert_eq!(report.input_tokens, 8 * 15);
}

#[test]
fn clipped_gradients_respect_threshold() {
    let model = ModelHandle::Plain(bigram(VOCAB, 9));
    let mut optimizer = RecordingOptimizer::new(model.parameters());
    let max_norm = 1e-3;

    let report = executor(9, 2, Some(max_norm))
        .execute(&model, &batch(4, 9, VOCAB, 3), &mut optimizer)
        .unwrap();

    assert!(report.grad_norm > max_norm, "pre-clip norm {}", report.grad_norm);
    assert!(optimizer.last_grad_norm() <= max_norm + 1e-6);
}

#[test]
fn overflow_skips_the_step_and_backs_off() {
    let model = ModelHandle::Plain(CountingModel::new(VOCAB).poisoned());
    let mut optimizer = RecordingOptimizer::new(model.parameters());
    let scaler = GradientScaler::with_config(
        LossScaleConfig {
            initial_scale: 1024.0,
            ..LossScaleConfig::default()
        },
        Precision::Amp,
    );
    let mut executor = executor(8, 2, Some(1.0)).with_strategy(StepStrategy::Scaled(scaler));

    let report = executor
        .execute(&model, &batch(4, 8, VOCAB, 0), &mut optimizer)
        .unwrap();

    assert!(!report.optimizer_stepped);
    assert!(report.grad_norm.is_infinite());
    assert_eq!(optimizer.steps_taken(), 0);
    assert_eq!(report.loss_scale, 512.0);
    assert_eq!(executor.strategy().scaler().unwrap().loss_scale(), 512.0);
}

#[test]
fn finite_scaled_step_matches_unscaled_gradients() {
    let model = ModelHandle::Plain(bigram(VOCAB, 2));
    let data = batch(4, 8, VOCAB, 1);

    let mut plain = RecordingOptimizer::new(model.parameters());
    executor(8, 1, None).execute(&model, &data, &mut plain).unwrap();

    let mut scaled = RecordingOptimizer::new(model.parameters());
    let mut executor = executor(8, 1, None)
        .with_strategy(StepStrategy::Scaled(GradientScaler::new(Precision::Amp)));
    let report = executor.execute(&model, &data, &mut scaled).unwrap();

    assert!(report.optimizer_stepped);
    assert_relative_eq!(plain.last_grad_norm(), scaled.last_grad_norm(), max_relative = 1e-4);
}

/// Runs one step per rank on its own batch and returns each rank's reported
/// pre-clip norm with the gradients its optimizer received.
fn run_group(
    batches: Vec<TokenBatch>,
    sharding: Sharding,
    grad_clip_norm: Option<f64>,
) -> Vec<(f64, Vec<Option<Vec<f32>>>)> {
    let handles: Vec<_> = LocalGroup::new(batches.len())
        .unwrap()
        .into_iter()
        .zip(batches)
        .map(|(collective, data)| {
            thread::spawn(move || {
                let collective: Arc<dyn Collective> = Arc::new(collective);
                let model = ModelHandle::Wrapped(DistributedModel::new(
                    bigram(VOCAB, 11),
                    collective,
                    sharding,
                ));
                let mut optimizer = RecordingOptimizer::new(model.parameters());
                let report = executor(9, 1, grad_clip_norm)
                    .execute(&model, &data, &mut optimizer)
                    .unwrap();
                (report.grad_norm, optimizer.last_grads)
            })
        })
        .collect();
    handles.into_iter().map(|handle| handle.join().unwrap()).collect()
}

#[test]
fn replicated_gradients_are_averaged_across_workers() {
    let first = batch(2, 9, VOCAB, 0);
    let second = batch(2, 9, VOCAB, 5);
    let combined = TokenBatch::new(
        first
            .rows()
            .iter()
            .chain(second.rows())
            .cloned()
            .collect(),
    )
    .unwrap();

    let model = ModelHandle::Plain(bigram(VOCAB, 11));
    let mut single = RecordingOptimizer::new(model.parameters());
    let reference = executor(9, 1, None)
        .execute(&model, &combined, &mut single)
        .unwrap();

    let ranks = run_group(vec![first, second], Sharding::Replicated, None);
    for (norm, grads) in &ranks {
        assert_relative_eq!(*norm, reference.grad_norm, max_relative = 1e-4);
        for (got, expected) in grads.iter().zip(&single.last_grads) {
            let (got, expected) = (got.as_ref().unwrap(), expected.as_ref().unwrap());
            for (x, y) in got.iter().zip(expected) {
                assert_relative_eq!(*x, *y, epsilon = 1e-5);
            }
        }
    }
}

#[test]
fn sharded_clipping_matches_replicated_norm() {
    let batches = || vec![batch(2, 9, VOCAB, 1), batch(2, 9, VOCAB, 4)];
    let max_norm = 1e-3;

    let replicated = run_group(batches(), Sharding::Replicated, Some(max_norm));
    let sharded = run_group(batches(), Sharding::Sharded, Some(max_norm));

    for ((replicated_norm, _), (sharded_norm, _)) in replicated.iter().zip(&sharded) {
        assert_relative_eq!(*replicated_norm, *sharded_norm, max_relative = 1e-4);
    }

    // Each rank only holds the gradients it owns; together they form the
    // clipped global gradient.
    let total_sq: f64 = sharded
        .iter()
        .flat_map(|(_, grads)| grads.iter().flatten())
        .flat_map(|grad| grad.iter())
        .map(|value| (*value as f64).powi(2))
        .sum();
    assert!(total_sq.sqrt() <= max_norm + 1e-6);
    for (rank, (_, grads)) in sharded.iter().enumerate() {
        for (index, grad) in grads.iter().enumerate() {
            assert_eq!(grad.is_some(), index % 2 == rank, "rank {rank} param {index}");
        }
    }
}

#[test]
fn clip_norm_helper_agrees_with_report() {
    let model = ModelHandle::Plain(bigram(VOCAB, 4));
    let mut optimizer = RecordingOptimizer::new(model.parameters());
    let report = executor(9, 1, None)
        .execute(&model, &batch(2, 9, VOCAB, 2), &mut optimizer)
        .unwrap();
    assert_relative_eq!(report.grad_norm, optimizer.last_grad_norm(), max_relative = 1e-4);

    let params = optimizer.params().to_vec();
    let loss = Precision::Fp32
        .autocast()
        .scope(|ctx| {
            let (inputs, targets) = batch(2, 9, VOCAB, 2).split(9, model.underlying().device())?;
            let logits = model.forward(&inputs, ctx)?;
            CrossEntropyLoss::new().compute(&logits, &targets)
        })
        .unwrap();
    let grads = loss.loss.backward().unwrap();
    let norm = global_grad_norm(&grads, &params, None).unwrap();
    assert_relative_eq!(norm, report.grad_norm, max_relative = 1e-4);
}
