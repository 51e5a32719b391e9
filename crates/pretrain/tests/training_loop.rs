mod common;

use std::{fs, sync::atomic::Ordering};

use approx::assert_relative_eq;
use pretrain::{
    checkpoint::{epoch_dir_name, LATEST_DIR},
    logging::{SinkSet, TrackingSink},
    InMemoryData, LanguageModel, ModelHandle, Optimizer, Precision, TrainData, Trainer,
    TrainingError,
};
use serde_json::Value;
use tempfile::tempdir;

use common::{batch, bigram, bigram_in, config, CountingModel, CountingScheduler};

const VOCAB: usize = 16;

fn train_data(batches: usize) -> InMemoryData {
    InMemoryData::new((0..batches).map(|i| batch(4, 9, VOCAB, i)).collect())
}

#[test]
fn skip_scheduler_never_consults_the_schedule() {
    let dir = tempdir().unwrap();
    let mut data = train_data(3);

    for (skip, expected_calls) in [(true, 0), (false, 3)] {
        let mut cfg = config(dir.path(), 9, 4, 1);
        cfg.scheduler.skip_scheduler = skip;
        let scheduler = CountingScheduler::new();
        let calls = scheduler.calls.clone();
        let steps = scheduler.steps.clone();
        let mut trainer = Trainer::new(cfg, ModelHandle::Plain(bigram(VOCAB, 1)), &data)
            .unwrap()
            .with_scheduler(Box::new(scheduler));

        let summary = trainer.train_one_epoch(&mut data, 2).unwrap();

        assert_eq!(summary.batches, 3);
        assert_eq!(calls.load(Ordering::SeqCst), expected_calls);
        if !skip {
            assert_eq!(*steps.lock().unwrap(), vec![6, 7, 8]);
        }
    }
    assert_eq!(data.epochs_seen(), &[2, 2]);
}

#[test]
fn epoch_steps_once_per_batch_and_logs_on_cadence() {
    let dir = tempdir().unwrap();
    let mut cfg = config(dir.path(), 9, 4, 1);
    cfg.runtime.log_every_n_steps = 2;
    cfg.logging.wandb = true;
    let mut data = train_data(5);
    let mut trainer = Trainer::new(cfg.clone(), ModelHandle::Plain(bigram(VOCAB, 1)), &data).unwrap();

    let summary = trainer.train_one_epoch(&mut data, 0).unwrap();

    assert_eq!(summary.batches, 5);
    assert_eq!(summary.optimizer_steps, 5);
    assert_eq!(summary.skipped_steps, 0);
    assert_eq!(summary.last_step, Some(4));
    // batches 0, 2 and 4 (the last one)
    assert_eq!(summary.records_emitted, 3);
    assert_eq!(trainer.optimizer().steps_taken(), 5);
    assert!(trainer.model().is_training());

    let contents = fs::read_to_string(cfg.logging.run_dir().join("tracking.jsonl")).unwrap();
    let rows: Vec<Value> = contents
        .lines()
        .map(|line| serde_json::from_str(line).unwrap())
        .collect();
    assert_eq!(rows.len(), 3);
    let last = &rows[2];
    assert_eq!(last["step"], 4);
    assert_eq!(last["tokens"], 5 * 4 * 9);
    for key in [
        "train/loss",
        "train/data_time",
        "train/batch_time",
        "train/samples_per_second",
        "train/samples_per_second_per_gpu",
        "train/lr",
        "train/tokens",
    ] {
        assert!(last.get(key).is_some(), "missing {key}");
    }
    assert!(last.get("train/logit_mean").is_none());
}

#[test]
fn evaluation_perplexity_is_exp_of_uniform_loss() {
    let dir = tempdir().unwrap();
    let mut cfg = config(dir.path(), 9, 4, 2);
    cfg.data.train_num_samples = Some(40);
    let train = train_data(2);
    let model = ModelHandle::Plain(CountingModel::new(VOCAB));
    let mut trainer = Trainer::new(cfg, model, &train).unwrap();
    let mut val = InMemoryData::new(vec![batch(4, 9, VOCAB, 0), batch(2, 9, VOCAB, 3)]);

    let summary = trainer.evaluate(&mut val, 3).unwrap();

    let uniform = (VOCAB as f64).ln();
    assert_relative_eq!(summary.average_loss, uniform, epsilon = 1e-5);
    assert_relative_eq!(summary.perplexity, VOCAB as f64, max_relative = 1e-4);
    assert_eq!(summary.batches, 2);
    assert_eq!(summary.tokens, 3 * 40 * 9);
    assert_eq!(val.epochs_seen(), &[3]);
    assert!(trainer.model().is_training());
}

#[test]
fn evaluation_restores_inference_mode_and_rejects_empty_streams() {
    let dir = tempdir().unwrap();
    let train = train_data(1);
    let model = CountingModel::new(VOCAB);
    model.set_training(false);
    let mut trainer =
        Trainer::new(config(dir.path(), 9, 4, 1), ModelHandle::Plain(model), &train).unwrap();

    let err = trainer
        .evaluate(&mut InMemoryData::new(Vec::new()), 1)
        .unwrap_err();
    assert!(matches!(err, TrainingError::Runtime(_)));
    assert!(!trainer.model().is_training());
}

#[test]
fn evaluation_weights_batches_by_tokens() {
    let dir = tempdir().unwrap();
    let train = train_data(1);
    let mut trainer = Trainer::new(
        config(dir.path(), 9, 4, 1),
        ModelHandle::Plain(bigram(VOCAB, 8)),
        &train,
    )
    .unwrap()
    .with_sinks(SinkSet::noop());

    let small = batch(1, 9, VOCAB, 2);
    let large = batch(5, 9, VOCAB, 6);
    let one = |trainer: &mut Trainer<_>, b| {
        trainer
            .evaluate(&mut InMemoryData::new(vec![b]), 1)
            .unwrap()
            .average_loss
    };
    let small_loss = one(&mut trainer, small.clone());
    let large_loss = one(&mut trainer, large.clone());
    let both = trainer
        .evaluate(&mut InMemoryData::new(vec![small, large]), 1)
        .unwrap();

    let expected = (small_loss * 8.0 + large_loss * 40.0) / 48.0;
    assert_relative_eq!(both.average_loss, expected, epsilon = 1e-5);
    assert_relative_eq!(both.perplexity, expected.exp(), max_relative = 1e-5);
}

#[test]
fn fit_checkpoints_and_resumes() {
    let dir = tempdir().unwrap();
    let mut cfg = config(dir.path(), 9, 4, 2);
    cfg.checkpoint.save_most_recent = true;
    cfg.checkpoint.delete_previous_checkpoint = true;
    let mut train = train_data(3);
    let mut val = InMemoryData::new(vec![batch(4, 9, VOCAB, 1)]);

    let mut trainer = Trainer::new(cfg.clone(), ModelHandle::Plain(bigram(VOCAB, 3)), &train).unwrap();
    let fit = trainer.fit(&mut train, Some(&mut val as &mut dyn TrainData)).unwrap();

    assert_eq!(fit.epochs.len(), 2);
    assert_eq!(fit.evaluations.len(), 2);
    assert_eq!(fit.evaluations[1].epoch, 2);
    let checkpoints = cfg.checkpoint_dir();
    assert!(!checkpoints.join(epoch_dir_name(1)).exists());
    assert!(checkpoints.join(epoch_dir_name(2)).exists());
    assert!(checkpoints.join(LATEST_DIR).exists());
    let trained: Vec<Vec<f32>> = trainer
        .model()
        .parameters()
        .iter()
        .map(|(_, var)| var.as_tensor().flatten_all().unwrap().to_vec1().unwrap())
        .collect();

    cfg.runtime.epochs = 3;
    cfg.checkpoint.resume = Some("latest".to_string());
    let mut resumed = Trainer::new(cfg, ModelHandle::Plain(bigram(VOCAB, 99)), &train).unwrap();
    let progress = resumed.resume("latest").unwrap().unwrap();
    assert_eq!(progress.completed_epochs, 2);
    assert_eq!(progress.global_step, 6);
    assert_eq!(resumed.start_epoch(), 2);
    assert_eq!(resumed.optimizer().steps_taken(), 6);
    let restored: Vec<Vec<f32>> = resumed
        .model()
        .parameters()
        .iter()
        .map(|(_, var)| var.as_tensor().flatten_all().unwrap().to_vec1().unwrap())
        .collect();
    assert_eq!(trained, restored);

    let fit = resumed.fit(&mut train, None).unwrap();
    assert_eq!(fit.epochs.len(), 1);
    assert_eq!(fit.epochs[0].epoch, 2);
    assert_eq!(fit.epochs[0].last_step, Some(8));
    assert!(!checkpoints.join(epoch_dir_name(2)).exists());
    assert!(checkpoints.join(epoch_dir_name(3)).exists());
}

#[test]
fn resume_from_empty_directory_starts_fresh() {
    let dir = tempdir().unwrap();
    let train = train_data(1);
    let mut trainer =
        Trainer::new(config(dir.path(), 9, 4, 1), ModelHandle::Plain(bigram(VOCAB, 1)), &train)
            .unwrap();
    assert!(trainer.resume("latest").unwrap().is_none());
    assert_eq!(trainer.start_epoch(), 0);
}

#[test]
fn tracking_sink_receives_validation_records() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("valid.jsonl");
    let train = train_data(1);
    let mut sinks = SinkSet::default();
    sinks.push(Box::new(TrackingSink::create(&path).unwrap()));
    let mut trainer = Trainer::new(
        config(dir.path(), 9, 4, 1),
        ModelHandle::Plain(CountingModel::new(VOCAB)),
        &train,
    )
    .unwrap()
    .with_sinks(sinks);

    trainer
        .evaluate(&mut InMemoryData::new(vec![batch(4, 9, VOCAB, 0)]), 1)
        .unwrap();

    let row: Value = serde_json::from_str(fs::read_to_string(&path).unwrap().trim()).unwrap();
    assert_eq!(row["step"], 1);
    assert!(row.get("valid/perplexity").is_some());
    assert!(row.get("valid/loss").is_some());
}

#[test]
fn empty_training_data_is_rejected() {
    let dir = tempdir().unwrap();
    let train = train_data(0);
    let err = match Trainer::new(
        config(dir.path(), 9, 4, 1),
        ModelHandle::Plain(bigram(VOCAB, 1)),
        &train,
    ) {
        Ok(_) => panic!("empty training data must be rejected"),
        Err(err) => err,
    };
    assert!(matches!(err, TrainingError::Initialization(_)));
}

#[test]
fn every_precision_mode_trains_or_is_refused_on_cpu() {
    let dir = tempdir().unwrap();
    for precision in [Precision::Fp32, Precision::Amp, Precision::Fp16] {
        let mut cfg = config(dir.path(), 9, 4, 1);
        cfg.runtime.precision = precision;
        let mut data = train_data(3);
        let model = ModelHandle::Plain(bigram_in(VOCAB, 4, precision));
        let mut trainer = Trainer::new(cfg, model, &data).unwrap();

        let summary = trainer.train_one_epoch(&mut data, 0).unwrap();

        assert_eq!(summary.batches, 3, "{precision}");
        assert_eq!(summary.optimizer_steps + summary.skipped_steps, 3, "{precision}");
        assert!(summary.average_loss.is_finite(), "{precision}");
    }

    for precision in [Precision::AmpBf16, Precision::Bf16] {
        let mut cfg = config(dir.path(), 9, 4, 1);
        cfg.runtime.precision = precision;
        let data = train_data(3);
        let model = ModelHandle::Plain(bigram_in(VOCAB, 4, precision));
        match Trainer::new(cfg, model, &data) {
            Ok(_) => panic!("{precision} must be refused on the cpu device"),
            Err(err) => assert!(err.is_configuration(), "{precision}: {err}"),
        }
    }
}
