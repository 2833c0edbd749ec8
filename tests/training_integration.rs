//! Integration tests for the LoRA training loop and adapter files.
//!
//! Tests cover:
//! - Masked-span scoring and the skipped-sample edge cases
//! - Seeded single-step determinism
//! - Checkpoint cadence, best-effort writes and cancellation
//! - GGUF round trip and tensor ordering

use std::cell::Cell;
use std::fs;

use candle_core::{Device, Tensor};
use lora_trainer::{
    declared_tensors, encode_adapter, load_adapter, read_container, ActivationProvider, AdapterMetadata,
    AdapterModule, AdapterSet, BaseModel, CancellationToken, CheckpointKind, LoraConfig,
    LoraError, LoraTrainer, MockActivations, Result, TrainingConfig, TrainingSample,
};

const VOCAB: usize = 64;

/// Byte tokenizer folded into a 64-token vocabulary with uniform logits.
struct ToyModel {
    layers: usize,
    dim: usize,
}

impl ToyModel {
    fn new(layers: usize) -> Self {
        Self { layers, dim: VOCAB }
    }
}

impl BaseModel for ToyModel {
    fn encode(&self, text: &str) -> Result<Vec<u32>> {
        Ok(text.bytes().map(|b| u32::from(b) % VOCAB as u32).collect())
    }

    fn logits_at(&self, _tokens: &[u32], _position: usize) -> Result<Vec<f32>> {
        Ok(vec![0.0; VOCAB])
    }

    fn layer_count(&self) -> usize {
        self.layers
    }

    fn model_dim(&self) -> usize {
        self.dim
    }
}

/// Toy vocabulary whose logits make each successive call score a scripted loss
/// on `target`. Paired with zero activations the adapters add nothing, so a
/// single-position epoch reports exactly the scripted value.
struct ScriptedLossModel {
    target: usize,
    losses: Vec<f32>,
    calls: Cell<usize>,
}

impl BaseModel for ScriptedLossModel {
    fn encode(&self, text: &str) -> Result<Vec<u32>> {
        ToyModel::new(1).encode(text)
    }

    #[allow(clippy::cast_precision_loss)]
    fn logits_at(&self, _tokens: &[u32], _position: usize) -> Result<Vec<f32>> {
        let call = self.calls.get();
        self.calls.set(call + 1);
        let loss = self.losses[call.min(self.losses.len() - 1)];
        // softmax puts p on `target` when its logit is ln((V-1)·p/(1-p)).
        let p = (-loss).exp();
        let mut logits = vec![0.0; VOCAB];
        logits[self.target] = ((VOCAB - 1) as f32 * p / (1.0 - p)).ln();
        Ok(logits)
    }

    fn layer_count(&self) -> usize {
        1
    }

    fn model_dim(&self) -> usize {
        VOCAB
    }
}

/// Same activation for every module and position.
struct ConstantActivations(f32);

impl ActivationProvider for ConstantActivations {
    fn activation(
        &mut self,
        _module_name: &str,
        in_features: usize,
        _tokens: &[u32],
        _position: usize,
    ) -> Result<Vec<f32>> {
        Ok(vec![self.0; in_features])
    }
}

fn q_only(rank: usize, alpha: f32) -> LoraConfig {
    LoraConfig::default()
        .with_rank(rank)
        .with_alpha(alpha)
        .with_target_modules(["q_proj"])
}

fn training(dir: &std::path::Path) -> TrainingConfig {
    TrainingConfig::default()
        .with_epochs(1)
        .with_batch_size(1)
        .with_output_dir(dir)
        .with_seed(42)
}

fn flat(t: &Tensor) -> Vec<f32> {
    t.flatten_all().unwrap().to_vec1::<f32>().unwrap()
}

fn bits(t: &Tensor) -> Vec<u32> {
    flat(t).iter().map(|v| v.to_bits()).collect()
}

#[test]
fn test_empty_target_is_noop() {
    let dir = tempfile::tempdir().unwrap();
    let model = ToyModel::new(1);
    let mut trainer = LoraTrainer::with_mock_activations(&model, q_only(4, 8.0), training(dir.path())).unwrap();

    let (loss, scored) = trainer
        .train_batch(&[TrainingSample::new("hello", "")])
        .unwrap();
    assert_eq!(scored, 0);
    assert!(loss.abs() < f32::EPSILON);
    assert_eq!(trainer.global_step(), 1);

    let module = trainer.adapters().iter().next().unwrap();
    assert!(flat(module.weights().1).iter().all(|&v| v == 0.0));
}

#[test]
fn test_short_sample_is_skipped() {
    let dir = tempfile::tempdir().unwrap();
    let model = ToyModel::new(1);
    let mut trainer = LoraTrainer::with_mock_activations(&model, q_only(4, 8.0), training(dir.path())).unwrap();

    let (_, scored) = trainer.train_batch(&[TrainingSample::new("", "x")]).unwrap();
    assert_eq!(scored, 0);
}

#[test]
fn test_only_target_span_is_scored() {
    let dir = tempfile::tempdir().unwrap();
    let model = ToyModel::new(1);
    let mut trainer = LoraTrainer::with_mock_activations(&model, q_only(4, 8.0), training(dir.path())).unwrap();

    // 5 tokens, input covers 2: positions 2 and 3 predict tokens 3 and 4.
    let (loss, scored) = trainer
        .train_batch(&[TrainingSample::new("ab", "cde")])
        .unwrap();
    assert_eq!(scored, 2);
    // B starts at zero, so the first forward sees uniform logits.
    assert!((loss - (VOCAB as f32).ln()).abs() < 1e-4);
}

#[test]
fn test_max_sequence_length_truncates() {
    let dir = tempfile::tempdir().unwrap();
    let model = ToyModel::new(1);
    let sample = TrainingSample::new("ab", "cdef");

    let mut short =
        LoraTrainer::with_mock_activations(&model, q_only(4, 8.0).with_max_sequence_length(3), training(dir.path()))
            .unwrap();
    assert_eq!(short.train_batch(&[sample.clone()]).unwrap().1, 0);

    let mut longer =
        LoraTrainer::with_mock_activations(&model, q_only(4, 8.0).with_max_sequence_length(4), training(dir.path()))
            .unwrap();
    assert_eq!(longer.train_batch(&[sample]).unwrap().1, 1);
}

#[test]
fn test_zero_weight_batch_has_zero_loss() {
    let dir = tempfile::tempdir().unwrap();
    let model = ToyModel::new(1);
    let mut trainer = LoraTrainer::with_mock_activations(&model, q_only(4, 8.0), training(dir.path())).unwrap();

    let (loss, scored) = trainer
        .train_batch(&[TrainingSample::new("ab", "cde").with_weight(0.0)])
        .unwrap();
    assert!(loss.abs() < f32::EPSILON);
    assert_eq!(scored, 0);
}

#[test]
fn test_invalid_weights_do_not_poison_batch() {
    let dir = tempfile::tempdir().unwrap();
    let model = ToyModel::new(1);
    for bad in [f32::NAN, -1.0, f32::INFINITY] {
        let config = training(dir.path()).with_learning_rate(1e-2);
        let mut trainer = LoraTrainer::with_mock_activations(&model, q_only(4, 8.0), config).unwrap();
        let (loss, _) = trainer
            .train_batch(&[
                TrainingSample::new("ab", "cde"),
                TrainingSample::new("ab", "cde").with_weight(bad),
            ])
            .unwrap();
        assert!((loss - (VOCAB as f32).ln()).abs() < 1e-4, "weight {bad} gave loss {loss}");

        let module = trainer.adapters().iter().next().unwrap();
        let b = flat(module.weights().1);
        assert!(b.iter().all(|v| v.is_finite()));
        assert!(b.iter().any(|&v| v != 0.0));
    }
}

fn single_step(target: &str) -> (Vec<u32>, Vec<u32>) {
    let dir = tempfile::tempdir().unwrap();
    let model = ToyModel::new(1);
    let config = training(dir.path()).with_learning_rate(1e-2);
    let mut trainer = LoraTrainer::with_mock_activations(&model, q_only(4, 8.0), config).unwrap();
    trainer.train_batch(&[TrainingSample::new("a", target)]).unwrap();
    assert_eq!(trainer.global_step(), 1);
    let module = trainer.adapters().iter().next().unwrap();
    (bits(module.weights().0), bits(module.weights().1))
}

#[test]
fn test_single_step_determinism() {
    assert_eq!(single_step("b"), single_step("b"));

    let first = single_step("bcd");
    assert_eq!(first, single_step("bcd"));
    // A scored target moves B off zero.
    assert!(first.1.iter().any(|&v| f32::from_bits(v) != 0.0));
}

#[test]
fn test_checkpoint_cadence() {
    let dir = tempfile::tempdir().unwrap();
    let model = ToyModel::new(1);
    let config = training(dir.path()).with_epochs(3).with_save_steps(2);
    let mut trainer = LoraTrainer::with_mock_activations(&model, q_only(2, 4.0), config).unwrap();

    let samples: Vec<TrainingSample> = ["one", "two", "six"]
        .iter()
        .map(|s| TrainingSample::new("> ", *s))
        .collect();
    let before = samples.clone();
    let report = trainer.train(&samples).unwrap();
    assert_eq!(samples, before);

    assert_eq!(report.global_steps, 9);
    assert_eq!(report.epoch_losses.len(), 3);
    assert!(!report.cancelled);
    assert!(report.checkpoints.iter().all(|c| c.is_saved()));

    for name in [
        "checkpoint-step-2.gguf",
        "checkpoint-step-4.gguf",
        "checkpoint-step-6.gguf",
        "checkpoint-step-8.gguf",
        "best_adapter_epoch_1.gguf",
        "checkpoint_epoch_1.gguf",
        "checkpoint_epoch_2.gguf",
        "checkpoint_epoch_3.gguf",
        "final_adapter.gguf",
    ] {
        assert!(dir.path().join(name).exists(), "missing {name}");
    }
    assert!(!dir.path().join("checkpoint-step-9.gguf").exists());

    let mut lowest = f32::INFINITY;
    let improving: Vec<usize> = report
        .epoch_losses
        .iter()
        .enumerate()
        .filter(|&(_, &loss)| {
            let better = loss < lowest;
            lowest = lowest.min(loss);
            better
        })
        .map(|(i, _)| i + 1)
        .collect();
    let best: Vec<usize> = report
        .checkpoints_where(|k| matches!(k, CheckpointKind::Best(_)))
        .filter_map(|c| match c.kind {
            CheckpointKind::Best(epoch) => Some(epoch),
            _ => None,
        })
        .collect();
    assert_eq!(best, improving);
    assert_eq!(report.final_adapter(), Some(&dir.path().join("final_adapter.gguf")));
}

#[test]
fn test_best_checkpoint_only_on_improvement() {
    let dir = tempfile::tempdir().unwrap();
    // "a" + "bc": one scored position predicting 'c'.
    let model = ScriptedLossModel {
        target: usize::from(b'c') % VOCAB,
        losses: vec![1.0, 0.8, 0.9],
        calls: Cell::new(0),
    };
    let config = training(dir.path()).with_epochs(3);
    let mut trainer =
        LoraTrainer::new(&model, ConstantActivations(0.0), q_only(2, 4.0), config).unwrap();
    let report = trainer.train(&[TrainingSample::new("a", "bc")]).unwrap();

    assert_eq!(report.epoch_losses.len(), 3);
    for (got, want) in report.epoch_losses.iter().zip([1.0f32, 0.8, 0.9]) {
        assert!((got - want).abs() < 1e-4, "epoch loss {got}, expected {want}");
    }
    let best: Vec<&CheckpointKind> = report
        .checkpoints_where(|k| matches!(k, CheckpointKind::Best(_)))
        .map(|c| &c.kind)
        .collect();
    assert_eq!(best, vec![&CheckpointKind::Best(1), &CheckpointKind::Best(2)]);
    assert!(dir.path().join("best_adapter_epoch_1.gguf").exists());
    assert!(dir.path().join("best_adapter_epoch_2.gguf").exists());
    assert!(!dir.path().join("best_adapter_epoch_3.gguf").exists());
    assert!((report.best_loss.unwrap() - 0.8).abs() < 1e-4);
}

#[test]
fn test_final_adapter_round_trip() {
    let dir = tempfile::tempdir().unwrap();
    let model = ToyModel::new(2);
    let lora = LoraConfig::preset_qv(4, 8.0);
    let config = training(dir.path()).with_epochs(2).with_learning_rate(1e-2);
    let mut trainer = LoraTrainer::with_mock_activations(&model, lora, config).unwrap();
    let report = trainer
        .train(&[TrainingSample::new("x=", "42"), TrainingSample::new("y=", "17")])
        .unwrap();

    let loaded = load_adapter(report.final_adapter().unwrap()).unwrap();
    assert!((loaded.alpha - 8.0).abs() < f32::EPSILON);
    assert_eq!(loaded.adapters.len(), 4);
    for (trained, reloaded) in trainer.adapters().iter().zip(loaded.adapters.iter()) {
        assert_eq!(trained.name(), reloaded.name());
        assert_eq!(trained.weights().0.dims(), reloaded.weights().0.dims());
        assert_eq!(trained.weights().1.dims(), reloaded.weights().1.dims());
        assert_eq!(bits(trained.weights().0), bits(reloaded.weights().0));
        assert_eq!(bits(trained.weights().1), bits(reloaded.weights().1));
    }
}

#[test]
fn test_container_ordering() {
    let device = Device::Cpu;
    let m1 = AdapterModule::from_weights(
        "m1",
        Tensor::new(&[[1.0f32, 2.0, 3.0]], &device).unwrap(),
        Tensor::new(&[[4.0f32], [5.0]], &device).unwrap(),
    )
    .unwrap();
    let m2 = AdapterModule::from_weights(
        "m2",
        Tensor::new(&[[6.0f32, 7.0, 8.0]], &device).unwrap(),
        Tensor::new(&[[9.0f32], [10.0]], &device).unwrap(),
    )
    .unwrap();
    let set = AdapterSet::from_modules([m1, m2]).unwrap();

    let bytes = encode_adapter(&set, 2.0, &AdapterMetadata::default()).unwrap();
    let content = read_container(&mut std::io::Cursor::new(&bytes)).unwrap();
    let tensors = declared_tensors(&content);
    let names: Vec<&str> = tensors.iter().map(|(name, _)| *name).collect();
    assert_eq!(names, vec!["m1.lora_a", "m1.lora_b", "m2.lora_a", "m2.lora_b"]);

    let expected: [&[f32]; 4] = [&[1.0, 2.0, 3.0], &[4.0, 5.0], &[6.0, 7.0, 8.0], &[9.0, 10.0]];
    for ((name, info), want) in tensors.iter().zip(expected) {
        let start = usize::try_from(content.tensor_data_offset + info.offset).unwrap();
        let got: Vec<f32> = bytes[start..start + want.len() * 4]
            .chunks_exact(4)
            .map(|c| f32::from_le_bytes([c[0], c[1], c[2], c[3]]))
            .collect();
        assert_eq!(got, want, "data mismatch for {name}");
    }
}

#[test]
fn test_failed_step_checkpoint_does_not_stop_training() {
    let dir = tempfile::tempdir().unwrap();
    let blocked = dir.path().join("checkpoint-step-1.gguf");
    fs::create_dir(&blocked).unwrap();
    fs::write(blocked.join("keep"), b"x").unwrap();

    let model = ToyModel::new(1);
    let config = training(dir.path()).with_save_steps(1);
    let mut trainer = LoraTrainer::with_mock_activations(&model, q_only(2, 4.0), config).unwrap();
    let samples: Vec<TrainingSample> = ["xy", "yz", "zx"]
        .iter()
        .map(|s| TrainingSample::new("> ", *s))
        .collect();
    let report = trainer.train(&samples).unwrap();

    assert_eq!(report.global_steps, 3);
    assert_eq!(trainer.global_step(), 3);
    assert!(dir.path().join("checkpoint-step-2.gguf").is_file());
    assert!(dir.path().join("checkpoint-step-3.gguf").is_file());

    let steps: Vec<_> = report
        .checkpoints_where(|k| matches!(k, CheckpointKind::Step(_)))
        .collect();
    assert_eq!(steps.len(), 3);
    assert_eq!(steps[0].kind, CheckpointKind::Step(1));
    assert!(!steps[0].is_saved());
    assert!(steps[0].error.is_some());
    assert!(steps[1..].iter().all(|c| c.is_saved()));
    assert!(report.final_adapter().is_some());
}

#[test]
fn test_failed_checkpoint_does_not_stop_training() {
    let dir = tempfile::tempdir().unwrap();
    // A non-empty directory where the final adapter should go.
    let blocked = dir.path().join("final_adapter.gguf");
    fs::create_dir(&blocked).unwrap();
    fs::write(blocked.join("keep"), b"x").unwrap();

    let model = ToyModel::new(1);
    let mut trainer =
        LoraTrainer::with_mock_activations(&model, q_only(2, 4.0), training(dir.path()).with_epochs(2)).unwrap();
    let report = trainer.train(&[TrainingSample::new("a", "bcd")]).unwrap();

    assert_eq!(report.global_steps, 2);
    assert!(report.final_adapter().is_none());
    let final_record = report.checkpoints.last().unwrap();
    assert_eq!(final_record.kind, CheckpointKind::Final);
    assert!(final_record.error.is_some());
    assert!(dir.path().join("best_adapter_epoch_1.gguf").exists());
}

#[test]
fn test_cancelled_run_still_writes_final() {
    let dir = tempfile::tempdir().unwrap();
    let model = ToyModel::new(1);
    let token = CancellationToken::new();
    let mut trainer = LoraTrainer::with_mock_activations(&model, q_only(2, 4.0), training(dir.path()))
        .unwrap()
        .with_cancellation(token.clone());
    token.cancel();

    let report = trainer.train(&[TrainingSample::new("a", "bcd")]).unwrap();
    assert!(report.cancelled);
    assert_eq!(report.global_steps, 0);
    assert!(report.epoch_losses.is_empty());
    assert!(dir.path().join("final_adapter.gguf").exists());
}

#[test]
fn test_loss_decreases_with_fixed_activations() {
    let dir = tempfile::tempdir().unwrap();
    let model = ToyModel::new(1);
    let config = training(dir.path())
        .with_epochs(20)
        .with_learning_rate(5e-2)
        .with_save_steps(1000);
    let mut trainer = LoraTrainer::new(
        &model,
        ConstantActivations(0.5),
        q_only(4, 8.0).with_dropout(0.0),
        config,
    )
    .unwrap();

    let report = trainer.train(&[TrainingSample::new("a", "bcd")]).unwrap();
    let first = report.epoch_losses[0];
    let last = *report.epoch_losses.last().unwrap();
    assert!(last < first, "loss did not decrease: {first} -> {last}");
    assert!(report.best_loss.unwrap() <= last);
}

#[test]
fn test_evaluate_does_not_step() {
    let dir = tempfile::tempdir().unwrap();
    let model = ToyModel::new(1);
    let mut trainer = LoraTrainer::new(
        &model,
        MockActivations::new(3).unwrap(),
        q_only(2, 4.0),
        training(dir.path()),
    )
    .unwrap();

    let loss = trainer
        .evaluate(&[TrainingSample::new("a", "bcd"), TrainingSample::new("a", "")])
        .unwrap()
        .unwrap();
    assert!((loss - (VOCAB as f32).ln()).abs() < 1e-4);
    assert_eq!(trainer.global_step(), 0);
    assert!(trainer.evaluate(&[TrainingSample::new("abc", "")]).unwrap().is_none());
}

#[test]
fn test_trainer_rejects_mismatched_projection() {
    struct Narrow;
    impl BaseModel for Narrow {
        fn encode(&self, text: &str) -> Result<Vec<u32>> {
            Ok(text.bytes().map(u32::from).collect())
        }
        fn logits_at(&self, _tokens: &[u32], _position: usize) -> Result<Vec<f32>> {
            Ok(vec![0.0; 8])
        }
        fn layer_count(&self) -> usize {
            1
        }
        fn model_dim(&self) -> usize {
            8
        }
        fn projection_dims(&self, _layer: usize, _projection: &str) -> Option<(usize, usize)> {
            Some((8, 4))
        }
    }

    let dir = tempfile::tempdir().unwrap();
    let result = LoraTrainer::with_mock_activations(&Narrow, q_only(2, 4.0), training(dir.path()));
    assert!(matches!(
        result,
        Err(LoraError::Configuration { expected: 8, actual: 4, .. })
    ));
}

#[test]
fn test_trainer_creates_output_dir() {
    let dir = tempfile::tempdir().unwrap();
    let out = dir.path().join("runs/first");
    let model = ToyModel::new(1);
    let _trainer = LoraTrainer::with_mock_activations(&model, q_only(2, 4.0), training(&out)).unwrap();
    assert!(out.is_dir());
}
