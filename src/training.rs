//! Training loop for `LoRA` fine-tuning.
//!
//! This module provides:
//! - [`LoraTrainer`] - epoch/batch driver over a frozen [`BaseModel`]
//! - [`EpochTracker`] - best-loss and periodic checkpoint decisions
//! - [`EpochStats`] / [`TrainingReport`] - run bookkeeping
//! - [`CancellationToken`] - cooperative stop at batch boundaries
//!
//! # Training Architecture
//!
//! Base weights stay frozen. Only the adapter deltas on the logits are
//! trained, with one Adam step per batch:
//!
//! ```text
//!   tokens → [Base model (frozen)] → logits ─┐
//!   activations → [LoRA A] → [LoRA B] ───────┴→ adapted logits → CE loss
//!                    ↑ gradients flow
//! ```
//!
//! Only the target span of each sample is scored: positions
//! `input_len ..= len - 2`, each predicting `tokens[p + 1]`.

use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use candle_core::{Device, Tensor};
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::SeedableRng;

use crate::adapter::AdamParams;
use crate::adapter_set::AdapterSet;
use crate::config::{LoraConfig, TrainingConfig};
use crate::error::{LoraError, Result};
use crate::export::{save_adapter_with_metadata, AdapterMetadata};
use crate::model::{ActivationProvider, BaseModel, MockActivations};
use crate::sample::TrainingSample;

/// Probability floor applied before taking the log in the loss.
pub const LOSS_PROB_FLOOR: f32 = 1e-8;

/// Max-shifted softmax over a logits vector.
///
/// # Errors
/// Returns error if tensor operations fail.
pub fn softmax(logits: &[f32]) -> Result<Vec<f32>> {
    if logits.is_empty() {
        return Ok(Vec::new());
    }
    let logits = Tensor::from_slice(logits, logits.len(), &Device::Cpu)?;
    Ok(candle_nn::ops::softmax(&logits, 0)?.to_vec1::<f32>()?)
}

/// Cross-entropy of `target` under `softmax(logits)`, floored at
/// [`LOSS_PROB_FLOOR`] so the result is always finite.
///
/// # Errors
/// Returns error if `target` is outside the logits vector.
pub fn cross_entropy_loss(logits: &[f32], target: usize) -> Result<f32> {
    loss_from_probs(&softmax(logits)?, target)
}

/// `∂loss/∂logits = softmax(logits) - one_hot(target)`.
///
/// # Errors
/// Returns error if `target` is outside the logits vector.
pub fn cross_entropy_grad(logits: &[f32], target: usize) -> Result<Vec<f32>> {
    let mut probs = softmax(logits)?;
    check_target(probs.len(), target)?;
    probs[target] -= 1.0;
    Ok(probs)
}

fn check_target(vocab_size: usize, target: usize) -> Result<()> {
    if target >= vocab_size {
        return Err(LoraError::BaseModel(format!(
            "target token {target} outside vocabulary of {vocab_size}"
        )));
    }
    Ok(())
}

fn loss_from_probs(probs: &[f32], target: usize) -> Result<f32> {
    check_target(probs.len(), target)?;
    Ok(-probs[target].max(LOSS_PROB_FLOOR).ln())
}

/// Loss and logits gradient from a single softmax.
fn loss_and_grad(logits: &[f32], target: usize) -> Result<(f32, Vec<f32>)> {
    let mut probs = softmax(logits)?;
    let loss = loss_from_probs(&probs, target)?;
    probs[target] -= 1.0;
    Ok((loss, probs))
}

/// Shared flag for stopping a run between batches.
///
/// Clones observe the same flag, so a token handed to another thread can
/// stop a trainer running on this one.
#[derive(Debug, Clone, Default)]
pub struct CancellationToken {
    cancelled: Arc<AtomicBool>,
}

impl CancellationToken {
    /// Fresh, not-cancelled token.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Request cancellation.
    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::SeqCst);
    }

    /// Whether cancellation was requested.
    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::SeqCst)
    }
}

/// Which checkpoint a file is.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CheckpointKind {
    /// Interim checkpoint every `save_steps` global steps.
    Step(usize),
    /// Epoch mean loss improved (1-based epoch).
    Best(usize),
    /// Periodic epoch checkpoint (1-based epoch).
    Periodic(usize),
    /// Written once after the epoch loop.
    Final,
}

impl CheckpointKind {
    /// File name under the output directory.
    #[must_use]
    pub fn file_name(&self) -> String {
        match self {
            Self::Step(step) => format!("checkpoint-step-{step}.gguf"),
            Self::Best(epoch) => format!("best_adapter_epoch_{epoch}.gguf"),
            Self::Periodic(epoch) => format!("checkpoint_epoch_{epoch}.gguf"),
            Self::Final => "final_adapter.gguf".to_string(),
        }
    }
}

/// Outcome of one checkpoint write.
#[derive(Debug, Clone)]
pub struct CheckpointRecord {
    /// Checkpoint kind.
    pub kind: CheckpointKind,
    /// Target path.
    pub path: PathBuf,
    /// Error message if the write failed.
    pub error: Option<String>,
}

impl CheckpointRecord {
    /// Whether the file was written.
    #[must_use]
    pub fn is_saved(&self) -> bool {
        self.error.is_none()
    }
}

/// Checkpoint decisions taken at the end of an epoch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct EpochDecision {
    /// Write a best checkpoint.
    pub best: bool,
    /// Write a periodic checkpoint.
    pub periodic: bool,
}

/// Best-loss and periodic checkpoint logic, independent of any I/O.
///
/// ```rust
/// use lora_trainer::EpochTracker;
///
/// let mut tracker = EpochTracker::new(3);
/// let best: Vec<bool> = [1.0, 0.8, 0.9]
///     .iter()
///     .enumerate()
///     .map(|(e, &loss)| tracker.end_epoch(e + 1, loss).best)
///     .collect();
/// assert_eq!(best, vec![true, true, false]);
/// ```
#[derive(Debug, Clone)]
pub struct EpochTracker {
    periodic_interval: usize,
    best_loss: Option<f32>,
}

impl EpochTracker {
    /// Tracker for a run of `epochs` epochs.
    #[must_use]
    pub fn new(epochs: usize) -> Self {
        Self {
            periodic_interval: (epochs / 5).max(1),
            best_loss: None,
        }
    }

    /// Epochs between periodic checkpoints.
    #[must_use]
    pub fn periodic_interval(&self) -> usize {
        self.periodic_interval
    }

    /// Lowest epoch loss seen so far.
    #[must_use]
    pub fn best_loss(&self) -> Option<f32> {
        self.best_loss
    }

    /// Record the mean loss of 1-based `epoch`.
    ///
    /// A NaN loss never counts as an improvement.
    pub fn end_epoch(&mut self, epoch: usize, loss: f32) -> EpochDecision {
        let best = match self.best_loss {
            Some(best) => loss < best,
            None => !loss.is_nan(),
        };
        if best {
            self.best_loss = Some(loss);
        }
        EpochDecision {
            best,
            periodic: epoch % self.periodic_interval == 0,
        }
    }
}

/// Batch losses accumulated over one epoch.
#[derive(Debug, Clone, Copy, Default)]
pub struct EpochStats {
    loss_sum: f64,
    batches: usize,
    tokens_scored: usize,
}

impl EpochStats {
    /// Add one batch's loss and scored-position count.
    pub fn record(&mut self, batch_loss: f32, scored: usize) {
        self.loss_sum += f64::from(batch_loss);
        self.batches += 1;
        self.tokens_scored += scored;
    }

    /// Batches recorded so far.
    #[must_use]
    pub fn batches(&self) -> usize {
        self.batches
    }

    /// Scored positions recorded so far.
    #[must_use]
    pub fn tokens_scored(&self) -> usize {
        self.tokens_scored
    }

    /// Mean batch loss; NaN when no batch ran.
    #[must_use]
    #[allow(clippy::cast_possible_truncation, clippy::cast_precision_loss)]
    pub fn mean_loss(&self) -> f32 {
        if self.batches == 0 {
            f32::NAN
        } else {
            (self.loss_sum / self.batches as f64) as f32
        }
    }
}

/// Summary returned by [`LoraTrainer::train`].
#[derive(Debug, Clone, Default)]
pub struct TrainingReport {
    /// Mean batch loss per completed epoch (NaN for an epoch with no batches).
    pub epoch_losses: Vec<f32>,
    /// Global step count at the end of the run.
    pub global_steps: usize,
    /// Lowest epoch loss.
    pub best_loss: Option<f32>,
    /// Scored positions over the whole run.
    pub tokens_scored: usize,
    /// Every checkpoint attempted, in order.
    pub checkpoints: Vec<CheckpointRecord>,
    /// Whether the run stopped on a cancellation request.
    pub cancelled: bool,
}

impl TrainingReport {
    /// Checkpoints of kinds matching `predicate`.
    pub fn checkpoints_where<F>(&self, predicate: F) -> impl Iterator<Item = &CheckpointRecord>
    where
        F: Fn(&CheckpointKind) -> bool,
    {
        self.checkpoints.iter().filter(move |c| predicate(&c.kind))
    }

    /// Path of the final adapter, if it was written.
    #[must_use]
    pub fn final_adapter(&self) -> Option<&PathBuf> {
        self.checkpoints
            .iter()
            .find(|c| c.kind == CheckpointKind::Final && c.is_saved())
            .map(|c| &c.path)
    }
}

/// Tokenized sample with its scored range.
struct PreparedSample {
    tokens: Vec<u32>,
    first_position: usize,
    weight: f32,
}

impl PreparedSample {
    /// Positions `first_position ..= len - 2`.
    fn positions(&self) -> std::ops::Range<usize> {
        self.first_position..self.tokens.len() - 1
    }
}

/// Trainer for `LoRA` fine-tuning against a frozen base model.
///
/// Owns the [`AdapterSet`] and the global step counter. Checkpoints are
/// best-effort: a failed write is logged and recorded in the report, and
/// training continues with the in-memory weights intact.
pub struct LoraTrainer<'m, M: BaseModel + ?Sized, P: ActivationProvider> {
    model: &'m M,
    activations: P,
    lora_config: LoraConfig,
    config: TrainingConfig,
    adapters: AdapterSet,
    metadata: AdapterMetadata,
    global_step: usize,
    rng: StdRng,
    cancel: CancellationToken,
}

impl<'m, M: BaseModel + ?Sized> LoraTrainer<'m, M, MockActivations> {
    /// Trainer fed by seeded [`MockActivations`].
    ///
    /// # Errors
    /// Same as [`LoraTrainer::new`].
    pub fn with_mock_activations(
        model: &'m M,
        lora_config: LoraConfig,
        config: TrainingConfig,
    ) -> Result<Self> {
        let activations = MockActivations::new(config.seed)?;
        Self::new(model, activations, lora_config, config)
    }
}

impl<'m, M: BaseModel + ?Sized, P: ActivationProvider> LoraTrainer<'m, M, P> {
    /// Validate both configs, size the adapters from `model`, and create the
    /// output directory.
    ///
    /// # Errors
    /// Returns [`LoraError::InvalidConfig`] or [`LoraError::Configuration`] for
    /// bad configs and [`LoraError::Persistence`] if the output directory
    /// cannot be created.
    pub fn new(
        model: &'m M,
        activations: P,
        lora_config: LoraConfig,
        config: TrainingConfig,
    ) -> Result<Self> {
        config.validate()?;
        let adapters = AdapterSet::for_model(model, &lora_config)?;

        std::fs::create_dir_all(&config.output_dir)
            .map_err(|e| LoraError::persistence(&config.output_dir, e))?;

        if config.weight_decay != 0.0 || config.warmup_steps != 0 {
            tracing::warn!(
                weight_decay = config.weight_decay,
                warmup_steps = config.warmup_steps,
                "weight_decay and warmup_steps are accepted but not applied"
            );
        }

        Ok(Self {
            model,
            activations,
            rng: StdRng::seed_from_u64(config.seed),
            lora_config,
            config,
            adapters,
            metadata: AdapterMetadata::default(),
            global_step: 0,
            cancel: CancellationToken::new(),
        })
    }

    /// Stop training when `token` is cancelled.
    #[must_use]
    pub fn with_cancellation(mut self, token: CancellationToken) -> Self {
        self.cancel = token;
        self
    }

    /// Metadata written into every checkpoint.
    #[must_use]
    pub fn with_metadata(mut self, metadata: AdapterMetadata) -> Self {
        self.metadata = metadata;
        self
    }

    /// Token observed by this trainer.
    #[must_use]
    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Current adapters.
    #[must_use]
    pub fn adapters(&self) -> &AdapterSet {
        &self.adapters
    }

    /// Consume the trainer, keeping the adapters.
    #[must_use]
    pub fn into_adapters(self) -> AdapterSet {
        self.adapters
    }

    /// Optimizer steps taken so far.
    #[must_use]
    pub fn global_step(&self) -> usize {
        self.global_step
    }

    /// Adapter configuration.
    #[must_use]
    pub fn lora_config(&self) -> &LoraConfig {
        &self.lora_config
    }

    /// Training configuration.
    #[must_use]
    pub fn config(&self) -> &TrainingConfig {
        &self.config
    }

    fn adam_params(&self) -> AdamParams {
        AdamParams {
            learning_rate: self.config.learning_rate,
            beta1: self.config.beta1,
            beta2: self.config.beta2,
            epsilon: self.config.epsilon,
        }
    }

    /// Run every epoch over `samples`, then write the final adapter.
    ///
    /// The caller's slice is never reordered; each epoch shuffles a copy.
    ///
    /// # Errors
    /// Returns error if the base model, activation provider or adapter math
    /// fails. Checkpoint write failures are not errors.
    pub fn train(&mut self, samples: &[TrainingSample]) -> Result<TrainingReport> {
        tracing::info!(
            samples = samples.len(),
            epochs = self.config.epochs,
            batch_size = self.config.batch_size,
            learning_rate = self.config.learning_rate,
            rank = self.lora_config.rank,
            alpha = self.lora_config.alpha,
            modules = self.adapters.len(),
            parameters = self.adapters.num_parameters(),
            "starting LoRA training"
        );

        let mut tracker = EpochTracker::new(self.config.epochs);
        let mut report = TrainingReport::default();

        'epochs: for epoch in 1..=self.config.epochs {
            let mut shuffled = samples.to_vec();
            shuffled.shuffle(&mut self.rng);
            let mut stats = EpochStats::default();

            for batch in shuffled.chunks(self.config.batch_size) {
                if self.cancel.is_cancelled() {
                    tracing::warn!(epoch, step = self.global_step, "training cancelled");
                    report.cancelled = true;
                    break 'epochs;
                }

                let (batch_loss, scored) = self.train_batch(batch)?;
                stats.record(batch_loss, scored);
                report.tokens_scored += scored;

                let step = self.global_step;
                if step % self.config.log_every == 0 {
                    tracing::info!(step, loss = batch_loss, "training step");
                }
                if step % self.config.save_steps == 0 {
                    self.write_checkpoint(CheckpointKind::Step(step), &mut report);
                }
            }

            let epoch_loss = stats.mean_loss();
            report.epoch_losses.push(epoch_loss);
            tracing::info!(
                epoch,
                epochs = self.config.epochs,
                loss = epoch_loss,
                batches = stats.batches(),
                tokens = stats.tokens_scored(),
                "epoch completed"
            );

            let decision = tracker.end_epoch(epoch, epoch_loss);
            if decision.best {
                tracing::info!(epoch, loss = epoch_loss, "new best loss");
                self.write_checkpoint(CheckpointKind::Best(epoch), &mut report);
            }
            if decision.periodic {
                self.write_checkpoint(CheckpointKind::Periodic(epoch), &mut report);
            }
        }

        self.write_checkpoint(CheckpointKind::Final, &mut report);

        report.global_steps = self.global_step;
        report.best_loss = tracker.best_loss();
        tracing::info!(
            steps = report.global_steps,
            best_loss = ?report.best_loss,
            cancelled = report.cancelled,
            "training finished"
        );
        Ok(report)
    }

    /// One optimizer step over `batch`.
    ///
    /// Returns the weighted batch loss and the number of scored positions.
    /// Samples without scored positions are skipped; a batch where nothing
    /// is scored has loss 0 but still advances the step.
    ///
    /// # Errors
    /// Returns error if the base model or adapter math fails.
    pub fn train_batch(&mut self, batch: &[TrainingSample]) -> Result<(f32, usize)> {
        let mut prepared = Vec::with_capacity(batch.len());
        for sample in batch {
            if let Some(p) = self.prepare(sample)? {
                prepared.push(p);
            }
        }

        let total_weight: f32 = prepared.iter().map(|p| p.weight).sum();
        let mut weighted_loss = 0.0f32;
        let mut scored = 0usize;
        if total_weight > 0.0 {
            for sample in &prepared {
                let positions = sample.positions().len();
                #[allow(clippy::cast_precision_loss)]
                let grad_scale = sample.weight / (total_weight * positions as f32);
                let loss = self.score(sample, true, Some(grad_scale))?;
                weighted_loss += sample.weight * loss;
                scored += positions;
            }
        }
        let batch_loss = if total_weight > 0.0 {
            weighted_loss / total_weight
        } else {
            0.0
        };

        let step = self.global_step + 1;
        self.adapters.update(&self.adam_params(), step)?;
        self.global_step = step;
        tracing::debug!(step, loss = batch_loss, scored, "batch processed");
        Ok((batch_loss, scored))
    }

    /// Weighted mean loss over `samples` with adapters in inference mode.
    ///
    /// No gradients are accumulated and no step is taken. Returns `None` when
    /// no sample has a scored position.
    ///
    /// # Errors
    /// Returns error if the base model or adapter math fails.
    pub fn evaluate(&mut self, samples: &[TrainingSample]) -> Result<Option<f32>> {
        let mut weighted_loss = 0.0f32;
        let mut total_weight = 0.0f32;
        for sample in samples {
            if let Some(prepared) = self.prepare(sample)? {
                let loss = self.score(&prepared, false, None)?;
                weighted_loss += prepared.weight * loss;
                total_weight += prepared.weight;
            }
        }
        Ok((total_weight > 0.0).then(|| weighted_loss / total_weight))
    }

    /// Tokenize and locate the target span; `None` if nothing is scored.
    fn prepare(&self, sample: &TrainingSample) -> Result<Option<PreparedSample>> {
        let mut tokens = self.model.encode(&sample.full_text())?;
        tokens.truncate(self.lora_config.max_sequence_length);
        if tokens.len() < 2 {
            return Ok(None);
        }
        let first_position = self.model.encode(sample.input())?.len();
        if first_position >= tokens.len() - 1 {
            return Ok(None);
        }
        Ok(Some(PreparedSample {
            tokens,
            first_position,
            weight: sample.weight(),
        }))
    }

    /// Mean loss over the scored positions of `sample`.
    ///
    /// With `grad_scale`, the logits gradient of every position is scaled
    /// and pushed into the adapters.
    fn score(&mut self, sample: &PreparedSample, training: bool, grad_scale: Option<f32>) -> Result<f32> {
        let alpha = self.lora_config.alpha;
        let dropout = self.lora_config.dropout;
        let mut total = 0.0f32;
        let positions = sample.positions();
        let count = positions.len();

        for position in positions {
            let base_logits = self.model.logits_at(&sample.tokens, position)?;
            let target = sample.tokens[position + 1] as usize;

            let mut activations = Vec::with_capacity(self.adapters.len());
            for module in self.adapters.iter() {
                activations.push(self.activations.activation(
                    module.name(),
                    module.in_features(),
                    &sample.tokens,
                    position,
                )?);
            }

            let adapted = self.adapters.apply_to_logits(
                &base_logits,
                &activations,
                alpha,
                training,
                dropout,
                &mut self.rng,
            )?;
            let (loss, mut grad) = loss_and_grad(&adapted.logits, target)?;
            total += loss;

            if let Some(scale) = grad_scale {
                for g in &mut grad {
                    *g *= scale;
                }
                self.adapters.backward(&adapted, &grad, alpha)?;
            }
        }

        #[allow(clippy::cast_precision_loss)]
        Ok(total / count as f32)
    }

    fn write_checkpoint(&self, kind: CheckpointKind, report: &mut TrainingReport) {
        let path = self.config.output_dir.join(kind.file_name());
        let result = save_adapter_with_metadata(
            &self.adapters,
            self.lora_config.alpha,
            &self.metadata,
            &path,
        );
        let error = match result {
            Ok(()) => {
                tracing::info!(path = %path.display(), ?kind, "checkpoint saved");
                None
            }
            Err(e) => {
                tracing::error!(path = %path.display(), ?kind, error = %e, "checkpoint write failed, continuing");
                Some(e.to_string())
            }
        };
        report.checkpoints.push(CheckpointRecord { kind, path, error });
    }
}
