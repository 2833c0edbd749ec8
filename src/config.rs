//! Adapter and training configuration.
//!
//! Both configs are plain serde structs with reference defaults. Ranges are
//! checked by `validate()` before a trainer is built, so a bad value fails
//! before any adapter memory is allocated.

use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use crate::error::{LoraError, Result};

/// Configuration for the low-rank adapters.
///
/// # Example
///
/// ```rust
/// use lora_trainer::LoraConfig;
///
/// let config = LoraConfig::preset_qv(8, 16.0).with_dropout(0.0);
/// assert_eq!(config.target_modules, vec!["q_proj", "v_proj"]);
/// assert!(config.validate().is_ok());
/// ```
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LoraConfig {
    /// Rank `r` shared by A and B.
    pub rank: usize,
    /// Scalar applied to `B · A · x`.
    pub alpha: f32,
    /// Inverted-dropout rate applied to adapter inputs while training.
    #[serde(default)]
    pub dropout: f32,
    /// Projection names to adapt (`q_proj`, `v_proj`, ...).
    #[serde(default = "default_target_modules")]
    pub target_modules: Vec<String>,
    /// Tokenized samples are truncated to this many tokens.
    #[serde(default = "default_max_sequence_length")]
    pub max_sequence_length: usize,
    /// Seed for A initialization and dropout masks.
    #[serde(default)]
    pub seed: u64,
}

fn default_target_modules() -> Vec<String> {
    vec![
        "q_proj".into(),
        "k_proj".into(),
        "v_proj".into(),
        "o_proj".into(),
    ]
}

fn default_max_sequence_length() -> usize {
    2048
}

impl Default for LoraConfig {
    fn default() -> Self {
        Self {
            rank: 16,
            alpha: 32.0,
            dropout: 0.1,
            target_modules: default_target_modules(),
            max_sequence_length: default_max_sequence_length(),
            seed: 0,
        }
    }
}

impl LoraConfig {
    /// Create preset targeting only the attention Q/V projections.
    #[must_use]
    pub fn preset_qv(rank: usize, alpha: f32) -> Self {
        Self {
            rank,
            alpha,
            target_modules: vec!["q_proj".into(), "v_proj".into()],
            ..Default::default()
        }
    }

    /// Set the rank.
    #[must_use]
    pub fn with_rank(mut self, rank: usize) -> Self {
        self.rank = rank;
        self
    }

    /// Set alpha.
    #[must_use]
    pub fn with_alpha(mut self, alpha: f32) -> Self {
        self.alpha = alpha;
        self
    }

    /// Set the dropout rate.
    #[must_use]
    pub fn with_dropout(mut self, dropout: f32) -> Self {
        self.dropout = dropout;
        self
    }

    /// Set the target projections.
    #[must_use]
    pub fn with_target_modules<I, S>(mut self, modules: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.target_modules = modules.into_iter().map(Into::into).collect();
        self
    }

    /// Set the maximum tokenized sequence length.
    #[must_use]
    pub fn with_max_sequence_length(mut self, max_sequence_length: usize) -> Self {
        self.max_sequence_length = max_sequence_length;
        self
    }

    /// Set the initialization/dropout seed.
    #[must_use]
    pub fn with_seed(mut self, seed: u64) -> Self {
        self.seed = seed;
        self
    }

    /// Validate ranges.
    ///
    /// # Errors
    /// Returns [`LoraError::InvalidConfig`] naming the first offending field.
    pub fn validate(&self) -> Result<()> {
        if self.rank == 0 {
            return Err(LoraError::InvalidConfig("LoRA rank must be > 0".into()));
        }
        if !(self.alpha.is_finite() && self.alpha > 0.0) {
            return Err(LoraError::InvalidConfig(format!(
                "LoRA alpha must be > 0, got {}",
                self.alpha
            )));
        }
        if !(0.0..1.0).contains(&self.dropout) {
            return Err(LoraError::InvalidConfig(format!(
                "dropout must be in [0, 1), got {}",
                self.dropout
            )));
        }
        if self.target_modules.is_empty() {
            return Err(LoraError::InvalidConfig(
                "At least one target module required".into(),
            ));
        }
        if self.max_sequence_length == 0 {
            return Err(LoraError::InvalidConfig(
                "max_sequence_length must be > 0".into(),
            ));
        }
        Ok(())
    }
}

/// Configuration for the training loop.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrainingConfig {
    /// Number of passes over the samples.
    pub epochs: usize,
    /// Samples per optimizer step; the last batch of an epoch may be smaller.
    pub batch_size: usize,
    /// Adam learning rate.
    pub learning_rate: f32,
    /// Accepted but not applied by the optimizer step.
    #[serde(default)]
    pub weight_decay: f32,
    /// Accepted but not applied; there is no learning-rate schedule.
    #[serde(default)]
    pub warmup_steps: usize,
    /// Write an interim checkpoint every this many global steps.
    pub save_steps: usize,
    /// Directory receiving every checkpoint.
    pub output_dir: PathBuf,
    /// Adam first-moment decay.
    #[serde(default = "default_beta1")]
    pub beta1: f32,
    /// Adam second-moment decay.
    #[serde(default = "default_beta2")]
    pub beta2: f32,
    /// Adam denominator epsilon.
    #[serde(default = "default_epsilon")]
    pub epsilon: f32,
    /// Log batch loss every this many global steps.
    #[serde(default = "default_log_every")]
    pub log_every: usize,
    /// Seed for shuffling and mock activations.
    #[serde(default)]
    pub seed: u64,
}

fn default_beta1() -> f32 {
    0.9
}

fn default_beta2() -> f32 {
    0.999
}

fn default_epsilon() -> f32 {
    1e-8
}

fn default_log_every() -> usize {
    100
}

impl Default for TrainingConfig {
    fn default() -> Self {
        Self {
            epochs: 3,
            batch_size: 4,
            learning_rate: 2e-4,
            weight_decay: 0.01,
            warmup_steps: 100,
            save_steps: 500,
            output_dir: PathBuf::from("./lora_output"),
            beta1: default_beta1(),
            beta2: default_beta2(),
            epsilon: default_epsilon(),
            log_every: default_log_every(),
            seed: 0,
        }
    }
}

impl TrainingConfig {
    /// Set the epoch count.
    #[must_use]
    pub fn with_epochs(mut self, epochs: usize) -> Self {
        self.epochs = epochs;
        self
    }

    /// Set the batch size.
    #[must_use]
    pub fn with_batch_size(mut self, batch_size: usize) -> Self {
        self.batch_size = batch_size;
        self
    }

    /// Set the learning rate.
    #[must_use]
    pub fn with_learning_rate(mut self, learning_rate: f32) -> Self {
        self.learning_rate = learning_rate;
        self
    }

    /// Set the interim checkpoint cadence.
    #[must_use]
    pub fn with_save_steps(mut self, save_steps: usize) -> Self {
        self.save_steps = save_steps;
        self
    }

    /// Set the checkpoint directory.
    #[must_use]
    pub fn with_output_dir(mut self, output_dir: impl Into<PathBuf>) -> Self {
        self.output_dir = output_dir.into();
        self
    }

    /// Set the shuffle seed.
    #[must_use]
    pub fn with_seed(mut self, seed: u64) -> Self {
        self.seed = seed;
        self
    }

    /// Validate ranges.
    ///
    /// # Errors
    /// Returns [`LoraError::InvalidConfig`] naming the first offending field.
    pub fn validate(&self) -> Result<()> {
        if self.epochs == 0 {
            return Err(LoraError::InvalidConfig("epochs must be > 0".into()));
        }
        if self.batch_size == 0 {
            return Err(LoraError::InvalidConfig("batch_size must be > 0".into()));
        }
        if !(self.learning_rate.is_finite() && self.learning_rate > 0.0) {
            return Err(LoraError::InvalidConfig(format!(
                "learning_rate must be > 0, got {}",
                self.learning_rate
            )));
        }
        if !(self.weight_decay.is_finite() && self.weight_decay >= 0.0) {
            return Err(LoraError::InvalidConfig(format!(
                "weight_decay must be >= 0, got {}",
                self.weight_decay
            )));
        }
        if self.save_steps == 0 {
            return Err(LoraError::InvalidConfig("save_steps must be > 0".into()));
        }
        if self.log_every == 0 {
            return Err(LoraError::InvalidConfig("log_every must be > 0".into()));
        }
        for (name, beta) in [("beta1", self.beta1), ("beta2", self.beta2)] {
            if !(0.0..1.0).contains(&beta) {
                return Err(LoraError::InvalidConfig(format!(
                    "{name} must be in [0, 1), got {beta}"
                )));
            }
        }
        if !(self.epsilon.is_finite() && self.epsilon > 0.0) {
            return Err(LoraError::InvalidConfig("epsilon must be > 0".into()));
        }
        Ok(())
    }
}
