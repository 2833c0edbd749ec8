//! Base-model collaborator contract.
//!
//! The frozen base model is external. The trainer only needs tokenization,
//! logits at a position, and the architecture numbers used to size the
//! adapters. Input activations for each adapted projection come from an
//! [`ActivationProvider`]; a real integration captures them during the base
//! model's forward pass, while [`MockActivations`] supplies seeded noise for
//! engines that do not expose their internals.

use rand::rngs::StdRng;
use rand::SeedableRng;
use rand_distr::{Distribution, Normal};

use crate::error::{LoraError, Result};

/// Frozen base model consumed by the trainer.
pub trait BaseModel {
    /// Deterministically tokenize `text`.
    ///
    /// # Errors
    /// Returns error if the tokenizer fails.
    fn encode(&self, text: &str) -> Result<Vec<u32>>;

    /// Vocabulary-sized score vector predicting the token after `position`.
    ///
    /// # Errors
    /// Returns error if the forward pass fails.
    fn logits_at(&self, tokens: &[u32], position: usize) -> Result<Vec<f32>>;

    /// Number of transformer blocks.
    fn layer_count(&self) -> usize;

    /// Hidden size of the model.
    fn model_dim(&self) -> usize;

    /// `(input_dim, output_dim)` of `projection` in `layer`.
    ///
    /// Defaults to square `model_dim` projections; return `None` when the
    /// model has no such projection.
    fn projection_dims(&self, layer: usize, projection: &str) -> Option<(usize, usize)> {
        let _ = (layer, projection);
        Some((self.model_dim(), self.model_dim()))
    }
}

/// Source of per-module input activations at a token position.
pub trait ActivationProvider {
    /// Input activation (length `in_features`) seen by the projection behind
    /// `module_name` when predicting the token after `position`.
    ///
    /// # Errors
    /// Returns error if the activation cannot be produced.
    fn activation(
        &mut self,
        module_name: &str,
        in_features: usize,
        tokens: &[u32],
        position: usize,
    ) -> Result<Vec<f32>>;
}

/// Gaussian placeholder activations (`N(0, scale²)`).
///
/// Gradients computed from these are not meaningful for the base model; use
/// them only when the engine cannot expose real activations.
#[derive(Debug, Clone)]
pub struct MockActivations {
    rng: StdRng,
    normal: Normal<f32>,
}

impl MockActivations {
    /// Default standard deviation of mock activations.
    pub const DEFAULT_SCALE: f32 = 0.1;

    /// Seeded mock source with [`Self::DEFAULT_SCALE`].
    ///
    /// # Errors
    /// Never fails for the default scale; kept fallible to match [`Self::with_scale`].
    pub fn new(seed: u64) -> Result<Self> {
        Self::with_scale(seed, Self::DEFAULT_SCALE)
    }

    /// Seeded mock source with a custom standard deviation.
    ///
    /// # Errors
    /// Returns error if `scale` is negative or not finite.
    pub fn with_scale(seed: u64, scale: f32) -> Result<Self> {
        let normal = Normal::new(0.0, scale)
            .map_err(|e| LoraError::InvalidConfig(format!("invalid activation scale {scale}: {e}")))?;
        Ok(Self {
            rng: StdRng::seed_from_u64(seed),
            normal,
        })
    }
}

impl ActivationProvider for MockActivations {
    fn activation(
        &mut self,
        _module_name: &str,
        in_features: usize,
        _tokens: &[u32],
        _position: usize,
    ) -> Result<Vec<f32>> {
        Ok((0..in_features)
            .map(|_| self.normal.sample(&mut self.rng))
            .collect())
    }
}
