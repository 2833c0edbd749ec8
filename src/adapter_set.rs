//! Ordered collection of adapter modules keyed by tensor name.
//!
//! Modules are created per target projection, then per layer, and keep that
//! insertion order for their whole life. Serialization and reload matching
//! both walk this order, so naming must be a pure function of the inputs.

use std::collections::HashMap;

use candle_core::Tensor;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use crate::adapter::{apply_dropout, AdamParams, AdapterModule};
use crate::config::LoraConfig;
use crate::error::{LoraError, Result};
use crate::model::BaseModel;

/// Map a projection name to the base-model tensor stem used by the inference engine.
///
/// Unknown names pass through unchanged.
#[must_use]
pub fn projection_tensor_base(projection: &str) -> &str {
    match projection {
        "q_proj" => "attn_q",
        "k_proj" => "attn_k",
        "v_proj" => "attn_v",
        "o_proj" => "attn_output",
        "gate_proj" => "ffn_gate",
        "up_proj" => "ffn_up",
        "down_proj" => "ffn_down",
        other => other,
    }
}

/// Fully-qualified tensor name for `projection` in `layer`.
///
/// ```rust
/// assert_eq!(lora_trainer::tensor_name(3, "v_proj"), "blk.3.attn_v.weight");
/// ```
#[must_use]
pub fn tensor_name(layer: usize, projection: &str) -> String {
    format!("blk.{layer}.{}.weight", projection_tensor_base(projection))
}

/// Logits after adapter deltas, plus the exact inputs each module saw.
///
/// `inputs[i]` belongs to the i-th module in set order and is what
/// [`AdapterSet::backward`] must receive for the gradient to match.
#[derive(Debug, Clone)]
pub struct AdaptedLogits {
    /// Adjusted logits (same length as the base logits).
    pub logits: Vec<f32>,
    /// Post-dropout module inputs, in set order.
    pub inputs: Vec<Vec<f32>>,
}

/// Immutable view of every module's weights, captured before a write.
#[derive(Debug, Clone)]
pub struct AdapterSnapshot {
    entries: Vec<(String, Tensor, Tensor)>,
}

impl AdapterSnapshot {
    /// `(name, lora_a, lora_b)` in set order.
    pub fn iter(&self) -> impl Iterator<Item = (&str, &Tensor, &Tensor)> {
        self.entries.iter().map(|(n, a, b)| (n.as_str(), a, b))
    }

    /// Number of modules captured.
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether the snapshot holds no modules.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// Collection of [`AdapterModule`]s in stable insertion order.
#[derive(Debug, Clone, Default)]
pub struct AdapterSet {
    modules: Vec<AdapterModule>,
    index: HashMap<String, usize>,
}

impl AdapterSet {
    /// Build square `model_dim × model_dim` adapters for every target
    /// projection in every layer.
    ///
    /// Order is target-major: all layers of the first projection, then all
    /// layers of the next.
    ///
    /// # Errors
    /// Returns error on zero sizes, duplicate projections, or tensor failures.
    pub fn new(
        layer_count: usize,
        model_dim: usize,
        target_modules: &[String],
        rank: usize,
        seed: u64,
    ) -> Result<Self> {
        if layer_count == 0 || model_dim == 0 {
            return Err(LoraError::InvalidConfig(format!(
                "layer_count and model_dim must be > 0 (got {layer_count}, {model_dim})"
            )));
        }
        let mut rng = StdRng::seed_from_u64(seed);
        let mut set = Self::default();
        for projection in target_modules {
            for layer in 0..layer_count {
                let name = tensor_name(layer, projection);
                set.push(AdapterModule::new(name, model_dim, model_dim, rank, &mut rng)?)?;
            }
        }
        tracing::info!(
            modules = set.len(),
            rank,
            layers = layer_count,
            model_dim,
            "initialized LoRA modules"
        );
        Ok(set)
    }

    /// Build adapters sized from the base model, failing fast when a target
    /// projection is not square `model_dim`.
    ///
    /// # Errors
    /// Returns [`LoraError::Configuration`] naming the first mismatched module.
    pub fn for_model<M: BaseModel + ?Sized>(model: &M, config: &LoraConfig) -> Result<Self> {
        config.validate()?;
        let model_dim = model.model_dim();
        for projection in &config.target_modules {
            for layer in 0..model.layer_count() {
                let module = tensor_name(layer, projection);
                let Some((input_dim, output_dim)) = model.projection_dims(layer, projection) else {
                    return Err(LoraError::InvalidConfig(format!(
                        "base model has no projection {module}"
                    )));
                };
                if input_dim != model_dim {
                    return Err(LoraError::Configuration {
                        module,
                        expected: model_dim,
                        actual: input_dim,
                    });
                }
                if output_dim != model_dim {
                    return Err(LoraError::Configuration {
                        module,
                        expected: model_dim,
                        actual: output_dim,
                    });
                }
            }
        }
        Self::new(
            model.layer_count(),
            model_dim,
            &config.target_modules,
            config.rank,
            config.seed,
        )
    }

    /// Build a set from already-constructed modules, keeping their order.
    ///
    /// # Errors
    /// Returns error on duplicate names.
    pub fn from_modules(modules: impl IntoIterator<Item = AdapterModule>) -> Result<Self> {
        let mut set = Self::default();
        for module in modules {
            set.push(module)?;
        }
        Ok(set)
    }

    /// Append a module.
    ///
    /// # Errors
    /// Returns error if a module with the same name already exists.
    pub fn push(&mut self, module: AdapterModule) -> Result<()> {
        if self.index.contains_key(module.name()) {
            return Err(LoraError::InvalidConfig(format!(
                "duplicate adapter module {}",
                module.name()
            )));
        }
        self.index.insert(module.name().to_string(), self.modules.len());
        self.modules.push(module);
        Ok(())
    }

    /// Number of modules.
    #[must_use]
    pub fn len(&self) -> usize {
        self.modules.len()
    }

    /// Whether the set is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.modules.is_empty()
    }

    /// Modules in insertion order.
    pub fn iter(&self) -> impl Iterator<Item = &AdapterModule> {
        self.modules.iter()
    }

    /// Module names in insertion order.
    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.modules.iter().map(AdapterModule::name)
    }

    /// Look up a module by tensor name.
    #[must_use]
    pub fn get(&self, name: &str) -> Option<&AdapterModule> {
        self.index.get(name).map(|&i| &self.modules[i])
    }

    /// Mutable lookup by tensor name.
    pub fn get_mut(&mut self, name: &str) -> Option<&mut AdapterModule> {
        self.index.get(name).map(|&i| &mut self.modules[i])
    }

    /// Total trainable parameters.
    #[must_use]
    pub fn num_parameters(&self) -> usize {
        self.modules.iter().map(AdapterModule::num_parameters).sum()
    }

    /// Add every module's delta into a copy of `base_logits`.
    ///
    /// `activations[i]` is the input for the i-th module. When training with
    /// dropout the mask is applied here and the dropped input is returned in
    /// [`AdaptedLogits::inputs`]. Deltas and logits only overlap on their
    /// common prefix.
    ///
    /// # Errors
    /// Returns error if the activation count or lengths do not match the modules.
    pub fn apply_to_logits<R: Rng + ?Sized>(
        &self,
        base_logits: &[f32],
        activations: &[Vec<f32>],
        alpha: f32,
        training: bool,
        dropout_rate: f32,
        rng: &mut R,
    ) -> Result<AdaptedLogits> {
        if activations.len() != self.modules.len() {
            return Err(LoraError::ShapeMismatch {
                expected: vec![self.modules.len()],
                actual: vec![activations.len()],
            });
        }

        let mut logits = base_logits.to_vec();
        let mut inputs = Vec::with_capacity(self.modules.len());
        for (module, activation) in self.modules.iter().zip(activations) {
            let input = if training && dropout_rate > 0.0 {
                apply_dropout(activation, dropout_rate, rng)
            } else {
                activation.clone()
            };
            let delta = module.delta(&input, alpha)?;
            for (logit, d) in logits.iter_mut().zip(&delta) {
                *logit += d;
            }
            inputs.push(input);
        }
        Ok(AdaptedLogits { logits, inputs })
    }

    /// Push `∂loss/∂logits` into every module.
    ///
    /// Each module receives the overlapping prefix of the gradient, zero
    /// padded to its output size.
    ///
    /// # Errors
    /// Returns error if `adapted` was not produced by this set.
    pub fn backward(&mut self, adapted: &AdaptedLogits, logits_grad: &[f32], alpha: f32) -> Result<()> {
        if adapted.inputs.len() != self.modules.len() {
            return Err(LoraError::ShapeMismatch {
                expected: vec![self.modules.len()],
                actual: vec![adapted.inputs.len()],
            });
        }
        for (module, input) in self.modules.iter_mut().zip(&adapted.inputs) {
            let mut grad = vec![0.0f32; module.out_features()];
            let overlap = grad.len().min(logits_grad.len());
            grad[..overlap].copy_from_slice(&logits_grad[..overlap]);
            module.backward(input, &grad, alpha)?;
        }
        Ok(())
    }

    /// One optimizer step on every module.
    ///
    /// # Errors
    /// Returns error if any module update fails.
    pub fn update(&mut self, params: &AdamParams, step: usize) -> Result<()> {
        for module in &mut self.modules {
            module.update(params, step)?;
        }
        Ok(())
    }

    /// Clear gradients on every module.
    ///
    /// # Errors
    /// Returns error if tensor creation fails.
    pub fn zero_grad(&mut self) -> Result<()> {
        for module in &mut self.modules {
            module.zero_grad()?;
        }
        Ok(())
    }

    /// Capture the current weights. Later updates do not affect the snapshot.
    #[must_use]
    pub fn snapshot(&self) -> AdapterSnapshot {
        AdapterSnapshot {
            entries: self
                .modules
                .iter()
                .map(|m| {
                    let (a, b) = m.weights();
                    (m.name().to_string(), a.clone(), b.clone())
                })
                .collect(),
        }
    }
}
