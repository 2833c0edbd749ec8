//! Single low-rank adapter module.
//!
//! One [`AdapterModule`] holds the `(A, B)` pair for one projection of one
//! layer and owns its forward, backward and Adam update math:
//!
//! ```text
//!   delta   = α · B · (A · x)
//!   ∂L/∂B  += α · g ⊗ (A · x)
//!   ∂L/∂A  += α · (Bᵀ · g) ⊗ x
//! ```
//!
//! All matrices are f32 CPU tensors. No autograd graph is built; gradients
//! are accumulated explicitly and cleared by [`AdapterModule::update`].

use candle_core::{DType, Device, Tensor};
use rand::Rng;
use rand_distr::{Distribution, Normal};

use crate::error::{LoraError, Result};

/// Adam hyper-parameters for one optimizer step.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct AdamParams {
    /// Learning rate.
    pub learning_rate: f32,
    /// First moment decay.
    pub beta1: f32,
    /// Second moment decay.
    pub beta2: f32,
    /// Denominator epsilon.
    pub epsilon: f32,
}

impl Default for AdamParams {
    fn default() -> Self {
        Self {
            learning_rate: 2e-4,
            beta1: 0.9,
            beta2: 0.999,
            epsilon: 1e-8,
        }
    }
}

/// Per-element Adam state for one matrix.
#[derive(Debug, Clone)]
struct MomentState {
    exp_avg: Tensor,
    exp_avg_sq: Tensor,
}

impl MomentState {
    fn zeros(shape: (usize, usize)) -> Result<Self> {
        Ok(Self {
            exp_avg: Tensor::zeros(shape, DType::F32, &Device::Cpu)?,
            exp_avg_sq: Tensor::zeros(shape, DType::F32, &Device::Cpu)?,
        })
    }
}

/// Low-rank matrix pair for one target projection.
#[derive(Debug, Clone)]
pub struct AdapterModule {
    name: String,
    in_features: usize,
    out_features: usize,
    rank: usize,
    /// Down projection `[rank, in_features]`.
    lora_a: Tensor,
    /// Up projection `[out_features, rank]`, zero at init.
    lora_b: Tensor,
    grad_a: Tensor,
    grad_b: Tensor,
    state_a: MomentState,
    state_b: MomentState,
}

impl AdapterModule {
    /// Create a freshly initialized module.
    ///
    /// A is drawn from `N(0, 1/rank)`, B is zero, so the module contributes
    /// nothing until its first update.
    ///
    /// # Errors
    /// Returns error if any dimension is zero or tensor creation fails.
    pub fn new<R: Rng + ?Sized>(
        name: impl Into<String>,
        in_features: usize,
        out_features: usize,
        rank: usize,
        rng: &mut R,
    ) -> Result<Self> {
        let name = name.into();
        if rank == 0 || in_features == 0 || out_features == 0 {
            return Err(LoraError::InvalidConfig(format!(
                "module {name}: rank and dimensions must be > 0 \
                 (rank={rank}, in={in_features}, out={out_features})"
            )));
        }

        #[allow(clippy::cast_precision_loss)]
        let std = (1.0 / rank as f32).sqrt();
        let normal = Normal::new(0.0f32, std)
            .map_err(|e| LoraError::InvalidConfig(format!("invalid init std {std}: {e}")))?;
        let a_values: Vec<f32> = (0..rank * in_features)
            .map(|_| normal.sample(rng))
            .collect();

        let lora_a = Tensor::from_vec(a_values, (rank, in_features), &Device::Cpu)?;
        let lora_b = Tensor::zeros((out_features, rank), DType::F32, &Device::Cpu)?;
        Self::from_weights(name, lora_a, lora_b)
    }

    /// Rebuild a module from stored A/B matrices with fresh optimizer state.
    ///
    /// # Errors
    /// Returns error if the tensors are not 2-D or disagree on the rank.
    pub fn from_weights(name: impl Into<String>, lora_a: Tensor, lora_b: Tensor) -> Result<Self> {
        let name = name.into();
        let (rank, in_features) = lora_a.dims2()?;
        let (out_features, b_rank) = lora_b.dims2()?;
        if rank != b_rank {
            return Err(LoraError::ShapeMismatch {
                expected: vec![out_features, rank],
                actual: vec![out_features, b_rank],
            });
        }
        let lora_a = lora_a.to_dtype(DType::F32)?;
        let lora_b = lora_b.to_dtype(DType::F32)?;

        Ok(Self {
            name,
            in_features,
            out_features,
            rank,
            grad_a: lora_a.zeros_like()?,
            grad_b: lora_b.zeros_like()?,
            state_a: MomentState::zeros((rank, in_features))?,
            state_b: MomentState::zeros((out_features, rank))?,
            lora_a,
            lora_b,
        })
    }

    /// Compute `α · B · (A · x)`, applying inverted dropout to `x` when training.
    ///
    /// # Errors
    /// Returns [`LoraError::ShapeMismatch`] if `input.len() != in_features`.
    pub fn forward<R: Rng + ?Sized>(
        &self,
        input: &[f32],
        alpha: f32,
        training: bool,
        dropout_rate: f32,
        rng: &mut R,
    ) -> Result<Vec<f32>> {
        if training && dropout_rate > 0.0 {
            let dropped = apply_dropout(input, dropout_rate, rng);
            self.delta(&dropped, alpha)
        } else {
            self.delta(input, alpha)
        }
    }

    /// Deterministic part of the forward pass on an already-prepared input.
    ///
    /// # Errors
    /// Returns [`LoraError::ShapeMismatch`] if `input.len() != in_features`.
    pub fn delta(&self, input: &[f32], alpha: f32) -> Result<Vec<f32>> {
        let x = self.column(input, self.in_features)?;
        let projected = self.lora_a.matmul(&x)?;
        let delta = self
            .lora_b
            .matmul(&projected)?
            .affine(f64::from(alpha), 0.0)?;
        Ok(delta.flatten_all()?.to_vec1::<f32>()?)
    }

    /// Accumulate gradients for one forward call.
    ///
    /// `activation` must be the exact input that produced the forward output
    /// (after dropout) and `output_grad` the loss gradient w.r.t. that output.
    ///
    /// # Errors
    /// Returns [`LoraError::ShapeMismatch`] on wrong vector lengths.
    pub fn backward(&mut self, activation: &[f32], output_grad: &[f32], alpha: f32) -> Result<()> {
        let x = self.column(activation, self.in_features)?;
        let g = self.column(output_grad, self.out_features)?;
        let alpha = f64::from(alpha);

        // [out, 1] x [1, r]
        let projected = self.lora_a.matmul(&x)?.reshape((1, self.rank))?;
        let step_b = g.matmul(&projected)?.affine(alpha, 0.0)?;

        // [r, 1] x [1, in]
        let back = self.lora_b.t()?.matmul(&g)?;
        let x_row = x.reshape((1, self.in_features))?;
        let step_a = back.matmul(&x_row)?.affine(alpha, 0.0)?;

        self.grad_b = self.grad_b.add(&step_b)?;
        self.grad_a = self.grad_a.add(&step_a)?;
        Ok(())
    }

    /// Apply one Adam step from the accumulated gradients, then zero them.
    ///
    /// `step` is the 1-based optimizer step used for bias correction.
    ///
    /// # Errors
    /// Returns [`LoraError::InvalidConfig`] for `step == 0`.
    pub fn update(&mut self, params: &AdamParams, step: usize) -> Result<()> {
        if step == 0 {
            return Err(LoraError::InvalidConfig(
                "optimizer step must start at 1".into(),
            ));
        }
        let step = i32::try_from(step)
            .map_err(|_| LoraError::InvalidConfig(format!("optimizer step {step} too large")))?;

        let beta1 = f64::from(params.beta1);
        let beta2 = f64::from(params.beta2);
        let corrected_lr = f64::from(params.learning_rate) * (1.0 - beta2.powi(step)).sqrt()
            / (1.0 - beta1.powi(step));

        let adam = AdamStep {
            beta1,
            beta2,
            epsilon: f64::from(params.epsilon),
            corrected_lr,
        };
        self.lora_a = adam.apply(&self.lora_a, &self.grad_a, &mut self.state_a)?;
        self.lora_b = adam.apply(&self.lora_b, &self.grad_b, &mut self.state_b)?;

        self.zero_grad()
    }

    /// Reset gradient accumulators without touching weights or moments.
    ///
    /// # Errors
    /// Returns error if tensor creation fails.
    pub fn zero_grad(&mut self) -> Result<()> {
        self.grad_a = self.grad_a.zeros_like()?;
        self.grad_b = self.grad_b.zeros_like()?;
        Ok(())
    }

    /// Fully-qualified tensor name, e.g. `blk.0.attn_q.weight`.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Input dimension.
    #[must_use]
    pub fn in_features(&self) -> usize {
        self.in_features
    }

    /// Output dimension.
    #[must_use]
    pub fn out_features(&self) -> usize {
        self.out_features
    }

    /// Rank.
    #[must_use]
    pub fn rank(&self) -> usize {
        self.rank
    }

    /// Get the `LoRA` A and B weight tensors.
    ///
    /// Returns (`lora_a`, `lora_b`) where:
    /// - `lora_a` has shape `[r, in_features]`
    /// - `lora_b` has shape `[out_features, r]`
    #[must_use]
    pub fn weights(&self) -> (&Tensor, &Tensor) {
        (&self.lora_a, &self.lora_b)
    }

    /// Accumulated (`grad_a`, `grad_b`).
    #[must_use]
    pub fn gradients(&self) -> (&Tensor, &Tensor) {
        (&self.grad_a, &self.grad_b)
    }

    /// Trainable parameter count.
    #[must_use]
    pub fn num_parameters(&self) -> usize {
        self.rank * (self.in_features + self.out_features)
    }

    fn column(&self, values: &[f32], expected: usize) -> Result<Tensor> {
        if values.len() != expected {
            return Err(LoraError::ShapeMismatch {
                expected: vec![expected],
                actual: vec![values.len()],
            });
        }
        Ok(Tensor::from_slice(values, (expected, 1), &Device::Cpu)?)
    }
}

/// Bias-corrected Adam coefficients shared by A and B within one step.
struct AdamStep {
    beta1: f64,
    beta2: f64,
    epsilon: f64,
    corrected_lr: f64,
}

impl AdamStep {
    /// ```text
    /// m = β₁·m + (1-β₁)·g
    /// v = β₂·v + (1-β₂)·g²
    /// θ = θ - lr_t · m / (√v + ε),   lr_t = lr·√(1-β₂ᵗ)/(1-β₁ᵗ)
    /// ```
    fn apply(&self, param: &Tensor, grad: &Tensor, state: &mut MomentState) -> Result<Tensor> {
        let exp_avg = state
            .exp_avg
            .affine(self.beta1, 0.0)?
            .add(&grad.affine(1.0 - self.beta1, 0.0)?)?;
        let exp_avg_sq = state
            .exp_avg_sq
            .affine(self.beta2, 0.0)?
            .add(&grad.sqr()?.affine(1.0 - self.beta2, 0.0)?)?;

        let denom = exp_avg_sq.sqrt()?.affine(1.0, self.epsilon)?;
        let update = exp_avg.div(&denom)?.affine(self.corrected_lr, 0.0)?;
        let param = param.sub(&update)?;

        state.exp_avg = exp_avg;
        state.exp_avg_sq = exp_avg_sq;
        Ok(param)
    }
}

/// Inverted dropout: zero each element with probability `rate`, scale the
/// survivors by `1 / (1 - rate)`.
#[must_use]
pub fn apply_dropout<R: Rng + ?Sized>(input: &[f32], rate: f32, rng: &mut R) -> Vec<f32> {
    if rate <= 0.0 {
        return input.to_vec();
    }
    let scale = 1.0 / (1.0 - rate);
    input
        .iter()
        .map(|&x| {
            if rng.random::<f32>() < rate {
                0.0
            } else {
                x * scale
            }
        })
        .collect()
}
