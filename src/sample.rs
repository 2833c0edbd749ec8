//! Training samples and prompt formats.
//!
//! A [`TrainingSample`] pairs an unscored `input` span with a scored `target`
//! span. The format helpers only decide how those two strings are assembled;
//! the trainer itself never looks at the format.

use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::SeedableRng;
use serde::{Deserialize, Serialize};

/// One immutable training record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrainingSample {
    input: String,
    target: String,
    #[serde(default)]
    instruction: Option<String>,
    #[serde(default = "default_weight")]
    weight: f32,
}

fn default_weight() -> f32 {
    1.0
}

/// Negative or non-finite weights would flip or poison the batch gradient;
/// they count as 0 and the sample is not scored.
fn usable_weight(weight: f32) -> f32 {
    if weight.is_finite() && weight >= 0.0 {
        weight
    } else {
        0.0
    }
}

impl TrainingSample {
    /// Sample with weight 1.0 and no instruction.
    #[must_use]
    pub fn new(input: impl Into<String>, target: impl Into<String>) -> Self {
        Self {
            input: input.into(),
            target: target.into(),
            instruction: None,
            weight: default_weight(),
        }
    }

    /// Attach an instruction tag (metadata only).
    #[must_use]
    pub fn with_instruction(mut self, instruction: impl Into<String>) -> Self {
        self.instruction = Some(instruction.into());
        self
    }

    /// Set the loss weight. Negative, NaN and infinite weights become 0.
    #[must_use]
    pub fn with_weight(mut self, weight: f32) -> Self {
        let usable = usable_weight(weight);
        if usable.to_bits() != weight.to_bits() {
            tracing::warn!(weight, "sample weight must be finite and non-negative, using 0");
        }
        self.weight = usable;
        self
    }

    /// Context text, not scored.
    #[must_use]
    pub fn input(&self) -> &str {
        &self.input
    }

    /// Text to predict, scored.
    #[must_use]
    pub fn target(&self) -> &str {
        &self.target
    }

    /// Optional instruction tag.
    #[must_use]
    pub fn instruction(&self) -> Option<&str> {
        self.instruction.as_deref()
    }

    /// Loss weight; 0 for a deserialized weight that is negative or not finite.
    #[must_use]
    pub fn weight(&self) -> f32 {
        usable_weight(self.weight)
    }

    /// `input + target`, the text that gets tokenized.
    #[must_use]
    pub fn full_text(&self) -> String {
        let mut text = String::with_capacity(self.input.len() + self.target.len());
        text.push_str(&self.input);
        text.push_str(&self.target);
        text
    }
}

impl std::fmt::Display for TrainingSample {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "TrainingSample {{ input: {:?}, target: {:?}, weight: {:.2} }}",
            preview(&self.input),
            preview(&self.target),
            self.weight
        )
    }
}

fn preview(text: &str) -> &str {
    match text.char_indices().nth(50) {
        Some((idx, _)) => &text[..idx],
        None => text,
    }
}

/// Alpaca-style instruction prompt; the response is the target.
#[must_use]
pub fn instruction_format(instruction: &str, input: &str, response: &str) -> TrainingSample {
    let prompt = format!(
        "Below is an instruction that describes a task, paired with an input that provides \
         further context. Write a response that appropriately completes the request.\n\n\
         ### Instruction:\n{instruction}\n\n### Input:\n{input}\n\n### Response:\n"
    );
    TrainingSample::new(prompt, response).with_instruction(instruction)
}

/// `ChatML` prompt; the assistant turn (closed with `<|im_end|>`) is the target.
#[must_use]
pub fn chat_format(system: Option<&str>, user: &str, assistant: &str) -> TrainingSample {
    let system_prompt = system.unwrap_or("You are a helpful assistant.");
    let prompt = format!(
        "<|im_start|>system\n{system_prompt}<|im_end|>\n\
         <|im_start|>user\n{user}<|im_end|>\n\
         <|im_start|>assistant\n"
    );
    let sample = TrainingSample::new(prompt, format!("{assistant}<|im_end|>"));
    match system {
        Some(system) => sample.with_instruction(system),
        None => sample,
    }
}

/// Plain prompt/completion pair.
#[must_use]
pub fn completion_format(prompt: &str, completion: &str) -> TrainingSample {
    TrainingSample::new(prompt, completion)
}

/// Keep samples whose full text fits in `max_tokens`, estimating four
/// characters per token.
#[must_use]
pub fn filter_by_length(samples: &[TrainingSample], max_tokens: usize) -> Vec<TrainingSample> {
    let max_chars = max_tokens.saturating_mul(4);
    let filtered: Vec<TrainingSample> = samples
        .iter()
        .filter(|s| s.input.len() + s.target.len() <= max_chars)
        .cloned()
        .collect();
    tracing::info!(
        kept = filtered.len(),
        total = samples.len(),
        max_tokens,
        "filtered samples by length"
    );
    filtered
}

/// Train/validation partition.
#[derive(Debug, Clone, Default)]
pub struct DatasetSplit {
    /// Training samples.
    pub train: Vec<TrainingSample>,
    /// Held-out samples.
    pub validation: Vec<TrainingSample>,
}

/// Shuffle a copy of `samples` and split off `validation_ratio` of them.
///
/// The ratio is clamped to `[0, 1]`.
#[must_use]
pub fn train_validation_split(
    samples: &[TrainingSample],
    validation_ratio: f32,
    seed: u64,
) -> DatasetSplit {
    let mut shuffled = samples.to_vec();
    shuffled.shuffle(&mut StdRng::seed_from_u64(seed));

    let ratio = f64::from(validation_ratio.clamp(0.0, 1.0));
    #[allow(
        clippy::cast_precision_loss,
        clippy::cast_possible_truncation,
        clippy::cast_sign_loss
    )]
    let split_index = ((shuffled.len() as f64) * (1.0 - ratio)).round() as usize;
    let validation = shuffled.split_off(split_index.min(shuffled.len()));

    tracing::info!(
        train = shuffled.len(),
        validation = validation.len(),
        "split dataset"
    );
    DatasetSplit {
        train: shuffled,
        validation,
    }
}
