//! # Toy LoRA Training Example
//!
//! Demonstrates how to:
//! - Implement `BaseModel` for a frozen model
//! - Build samples with the prompt-format helpers
//! - Train adapters and inspect the run report
//!
//! Run with `RUST_LOG=info cargo run --example train_toy_adapter`.

use anyhow::Result;
use lora_trainer::{
    chat_format, completion_format, instruction_format, train_validation_split, BaseModel,
    LoraConfig, LoraTrainer, TrainingConfig,
};
use tracing_subscriber::EnvFilter;

const VOCAB: usize = 128;

/// ASCII tokenizer with logits that slightly prefer lowercase letters.
struct AsciiModel;

impl BaseModel for AsciiModel {
    fn encode(&self, text: &str) -> lora_trainer::Result<Vec<u32>> {
        Ok(text.bytes().map(|b| u32::from(b & 0x7f)).collect())
    }

    fn logits_at(&self, _tokens: &[u32], _position: usize) -> lora_trainer::Result<Vec<f32>> {
        Ok((0..VOCAB)
            .map(|t| if (b'a'..=b'z').contains(&(t as u8)) { 0.5 } else { 0.0 })
            .collect())
    }

    fn layer_count(&self) -> usize {
        2
    }

    fn model_dim(&self) -> usize {
        VOCAB
    }
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    println!("=== LoRA Training Example ===\n");

    let samples = vec![
        instruction_format("Add the numbers", "2 + 2", "4"),
        instruction_format("Add the numbers", "3 + 5", "8"),
        chat_format(None, "Say hi", "Hi!"),
        chat_format(Some("Answer in one word."), "Sky colour?", "Blue"),
        completion_format("fn main() {", " println!(\"hi\"); }"),
        completion_format("The capital of France is", " Paris."),
    ];
    let split = train_validation_split(&samples, 0.2, 7);
    println!(
        "Samples: {} train / {} validation\n",
        split.train.len(),
        split.validation.len()
    );

    let output_dir = std::env::temp_dir().join("lora_trainer_demo");
    let lora = LoraConfig::preset_qv(8, 16.0);
    let config = TrainingConfig::default()
        .with_epochs(5)
        .with_batch_size(2)
        .with_learning_rate(1e-2)
        .with_save_steps(4)
        .with_output_dir(&output_dir);

    let model = AsciiModel;
    let mut trainer = LoraTrainer::with_mock_activations(&model, lora, config)?;
    println!(
        "Adapters: {} modules, {} trainable parameters\n",
        trainer.adapters().len(),
        trainer.adapters().num_parameters()
    );

    let report = trainer.train(&split.train)?;

    println!("Epoch losses:");
    for (epoch, loss) in report.epoch_losses.iter().enumerate() {
        println!("  epoch {}: {loss:.4}", epoch + 1);
    }
    println!("Best loss: {:?}", report.best_loss);
    println!("Steps: {}, scored tokens: {}", report.global_steps, report.tokens_scored);
    if let Some(loss) = trainer.evaluate(&split.validation)? {
        println!("Validation loss: {loss:.4}");
    }

    println!("\nCheckpoints:");
    for record in &report.checkpoints {
        let status = if record.is_saved() { "ok" } else { "FAILED" };
        println!("  [{status}] {}", record.path.display());
    }

    println!("\n=== Training complete ===");
    Ok(())
}
