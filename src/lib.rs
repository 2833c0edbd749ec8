//! # lora-trainer
//!
//! Low-rank adapter (`LoRA`) training against a frozen base model.
//!
//! This crate provides:
//! - Adapter modules with explicit forward, backward and Adam updates
//! - Masked-span cross-entropy training with best, periodic and step checkpoints
//! - GGUF adapter export and import for llama.cpp style inference engines
//! - Prompt-format helpers for building training samples
//!
//! ## Quick Start
//!
//! ```rust,ignore
//! use lora_trainer::{LoraConfig, LoraTrainer, TrainingConfig, TrainingSample};
//!
//! // `model` implements `BaseModel`
//! let lora = LoraConfig::preset_qv(8, 16.0);
//! let config = TrainingConfig::default().with_epochs(2).with_output_dir("out");
//! let mut trainer = LoraTrainer::with_mock_activations(&model, lora, config)?;
//!
//! let samples = vec![TrainingSample::new("Q: 2+2?\nA: ", "4")];
//! let report = trainer.train(&samples)?;
//! println!("best loss {:?}", report.best_loss);
//! ```
//!
//! ## Architecture
//!
//! The base model stays frozen and is reached only through the [`BaseModel`]
//! trait. Each adapter adds `α · B · (A · x)` to the base logits; only the
//! target span of each sample is scored, and `A`/`B` are the only trained
//! weights.

#![warn(missing_docs)]
#![warn(clippy::pedantic)]

pub mod adapter;
pub mod adapter_set;
pub mod config;
pub mod error;
pub mod export;
pub mod gguf;
pub mod import;
pub mod model;
pub mod sample;
pub mod training;

pub use adapter::{apply_dropout, AdamParams, AdapterModule};
pub use adapter_set::{projection_tensor_base, tensor_name, AdaptedLogits, AdapterSet, AdapterSnapshot};
pub use config::{LoraConfig, TrainingConfig};
pub use error::{LoraError, Result};
pub use export::{encode_adapter, save_adapter, save_adapter_with_metadata, AdapterMetadata};
pub use import::{decode_adapter, declared_tensors, load_adapter, read_container, LoadedAdapter};
pub use model::{ActivationProvider, BaseModel, MockActivations};
pub use sample::{
    chat_format, completion_format, filter_by_length, instruction_format, train_validation_split,
    DatasetSplit, TrainingSample,
};
pub use training::{
    cross_entropy_grad, cross_entropy_loss, softmax, CancellationToken, CheckpointKind,
    CheckpointRecord, EpochDecision, EpochStats, EpochTracker, LoraTrainer, TrainingReport,
};
