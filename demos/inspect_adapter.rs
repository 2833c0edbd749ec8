//! # Adapter Inspection Example
//!
//! Prints the metadata and tensor table of a GGUF adapter file.
//!
//! Usage: `cargo run --example inspect_adapter -- path/to/adapter.gguf`

use anyhow::{bail, Context, Result};
use lora_trainer::{declared_tensors, load_adapter, read_container};
use tracing_subscriber::EnvFilter;

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    let Some(path) = std::env::args().nth(1) else {
        bail!("usage: inspect_adapter <adapter.gguf>");
    };

    let file = std::fs::File::open(&path).with_context(|| format!("opening {path}"))?;
    let content = read_container(&mut std::io::BufReader::new(file))?;

    println!("=== {path} ===");
    println!("GGUF {:?}", content.magic);
    println!("\nMetadata:");
    let mut keys: Vec<&String> = content.metadata.keys().collect();
    keys.sort();
    for key in keys {
        println!("  {key} = {:?}", content.metadata[key]);
    }

    println!("\nTensors:");
    for (name, info) in declared_tensors(&content) {
        println!(
            "  {:<40} {:?} @ {}",
            name,
            info.shape.dims(),
            content.tensor_data_offset + info.offset
        );
    }

    let loaded = load_adapter(&path)?;
    println!(
        "\n{} modules, alpha {}, {} parameters",
        loaded.adapters.len(),
        loaded.alpha,
        loaded.adapters.num_parameters()
    );
    Ok(())
}
