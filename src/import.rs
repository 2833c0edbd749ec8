//! GGUF adapter import.
//!
//! Reads the container produced by [`crate::export`] back into an
//! [`AdapterSet`] through candle's GGUF reader. Loaded modules carry their
//! stored weights and fresh optimizer state.

use std::collections::HashMap;
use std::io::{Cursor, Read, Seek};
use std::path::Path;

use candle_core::quantized::gguf_file::{Content, TensorInfo};
use candle_core::quantized::GgmlDType;
use candle_core::{Device, Tensor};

use crate::adapter::AdapterModule;
use crate::adapter_set::AdapterSet;
use crate::error::{LoraError, Result};
use crate::gguf::{keys, ADAPTER_KIND_LORA, CONTAINER_KIND_ADAPTER};

/// A reloaded adapter.
#[derive(Debug, Clone)]
pub struct LoadedAdapter {
    /// `adapter.lora.alpha`.
    pub alpha: f32,
    /// `general.architecture`, if present.
    pub architecture: Option<String>,
    /// Modules in declared order.
    pub adapters: AdapterSet,
}

/// Read and validate an adapter container from `path`.
///
/// # Errors
/// Returns [`LoraError::Io`] if the file cannot be read and
/// [`LoraError::Format`] if it is not a well-formed `LoRA` adapter.
pub fn load_adapter<P: AsRef<Path>>(path: P) -> Result<LoadedAdapter> {
    let path = path.as_ref();
    let bytes = std::fs::read(path)?;
    let loaded = decode_adapter(&bytes)?;
    tracing::info!(
        path = %path.display(),
        modules = loaded.adapters.len(),
        "loaded LoRA adapter"
    );
    Ok(loaded)
}

/// Decode an adapter from an in-memory container.
///
/// # Errors
/// Returns [`LoraError::Format`] if the bytes are not a `LoRA` adapter.
pub fn decode_adapter(bytes: &[u8]) -> Result<LoadedAdapter> {
    let mut reader = Cursor::new(bytes);
    let content = read_container(&mut reader)?;

    let kind = metadata_str(&content, keys::GENERAL_TYPE);
    if kind != Some(CONTAINER_KIND_ADAPTER) {
        return Err(LoraError::Format(format!(
            "expected {} = {CONTAINER_KIND_ADAPTER:?}, found {kind:?}",
            keys::GENERAL_TYPE
        )));
    }
    let adapter_kind = metadata_str(&content, keys::ADAPTER_TYPE);
    if adapter_kind != Some(ADAPTER_KIND_LORA) {
        return Err(LoraError::Format(format!(
            "expected {} = {ADAPTER_KIND_LORA:?}, found {adapter_kind:?}",
            keys::ADAPTER_TYPE
        )));
    }
    let alpha = content
        .metadata
        .get(keys::ADAPTER_LORA_ALPHA)
        .and_then(|v| v.to_f32().ok())
        .ok_or_else(|| LoraError::Format(format!("missing {}", keys::ADAPTER_LORA_ALPHA)))?;
    let architecture = metadata_str(&content, keys::GENERAL_ARCHITECTURE).map(str::to_string);

    // Pair `<base>.lora_a` with `<base>.lora_b`, ordered by first appearance.
    let mut pairs: Vec<(String, Option<Tensor>, Option<Tensor>)> = Vec::new();
    let mut index: HashMap<String, usize> = HashMap::new();
    for (name, info) in declared_tensors(&content) {
        let (base, is_a) = if let Some(base) = name.strip_suffix(".lora_a") {
            (base, true)
        } else if let Some(base) = name.strip_suffix(".lora_b") {
            (base, false)
        } else {
            tracing::debug!(tensor = %name, "skipping non-LoRA tensor");
            continue;
        };
        check_tensor_bounds(name, info, content.tensor_data_offset, bytes.len())?;
        let tensor = content
            .tensor(&mut reader, name, &Device::Cpu)
            .and_then(|q| q.dequantize(&Device::Cpu))
            .map_err(|e| LoraError::Format(format!("tensor {name}: {e}")))?;
        let slot = *index.entry(base.to_string()).or_insert_with(|| {
            pairs.push((base.to_string(), None, None));
            pairs.len() - 1
        });
        let entry = &mut pairs[slot];
        let target = if is_a { &mut entry.1 } else { &mut entry.2 };
        if target.replace(tensor).is_some() {
            return Err(LoraError::Format(format!("duplicate tensor {name}")));
        }
    }

    let mut adapters = AdapterSet::default();
    for (name, lora_a, lora_b) in pairs {
        let (Some(lora_a), Some(lora_b)) = (lora_a, lora_b) else {
            return Err(LoraError::Format(format!(
                "module {name} is missing its lora_a or lora_b tensor"
            )));
        };
        adapters.push(AdapterModule::from_weights(name, lora_a, lora_b)?)?;
    }

    Ok(LoadedAdapter {
        alpha,
        architecture,
        adapters,
    })
}

/// Parse the header, metadata and tensor-info table.
///
/// # Errors
/// Returns [`LoraError::Format`] on a bad magic, unsupported version or
/// truncated header.
pub fn read_container<R: Read + Seek>(reader: &mut R) -> Result<Content> {
    Content::read(reader).map_err(|e| LoraError::Format(format!("invalid GGUF container: {e}")))
}

/// Tensor infos in the order they were written.
///
/// The writer lays tensor data out in declaration order, so sorting by data
/// offset recovers it from candle's name-keyed table.
#[must_use]
pub fn declared_tensors(content: &Content) -> Vec<(&str, &TensorInfo)> {
    let mut tensors: Vec<(&str, &TensorInfo)> = content
        .tensor_infos
        .iter()
        .map(|(name, info)| (name.as_str(), info))
        .collect();
    tensors.sort_by_key(|(_, info)| info.offset);
    tensors
}

fn metadata_str<'a>(content: &'a Content, key: &str) -> Option<&'a str> {
    content
        .metadata
        .get(key)
        .and_then(|v| v.to_string().ok())
        .map(String::as_str)
}

/// Reject non-f32 tensors and tensors whose data would overflow or run past
/// the end of the container, before candle allocates a buffer for them.
fn check_tensor_bounds(name: &str, info: &TensorInfo, data_offset: u64, len: usize) -> Result<()> {
    if info.ggml_dtype != GgmlDType::F32 {
        return Err(LoraError::Format(format!(
            "tensor {name} has ggml type {:?}, only f32 is supported",
            info.ggml_dtype
        )));
    }
    let end = info
        .shape
        .dims()
        .iter()
        .try_fold(1u64, |acc, &d| acc.checked_mul(u64::try_from(d).ok()?))
        .and_then(|numel| numel.checked_mul(4))
        .and_then(|nbytes| nbytes.checked_add(info.offset))
        .and_then(|end| end.checked_add(data_offset));
    match end {
        Some(end) if end <= len as u64 => Ok(()),
        _ => Err(LoraError::Format(format!(
            "tensor {name} with shape {:?} does not fit in the container",
            info.shape.dims()
        ))),
    }
}
