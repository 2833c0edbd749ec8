//! GGUF adapter export.
//!
//! Writes an [`AdapterSet`] as a GGUF adapter container loadable by llama.cpp
//! style inference engines. For every module, in set order, two f32 tensors
//! are declared: `<name>.lora_a` (`[rank, in]`) then `<name>.lora_b`
//! (`[out, rank]`). Tensor data follows in exactly the declared order; a
//! reader walking the info table must find each tensor at its offset.

use std::fs::{self, File};
use std::io::{BufWriter, Write};
use std::path::Path;

use crate::adapter_set::{AdapterSet, AdapterSnapshot};
use crate::error::{LoraError, Result};
use crate::gguf::{
    align_offset, keys, GgufValue, ADAPTER_KIND_LORA, CONTAINER_KIND_ADAPTER,
    GGML_TYPE_F32, GGUF_DEFAULT_ALIGNMENT, GGUF_MAGIC, GGUF_VERSION,
};

/// Metadata written alongside the adapter tensors.
#[derive(Debug, Clone)]
pub struct AdapterMetadata {
    /// Architecture of the base model (e.g. "llama").
    pub architecture: String,
    /// Optional adapter name.
    pub name: Option<String>,
}

impl Default for AdapterMetadata {
    fn default() -> Self {
        Self {
            architecture: "llama".to_string(),
            name: None,
        }
    }
}

impl AdapterMetadata {
    /// Set the base-model architecture.
    #[must_use]
    pub fn with_architecture(mut self, architecture: impl Into<String>) -> Self {
        self.architecture = architecture.into();
        self
    }

    /// Set the adapter name.
    #[must_use]
    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    fn kv_pairs(&self, alpha: f32) -> Vec<(&'static str, GgufValue)> {
        let mut kv = vec![
            (
                keys::GENERAL_ARCHITECTURE,
                GgufValue::String(self.architecture.clone()),
            ),
            (
                keys::GENERAL_TYPE,
                GgufValue::String(CONTAINER_KIND_ADAPTER.to_string()),
            ),
            (
                keys::ADAPTER_TYPE,
                GgufValue::String(ADAPTER_KIND_LORA.to_string()),
            ),
            (keys::ADAPTER_LORA_ALPHA, GgufValue::F32(alpha)),
        ];
        if let Some(name) = &self.name {
            kv.push((keys::GENERAL_NAME, GgufValue::String(name.clone())));
        }
        kv
    }
}

/// One tensor ready to be written: row-major shape and f32 values.
struct TensorEntry {
    name: String,
    shape: Vec<usize>,
    data: Vec<f32>,
}

impl TensorEntry {
    fn nbytes(&self) -> u64 {
        self.data.len() as u64 * 4
    }
}

/// Save `adapters` to `path` with default metadata.
///
/// # Errors
/// Returns [`LoraError::Persistence`] if the file cannot be written.
pub fn save_adapter<P: AsRef<Path>>(adapters: &AdapterSet, alpha: f32, path: P) -> Result<()> {
    save_adapter_with_metadata(adapters, alpha, &AdapterMetadata::default(), path)
}

/// Save `adapters` to `path`.
///
/// Weights are snapshotted first, then written to `<path>.partial` and
/// renamed into place, so a failed write never leaves a truncated adapter
/// under the final name.
///
/// # Errors
/// Returns [`LoraError::Persistence`] if the file cannot be written.
pub fn save_adapter_with_metadata<P: AsRef<Path>>(
    adapters: &AdapterSet,
    alpha: f32,
    metadata: &AdapterMetadata,
    path: P,
) -> Result<()> {
    let path = path.as_ref();
    let snapshot = adapters.snapshot();
    let tensors = tensor_entries(&snapshot)?;

    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        fs::create_dir_all(parent).map_err(|e| LoraError::persistence(parent, e))?;
    }

    let mut partial = path.as_os_str().to_owned();
    partial.push(".partial");
    let partial = Path::new(&partial);

    let write = || -> std::io::Result<()> {
        let mut writer = BufWriter::new(File::create(partial)?);
        write_gguf(&mut writer, &metadata.kv_pairs(alpha), &tensors)?;
        writer.into_inner().map_err(|e| e.into_error())?.sync_all()?;
        fs::rename(partial, path)
    };
    if let Err(e) = write() {
        fs::remove_file(partial).ok();
        return Err(LoraError::persistence(path, e));
    }

    tracing::info!(
        path = %path.display(),
        tensors = tensors.len(),
        "saved LoRA adapter"
    );
    Ok(())
}

/// Encode `adapters` as an in-memory GGUF container.
///
/// # Errors
/// Returns error if tensor data cannot be read.
pub fn encode_adapter(adapters: &AdapterSet, alpha: f32, metadata: &AdapterMetadata) -> Result<Vec<u8>> {
    let tensors = tensor_entries(&adapters.snapshot())?;
    let mut bytes = Vec::new();
    write_gguf(&mut bytes, &metadata.kv_pairs(alpha), &tensors)?;
    Ok(bytes)
}

/// A then B for each module, in set order.
fn tensor_entries(snapshot: &AdapterSnapshot) -> Result<Vec<TensorEntry>> {
    let mut entries = Vec::with_capacity(snapshot.len() * 2);
    for (name, lora_a, lora_b) in snapshot.iter() {
        for (suffix, tensor) in [("lora_a", lora_a), ("lora_b", lora_b)] {
            entries.push(TensorEntry {
                name: format!("{name}.{suffix}"),
                shape: tensor.dims().to_vec(),
                data: tensor.flatten_all()?.to_vec1::<f32>()?,
            });
        }
    }
    Ok(entries)
}

/// Byte counter over any writer, used for alignment padding.
struct CountingWriter<W> {
    inner: W,
    written: u64,
}

impl<W: Write> CountingWriter<W> {
    fn put(&mut self, bytes: &[u8]) -> std::io::Result<()> {
        self.inner.write_all(bytes)?;
        self.written += bytes.len() as u64;
        Ok(())
    }

    fn put_str(&mut self, s: &str) -> std::io::Result<()> {
        self.put(&(s.len() as u64).to_le_bytes())?;
        self.put(s.as_bytes())
    }

    fn pad_to(&mut self, alignment: u64) -> std::io::Result<()> {
        let target = align_offset(self.written, alignment);
        let padding = usize::try_from(target - self.written).unwrap_or_default();
        self.put(&vec![0u8; padding])
    }
}

fn write_gguf<W: Write>(
    writer: W,
    kv_pairs: &[(&str, GgufValue)],
    tensors: &[TensorEntry],
) -> std::io::Result<()> {
    let mut out = CountingWriter {
        inner: writer,
        written: 0,
    };

    out.put(&GGUF_MAGIC.to_le_bytes())?;
    out.put(&GGUF_VERSION.to_le_bytes())?;
    out.put(&(tensors.len() as u64).to_le_bytes())?;
    out.put(&(kv_pairs.len() as u64).to_le_bytes())?;

    for (key, value) in kv_pairs {
        out.put_str(key)?;
        out.put(&(value.value_type() as u32).to_le_bytes())?;
        write_value(&mut out, value)?;
    }

    let mut offset = 0u64;
    for tensor in tensors {
        out.put_str(&tensor.name)?;
        let n_dims = u32::try_from(tensor.shape.len())
            .map_err(|_| std::io::Error::other("tensor has too many dimensions"))?;
        out.put(&n_dims.to_le_bytes())?;
        // GGUF lists dimensions innermost first.
        for &dim in tensor.shape.iter().rev() {
            out.put(&(dim as u64).to_le_bytes())?;
        }
        out.put(&GGML_TYPE_F32.to_le_bytes())?;
        out.put(&offset.to_le_bytes())?;
        offset += align_offset(tensor.nbytes(), GGUF_DEFAULT_ALIGNMENT);
    }

    out.pad_to(GGUF_DEFAULT_ALIGNMENT)?;
    for tensor in tensors {
        let mut bytes = Vec::with_capacity(tensor.data.len() * 4);
        for value in &tensor.data {
            bytes.extend_from_slice(&value.to_le_bytes());
        }
        out.put(&bytes)?;
        out.pad_to(GGUF_DEFAULT_ALIGNMENT)?;
    }
    out.inner.flush()
}

fn write_value<W: Write>(out: &mut CountingWriter<W>, value: &GgufValue) -> std::io::Result<()> {
    match value {
        GgufValue::U8(v) => out.put(&v.to_le_bytes()),
        GgufValue::I8(v) => out.put(&v.to_le_bytes()),
        GgufValue::U16(v) => out.put(&v.to_le_bytes()),
        GgufValue::I16(v) => out.put(&v.to_le_bytes()),
        GgufValue::U32(v) => out.put(&v.to_le_bytes()),
        GgufValue::I32(v) => out.put(&v.to_le_bytes()),
        GgufValue::F32(v) => out.put(&v.to_le_bytes()),
        GgufValue::Bool(v) => out.put(&[u8::from(*v)]),
        GgufValue::String(s) => out.put_str(s),
        GgufValue::Array(element_type, items) => {
            out.put(&(*element_type as u32).to_le_bytes())?;
            out.put(&(items.len() as u64).to_le_bytes())?;
            for item in items {
                write_value(out, item)?;
            }
            Ok(())
        }
        GgufValue::U64(v) => out.put(&v.to_le_bytes()),
        GgufValue::I64(v) => out.put(&v.to_le_bytes()),
        GgufValue::F64(v) => out.put(&v.to_le_bytes()),
    }
}
