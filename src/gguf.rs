//! GGUF constants and metadata values for the adapter writer.
//!
//! GGUF (GGML Universal File) is the container the inference engine loads
//! adapters from. All integers are little-endian.
//!
//! ```text
//! magic "GGUF" u32 | version u32 | tensor count u64 | kv count u64
//! kv pairs:      key (u64 len + utf8) | value type u32 | value
//! tensor infos:  name | n_dims u32 | dims u64 × n (innermost first) | ggml type u32 | offset u64
//! padding to alignment
//! tensor data, each tensor padded to alignment
//! ```

/// GGUF file magic number.
pub const GGUF_MAGIC: u32 = 0x4655_4747; // "GGUF"

/// GGUF version (3 = latest stable).
pub const GGUF_VERSION: u32 = 3;

/// Alignment of the tensor data section and of each tensor within it.
pub const GGUF_DEFAULT_ALIGNMENT: u64 = 32;

/// GGML tensor type id for f32.
pub const GGML_TYPE_F32: u32 = 0;

/// Metadata keys written to adapter containers.
pub mod keys {
    /// Base-model architecture the adapter targets.
    pub const GENERAL_ARCHITECTURE: &str = "general.architecture";
    /// Container kind; `"adapter"` for adapters.
    pub const GENERAL_TYPE: &str = "general.type";
    /// Optional human-readable name.
    pub const GENERAL_NAME: &str = "general.name";
    /// Adapter kind; `"lora"`.
    pub const ADAPTER_TYPE: &str = "adapter.type";
    /// `LoRA` alpha as f32.
    pub const ADAPTER_LORA_ALPHA: &str = "adapter.lora.alpha";
}

/// Container kind marking an adapter file.
pub const CONTAINER_KIND_ADAPTER: &str = "adapter";

/// Adapter kind for low-rank adapters.
pub const ADAPTER_KIND_LORA: &str = "lora";

/// GGUF metadata value type ids.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
#[allow(missing_docs)]
pub enum GgufValueType {
    U8 = 0,
    I8 = 1,
    U16 = 2,
    I16 = 3,
    U32 = 4,
    I32 = 5,
    F32 = 6,
    Bool = 7,
    String = 8,
    Array = 9,
    U64 = 10,
    I64 = 11,
    F64 = 12,
}

/// A typed GGUF metadata value.
#[derive(Debug, Clone, PartialEq)]
#[allow(missing_docs)]
pub enum GgufValue {
    U8(u8),
    I8(i8),
    U16(u16),
    I16(i16),
    U32(u32),
    I32(i32),
    F32(f32),
    Bool(bool),
    String(String),
    /// Element type and elements.
    Array(GgufValueType, Vec<GgufValue>),
    U64(u64),
    I64(i64),
    F64(f64),
}

impl GgufValue {
    /// Type id written before the value.
    #[must_use]
    pub fn value_type(&self) -> GgufValueType {
        match self {
            Self::U8(_) => GgufValueType::U8,
            Self::I8(_) => GgufValueType::I8,
            Self::U16(_) => GgufValueType::U16,
            Self::I16(_) => GgufValueType::I16,
            Self::U32(_) => GgufValueType::U32,
            Self::I32(_) => GgufValueType::I32,
            Self::F32(_) => GgufValueType::F32,
            Self::Bool(_) => GgufValueType::Bool,
            Self::String(_) => GgufValueType::String,
            Self::Array(..) => GgufValueType::Array,
            Self::U64(_) => GgufValueType::U64,
            Self::I64(_) => GgufValueType::I64,
            Self::F64(_) => GgufValueType::F64,
        }
    }

    /// String payload, if this is a string.
    #[must_use]
    pub fn as_str(&self) -> Option<&str> {
        match self {
            Self::String(s) => Some(s),
            _ => None,
        }
    }

    /// Float payload widened or narrowed to f32.
    #[must_use]
    #[allow(clippy::cast_possible_truncation)]
    pub fn as_f32(&self) -> Option<f32> {
        match self {
            Self::F32(v) => Some(*v),
            Self::F64(v) => Some(*v as f32),
            _ => None,
        }
    }
}

/// Round `offset` up to the next multiple of `alignment`.
#[must_use]
pub fn align_offset(offset: u64, alignment: u64) -> u64 {
    offset.div_ceil(alignment) * alignment
}
