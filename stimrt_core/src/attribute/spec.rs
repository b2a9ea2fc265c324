use super::dtype::Dtype;
use crate::error::{StimError, StimResult};
use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};

// Safety limits for attribute declarations
pub const MAX_CAPACITY: usize = 1_000_000;
pub const MAX_DIMS: usize = 8;
pub const MAX_CHUNKS: usize = 64;
pub const MAX_SLOT_BYTES: usize = 64 * 1024 * 1024;
pub const MAX_TOTAL_BYTES: usize = 1024 * 1024 * 1024;

static NAME_PATTERN: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^[A-Za-z_][A-Za-z0-9_.\-]{0,127}$").expect("attribute name pattern is valid")
});

/// Record layout of an attribute
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum Layout {
    /// Fixed-shape numeric records
    Array { dtype: Dtype, shape: Vec<usize> },
    /// Serialized values of at most `max_bytes` bytes
    Object { max_bytes: usize },
}

impl Layout {
    /// Number of elements per record (1 for scalars and objects)
    pub fn record_len(&self) -> usize {
        match self {
            Layout::Array { shape, .. } => shape.iter().product(),
            Layout::Object { .. } => 1,
        }
    }

    /// Bytes occupied by one record, excluding ring bookkeeping
    pub fn slot_bytes(&self) -> usize {
        match self {
            Layout::Array { dtype, .. } => self.record_len() * dtype.size(),
            Layout::Object { max_bytes } => max_bytes + 4,
        }
    }
}

/// Declaration of one attribute, made by a routine during setup
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AttributeSpec {
    pub name: String,
    pub layout: Layout,
    pub capacity: usize,
    #[serde(default = "default_chunks")]
    pub chunks: usize,
    #[serde(default = "default_locking")]
    pub locking: bool,
}

fn default_chunks() -> usize {
    1
}

fn default_locking() -> bool {
    true
}

impl AttributeSpec {
    /// Array attribute with records of the given shape
    pub fn array(name: impl Into<String>, dtype: Dtype, shape: &[usize], capacity: usize) -> Self {
        Self {
            name: name.into(),
            layout: Layout::Array {
                dtype,
                shape: shape.to_vec(),
            },
            capacity,
            chunks: 1,
            locking: true,
        }
    }

    /// Array attribute holding one element per record
    pub fn scalar(name: impl Into<String>, dtype: Dtype, capacity: usize) -> Self {
        Self::array(name, dtype, &[], capacity)
    }

    pub fn object(name: impl Into<String>, max_bytes: usize, capacity: usize) -> Self {
        Self {
            name: name.into(),
            layout: Layout::Object { max_bytes },
            capacity,
            chunks: 1,
            locking: true,
        }
    }

    /// Split the ring into `chunks` equally sized, independently locked parts
    pub fn chunked(mut self, chunks: usize) -> Self {
        self.chunks = chunks;
        self
    }

    /// Disable slot locking; readers then accept stale or torn records
    pub fn without_lock(mut self) -> Self {
        self.locking = false;
        self
    }

    pub fn record_len(&self) -> usize {
        self.layout.record_len()
    }

    pub fn slot_bytes(&self) -> usize {
        self.layout.slot_bytes()
    }

    pub fn validate(&self) -> StimResult<()> {
        if !NAME_PATTERN.is_match(&self.name) {
            return Err(StimError::InvalidInput(format!(
                "invalid attribute name '{}'",
                self.name
            )));
        }
        if self.capacity == 0 || self.capacity > MAX_CAPACITY {
            return Err(StimError::InvalidInput(format!(
                "attribute '{}': capacity {} outside 1..={}",
                self.name, self.capacity, MAX_CAPACITY
            )));
        }
        if self.chunks == 0 || self.chunks > MAX_CHUNKS {
            return Err(StimError::InvalidInput(format!(
                "attribute '{}': chunk count {} outside 1..={}",
                self.name, self.chunks, MAX_CHUNKS
            )));
        }
        if self.capacity % self.chunks != 0 {
            return Err(StimError::InvalidInput(format!(
                "attribute '{}': capacity {} is not divisible into {} chunks",
                self.name, self.capacity, self.chunks
            )));
        }

        match &self.layout {
            Layout::Array { shape, .. } => {
                if shape.len() > MAX_DIMS {
                    return Err(StimError::InvalidInput(format!(
                        "attribute '{}': {} dimensions, maximum is {}",
                        self.name,
                        shape.len(),
                        MAX_DIMS
                    )));
                }
                if shape.iter().any(|&d| d == 0) {
                    return Err(StimError::InvalidInput(format!(
                        "attribute '{}': zero-sized dimension in {:?}",
                        self.name, shape
                    )));
                }
            }
            Layout::Object { max_bytes } => {
                if *max_bytes == 0 {
                    return Err(StimError::InvalidInput(format!(
                        "attribute '{}': object slots need max_bytes > 0",
                        self.name
                    )));
                }
                if self.chunks != 1 {
                    return Err(StimError::InvalidInput(format!(
                        "attribute '{}': only array attributes can be chunked",
                        self.name
                    )));
                }
            }
        }

        let slot_bytes = self.slot_bytes();
        if slot_bytes > MAX_SLOT_BYTES {
            return Err(StimError::InvalidInput(format!(
                "attribute '{}': record size {} exceeds maximum {}",
                self.name, slot_bytes, MAX_SLOT_BYTES
            )));
        }
        let total = slot_bytes
            .checked_mul(self.capacity)
            .filter(|&t| t <= MAX_TOTAL_BYTES)
            .ok_or_else(|| {
                StimError::InvalidInput(format!(
                    "attribute '{}': total size exceeds maximum {}",
                    self.name, MAX_TOTAL_BYTES
                ))
            })?;
        log::trace!("attribute '{}' validated ({} bytes)", self.name, total);
        Ok(())
    }
}
