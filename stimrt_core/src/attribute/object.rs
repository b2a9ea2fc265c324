use super::clock::LogicalClock;
use super::ring::RingCore;
use super::spec::Layout;
use crate::error::{StimError, StimResult};
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::marker::PhantomData;
use std::sync::Arc;

const LEN_PREFIX: usize = 4;

/// Records returned by an object read, oldest first
#[derive(Debug, Clone, PartialEq)]
pub struct ObjectRead<T> {
    pub indices: Vec<u64>,
    pub timestamps: Vec<f64>,
    pub values: Vec<T>,
}

impl<T> ObjectRead<T> {
    pub fn len(&self) -> usize {
        self.indices.len()
    }

    pub fn is_empty(&self) -> bool {
        self.indices.is_empty()
    }
}

/// Extract the encoded payload from an object slot
pub(crate) fn object_payload<'a>(name: &str, slot: &'a [u8]) -> StimResult<&'a [u8]> {
    let mut prefix = [0u8; LEN_PREFIX];
    prefix.copy_from_slice(&slot[..LEN_PREFIX]);
    let len = u32::from_le_bytes(prefix) as usize;
    slot.get(LEN_PREFIX..LEN_PREFIX + len).ok_or_else(|| {
        StimError::Serialization(format!(
            "attribute '{}': corrupt object slot (length {})",
            name, len
        ))
    })
}

/// Typed handle on an object attribute; values travel as bincode
pub struct ObjectAttribute<T> {
    core: Arc<RingCore>,
    clock: LogicalClock,
    max_bytes: usize,
    _marker: PhantomData<fn() -> T>,
}

impl<T> Clone for ObjectAttribute<T> {
    fn clone(&self) -> Self {
        Self {
            core: Arc::clone(&self.core),
            clock: self.clock.clone(),
            max_bytes: self.max_bytes,
            _marker: PhantomData,
        }
    }
}

impl<T: Serialize + DeserializeOwned> ObjectAttribute<T> {
    pub fn new(core: Arc<RingCore>, clock: LogicalClock) -> StimResult<Self> {
        let max_bytes = match core.spec().layout {
            Layout::Object { max_bytes } => max_bytes,
            Layout::Array { dtype, .. } => {
                return Err(StimError::TypeMismatch(format!(
                    "attribute '{}' is an array of {}, accessed as object",
                    core.name(),
                    dtype
                )))
            }
        };
        Ok(Self {
            core,
            clock,
            max_bytes,
            _marker: PhantomData,
        })
    }

    pub fn name(&self) -> &str {
        self.core.name()
    }

    pub fn capacity(&self) -> usize {
        self.core.capacity()
    }

    pub fn write_index(&self) -> u64 {
        self.core.write_index()
    }

    pub fn write(&self, value: &T) -> StimResult<u64> {
        self.write_at(value, self.clock.now())
    }

    pub fn write_at(&self, value: &T, time: f64) -> StimResult<u64> {
        let encoded = bincode::serialize(value)?;
        if encoded.len() > self.max_bytes {
            return Err(StimError::ShapeMismatch(format!(
                "attribute '{}': encoded value is {} bytes, slot holds {}",
                self.name(),
                encoded.len(),
                self.max_bytes
            )));
        }
        self.core.write_slot(time, |slot| {
            slot[..LEN_PREFIX].copy_from_slice(&(encoded.len() as u32).to_le_bytes());
            slot[LEN_PREFIX..LEN_PREFIX + encoded.len()].copy_from_slice(&encoded);
            Ok(())
        })
    }

    pub fn read(&self, last_n: usize) -> StimResult<ObjectRead<T>> {
        self.read_with(last_n, true)
    }

    pub fn read_with(&self, last_n: usize, use_lock: bool) -> StimResult<ObjectRead<T>> {
        let mut out = ObjectRead {
            indices: Vec::with_capacity(last_n),
            timestamps: Vec::with_capacity(last_n),
            values: Vec::with_capacity(last_n),
        };
        let name = self.core.name();
        self.core.read(last_n, use_lock, |index, time, slot| {
            out.values.push(bincode::deserialize(object_payload(name, slot)?)?);
            out.indices.push(index);
            out.timestamps.push(time);
            Ok(())
        })?;
        Ok(out)
    }

    pub fn read_from(&self, from_index: u64) -> StimResult<ObjectRead<T>> {
        let mut out = ObjectRead {
            indices: Vec::new(),
            timestamps: Vec::new(),
            values: Vec::new(),
        };
        let name = self.core.name();
        self.core.read_from(from_index, true, |index, time, slot| {
            out.values.push(bincode::deserialize(object_payload(name, slot)?)?);
            out.indices.push(index);
            out.timestamps.push(time);
            Ok(())
        })?;
        Ok(out)
    }

    pub fn read_latest(&self) -> StimResult<Option<(u64, f64, T)>> {
        let read = self.read(1)?;
        Ok(read
            .values
            .into_iter()
            .next()
            .map(|value| (read.indices[0], read.timestamps[0], value)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::attribute::AttributeSpec;
    use serde::Deserialize;

    #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
    struct Stimulus {
        label: String,
        contrast: f32,
    }

    fn attr(dir: &std::path::Path, max_bytes: usize) -> ObjectAttribute<Stimulus> {
        let spec = AttributeSpec::object("stimulus", max_bytes, 3);
        let core = Arc::new(RingCore::create(dir, &spec).unwrap());
        ObjectAttribute::new(core, LogicalClock::new()).unwrap()
    }

    #[test]
    fn test_object_ring_wraps() {
        let dir = tempfile::tempdir().unwrap();
        let attr = attr(dir.path(), 128);
        for i in 0..5 {
            let value = Stimulus {
                label: format!("grating-{}", i),
                contrast: i as f32 / 10.0,
            };
            attr.write_at(&value, i as f64).unwrap();
        }

        let read = attr.read(2).unwrap();
        assert_eq!(read.indices, vec![3, 4]);
        assert_eq!(read.values[1].label, "grating-4");

        let (index, _, latest) = attr.read_latest().unwrap().unwrap();
        assert_eq!(index, 4);
        assert_eq!(latest.contrast, 0.4);
    }

    #[test]
    fn test_oversized_value_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let attr = attr(dir.path(), 8);
        let value = Stimulus {
            label: "far too long for eight bytes".into(),
            contrast: 1.0,
        };
        assert!(matches!(attr.write(&value), Err(StimError::ShapeMismatch(_))));
        assert_eq!(attr.write_index(), 0);
    }
}
