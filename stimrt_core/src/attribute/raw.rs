use super::object::object_payload;
use super::ring::RingCore;
use super::spec::Layout;
use crate::error::StimResult;
use std::sync::Arc;

/// One record as raw bytes (array elements or encoded object payload)
#[derive(Debug, Clone, PartialEq)]
pub struct RawRecord {
    pub index: u64,
    pub time: f64,
    pub bytes: Vec<u8>,
}

/// Type-erased view of any attribute, used to forward records to a sink
#[derive(Debug, Clone)]
pub struct RawAttribute {
    core: Arc<RingCore>,
}

impl RawAttribute {
    pub fn new(core: Arc<RingCore>) -> Self {
        Self { core }
    }

    pub fn name(&self) -> &str {
        self.core.name()
    }

    pub fn layout(&self) -> &Layout {
        &self.core.spec().layout
    }

    /// Record shape as seen by a sink (empty for scalars and objects)
    pub fn shape(&self) -> Vec<usize> {
        match self.layout() {
            Layout::Array { shape, .. } => shape.clone(),
            Layout::Object { .. } => Vec::new(),
        }
    }

    pub fn dtype_name(&self) -> &'static str {
        match self.layout() {
            Layout::Array { dtype, .. } => dtype.name(),
            Layout::Object { .. } => "object",
        }
    }

    pub fn write_index(&self) -> u64 {
        self.core.write_index()
    }

    /// Records from `from_index` on, skipping overwritten ones.
    ///
    /// Returns the records, the next index to ask for, and how many records
    /// were lost to overwriting.
    pub fn read_since(&self, from_index: u64) -> StimResult<(Vec<RawRecord>, u64, u64)> {
        let mut records = Vec::new();
        let is_object = matches!(self.layout(), Layout::Object { .. });
        let name = self.core.name();
        let (next, skipped) = self.core.read_since(from_index, true, |index, time, slot| {
            let bytes = if is_object {
                object_payload(name, slot)?.to_vec()
            } else {
                slot.to_vec()
            };
            records.push(RawRecord { index, time, bytes });
            Ok(())
        })?;
        Ok((records, next, skipped))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::attribute::{AttributeSpec, Dtype, LogicalClock, ObjectAttribute};

    #[test]
    fn test_raw_view_strips_object_prefix() {
        let dir = tempfile::tempdir().unwrap();
        let core = Arc::new(RingCore::create(dir.path(), &AttributeSpec::object("o", 32, 4)).unwrap());
        let typed = ObjectAttribute::<u32>::new(Arc::clone(&core), LogicalClock::new()).unwrap();
        typed.write(&7).unwrap();

        let raw = RawAttribute::new(core);
        assert_eq!(raw.dtype_name(), "object");
        assert!(raw.shape().is_empty());
        let (records, next, skipped) = raw.read_since(0).unwrap();
        assert_eq!((next, skipped), (1, 0));
        assert_eq!(records[0].bytes, bincode::serialize(&7u32).unwrap());
    }

    #[test]
    fn test_raw_array_shape() {
        let dir = tempfile::tempdir().unwrap();
        let spec = AttributeSpec::array("img", Dtype::U8, &[2, 2], 2);
        let raw = RawAttribute::new(Arc::new(RingCore::create(dir.path(), &spec).unwrap()));
        assert_eq!(raw.shape(), vec![2, 2]);
        assert_eq!(raw.dtype_name(), "u8");
        let (records, next, _) = raw.read_since(0).unwrap();
        assert!(records.is_empty());
        assert_eq!(next, 0);
    }
}
