use super::clock::LogicalClock;
use super::dtype::Element;
use super::ring::RingCore;
use super::spec::Layout;
use crate::error::{StimError, StimResult};
use bytemuck::Zeroable;
use std::marker::PhantomData;
use std::sync::Arc;

/// Records returned by an array read, oldest first
#[derive(Debug, Clone, PartialEq)]
pub struct ArrayRead<T> {
    pub indices: Vec<u64>,
    pub timestamps: Vec<f64>,
    /// All records concatenated, `record_len` elements each
    pub values: Vec<T>,
    pub record_len: usize,
}

impl<T: Element> ArrayRead<T> {
    fn with_capacity(records: usize, record_len: usize) -> Self {
        Self {
            indices: Vec::with_capacity(records),
            timestamps: Vec::with_capacity(records),
            values: Vec::with_capacity(records * record_len),
            record_len,
        }
    }

    fn push(&mut self, index: u64, time: f64, bytes: &[u8]) {
        let start = self.values.len();
        self.values.resize(start + self.record_len, T::zeroed());
        bytemuck::cast_slice_mut::<T, u8>(&mut self.values[start..]).copy_from_slice(bytes);
        self.indices.push(index);
        self.timestamps.push(time);
    }

    pub fn len(&self) -> usize {
        self.indices.len()
    }

    pub fn is_empty(&self) -> bool {
        self.indices.is_empty()
    }

    /// The `i`-th record returned
    pub fn record(&self, i: usize) -> Option<&[T]> {
        let start = i.checked_mul(self.record_len)?;
        self.values.get(start..start + self.record_len)
    }

    pub fn records(&self) -> impl Iterator<Item = &[T]> {
        self.values.chunks_exact(self.record_len.max(1))
    }
}

/// Typed handle on an array attribute.
///
/// Clones share the same shared-memory ring. Only the producing routine's
/// process may call the write methods.
pub struct ArrayAttribute<T: Element> {
    core: Arc<RingCore>,
    clock: LogicalClock,
    shape: Vec<usize>,
    _marker: PhantomData<T>,
}

impl<T: Element> Clone for ArrayAttribute<T> {
    fn clone(&self) -> Self {
        Self {
            core: Arc::clone(&self.core),
            clock: self.clock.clone(),
            shape: self.shape.clone(),
            _marker: PhantomData,
        }
    }
}

impl<T: Element> ArrayAttribute<T> {
    pub fn new(core: Arc<RingCore>, clock: LogicalClock) -> StimResult<Self> {
        let shape = match &core.spec().layout {
            Layout::Array { dtype, shape } => {
                if !dtype.accepts(T::DTYPE) {
                    return Err(StimError::TypeMismatch(format!(
                        "attribute '{}' stores {}, accessed as {}",
                        core.name(),
                        dtype,
                        T::DTYPE
                    )));
                }
                shape.clone()
            }
            Layout::Object { .. } => {
                return Err(StimError::TypeMismatch(format!(
                    "attribute '{}' is object-typed, accessed as array of {}",
                    core.name(),
                    T::DTYPE
                )))
            }
        };
        Ok(Self {
            core,
            clock,
            shape,
            _marker: PhantomData,
        })
    }

    pub fn name(&self) -> &str {
        self.core.name()
    }

    pub fn shape(&self) -> &[usize] {
        &self.shape
    }

    pub fn record_len(&self) -> usize {
        self.core.spec().record_len()
    }

    pub fn capacity(&self) -> usize {
        self.core.capacity()
    }

    pub fn write_index(&self) -> u64 {
        self.core.write_index()
    }

    /// Append one record stamped with the current logical time
    pub fn write(&self, record: &[T]) -> StimResult<u64> {
        self.write_at(record, self.clock.now())
    }

    pub fn write_at(&self, record: &[T], time: f64) -> StimResult<u64> {
        if record.len() != self.record_len() {
            return Err(StimError::ShapeMismatch(format!(
                "attribute '{}' expects {} elements per record (shape {:?}), got {}",
                self.name(),
                self.record_len(),
                self.shape,
                record.len()
            )));
        }
        self.core.write_slot(time, |slot| {
            slot.copy_from_slice(bytemuck::cast_slice(record));
            Ok(())
        })
    }

    pub fn write_scalar(&self, value: T) -> StimResult<u64> {
        self.write(std::slice::from_ref(&value))
    }

    /// The most recent `last_n` records (locking read)
    pub fn read(&self, last_n: usize) -> StimResult<ArrayRead<T>> {
        self.read_with(last_n, true)
    }

    pub fn read_with(&self, last_n: usize, use_lock: bool) -> StimResult<ArrayRead<T>> {
        let mut out = ArrayRead::with_capacity(last_n, self.record_len());
        self.core.read(last_n, use_lock, |index, time, bytes| {
            out.push(index, time, bytes);
            Ok(())
        })?;
        Ok(out)
    }

    /// Every record from `from_index` on; empty when nothing new was written
    pub fn read_from(&self, from_index: u64) -> StimResult<ArrayRead<T>> {
        let mut out = ArrayRead::with_capacity(0, self.record_len());
        self.core.read_from(from_index, true, |index, time, bytes| {
            out.push(index, time, bytes);
            Ok(())
        })?;
        Ok(out)
    }

    /// The newest record as `(index, time, values)`, if any was written
    pub fn read_latest(&self) -> StimResult<Option<(u64, f64, Vec<T>)>> {
        let read = self.read(1)?;
        Ok(read
            .indices
            .first()
            .map(|&index| (index, read.timestamps[0], read.values)))
    }

    pub fn core(&self) -> &Arc<RingCore> {
        &self.core
    }
}

impl<T: Element> std::fmt::Debug for ArrayAttribute<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ArrayAttribute")
            .field("name", &self.name())
            .field("dtype", &T::DTYPE)
            .field("shape", &self.shape)
            .field("write_index", &self.write_index())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::attribute::{AttributeSpec, Dtype};

    fn scalar(dir: &std::path::Path, capacity: usize) -> ArrayAttribute<f64> {
        let spec = AttributeSpec::scalar("value", Dtype::F64, capacity);
        let core = Arc::new(RingCore::create(dir, &spec).unwrap());
        ArrayAttribute::new(core, LogicalClock::new()).unwrap()
    }

    #[test]
    fn test_capacity_four_scenario() {
        let dir = tempfile::tempdir().unwrap();
        let attr = scalar(dir.path(), 4);
        for t in 0..6 {
            attr.write_at(&[10.0 + t as f64], t as f64).unwrap();
        }

        let read = attr.read(3).unwrap();
        assert_eq!(read.indices, vec![3, 4, 5]);
        assert_eq!(read.timestamps, vec![3.0, 4.0, 5.0]);
        assert_eq!(read.values, vec![13.0, 14.0, 15.0]);
    }

    #[test]
    fn test_read_bounds() {
        let dir = tempfile::tempdir().unwrap();
        let attr = scalar(dir.path(), 4);
        attr.write_scalar(1.0).unwrap();

        assert!(matches!(attr.read(5), Err(StimError::Range(_))));
        assert!(attr.read(0).unwrap().is_empty());
        // Fewer records written than requested
        assert_eq!(attr.read(4).unwrap().len(), 1);
    }

    #[test]
    fn test_read_from() {
        let dir = tempfile::tempdir().unwrap();
        let attr = scalar(dir.path(), 8);
        for v in 0..5 {
            attr.write_scalar(v as f64).unwrap();
        }
        assert_eq!(attr.read_from(3).unwrap().values, vec![3.0, 4.0]);
        assert!(attr.read_from(5).unwrap().is_empty());
        assert!(attr.read_from(42).unwrap().is_empty());
    }

    #[test]
    fn test_write_uses_logical_clock() {
        let dir = tempfile::tempdir().unwrap();
        let attr = scalar(dir.path(), 4);
        attr.clock.set(2.5);
        attr.write_scalar(1.0).unwrap();
        let (index, time, values) = attr.read_latest().unwrap().unwrap();
        assert_eq!((index, time, values), (0, 2.5, vec![1.0]));
    }

    #[test]
    fn test_shape_and_type_checks() {
        let dir = tempfile::tempdir().unwrap();
        let spec = AttributeSpec::array("pos", Dtype::F32, &[2], 4);
        let core = Arc::new(RingCore::create(dir.path(), &spec).unwrap());

        assert!(matches!(
            ArrayAttribute::<f64>::new(Arc::clone(&core), LogicalClock::new()),
            Err(StimError::TypeMismatch(_))
        ));

        let attr = ArrayAttribute::<f32>::new(core, LogicalClock::new()).unwrap();
        assert!(matches!(
            attr.write(&[1.0, 2.0, 3.0]),
            Err(StimError::ShapeMismatch(_))
        ));
        attr.write(&[1.0, 2.0]).unwrap();
        attr.write(&[3.0, 4.0]).unwrap();
        let read = attr.read(2).unwrap();
        assert_eq!(read.record(1), Some(&[3.0f32, 4.0][..]));
        assert_eq!(read.records().count(), 2);
    }

    #[test]
    fn test_chunked_wrap() {
        let dir = tempfile::tempdir().unwrap();
        let spec = AttributeSpec::array("frames", Dtype::U8, &[3], 6).chunked(3);
        let core = Arc::new(RingCore::create(dir.path(), &spec).unwrap());
        let attr = ArrayAttribute::<u8>::new(core, LogicalClock::new()).unwrap();
        for v in 0..11u8 {
            attr.write(&[v, v, v]).unwrap();
        }
        let read = attr.read(6).unwrap();
        assert_eq!(read.indices, vec![5, 6, 7, 8, 9, 10]);
        for (record, expected) in read.records().zip(5u8..) {
            assert_eq!(record, &[expected; 3]);
        }
    }
}
