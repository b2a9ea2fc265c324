use super::dtype::Dtype;
use super::spec::{AttributeSpec, Layout, MAX_CHUNKS, MAX_DIMS};
use crate::error::{StimError, StimResult};
use crate::memory::{ShmMutex, ShmMutexGuard, ShmRegion};
use std::mem;
use std::path::Path;
use std::ptr::NonNull;
use std::sync::atomic::{AtomicU64, Ordering};

const RING_MAGIC: u64 = 0x5354_494d_5249_4e47;
const KIND_ARRAY: u8 = 1;
const KIND_OBJECT: u8 = 2;

/// Header at the start of every attribute region.
///
/// Plain fields are written once by the creator before any other process
/// opens the region; only `write_index` and the chunk locks change afterwards.
#[repr(C, align(64))]
struct RingHeader {
    magic: AtomicU64,
    capacity: u64,
    slot_bytes: u64,
    slot_stride: u64,
    max_bytes: u64,
    chunk_count: u32,
    kind: u8,
    dtype: u8,
    locking: u8,
    ndim: u8,
    shape: [u64; MAX_DIMS],
    write_index: AtomicU64,
    locks: [ShmMutex; MAX_CHUNKS],
}

/// Untyped circular store shared by every attribute kind.
///
/// Region layout after the header: `capacity` absolute write indices,
/// `capacity` timestamps (f64 bit patterns), then `capacity` data slots of
/// `slot_stride` bytes each. Exactly one process writes; any number read.
pub struct RingCore {
    _region: ShmRegion,
    header: NonNull<RingHeader>,
    indices: NonNull<AtomicU64>,
    times: NonNull<AtomicU64>,
    data: NonNull<u8>,
    spec: AttributeSpec,
    capacity: u64,
    chunk_len: usize,
    slot_bytes: usize,
    slot_stride: usize,
}

unsafe impl Send for RingCore {}
unsafe impl Sync for RingCore {}

fn region_size(capacity: usize, slot_stride: usize) -> StimResult<usize> {
    let bookkeeping = capacity
        .checked_mul(2 * mem::size_of::<u64>())
        .ok_or_else(|| StimError::InvalidInput("attribute size overflow".into()))?;
    capacity
        .checked_mul(slot_stride)
        .and_then(|data| data.checked_add(bookkeeping))
        .and_then(|body| body.checked_add(mem::size_of::<RingHeader>()))
        .ok_or_else(|| StimError::InvalidInput("attribute size overflow".into()))
}

impl RingCore {
    /// Create the shared region for a declared attribute
    pub fn create(dir: &Path, spec: &AttributeSpec) -> StimResult<Self> {
        spec.validate()?;
        let slot_bytes = spec.slot_bytes();
        let slot_stride = slot_bytes.div_ceil(8) * 8;
        let size = region_size(spec.capacity, slot_stride)?;
        let region = ShmRegion::create(dir, &spec.name, size)?;

        let header_ptr = region.as_ptr() as *mut RingHeader;
        // Region is zero-filled, which is a valid state for every atomic and lock.
        unsafe {
            (*header_ptr).capacity = spec.capacity as u64;
            (*header_ptr).slot_bytes = slot_bytes as u64;
            (*header_ptr).slot_stride = slot_stride as u64;
            (*header_ptr).chunk_count = spec.chunks as u32;
            (*header_ptr).locking = spec.locking as u8;
            match &spec.layout {
                Layout::Array { dtype, shape } => {
                    (*header_ptr).kind = KIND_ARRAY;
                    (*header_ptr).dtype = dtype.code();
                    (*header_ptr).ndim = shape.len() as u8;
                    for (dst, &dim) in (*header_ptr).shape.iter_mut().zip(shape) {
                        *dst = dim as u64;
                    }
                }
                Layout::Object { max_bytes } => {
                    (*header_ptr).kind = KIND_OBJECT;
                    (*header_ptr).max_bytes = *max_bytes as u64;
                }
            }
            (*header_ptr).magic.store(RING_MAGIC, Ordering::Release);
        }

        log::debug!(
            "created attribute '{}' ({} slots x {} bytes, {} chunk(s))",
            spec.name,
            spec.capacity,
            slot_bytes,
            spec.chunks
        );
        Self::from_region(region, spec.clone())
    }

    /// Attach to an attribute created by another process (or earlier in this one)
    pub fn open(dir: &Path, name: &str) -> StimResult<Self> {
        let region = ShmRegion::open(dir, name)?;
        if region.size() < mem::size_of::<RingHeader>() {
            return Err(StimError::Internal(format!(
                "attribute region '{}' is smaller than its header",
                name
            )));
        }

        let header = unsafe { &*(region.as_ptr() as *const RingHeader) };
        if header.magic.load(Ordering::Acquire) != RING_MAGIC {
            return Err(StimError::Internal(format!(
                "attribute region '{}' is not initialised",
                name
            )));
        }

        let layout = match header.kind {
            KIND_ARRAY => {
                let dtype = Dtype::from_code(header.dtype).ok_or_else(|| {
                    StimError::TypeMismatch(format!(
                        "attribute '{}' has unknown dtype code {}",
                        name, header.dtype
                    ))
                })?;
                let ndim = (header.ndim as usize).min(MAX_DIMS);
                Layout::Array {
                    dtype,
                    shape: header.shape[..ndim].iter().map(|&d| d as usize).collect(),
                }
            }
            KIND_OBJECT => Layout::Object {
                max_bytes: header.max_bytes as usize,
            },
            other => {
                return Err(StimError::Internal(format!(
                    "attribute '{}' has unknown kind {}",
                    name, other
                )))
            }
        };
        let spec = AttributeSpec {
            name: name.to_string(),
            layout,
            capacity: header.capacity as usize,
            chunks: header.chunk_count as usize,
            locking: header.locking != 0,
        };
        spec.validate()?;

        let expected = region_size(spec.capacity, header.slot_stride as usize)?;
        if region.size() < expected {
            return Err(StimError::ShapeMismatch(format!(
                "attribute region '{}' holds {} bytes, layout needs {}",
                name,
                region.size(),
                expected
            )));
        }
        Self::from_region(region, spec)
    }

    fn from_region(region: ShmRegion, spec: AttributeSpec) -> StimResult<Self> {
        let base = region.as_ptr();
        let capacity = spec.capacity;
        let slot_bytes = spec.slot_bytes();
        let slot_stride = slot_bytes.div_ceil(8) * 8;
        let header_size = mem::size_of::<RingHeader>();

        let null = || StimError::Internal(format!("null pointer in attribute '{}'", spec.name));
        let header = NonNull::new(base as *mut RingHeader).ok_or_else(null)?;
        let indices =
            NonNull::new(unsafe { base.add(header_size) } as *mut AtomicU64).ok_or_else(null)?;
        let times = NonNull::new(unsafe { base.add(header_size + capacity * 8) } as *mut AtomicU64)
            .ok_or_else(null)?;
        let data = NonNull::new(unsafe { base.add(header_size + capacity * 16) }).ok_or_else(null)?;

        Ok(Self {
            _region: region,
            header,
            indices,
            times,
            data,
            capacity: capacity as u64,
            chunk_len: capacity / spec.chunks,
            slot_bytes,
            slot_stride,
            spec,
        })
    }

    #[inline]
    fn header(&self) -> &RingHeader {
        unsafe { self.header.as_ref() }
    }

    #[inline]
    fn index_slot(&self, slot: usize) -> &AtomicU64 {
        unsafe { &*self.indices.as_ptr().add(slot) }
    }

    #[inline]
    fn time_slot(&self, slot: usize) -> &AtomicU64 {
        unsafe { &*self.times.as_ptr().add(slot) }
    }

    #[inline]
    fn data_slot(&self, slot: usize) -> *mut u8 {
        unsafe { self.data.as_ptr().add(slot * self.slot_stride) }
    }

    pub fn spec(&self) -> &AttributeSpec {
        &self.spec
    }

    pub fn name(&self) -> &str {
        &self.spec.name
    }

    pub fn capacity(&self) -> usize {
        self.capacity as usize
    }

    pub fn slot_bytes(&self) -> usize {
        self.slot_bytes
    }

    /// Number of records written so far (index of the next record)
    pub fn write_index(&self) -> u64 {
        self.header().write_index.load(Ordering::Acquire)
    }

    fn lock_chunk(&self, slot: usize) -> Option<ShmMutexGuard<'_>> {
        if self.spec.locking {
            Some(self.header().locks[slot / self.chunk_len].lock())
        } else {
            None
        }
    }

    /// Produce the next record.
    ///
    /// `fill` receives the slot's bytes while the slot's chunk lock is held.
    /// The record becomes visible only after data, index and timestamp are
    /// all stored. If `fill` fails nothing is published.
    pub fn write_slot<F>(&self, time: f64, fill: F) -> StimResult<u64>
    where
        F: FnOnce(&mut [u8]) -> StimResult<()>,
    {
        let header = self.header();
        let index = header.write_index.load(Ordering::Relaxed);
        let slot = (index % self.capacity) as usize;

        {
            let _guard = self.lock_chunk(slot);
            let bytes =
                unsafe { std::slice::from_raw_parts_mut(self.data_slot(slot), self.slot_bytes) };
            fill(bytes)?;
            self.index_slot(slot).store(index, Ordering::Relaxed);
            self.time_slot(slot).store(time.to_bits(), Ordering::Relaxed);
        }

        header.write_index.store(index + 1, Ordering::Release);
        Ok(index)
    }

    /// Visit the most recent `last_n` records, oldest first.
    ///
    /// `last_n` may not exceed the capacity. Fewer records are visited when
    /// fewer have been written.
    pub fn read<F>(&self, last_n: usize, use_lock: bool, visit: F) -> StimResult<()>
    where
        F: FnMut(u64, f64, &[u8]) -> StimResult<()>,
    {
        if last_n as u64 > self.capacity {
            return Err(StimError::range(format!(
                "attribute '{}': cannot read {} records from a ring of {}",
                self.spec.name, last_n, self.capacity
            )));
        }
        let end = self.write_index();
        let start = end.saturating_sub(last_n as u64);
        self.read_range(start, end, use_lock, visit)
    }

    /// Visit every record from `from_index` up to the current write index
    pub fn read_from<F>(&self, from_index: u64, use_lock: bool, visit: F) -> StimResult<()>
    where
        F: FnMut(u64, f64, &[u8]) -> StimResult<()>,
    {
        let end = self.write_index();
        if from_index >= end {
            return Ok(());
        }
        if end - from_index > self.capacity {
            return Err(StimError::range(format!(
                "attribute '{}': index {} was overwritten (write index {}, capacity {})",
                self.spec.name, from_index, end, self.capacity
            )));
        }
        self.read_range(from_index, end, use_lock, visit)
    }

    /// Like `read_from`, but skips records that were already overwritten.
    ///
    /// Returns `(next_index, skipped)`.
    pub fn read_since<F>(&self, from_index: u64, use_lock: bool, visit: F) -> StimResult<(u64, u64)>
    where
        F: FnMut(u64, f64, &[u8]) -> StimResult<()>,
    {
        let end = self.write_index();
        let start = from_index.max(end.saturating_sub(self.capacity));
        if start >= end {
            return Ok((end.max(from_index), 0));
        }
        self.read_range(start, end, use_lock, visit)?;
        Ok((end, start - from_index))
    }

    fn read_range<F>(&self, start: u64, end: u64, use_lock: bool, mut visit: F) -> StimResult<()>
    where
        F: FnMut(u64, f64, &[u8]) -> StimResult<()>,
    {
        let lock = use_lock && self.spec.locking;
        let mut scratch = vec![0u8; self.slot_bytes];
        let mut held: Option<(usize, ShmMutexGuard<'_>)> = None;

        // A wrapped range is simply two runs of slots; chunks are locked one at a time.
        for index in start..end {
            let slot = (index % self.capacity) as usize;
            if lock {
                let chunk = slot / self.chunk_len;
                if held.as_ref().map(|(c, _)| *c) != Some(chunk) {
                    drop(held.take());
                    held = Some((chunk, self.header().locks[chunk].lock()));
                }
            }

            unsafe {
                std::ptr::copy_nonoverlapping(
                    self.data_slot(slot),
                    scratch.as_mut_ptr(),
                    self.slot_bytes,
                );
            }
            let stored = self.index_slot(slot).load(Ordering::Relaxed);
            let time = f64::from_bits(self.time_slot(slot).load(Ordering::Relaxed));
            visit(stored, time, &scratch)?;
        }
        drop(held);
        Ok(())
    }
}

impl std::fmt::Debug for RingCore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RingCore")
            .field("name", &self.spec.name)
            .field("capacity", &self.capacity)
            .field("write_index", &self.write_index())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn collect(core: &RingCore, last_n: usize) -> StimResult<Vec<(u64, f64, u64)>> {
        let mut out = Vec::new();
        core.read(last_n, true, |i, t, bytes| {
            let mut raw = [0u8; 8];
            raw.copy_from_slice(&bytes[..8]);
            out.push((i, t, u64::from_le_bytes(raw)));
            Ok(())
        })?;
        Ok(out)
    }

    fn write_u64(core: &RingCore, value: u64, time: f64) {
        core.write_slot(time, |slot| {
            slot.copy_from_slice(&value.to_le_bytes());
            Ok(())
        })
        .unwrap();
    }

    #[test]
    fn test_create_then_open_sees_same_layout() {
        let dir = tempfile::tempdir().unwrap();
        let spec = AttributeSpec::array("frame", Dtype::U16, &[4, 3], 6).chunked(3);
        let created = RingCore::create(dir.path(), &spec).unwrap();
        let opened = RingCore::open(dir.path(), "frame").unwrap();
        assert_eq!(opened.spec(), created.spec());
        assert_eq!(opened.slot_bytes(), 24);
    }

    #[test]
    fn test_wrapped_read_is_ordered() {
        let dir = tempfile::tempdir().unwrap();
        let core = RingCore::create(dir.path(), &AttributeSpec::scalar("x", Dtype::U64, 4)).unwrap();
        for v in 0..7u64 {
            write_u64(&core, v, v as f64);
        }
        let records = collect(&core, 4).unwrap();
        assert_eq!(
            records,
            vec![(3, 3.0, 3), (4, 4.0, 4), (5, 5.0, 5), (6, 6.0, 6)]
        );
    }

    #[test]
    fn test_failed_fill_publishes_nothing() {
        let dir = tempfile::tempdir().unwrap();
        let core = RingCore::create(dir.path(), &AttributeSpec::scalar("x", Dtype::U64, 4)).unwrap();
        let result = core.write_slot(0.0, |_| Err(StimError::ShapeMismatch("nope".into())));
        assert!(result.is_err());
        assert_eq!(core.write_index(), 0);
    }

    #[test]
    fn test_read_since_skips_overwritten() {
        let dir = tempfile::tempdir().unwrap();
        let core = RingCore::create(dir.path(), &AttributeSpec::scalar("x", Dtype::U64, 4)).unwrap();
        for v in 0..10u64 {
            write_u64(&core, v, 0.0);
        }
        let mut seen = Vec::new();
        let (next, skipped) = core
            .read_since(2, true, |i, _, _| {
                seen.push(i);
                Ok(())
            })
            .unwrap();
        assert_eq!(next, 10);
        assert_eq!(skipped, 4);
        assert_eq!(seen, vec![6, 7, 8, 9]);

        assert!(core.read_from(2, true, |_, _, _| Ok(())).is_err());
    }
}
