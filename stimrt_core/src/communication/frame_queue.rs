use crate::error::{StimError, StimResult};
use crate::memory::{ShmMutex, ShmRegion};
use std::mem;
use std::path::Path;
use std::ptr::NonNull;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};

const QUEUE_MAGIC: u64 = 0x5354_494d_5155_4555;
const LEN_PREFIX: usize = 4;

pub const DEFAULT_QUEUE_BYTES: usize = 256 * 1024;

/// Header for a frame queue region
#[repr(C, align(64))]
struct QueueHeader {
    magic: AtomicU64,
    capacity: u64,
    /// Total bytes ever written; only producers advance it
    head: AtomicU64,
    /// Total bytes ever consumed; only the consumer advances it
    tail: AtomicU64,
    /// Frames rejected because the queue was full
    dropped: AtomicU64,
    closed: AtomicU32,
    producer_lock: ShmMutex,
    consumer_lock: ShmMutex,
    _padding: [u8; 12],
}

/// Shared-memory ring of variable-length byte frames.
///
/// Frames are stored as a little-endian `u32` length followed by the
/// payload, wrapping around the end of the data area. Producers serialize
/// on a shared lock so the queue also serves many-to-one traffic (logs).
/// A sender never blocks: a full queue is an error, not a wait.
pub struct FrameQueue {
    _region: ShmRegion,
    header: NonNull<QueueHeader>,
    data: NonNull<u8>,
    capacity: usize,
    name: String,
}

unsafe impl Send for FrameQueue {}
unsafe impl Sync for FrameQueue {}

impl FrameQueue {
    pub fn create(dir: &Path, name: &str, capacity: usize) -> StimResult<Self> {
        if capacity <= LEN_PREFIX {
            return Err(StimError::InvalidInput(format!(
                "queue '{}' capacity {} is too small",
                name, capacity
            )));
        }
        let region = ShmRegion::create(dir, name, mem::size_of::<QueueHeader>() + capacity)?;
        let header = region.as_ptr() as *mut QueueHeader;
        unsafe {
            (*header).capacity = capacity as u64;
            (*header).magic.store(QUEUE_MAGIC, Ordering::Release);
        }
        Self::from_region(region, name)
    }

    pub fn open(dir: &Path, name: &str) -> StimResult<Self> {
        let region = ShmRegion::open(dir, name)?;
        if region.size() <= mem::size_of::<QueueHeader>() {
            return Err(StimError::Internal(format!("queue '{}' is truncated", name)));
        }
        let header = unsafe { &*(region.as_ptr() as *const QueueHeader) };
        if header.magic.load(Ordering::Acquire) != QUEUE_MAGIC {
            return Err(StimError::Internal(format!("queue '{}' is not initialised", name)));
        }
        Self::from_region(region, name)
    }

    fn from_region(region: ShmRegion, name: &str) -> StimResult<Self> {
        let base = region.as_ptr();
        let header = NonNull::new(base as *mut QueueHeader)
            .ok_or_else(|| StimError::Internal(format!("null queue header '{}'", name)))?;
        let capacity = unsafe { header.as_ref() }.capacity as usize;
        if mem::size_of::<QueueHeader>() + capacity > region.size() {
            return Err(StimError::Internal(format!(
                "queue '{}' header claims {} bytes, region holds {}",
                name,
                capacity,
                region.size()
            )));
        }
        let data = NonNull::new(unsafe { base.add(mem::size_of::<QueueHeader>()) })
            .ok_or_else(|| StimError::Internal(format!("null queue data '{}'", name)))?;

        Ok(Self {
            _region: region,
            header,
            data,
            capacity,
            name: name.to_string(),
        })
    }

    #[inline]
    fn header(&self) -> &QueueHeader {
        unsafe { self.header.as_ref() }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Bytes currently queued (including length prefixes)
    pub fn pending_bytes(&self) -> usize {
        let header = self.header();
        let head = header.head.load(Ordering::Acquire);
        let tail = header.tail.load(Ordering::Acquire);
        (head - tail) as usize
    }

    pub fn is_empty(&self) -> bool {
        self.pending_bytes() == 0
    }

    /// Mark the queue closed; further pushes fail, queued frames stay readable
    pub fn close(&self) {
        self.header().closed.store(1, Ordering::Release);
    }

    pub fn is_closed(&self) -> bool {
        self.header().closed.load(Ordering::Acquire) != 0
    }

    pub fn dropped(&self) -> u64 {
        self.header().dropped.load(Ordering::Relaxed)
    }

    pub fn push(&self, frame: &[u8]) -> StimResult<()> {
        if self.is_closed() {
            return Err(StimError::ChannelClosed(self.name.clone()));
        }
        let needed = LEN_PREFIX + frame.len();
        if needed > self.capacity || frame.len() > u32::MAX as usize {
            return Err(StimError::InvalidInput(format!(
                "frame of {} bytes does not fit queue '{}' ({} bytes)",
                frame.len(),
                self.name,
                self.capacity
            )));
        }

        let header = self.header();
        let _guard = header.producer_lock.lock();
        let head = header.head.load(Ordering::Relaxed);
        let tail = header.tail.load(Ordering::Acquire);
        let free = self.capacity - (head - tail) as usize;
        if needed > free {
            header.dropped.fetch_add(1, Ordering::Relaxed);
            return Err(StimError::ChannelFull(self.name.clone()));
        }

        self.copy_in(head, &(frame.len() as u32).to_le_bytes());
        self.copy_in(head + LEN_PREFIX as u64, frame);
        header.head.store(head + needed as u64, Ordering::Release);
        Ok(())
    }

    /// Take the oldest frame, if any
    pub fn pop(&self) -> Option<Vec<u8>> {
        let header = self.header();
        let _guard = header.consumer_lock.lock();
        let tail = header.tail.load(Ordering::Relaxed);
        let head = header.head.load(Ordering::Acquire);
        if head == tail {
            return None;
        }

        let mut prefix = [0u8; LEN_PREFIX];
        self.copy_out(tail, &mut prefix);
        let len = u32::from_le_bytes(prefix) as usize;
        let mut frame = vec![0u8; len];
        self.copy_out(tail + LEN_PREFIX as u64, &mut frame);
        header
            .tail
            .store(tail + (LEN_PREFIX + len) as u64, Ordering::Release);
        Some(frame)
    }

    /// Pop every queued frame
    pub fn drain(&self) -> Vec<Vec<u8>> {
        std::iter::from_fn(|| self.pop()).collect()
    }

    fn copy_in(&self, position: u64, bytes: &[u8]) {
        let start = (position % self.capacity as u64) as usize;
        let first = bytes.len().min(self.capacity - start);
        unsafe {
            let base = self.data.as_ptr();
            std::ptr::copy_nonoverlapping(bytes.as_ptr(), base.add(start), first);
            std::ptr::copy_nonoverlapping(bytes.as_ptr().add(first), base, bytes.len() - first);
        }
    }

    fn copy_out(&self, position: u64, out: &mut [u8]) {
        let start = (position % self.capacity as u64) as usize;
        let first = out.len().min(self.capacity - start);
        unsafe {
            let base = self.data.as_ptr();
            std::ptr::copy_nonoverlapping(base.add(start), out.as_mut_ptr(), first);
            std::ptr::copy_nonoverlapping(base, out.as_mut_ptr().add(first), out.len() - first);
        }
    }
}

impl std::fmt::Debug for FrameQueue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FrameQueue")
            .field("name", &self.name)
            .field("capacity", &self.capacity)
            .field("pending_bytes", &self.pending_bytes())
            .field("closed", &self.is_closed())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fifo_across_handles() {
        let dir = tempfile::tempdir().unwrap();
        let tx = FrameQueue::create(dir.path(), "q", 64).unwrap();
        let rx = FrameQueue::open(dir.path(), "q").unwrap();
        tx.push(b"first").unwrap();
        tx.push(b"second").unwrap();
        assert_eq!(rx.pop().as_deref(), Some(&b"first"[..]));
        assert_eq!(rx.pop().as_deref(), Some(&b"second"[..]));
        assert!(rx.pop().is_none());
    }

    #[test]
    fn test_wraps_around_end() {
        let dir = tempfile::tempdir().unwrap();
        let queue = FrameQueue::create(dir.path(), "wrap", 32).unwrap();
        for round in 0..20u8 {
            let frame = [round; 11];
            queue.push(&frame).unwrap();
            assert_eq!(queue.pop().unwrap(), frame.to_vec());
        }
        assert!(queue.is_empty());
    }

    #[test]
    fn test_full_and_closed() {
        let dir = tempfile::tempdir().unwrap();
        let queue = FrameQueue::create(dir.path(), "small", 16).unwrap();
        queue.push(&[1; 8]).unwrap();
        assert!(matches!(queue.push(&[2; 8]), Err(StimError::ChannelFull(_))));
        assert!(matches!(queue.push(&[0; 64]), Err(StimError::InvalidInput(_))));
        assert_eq!(queue.dropped(), 1);

        queue.close();
        assert!(matches!(queue.push(&[3]), Err(StimError::ChannelClosed(_))));
        // Frames queued before closing are still delivered
        assert_eq!(queue.drain(), vec![vec![1; 8]]);
    }

    #[test]
    fn test_many_producers() {
        let dir = tempfile::tempdir().unwrap();
        let queue = std::sync::Arc::new(FrameQueue::create(dir.path(), "mp", 64 * 1024).unwrap());
        let producers: Vec<_> = (0..4u8)
            .map(|p| {
                let queue = std::sync::Arc::clone(&queue);
                std::thread::spawn(move || {
                    for i in 0..100u8 {
                        queue.push(&[p, i]).unwrap();
                    }
                })
            })
            .collect();
        for producer in producers {
            producer.join().unwrap();
        }

        let frames = queue.drain();
        assert_eq!(frames.len(), 400);
        for p in 0..4u8 {
            let order: Vec<u8> = frames.iter().filter(|f| f[0] == p).map(|f| f[1]).collect();
            assert_eq!(order, (0..100).collect::<Vec<_>>());
        }
    }
}
