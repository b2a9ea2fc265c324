use std::sync::atomic::{fence, AtomicU32, AtomicU64, AtomicU8, Ordering};

/// Maximum number of UTF-8 bytes a `SeqText` slot holds
pub const SEQ_TEXT_CAPACITY: usize = 512;

/// Fixed-capacity text slot with a single writer and lock-free readers.
///
/// The writer bumps `seq` to an odd value, writes, then bumps it back to even.
/// Readers retry until they observe the same even sequence before and after
/// copying. An all-zero slot reads as the empty string.
#[repr(C)]
pub struct SeqText {
    seq: AtomicU64,
    len: AtomicU32,
    bytes: [AtomicU8; SEQ_TEXT_CAPACITY],
}

impl SeqText {
    pub fn new() -> Self {
        Self {
            seq: AtomicU64::new(0),
            len: AtomicU32::new(0),
            bytes: std::array::from_fn(|_| AtomicU8::new(0)),
        }
    }

    /// Store `text`, truncated to the capacity at a char boundary.
    ///
    /// Returns `false` when the text had to be truncated.
    pub fn set(&self, text: &str) -> bool {
        let mut end = text.len().min(SEQ_TEXT_CAPACITY);
        while !text.is_char_boundary(end) {
            end -= 1;
        }
        let data = &text.as_bytes()[..end];

        self.seq.fetch_add(1, Ordering::AcqRel);
        fence(Ordering::Release);
        for (slot, byte) in self.bytes.iter().zip(data) {
            slot.store(*byte, Ordering::Relaxed);
        }
        self.len.store(end as u32, Ordering::Relaxed);
        self.seq.fetch_add(1, Ordering::Release);

        end == text.len()
    }

    pub fn clear(&self) {
        self.set("");
    }

    pub fn get(&self) -> String {
        let mut buf = Vec::with_capacity(64);
        loop {
            let before = self.seq.load(Ordering::Acquire);
            if before % 2 == 1 {
                std::hint::spin_loop();
                continue;
            }

            let len = (self.len.load(Ordering::Relaxed) as usize).min(SEQ_TEXT_CAPACITY);
            buf.clear();
            buf.extend(self.bytes[..len].iter().map(|b| b.load(Ordering::Relaxed)));

            fence(Ordering::Acquire);
            if self.seq.load(Ordering::Relaxed) == before {
                return String::from_utf8_lossy(&buf).into_owned();
            }
        }
    }

    pub fn is_empty(&self) -> bool {
        self.get().is_empty()
    }
}

impl Default for SeqText {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for SeqText {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_tuple("SeqText").field(&self.get()).finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[test]
    fn test_set_get() {
        let text = SeqText::new();
        assert!(text.is_empty());
        assert!(text.set("grating_protocol"));
        assert_eq!(text.get(), "grating_protocol");
        text.clear();
        assert_eq!(text.get(), "");
    }

    #[test]
    fn test_truncates_at_char_boundary() {
        let text = SeqText::new();
        let long = "é".repeat(SEQ_TEXT_CAPACITY);
        assert!(!text.set(&long));
        let stored = text.get();
        assert!(stored.len() <= SEQ_TEXT_CAPACITY);
        assert!(stored.chars().all(|c| c == 'é'));
    }

    #[test]
    fn test_readers_never_see_torn_text() {
        let text = Arc::new(SeqText::new());
        let writer = {
            let text = Arc::clone(&text);
            std::thread::spawn(move || {
                for i in 0..5_000 {
                    let c = if i % 2 == 0 { "a" } else { "b" };
                    text.set(&c.repeat(100));
                }
            })
        };

        for _ in 0..5_000 {
            let value = text.get();
            if !value.is_empty() {
                assert_eq!(value.len(), 100);
                let first = value.as_bytes()[0];
                assert!(value.bytes().all(|b| b == first));
            }
        }
        writer.join().unwrap();
    }
}
