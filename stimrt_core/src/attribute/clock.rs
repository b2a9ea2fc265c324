use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

/// Process-local logical time stamped onto attribute writes.
///
/// The process core sets it once per tick; every attribute handle created
/// by the same registry shares the same clock.
#[derive(Debug, Clone, Default)]
pub struct LogicalClock {
    bits: Arc<AtomicU64>,
}

impl LogicalClock {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set(&self, time: f64) {
        self.bits.store(time.to_bits(), Ordering::Release);
    }

    pub fn now(&self) -> f64 {
        f64::from_bits(self.bits.load(Ordering::Acquire))
    }
}
