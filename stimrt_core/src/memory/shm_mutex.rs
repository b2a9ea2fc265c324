use crossbeam::utils::Backoff;
use std::sync::atomic::{AtomicU32, Ordering};

const UNLOCKED: u32 = 0;
const LOCKED: u32 = 1;

/// Process-shared spin mutex placed inside a shared memory region.
///
/// An all-zero word is a valid unlocked mutex, so freshly created regions
/// need no initialisation.
#[repr(C)]
#[derive(Debug, Default)]
pub struct ShmMutex {
    locked: AtomicU32,
}

impl ShmMutex {
    pub const fn new() -> Self {
        Self {
            locked: AtomicU32::new(UNLOCKED),
        }
    }

    /// Spin (then yield) until the lock is acquired
    pub fn lock(&self) -> ShmMutexGuard<'_> {
        let backoff = Backoff::new();
        loop {
            if self.try_acquire() {
                return ShmMutexGuard { mutex: self };
            }
            if backoff.is_completed() {
                std::thread::yield_now();
            } else {
                backoff.snooze();
            }
        }
    }

    pub fn try_lock(&self) -> Option<ShmMutexGuard<'_>> {
        if self.try_acquire() {
            Some(ShmMutexGuard { mutex: self })
        } else {
            None
        }
    }

    pub fn is_locked(&self) -> bool {
        self.locked.load(Ordering::Relaxed) == LOCKED
    }

    #[inline]
    fn try_acquire(&self) -> bool {
        self.locked
            .compare_exchange_weak(UNLOCKED, LOCKED, Ordering::Acquire, Ordering::Relaxed)
            .is_ok()
    }
}

/// Releases the mutex on drop
#[must_use = "the lock is released as soon as the guard is dropped"]
pub struct ShmMutexGuard<'a> {
    mutex: &'a ShmMutex,
}

impl Drop for ShmMutexGuard<'_> {
    fn drop(&mut self) {
        self.mutex.locked.store(UNLOCKED, Ordering::Release);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::UnsafeCell;
    use std::sync::Arc;

    struct Shared {
        mutex: ShmMutex,
        value: UnsafeCell<u64>,
    }
    unsafe impl Sync for Shared {}

    #[test]
    fn test_try_lock() {
        let mutex = ShmMutex::new();
        let guard = mutex.lock();
        assert!(mutex.is_locked());
        assert!(mutex.try_lock().is_none());
        drop(guard);
        assert!(mutex.try_lock().is_some());
    }

    #[test]
    fn test_mutual_exclusion() {
        let shared = Arc::new(Shared {
            mutex: ShmMutex::new(),
            value: UnsafeCell::new(0),
        });

        let handles: Vec<_> = (0..4)
            .map(|_| {
                let shared = Arc::clone(&shared);
                std::thread::spawn(move || {
                    for _ in 0..10_000 {
                        let _guard = shared.mutex.lock();
                        unsafe { *shared.value.get() += 1 };
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }

        let _guard = shared.mutex.lock();
        assert_eq!(unsafe { *shared.value.get() }, 40_000);
    }
}
