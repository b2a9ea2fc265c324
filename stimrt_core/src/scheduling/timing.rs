//! Clock, sleep granularity and tick pacing
//!
//! All processes of a session run on the same host, so the system monotonic
//! clock gives every participant the same timeline for phase deadlines.

use crate::error::{StimError, StimResult};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Seconds on the host-wide monotonic clock
#[cfg(unix)]
pub fn now() -> f64 {
    let mut ts = libc::timespec {
        tv_sec: 0,
        tv_nsec: 0,
    };
    let rc = unsafe { libc::clock_gettime(libc::CLOCK_MONOTONIC, &mut ts) };
    if rc != 0 {
        return process_clock();
    }
    ts.tv_sec as f64 + ts.tv_nsec as f64 * 1e-9
}

#[cfg(not(unix))]
pub fn now() -> f64 {
    process_clock()
}

fn process_clock() -> f64 {
    static EPOCH: once_cell::sync::Lazy<Instant> = once_cell::sync::Lazy::new(Instant::now);
    EPOCH.elapsed().as_secs_f64()
}

/// Smallest sleep the OS actually delivers, in seconds.
///
/// Requests shorter than this are busy-waited instead.
pub fn measure_min_sleep(samples: usize) -> f64 {
    let samples = samples.max(1);
    let mut best = f64::INFINITY;
    for _ in 0..samples {
        let start = Instant::now();
        std::thread::sleep(Duration::from_micros(1));
        best = best.min(start.elapsed().as_secs_f64());
    }
    log::debug!("measured minimum sleep: {:.1} us", best * 1e6);
    best
}

/// Wait until `deadline`: coarse sleep while far away, then spin
pub fn sleep_until(deadline: f64, min_sleep: f64) {
    loop {
        let remaining = deadline - now();
        if remaining <= 0.0 {
            return;
        }
        if remaining > min_sleep * 2.0 {
            std::thread::sleep(Duration::from_secs_f64(remaining - min_sleep * 2.0));
        } else {
            std::hint::spin_loop();
        }
    }
}

/// Fixed-interval pacing for a tick loop
#[derive(Debug, Clone)]
pub struct Ticker {
    interval: f64,
    min_sleep: f64,
    next: f64,
    overruns: u64,
}

impl Ticker {
    pub fn new(interval: Duration, min_sleep: f64) -> Self {
        let interval = interval.as_secs_f64();
        Self {
            interval,
            min_sleep,
            next: now() + interval,
            overruns: 0,
        }
    }

    pub fn interval(&self) -> f64 {
        self.interval
    }

    /// Ticks that started late because the previous one overran
    pub fn overruns(&self) -> u64 {
        self.overruns
    }

    /// Restart pacing from the current time
    pub fn reset(&mut self) {
        self.next = now() + self.interval;
    }

    /// Block until the next tick is due
    pub fn wait(&mut self) {
        let current = now();
        if current > self.next {
            self.overruns += 1;
            self.next = current + self.interval;
            return;
        }
        sleep_until(self.next, self.min_sleep);
        self.next += self.interval;
    }
}

/// Route SIGINT/SIGTERM to `flag`; the handler does nothing else
pub fn install_interrupt_handler(flag: Arc<AtomicBool>) -> StimResult<()> {
    ctrlc::set_handler(move || flag.store(true, Ordering::SeqCst))
        .map_err(|e| StimError::Internal(format!("failed to install signal handler: {}", e)))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_clock_is_monotonic() {
        let a = now();
        let b = now();
        assert!(b >= a);
    }

    #[test]
    fn test_min_sleep_is_positive() {
        let min_sleep = measure_min_sleep(3);
        assert!(min_sleep > 0.0);
        assert!(min_sleep < 0.5);
    }

    #[test]
    fn test_sleep_until_reaches_deadline() {
        let deadline = now() + 0.005;
        sleep_until(deadline, 0.001);
        assert!(now() >= deadline);
    }

    #[test]
    fn test_ticker_paces_loop() {
        let mut ticker = Ticker::new(Duration::from_millis(2), 0.0005);
        let start = now();
        for _ in 0..5 {
            ticker.wait();
        }
        if ticker.overruns() == 0 {
            assert!(now() - start >= 0.009);
        }
    }
}
