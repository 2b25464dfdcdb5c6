use std::cell::Cell;
use std::rc::Rc;
use std::time::Instant;

use serde::{Deserialize, Serialize};

/// Radio sleep-clock rate all timing is expressed in.
pub const TICKS_PER_SECOND: u64 = 32_768;

/// A span or instant measured in 32.768 kHz clock ticks.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Ticks(pub u64);

impl Ticks {
    pub const ZERO: Ticks = Ticks(0);

    pub fn from_millis(ms: u64) -> Self {
        Ticks(ms * TICKS_PER_SECOND / 1000)
    }

    pub fn as_millis(self) -> u64 {
        self.0 * 1000 / TICKS_PER_SECOND
    }

    pub fn as_secs_f64(self) -> f64 {
        self.0 as f64 / TICKS_PER_SECOND as f64
    }

    pub fn saturating_sub(self, rhs: Ticks) -> Ticks {
        Ticks(self.0.saturating_sub(rhs.0))
    }
}

/// Source of the current tick count.
pub trait Clock {
    fn now(&self) -> Ticks;
}

/// Wall clock scaled to ticks, for real links.
#[derive(Debug, Clone)]
pub struct MonotonicClock {
    t0: Instant,
}

impl MonotonicClock {
    pub fn new() -> Self {
        Self { t0: Instant::now() }
    }
}

impl Default for MonotonicClock {
    fn default() -> Self {
        Self::new()
    }
}

impl Clock for MonotonicClock {
    fn now(&self) -> Ticks {
        let micros = self.t0.elapsed().as_micros() as u64;
        Ticks(micros * TICKS_PER_SECOND / 1_000_000)
    }
}

/// Virtual clock advanced explicitly. Clones share the same counter.
#[derive(Debug, Clone, Default)]
pub struct ManualClock {
    now: Rc<Cell<u64>>,
}

impl ManualClock {
    pub fn new() -> Self {
        Self::default()
    }
    pub fn set(&self, t: Ticks) {
        self.now.set(t.0);
    }
    #[cfg(test)]
    pub fn advance(&self, by: Ticks) {
        self.now.set(self.now.get() + by.0);
    }
}

impl Clock for ManualClock {
    fn now(&self) -> Ticks {
        Ticks(self.now.get())
    }
}

/// Bits moved over `elapsed`, in bits per second. Zero when no time passed.
pub fn throughput_bps(bits: u64, elapsed: Ticks) -> f64 {
    if elapsed.0 == 0 {
        return 0.0;
    }
    bits as f64 / elapsed.as_secs_f64()
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct TransferStats {
    pub bits_sent: u64,
    pub operation_count: u64,
    pub invalid_byte_count: u64,
    pub elapsed_ticks: u64,
    pub throughput_bps: f64,
    started_at: Option<Ticks>,
}

impl TransferStats {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_operation(&mut self, bytes: usize) {
        self.bits_sent += bytes as u64 * 8;
        self.operation_count += 1;
    }

    pub fn add_invalid(&mut self, n: u64) {
        self.invalid_byte_count += n;
    }

    /// Zero the counters and mark `now` as the transfer start.
    pub fn start(&mut self, now: Ticks) {
        self.bits_sent = 0;
        self.operation_count = 0;
        self.invalid_byte_count = 0;
        self.elapsed_ticks = 0;
        self.throughput_bps = 0.0;
        self.started_at = Some(now);
    }

    pub fn is_running(&self) -> bool {
        self.started_at.is_some()
    }

    /// Close the measurement window and return the resulting throughput.
    /// Without a prior `start` the stats are left as they are.
    pub fn stop(&mut self, now: Ticks) -> f64 {
        if let Some(t0) = self.started_at.take() {
            self.elapsed_ticks = now.saturating_sub(t0).0;
            self.throughput_bps = throughput_bps(self.bits_sent, Ticks(self.elapsed_ticks));
        }
        self.throughput_bps
    }

    /// Throughput so far, without closing the window.
    pub fn current_bps(&self, now: Ticks) -> f64 {
        match self.started_at {
            Some(t0) => throughput_bps(self.bits_sent, now.saturating_sub(t0)),
            None => self.throughput_bps,
        }
    }
}
