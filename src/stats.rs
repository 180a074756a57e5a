use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

/// Counters shared by every connection of a vhost.
#[derive(Debug, Default)]
pub struct Stats {
    writable_callbacks: AtomicU64,
    writable_delay_us_total: AtomicU64,
    writable_delay_samples: AtomicU64,
    worst_writable_delay_us: AtomicU64,
    rx_bytes: AtomicU64,
    rx_dropped: AtomicU64,
    closes: AtomicU64,
}

/// Point-in-time copy of [`Stats`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StatsSnapshot {
    pub writable_callbacks: u64,
    pub writable_delay_us_total: u64,
    pub writable_delay_samples: u64,
    pub worst_writable_delay_us: u64,
    pub rx_bytes: u64,
    pub rx_dropped: u64,
    pub closes: u64,
}

impl StatsSnapshot {
    /// Mean delay between a writable request and its callback.
    pub fn avg_writable_delay_us(&self) -> u64 {
        self.writable_delay_us_total
            .checked_div(self.writable_delay_samples)
            .unwrap_or(0)
    }
}

impl Stats {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn bump_writable_callback(&self) {
        self.writable_callbacks.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_writable_delay(&self, delay: Duration) {
        let us = u64::try_from(delay.as_micros()).unwrap_or(u64::MAX);
        self.writable_delay_us_total.fetch_add(us, Ordering::Relaxed);
        self.writable_delay_samples.fetch_add(1, Ordering::Relaxed);
        self.worst_writable_delay_us.fetch_max(us, Ordering::Relaxed);
    }

    pub fn add_rx_bytes(&self, n: usize) {
        self.rx_bytes.fetch_add(n as u64, Ordering::Relaxed);
    }

    pub fn bump_rx_dropped(&self) {
        self.rx_dropped.fetch_add(1, Ordering::Relaxed);
    }

    pub fn bump_close(&self) {
        self.closes.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            writable_callbacks: self.writable_callbacks.load(Ordering::Relaxed),
            writable_delay_us_total: self.writable_delay_us_total.load(Ordering::Relaxed),
            writable_delay_samples: self.writable_delay_samples.load(Ordering::Relaxed),
            worst_writable_delay_us: self.worst_writable_delay_us.load(Ordering::Relaxed),
            rx_bytes: self.rx_bytes.load(Ordering::Relaxed),
            rx_dropped: self.rx_dropped.load(Ordering::Relaxed),
            closes: self.closes.load(Ordering::Relaxed),
        }
    }
}
