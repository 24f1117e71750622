// src/stats.rs
//! Streaming counters and introspection.
//!
//! All counters are plain atomics so workers can bump them without taking a
//! lock and the host can read them mid-frame. `StatsSnapshot` is a frozen
//! copy suitable for serialization, display, or the state dump.

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};

use serde::Serialize;

/// Success-rate floor for the operational alert, checked once per sample window.
pub const SUCCESS_RATE_WARN: f64 = 0.95;
/// Cache-hit-rate floor for the operational alert.
pub const HIT_RATE_WARN: f64 = 0.70;
/// Frames between alert-rate evaluations.
pub const ALERT_WINDOW_FRAMES: u64 = 300;
/// Minimum samples in a window before rates are considered meaningful.
const ALERT_MIN_SAMPLES: u64 = 100;

// ============================================================================
// Live counters
// ============================================================================

#[derive(Debug, Default)]
pub struct StreamingStats {
    pub total_requests: AtomicU64,
    pub completed_requests: AtomicU64,
    pub failed_requests: AtomicU64,
    pub cache_hits: AtomicU64,
    pub cache_misses: AtomicU64,
    pub bytes_loaded: AtomicU64,
    pub bytes_evicted: AtomicU64,
    pub peak_memory: AtomicU64,
    load_time_total_us: AtomicU64,
    load_time_peak_us: AtomicU64,
    load_count: AtomicU64,
}

impl StreamingStats {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a completed load's wall time.
    pub fn record_load_time(&self, micros: u64) {
        self.load_time_total_us.fetch_add(micros, Ordering::Relaxed);
        self.load_count.fetch_add(1, Ordering::Relaxed);
        self.load_time_peak_us.fetch_max(micros, Ordering::Relaxed);
    }

    /// Track the high-water mark of pool usage.
    pub fn observe_memory(&self, used: usize) {
        self.peak_memory.fetch_max(used as u64, Ordering::Relaxed);
    }

    pub fn snapshot(&self, current_memory: usize) -> StatsSnapshot {
        let load_count = self.load_count.load(Ordering::Relaxed);
        let total_us = self.load_time_total_us.load(Ordering::Relaxed);
        StatsSnapshot {
            total_requests: self.total_requests.load(Ordering::Relaxed),
            completed_requests: self.completed_requests.load(Ordering::Relaxed),
            failed_requests: self.failed_requests.load(Ordering::Relaxed),
            cache_hits: self.cache_hits.load(Ordering::Relaxed),
            cache_misses: self.cache_misses.load(Ordering::Relaxed),
            bytes_loaded: self.bytes_loaded.load(Ordering::Relaxed),
            bytes_evicted: self.bytes_evicted.load(Ordering::Relaxed),
            current_memory: current_memory as u64,
            peak_memory: self.peak_memory.load(Ordering::Relaxed),
            avg_load_time_us: if load_count > 0 { total_us / load_count } else { 0 },
            peak_load_time_us: self.load_time_peak_us.load(Ordering::Relaxed),
        }
    }

    /// Zero every counter. Peaks reset too; the next frame re-seeds them.
    pub fn reset(&self) {
        self.total_requests.store(0, Ordering::Relaxed);
        self.completed_requests.store(0, Ordering::Relaxed);
        self.failed_requests.store(0, Ordering::Relaxed);
        self.cache_hits.store(0, Ordering::Relaxed);
        self.cache_misses.store(0, Ordering::Relaxed);
        self.bytes_loaded.store(0, Ordering::Relaxed);
        self.bytes_evicted.store(0, Ordering::Relaxed);
        self.peak_memory.store(0, Ordering::Relaxed);
        self.load_time_total_us.store(0, Ordering::Relaxed);
        self.load_time_peak_us.store(0, Ordering::Relaxed);
        self.load_count.store(0, Ordering::Relaxed);
    }

    /// Informational health check: logs a warning when the success rate or
    /// cache-hit rate drops under its floor. Never an error.
    pub fn check_alerts(&self) {
        let total = self.total_requests.load(Ordering::Relaxed);
        let failed = self.failed_requests.load(Ordering::Relaxed);
        if total >= ALERT_MIN_SAMPLES {
            let success = 1.0 - failed as f64 / total as f64;
            if success < SUCCESS_RATE_WARN {
                log::warn!(
                    "streaming success rate {:.1}% below {:.0}% ({failed}/{total} failed)",
                    success * 100.0,
                    SUCCESS_RATE_WARN * 100.0
                );
            }
        }
        let hits = self.cache_hits.load(Ordering::Relaxed);
        let misses = self.cache_misses.load(Ordering::Relaxed);
        if hits + misses >= ALERT_MIN_SAMPLES {
            let rate = hits as f64 / (hits + misses) as f64;
            if rate < HIT_RATE_WARN {
                log::warn!(
                    "streaming cache-hit rate {:.1}% below {:.0}%",
                    rate * 100.0,
                    HIT_RATE_WARN * 100.0
                );
            }
        }
    }
}

// ============================================================================
// Snapshot
// ============================================================================

#[derive(Debug, Clone, Copy, Default, Serialize)]
pub struct StatsSnapshot {
    pub total_requests: u64,
    pub completed_requests: u64,
    pub failed_requests: u64,
    pub cache_hits: u64,
    pub cache_misses: u64,
    pub bytes_loaded: u64,
    pub bytes_evicted: u64,
    pub current_memory: u64,
    pub peak_memory: u64,
    pub avg_load_time_us: u64,
    pub peak_load_time_us: u64,
}

impl StatsSnapshot {
    pub fn hit_rate(&self) -> f64 {
        let lookups = self.cache_hits + self.cache_misses;
        if lookups == 0 {
            0.0
        } else {
            self.cache_hits as f64 / lookups as f64
        }
    }
}

impl fmt::Display for StatsSnapshot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "requests: {} ({} complete, {} failed) | hits: {} misses: {} ({:.1}%) | \
             loaded: {} evicted: {} | memory: {} (peak {}) | load: avg {} us peak {} us",
            self.total_requests,
            self.completed_requests,
            self.failed_requests,
            self.cache_hits,
            self.cache_misses,
            self.hit_rate() * 100.0,
            format_bytes(self.bytes_loaded),
            format_bytes(self.bytes_evicted),
            format_bytes(self.current_memory),
            format_bytes(self.peak_memory),
            self.avg_load_time_us,
            self.peak_load_time_us,
        )
    }
}

pub fn format_bytes(bytes: u64) -> String {
    const KB: u64 = 1024;
    const MB: u64 = KB * 1024;
    const GB: u64 = MB * 1024;

    if bytes >= GB {
        format!("{:.2} GB", bytes as f64 / GB as f64)
    } else if bytes >= MB {
        format!("{:.2} MB", bytes as f64 / MB as f64)
    } else if bytes >= KB {
        format!("{:.2} KB", bytes as f64 / KB as f64)
    } else {
        format!("{} B", bytes)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_snapshot_copies_counters() {
        let stats = StreamingStats::new();
        stats.total_requests.fetch_add(10, Ordering::Relaxed);
        stats.completed_requests.fetch_add(9, Ordering::Relaxed);
        stats.failed_requests.fetch_add(1, Ordering::Relaxed);
        stats.bytes_loaded.fetch_add(4096, Ordering::Relaxed);

        let snap = stats.snapshot(1024);
        assert_eq!(snap.total_requests, 10);
        assert_eq!(snap.completed_requests, 9);
        assert_eq!(snap.failed_requests, 1);
        assert_eq!(snap.bytes_loaded, 4096);
        assert_eq!(snap.current_memory, 1024);
    }

    #[test]
    fn test_load_time_average_and_peak() {
        let stats = StreamingStats::new();
        stats.record_load_time(100);
        stats.record_load_time(300);
        let snap = stats.snapshot(0);
        assert_eq!(snap.avg_load_time_us, 200);
        assert_eq!(snap.peak_load_time_us, 300);
    }

    #[test]
    fn test_peak_memory_is_monotonic() {
        let stats = StreamingStats::new();
        stats.observe_memory(1000);
        stats.observe_memory(500);
        assert_eq!(stats.snapshot(500).peak_memory, 1000);
    }

    #[test]
    fn test_reset_zeroes_everything() {
        let stats = StreamingStats::new();
        stats.total_requests.fetch_add(5, Ordering::Relaxed);
        stats.record_load_time(42);
        stats.reset();
        let snap = stats.snapshot(0);
        assert_eq!(snap.total_requests, 0);
        assert_eq!(snap.avg_load_time_us, 0);
        assert_eq!(snap.peak_load_time_us, 0);
    }

    #[test]
    fn test_format_bytes() {
        assert_eq!(format_bytes(512), "512 B");
        assert_eq!(format_bytes(1024), "1.00 KB");
        assert_eq!(format_bytes(1024 * 1024), "1.00 MB");
        assert_eq!(format_bytes(1024 * 1024 * 1024), "1.00 GB");
    }

    #[test]
    fn test_hit_rate() {
        let snap = StatsSnapshot {
            cache_hits: 7,
            cache_misses: 3,
            ..Default::default()
        };
        assert!((snap.hit_rate() - 0.7).abs() < 1e-9);
    }
}
