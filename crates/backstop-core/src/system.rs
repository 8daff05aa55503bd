//! Host resource snapshots taken when a message is dead-lettered.
//!
//! Reads `/proc` on Linux. Elsewhere, or when `/proc` is unreadable, the
//! numeric fields are zero; the snapshot is forensic context and must never
//! make routing fail.

use std::{fmt, sync::Arc, time::Instant};

use crate::{models::SystemState, time::Clock};

/// Source of [`SystemState`] snapshots.
pub trait SystemProbe: Send + Sync + fmt::Debug {
    /// Captures a snapshot now.
    fn capture(&self) -> SystemState;
}

/// Probe reading `/proc/stat` and `/proc/meminfo`.
#[derive(Debug, Clone)]
pub struct ProcfsProbe {
    started: Instant,
    clock: Arc<dyn Clock>,
}

impl ProcfsProbe {
    /// Creates a probe measuring uptime from now.
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        Self { started: clock.now(), clock }
    }
}

impl SystemProbe for ProcfsProbe {
    fn capture(&self) -> SystemState {
        let (total_memory_mb, used_memory_mb) = std::fs::read_to_string("/proc/meminfo")
            .ok()
            .and_then(|text| parse_meminfo(&text))
            .unwrap_or((0, 0));
        let cpu_usage = std::fs::read_to_string("/proc/stat")
            .ok()
            .and_then(|text| parse_cpu_usage(&text))
            .unwrap_or(0.0);
        let memory_usage = if total_memory_mb == 0 {
            0.0
        } else {
            used_memory_mb as f64 / total_memory_mb as f64
        };

        SystemState {
            cpu_usage,
            memory_usage,
            total_memory_mb,
            used_memory_mb,
            uptime_seconds: self.clock.now().duration_since(self.started).as_secs_f64(),
            captured_at: self.clock.now_utc(),
        }
    }
}

/// Returns `(total_mb, used_mb)` from `/proc/meminfo` text.
fn parse_meminfo(text: &str) -> Option<(u64, u64)> {
    let field = |name: &str| {
        text.lines()
            .find(|line| line.starts_with(name))
            .and_then(|line| line.split_whitespace().nth(1))
            .and_then(|kb| kb.parse::<u64>().ok())
    };

    let total_kb = field("MemTotal:")?;
    let available_kb = field("MemAvailable:").or_else(|| field("MemFree:"))?;
    Some((total_kb / 1024, total_kb.saturating_sub(available_kb) / 1024))
}

/// Non-idle share of CPU time since boot from the aggregate `cpu` line.
fn parse_cpu_usage(text: &str) -> Option<f64> {
    let line = text.lines().find(|line| line.starts_with("cpu "))?;
    let ticks: Vec<u64> =
        line.split_whitespace().skip(1).filter_map(|value| value.parse().ok()).collect();

    // idle + iowait
    let idle = ticks.get(3).copied()? + ticks.get(4).copied().unwrap_or(0);
    let total: u64 = ticks.iter().sum();
    if total == 0 {
        return None;
    }
    Some(1.0 - idle as f64 / total as f64)
}
