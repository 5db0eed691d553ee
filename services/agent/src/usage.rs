//! In-memory usage history for consumption queries.
//!
//! Ring buffers hold 48 hours of CPU/memory samples at the heartbeat cadence
//! (5 seconds): one buffer for the agent itself and one per managed
//! container. Data lives in RAM only and is lost on restart.

use std::collections::{HashMap, VecDeque};
use std::sync::Mutex;

use chrono::Utc;
use serde::Serialize;

/// Heartbeat cadence the buffers are sized for.
pub const SAMPLE_INTERVAL_SECS: u64 = 5;

/// 48 hours at one sample per 5 seconds.
pub const MAX_SAMPLES: usize = 48 * 3600 / SAMPLE_INTERVAL_SECS as usize;

#[derive(Debug, Clone, Copy, Serialize, PartialEq)]
pub struct UsageSample {
    pub timestamp: i64,
    pub cpu: u32,
    pub memory_mb: u64,
}

/// Fixed-capacity ring buffer of usage samples.
#[derive(Debug, Default)]
pub struct UsageBuffer {
    samples: VecDeque<UsageSample>,
}

impl UsageBuffer {
    pub fn new() -> Self {
        Self {
            samples: VecDeque::with_capacity(1024),
        }
    }

    pub fn push(&mut self, cpu_percent: f64, memory_mb: f64) {
        self.push_at(Utc::now().timestamp(), cpu_percent, memory_mb);
    }

    fn push_at(&mut self, timestamp: i64, cpu_percent: f64, memory_mb: f64) {
        if self.samples.len() == MAX_SAMPLES {
            self.samples.pop_front();
        }
        self.samples.push_back(UsageSample {
            timestamp,
            cpu: cpu_percent.max(0.0) as u32,
            memory_mb: memory_mb.max(0.0) as u64,
        });
    }

    /// Samples with `start <= timestamp <= end`.
    pub fn between(&self, start: i64, end: i64) -> Vec<UsageSample> {
        self.samples
            .iter()
            .filter(|s| s.timestamp >= start && s.timestamp <= end)
            .copied()
            .collect()
    }

    pub fn len(&self) -> usize {
        self.samples.len()
    }

    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }
}

/// Per-container usage buffers, keyed by container name.
#[derive(Default)]
pub struct DeviceUsage {
    buffers: Mutex<HashMap<String, UsageBuffer>>,
}

impl DeviceUsage {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_device(&self, device_id: &str) {
        let mut buffers = self.buffers.lock().unwrap_or_else(|e| e.into_inner());
        buffers.entry(device_id.to_string()).or_default();
    }

    pub fn remove_device(&self, device_id: &str) {
        let mut buffers = self.buffers.lock().unwrap_or_else(|e| e.into_inner());
        buffers.remove(device_id);
    }

    pub fn device_ids(&self) -> Vec<String> {
        let buffers = self.buffers.lock().unwrap_or_else(|e| e.into_inner());
        buffers.keys().cloned().collect()
    }

    pub fn record(&self, device_id: &str, cpu_percent: f64, memory_mb: f64) {
        let mut buffers = self.buffers.lock().unwrap_or_else(|e| e.into_inner());
        buffers
            .entry(device_id.to_string())
            .or_default()
            .push(cpu_percent, memory_mb);
    }

    pub fn between(&self, device_id: &str, start: i64, end: i64) -> Vec<UsageSample> {
        let buffers = self.buffers.lock().unwrap_or_else(|e| e.into_inner());
        buffers
            .get(device_id)
            .map(|buffer| buffer.between(start, end))
            .unwrap_or_default()
    }
}

/// Parse a consumption period selector into `(start, end)` Unix seconds.
///
/// Accepted forms: `"<start>,<end>"` (absolute Unix timestamps), or a
/// relative window ending now: `"<n>h"`, `"<n>m"`, `"<n>d"`, or plain
/// seconds. Unparseable input falls back to the last hour.
pub fn parse_period(period: &str) -> (i64, i64) {
    let now = Utc::now().timestamp();

    if let Some((start, end)) = period.split_once(',') {
        if let (Ok(start), Ok(end)) = (start.trim().parse(), end.trim().parse()) {
            return (start, end);
        }
        return (now - 3600, now);
    }

    let period = period.trim();
    let window = if let Some(hours) = period.strip_suffix('h') {
        hours.parse::<i64>().ok().map(|h| h * 3600)
    } else if let Some(minutes) = period.strip_suffix('m') {
        minutes.parse::<i64>().ok().map(|m| m * 60)
    } else if let Some(days) = period.strip_suffix('d') {
        days.parse::<i64>().ok().map(|d| d * 86_400)
    } else {
        period.parse::<i64>().ok()
    };

    match window {
        Some(seconds) => (now - seconds, now),
        None => (now - 3600, now),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_buffer_push_and_query() {
        let mut buffer = UsageBuffer::new();
        buffer.push_at(100, 23.5, 812.0);
        buffer.push_at(105, 41.2, 820.0);
        buffer.push_at(110, 56.8, 825.0);

        let all = buffer.between(0, 200);
        assert_eq!(all.len(), 3);
        assert_eq!(all[0].cpu, 23);
        assert_eq!(all[1].memory_mb, 820);

        let windowed = buffer.between(101, 109);
        assert_eq!(windowed.len(), 1);
        assert_eq!(windowed[0].timestamp, 105);
    }

    #[test]
    fn test_buffer_capacity_bound() {
        let mut buffer = UsageBuffer::new();
        for i in 0..(MAX_SAMPLES as i64 + 10) {
            buffer.push_at(i, 1.0, 1.0);
        }
        assert_eq!(buffer.len(), MAX_SAMPLES);
        // Oldest samples were evicted.
        assert_eq!(buffer.between(0, 9).len(), 0);
    }

    #[test]
    fn test_device_usage_lifecycle() {
        let devices = DeviceUsage::new();
        devices.add_device("plc-001");
        devices.record("plc-001", 10.0, 100.0);

        assert_eq!(devices.device_ids(), vec!["plc-001".to_string()]);
        assert_eq!(devices.between("plc-001", 0, i64::MAX).len(), 1);

        devices.remove_device("plc-001");
        assert!(devices.device_ids().is_empty());
        assert!(devices.between("plc-001", 0, i64::MAX).is_empty());
    }

    #[test]
    fn test_parse_period_absolute() {
        assert_eq!(parse_period("100,200"), (100, 200));
        assert_eq!(parse_period(" 100 , 200 "), (100, 200));
    }

    #[test]
    fn test_parse_period_relative() {
        let (start, end) = parse_period("2h");
        assert_eq!(end - start, 2 * 3600);

        let (start, end) = parse_period("30m");
        assert_eq!(end - start, 1800);

        let (start, end) = parse_period("1d");
        assert_eq!(end - start, 86_400);

        let (start, end) = parse_period("90");
        assert_eq!(end - start, 90);
    }

    #[test]
    fn test_parse_period_fallback_is_one_hour() {
        let (start, end) = parse_period("banana");
        assert_eq!(end - start, 3600);

        let (start, end) = parse_period("1,x");
        assert_eq!(end - start, 3600);
    }
}
