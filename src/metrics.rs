use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Request counters reported by `/health`
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct Metrics {
    pub started_at: i64,
    pub uptime_sec: u64,
    pub requests_total: u64,
    pub requests_success: u64,
    pub requests_failed: u64,
    pub memory_bytes: u64,
    pub actions: BTreeMap<String, u64>,
}

impl Metrics {
    pub fn new(started_at: i64) -> Self {
        Self {
            started_at,
            ..Self::default()
        }
    }

    /// Update memory usage from system
    pub fn update_memory(&mut self) {
        #[cfg(target_os = "linux")]
        {
            if let Ok(status) = std::fs::read_to_string("/proc/self/status") {
                for line in status.lines() {
                    if line.starts_with("VmRSS:") {
                        if let Some(kb) = line.split_whitespace().nth(1) {
                            if let Ok(kb) = kb.parse::<u64>() {
                                self.memory_bytes = kb * 1024;
                            }
                        }
                    }
                }
            }
        }
    }

    pub fn record(&mut self, action: &str, success: bool) {
        self.requests_total += 1;
        if success {
            self.requests_success += 1;
        } else {
            self.requests_failed += 1;
        }
        *self.actions.entry(action.to_string()).or_default() += 1;
    }

    /// Get success rate as percentage
    pub fn success_rate(&self) -> f64 {
        if self.requests_total == 0 {
            return 100.0;
        }
        (self.requests_success as f64 / self.requests_total as f64) * 100.0
    }

    /// Refresh derived fields before reporting
    pub fn snapshot(&mut self, now: i64) -> Self {
        self.uptime_sec = (now - self.started_at).max(0) as u64;
        self.update_memory();
        self.clone()
    }
}
