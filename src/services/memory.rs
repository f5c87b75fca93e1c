use crate::services::tasks::CancellationToken;
use serde::{Deserialize, Serialize};
use std::sync::{Mutex, PoisonError};
use std::time::{Duration, Instant};

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum PressureLevel {
    Normal,
    High,
    Critical,
}

/// Source of the memory figure the monitor compares against its budget.
pub trait MemoryProbe: Send + Sync {
    fn used_bytes(&self) -> u64;
}

impl<F> MemoryProbe for F
where
    F: Fn() -> u64 + Send + Sync,
{
    fn used_bytes(&self) -> u64 {
        self()
    }
}

/// Resident set size of the current process, from `/proc/self/statm`.
/// Reports 0 where that file does not exist.
pub struct ProcessMemoryProbe;

impl MemoryProbe for ProcessMemoryProbe {
    fn used_bytes(&self) -> u64 {
        std::fs::read_to_string("/proc/self/statm")
            .ok()
            .and_then(|s| s.split_whitespace().nth(1)?.parse::<u64>().ok())
            .map(|pages| pages * 4096)
            .unwrap_or(0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MemoryThresholds {
    /// Fraction of the budget that counts as high pressure.
    pub high: f64,
    pub critical: f64,
    #[serde(with = "millis")]
    pub cooldown: Duration,
    #[serde(with = "millis")]
    pub poll_interval: Duration,
    /// Longest a paused batch waits before continuing anyway.
    #[serde(with = "millis")]
    pub max_pause: Duration,
}

impl Default for MemoryThresholds {
    fn default() -> Self {
        Self {
            high: 0.80,
            critical: 0.95,
            cooldown: Duration::from_millis(250),
            poll_interval: Duration::from_millis(50),
            max_pause: Duration::from_secs(30),
        }
    }
}

mod millis {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_u64(d.as_millis() as u64)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        Ok(Duration::from_millis(u64::deserialize(d)?))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReliefOutcome {
    /// Usage fell below the high mark and the cooldown elapsed.
    Relieved,
    /// Gave up waiting after `max_pause`.
    TimedOut,
    Cancelled,
}

pub struct MemoryMonitor {
    probe: Box<dyn MemoryProbe>,
    budget_bytes: u64,
    thresholds: MemoryThresholds,
    last_level: Mutex<PressureLevel>,
}

impl MemoryMonitor {
    pub fn new(probe: Box<dyn MemoryProbe>, budget_bytes: u64, thresholds: MemoryThresholds) -> Self {
        Self {
            probe,
            budget_bytes,
            thresholds,
            last_level: Mutex::new(PressureLevel::Normal),
        }
    }

    pub fn usage_ratio(&self) -> f64 {
        if self.budget_bytes == 0 {
            return 0.0;
        }
        self.probe.used_bytes() as f64 / self.budget_bytes as f64
    }

    pub fn sample(&self) -> PressureLevel {
        let ratio = self.usage_ratio();
        let level = if ratio >= self.thresholds.critical {
            PressureLevel::Critical
        } else if ratio >= self.thresholds.high {
            PressureLevel::High
        } else {
            PressureLevel::Normal
        };

        let mut last = self.last_level.lock().unwrap_or_else(PoisonError::into_inner);
        if *last != level {
            log::info!(
                "Memory pressure {:?} -> {:?} ({:.0}% of budget)",
                *last,
                level,
                ratio * 100.0
            );
            *last = level;
        }
        level
    }

    /// Blocks until usage drops below the high mark, calling `relieve` on each
    /// poll so the caller can evict. Resumes after the cooldown window.
    pub fn wait_for_relief<F>(&self, cancel: &CancellationToken, mut relieve: F) -> ReliefOutcome
    where
        F: FnMut(PressureLevel),
    {
        let started = Instant::now();
        loop {
            if cancel.is_cancelled() {
                return ReliefOutcome::Cancelled;
            }
            let level = self.sample();
            if level < PressureLevel::High {
                std::thread::sleep(self.thresholds.cooldown);
                return ReliefOutcome::Relieved;
            }
            if started.elapsed() >= self.thresholds.max_pause {
                log::warn!(
                    "Memory still under {:?} pressure after {:?}; resuming",
                    level,
                    self.thresholds.max_pause
                );
                return ReliefOutcome::TimedOut;
            }
            relieve(level);
            std::thread::sleep(self.thresholds.poll_interval);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU64, Ordering};
    use std::sync::Arc;

    fn fast_thresholds() -> MemoryThresholds {
        MemoryThresholds {
            cooldown: Duration::from_millis(1),
            poll_interval: Duration::from_millis(1),
            max_pause: Duration::from_millis(200),
            ..MemoryThresholds::default()
        }
    }

    #[test]
    fn test_levels_follow_thresholds() {
        let used = Arc::new(AtomicU64::new(0));
        let probe = {
            let used = used.clone();
            move || used.load(Ordering::Relaxed)
        };
        let monitor = MemoryMonitor::new(Box::new(probe), 1000, MemoryThresholds::default());

        assert_eq!(monitor.sample(), PressureLevel::Normal);
        used.store(850, Ordering::Relaxed);
        assert_eq!(monitor.sample(), PressureLevel::High);
        used.store(990, Ordering::Relaxed);
        assert_eq!(monitor.sample(), PressureLevel::Critical);
    }

    #[test]
    fn test_wait_resumes_once_relieved() {
        let used = Arc::new(AtomicU64::new(1000));
        let probe = {
            let used = used.clone();
            move || used.load(Ordering::Relaxed)
        };
        let monitor = MemoryMonitor::new(Box::new(probe), 1000, fast_thresholds());
        let mut calls = 0;
        let outcome = monitor.wait_for_relief(&CancellationToken::new(), |_| {
            calls += 1;
            used.fetch_sub(300, Ordering::Relaxed);
        });
        assert_eq!(outcome, ReliefOutcome::Relieved);
        assert_eq!(calls, 1);
    }

    #[test]
    fn test_wait_gives_up_after_max_pause() {
        let monitor = MemoryMonitor::new(Box::new(|| 2000u64), 1000, fast_thresholds());
        let outcome = monitor.wait_for_relief(&CancellationToken::new(), |_| {});
        assert_eq!(outcome, ReliefOutcome::TimedOut);
    }

    #[test]
    fn test_wait_honours_cancellation() {
        let monitor = MemoryMonitor::new(Box::new(|| 2000u64), 1000, fast_thresholds());
        let token = CancellationToken::new();
        token.cancel();
        assert_eq!(monitor.wait_for_relief(&token, |_| {}), ReliefOutcome::Cancelled);
    }

    #[test]
    fn test_zero_budget_never_reports_pressure() {
        let monitor = MemoryMonitor::new(Box::new(|| 5u64), 0, MemoryThresholds::default());
        assert_eq!(monitor.sample(), PressureLevel::Normal);
    }

    #[cfg(target_os = "linux")]
    #[test]
    fn test_process_rss_is_reported() {
        let ballast = vec![1u8; 8 << 20];
        let rss = ProcessMemoryProbe.used_bytes();
        assert!(rss >= ballast.len() as u64, "rss {}", rss);
    }
}
