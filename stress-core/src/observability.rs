// stress-core/src/observability.rs
// Live snapshots for the presentation layer and the health classification shown with them

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::time::Duration;

use crate::telemetry::{EventCounts, StatSummary, TelemetryHistory, TelemetrySample, ThrottleBit, ThrottleFlags};
use crate::tuning::DisplayThresholds;
use crate::workload::DomainProgress;
use crate::Domain;

/// Health status enumeration
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HealthStatus {
    Unknown,
    Healthy,
    Warm,
    Warning,
    Critical,
}

impl HealthStatus {
    pub fn label(&self) -> &'static str {
        match self {
            HealthStatus::Unknown => "unknown",
            HealthStatus::Healthy => "healthy",
            HealthStatus::Warm => "warm",
            HealthStatus::Warning => "warning",
            HealthStatus::Critical => "critical",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DomainState {
    Running,
    Stopping,
    Finished,
    Skipped,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct DomainLive {
    pub state: DomainState,
    pub progress: DomainProgress,
}

/// Immutable view of a running session, published at a fixed cadence
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LiveSnapshot {
    pub elapsed: Duration,
    pub remaining: Duration,
    /// 0.0..=1.0 of the requested duration
    pub progress: f64,
    pub domains: BTreeMap<Domain, DomainLive>,
    pub latest: Option<TelemetrySample>,
    pub temperature_c: Option<StatSummary>,
    pub counts: EventCounts,
    pub flags_seen: ThrottleFlags,
    pub health: HealthStatus,
}

impl LiveSnapshot {
    /// Snapshot before anything has run
    pub fn idle(duration: Duration) -> Self {
        Self {
            elapsed: Duration::ZERO,
            remaining: duration,
            progress: 0.0,
            domains: BTreeMap::new(),
            latest: None,
            temperature_c: None,
            counts: EventCounts::default(),
            flags_seen: ThrottleFlags::default(),
            health: HealthStatus::Unknown,
        }
    }

    pub fn capture(
        elapsed: Duration,
        duration: Duration,
        domains: BTreeMap<Domain, DomainLive>,
        history: &TelemetryHistory,
        health: &HealthChecker,
    ) -> Self {
        let progress = if duration.is_zero() {
            1.0
        } else {
            (elapsed.as_secs_f64() / duration.as_secs_f64()).clamp(0.0, 1.0)
        };
        let mut snapshot = Self {
            elapsed,
            remaining: duration.saturating_sub(elapsed),
            progress,
            domains,
            latest: history.latest().cloned(),
            temperature_c: history.temperature(),
            counts: history.event_counts(),
            flags_seen: history.flags_seen(),
            health: HealthStatus::Unknown,
        };
        snapshot.health = health.check(&snapshot);
        snapshot
    }

    pub fn total_errors(&self) -> u64 {
        self.domains.values().map(|d| d.progress.errors).sum()
    }

    /// Current throttle bits in the newest sample
    pub fn current_flags(&self) -> Vec<ThrottleBit> {
        self.latest
            .as_ref()
            .and_then(|s| s.throttle)
            .map(|flags| ThrottleFlags(flags.current()).set_bits())
            .unwrap_or_default()
    }
}

type HealthCheck = Box<dyn Fn(&LiveSnapshot) -> HealthStatus + Send + Sync>;

/// Classifies a snapshot for colouring only; plays no part in the verdict.
/// The worst individual check wins.
pub struct HealthChecker {
    checks: Vec<HealthCheck>,
}

impl HealthChecker {
    pub fn new(thresholds: DisplayThresholds) -> Self {
        let mut checker = Self { checks: Vec::new() };
        checker.add_default_checks(thresholds);
        checker
    }

    fn add_default_checks(&mut self, thresholds: DisplayThresholds) {
        // Temperature bands
        self.checks.push(Box::new(move |snapshot: &LiveSnapshot| {
            match snapshot.latest.as_ref().and_then(|s| s.temperature_c) {
                Some(t) if t >= thresholds.critical_temp_c => HealthStatus::Critical,
                Some(t) if t >= thresholds.warning_temp_c => HealthStatus::Warning,
                Some(t) if t >= thresholds.warm_temp_c => HealthStatus::Warm,
                Some(_) => HealthStatus::Healthy,
                None => HealthStatus::Unknown,
            }
        }));

        // Throttling in the latest sample
        self.checks.push(Box::new(|snapshot: &LiveSnapshot| {
            let bits = snapshot.current_flags();
            if bits.contains(&ThrottleBit::UnderVoltage) {
                HealthStatus::Critical
            } else if !bits.is_empty() {
                HealthStatus::Warning
            } else {
                HealthStatus::Unknown
            }
        }));

        // Verification errors so far
        self.checks.push(Box::new(|snapshot: &LiveSnapshot| {
            if snapshot.total_errors() > 0 || snapshot.counts.kernel_errors > 0 {
                HealthStatus::Critical
            } else {
                HealthStatus::Unknown
            }
        }));
    }

    pub fn check(&self, snapshot: &LiveSnapshot) -> HealthStatus {
        self.checks
            .iter()
            .map(|check| check(snapshot))
            .max()
            .unwrap_or(HealthStatus::Unknown)
    }
}

impl Default for HealthChecker {
    fn default() -> Self {
        Self::new(DisplayThresholds::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    fn history_with(temperature: f32, flags: u32) -> TelemetryHistory {
        let mut history = TelemetryHistory::new();
        history.record(TelemetrySample {
            temperature_c: Some(temperature),
            throttle: Some(ThrottleFlags(flags)),
            ..TelemetrySample::empty(Utc::now())
        });
        history
    }

    fn running(errors: u64) -> BTreeMap<Domain, DomainLive> {
        BTreeMap::from([(
            Domain::Cpu,
            DomainLive {
                state: DomainState::Running,
                progress: DomainProgress {
                    errors,
                    operations: 5,
                    bytes: 0,
                },
            },
        )])
    }

    #[test]
    fn test_temperature_bands() {
        let checker = HealthChecker::default();
        let cases = [(55.0, HealthStatus::Healthy), (72.0, HealthStatus::Warm), (81.0, HealthStatus::Warning), (86.0, HealthStatus::Critical)];
        for (temperature, expected) in cases {
            let snapshot = LiveSnapshot::capture(
                Duration::from_secs(1),
                Duration::from_secs(10),
                running(0),
                &history_with(temperature, 0),
                &checker,
            );
            assert_eq!(snapshot.health, expected, "at {temperature}");
        }
    }

    #[test]
    fn test_throttle_and_errors_escalate() {
        let checker = HealthChecker::default();
        let throttled = LiveSnapshot::capture(
            Duration::from_secs(1),
            Duration::from_secs(10),
            running(0),
            &history_with(50.0, 0x4),
            &checker,
        );
        assert_eq!(throttled.health, HealthStatus::Warning);
        assert_eq!(throttled.current_flags(), vec![ThrottleBit::Throttled]);

        let failing = LiveSnapshot::capture(
            Duration::from_secs(1),
            Duration::from_secs(10),
            running(2),
            &history_with(50.0, 0),
            &checker,
        );
        assert_eq!(failing.health, HealthStatus::Critical);
        assert_eq!(failing.total_errors(), 2);
    }

    #[test]
    fn test_progress_is_clamped() {
        let snapshot = LiveSnapshot::capture(
            Duration::from_secs(30),
            Duration::from_secs(20),
            BTreeMap::new(),
            &TelemetryHistory::new(),
            &HealthChecker::default(),
        );
        assert_eq!(snapshot.progress, 1.0);
        assert_eq!(snapshot.remaining, Duration::ZERO);
        assert_eq!(snapshot.health, HealthStatus::Unknown);
    }
}
