// stress-core/src/report.rs
// Verdict engine and the immutable end-of-session stability report

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::time::Duration;

use crate::error::*;
use crate::telemetry::nvme::{SmartStatus, StorageDevice};
use crate::telemetry::{Metric, StatSummary, TelemetrySummary, ThrottleBit, ThrottleFlags};
use crate::workload::WorkloadResult;
use crate::Domain;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Verdict {
    Pass,
    Fail,
    Incomplete,
}

impl Verdict {
    pub fn as_str(&self) -> &'static str {
        match self {
            Verdict::Pass => "PASS",
            Verdict::Fail => "FAIL",
            Verdict::Incomplete => "INCOMPLETE",
        }
    }

    /// Process exit status for this verdict
    pub fn exit_code(&self) -> i32 {
        match self {
            Verdict::Pass => 0,
            Verdict::Fail => 1,
            Verdict::Incomplete => 3,
        }
    }
}

impl fmt::Display for Verdict {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Why the session stopped
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionEnd {
    /// Deadline reached
    Completed,
    /// External cancellation before the deadline
    Interrupted,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum DomainStatus {
    Tested(WorkloadResult),
    NotTested,
    Skipped { reason: String },
}

impl DomainStatus {
    pub fn errors(&self) -> u64 {
        match self {
            DomainStatus::Tested(result) => result.errors,
            _ => 0,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReportEvents {
    pub throttling: u64,
    pub under_voltage: u64,
    pub io_errors: u64,
    pub smart_warnings: u64,
    pub kernel_errors: u64,
}

/// Sticky flags at session end, OR'd with every current bit seen
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HistoricalFlags {
    pub raw: String,
    pub under_voltage_occurred: bool,
    pub frequency_capped_occurred: bool,
    pub throttled_occurred: bool,
    pub soft_temp_limit_occurred: bool,
}

impl From<ThrottleFlags> for HistoricalFlags {
    fn from(flags: ThrottleFlags) -> Self {
        Self {
            raw: flags.to_string(),
            under_voltage_occurred: flags.is_set(ThrottleBit::UnderVoltageOccurred),
            frequency_capped_occurred: flags.is_set(ThrottleBit::FrequencyCappedOccurred),
            throttled_occurred: flags.is_set(ThrottleBit::ThrottledOccurred),
            soft_temp_limit_occurred: flags.is_set(ThrottleBit::SoftTempLimitOccurred),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SmartDelta {
    pub before: SmartStatus,
    pub after: SmartStatus,
    pub warnings: u64,
}

/// Everything the verdict is computed from, frozen
#[derive(Debug, Clone)]
pub struct ReportInputs {
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub requested: Duration,
    pub elapsed: Duration,
    pub end: SessionEnd,
    pub results: BTreeMap<Domain, WorkloadResult>,
    pub skipped: BTreeMap<Domain, String>,
    pub telemetry: TelemetrySummary,
    pub storage_device: Option<StorageDevice>,
    pub smart_before: Option<SmartStatus>,
    pub smart_after: Option<SmartStatus>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StabilityReport {
    pub verdict: Verdict,
    pub end: SessionEnd,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub requested_duration_secs: u64,
    pub elapsed_secs: f64,
    pub domains: BTreeMap<Domain, DomainStatus>,
    pub total_errors: u64,
    pub temperature_c: Option<StatSummary>,
    pub events: ReportEvents,
    pub historical_flags: HistoricalFlags,
    pub unavailable: Vec<Metric>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub storage_device: Option<StorageDevice>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub smart: Option<SmartDelta>,
    pub failure_reasons: Vec<String>,
    pub telemetry: TelemetrySummary,
}

impl StabilityReport {
    /// Pure: identical inputs give an identical report
    pub fn build(inputs: ReportInputs) -> StabilityReport {
        let (verdict, failure_reasons) = decide(&inputs);

        let domains: BTreeMap<Domain, DomainStatus> = Domain::ALL
            .iter()
            .map(|domain| {
                let status = match (inputs.results.get(domain), inputs.skipped.get(domain)) {
                    (Some(result), _) => DomainStatus::Tested(result.clone()),
                    (None, Some(reason)) => DomainStatus::Skipped {
                        reason: reason.clone(),
                    },
                    (None, None) => DomainStatus::NotTested,
                };
                (*domain, status)
            })
            .collect();

        let smart = match (inputs.smart_before, inputs.smart_after) {
            (Some(before), Some(after)) => Some(SmartDelta {
                before,
                after,
                warnings: after.warnings_since(&before),
            }),
            _ => None,
        };

        let counts = inputs.telemetry.counts;
        let events = ReportEvents {
            throttling: counts.throttling,
            under_voltage: counts.under_voltage,
            io_errors: counts.io_errors,
            smart_warnings: smart.as_ref().map_or(0, |s| s.warnings),
            kernel_errors: counts.kernel_errors,
        };

        StabilityReport {
            verdict,
            end: inputs.end,
            started_at: inputs.started_at,
            finished_at: inputs.finished_at,
            requested_duration_secs: inputs.requested.as_secs(),
            elapsed_secs: (inputs.elapsed.as_millis() as f64) / 1000.0,
            total_errors: domains.values().map(DomainStatus::errors).sum(),
            domains,
            temperature_c: inputs.telemetry.temperature_c,
            events,
            historical_flags: HistoricalFlags::from(inputs.telemetry.historical_flags),
            unavailable: inputs.telemetry.unavailable.clone(),
            storage_device: inputs.storage_device,
            smart,
            failure_reasons,
            telemetry: inputs.telemetry,
        }
    }

    pub fn to_json(&self) -> Result<String> {
        serde_json::to_string_pretty(self).map_err(|e| StressError::Serialization {
            context: "stability report".to_string(),
            source: Box::new(e),
        })
    }

    pub fn exit_code(&self) -> i32 {
        self.verdict.exit_code()
    }
}

/// Abnormal termination, then any PASS-condition violation, force FAIL;
/// a clean but interrupted session is INCOMPLETE.
fn decide(inputs: &ReportInputs) -> (Verdict, Vec<String>) {
    let mut reasons = Vec::new();

    for (domain, result) in &inputs.results {
        if result.abnormal {
            reasons.push(format!(
                "{} terminated abnormally: {}",
                domain,
                result.abnormal_reason.as_deref().unwrap_or("unknown cause")
            ));
        }
        if result.errors > 0 {
            reasons.push(format!("{} reported {} verification error(s)", domain, result.errors));
        }
    }

    for bit in inputs.telemetry.current_flags_observed.set_bits() {
        if bit.is_current() {
            reasons.push(format!("Observed during test: {}", bit.describe()));
        }
    }

    let kernel_errors = inputs.telemetry.counts.kernel_errors;
    if kernel_errors > 0 {
        reasons.push(format!("{} kernel error line(s) logged", kernel_errors));
    }

    let verdict = if !reasons.is_empty() {
        Verdict::Fail
    } else if inputs.end == SessionEnd::Interrupted {
        Verdict::Incomplete
    } else {
        Verdict::Pass
    };
    (verdict, reasons)
}
