// stress-core/src/events.rs
// Incident and telemetry event records shared between generators, sampler and report

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

use crate::error::StressError;
use crate::telemetry::ThrottleBit;
use crate::Domain;

/// One verification failure inside a workload
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Incident {
    pub domain: Domain,
    /// Kernel or pass name, e.g. "cipher" or "random-readback"
    pub phase: String,
    pub iteration: u64,
    pub detail: String,
    pub at: DateTime<Utc>,
}

impl Incident {
    pub fn new(domain: Domain, phase: &str, iteration: u64, detail: String) -> Self {
        Self {
            domain,
            phase: phase.to_string(),
            iteration,
            detail,
            at: Utc::now(),
        }
    }

    /// Integrity errors keep their bare detail; anything else its full message
    pub fn from_error(domain: Domain, phase: &str, iteration: u64, err: &StressError) -> Self {
        let detail = match err {
            StressError::Integrity { detail, .. } => detail.clone(),
            other => other.to_string(),
        };
        Self::new(domain, phase, iteration, detail)
    }
}

impl fmt::Display for Incident {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "[{}] {}/{} #{}: {}",
            self.at.format("%H:%M:%S"),
            self.domain,
            self.phase,
            self.iteration,
            self.detail
        )
    }
}

/// Class of a kernel log line that matched an error pattern
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LogClass {
    Io,
    Other,
}

/// Discrete telemetry event: a 0→1 bit transition or a newly seen log line
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum TelemetryEvent {
    FlagRaised { bit: ThrottleBit, at: DateTime<Utc> },
    KernelError { class: LogClass, line: String, at: DateTime<Utc> },
}

impl TelemetryEvent {
    pub fn at(&self) -> DateTime<Utc> {
        match self {
            TelemetryEvent::FlagRaised { at, .. } | TelemetryEvent::KernelError { at, .. } => *at,
        }
    }
}

impl fmt::Display for TelemetryEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TelemetryEvent::FlagRaised { bit, at } => {
                write!(f, "[{}] FLAG: {}", at.format("%H:%M:%S"), bit.describe())
            }
            TelemetryEvent::KernelError { class, line, at } => {
                let tag = match class {
                    LogClass::Io => "IO",
                    LogClass::Other => "KERNEL",
                };
                write!(f, "[{}] {}: {}", at.format("%H:%M:%S"), tag, line.trim())
            }
        }
    }
}
