// stress-core/src/lib.rs
// Stability verification engine: workloads, telemetry, verdict

pub mod config_validation;
pub mod error;
pub mod events;
pub mod observability;
pub mod orchestrator;
pub mod report;
pub mod session;
pub mod system;
pub mod telemetry;
pub mod tuning;
pub mod workload;

pub use config_validation::{validate_session, SessionValidator, SystemConstraints, ValidationReport};
pub use error::{Result, StressError};
pub use observability::{HealthStatus, LiveSnapshot};
pub use orchestrator::{Collaborators, Orchestrator};
pub use report::{DomainStatus, SessionEnd, StabilityReport, Verdict};
pub use session::{parse_duration, Domain, OutputMode, Scope, ScopeRequest, SessionConfig, TestSession};
pub use tuning::StressTuning;

#[cfg(test)]
mod integration_tests;
