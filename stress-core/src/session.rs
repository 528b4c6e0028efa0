// stress-core/src/session.rs
// Session model: domains, scope, output mode and the running session clock

use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fmt;
use std::path::PathBuf;
use std::time::Duration;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::error::*;
use crate::stress_error;
use crate::tuning::StressTuning;

/// One stress category
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Domain {
    Cpu,
    Memory,
    Storage,
    Video,
}

impl Domain {
    pub const ALL: [Domain; 4] = [Domain::Cpu, Domain::Memory, Domain::Storage, Domain::Video];

    pub fn label(&self) -> &'static str {
        match self {
            Domain::Cpu => "CPU",
            Domain::Memory => "Memory",
            Domain::Storage => "Storage",
            Domain::Video => "Video",
        }
    }
}

impl fmt::Display for Domain {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

/// How live status and the final report are rendered
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OutputMode {
    Interactive,
    Simple,
    Json,
}

/// Scope-related flags as given on the command line
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ScopeRequest {
    pub only: Option<Domain>,
    pub extended: bool,
    pub video: bool,
}

/// Which domains a session drives
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Scope {
    domains: BTreeSet<Domain>,
}

impl Scope {
    /// Resolve scope flags. A single-domain flag is the most restrictive
    /// request and wins over `extended`/`video`.
    pub fn resolve(request: &ScopeRequest) -> Scope {
        let mut domains = BTreeSet::new();
        match request.only {
            Some(domain) => {
                domains.insert(domain);
            }
            None => {
                domains.insert(Domain::Cpu);
                domains.insert(Domain::Memory);
                if request.extended {
                    domains.insert(Domain::Storage);
                }
                if request.video {
                    domains.insert(Domain::Video);
                }
            }
        }
        Scope { domains }
    }

    pub fn only(domain: Domain) -> Scope {
        Scope {
            domains: BTreeSet::from([domain]),
        }
    }

    pub fn of(domains: &[Domain]) -> Scope {
        Scope {
            domains: domains.iter().copied().collect(),
        }
    }

    pub fn contains(&self, domain: Domain) -> bool {
        self.domains.contains(&domain)
    }

    pub fn domains(&self) -> impl Iterator<Item = Domain> + '_ {
        self.domains.iter().copied()
    }

    pub fn len(&self) -> usize {
        self.domains.len()
    }

    pub fn is_empty(&self) -> bool {
        self.domains.is_empty()
    }

    pub fn is_single(&self) -> bool {
        self.domains.len() == 1
    }
}

/// Parse composite durations such as "90s", "30m" or "2h30m"
pub fn parse_duration(input: &str) -> Result<Duration> {
    let duration = humantime::parse_duration(input.trim())
        .map_err(|e| stress_error!(config, "duration", format!("invalid duration '{}': {}", input, e)))?;
    if duration.is_zero() {
        return Err(stress_error!(config, "duration", "duration must be greater than zero"));
    }
    Ok(duration)
}

/// Validated, user-facing session parameters
#[derive(Debug, Clone)]
pub struct SessionConfig {
    pub duration: Duration,
    pub scope: Scope,
    pub threads: usize,
    pub sample_interval: Duration,
    pub output: OutputMode,
    pub storage_path: Option<PathBuf>,
    pub tuning: StressTuning,
}

impl SessionConfig {
    pub fn new(duration: Duration, scope: Scope) -> Self {
        Self {
            duration,
            scope,
            threads: num_cpus::get(),
            sample_interval: Duration::from_secs(2),
            output: OutputMode::Simple,
            storage_path: None,
            tuning: StressTuning::default(),
        }
    }
}

/// A running session. Immutable once started; owns the deadline and the
/// cancellation signal every domain is bound to.
#[derive(Debug, Clone)]
pub struct TestSession {
    config: SessionConfig,
    started: Instant,
    started_at: chrono::DateTime<chrono::Utc>,
    deadline: Instant,
    cancel: CancellationToken,
}

impl TestSession {
    pub fn start(config: SessionConfig) -> Self {
        let started = Instant::now();
        Self {
            deadline: started + config.duration,
            started,
            started_at: chrono::Utc::now(),
            cancel: CancellationToken::new(),
            config,
        }
    }

    pub fn config(&self) -> &SessionConfig {
        &self.config
    }

    pub fn tuning(&self) -> &StressTuning {
        &self.config.tuning
    }

    pub fn duration(&self) -> Duration {
        self.config.duration
    }

    pub fn scope(&self) -> &Scope {
        &self.config.scope
    }

    pub fn deadline(&self) -> Instant {
        self.deadline
    }

    pub fn started(&self) -> Instant {
        self.started
    }

    pub fn started_at(&self) -> chrono::DateTime<chrono::Utc> {
        self.started_at
    }

    pub fn elapsed(&self) -> Duration {
        self.started.elapsed()
    }

    pub fn remaining(&self) -> Duration {
        self.deadline.saturating_duration_since(Instant::now())
    }

    /// Child token for one concurrent unit; cancelled with the session
    pub fn child_token(&self) -> CancellationToken {
        self.cancel.child_token()
    }

    /// Idempotent
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }
}
