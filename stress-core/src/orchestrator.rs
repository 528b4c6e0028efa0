// stress-core/src/orchestrator.rs
// Workload orchestrator: prepares domains, runs them under one deadline, shuts down and builds the report

use parking_lot::RwLock;
use std::collections::BTreeMap;
use std::sync::Arc;
use tokio::sync::watch;
use tokio::time::{interval, sleep_until, timeout_at, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn};

use crate::error::*;
use crate::observability::{DomainLive, DomainState, HealthChecker, LiveSnapshot};
use crate::report::{ReportInputs, SessionEnd, StabilityReport};
use crate::session::{SessionConfig, TestSession};
use crate::stress_error;
use crate::telemetry::kernel_log::{DmesgLogSource, LogClassifier};
use crate::telemetry::nvme::{NvmeCliSmart, SmartSource, SmartStatus, StorageTopology, SysfsTopology};
use crate::telemetry::probe::{HardwareProbe, KernelLogSource, SystemProbe};
use crate::telemetry::{spawn_sampler, Sampler, TelemetryHistory};
use crate::workload::{DomainCounters, DomainExit, DomainHandle, FaultInjector, Workload};
use crate::Domain;

/// Capability sources the session reads from
pub struct Collaborators {
    pub probe: Arc<dyn HardwareProbe>,
    pub kernel_log: Box<dyn KernelLogSource>,
    pub topology: Box<dyn StorageTopology>,
    /// Overrides the nvme-cli source derived from the detected device
    pub smart: Option<Arc<dyn SmartSource>>,
    pub faults: Arc<FaultInjector>,
}

impl Collaborators {
    /// Concrete Linux sources. Missing tools degrade to unavailable metrics.
    pub fn system() -> Self {
        let kernel_log: Box<dyn KernelLogSource> = match DmesgLogSource::open() {
            Ok(source) => Box::new(source),
            Err(e) => {
                warn!("Kernel log unavailable: {}", e);
                Box::new(UnavailableLog(e.to_string()))
            }
        };
        Self {
            probe: Arc::new(SystemProbe::new()),
            kernel_log,
            topology: Box::new(SysfsTopology::new()),
            smart: None,
            faults: Arc::new(FaultInjector::new()),
        }
    }
}

/// Stand-in when dmesg cannot be read; the sampler disables the metric on first use
struct UnavailableLog(String);

impl KernelLogSource for UnavailableLog {
    fn read_new(&mut self) -> Result<Vec<String>> {
        Err(stress_error!(unavailable, "kernel log", self.0))
    }
}

struct RunningDomain {
    handle: DomainHandle,
    counters: Arc<DomainCounters>,
}

pub struct Orchestrator {
    config: SessionConfig,
    collaborators: Collaborators,
    interrupt: CancellationToken,
    snapshots: watch::Sender<LiveSnapshot>,
    health: HealthChecker,
}

impl Orchestrator {
    pub fn new(config: SessionConfig, collaborators: Collaborators) -> Self {
        let (snapshots, _) = watch::channel(LiveSnapshot::idle(config.duration));
        let health = HealthChecker::new(config.tuning.display.clone());
        Self {
            config,
            collaborators,
            interrupt: CancellationToken::new(),
            snapshots,
            health,
        }
    }

    /// Cancelling this token ends the session early as interrupted
    pub fn interrupt_token(&self) -> CancellationToken {
        self.interrupt.clone()
    }

    pub fn subscribe(&self) -> watch::Receiver<LiveSnapshot> {
        self.snapshots.subscribe()
    }

    /// Run the whole session. Errors only before the session starts; once it
    /// is running every outcome ends in a report.
    #[instrument(skip(self), fields(duration = ?self.config.duration))]
    pub async fn run(self) -> Result<StabilityReport> {
        let Orchestrator {
            config,
            collaborators,
            interrupt,
            snapshots,
            health,
        } = self;
        let tuning = config.tuning.clone();
        let classifier = LogClassifier::new(&tuning.kernel_log)?;

        let (workloads, skipped) = prepare_domains(&config, &collaborators.faults).await?;

        let storage_device = if workloads.iter().any(|w| w.domain() == Domain::Storage) {
            let device = collaborators.topology.detect();
            match &device {
                Some(d) => info!("💾 Storage device: {} ({})", d.model, d.device_path),
                None => warn!("No NVMe device detected; SMART deltas unavailable"),
            }
            device
        } else {
            None
        };
        let smart: Option<Arc<dyn SmartSource>> = collaborators.smart.clone().or_else(|| {
            storage_device
                .as_ref()
                .map(|d| Arc::new(NvmeCliSmart::for_device(&d.device_path)) as Arc<dyn SmartSource>)
        });
        let smart_before = query_smart(smart.clone()).await;

        let session = TestSession::start(config);
        info!(
            "🔥 Stress session started: {:?} across {} domain(s)",
            session.duration(),
            workloads.len()
        );

        let history = Arc::new(RwLock::new(TelemetryHistory::new()));
        let sampler_cancel = CancellationToken::new();
        let sampler = Sampler::new(
            Arc::clone(&collaborators.probe),
            collaborators.kernel_log,
            classifier,
        );
        let mut sampler_task = spawn_sampler(
            sampler,
            Arc::clone(&history),
            session.config().sample_interval,
            sampler_cancel.clone(),
        );

        let mut running = Vec::new();
        let mut results = BTreeMap::new();
        for workload in workloads {
            let domain = workload.domain();
            let counters = Arc::new(DomainCounters::new(domain, tuning.max_incidents));
            match workload.start(session.child_token(), Arc::clone(&counters)) {
                Ok(handle) => running.push(RunningDomain { handle, counters }),
                Err(e) => {
                    error!("Failed to start {} stress: {}", domain, e);
                    results.insert(domain, counters.finish(&DomainExit::Abnormal(e.to_string()), false));
                }
            }
        }

        let mut publish = interval(tuning.snapshot_interval());
        publish.set_missed_tick_behavior(MissedTickBehavior::Delay);

        let end = loop {
            tokio::select! {
                _ = sleep_until(session.deadline()) => break SessionEnd::Completed,
                _ = interrupt.cancelled() => break SessionEnd::Interrupted,
                _ = publish.tick() => {
                    let all_stopped = running.iter_mut().all(|d| d.handle.try_finish().is_some());
                    let domains = domain_states(&mut running, &skipped, DomainState::Running);
                    publish_snapshot(&snapshots, &session, domains, &history, &health);
                    if all_stopped {
                        warn!("Every domain stopped before the deadline");
                        break SessionEnd::Completed;
                    }
                }
            }
        };

        match end {
            SessionEnd::Completed => info!("⏰ Deadline reached, stopping workloads"),
            SessionEnd::Interrupted => info!("🛑 Interrupted, stopping workloads"),
        }
        session.cancel();
        let domains = domain_states(&mut running, &skipped, DomainState::Stopping);
        publish_snapshot(&snapshots, &session, domains, &history, &health);

        let grace = tuning.grace_period();
        let grace_deadline = Instant::now() + grace;
        for domain in &mut running {
            let name = domain.handle.domain();
            let result = match timeout_at(grace_deadline, domain.handle.wait()).await {
                Ok(exit) => {
                    debug!("{} stopped: {:?}", name, exit);
                    domain.counters.finish(&exit, false)
                }
                Err(_) => {
                    StressError::timeout(&format!("{} shutdown", name), grace).log("abandoning the unit mid-pass");
                    domain.handle.abandon();
                    domain.counters.finish(&DomainExit::Completed, true)
                }
            };
            results.insert(name, result);
        }

        // The final sample and the closing SMART read share what is left of the grace period
        sampler_cancel.cancel();
        let smart = smart_before.and(smart);
        let closing_smart = async move {
            match timeout_at(grace_deadline, query_smart(smart)).await {
                Ok(status) => status,
                Err(_) => {
                    StressError::timeout("closing SMART query", grace).log("SMART delta unavailable");
                    None
                }
            }
        };
        let (sampler_exit, smart_after) =
            tokio::join!(timeout_at(grace_deadline, &mut sampler_task), closing_smart);
        match sampler_exit {
            Ok(Ok(())) => {}
            Ok(Err(e)) => error!("Telemetry sampler ended abnormally: {}", e),
            Err(_) => {
                sampler_task.abort();
                StressError::timeout("telemetry sampler shutdown", grace)
                    .log("keeping the samples taken so far");
            }
        }
        let domains = domain_states(&mut running, &skipped, DomainState::Finished);
        publish_snapshot(&snapshots, &session, domains, &history, &health);

        let telemetry = std::mem::take(&mut *history.write()).freeze();

        let report = StabilityReport::build(ReportInputs {
            started_at: session.started_at(),
            finished_at: chrono::Utc::now(),
            requested: session.duration(),
            elapsed: session.elapsed(),
            end,
            results,
            skipped,
            telemetry,
            storage_device,
            smart_before,
            smart_after,
        });
        info!(
            "📋 Verdict: {} ({} error(s), {} telemetry sample(s))",
            report.verdict, report.total_errors, report.telemetry.sample_count
        );
        Ok(report)
    }
}

/// Prepare every requested domain. A failure excludes the domain unless it
/// was the only one requested, the error is a configuration error, or
/// nothing is left to run.
async fn prepare_domains(
    config: &SessionConfig,
    faults: &Arc<FaultInjector>,
) -> Result<(Vec<Workload>, BTreeMap<Domain, String>)> {
    let mut prepared = Vec::new();
    let mut skipped = BTreeMap::new();

    for domain in config.scope.domains() {
        let mut workload = Workload::for_domain(domain, config, Arc::clone(faults));
        match workload.prepare().await {
            Ok(()) => prepared.push(workload),
            Err(e) if config.scope.is_single() || !e.is_recoverable() => {
                error!("{} stress cannot start: {}", domain, e);
                return Err(e.into_configuration(domain.label()));
            }
            Err(e) => {
                warn!("⚠️  Excluding {} stress: {}", domain, e);
                skipped.insert(domain, e.to_string());
            }
        }
    }

    if prepared.is_empty() {
        return Err(stress_error!(
            config,
            "scope",
            "none of the requested domains could be initialized"
        ));
    }
    Ok((prepared, skipped))
}

async fn query_smart(source: Option<Arc<dyn SmartSource>>) -> Option<SmartStatus> {
    let source = source?;
    match tokio::task::spawn_blocking(move || source.query()).await {
        Ok(Ok(status)) => Some(status),
        Ok(Err(e)) => {
            warn!("SMART query failed: {}", e);
            None
        }
        Err(e) => {
            warn!("SMART query task failed: {}", e);
            None
        }
    }
}

/// `state` applies to every unit that has not stopped on its own
fn domain_states(
    running: &mut [RunningDomain],
    skipped: &BTreeMap<Domain, String>,
    state: DomainState,
) -> BTreeMap<Domain, DomainLive> {
    let mut domains: BTreeMap<Domain, DomainLive> = running
        .iter_mut()
        .map(|d| {
            let state = if state != DomainState::Finished && d.handle.try_finish().is_some() {
                DomainState::Finished
            } else {
                state
            };
            (
                d.handle.domain(),
                DomainLive {
                    state,
                    progress: d.counters.progress(),
                },
            )
        })
        .collect();
    for domain in skipped.keys() {
        domains.insert(
            *domain,
            DomainLive {
                state: DomainState::Skipped,
                progress: Default::default(),
            },
        );
    }
    domains
}

fn publish_snapshot(
    snapshots: &watch::Sender<LiveSnapshot>,
    session: &TestSession,
    domains: BTreeMap<Domain, DomainLive>,
    history: &RwLock<TelemetryHistory>,
    health: &HealthChecker,
) {
    let snapshot = {
        let history = history.read();
        LiveSnapshot::capture(session.elapsed(), session.duration(), domains, &history, health)
    };
    snapshots.send_replace(snapshot);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::Scope;
    use crate::telemetry::simulated::{ScriptedLog, ScriptedProbe, ScriptedTopology};
    use crate::tuning::VideoTuning;
    use std::time::Duration;

    fn scripted() -> Collaborators {
        Collaborators {
            probe: Arc::new(ScriptedProbe::new(vec![0])),
            kernel_log: Box::new(ScriptedLog::silent()),
            topology: Box::new(ScriptedTopology(None)),
            smart: None,
            faults: Arc::new(FaultInjector::new()),
        }
    }

    fn video_config(scope: Scope) -> SessionConfig {
        let mut config = SessionConfig::new(Duration::from_millis(300), scope);
        config.threads = 1;
        config.tuning.video = VideoTuning {
            ffmpeg: "/nonexistent/ffmpeg".to_string(),
            ..VideoTuning::default()
        };
        config.tuning.cpu.fft_size = 256;
        config.tuning.cpu.matrix_size = 16;
        config.tuning.cpu.prime_limit = 1_000;
        config.tuning.cpu.cipher_blocks = 64;
        config
    }

    #[tokio::test]
    async fn test_sole_domain_failure_is_configuration_error() {
        let orchestrator = Orchestrator::new(video_config(Scope::only(Domain::Video)), scripted());
        let err = orchestrator.run().await.unwrap_err();
        assert!(matches!(err, StressError::Configuration { ref field, .. } if field == "Video"));
    }

    #[tokio::test]
    async fn test_configuration_error_aborts_multi_domain_session() {
        let mut config = video_config(Scope::of(&[Domain::Cpu, Domain::Memory]));
        config.tuning.cpu.fft_size = 1000;
        config.tuning.memory.bytes = Some(1024 * 1024);
        let err = Orchestrator::new(config, scripted()).run().await.unwrap_err();
        assert!(matches!(err, StressError::Configuration { ref field, .. } if field == "cpu.fft_size"));
    }

    #[tokio::test]
    async fn test_failing_domain_is_skipped_among_others() {
        let config = video_config(Scope::of(&[Domain::Cpu, Domain::Video]));
        let report = Orchestrator::new(config, scripted()).run().await.unwrap();
        match &report.domains[&Domain::Video] {
            crate::report::DomainStatus::Skipped { reason } => assert!(reason.contains("ffmpeg")),
            other => panic!("expected skipped video, got {other:?}"),
        }
        assert!(matches!(report.domains[&Domain::Cpu], crate::report::DomainStatus::Tested(_)));
    }

    #[tokio::test]
    async fn test_snapshots_are_published() {
        let mut config = video_config(Scope::only(Domain::Cpu));
        config.tuning.snapshot_interval_ms = 50;
        let orchestrator = Orchestrator::new(config, scripted());
        let mut rx = orchestrator.subscribe();
        let run = tokio::spawn(orchestrator.run());

        tokio_test::assert_ok!(tokio::time::timeout(Duration::from_secs(5), rx.changed()).await);
        let report = run.await.unwrap().unwrap();
        assert!(report.telemetry.sample_count >= 1);

        let last = rx.borrow().clone();
        assert_eq!(last.domains[&Domain::Cpu].state, DomainState::Finished);
    }
}
