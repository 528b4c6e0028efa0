// stress-core/src/integration_tests.rs
// End-to-end session scenarios on scaled-down durations with scripted probes

use std::sync::Arc;
use std::time::Duration;

use crate::events::TelemetryEvent;
use crate::orchestrator::{Collaborators, Orchestrator};
use crate::report::{DomainStatus, SessionEnd, StabilityReport, Verdict};
use crate::session::{Scope, SessionConfig};
use crate::telemetry::nvme::{SmartStatus, StorageDevice};
use crate::telemetry::simulated::{ScriptedLog, ScriptedProbe, ScriptedSmart, ScriptedTopology};
use crate::telemetry::ThrottleBit;
use crate::workload::{CpuKernel, FaultInjector};
use crate::Domain;

/// Initialize test tracing
fn init_test_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_test_writer()
        .with_env_filter("debug")
        .try_init();
}

const DURATION: Duration = Duration::from_millis(800);
const GRACE: Duration = Duration::from_secs(3);

fn test_config(scope: Scope) -> SessionConfig {
    let mut config = SessionConfig::new(DURATION, scope);
    config.threads = 2;
    config.sample_interval = Duration::from_millis(100);
    config.tuning.grace_period_secs = GRACE.as_secs();
    config.tuning.snapshot_interval_ms = 50;
    config.tuning.cpu.fft_size = 256;
    config.tuning.cpu.matrix_size = 16;
    config.tuning.cpu.prime_limit = 1_000;
    config.tuning.cpu.cipher_blocks = 64;
    config.tuning.memory.bytes = Some(1024 * 1024);
    config.tuning.memory.workers = 2;
    config.tuning.storage.file_mb = 1;
    config.tuning.storage.random_ops_per_pass = 16;
    config.tuning.storage.sequential_block_bytes = 64 * 1024;
    config
}

fn collaborators(flags: Vec<u32>, log: ScriptedLog) -> Collaborators {
    Collaborators {
        probe: Arc::new(ScriptedProbe::new(flags)),
        kernel_log: Box::new(log),
        topology: Box::new(ScriptedTopology(None)),
        smart: None,
        faults: Arc::new(FaultInjector::new()),
    }
}

fn tested(report: &StabilityReport, domain: Domain) -> &crate::workload::WorkloadResult {
    match &report.domains[&domain] {
        DomainStatus::Tested(result) => result,
        other => panic!("{domain} not tested: {other:?}"),
    }
}

#[tokio::test]
async fn test_cpu_only_session_passes() {
    init_test_tracing();
    let report = Orchestrator::new(
        test_config(Scope::only(Domain::Cpu)),
        collaborators(vec![0], ScriptedLog::silent()),
    )
    .run()
    .await
    .unwrap();

    assert_eq!(report.verdict, Verdict::Pass, "{:?}", report.failure_reasons);
    assert_eq!(report.end, SessionEnd::Completed);
    assert!(tested(&report, Domain::Cpu).operations > 0);
    for domain in [Domain::Memory, Domain::Storage, Domain::Video] {
        assert_eq!(report.domains[&domain], DomainStatus::NotTested);
    }
    assert!(report.telemetry.sample_count >= 2);
}

#[tokio::test]
async fn test_wall_clock_within_duration_and_grace() {
    let started = std::time::Instant::now();
    let report = Orchestrator::new(
        test_config(Scope::of(&[Domain::Cpu, Domain::Memory])),
        collaborators(vec![0], ScriptedLog::silent()),
    )
    .run()
    .await
    .unwrap();
    let wall = started.elapsed();

    assert!(wall >= DURATION, "stopped early after {wall:?}");
    assert!(wall <= DURATION + GRACE + Duration::from_secs(1), "overran: {wall:?}");
    assert!(report.elapsed_secs >= DURATION.as_secs_f64());
    assert_eq!(report.verdict, Verdict::Pass, "{:?}", report.failure_reasons);
    assert!(!tested(&report, Domain::Memory).shutdown_timed_out);
}

#[tokio::test]
async fn test_forced_cipher_mismatch_fails_session() {
    let collaborators = collaborators(vec![0], ScriptedLog::silent());
    collaborators.faults.arm_cpu(CpuKernel::Cipher);

    let report = Orchestrator::new(test_config(Scope::only(Domain::Cpu)), collaborators)
        .run()
        .await
        .unwrap();

    let cpu = tested(&report, Domain::Cpu);
    assert_eq!(cpu.errors, 1);
    assert_eq!(report.verdict, Verdict::Fail);
    assert_eq!(cpu.incidents.len(), 1);
    let incident = &cpu.incidents[0];
    assert_eq!(incident.phase, "cipher");
    assert!(incident.at >= report.started_at && incident.at <= report.finished_at);
}

#[tokio::test]
async fn test_cancellation_reports_incomplete() {
    let mut config = test_config(Scope::of(&[Domain::Cpu, Domain::Memory]));
    config.duration = Duration::from_secs(60);
    let orchestrator = Orchestrator::new(config, collaborators(vec![0], ScriptedLog::silent()));
    let interrupt = orchestrator.interrupt_token();

    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(300)).await;
        interrupt.cancel();
        interrupt.cancel();
    });

    let started = std::time::Instant::now();
    let report = orchestrator.run().await.unwrap();

    assert!(started.elapsed() < Duration::from_secs(30));
    assert_eq!(report.end, SessionEnd::Interrupted);
    assert_eq!(report.verdict, Verdict::Incomplete);
    assert_eq!(report.exit_code(), 3);
    assert_eq!(report.total_errors, 0);
    for domain in [Domain::Cpu, Domain::Memory] {
        let result = tested(&report, domain);
        assert_eq!(result.errors as usize, result.incidents.len());
    }
}

#[tokio::test]
async fn test_under_voltage_cleared_mid_session_stays_historical() {
    // clean, then under-voltage with its sticky bit, then only the sticky bit
    let flags = vec![0x0, 0x0, 0x50001, 0x50001, 0x50000];
    let report = Orchestrator::new(
        test_config(Scope::only(Domain::Cpu)),
        collaborators(flags, ScriptedLog::silent()),
    )
    .run()
    .await
    .unwrap();

    assert!(report.historical_flags.under_voltage_occurred);
    assert_eq!(report.events.under_voltage, 1);
    assert_eq!(report.verdict, Verdict::Fail);
    assert!(report
        .telemetry
        .events
        .iter()
        .any(|e| matches!(e, TelemetryEvent::FlagRaised { bit: ThrottleBit::UnderVoltage, .. })));
}

#[tokio::test]
async fn test_kernel_error_lines_fail_session() {
    let log = ScriptedLog::new(vec![
        vec![],
        vec![
            "[  812.551203] nvme nvme0: I/O error, dev nvme0n1, sector 2048".to_string(),
            "[  812.551210] usb 1-1: new high-speed USB device".to_string(),
        ],
    ]);
    let report = Orchestrator::new(test_config(Scope::only(Domain::Cpu)), collaborators(vec![0], log))
        .run()
        .await
        .unwrap();

    assert_eq!(report.events.kernel_errors, 1);
    assert_eq!(report.events.io_errors, 1);
    assert_eq!(report.verdict, Verdict::Fail);
}

#[tokio::test]
async fn test_unavailable_voltage_is_reported_not_fatal() {
    let collaborators = Collaborators {
        probe: Arc::new(ScriptedProbe::new(vec![0]).without_voltage()),
        ..collaborators(vec![0], ScriptedLog::silent())
    };
    let report = Orchestrator::new(test_config(Scope::only(Domain::Cpu)), collaborators)
        .run()
        .await
        .unwrap();

    assert_eq!(report.verdict, Verdict::Pass);
    assert!(report.unavailable.contains(&crate::telemetry::Metric::Voltage));
    assert!(report.telemetry.voltage_v.is_none());
}

#[tokio::test]
async fn test_storage_corruption_counts_exactly_one_error() {
    let dir = tempfile::tempdir().unwrap();
    let mut config = test_config(Scope::only(Domain::Storage));
    config.storage_path = Some(dir.path().to_path_buf());
    let collaborators = collaborators(vec![0], ScriptedLog::silent());
    collaborators.faults.arm_storage_readback();

    let report = Orchestrator::new(config, collaborators).run().await.unwrap();

    let storage = tested(&report, Domain::Storage);
    assert_eq!(storage.errors, 1);
    assert!(!storage.abnormal);
    assert!(storage.operations > 1);
    assert_eq!(report.verdict, Verdict::Fail);
    assert_eq!(std::fs::read_dir(dir.path()).unwrap().count(), 0);
}

#[tokio::test]
async fn test_smart_deltas_are_informational() {
    let dir = tempfile::tempdir().unwrap();
    let mut config = test_config(Scope::only(Domain::Storage));
    config.storage_path = Some(dir.path().to_path_buf());
    let device = StorageDevice {
        device_path: "/dev/nvme0n1".to_string(),
        model: "Test NVMe".to_string(),
        pcie_gen: Some(3),
    };
    let collaborators = Collaborators {
        topology: Box::new(ScriptedTopology(Some(device.clone()))),
        smart: Some(Arc::new(ScriptedSmart::new(vec![
            SmartStatus::default(),
            SmartStatus {
                media_errors: 1,
                ..SmartStatus::default()
            },
        ]))),
        ..collaborators(vec![0], ScriptedLog::silent())
    };

    let report = Orchestrator::new(config, collaborators).run().await.unwrap();

    assert_eq!(report.storage_device, Some(device));
    assert_eq!(report.events.smart_warnings, 1);
    assert_eq!(report.verdict, Verdict::Pass, "{:?}", report.failure_reasons);
}

/// Fields that depend on wall-clock time or on how many passes fit in the run
const TIMING_FIELDS: [&str; 11] = [
    "started_at",
    "finished_at",
    "elapsed_secs",
    "at",
    "operations",
    "bytes",
    "peak_bandwidth_mbps",
    "sample_count",
    "first_sample_at",
    "last_sample_at",
    "samples",
];

fn without_timing(report: &StabilityReport) -> serde_json::Value {
    fn strip(value: &mut serde_json::Value) {
        match value {
            serde_json::Value::Object(map) => {
                for field in TIMING_FIELDS {
                    map.remove(field);
                }
                map.values_mut().for_each(strip);
            }
            serde_json::Value::Array(items) => items.iter_mut().for_each(strip),
            _ => {}
        }
    }
    let mut value: serde_json::Value = serde_json::from_str(&report.to_json().unwrap()).unwrap();
    strip(&mut value);
    value
}

async fn run_scripted_failure() -> StabilityReport {
    let faults = Arc::new(FaultInjector::new());
    faults.arm_cpu(CpuKernel::Cipher);
    let log = ScriptedLog::new(vec![
        Vec::new(),
        vec!["[  512.000000] blk_update_request: I/O error, dev nvme0n1, sector 2048".to_string()],
    ]);
    let mut config = test_config(Scope::only(Domain::Cpu));
    config.threads = 1;
    let collaborators = Collaborators {
        faults,
        ..collaborators(vec![0, 0x4, 0x40000], log)
    };
    Orchestrator::new(config, collaborators).run().await.unwrap()
}

#[tokio::test]
async fn test_identical_inputs_give_identical_reports() {
    let first = run_scripted_failure().await;
    let second = run_scripted_failure().await;

    assert_eq!(first.verdict, Verdict::Fail);
    assert_eq!(first.verdict, second.verdict);
    assert_eq!(first.failure_reasons, second.failure_reasons);
    assert_eq!(first.events, second.events);
    assert_eq!(first.events.io_errors, 1);
    assert_eq!(first.historical_flags, second.historical_flags);
    assert!(first.historical_flags.throttled_occurred);
    assert_eq!(first.unavailable, second.unavailable);
    assert_eq!(tested(&first, Domain::Cpu).errors, 1);
    assert_eq!(tested(&second, Domain::Cpu).errors, 1);
    assert_eq!(without_timing(&first), without_timing(&second));
}

#[tokio::test]
async fn test_stalled_sensor_cannot_extend_shutdown() {
    init_test_tracing();
    let duration = Duration::from_millis(500);
    let grace = Duration::from_secs(1);
    let mut config = test_config(Scope::only(Domain::Cpu));
    config.duration = duration;
    config.tuning.grace_period_secs = grace.as_secs();
    let collaborators = Collaborators {
        probe: Arc::new(ScriptedProbe::new(vec![0]).stalling(Duration::from_secs(4))),
        ..collaborators(vec![0], ScriptedLog::silent())
    };

    let started = std::time::Instant::now();
    let report = Orchestrator::new(config, collaborators).run().await.unwrap();
    let wall = started.elapsed();

    assert!(wall <= duration + grace + Duration::from_secs(1), "overran: {wall:?}");
    assert_eq!(report.verdict, Verdict::Pass, "{:?}", report.failure_reasons);
    assert!(!tested(&report, Domain::Cpu).shutdown_timed_out);
}
