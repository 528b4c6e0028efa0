// stress-core/src/workload/mod.rs
// Workload domains: shared counters, completion handles and the closed set of generators

pub mod cpu;
pub mod memory;
pub mod storage;
pub mod video;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, AtomicU8, Ordering};
use std::sync::Arc;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

use crate::error::*;
use crate::events::Incident;
use crate::session::SessionConfig;
use crate::stress_error;
use crate::Domain;
pub use cpu::{CpuKernel, CpuStress};
pub use memory::MemoryStress;
pub use storage::StorageStress;
pub use video::VideoStress;

/// How a domain unit ended
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DomainExit {
    Completed,
    /// Crashed, panicked or lost its resource; forces FAIL
    Abnormal(String),
}

/// Live counters for one domain, written by its workers and read by snapshots.
/// Error counts only ever grow.
#[derive(Debug)]
pub struct DomainCounters {
    domain: Domain,
    errors: AtomicU64,
    operations: AtomicU64,
    bytes: AtomicU64,
    peak_bandwidth_bits: AtomicU64,
    incidents: Mutex<Vec<Incident>>,
    max_incidents: usize,
}

impl DomainCounters {
    pub fn new(domain: Domain, max_incidents: usize) -> Self {
        Self {
            domain,
            errors: AtomicU64::new(0),
            operations: AtomicU64::new(0),
            bytes: AtomicU64::new(0),
            peak_bandwidth_bits: AtomicU64::new(0),
            incidents: Mutex::new(Vec::new()),
            max_incidents,
        }
    }

    pub fn domain(&self) -> Domain {
        self.domain
    }

    /// One verification failure
    pub fn record_incident(&self, phase: &str, iteration: u64, detail: String) {
        self.record_errors(phase, iteration, 1, detail);
    }

    /// `count` failures sharing one incident record (e.g. a run of corrupted bytes)
    pub fn record_errors(&self, phase: &str, iteration: u64, count: u64, detail: String) {
        let err = StressError::Integrity {
            domain: self.domain,
            detail,
        };
        self.record_failure(phase, iteration, count, &err);
    }

    /// Count `count` errors against the domain. The log level follows the error category.
    pub fn record_failure(&self, phase: &str, iteration: u64, count: u64, err: &StressError) {
        if count == 0 {
            return;
        }
        let total = self.errors.fetch_add(count, Ordering::SeqCst) + count;
        err.log(&format!(
            "{} {} (iteration {}, total {})",
            self.domain, phase, iteration, total
        ));
        let mut incidents = self.incidents.lock();
        if incidents.len() < self.max_incidents {
            incidents.push(Incident::from_error(self.domain, phase, iteration, err));
        }
    }

    pub fn add_operations(&self, n: u64) {
        self.operations.fetch_add(n, Ordering::Relaxed);
    }

    pub fn add_bytes(&self, n: u64) {
        self.bytes.fetch_add(n, Ordering::Relaxed);
    }

    /// Keeps the highest bandwidth seen. Non-negative floats order like their bit patterns.
    pub fn record_bandwidth(&self, mb_per_sec: f64) {
        if mb_per_sec.is_finite() && mb_per_sec > 0.0 {
            self.peak_bandwidth_bits
                .fetch_max(mb_per_sec.to_bits(), Ordering::Relaxed);
        }
    }

    pub fn errors(&self) -> u64 {
        self.errors.load(Ordering::SeqCst)
    }

    pub fn operations(&self) -> u64 {
        self.operations.load(Ordering::Relaxed)
    }

    pub fn bytes(&self) -> u64 {
        self.bytes.load(Ordering::Relaxed)
    }

    pub fn peak_bandwidth(&self) -> Option<f64> {
        match self.peak_bandwidth_bits.load(Ordering::Relaxed) {
            0 => None,
            bits => Some(f64::from_bits(bits)),
        }
    }

    pub fn progress(&self) -> DomainProgress {
        DomainProgress {
            errors: self.errors(),
            operations: self.operations(),
            bytes: self.bytes(),
        }
    }

    /// Final result for the report
    pub fn finish(&self, exit: &DomainExit, shutdown_timed_out: bool) -> WorkloadResult {
        let (abnormal, abnormal_reason) = match exit {
            DomainExit::Completed => (false, None),
            DomainExit::Abnormal(reason) => (true, Some(reason.clone())),
        };
        WorkloadResult {
            domain: self.domain,
            errors: self.errors(),
            operations: self.operations(),
            bytes: self.bytes(),
            abnormal,
            abnormal_reason,
            shutdown_timed_out,
            peak_bandwidth_mbps: self.peak_bandwidth(),
            incidents: self.incidents.lock().clone(),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DomainProgress {
    pub errors: u64,
    pub operations: u64,
    pub bytes: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkloadResult {
    pub domain: Domain,
    pub errors: u64,
    pub operations: u64,
    pub bytes: u64,
    pub abnormal: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub abnormal_reason: Option<String>,
    pub shutdown_timed_out: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub peak_bandwidth_mbps: Option<f64>,
    pub incidents: Vec<Incident>,
}

/// Drill hook: arms exactly one forced mismatch, consumed by the first
/// generator pass that checks for it.
#[derive(Debug, Default)]
pub struct FaultInjector {
    cpu_kernel: AtomicU8,
    storage_readback: AtomicU8,
}

impl FaultInjector {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn arm_cpu(&self, kernel: CpuKernel) {
        info!("💉 Arming forced mismatch in CPU kernel '{}'", kernel.name());
        self.cpu_kernel.store(kernel.index() + 1, Ordering::SeqCst);
    }

    pub fn arm_storage_readback(&self) {
        info!("💉 Arming forced storage read-back corruption");
        self.storage_readback.store(1, Ordering::SeqCst);
    }

    /// True exactly once after `arm_cpu(kernel)`
    pub fn take_cpu(&self, kernel: CpuKernel) -> bool {
        let armed = kernel.index() + 1;
        self.cpu_kernel
            .compare_exchange(armed, 0, Ordering::SeqCst, Ordering::SeqCst)
            .is_ok()
    }

    /// True exactly once after `arm_storage_readback()`
    pub fn take_storage_readback(&self) -> bool {
        self.storage_readback
            .compare_exchange(1, 0, Ordering::SeqCst, Ordering::SeqCst)
            .is_ok()
    }
}

/// Completion side of a started domain
pub struct DomainHandle {
    domain: Domain,
    exit: oneshot::Receiver<DomainExit>,
    finished: Option<DomainExit>,
    task: Option<JoinHandle<()>>,
}

impl DomainHandle {
    pub fn domain(&self) -> Domain {
        self.domain
    }

    /// Non-blocking check for a unit that already stopped on its own
    pub fn try_finish(&mut self) -> Option<&DomainExit> {
        if self.finished.is_none() {
            self.finished = match self.exit.try_recv() {
                Ok(exit) => Some(exit),
                Err(oneshot::error::TryRecvError::Empty) => None,
                Err(oneshot::error::TryRecvError::Closed) => Some(self.lost()),
            };
        }
        self.finished.as_ref()
    }

    /// A unit that went away without reporting (panic) counts as abnormal
    pub async fn wait(&mut self) -> DomainExit {
        if let Some(exit) = &self.finished {
            return exit.clone();
        }
        let exit = match (&mut self.exit).await {
            Ok(exit) => exit,
            Err(_) => self.lost(),
        };
        self.finished = Some(exit.clone());
        exit
    }

    fn lost(&self) -> DomainExit {
        error!("{} unit exited without reporting completion", self.domain);
        DomainExit::Abnormal("worker terminated unexpectedly".to_string())
    }

    /// Escalation after the grace period. Async units are aborted; thread
    /// units are detached and end with the process.
    pub fn abandon(&mut self) {
        if let Some(task) = self.task.take() {
            task.abort();
        }
    }
}

/// The closed set of workload domains
pub enum Workload {
    Cpu(CpuStress),
    Memory(MemoryStress),
    Storage(StorageStress),
    Video(VideoStress),
}

impl Workload {
    pub fn for_domain(domain: Domain, config: &SessionConfig, faults: Arc<FaultInjector>) -> Workload {
        let tuning = &config.tuning;
        match domain {
            Domain::Cpu => Workload::Cpu(CpuStress::new(config.threads, tuning.cpu.clone(), faults)),
            Domain::Memory => Workload::Memory(MemoryStress::new(tuning.memory.clone())),
            Domain::Storage => Workload::Storage(StorageStress::new(
                tuning.storage.clone(),
                config.storage_path.clone(),
                faults,
            )),
            Domain::Video => Workload::Video(VideoStress::new(tuning.video.clone())),
        }
    }

    pub fn domain(&self) -> Domain {
        match self {
            Workload::Cpu(_) => Domain::Cpu,
            Workload::Memory(_) => Domain::Memory,
            Workload::Storage(_) => Domain::Storage,
            Workload::Video(_) => Domain::Video,
        }
    }

    /// Acquire resources and check dependencies. A failure excludes the domain.
    pub async fn prepare(&mut self) -> Result<()> {
        match self {
            Workload::Cpu(cpu) => cpu.prepare(),
            Workload::Memory(memory) => memory.prepare(),
            Workload::Storage(storage) => storage.prepare().await,
            Workload::Video(video) => video.prepare().await,
        }
    }

    /// Run until `cancel` fires. Compute-bound domains get a dedicated OS
    /// thread so runtime shutdown never waits on them.
    pub fn start(self, cancel: CancellationToken, counters: Arc<DomainCounters>) -> Result<DomainHandle> {
        let domain = self.domain();
        let (tx, rx) = oneshot::channel();
        info!("🚀 Starting {} stress", domain);

        let task = match self {
            Workload::Cpu(cpu) => {
                spawn_thread(domain, move || cpu.run(&cancel, &counters), tx)?;
                None
            }
            Workload::Memory(memory) => {
                spawn_thread(domain, move || memory.run(&cancel, &counters), tx)?;
                None
            }
            Workload::Storage(storage) => Some(tokio::spawn(async move {
                let exit = storage.run(cancel, counters).await;
                let _ = tx.send(exit);
            })),
            Workload::Video(video) => Some(tokio::spawn(async move {
                let exit = video.run(cancel, counters).await;
                let _ = tx.send(exit);
            })),
        };

        Ok(DomainHandle {
            domain,
            exit: rx,
            finished: None,
            task,
        })
    }
}

fn spawn_thread<F>(domain: Domain, body: F, tx: oneshot::Sender<DomainExit>) -> Result<()>
where
    F: FnOnce() -> DomainExit + Send + 'static,
{
    std::thread::Builder::new()
        .name(format!("{}-stress", domain.label().to_lowercase()))
        .spawn(move || {
            let _ = tx.send(body());
        })
        .map_err(|e| stress_error!(io, format!("spawn {} thread", domain), e))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_incident_log_is_capped_but_errors_keep_counting() {
        let counters = DomainCounters::new(Domain::Memory, 3);
        for i in 0..10 {
            counters.record_incident("fill", i, format!("mismatch {}", i));
        }
        counters.record_errors("fill", 11, 5, "run of 5 bytes".to_string());

        let result = counters.finish(&DomainExit::Completed, false);
        assert_eq!(result.errors, 15);
        assert_eq!(result.incidents.len(), 3);
        assert!(!result.abnormal);
    }

    #[test]
    fn test_integrity_and_io_failures_share_the_count() {
        let counters = DomainCounters::new(Domain::Storage, 8);
        counters.record_incident("random-readback", 3, "read-back mismatch at offset 64".to_string());
        let io = stress_error!(
            io,
            "write",
            std::io::Error::new(std::io::ErrorKind::Other, "EIO")
        );
        counters.record_failure("io", 4, 1, &io);

        let result = counters.finish(&DomainExit::Completed, false);
        assert_eq!(result.errors, 2);
        assert_eq!(result.incidents[0].detail, "read-back mismatch at offset 64");
        assert!(result.incidents[1].detail.contains("write failed"));
        assert!(result.incidents[1].detail.contains("EIO"));
    }

    #[test]
    fn test_peak_bandwidth_keeps_maximum() {
        let counters = DomainCounters::new(Domain::Memory, 1);
        assert_eq!(counters.peak_bandwidth(), None);
        counters.record_bandwidth(1200.5);
        counters.record_bandwidth(800.0);
        counters.record_bandwidth(f64::NAN);
        assert_eq!(counters.peak_bandwidth(), Some(1200.5));
    }

    #[test]
    fn test_fault_fires_exactly_once() {
        let faults = FaultInjector::new();
        assert!(!faults.take_cpu(CpuKernel::Cipher));
        faults.arm_cpu(CpuKernel::Cipher);
        assert!(!faults.take_cpu(CpuKernel::Fft));
        assert!(faults.take_cpu(CpuKernel::Cipher));
        assert!(!faults.take_cpu(CpuKernel::Cipher));

        faults.arm_storage_readback();
        assert!(faults.take_storage_readback());
        assert!(!faults.take_storage_readback());
    }

    #[test]
    fn test_abnormal_exit_reported() {
        let counters = DomainCounters::new(Domain::Storage, 4);
        let result = counters.finish(&DomainExit::Abnormal("filesystem unusable".into()), true);
        assert!(result.abnormal);
        assert!(result.shutdown_timed_out);
        assert_eq!(result.abnormal_reason.as_deref(), Some("filesystem unusable"));
    }

    #[tokio::test]
    async fn test_dropped_sender_is_abnormal() {
        let (tx, rx) = oneshot::channel::<DomainExit>();
        drop(tx);
        let mut handle = DomainHandle {
            domain: Domain::Cpu,
            exit: rx,
            finished: None,
            task: None,
        };
        assert!(matches!(handle.wait().await, DomainExit::Abnormal(_)));
    }

    #[tokio::test]
    async fn test_panicking_thread_is_abnormal() {
        let (tx, rx) = oneshot::channel();
        spawn_thread(Domain::Cpu, || panic!("simulated worker crash"), tx).unwrap();
        let mut handle = DomainHandle {
            domain: Domain::Cpu,
            exit: rx,
            finished: None,
            task: None,
        };
        assert!(matches!(handle.wait().await, DomainExit::Abnormal(_)));
    }

    #[tokio::test]
    async fn test_try_finish_keeps_early_exit_for_wait() {
        let (tx, rx) = oneshot::channel();
        let mut handle = DomainHandle {
            domain: Domain::Storage,
            exit: rx,
            finished: None,
            task: None,
        };
        assert!(handle.try_finish().is_none());
        tx.send(DomainExit::Abnormal("filesystem unusable".into())).unwrap();
        assert!(handle.try_finish().is_some());
        assert_eq!(handle.wait().await, DomainExit::Abnormal("filesystem unusable".into()));
    }
}
