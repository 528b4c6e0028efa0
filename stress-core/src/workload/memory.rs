// stress-core/src/workload/memory.rs
// Memory stress: pattern and seeded write+verify passes over one large buffer

use std::hint::black_box;
use std::thread;
use std::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use super::{DomainCounters, DomainExit};
use crate::error::*;
use crate::stress_error;
use crate::system::read_meminfo;
use crate::tuning::MemoryTuning;

const MIB: u64 = 1024 * 1024;
const MIN_ALLOCATION: u64 = 16 * MIB;
const FILL_PATTERNS: [u8; 4] = [0x00, 0xFF, 0xAA, 0x55];
const RANDOM_BLOCK: usize = 64 * 1024;
/// Cancellation is checked between slices of this size; a multiple of `RANDOM_BLOCK`
const SLICE: usize = 4 * 1024 * 1024;

/// First mismatching byte of a pass plus the number of bad bytes
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Mismatch {
    pub count: u64,
    pub offset: usize,
    pub expected: u8,
    pub actual: u8,
}

impl Mismatch {
    fn merge(a: Option<Mismatch>, b: Option<Mismatch>) -> Option<Mismatch> {
        match (a, b) {
            (Some(x), Some(y)) => {
                let first = if x.offset <= y.offset { x } else { y };
                Some(Mismatch {
                    count: x.count + y.count,
                    ..first
                })
            }
            (x, None) => x,
            (None, y) => y,
        }
    }

    fn describe(&self) -> String {
        format!(
            "{} byte(s) differ, first at offset 0x{:x}: expected 0x{:02x}, got 0x{:02x}",
            self.count, self.offset, self.expected, self.actual
        )
    }
}

/// Compare `chunk` (starting at buffer offset `base`) against `expected`
pub fn verify(chunk: &[u8], base: usize, expected: impl Fn(usize) -> u8) -> Option<Mismatch> {
    let mut found: Option<Mismatch> = None;
    for (i, &actual) in chunk.iter().enumerate() {
        let want = expected(base + i);
        if actual != want {
            match found.as_mut() {
                Some(m) => m.count += 1,
                None => {
                    found = Some(Mismatch {
                        count: 1,
                        offset: base + i,
                        expected: want,
                        actual,
                    })
                }
            }
        }
    }
    found
}

/// Size the buffer: explicit bytes win, otherwise a fraction of available
/// memory that still leaves the configured headroom.
pub fn plan_allocation(tuning: &MemoryTuning, available: u64) -> Result<usize> {
    let bytes = match tuning.bytes {
        Some(explicit) => explicit,
        None => {
            let usable = available.saturating_sub(tuning.headroom_mb * MIB);
            ((available as f64 * tuning.fraction) as u64).min(usable)
        }
    };
    if bytes < MIN_ALLOCATION && tuning.bytes.is_none() {
        return Err(stress_error!(
            unavailable,
            "memory",
            format!("only {} MiB available after headroom", bytes / MIB)
        ));
    }
    if bytes == 0 {
        return Err(stress_error!(config, "memory.bytes", "must be greater than zero"));
    }
    usize::try_from(bytes).map_err(|_| stress_error!(config, "memory.bytes", "exceeds address space"))
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Pass {
    Sequential,
    Random,
    Fill(u8),
    WalkingOnes,
    Bandwidth,
}

impl Pass {
    fn name(&self) -> &'static str {
        match self {
            Pass::Sequential => "sequential",
            Pass::Random => "random",
            Pass::Fill(_) => "fill",
            Pass::WalkingOnes => "walking-ones",
            Pass::Bandwidth => "bandwidth",
        }
    }

    fn cycle() -> Vec<Pass> {
        let mut passes = vec![Pass::Sequential, Pass::Random];
        passes.extend(FILL_PATTERNS.iter().map(|p| Pass::Fill(*p)));
        passes.push(Pass::WalkingOnes);
        passes.push(Pass::Bandwidth);
        passes
    }
}

pub struct MemoryStress {
    tuning: MemoryTuning,
    buffer: Option<Vec<u8>>,
}

impl MemoryStress {
    pub fn new(tuning: MemoryTuning) -> Self {
        Self { tuning, buffer: None }
    }

    /// Allocates and commits the buffer
    pub fn prepare(&mut self) -> Result<()> {
        let available = match self.tuning.bytes {
            Some(_) => 0,
            None => read_meminfo("MemAvailable")?,
        };
        let size = plan_allocation(&self.tuning, available)?;
        let mut buffer = Vec::new();
        buffer
            .try_reserve_exact(size)
            .map_err(|e| stress_error!(unavailable, "memory", format!("allocating {} bytes: {}", size, e)))?;
        buffer.resize(size, 0);
        info!("🧠 Memory buffer allocated: {} MiB", size as u64 / MIB);
        self.buffer = Some(buffer);
        Ok(())
    }

    /// Blocking. Cycles through the passes until cancelled; every worker
    /// checks for cancellation after each slice it verifies.
    pub fn run(mut self, cancel: &CancellationToken, counters: &DomainCounters) -> DomainExit {
        if self.buffer.is_none() {
            if let Err(e) = self.prepare() {
                return DomainExit::Abnormal(e.to_string());
            }
        }
        let Some(mut buffer) = self.buffer.take() else {
            return DomainExit::Abnormal("memory buffer missing".to_string());
        };

        let workers = self.tuning.workers.max(1);
        let mut iteration = 0u64;
        'session: loop {
            for pass in Pass::cycle() {
                if cancel.is_cancelled() {
                    break 'session;
                }
                let outcome = match self.run_pass(pass, iteration, &mut buffer, workers, cancel) {
                    Ok(outcome) => outcome,
                    Err(reason) => return DomainExit::Abnormal(reason),
                };
                if let Some(mismatch) = outcome.mismatch {
                    counters.record_errors(pass.name(), iteration, mismatch.count, mismatch.describe());
                }
                if outcome.cancelled {
                    debug!("Memory {} pass cut short by cancellation", pass.name());
                    break 'session;
                }
                if let Some(mbps) = outcome.bandwidth_mbps {
                    counters.record_bandwidth(mbps);
                }
                counters.add_operations(1);
                counters.add_bytes(buffer.len() as u64);
            }
            iteration += 1;
        }

        debug!("Memory stress stopped after {} iterations", iteration);
        DomainExit::Completed
    }

    fn run_pass(
        &self,
        pass: Pass,
        iteration: u64,
        buffer: &mut [u8],
        workers: usize,
        cancel: &CancellationToken,
    ) -> std::result::Result<PassOutcome, String> {
        let seed = self.tuning.seed ^ iteration.rotate_left(32);
        let started = Instant::now();

        let sweep = match pass {
            Pass::Sequential => {
                let shift = iteration as usize;
                let expected = move |i: usize| ((i + shift) & 0xFF) as u8 ^ ((i >> 8) & 0xFF) as u8;
                for_each_chunk(buffer, workers, cancel, move |chunk, base| {
                    for (i, byte) in chunk.iter_mut().enumerate() {
                        *byte = expected(base + i);
                    }
                    verify(chunk, base, expected)
                })?
            }
            Pass::Random => for_each_chunk(buffer, workers, cancel, move |chunk, base| {
                for (n, block) in chunk.chunks_mut(RANDOM_BLOCK).enumerate() {
                    fastrand::Rng::with_seed(block_seed(seed, base + n * RANDOM_BLOCK)).fill(block);
                }
                verify_seeded(chunk, base, seed)
            })?,
            Pass::Fill(pattern) => for_each_chunk(buffer, workers, cancel, move |chunk, base| {
                chunk.fill(pattern);
                verify(chunk, base, |_| pattern)
            })?,
            Pass::WalkingOnes => {
                let shift = iteration as usize;
                let expected = move |i: usize| 1u8 << ((i + shift) % 8);
                for_each_chunk(buffer, workers, cancel, move |chunk, base| {
                    for (i, byte) in chunk.iter_mut().enumerate() {
                        *byte = expected(base + i);
                    }
                    verify(chunk, base, expected)
                })?
            }
            Pass::Bandwidth => {
                let pattern = (iteration & 0xFF) as u8;
                let sweep = for_each_chunk(buffer, workers, cancel, move |chunk, _| {
                    chunk.fill(pattern);
                    let sum = chunk.iter().fold(0u64, |acc, b| acc.wrapping_add(*b as u64));
                    black_box(sum);
                    None
                })?;
                let secs = started.elapsed().as_secs_f64();
                let mbps = (buffer.len() as f64 * 2.0) / (1024.0 * 1024.0) / secs.max(1e-9);
                return Ok(PassOutcome {
                    mismatch: None,
                    bandwidth_mbps: (!sweep.cancelled).then_some(mbps),
                    cancelled: sweep.cancelled,
                });
            }
        };

        Ok(PassOutcome {
            mismatch: sweep.mismatch,
            bandwidth_mbps: None,
            cancelled: sweep.cancelled,
        })
    }
}

#[derive(Debug, Default)]
struct PassOutcome {
    mismatch: Option<Mismatch>,
    bandwidth_mbps: Option<f64>,
    cancelled: bool,
}

/// Mismatches found by one sweep; `cancelled` when any worker stopped early
#[derive(Debug, Default, PartialEq)]
struct Sweep {
    mismatch: Option<Mismatch>,
    cancelled: bool,
}

/// Split `buffer` into one disjoint chunk per worker and run `work` on each
/// `SLICE` of it in a scoped thread. Workers stop at the next slice boundary
/// once `cancel` fires. A panicking worker is reported as `Err`.
fn for_each_chunk<F>(
    buffer: &mut [u8],
    workers: usize,
    cancel: &CancellationToken,
    work: F,
) -> std::result::Result<Sweep, String>
where
    F: Fn(&mut [u8], usize) -> Option<Mismatch> + Sync,
{
    let chunk_len = buffer.len().div_ceil(workers.max(1)).max(1);
    let work = &work;
    thread::scope(|scope| {
        let handles: Vec<_> = buffer
            .chunks_mut(chunk_len)
            .enumerate()
            .map(|(idx, chunk)| {
                scope.spawn(move || {
                    let base = idx * chunk_len;
                    let mut sweep = Sweep::default();
                    for (n, slice) in chunk.chunks_mut(SLICE).enumerate() {
                        if cancel.is_cancelled() {
                            sweep.cancelled = true;
                            break;
                        }
                        sweep.mismatch = Mismatch::merge(sweep.mismatch, work(slice, base + n * SLICE));
                    }
                    sweep
                })
            })
            .collect();

        let joined: Vec<_> = handles.into_iter().map(|handle| handle.join()).collect();
        joined.into_iter().try_fold(Sweep::default(), |acc, result| {
            result
                .map(|found| Sweep {
                    mismatch: Mismatch::merge(acc.mismatch, found.mismatch),
                    cancelled: acc.cancelled || found.cancelled,
                })
                .map_err(|_| "memory worker panicked".to_string())
        })
    })
}

fn block_seed(seed: u64, offset: usize) -> u64 {
    seed ^ (offset as u64).wrapping_mul(0x9E37_79B9_7F4A_7C15)
}

/// Regenerate the seeded stream block by block and compare
fn verify_seeded(chunk: &[u8], base: usize, seed: u64) -> Option<Mismatch> {
    let mut reference = vec![0u8; RANDOM_BLOCK];
    let mut found = None;
    for (n, block) in chunk.chunks(RANDOM_BLOCK).enumerate() {
        let block_base = base + n * RANDOM_BLOCK;
        let expected = &mut reference[..block.len()];
        fastrand::Rng::with_seed(block_seed(seed, block_base)).fill(expected);
        let expected = &*expected;
        found = Mismatch::merge(found, verify(block, block_base, |i| expected[i - block_base]));
    }
    found
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::Domain;
    use std::time::Duration;

    fn small() -> MemoryTuning {
        MemoryTuning {
            bytes: Some(MIB),
            workers: 3,
            ..MemoryTuning::default()
        }
    }

    #[test]
    fn test_plan_allocation_leaves_headroom() {
        let tuning = MemoryTuning::default();
        // 8 GiB available: half of it fits inside the headroom limit
        assert_eq!(plan_allocation(&tuning, 8192 * MIB).unwrap() as u64, 4096 * MIB);
        // 768 MiB available: headroom caps it at 256 MiB
        assert_eq!(plan_allocation(&tuning, 768 * MIB).unwrap() as u64, 256 * MIB);
        // Nothing left after headroom
        assert!(matches!(
            plan_allocation(&tuning, 512 * MIB),
            Err(StressError::CapabilityUnavailable { .. })
        ));
        assert_eq!(plan_allocation(&small(), 0).unwrap() as u64, MIB);
    }

    #[test]
    fn test_verify_counts_every_bad_byte() {
        let mut data = vec![0xAAu8; 4096];
        data[100] = 0xAB;
        data[200] = 0x00;
        data[300] = 0xFF;
        let mismatch = verify(&data, 8192, |_| 0xAA).unwrap();
        assert_eq!(mismatch.count, 3);
        assert_eq!(mismatch.offset, 8192 + 100);
        assert_eq!(mismatch.expected, 0xAA);
        assert_eq!(mismatch.actual, 0xAB);
    }

    #[test]
    fn test_seeded_pass_is_reproducible() {
        let mut data = vec![0u8; RANDOM_BLOCK * 2 + 17];
        for (n, block) in data.chunks_mut(RANDOM_BLOCK).enumerate() {
            fastrand::Rng::with_seed(block_seed(42, n * RANDOM_BLOCK)).fill(block);
        }
        assert_eq!(verify_seeded(&data, 0, 42), None);

        data[RANDOM_BLOCK + 5] ^= 0x10;
        let mismatch = verify_seeded(&data, 0, 42).unwrap();
        assert_eq!(mismatch.count, 1);
        assert_eq!(mismatch.offset, RANDOM_BLOCK + 5);
    }

    #[test]
    fn test_chunks_cover_buffer_and_merge_first_offset() {
        let mut data = vec![0u8; 1000];
        let sweep = for_each_chunk(&mut data, 4, &CancellationToken::new(), |chunk, base| {
            chunk.fill(1);
            if base >= 500 {
                Some(Mismatch { count: 2, offset: base, expected: 1, actual: 0 })
            } else {
                None
            }
        })
        .unwrap();
        assert!(!sweep.cancelled);
        assert!(data.iter().all(|b| *b == 1));
        let result = sweep.mismatch.unwrap();
        assert_eq!(result.offset, 500);
        assert_eq!(result.count, 4);
    }

    #[test]
    fn test_workers_stop_at_slice_boundary_on_cancel() {
        let mut data = vec![0u8; SLICE * 4 + 1];
        let cancel = CancellationToken::new();
        let slices = std::sync::atomic::AtomicUsize::new(0);
        let sweep = for_each_chunk(&mut data, 1, &cancel, |slice, _| {
            slices.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
            slice.fill(0x55);
            cancel.cancel();
            None
        })
        .unwrap();

        assert!(sweep.cancelled);
        assert_eq!(slices.load(std::sync::atomic::Ordering::SeqCst), 1);
        assert!(data[..SLICE].iter().all(|b| *b == 0x55));
        assert!(data[SLICE..].iter().all(|b| *b == 0));
    }

    #[test]
    fn test_clean_run_has_no_errors() {
        let mut memory = MemoryStress::new(small());
        memory.prepare().unwrap();
        let counters = DomainCounters::new(Domain::Memory, 8);
        let cancel = CancellationToken::new();

        let stopper = cancel.clone();
        let timer = thread::spawn(move || {
            thread::sleep(Duration::from_millis(200));
            stopper.cancel();
        });
        let exit = memory.run(&cancel, &counters);
        timer.join().unwrap();

        assert_eq!(exit, DomainExit::Completed);
        assert_eq!(counters.errors(), 0);
        assert!(counters.operations() > 0);
        assert!(counters.peak_bandwidth().is_some());
    }
}
