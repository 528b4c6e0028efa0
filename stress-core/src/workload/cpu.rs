// stress-core/src/workload/cpu.rs
// CPU stress: self-checking FFT, matrix, prime sieve and AES kernels

use aes::cipher::generic_array::GenericArray;
use aes::cipher::{BlockDecrypt, BlockEncrypt, KeyInit};
use aes::{Aes256, Block};
use serde::{Deserialize, Serialize};
use std::f64::consts::PI;
use std::sync::Arc;
use std::thread;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use super::{DomainCounters, DomainExit, FaultInjector};
use crate::error::*;
use crate::stress_error;
use crate::tuning::CpuTuning;

/// Prime counts below each supported sieve bound
pub const KNOWN_PRIME_COUNTS: [(usize, usize); 4] =
    [(1_000, 168), (10_000, 1_229), (100_000, 9_592), (1_000_000, 78_498)];

pub fn known_prime_count(limit: usize) -> Option<usize> {
    KNOWN_PRIME_COUNTS
        .iter()
        .find(|(bound, _)| *bound == limit)
        .map(|(_, count)| *count)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CpuKernel {
    Fft,
    Matrix,
    Primes,
    Cipher,
}

impl CpuKernel {
    pub const ALL: [CpuKernel; 4] = [CpuKernel::Fft, CpuKernel::Matrix, CpuKernel::Primes, CpuKernel::Cipher];

    pub fn name(&self) -> &'static str {
        match self {
            CpuKernel::Fft => "fft",
            CpuKernel::Matrix => "matrix",
            CpuKernel::Primes => "primes",
            CpuKernel::Cipher => "cipher",
        }
    }

    pub(crate) fn index(&self) -> u8 {
        match self {
            CpuKernel::Fft => 0,
            CpuKernel::Matrix => 1,
            CpuKernel::Primes => 2,
            CpuKernel::Cipher => 3,
        }
    }
}

pub struct CpuStress {
    threads: usize,
    tuning: CpuTuning,
    faults: Arc<FaultInjector>,
}

impl CpuStress {
    pub fn new(threads: usize, tuning: CpuTuning, faults: Arc<FaultInjector>) -> Self {
        Self {
            threads: threads.max(1),
            tuning,
            faults,
        }
    }

    pub fn prepare(&self) -> Result<()> {
        if !self.tuning.fft_size.is_power_of_two() || self.tuning.fft_size < 2 {
            return Err(stress_error!(config, "cpu.fft_size", "must be a power of two"));
        }
        if known_prime_count(self.tuning.prime_limit).is_none() {
            return Err(stress_error!(
                config,
                "cpu.prime_limit",
                format!("{} has no known prime count", self.tuning.prime_limit)
            ));
        }
        if self.tuning.matrix_size == 0 || self.tuning.cipher_blocks == 0 {
            return Err(stress_error!(config, "cpu", "matrix_size and cipher_blocks must be non-zero"));
        }
        Ok(())
    }

    /// Blocking. Fans out one scoped thread per worker and returns when all stop.
    pub fn run(&self, cancel: &CancellationToken, counters: &DomainCounters) -> DomainExit {
        info!("CPU stress running on {} workers", self.threads);

        let panicked = thread::scope(|scope| {
            let workers: Vec<_> = (0..self.threads)
                .map(|id| {
                    scope.spawn(move || {
                        let mut worker = CpuWorker::new(id, &self.tuning);
                        worker.run(cancel, counters, &self.faults);
                    })
                })
                .collect();
            workers.into_iter().filter_map(|w| w.join().err()).count()
        });

        if panicked > 0 {
            return DomainExit::Abnormal(format!("{} CPU worker(s) panicked", panicked));
        }
        DomainExit::Completed
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
struct Complex {
    re: f64,
    im: f64,
}

/// Per-thread inputs and references, built once
struct CpuWorker {
    id: usize,
    tuning: CpuTuning,
    signal: Vec<Complex>,
    lhs: Vec<f64>,
    rhs: Vec<f64>,
    reference: Vec<i64>,
    plaintext: Vec<Block>,
    cipher: Aes256,
    expected_primes: usize,
}

impl CpuWorker {
    fn new(id: usize, tuning: &CpuTuning) -> Self {
        let mut rng = fastrand::Rng::with_seed(0xC0FFEE ^ id as u64);
        let n = tuning.matrix_size;

        let signal = (0..tuning.fft_size)
            .map(|_| Complex {
                re: rng.f64() * 2.0 - 1.0,
                im: rng.f64() * 2.0 - 1.0,
            })
            .collect();

        let lhs_int: Vec<i64> = (0..n * n).map(|_| rng.i64(-8..=8)).collect();
        let rhs_int: Vec<i64> = (0..n * n).map(|_| rng.i64(-8..=8)).collect();
        let reference = integer_matmul(&lhs_int, &rhs_int, n);

        let mut key = [0u8; 32];
        rng.fill(&mut key);
        let plaintext = (0..tuning.cipher_blocks)
            .map(|_| {
                let mut block = [0u8; 16];
                rng.fill(&mut block);
                Block::clone_from_slice(&block)
            })
            .collect();

        debug!("CPU worker {} initialized", id);

        Self {
            id,
            tuning: tuning.clone(),
            signal,
            lhs: lhs_int.iter().map(|&v| v as f64).collect(),
            rhs: rhs_int.iter().map(|&v| v as f64).collect(),
            reference,
            plaintext,
            cipher: Aes256::new(GenericArray::from_slice(&key)),
            expected_primes: known_prime_count(tuning.prime_limit).unwrap_or(0),
        }
    }

    fn run(&mut self, cancel: &CancellationToken, counters: &DomainCounters, faults: &FaultInjector) {
        let mut iteration = 0u64;
        'session: loop {
            for kernel in CpuKernel::ALL {
                if cancel.is_cancelled() {
                    break 'session;
                }
                let inject = faults.take_cpu(kernel);
                if let Err(detail) = self.check(kernel, inject) {
                    counters.record_incident(kernel.name(), iteration, format!("worker {}: {}", self.id, detail));
                }
                counters.add_operations(1);
                counters.add_bytes(self.bytes_touched(kernel));
            }
            iteration += 1;
        }
        debug!("CPU worker {} stopped after {} iterations", self.id, iteration);
    }

    /// Runs one kernel; `Err` carries the deviation. `inject` corrupts the
    /// result before it is compared.
    fn check(&self, kernel: CpuKernel, inject: bool) -> std::result::Result<(), String> {
        match kernel {
            CpuKernel::Fft => {
                let mut data = self.signal.clone();
                fft(&mut data, false);
                fft(&mut data, true);
                if inject {
                    data[0].re += 1.0;
                }
                let deviation = relative_deviation(&self.signal, &data);
                if deviation > self.tuning.fft_epsilon {
                    return Err(format!(
                        "round-trip deviation {:.3e} exceeds {:.1e}",
                        deviation, self.tuning.fft_epsilon
                    ));
                }
            }
            CpuKernel::Matrix => {
                let mut product = float_matmul(&self.lhs, &self.rhs, self.tuning.matrix_size);
                if inject {
                    product[0] += 1.0;
                }
                let scale = self.reference.iter().map(|v| v.abs()).max().unwrap_or(0).max(1) as f64;
                let deviation = product
                    .iter()
                    .zip(&self.reference)
                    .map(|(got, want)| (got - *want as f64).abs())
                    .fold(0.0, f64::max)
                    / scale;
                if deviation > self.tuning.matrix_epsilon {
                    return Err(format!("product deviation {:.3e} from exact reference", deviation));
                }
            }
            CpuKernel::Primes => {
                let mut count = count_primes(self.tuning.prime_limit);
                if inject {
                    count += 1;
                }
                if count != self.expected_primes {
                    return Err(format!(
                        "counted {} primes below {}, expected {}",
                        count, self.tuning.prime_limit, self.expected_primes
                    ));
                }
            }
            CpuKernel::Cipher => {
                let mut blocks = self.plaintext.clone();
                self.cipher.encrypt_blocks(&mut blocks);
                self.cipher.decrypt_blocks(&mut blocks);
                if inject {
                    blocks[0][0] ^= 0x01;
                }
                let differing = blocks.iter().zip(&self.plaintext).filter(|(a, b)| a != b).count();
                if differing > 0 {
                    return Err(format!("{} of {} blocks differ after decrypt", differing, blocks.len()));
                }
            }
        }
        Ok(())
    }

    fn bytes_touched(&self, kernel: CpuKernel) -> u64 {
        let n = self.tuning.matrix_size as u64;
        match kernel {
            CpuKernel::Fft => self.tuning.fft_size as u64 * 16,
            CpuKernel::Matrix => 3 * n * n * 8,
            CpuKernel::Primes => self.tuning.prime_limit as u64,
            CpuKernel::Cipher => self.tuning.cipher_blocks as u64 * 32,
        }
    }
}

/// In-place iterative radix-2 FFT. The inverse includes the 1/n scaling.
fn fft(data: &mut [Complex], inverse: bool) {
    let n = data.len();
    if n < 2 {
        return;
    }

    let mut j = 0;
    for i in 1..n {
        let mut bit = n >> 1;
        while j & bit != 0 {
            j ^= bit;
            bit >>= 1;
        }
        j |= bit;
        if i < j {
            data.swap(i, j);
        }
    }

    let sign = if inverse { 1.0 } else { -1.0 };
    let mut len = 2;
    while len <= n {
        let angle = sign * 2.0 * PI / len as f64;
        let (w_im, w_re) = angle.sin_cos();
        for start in (0..n).step_by(len) {
            let (mut cur_re, mut cur_im) = (1.0, 0.0);
            for k in 0..len / 2 {
                let a = data[start + k];
                let b = data[start + k + len / 2];
                let t_re = b.re * cur_re - b.im * cur_im;
                let t_im = b.re * cur_im + b.im * cur_re;
                data[start + k] = Complex { re: a.re + t_re, im: a.im + t_im };
                data[start + k + len / 2] = Complex { re: a.re - t_re, im: a.im - t_im };
                let next_re = cur_re * w_re - cur_im * w_im;
                cur_im = cur_re * w_im + cur_im * w_re;
                cur_re = next_re;
            }
        }
        len <<= 1;
    }

    if inverse {
        let scale = 1.0 / n as f64;
        for value in data.iter_mut() {
            value.re *= scale;
            value.im *= scale;
        }
    }
}

/// max |x' - x| / max |x|
fn relative_deviation(expected: &[Complex], actual: &[Complex]) -> f64 {
    let norm = expected
        .iter()
        .map(|c| c.re.abs().max(c.im.abs()))
        .fold(0.0, f64::max);
    let diff = expected
        .iter()
        .zip(actual)
        .map(|(x, y)| (x.re - y.re).abs().max((x.im - y.im).abs()))
        .fold(0.0, f64::max);
    if norm == 0.0 {
        diff
    } else {
        diff / norm
    }
}

fn integer_matmul(a: &[i64], b: &[i64], n: usize) -> Vec<i64> {
    let mut c = vec![0i64; n * n];
    for i in 0..n {
        for k in 0..n {
            let aik = a[i * n + k];
            for j in 0..n {
                c[i * n + j] += aik * b[k * n + j];
            }
        }
    }
    c
}

fn float_matmul(a: &[f64], b: &[f64], n: usize) -> Vec<f64> {
    let mut c = vec![0.0f64; n * n];
    for i in 0..n {
        for k in 0..n {
            let aik = a[i * n + k];
            let row = &b[k * n..(k + 1) * n];
            for (out, bkj) in c[i * n..(i + 1) * n].iter_mut().zip(row) {
                *out += aik * bkj;
            }
        }
    }
    c
}

/// Primes `<= limit`
fn count_primes(limit: usize) -> usize {
    if limit < 2 {
        return 0;
    }
    let mut composite = vec![false; limit + 1];
    let mut count = 0;
    for i in 2..=limit {
        if composite[i] {
            continue;
        }
        count += 1;
        let mut multiple = i * i;
        while multiple <= limit {
            composite[multiple] = true;
            multiple += i;
        }
    }
    count
}
