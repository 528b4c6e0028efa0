// stress-core/src/tuning.rs
// Tunable thresholds and workload sizes

use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Every numeric tolerance and workload size the engine uses.
///
/// Loaded from an optional TOML file by the agent; any field left out keeps
/// its default. Defaults are deliberately conservative.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct StressTuning {
    /// How long generators get to finish their current pass after cancellation
    pub grace_period_secs: u64,
    /// Cadence of live snapshots for the presentation layer
    pub snapshot_interval_ms: u64,
    /// Per-domain cap on stored incident records
    pub max_incidents: usize,
    pub cpu: CpuTuning,
    pub memory: MemoryTuning,
    pub storage: StorageTuning,
    pub video: VideoTuning,
    pub kernel_log: KernelLogTuning,
    pub display: DisplayThresholds,
}

impl Default for StressTuning {
    fn default() -> Self {
        Self {
            grace_period_secs: 10,
            snapshot_interval_ms: 1000,
            max_incidents: 64,
            cpu: CpuTuning::default(),
            memory: MemoryTuning::default(),
            storage: StorageTuning::default(),
            video: VideoTuning::default(),
            kernel_log: KernelLogTuning::default(),
            display: DisplayThresholds::default(),
        }
    }
}

impl StressTuning {
    pub fn grace_period(&self) -> Duration {
        Duration::from_secs(self.grace_period_secs)
    }

    pub fn snapshot_interval(&self) -> Duration {
        Duration::from_millis(self.snapshot_interval_ms.max(50))
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct CpuTuning {
    /// FFT length, must be a power of two
    pub fft_size: usize,
    /// Normwise relative tolerance for the FFT round-trip
    pub fft_epsilon: f64,
    /// Square matrix dimension
    pub matrix_size: usize,
    /// Relative tolerance for the matrix check
    pub matrix_epsilon: f64,
    /// Sieve bound, one of 1_000, 10_000, 100_000, 1_000_000
    pub prime_limit: usize,
    /// AES blocks per round-trip
    pub cipher_blocks: usize,
}

impl Default for CpuTuning {
    fn default() -> Self {
        Self {
            fft_size: 4096,
            fft_epsilon: 1e-9,
            matrix_size: 128,
            matrix_epsilon: 1e-12,
            prime_limit: 100_000,
            cipher_blocks: 4096,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct MemoryTuning {
    /// Share of MemAvailable to allocate
    pub fraction: f64,
    /// Memory always left to the rest of the system
    pub headroom_mb: u64,
    /// Explicit allocation, overrides `fraction`
    pub bytes: Option<u64>,
    /// Scoped worker threads sharing the buffer
    pub workers: usize,
    /// Seed of the reproducible pseudorandom pass
    pub seed: u64,
}

impl Default for MemoryTuning {
    fn default() -> Self {
        Self {
            fraction: 0.5,
            headroom_mb: 512,
            bytes: None,
            workers: 2,
            seed: 0x5EED_CAFE,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct StorageTuning {
    pub file_mb: u64,
    pub random_block_bytes: usize,
    pub random_ops_per_pass: usize,
    pub sequential_block_bytes: usize,
    /// Consecutive I/O failures after which the filesystem counts as unusable
    pub io_failure_limit: u32,
}

impl Default for StorageTuning {
    fn default() -> Self {
        Self {
            file_mb: 256,
            random_block_bytes: 4096,
            random_ops_per_pass: 1024,
            sequential_block_bytes: 128 * 1024,
            io_failure_limit: 8,
        }
    }
}

impl StorageTuning {
    pub fn file_bytes(&self) -> u64 {
        self.file_mb * 1024 * 1024
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct VideoTuning {
    pub ffmpeg: String,
    /// Encoders tried in order
    pub encoders: Vec<String>,
    pub width: u32,
    pub height: u32,
    pub seconds_per_cycle: u32,
    /// Consecutive spawn failures treated as abnormal termination
    pub spawn_failure_limit: u32,
}

impl Default for VideoTuning {
    fn default() -> Self {
        Self {
            ffmpeg: "ffmpeg".to_string(),
            encoders: vec!["hevc_v4l2m2m".to_string(), "h264_v4l2m2m".to_string()],
            width: 1280,
            height: 720,
            seconds_per_cycle: 10,
            spawn_failure_limit: 3,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct KernelLogTuning {
    /// Case-insensitive patterns that make a kernel line an error
    pub error_patterns: Vec<String>,
    /// Subset classified as storage I/O errors
    pub io_patterns: Vec<String>,
}

impl Default for KernelLogTuning {
    fn default() -> Self {
        Self {
            error_patterns: [
                r"i/o error",
                r"blk_update_request",
                r"nvme.*(error|timeout|reset)",
                r"pcieport.*aer",
                r"mmc\d*:.*error",
                r"\bata\d+.*error",
                r"machine check|\bmce\b",
                r"hardware error",
                r"kernel panic",
                r"\boops\b",
                r"under-?voltage",
            ]
            .iter()
            .map(|p| p.to_string())
            .collect(),
            io_patterns: [
                r"i/o error",
                r"blk_update_request",
                r"nvme.*(error|timeout|reset)",
                r"mmc\d*:.*error",
                r"\bata\d+.*error",
            ]
            .iter()
            .map(|p| p.to_string())
            .collect(),
        }
    }
}

/// Temperature bands used for live health colouring only
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct DisplayThresholds {
    pub warm_temp_c: f32,
    pub warning_temp_c: f32,
    pub critical_temp_c: f32,
}

impl Default for DisplayThresholds {
    fn default() -> Self {
        Self {
            warm_temp_c: 70.0,
            warning_temp_c: 80.0,
            critical_temp_c: 85.0,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_partial_override_keeps_defaults() {
        let tuning: StressTuning = serde_json::from_str(
            r#"{ "grace_period_secs": 3, "cpu": { "fft_size": 1024 } }"#,
        )
        .unwrap();

        assert_eq!(tuning.grace_period(), Duration::from_secs(3));
        assert_eq!(tuning.cpu.fft_size, 1024);
        assert_eq!(tuning.cpu.prime_limit, 100_000);
        assert_eq!(tuning.memory, MemoryTuning::default());
    }

    #[test]
    fn test_snapshot_interval_floor() {
        let tuning = StressTuning {
            snapshot_interval_ms: 1,
            ..StressTuning::default()
        };
        assert_eq!(tuning.snapshot_interval(), Duration::from_millis(50));
    }

    #[test]
    fn test_io_patterns_are_error_patterns() {
        let log = KernelLogTuning::default();
        for pattern in &log.io_patterns {
            assert!(log.error_patterns.contains(pattern), "{pattern} not in error set");
        }
    }
}
