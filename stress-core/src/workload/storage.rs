// stress-core/src/workload/storage.rs
// Storage stress: random and sequential I/O on a scratch file, every write read back

use std::io::SeekFrom;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::fs::{self, File, OpenOptions};
use tokio::io::{AsyncReadExt, AsyncSeekExt, AsyncWriteExt};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};
use uuid::Uuid;

use super::{DomainCounters, DomainExit, FaultInjector};
use crate::error::*;
use crate::stress_error;
use crate::tuning::StorageTuning;

const BOOT_MOUNTS: [&str; 3] = ["/", "/boot", "/boot/firmware"];

/// Pick the scratch file location.
///
/// Explicit override first. If `/` lives on NVMe, a cache directory under
/// `$HOME` (or `/var/tmp`). Then any separate NVMe mount. `/var/tmp` last;
/// `/tmp` is skipped because it is often RAM-backed.
pub fn resolve_scratch_path(
    override_path: Option<&Path>,
    home: Option<&Path>,
    mounts: &str,
    file_name: &str,
) -> PathBuf {
    if let Some(path) = override_path {
        return if path.is_dir() {
            path.join(file_name)
        } else {
            path.to_path_buf()
        };
    }

    let entries: Vec<(&str, &str)> = mounts
        .lines()
        .filter_map(|line| {
            let mut fields = line.split_whitespace();
            Some((fields.next()?, fields.next()?))
        })
        .collect();

    let root_on_nvme = entries
        .iter()
        .any(|(device, mount)| *mount == "/" && device.contains("nvme"));
    if root_on_nvme {
        return match home {
            Some(home) => home.join(".cache").join("oc-stress").join(file_name),
            None => Path::new("/var/tmp").join(file_name),
        };
    }

    entries
        .iter()
        .find(|(device, mount)| device.contains("nvme") && !BOOT_MOUNTS.contains(mount))
        .map(|(_, mount)| Path::new(mount).join(file_name))
        .unwrap_or_else(|| Path::new("/var/tmp").join(file_name))
}

/// Scratch file removed when dropped, on every exit path
#[derive(Debug)]
pub struct ScratchFile {
    path: PathBuf,
}

impl ScratchFile {
    pub async fn create(path: PathBuf, size: u64) -> Result<Self> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)
                .await
                .map_err(|e| stress_error!(io, format!("create {}", parent.display()), e))?;
        }
        let file = OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(&path)
            .await
            .map_err(|e| stress_error!(io, format!("create {}", path.display()), e))?;
        let scratch = ScratchFile { path };
        file.set_len(size)
            .await
            .map_err(|e| stress_error!(io, format!("size {}", scratch.path.display()), e))?;
        Ok(scratch)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for ScratchFile {
    fn drop(&mut self) {
        match std::fs::remove_file(&self.path) {
            Ok(()) => debug!("Removed scratch file {}", self.path.display()),
            Err(e) => warn!("Failed to remove scratch file {}: {}", self.path.display(), e),
        }
    }
}

pub struct StorageStress {
    tuning: StorageTuning,
    override_path: Option<PathBuf>,
    faults: Arc<FaultInjector>,
    scratch: Option<ScratchFile>,
}

impl StorageStress {
    pub fn new(tuning: StorageTuning, override_path: Option<PathBuf>, faults: Arc<FaultInjector>) -> Self {
        Self {
            tuning,
            override_path,
            faults,
            scratch: None,
        }
    }

    pub fn scratch_path(&self) -> Option<&Path> {
        self.scratch.as_ref().map(ScratchFile::path)
    }

    #[instrument(skip(self))]
    pub async fn prepare(&mut self) -> Result<()> {
        let size = self.tuning.file_bytes();
        let largest = self.tuning.random_block_bytes.max(self.tuning.sequential_block_bytes) as u64;
        if self.tuning.random_block_bytes == 0 || largest == 0 || size < largest {
            return Err(stress_error!(
                config,
                "storage",
                "block sizes must be non-zero and fit inside the scratch file"
            ));
        }

        let mounts = fs::read_to_string("/proc/mounts").await.unwrap_or_default();
        let home = std::env::var_os("HOME").map(PathBuf::from);
        let name = format!(".oc-stress-{}.tmp", Uuid::new_v4().simple());
        let path = resolve_scratch_path(self.override_path.as_deref(), home.as_deref(), &mounts, &name);

        let scratch = ScratchFile::create(path, size).await?;
        info!("💾 Storage scratch file: {} ({} MiB)", scratch.path().display(), self.tuning.file_mb);
        self.scratch = Some(scratch);
        Ok(())
    }

    /// Alternates random and sequential passes until cancelled
    pub async fn run(mut self, cancel: CancellationToken, counters: Arc<DomainCounters>) -> DomainExit {
        if self.scratch.is_none() {
            if let Err(e) = self.prepare().await {
                return DomainExit::Abnormal(e.to_string());
            }
        }
        let Some(scratch) = self.scratch.take() else {
            return DomainExit::Abnormal("scratch file missing".to_string());
        };

        let file = match OpenOptions::new().read(true).write(true).open(scratch.path()).await {
            Ok(file) => file,
            Err(e) => return DomainExit::Abnormal(format!("cannot open scratch file: {}", e)),
        };

        let mut io = BlockIo {
            file,
            rng: fastrand::Rng::with_seed(0x5107_A6E),
            write_buf: vec![0u8; self.tuning.sequential_block_bytes.max(self.tuning.random_block_bytes)],
            read_buf: vec![0u8; self.tuning.sequential_block_bytes.max(self.tuning.random_block_bytes)],
            consecutive_failures: 0,
            failure_limit: self.tuning.io_failure_limit.max(1),
            faults: Arc::clone(&self.faults),
        };

        let size = self.tuning.file_bytes();
        let random_len = self.tuning.random_block_bytes;
        let random_slots = size / random_len as u64;
        let seq_len = self.tuning.sequential_block_bytes;

        let mut iteration = 0u64;
        let exit = 'session: loop {
            for _ in 0..self.tuning.random_ops_per_pass {
                if cancel.is_cancelled() {
                    break 'session DomainExit::Completed;
                }
                let offset = io.rng.u64(0..random_slots) * random_len as u64;
                if let Err(reason) = io.exercise(offset, random_len, "random-readback", iteration, &counters).await {
                    break 'session DomainExit::Abnormal(reason);
                }
            }

            let mut offset = 0u64;
            while offset + seq_len as u64 <= size {
                if cancel.is_cancelled() {
                    break 'session DomainExit::Completed;
                }
                if let Err(reason) = io.exercise(offset, seq_len, "sequential-readback", iteration, &counters).await {
                    break 'session DomainExit::Abnormal(reason);
                }
                offset += seq_len as u64;
            }

            if let Err(e) = io.file.sync_data().await {
                if let Err(reason) = io.failed("sync", iteration, e, &counters) {
                    break 'session DomainExit::Abnormal(reason);
                }
            }
            iteration += 1;
        };

        debug!("Storage stress stopped after {} passes", iteration);
        drop(io);
        drop(scratch);
        exit
    }
}

/// Write-then-verify block I/O against the open scratch file
struct BlockIo {
    file: File,
    rng: fastrand::Rng,
    write_buf: Vec<u8>,
    read_buf: Vec<u8>,
    consecutive_failures: u32,
    failure_limit: u32,
    faults: Arc<FaultInjector>,
}

impl BlockIo {
    /// Write a fresh random block at `offset` and read it back before the
    /// buffer is reused. `Err` means the filesystem became unusable.
    async fn exercise(
        &mut self,
        offset: u64,
        len: usize,
        phase: &str,
        iteration: u64,
        counters: &DomainCounters,
    ) -> std::result::Result<(), String> {
        self.rng.fill(&mut self.write_buf[..len]);

        if let Err(e) = self.write_block(offset, len).await {
            return self.failed("write", iteration, e, counters);
        }
        if let Err(e) = self.read_block(offset, len).await {
            return self.failed("read", iteration, e, counters);
        }
        self.consecutive_failures = 0;

        if self.faults.take_storage_readback() {
            self.read_buf[0] ^= 0xFF;
        }

        let written = &self.write_buf[..len];
        let read = &self.read_buf[..len];
        if written != read {
            let first = written.iter().zip(read).position(|(w, r)| w != r).unwrap_or(0);
            counters.record_incident(
                phase,
                iteration,
                format!(
                    "read-back mismatch at offset {}: expected 0x{:02x}, got 0x{:02x}",
                    offset + first as u64,
                    written[first],
                    read[first]
                ),
            );
        }

        counters.add_operations(1);
        counters.add_bytes(2 * len as u64);
        Ok(())
    }

    async fn write_block(&mut self, offset: u64, len: usize) -> std::io::Result<()> {
        self.file.seek(SeekFrom::Start(offset)).await?;
        self.file.write_all(&self.write_buf[..len]).await?;
        self.file.flush().await
    }

    async fn read_block(&mut self, offset: u64, len: usize) -> std::io::Result<()> {
        self.file.seek(SeekFrom::Start(offset)).await?;
        self.file.read_exact(&mut self.read_buf[..len]).await?;
        Ok(())
    }

    /// Count an I/O failure; too many in a row make the domain abnormal
    fn failed(
        &mut self,
        operation: &str,
        iteration: u64,
        err: std::io::Error,
        counters: &DomainCounters,
    ) -> std::result::Result<(), String> {
        self.consecutive_failures += 1;
        counters.record_failure("io", iteration, 1, &stress_error!(io, operation, err));
        if self.consecutive_failures >= self.failure_limit {
            return Err(format!(
                "filesystem unusable after {} consecutive I/O failures",
                self.consecutive_failures
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::Domain;
    use std::time::Duration;

    const MOUNTS_NVME_ROOT: &str = "/dev/nvme0n1p2 / ext4 rw,noatime 0 0
/dev/nvme0n1p1 /boot/firmware vfat rw 0 0
tmpfs /tmp tmpfs rw 0 0
";

    const MOUNTS_SD_ROOT_NVME_DATA: &str = "/dev/mmcblk0p2 / ext4 rw,noatime 0 0
/dev/mmcblk0p1 /boot/firmware vfat rw 0 0
/dev/nvme0n1p1 /mnt/data ext4 rw 0 0
";

    fn small() -> StorageTuning {
        StorageTuning {
            file_mb: 1,
            random_block_bytes: 4096,
            random_ops_per_pass: 16,
            sequential_block_bytes: 64 * 1024,
            io_failure_limit: 8,
        }
    }

    #[test]
    fn test_resolve_prefers_home_cache_when_root_on_nvme() {
        let path = resolve_scratch_path(None, Some(Path::new("/home/pi")), MOUNTS_NVME_ROOT, "f.tmp");
        assert_eq!(path, PathBuf::from("/home/pi/.cache/oc-stress/f.tmp"));

        let path = resolve_scratch_path(None, None, MOUNTS_NVME_ROOT, "f.tmp");
        assert_eq!(path, PathBuf::from("/var/tmp/f.tmp"));
    }

    #[test]
    fn test_resolve_uses_separate_nvme_mount() {
        let path = resolve_scratch_path(None, Some(Path::new("/home/pi")), MOUNTS_SD_ROOT_NVME_DATA, "f.tmp");
        assert_eq!(path, PathBuf::from("/mnt/data/f.tmp"));
    }

    #[test]
    fn test_resolve_never_uses_tmp() {
        let path = resolve_scratch_path(None, None, "tmpfs /tmp tmpfs rw 0 0\n", "f.tmp");
        assert_eq!(path, PathBuf::from("/var/tmp/f.tmp"));
    }

    #[test]
    fn test_override_directory_and_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = resolve_scratch_path(Some(dir.path()), None, MOUNTS_NVME_ROOT, "f.tmp");
        assert_eq!(path, dir.path().join("f.tmp"));

        let explicit = dir.path().join("custom.bin");
        assert_eq!(resolve_scratch_path(Some(&explicit), None, "", "f.tmp"), explicit);
    }

    #[tokio::test]
    async fn test_unwritable_path_fails_prepare() {
        let mut storage = StorageStress::new(
            small(),
            Some(PathBuf::from("/proc/oc-stress-denied/scratch.bin")),
            Arc::new(FaultInjector::new()),
        );
        assert!(storage.prepare().await.is_err());
    }

    #[tokio::test]
    async fn test_forced_corruption_counts_one_error_and_cleans_up() {
        let dir = tempfile::tempdir().unwrap();
        let faults = Arc::new(FaultInjector::new());
        let mut storage = StorageStress::new(small(), Some(dir.path().to_path_buf()), faults.clone());
        storage.prepare().await.unwrap();
        let scratch = storage.scratch_path().unwrap().to_path_buf();
        assert!(scratch.exists());

        faults.arm_storage_readback();
        let counters = Arc::new(DomainCounters::new(Domain::Storage, 8));
        let cancel = CancellationToken::new();
        let task = tokio::spawn(storage.run(cancel.clone(), counters.clone()));

        tokio::time::sleep(Duration::from_millis(300)).await;
        cancel.cancel();
        let exit = task.await.unwrap();

        assert_eq!(exit, DomainExit::Completed);
        assert_eq!(counters.errors(), 1);
        assert!(counters.operations() > 1);
        assert!(!scratch.exists(), "scratch file must be removed");
    }

    #[tokio::test]
    async fn test_scratch_removed_when_task_aborted() {
        let dir = tempfile::tempdir().unwrap();
        let mut storage = StorageStress::new(small(), Some(dir.path().to_path_buf()), Arc::new(FaultInjector::new()));
        storage.prepare().await.unwrap();
        let scratch = storage.scratch_path().unwrap().to_path_buf();

        let counters = Arc::new(DomainCounters::new(Domain::Storage, 8));
        let task = tokio::spawn(storage.run(CancellationToken::new(), counters));
        tokio::time::sleep(Duration::from_millis(50)).await;
        task.abort();
        let _ = task.await;

        assert!(!scratch.exists());
    }
}
