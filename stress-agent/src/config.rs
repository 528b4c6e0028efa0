// stress-agent/src/config.rs
// Tuning file loading

use anyhow::{Context, Result};
use std::path::Path;
use stress_core::StressTuning;
use tracing::{info, warn};

/// Load tunables from a TOML file. No path or a missing file gives the
/// defaults; a file that exists but does not parse is a configuration error.
pub fn load_tuning(path: Option<&Path>) -> Result<StressTuning> {
    let Some(path) = path else {
        return Ok(StressTuning::default());
    };

    match std::fs::read_to_string(path) {
        Ok(content) => {
            let tuning: StressTuning = toml::from_str(&content)
                .with_context(|| format!("invalid tuning file {}", path.display()))?;
            info!("Loaded tuning from {}", path.display());
            Ok(tuning)
        }
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            warn!("Tuning file {} not found, using defaults", path.display());
            Ok(StressTuning::default())
        }
        Err(e) => Err(e).with_context(|| format!("cannot read tuning file {}", path.display())),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_missing_file_uses_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let tuning = load_tuning(Some(&dir.path().join("absent.toml"))).unwrap();
        assert_eq!(tuning, StressTuning::default());
        assert_eq!(load_tuning(None).unwrap(), StressTuning::default());
    }

    #[test]
    fn test_partial_file_keeps_other_defaults() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(
            file,
            "grace_period_secs = 5\n\n[cpu]\nprime_limit = 10000\n\n[kernel_log]\nerror_patterns = [\"oops\"]"
        )
        .unwrap();

        let tuning = load_tuning(Some(file.path())).unwrap();
        assert_eq!(tuning.grace_period_secs, 5);
        assert_eq!(tuning.cpu.prime_limit, 10_000);
        assert_eq!(tuning.cpu.fft_size, StressTuning::default().cpu.fft_size);
        assert_eq!(tuning.kernel_log.error_patterns, vec!["oops".to_string()]);
    }

    #[test]
    fn test_invalid_file_is_an_error() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "grace_period_secs = \"soon\"").unwrap();
        let err = load_tuning(Some(file.path())).unwrap_err();
        assert!(err.to_string().contains("invalid tuning file"));
    }
}
