// stress-core/src/telemetry/nvme.rs
// Storage device identity and SMART health sources

use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use tracing::debug;

use super::probe::{run_tool, TOOL_TIMEOUT};
use crate::error::*;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StorageDevice {
    pub device_path: String,
    pub model: String,
    pub pcie_gen: Option<u32>,
}

/// Identifies the storage device under test
pub trait StorageTopology: Send + Sync {
    fn detect(&self) -> Option<StorageDevice>;
}

/// Controller health counters
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SmartStatus {
    pub critical_warning: u8,
    pub media_errors: u64,
    pub error_log_entries: u64,
}

impl SmartStatus {
    /// Warnings raised between `before` and `self`: new critical-warning bits
    /// plus newly recorded media errors
    pub fn warnings_since(&self, before: &SmartStatus) -> u64 {
        let new_bits = (self.critical_warning & !before.critical_warning).count_ones() as u64;
        new_bits + self.media_errors.saturating_sub(before.media_errors)
    }
}

pub trait SmartSource: Send + Sync {
    fn query(&self) -> Result<SmartStatus>;
}

/// `/sys/class/nvme` for identity, `lspci` or sysfs link speed for the PCIe generation
#[derive(Debug, Clone)]
pub struct SysfsTopology {
    class_root: PathBuf,
}

impl SysfsTopology {
    pub fn new() -> Self {
        Self {
            class_root: PathBuf::from("/sys/class/nvme"),
        }
    }

    pub fn with_root(class_root: impl Into<PathBuf>) -> Self {
        Self {
            class_root: class_root.into(),
        }
    }

    fn pcie_generation(&self, controller: &Path) -> Option<u32> {
        if let Some(gen) = run_tool("lspci", &["-vv"], TOOL_TIMEOUT)
            .ok()
            .and_then(|text| parse_lspci_link(&text))
        {
            return Some(gen);
        }
        fs::read_to_string(controller.join("device/current_link_speed"))
            .ok()
            .and_then(|speed| link_speed_generation(&speed))
    }
}

impl Default for SysfsTopology {
    fn default() -> Self {
        Self::new()
    }
}

impl StorageTopology for SysfsTopology {
    /// Lowest-numbered controller; its first namespace is the device path
    fn detect(&self) -> Option<StorageDevice> {
        let Some(name) = numbered_entries(&self.class_root, "nvme", "").into_iter().next() else {
            debug!("No NVMe controller under {}", self.class_root.display());
            return None;
        };
        let controller = self.class_root.join(&name);
        let model = fs::read_to_string(controller.join("model"))
            .map(|m| m.trim().to_string())
            .unwrap_or_else(|_| "Unknown NVMe".to_string());
        let namespace = numbered_entries(&controller, &name, "n")
            .into_iter()
            .next()
            .unwrap_or_else(|| format!("{}n1", name));
        debug!("NVMe controller {} ({}), namespace {}", name, model, namespace);

        Some(StorageDevice {
            device_path: format!("/dev/{}", namespace),
            model,
            pcie_gen: self.pcie_generation(&controller),
        })
    }
}

/// Entries of `dir` named `{prefix}{separator}{number}`, ordered by number
fn numbered_entries(dir: &Path, prefix: &str, separator: &str) -> Vec<String> {
    let Ok(entries) = fs::read_dir(dir) else {
        return Vec::new();
    };
    let mut found: Vec<(u32, String)> = entries
        .flatten()
        .filter_map(|entry| {
            let name = entry.file_name().to_string_lossy().into_owned();
            let index = name
                .strip_prefix(prefix)?
                .strip_prefix(separator)?
                .parse::<u32>()
                .ok()?;
            Some((index, name))
        })
        .collect();
    found.sort();
    found.into_iter().map(|(_, name)| name).collect()
}

/// Reads `nvme smart-log` for one controller
#[derive(Debug, Clone)]
pub struct NvmeCliSmart {
    controller: String,
}

impl NvmeCliSmart {
    /// Accepts a namespace or partition path such as `/dev/nvme0n1p2`
    pub fn for_device(device_path: &str) -> Self {
        Self {
            controller: controller_path(device_path),
        }
    }
}

impl SmartSource for NvmeCliSmart {
    fn query(&self) -> Result<SmartStatus> {
        let text = run_tool("nvme", &["smart-log", &self.controller], TOOL_TIMEOUT)?;
        Ok(parse_smart_log(&text))
    }
}

/// `/dev/nvme0n1p2` → `/dev/nvme0`
pub fn controller_path(device_path: &str) -> String {
    match device_path.find("nvme") {
        Some(start) => {
            let rest = &device_path[start + 4..];
            let digits = rest.chars().take_while(|c| c.is_ascii_digit()).count();
            format!("{}nvme{}", &device_path[..start], &rest[..digits])
        }
        None => device_path.to_string(),
    }
}

pub fn parse_smart_log(text: &str) -> SmartStatus {
    let mut status = SmartStatus::default();
    for line in text.lines() {
        let lower = line.to_lowercase();
        let Some(value) = smart_value(line) else { continue };
        if lower.contains("critical_warning") {
            status.critical_warning = value.min(u8::MAX as u64) as u8;
        } else if lower.contains("media_errors") || lower.contains("media errors") {
            status.media_errors = value;
        } else if lower.contains("num_err_log") || lower.contains("error log entries") {
            status.error_log_entries = value;
        }
    }
    status
}

fn smart_value(line: &str) -> Option<u64> {
    let (_, value) = line.split_once(':')?;
    value.split_whitespace().find_map(|word| match word.strip_prefix("0x") {
        Some(hex) => u64::from_str_radix(hex, 16).ok(),
        None => word.replace(',', "").parse().ok(),
    })
}

/// PCIe generation from the `LnkSta` line of the first NVMe controller in `lspci -vv`
pub fn parse_lspci_link(text: &str) -> Option<u32> {
    let mut in_nvme = false;
    for line in text.lines() {
        if !line.starts_with(char::is_whitespace) && !line.is_empty() {
            in_nvme = line.contains("Non-Volatile memory controller") || line.contains("NVMe");
            continue;
        }
        if in_nvme && line.contains("LnkSta:") {
            return link_speed_generation(line);
        }
    }
    None
}

fn link_speed_generation(text: &str) -> Option<u32> {
    let compact = text.replace(' ', "");
    let end = compact.find("GT/s")?;
    let digits = compact[..end]
        .chars()
        .rev()
        .take_while(|c| c.is_ascii_digit() || *c == '.')
        .count();
    let speed: f32 = compact[end - digits..end].parse().ok()?;
    match speed {
        s if s >= 16.0 => Some(4),
        s if s >= 8.0 => Some(3),
        s if s >= 5.0 => Some(2),
        s if s >= 2.5 => Some(1),
        _ => None,
    }
}
