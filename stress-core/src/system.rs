// stress-core/src/system.rs
// Host identification and read-only overclock parameters for the startup banner

use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;

use crate::error::*;
use crate::stress_error;

const FIRMWARE_CONFIGS: [&str; 2] = ["/boot/firmware/config.txt", "/boot/config.txt"];

/// Value of `key` in /proc/meminfo, in bytes
pub fn read_meminfo(key: &str) -> Result<u64> {
    let contents = fs::read_to_string("/proc/meminfo")
        .map_err(|e| stress_error!(io, "read /proc/meminfo", e))?;
    parse_meminfo(&contents, key)
        .ok_or_else(|| stress_error!(unavailable, "meminfo", format!("{} not reported", key)))
}

pub fn parse_meminfo(contents: &str, key: &str) -> Option<u64> {
    contents.lines().find_map(|line| {
        let (name, rest) = line.split_once(':')?;
        if name.trim() != key {
            return None;
        }
        let kb: u64 = rest.split_whitespace().next()?.parse().ok()?;
        Some(kb * 1024)
    })
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SystemInfo {
    pub model: String,
    pub cpu_cores: usize,
    pub total_memory_mb: u64,
    pub kernel: String,
    pub os: Option<String>,
}

impl SystemInfo {
    /// Best effort; missing sources leave fields at defaults
    pub fn collect() -> Self {
        let cpuinfo = fs::read_to_string("/proc/cpuinfo").unwrap_or_default();
        let model = fs::read_to_string("/proc/device-tree/model")
            .ok()
            .map(|m| m.trim_end_matches('\0').trim().to_string())
            .filter(|m| !m.is_empty())
            .or_else(|| cpuinfo_field(&cpuinfo, "Model"))
            .or_else(|| cpuinfo_field(&cpuinfo, "Hardware"))
            .unwrap_or_else(|| "Unknown".to_string());

        let kernel = fs::read_to_string("/proc/sys/kernel/osrelease")
            .map(|k| k.trim().to_string())
            .unwrap_or_else(|_| "unknown".to_string());

        let os = fs::read_to_string("/etc/os-release")
            .ok()
            .and_then(|text| os_pretty_name(&text));

        Self {
            model,
            cpu_cores: num_cpus::get(),
            total_memory_mb: read_meminfo("MemTotal").map(|b| b / (1024 * 1024)).unwrap_or(0),
            kernel,
            os,
        }
    }
}

fn cpuinfo_field(cpuinfo: &str, field: &str) -> Option<String> {
    cpuinfo.lines().find_map(|line| {
        let (name, value) = line.split_once(':')?;
        (name.trim() == field).then(|| value.trim().to_string())
    })
}

fn os_pretty_name(os_release: &str) -> Option<String> {
    os_release
        .lines()
        .find_map(|line| line.strip_prefix("PRETTY_NAME="))
        .map(|v| v.trim_matches('"').to_string())
}

/// Overclock parameters as written in the firmware config file. Never modified.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct OcConfig {
    pub arm_freq: Option<u32>,
    pub gpu_freq: Option<u32>,
    pub core_freq: Option<u32>,
    pub over_voltage: Option<i32>,
    /// Microvolts
    pub over_voltage_delta: Option<i32>,
    pub force_turbo: Option<u32>,
    pub pcie_enabled: bool,
    pub pcie_gen: Option<u32>,
}

impl OcConfig {
    /// First firmware config that exists, or defaults
    pub fn load() -> Self {
        FIRMWARE_CONFIGS
            .iter()
            .find_map(|path| Self::from_file(Path::new(path)).ok())
            .unwrap_or_default()
    }

    pub fn from_file(path: &Path) -> Result<Self> {
        let text = fs::read_to_string(path)
            .map_err(|e| stress_error!(io, format!("read {}", path.display()), e))?;
        Ok(Self::parse(&text))
    }

    /// Section filters (`[pi5]`, `[all]`) are ignored; later lines win
    pub fn parse(text: &str) -> Self {
        let mut config = OcConfig::default();
        for line in text.lines().map(str::trim) {
            if line.is_empty() || line.starts_with('#') || line.starts_with('[') {
                continue;
            }
            if let Some(param) = line.strip_prefix("dtparam=") {
                match param.split_once('=') {
                    Some(("pciex1_gen", gen)) => config.pcie_gen = gen.trim().parse().ok(),
                    Some(("pciex1", value)) => config.pcie_enabled = value.trim() != "off",
                    None if param == "pciex1" => config.pcie_enabled = true,
                    _ => {}
                }
                continue;
            }
            let Some((key, value)) = line.split_once('=') else { continue };
            let value = value.trim();
            match key.trim() {
                "arm_freq" => config.arm_freq = value.parse().ok(),
                "gpu_freq" => config.gpu_freq = value.parse().ok(),
                "core_freq" => config.core_freq = value.parse().ok(),
                "over_voltage" => config.over_voltage = value.parse().ok(),
                "over_voltage_delta" => config.over_voltage_delta = value.parse().ok(),
                "force_turbo" => config.force_turbo = value.parse().ok(),
                _ => {}
            }
        }
        config
    }

    pub fn is_overclocked(&self) -> bool {
        self.arm_freq.is_some_and(|f| f > 2400)
            || self.gpu_freq.is_some_and(|f| f > 910)
            || self.over_voltage.is_some()
            || self.over_voltage_delta.is_some()
            || self.force_turbo == Some(1)
    }

    /// Offset in millivolts; legacy `over_voltage` steps are 25 mV
    pub fn voltage_offset_mv(&self) -> Option<f32> {
        self.over_voltage_delta
            .map(|uv| uv as f32 / 1000.0)
            .or_else(|| self.over_voltage.map(|steps| steps as f32 * 25.0))
    }
}
