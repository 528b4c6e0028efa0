// stress-core/src/telemetry/probe.rs
// Capability traits for hardware sensors and kernel logs, plus the Linux probe

use std::fs;
use std::io::Read;
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};
use std::thread;
use std::time::{Duration, Instant};
use tracing::debug;

use super::{FanStatus, MemoryUsage, ThrottleFlags};
use crate::error::*;
use crate::stress_error;
use crate::system::parse_meminfo;

/// Source of SoC sensor readings. A missing source returns
/// `CapabilityUnavailable`, which disables that metric for the run.
pub trait HardwareProbe: Send + Sync {
    fn temperature_c(&self) -> Result<f32>;
    fn frequency_mhz(&self) -> Result<u32>;
    fn core_voltage(&self) -> Result<f32>;
    fn throttle_flags(&self) -> Result<ThrottleFlags>;
    fn storage_temperature_c(&self) -> Result<f32>;
    fn gpu_frequency_mhz(&self) -> Result<u32>;
    fn fan_status(&self) -> Result<FanStatus>;
    fn memory_usage(&self) -> Result<MemoryUsage>;
    fn governor(&self) -> Result<String>;
}

/// Stateful reader over the kernel log; every call returns only lines not
/// returned before.
pub trait KernelLogSource: Send {
    fn read_new(&mut self) -> Result<Vec<String>>;
}

const THERMAL_ZONE: &str = "/sys/class/thermal/thermal_zone0/temp";
const SCALING_CUR_FREQ: &str = "/sys/devices/system/cpu/cpu0/cpufreq/scaling_cur_freq";
const SCALING_GOVERNOR: &str = "/sys/devices/system/cpu/cpu0/cpufreq/scaling_governor";
const MEMINFO: &str = "/proc/meminfo";
const HWMON_ROOT: &str = "/sys/class/hwmon";

/// Upper bound on one external tool invocation
pub const TOOL_TIMEOUT: Duration = Duration::from_secs(2);
const TOOL_POLL: Duration = Duration::from_millis(5);

/// Run an external tool and return its stdout.
///
/// A missing binary or a non-zero exit is `CapabilityUnavailable`. A tool
/// still running after `limit` is killed and reported as `Timeout`, so a
/// wedged firmware call costs at most `limit`.
pub fn run_tool(program: &str, args: &[&str], limit: Duration) -> Result<String> {
    let mut child = Command::new(program)
        .args(args)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::null())
        .spawn()
        .map_err(|e| stress_error!(unavailable, program, e))?;

    // Drained off-thread: dmesg output can exceed the pipe buffer
    let reader = child.stdout.take().map(|mut stdout| {
        thread::spawn(move || {
            let mut buf = Vec::new();
            let _ = stdout.read_to_end(&mut buf);
            buf
        })
    });

    let deadline = Instant::now() + limit;
    let status = loop {
        match child.try_wait() {
            Ok(Some(status)) => break status,
            Ok(None) if Instant::now() >= deadline => {
                let _ = child.kill();
                let _ = child.wait();
                return Err(StressError::timeout(
                    &format!("{} {}", program, args.join(" ")),
                    limit,
                ));
            }
            Ok(None) => thread::sleep(TOOL_POLL),
            Err(e) => return Err(stress_error!(io, program, e)),
        }
    };

    if !status.success() {
        return Err(stress_error!(
            unavailable,
            program,
            format!("{} exited with {}", args.join(" "), status)
        ));
    }
    let stdout = reader.and_then(|r| r.join().ok()).unwrap_or_default();
    Ok(String::from_utf8_lossy(&stdout).into_owned())
}

/// Probe backed by the `vcgencmd` firmware tool with sysfs fallbacks
#[derive(Debug, Clone)]
pub struct SystemProbe {
    vcgencmd: String,
    storage_hwmon: Option<PathBuf>,
    fan_hwmon: Option<PathBuf>,
}

impl SystemProbe {
    pub fn new() -> Self {
        let hwmon = Path::new(HWMON_ROOT);
        let storage_hwmon = find_nvme_hwmon(hwmon);
        if let Some(path) = &storage_hwmon {
            debug!("Storage temperature sensor at {}", path.display());
        }
        let fan_hwmon = find_fan_hwmon(hwmon);
        if let Some(path) = &fan_hwmon {
            debug!("Fan sensor at {}", path.display());
        }
        Self {
            vcgencmd: "vcgencmd".to_string(),
            storage_hwmon,
            fan_hwmon,
        }
    }

    fn vcgencmd(&self, args: &[&str]) -> Result<String> {
        run_tool(&self.vcgencmd, args, TOOL_TIMEOUT)
    }
}

impl Default for SystemProbe {
    fn default() -> Self {
        Self::new()
    }
}

impl HardwareProbe for SystemProbe {
    fn temperature_c(&self) -> Result<f32> {
        if let Ok(text) = self.vcgencmd(&["measure_temp"]) {
            if let Some(temp) = parse_vc_temperature(&text) {
                return Ok(temp);
            }
        }
        read_millis(Path::new(THERMAL_ZONE), "temperature")
    }

    fn frequency_mhz(&self) -> Result<u32> {
        if let Ok(text) = self.vcgencmd(&["measure_clock", "arm"]) {
            if let Some(mhz) = parse_vc_frequency(&text) {
                return Ok(mhz);
            }
        }
        let text = fs::read_to_string(SCALING_CUR_FREQ)
            .map_err(|e| stress_error!(unavailable, "frequency", e))?;
        text.trim()
            .parse::<u32>()
            .map(|khz| khz / 1000)
            .map_err(|e| stress_error!(unavailable, "frequency", e))
    }

    fn core_voltage(&self) -> Result<f32> {
        let text = self.vcgencmd(&["measure_volts", "core"])?;
        parse_vc_voltage(&text).ok_or_else(|| {
            stress_error!(
                io,
                "measure_volts",
                std::io::Error::new(
                    std::io::ErrorKind::InvalidData,
                    format!("unexpected output '{}'", text.trim())
                )
            )
        })
    }

    fn throttle_flags(&self) -> Result<ThrottleFlags> {
        let text = self.vcgencmd(&["get_throttled"])?;
        parse_vc_throttled(&text)
            .ok_or_else(|| stress_error!(unavailable, "throttle", format!("unexpected output '{}'", text.trim())))
    }

    fn storage_temperature_c(&self) -> Result<f32> {
        match &self.storage_hwmon {
            Some(dir) => read_millis(&dir.join("temp1_input"), "storage temperature"),
            None => Err(stress_error!(unavailable, "storage temperature", "no NVMe hwmon sensor")),
        }
    }

    fn gpu_frequency_mhz(&self) -> Result<u32> {
        let text = self.vcgencmd(&["measure_clock", "core"])?;
        parse_vc_frequency(&text)
            .ok_or_else(|| stress_error!(unavailable, "gpu frequency", format!("unexpected output '{}'", text.trim())))
    }

    fn fan_status(&self) -> Result<FanStatus> {
        match &self.fan_hwmon {
            Some(dir) => read_fan(dir),
            None => Err(stress_error!(unavailable, "fan", "no PWM fan in hwmon")),
        }
    }

    fn memory_usage(&self) -> Result<MemoryUsage> {
        let text = fs::read_to_string(MEMINFO).map_err(|e| stress_error!(unavailable, "memory usage", e))?;
        parse_memory_usage(&text)
            .ok_or_else(|| stress_error!(unavailable, "memory usage", "MemTotal/MemAvailable not reported"))
    }

    fn governor(&self) -> Result<String> {
        fs::read_to_string(SCALING_GOVERNOR)
            .map(|g| g.trim().to_string())
            .map_err(|e| stress_error!(unavailable, "governor", e))
    }
}

/// `temp=45.0'C`
pub fn parse_vc_temperature(text: &str) -> Option<f32> {
    text.trim()
        .strip_prefix("temp=")?
        .trim_end_matches("'C")
        .parse()
        .ok()
}

/// `frequency(48)=2400000000`, returned in MHz
pub fn parse_vc_frequency(text: &str) -> Option<u32> {
    let hz: u64 = text.trim().split('=').nth(1)?.trim().parse().ok()?;
    Some((hz / 1_000_000) as u32)
}

/// `volt=0.8563V`
pub fn parse_vc_voltage(text: &str) -> Option<f32> {
    text.trim()
        .strip_prefix("volt=")?
        .trim_end_matches('V')
        .parse()
        .ok()
}

/// `throttled=0x50005`
pub fn parse_vc_throttled(text: &str) -> Option<ThrottleFlags> {
    let hex = text.trim().split("0x").nth(1)?;
    u32::from_str_radix(hex.trim(), 16).ok().map(ThrottleFlags)
}

fn read_millis(path: &Path, capability: &str) -> Result<f32> {
    let text = fs::read_to_string(path).map_err(|e| stress_error!(unavailable, capability, e))?;
    text.trim()
        .parse::<i64>()
        .map(|millis| millis as f32 / 1000.0)
        .map_err(|e| stress_error!(unavailable, capability, e))
}

/// Used = total - available, both in MB
pub fn parse_memory_usage(meminfo: &str) -> Option<MemoryUsage> {
    let total = parse_meminfo(meminfo, "MemTotal")?;
    let available = parse_meminfo(meminfo, "MemAvailable")?;
    Some(MemoryUsage {
        used_mb: total.saturating_sub(available) / (1024 * 1024),
        total_mb: total / (1024 * 1024),
    })
}

/// PWM duty (0-255) as a percentage plus tachometer RPM when present
fn read_fan(dir: &Path) -> Result<FanStatus> {
    let read = |file: &str| -> Option<u32> { fs::read_to_string(dir.join(file)).ok()?.trim().parse().ok() };
    let status = FanStatus {
        speed_percent: read("pwm1").map(|pwm| (pwm * 100 / 255).min(100) as u8),
        rpm: read("fan1_input"),
    };
    if status.speed_percent.is_none() && status.rpm.is_none() {
        return Err(stress_error!(unavailable, "fan", format!("{} has no readable fan", dir.display())));
    }
    Ok(status)
}

/// First hwmon directory exposing a PWM duty or a fan tachometer
pub fn find_fan_hwmon(root: &Path) -> Option<PathBuf> {
    let entries = fs::read_dir(root).ok()?;
    let mut dirs: Vec<PathBuf> = entries.flatten().map(|e| e.path()).collect();
    dirs.sort();
    dirs.into_iter()
        .find(|dir| dir.join("pwm1").exists() || dir.join("fan1_input").exists())
}

/// First hwmon directory whose `name` mentions nvme
pub fn find_nvme_hwmon(root: &Path) -> Option<PathBuf> {
    let entries = fs::read_dir(root).ok()?;
    entries.flatten().map(|e| e.path()).find(|dir| {
        fs::read_to_string(dir.join("name"))
            .map(|name| name.trim().contains("nvme"))
            .unwrap_or(false)
    })
}
