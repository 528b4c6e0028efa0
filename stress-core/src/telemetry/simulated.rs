// stress-core/src/telemetry/simulated.rs
// Scripted capability sources for tests

use parking_lot::Mutex;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use super::nvme::{SmartSource, SmartStatus, StorageDevice, StorageTopology};
use super::probe::{HardwareProbe, KernelLogSource};
use super::{FanStatus, MemoryUsage, ThrottleFlags};
use crate::error::*;
use crate::stress_error;

/// Replays a throttle word per sample, repeating the last one once exhausted
pub struct ScriptedProbe {
    flags: Vec<u32>,
    calls: AtomicUsize,
    temperature_c: f32,
    voltage: bool,
    storage_temperature: bool,
    fan: bool,
    /// Blocks every temperature read, like a wedged firmware mailbox
    stall: Option<Duration>,
}

impl ScriptedProbe {
    pub fn new(flags: Vec<u32>) -> Self {
        Self {
            flags,
            calls: AtomicUsize::new(0),
            temperature_c: 55.0,
            voltage: true,
            storage_temperature: true,
            fan: true,
            stall: None,
        }
    }

    pub fn without_storage_temperature(mut self) -> Self {
        self.storage_temperature = false;
        self
    }

    pub fn without_fan(mut self) -> Self {
        self.fan = false;
        self
    }

    pub fn stalling(mut self, every_read: Duration) -> Self {
        self.stall = Some(every_read);
        self
    }

    pub fn without_voltage(mut self) -> Self {
        self.voltage = false;
        self
    }

    pub fn with_temperature(mut self, celsius: f32) -> Self {
        self.temperature_c = celsius;
        self
    }
}

impl HardwareProbe for ScriptedProbe {
    fn temperature_c(&self) -> Result<f32> {
        if let Some(stall) = self.stall {
            std::thread::sleep(stall);
        }
        Ok(self.temperature_c)
    }

    fn frequency_mhz(&self) -> Result<u32> {
        Ok(2400)
    }

    fn core_voltage(&self) -> Result<f32> {
        if self.voltage {
            Ok(0.92)
        } else {
            Err(stress_error!(unavailable, "voltage", "scripted probe has no voltage"))
        }
    }

    fn throttle_flags(&self) -> Result<ThrottleFlags> {
        let call = self.calls.fetch_add(1, Ordering::SeqCst);
        let raw = self
            .flags
            .get(call)
            .or_else(|| self.flags.last())
            .copied()
            .unwrap_or(0);
        Ok(ThrottleFlags(raw))
    }

    fn storage_temperature_c(&self) -> Result<f32> {
        if self.storage_temperature {
            Ok(38.0)
        } else {
            Err(stress_error!(unavailable, "storage temperature", "scripted probe has no NVMe sensor"))
        }
    }

    fn gpu_frequency_mhz(&self) -> Result<u32> {
        Ok(910)
    }

    fn fan_status(&self) -> Result<FanStatus> {
        if self.fan {
            Ok(FanStatus {
                speed_percent: Some(40),
                rpm: Some(2900),
            })
        } else {
            Err(stress_error!(unavailable, "fan", "scripted probe has no fan"))
        }
    }

    fn memory_usage(&self) -> Result<MemoryUsage> {
        Ok(MemoryUsage {
            used_mb: 2048,
            total_mb: 8052,
        })
    }

    fn governor(&self) -> Result<String> {
        Ok("performance".to_string())
    }
}

/// Hands out one batch of lines per read, then nothing
pub struct ScriptedLog {
    batches: VecDeque<Vec<String>>,
}

impl ScriptedLog {
    pub fn new(batches: Vec<Vec<String>>) -> Self {
        Self {
            batches: batches.into(),
        }
    }

    pub fn silent() -> Self {
        Self::new(Vec::new())
    }
}

impl KernelLogSource for ScriptedLog {
    fn read_new(&mut self) -> Result<Vec<String>> {
        Ok(self.batches.pop_front().unwrap_or_default())
    }
}

pub struct ScriptedTopology(pub Option<StorageDevice>);

impl StorageTopology for ScriptedTopology {
    fn detect(&self) -> Option<StorageDevice> {
        self.0.clone()
    }
}

/// Returns each status in turn, repeating the last
pub struct ScriptedSmart {
    statuses: Mutex<VecDeque<SmartStatus>>,
}

impl ScriptedSmart {
    pub fn new(statuses: Vec<SmartStatus>) -> Self {
        Self {
            statuses: Mutex::new(statuses.into()),
        }
    }
}

impl SmartSource for ScriptedSmart {
    fn query(&self) -> Result<SmartStatus> {
        let mut statuses = self.statuses.lock();
        let status = if statuses.len() > 1 {
            statuses.pop_front()
        } else {
            statuses.front().copied()
        };
        status.ok_or_else(|| stress_error!(unavailable, "smart", "scripted source empty"))
    }
}
