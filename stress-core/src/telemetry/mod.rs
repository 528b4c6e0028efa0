// stress-core/src/telemetry/mod.rs
// Telemetry sampling: throttle flags, samples, append-only history and the periodic sampler task

pub mod kernel_log;
pub mod nvme;
pub mod probe;
#[cfg(test)]
pub mod simulated;

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::{interval, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::error::*;
use crate::events::{LogClass, TelemetryEvent};
use kernel_log::LogClassifier;
use probe::{HardwareProbe, KernelLogSource};

/// Individual bits of the firmware throttle word
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ThrottleBit {
    UnderVoltage,
    FrequencyCapped,
    Throttled,
    SoftTempLimit,
    UnderVoltageOccurred,
    FrequencyCappedOccurred,
    ThrottledOccurred,
    SoftTempLimitOccurred,
}

impl ThrottleBit {
    pub const ALL: [ThrottleBit; 8] = [
        ThrottleBit::UnderVoltage,
        ThrottleBit::FrequencyCapped,
        ThrottleBit::Throttled,
        ThrottleBit::SoftTempLimit,
        ThrottleBit::UnderVoltageOccurred,
        ThrottleBit::FrequencyCappedOccurred,
        ThrottleBit::ThrottledOccurred,
        ThrottleBit::SoftTempLimitOccurred,
    ];

    pub fn mask(&self) -> u32 {
        match self {
            ThrottleBit::UnderVoltage => 1 << 0,
            ThrottleBit::FrequencyCapped => 1 << 1,
            ThrottleBit::Throttled => 1 << 2,
            ThrottleBit::SoftTempLimit => 1 << 3,
            ThrottleBit::UnderVoltageOccurred => 1 << 16,
            ThrottleBit::FrequencyCappedOccurred => 1 << 17,
            ThrottleBit::ThrottledOccurred => 1 << 18,
            ThrottleBit::SoftTempLimitOccurred => 1 << 19,
        }
    }

    pub fn is_current(&self) -> bool {
        self.mask() & ThrottleFlags::CURRENT_MASK != 0
    }

    pub fn is_under_voltage(&self) -> bool {
        matches!(self, ThrottleBit::UnderVoltage | ThrottleBit::UnderVoltageOccurred)
    }

    pub fn describe(&self) -> &'static str {
        match self {
            ThrottleBit::UnderVoltage => "under-voltage detected",
            ThrottleBit::FrequencyCapped => "ARM frequency capped",
            ThrottleBit::Throttled => "currently throttled",
            ThrottleBit::SoftTempLimit => "soft temperature limit active",
            ThrottleBit::UnderVoltageOccurred => "under-voltage has occurred",
            ThrottleBit::FrequencyCappedOccurred => "ARM frequency capping has occurred",
            ThrottleBit::ThrottledOccurred => "throttling has occurred",
            ThrottleBit::SoftTempLimitOccurred => "soft temperature limit has occurred",
        }
    }
}

/// Raw firmware throttle word. Bits 0-3 describe the current state,
/// bits 16-19 are sticky until reboot.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ThrottleFlags(pub u32);

impl ThrottleFlags {
    pub const CURRENT_MASK: u32 = 0x0000_000F;
    pub const HISTORICAL_MASK: u32 = 0x000F_0000;

    pub fn is_set(&self, bit: ThrottleBit) -> bool {
        self.0 & bit.mask() != 0
    }

    pub fn current(&self) -> u32 {
        self.0 & Self::CURRENT_MASK
    }

    pub fn historical(&self) -> u32 {
        self.0 & Self::HISTORICAL_MASK
    }

    pub fn any_current(&self) -> bool {
        self.current() != 0
    }

    /// Sticky view: historical bits plus the historical equivalent of every current bit
    pub fn sticky(&self) -> ThrottleFlags {
        ThrottleFlags(self.historical() | (self.current() << 16))
    }

    /// Bits that are set now but were clear in `previous`
    pub fn raised_since(&self, previous: ThrottleFlags) -> Vec<ThrottleBit> {
        let raised = self.0 & !previous.0;
        ThrottleBit::ALL
            .iter()
            .copied()
            .filter(|bit| raised & bit.mask() != 0)
            .collect()
    }

    pub fn set_bits(&self) -> Vec<ThrottleBit> {
        ThrottleBit::ALL
            .iter()
            .copied()
            .filter(|bit| self.is_set(*bit))
            .collect()
    }
}

impl fmt::Display for ThrottleFlags {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "0x{:x}", self.0)
    }
}

/// A numeric metric or capability the sampler polls
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Metric {
    Temperature,
    Frequency,
    Voltage,
    Throttle,
    StorageTemperature,
    GpuFrequency,
    Fan,
    Memory,
    Governor,
    KernelLog,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FanStatus {
    /// PWM duty, 0-100
    pub speed_percent: Option<u8>,
    pub rpm: Option<u32>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct MemoryUsage {
    pub used_mb: u64,
    pub total_mb: u64,
}

/// A kernel log line that matched an error pattern
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct KernelLine {
    pub class: LogClass,
    pub line: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TelemetrySample {
    pub timestamp: DateTime<Utc>,
    pub temperature_c: Option<f32>,
    pub frequency_mhz: Option<u32>,
    pub voltage_v: Option<f32>,
    pub throttle: Option<ThrottleFlags>,
    pub storage_temperature_c: Option<f32>,
    pub gpu_frequency_mhz: Option<u32>,
    pub fan: Option<FanStatus>,
    pub memory: Option<MemoryUsage>,
    pub governor: Option<String>,
    pub kernel_errors: Vec<KernelLine>,
}

impl TelemetrySample {
    pub fn empty(timestamp: DateTime<Utc>) -> Self {
        Self {
            timestamp,
            temperature_c: None,
            frequency_mhz: None,
            voltage_v: None,
            throttle: None,
            storage_temperature_c: None,
            gpu_frequency_mhz: None,
            fan: None,
            memory: None,
            governor: None,
            kernel_errors: Vec::new(),
        }
    }
}

/// Running min/max/avg of one metric
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct RunningStat {
    count: u64,
    sum: f64,
    min: f64,
    max: f64,
}

impl RunningStat {
    pub fn push(&mut self, value: f64) {
        if self.count == 0 {
            self.min = value;
            self.max = value;
        } else {
            self.min = self.min.min(value);
            self.max = self.max.max(value);
        }
        self.count += 1;
        self.sum += value;
    }

    pub fn summary(&self) -> Option<StatSummary> {
        if self.count == 0 {
            return None;
        }
        Some(StatSummary {
            min: self.min,
            max: self.max,
            avg: self.sum / self.count as f64,
            samples: self.count,
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct StatSummary {
    pub min: f64,
    pub max: f64,
    pub avg: f64,
    pub samples: u64,
}

/// Append-only sample history for one session
#[derive(Debug, Default)]
pub struct TelemetryHistory {
    samples: Vec<TelemetrySample>,
    temperature: RunningStat,
    frequency: RunningStat,
    voltage: RunningStat,
    storage_temperature: RunningStat,
    gpu_frequency: RunningStat,
    memory_used: RunningStat,
    events: Vec<TelemetryEvent>,
    last_flags: ThrottleFlags,
    flags_seen: u32,
    unavailable: BTreeSet<Metric>,
    kernel_errors: u64,
    io_errors: u64,
}

impl TelemetryHistory {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a sample. Samples older than the newest one are rejected so
    /// the history stays totally ordered by timestamp.
    pub fn record(&mut self, sample: TelemetrySample) -> bool {
        if let Some(last) = self.samples.last() {
            if sample.timestamp < last.timestamp {
                warn!(
                    "Dropping out-of-order telemetry sample ({} < {})",
                    sample.timestamp, last.timestamp
                );
                return false;
            }
        }

        if let Some(t) = sample.temperature_c {
            self.temperature.push(t as f64);
        }
        if let Some(f) = sample.frequency_mhz {
            self.frequency.push(f as f64);
        }
        if let Some(v) = sample.voltage_v {
            self.voltage.push(v as f64);
        }
        if let Some(t) = sample.storage_temperature_c {
            self.storage_temperature.push(t as f64);
        }
        if let Some(f) = sample.gpu_frequency_mhz {
            self.gpu_frequency.push(f as f64);
        }
        if let Some(m) = sample.memory {
            self.memory_used.push(m.used_mb as f64);
        }

        if let Some(flags) = sample.throttle {
            for bit in flags.raised_since(self.last_flags) {
                debug!("Throttle bit raised: {}", bit.describe());
                self.events.push(TelemetryEvent::FlagRaised {
                    bit,
                    at: sample.timestamp,
                });
            }
            self.last_flags = flags;
            self.flags_seen |= flags.0;
        }

        for entry in &sample.kernel_errors {
            self.kernel_errors += 1;
            if entry.class == LogClass::Io {
                self.io_errors += 1;
            }
            self.events.push(TelemetryEvent::KernelError {
                class: entry.class,
                line: entry.line.clone(),
                at: sample.timestamp,
            });
        }

        self.samples.push(sample);
        true
    }

    pub fn mark_unavailable(&mut self, metric: Metric) {
        if self.unavailable.insert(metric) {
            warn!("Telemetry metric {:?} unavailable for this run", metric);
        }
    }

    pub fn latest(&self) -> Option<&TelemetrySample> {
        self.samples.last()
    }

    pub fn len(&self) -> usize {
        self.samples.len()
    }

    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }

    pub fn events(&self) -> &[TelemetryEvent] {
        &self.events
    }

    pub fn temperature(&self) -> Option<StatSummary> {
        self.temperature.summary()
    }

    pub fn kernel_error_count(&self) -> u64 {
        self.kernel_errors
    }

    /// Every bit observed in any sample so far
    pub fn flags_seen(&self) -> ThrottleFlags {
        ThrottleFlags(self.flags_seen)
    }

    pub fn event_counts(&self) -> EventCounts {
        let mut counts = EventCounts {
            kernel_errors: self.kernel_errors,
            io_errors: self.io_errors,
            ..EventCounts::default()
        };
        for event in &self.events {
            if let TelemetryEvent::FlagRaised { bit, .. } = event {
                match bit {
                    ThrottleBit::UnderVoltage => counts.under_voltage += 1,
                    ThrottleBit::FrequencyCapped
                    | ThrottleBit::Throttled
                    | ThrottleBit::SoftTempLimit => counts.throttling += 1,
                    _ => {}
                }
            }
        }
        counts
    }

    /// Freeze the history. Consumes it, so nothing can be appended afterwards.
    pub fn freeze(self) -> TelemetrySummary {
        let seen = ThrottleFlags(self.flags_seen);
        TelemetrySummary {
            sample_count: self.samples.len() as u64,
            first_sample_at: self.samples.first().map(|s| s.timestamp),
            last_sample_at: self.samples.last().map(|s| s.timestamp),
            temperature_c: self.temperature.summary(),
            frequency_mhz: self.frequency.summary(),
            voltage_v: self.voltage.summary(),
            storage_temperature_c: self.storage_temperature.summary(),
            gpu_frequency_mhz: self.gpu_frequency.summary(),
            memory_used_mb: self.memory_used.summary(),
            current_flags_observed: ThrottleFlags(seen.current()),
            historical_flags: seen.sticky(),
            counts: self.event_counts(),
            unavailable: self.unavailable.iter().copied().collect(),
            events: self.events,
        }
    }
}

/// Event counters derived from the history
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct EventCounts {
    /// 0→1 transitions of capped/throttled/soft-limit current bits
    pub throttling: u64,
    /// 0→1 transitions of the current under-voltage bit
    pub under_voltage: u64,
    pub io_errors: u64,
    pub kernel_errors: u64,
}

/// Frozen end-of-session telemetry
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TelemetrySummary {
    pub sample_count: u64,
    pub first_sample_at: Option<DateTime<Utc>>,
    pub last_sample_at: Option<DateTime<Utc>>,
    pub temperature_c: Option<StatSummary>,
    pub frequency_mhz: Option<StatSummary>,
    pub voltage_v: Option<StatSummary>,
    pub storage_temperature_c: Option<StatSummary>,
    pub gpu_frequency_mhz: Option<StatSummary>,
    pub memory_used_mb: Option<StatSummary>,
    /// Union of every current-state bit seen during the session
    pub current_flags_observed: ThrottleFlags,
    /// Sticky bits as they stand at the end of the session
    pub historical_flags: ThrottleFlags,
    pub counts: EventCounts,
    pub unavailable: Vec<Metric>,
    pub events: Vec<TelemetryEvent>,
}

impl TelemetrySummary {
    pub fn under_voltage_occurred(&self) -> bool {
        self.historical_flags.is_set(ThrottleBit::UnderVoltageOccurred)
    }

    pub fn throttling_occurred(&self) -> bool {
        self.historical_flags.is_set(ThrottleBit::ThrottledOccurred)
            || self.historical_flags.is_set(ThrottleBit::FrequencyCappedOccurred)
            || self.historical_flags.is_set(ThrottleBit::SoftTempLimitOccurred)
    }
}

/// Polls the probe and the kernel log. Owns the log cursor exclusively.
pub struct Sampler {
    probe: Arc<dyn HardwareProbe>,
    kernel_log: Box<dyn KernelLogSource>,
    classifier: LogClassifier,
    disabled: BTreeSet<Metric>,
}

impl Sampler {
    pub fn new(
        probe: Arc<dyn HardwareProbe>,
        kernel_log: Box<dyn KernelLogSource>,
        classifier: LogClassifier,
    ) -> Self {
        Self {
            probe,
            kernel_log,
            classifier,
            disabled: BTreeSet::new(),
        }
    }

    /// Take one sample. Also returns metrics that became unavailable during it.
    pub fn sample(&mut self) -> (TelemetrySample, Vec<Metric>) {
        let mut sample = TelemetrySample::empty(Utc::now());
        let mut lost = Vec::new();

        let probe = Arc::clone(&self.probe);
        sample.temperature_c = self.poll(Metric::Temperature, &mut lost, || probe.temperature_c());
        sample.frequency_mhz = self.poll(Metric::Frequency, &mut lost, || probe.frequency_mhz());
        sample.voltage_v = self.poll(Metric::Voltage, &mut lost, || probe.core_voltage());
        sample.throttle = self.poll(Metric::Throttle, &mut lost, || probe.throttle_flags());
        sample.storage_temperature_c = self.poll(Metric::StorageTemperature, &mut lost, || {
            probe.storage_temperature_c()
        });
        sample.gpu_frequency_mhz = self.poll(Metric::GpuFrequency, &mut lost, || probe.gpu_frequency_mhz());
        sample.fan = self.poll(Metric::Fan, &mut lost, || probe.fan_status());
        sample.memory = self.poll(Metric::Memory, &mut lost, || probe.memory_usage());
        sample.governor = self.poll(Metric::Governor, &mut lost, || probe.governor());

        if !self.disabled.contains(&Metric::KernelLog) {
            match self.kernel_log.read_new() {
                Ok(lines) => {
                    sample.kernel_errors = lines
                        .iter()
                        .filter_map(|line| self.classifier.classify(line))
                        .collect();
                }
                Err(e) => self.handle_probe_error(Metric::KernelLog, e, &mut lost),
            }
        }

        (sample, lost)
    }

    fn poll<T>(
        &mut self,
        metric: Metric,
        lost: &mut Vec<Metric>,
        read: impl FnOnce() -> Result<T>,
    ) -> Option<T> {
        if self.disabled.contains(&metric) {
            return None;
        }
        match read() {
            Ok(value) => Some(value),
            Err(e) => {
                self.handle_probe_error(metric, e, lost);
                None
            }
        }
    }

    fn handle_probe_error(&mut self, metric: Metric, err: StressError, lost: &mut Vec<Metric>) {
        match err.recovery_strategy() {
            RecoveryStrategy::Disable => {
                info!("Disabling {:?} probe: {}", metric, err);
                self.disabled.insert(metric);
                lost.push(metric);
            }
            _ => debug!("Skipping {:?} reading this sample: {}", metric, err),
        }
    }
}

/// Periodic sampler task. Sleeps between samples, takes one final sample when
/// cancelled, and never blocks the generators: every probe call runs on the
/// blocking pool.
pub fn spawn_sampler(
    sampler: Sampler,
    history: Arc<RwLock<TelemetryHistory>>,
    every: Duration,
    cancel: CancellationToken,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut sampler = Some(sampler);
        let mut ticker = interval(every);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        info!("📡 Telemetry sampler started (interval {:?})", every);

        loop {
            let last = tokio::select! {
                _ = ticker.tick() => false,
                _ = cancel.cancelled() => true,
            };

            let Some(current) = sampler.take() else { break };
            match tokio::task::spawn_blocking(move || {
                let mut current = current;
                let (sample, lost) = current.sample();
                (current, sample, lost)
            })
            .await
            {
                Ok((returned, sample, lost)) => {
                    let mut guard = history.write();
                    for metric in lost {
                        guard.mark_unavailable(metric);
                    }
                    guard.record(sample);
                    sampler = Some(returned);
                }
                Err(e) => {
                    error!("Telemetry sampler task error: {}", e);
                    break;
                }
            }

            if last {
                debug!("Telemetry sampler received shutdown signal");
                break;
            }
        }

        info!("Telemetry sampler stopped");
    })
}
