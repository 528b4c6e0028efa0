// stress-agent/src/display.rs
// Startup banner, line-oriented status stream and the text rendering of the final report

use crossterm::style::{StyledContent, Stylize};
use std::fmt::Write;
use std::time::Duration;
use stress_core::observability::{DomainState, HealthStatus};
use stress_core::report::DomainStatus;
use stress_core::system::{OcConfig, SystemInfo};
use stress_core::telemetry::nvme::StorageDevice;
use stress_core::telemetry::FanStatus;
use stress_core::{LiveSnapshot, StabilityReport, Verdict};
use tokio::sync::watch;
use tokio_stream::wrappers::WatchStream;
use tokio_stream::StreamExt;

/// Colour on or off for everything written to the terminal
#[derive(Debug, Clone, Copy)]
pub struct Palette {
    color: bool,
}

impl Palette {
    pub fn new(color: bool) -> Self {
        Self { color }
    }

    fn paint(&self, styled: StyledContent<String>) -> String {
        if self.color {
            styled.to_string()
        } else {
            styled.content().clone()
        }
    }

    pub fn good(&self, text: impl Into<String>) -> String {
        let text: String = text.into();
        self.paint(text.green())
    }

    pub fn warn(&self, text: impl Into<String>) -> String {
        let text: String = text.into();
        self.paint(text.yellow())
    }

    pub fn bad(&self, text: impl Into<String>) -> String {
        let text: String = text.into();
        self.paint(text.red())
    }

    pub fn heading(&self, text: impl Into<String>) -> String {
        let text: String = text.into();
        self.paint(text.cyan().bold())
    }

    pub fn dim(&self, text: impl Into<String>) -> String {
        let text: String = text.into();
        self.paint(text.dim())
    }

    pub fn health(&self, status: HealthStatus, text: impl Into<String>) -> String {
        match status {
            HealthStatus::Critical => self.bad(text),
            HealthStatus::Warning | HealthStatus::Warm => self.warn(text),
            HealthStatus::Healthy => self.good(text),
            HealthStatus::Unknown => text.into(),
        }
    }

    pub fn verdict(&self, verdict: Verdict) -> String {
        match verdict {
            Verdict::Pass => self.paint(verdict.as_str().to_string().green().bold()),
            Verdict::Fail => self.paint(verdict.as_str().to_string().red().bold()),
            Verdict::Incomplete => self.paint(verdict.as_str().to_string().yellow().bold()),
        }
    }
}

/// HH:MM:SS, or MM:SS under an hour
pub fn format_clock(duration: Duration) -> String {
    let secs = duration.as_secs();
    let (hours, minutes, seconds) = (secs / 3600, (secs % 3600) / 60, secs % 60);
    if hours > 0 {
        format!("{:02}:{:02}:{:02}", hours, minutes, seconds)
    } else {
        format!("{:02}:{:02}", minutes, seconds)
    }
}

pub fn format_count(n: u64) -> String {
    match n {
        0..=9_999 => n.to_string(),
        10_000..=9_999_999 => format!("{:.1}k", n as f64 / 1_000.0),
        _ => format!("{:.1}M", n as f64 / 1_000_000.0),
    }
}

/// `40% 2900 rpm`, either half when only one is reported
pub fn format_fan(fan: &FanStatus) -> String {
    match (fan.speed_percent, fan.rpm) {
        (Some(pct), Some(rpm)) => format!("{}% {} rpm", pct, rpm),
        (Some(pct), None) => format!("{}%", pct),
        (None, Some(rpm)) => format!("{} rpm", rpm),
        (None, None) => "--".to_string(),
    }
}

pub fn banner(system: &SystemInfo, oc: &OcConfig, storage: Option<&StorageDevice>, palette: &Palette) -> String {
    let mut out = String::new();
    let rule = "─".repeat(62);
    let _ = writeln!(out);
    let _ = writeln!(out, "{}", palette.heading(format!("┌{}", rule)));
    let _ = writeln!(out, "{}  oc-stress v{}", palette.heading("│"), env!("CARGO_PKG_VERSION"));
    let _ = writeln!(out, "{}", palette.heading(format!("├{}", rule)));
    let _ = writeln!(out, "│  Model:          {}", system.model);
    let _ = writeln!(out, "│  CPU cores:      {}", system.cpu_cores);
    let _ = writeln!(out, "│  RAM:            {} MB", system.total_memory_mb);
    let _ = writeln!(out, "│  Kernel:         {}", system.kernel);
    if let Some(os) = &system.os {
        let _ = writeln!(out, "│  OS:             {}", os);
    }

    let _ = writeln!(out, "{}", palette.heading(format!("├{}", rule)));
    let label = if oc.is_overclocked() {
        palette.warn("overclocked")
    } else {
        palette.good("stock")
    };
    let _ = writeln!(out, "│  Firmware config: {}", label);
    let mhz = |v: Option<u32>| v.map_or_else(|| palette.dim("default"), |f| format!("{} MHz", f));
    let _ = writeln!(out, "│  arm_freq:       {}", mhz(oc.arm_freq));
    let _ = writeln!(out, "│  gpu_freq:       {}", mhz(oc.gpu_freq));
    if let Some(core) = oc.core_freq {
        let _ = writeln!(out, "│  core_freq:      {} MHz", core);
    }
    match oc.voltage_offset_mv() {
        Some(mv) => {
            let _ = writeln!(out, "│  Voltage offset: {:+.0} mV", mv);
        }
        None => {
            let _ = writeln!(out, "│  Voltage offset: {}", palette.dim("none"));
        }
    }
    if oc.force_turbo == Some(1) {
        let _ = writeln!(out, "│  force_turbo:    {}", palette.warn("on"));
    }
    if oc.pcie_enabled {
        let gen = oc.pcie_gen.map_or_else(|| "default".to_string(), |g| format!("Gen {}", g));
        let _ = writeln!(out, "│  PCIe:           enabled ({})", gen);
    }

    if let Some(device) = storage {
        let _ = writeln!(out, "{}", palette.heading(format!("├{}", rule)));
        let _ = writeln!(out, "│  Storage:        {} ({})", device.model, device.device_path);
        if let Some(gen) = device.pcie_gen {
            let _ = writeln!(out, "│  PCIe link:      Gen {}", gen);
        }
    }
    let _ = writeln!(out, "{}", palette.heading(format!("└{}", rule)));
    out
}

/// One line per snapshot for `--simple`
pub fn status_line(snapshot: &LiveSnapshot, palette: &Palette) -> String {
    let mut line = format!(
        "[{} / -{}] {:>3.0}%",
        format_clock(snapshot.elapsed),
        format_clock(snapshot.remaining),
        snapshot.progress * 100.0
    );

    match &snapshot.latest {
        Some(sample) => {
            let temp = sample
                .temperature_c
                .map_or_else(|| "--.-°C".to_string(), |t| format!("{:.1}°C", t));
            let _ = write!(line, " | {}", palette.health(snapshot.health, temp));
            if let Some(mhz) = sample.frequency_mhz {
                let _ = write!(line, " {} MHz", mhz);
            }
            if let Some(volts) = sample.voltage_v {
                let _ = write!(line, " {:.3} V", volts);
            }
            if let Some(mhz) = sample.gpu_frequency_mhz {
                let _ = write!(line, " GPU {} MHz", mhz);
            }
            if let Some(fan) = &sample.fan {
                let _ = write!(line, " fan {}", format_fan(fan));
            }
            if let Some(mem) = &sample.memory {
                let _ = write!(line, " mem {}/{} MB", mem.used_mb, mem.total_mb);
            }
        }
        None => line.push_str(" | waiting for telemetry"),
    }

    let current = snapshot.current_flags();
    if !current.is_empty() {
        let names: Vec<&str> = current.iter().map(|b| b.describe()).collect();
        let _ = write!(line, " | {}", palette.bad(names.join(", ")));
    }

    for (domain, live) in &snapshot.domains {
        let errors = live.progress.errors;
        let detail = match live.state {
            DomainState::Skipped => palette.dim("skipped"),
            _ if errors > 0 => palette.bad(format!("{} ops {} err", format_count(live.progress.operations), errors)),
            _ => format!("{} ops", format_count(live.progress.operations)),
        };
        let _ = write!(line, " | {} {}", domain.label(), detail);
    }

    if snapshot.counts.kernel_errors > 0 {
        let _ = write!(line, " | {}", palette.bad(format!("{} kernel err", snapshot.counts.kernel_errors)));
    }
    line
}

/// Prints a status line for every published snapshot until the session ends
pub async fn stream_lines(snapshots: watch::Receiver<LiveSnapshot>, palette: Palette) {
    let mut stream = WatchStream::from_changes(snapshots);
    while let Some(snapshot) = stream.next().await {
        println!("{}", status_line(&snapshot, &palette));
    }
}

pub fn render_report(report: &StabilityReport, palette: &Palette) -> String {
    let mut out = String::new();
    let rule = "═".repeat(62);
    let _ = writeln!(out);
    let _ = writeln!(out, "{}", palette.heading(&rule));
    let _ = writeln!(out, "  STABILITY REPORT    verdict: {}", palette.verdict(report.verdict));
    let _ = writeln!(out, "{}", palette.heading(&rule));
    let _ = writeln!(
        out,
        "  Duration:   {} of {} requested{}",
        format_clock(Duration::from_secs_f64(report.elapsed_secs)),
        format_clock(Duration::from_secs(report.requested_duration_secs)),
        match report.end {
            stress_core::SessionEnd::Completed => String::new(),
            stress_core::SessionEnd::Interrupted => palette.warn(" (interrupted)"),
        }
    );

    let _ = writeln!(out, "\n  {}", palette.heading("Workloads"));
    for (domain, status) in &report.domains {
        let line = match status {
            DomainStatus::Tested(result) => {
                let errors = if result.errors == 0 {
                    palette.good("0 errors")
                } else {
                    palette.bad(format!("{} errors", result.errors))
                };
                let mut line = format!("{} ops, {}", format_count(result.operations), errors);
                if let Some(bw) = result.peak_bandwidth_mbps {
                    let _ = write!(line, ", peak {:.0} MB/s", bw);
                }
                if let Some(reason) = &result.abnormal_reason {
                    let _ = write!(line, ", {}", palette.bad(format!("aborted: {}", reason)));
                }
                if result.shutdown_timed_out {
                    let _ = write!(line, ", {}", palette.dim("shutdown timed out"));
                }
                line
            }
            DomainStatus::NotTested => palette.dim("not tested"),
            DomainStatus::Skipped { reason } => palette.warn(format!("skipped ({})", reason)),
        };
        let _ = writeln!(out, "  {:<10}{}", domain.label(), line);
        if let DomainStatus::Tested(result) = status {
            for incident in result.incidents.iter().take(5) {
                let _ = writeln!(out, "            {}", palette.dim(incident.to_string()));
            }
        }
    }

    let _ = writeln!(out, "\n  {}", palette.heading("Telemetry"));
    match report.temperature_c {
        Some(t) => {
            let _ = writeln!(out, "  Temperature  max {:.1}°C  avg {:.1}°C", t.max, t.avg);
        }
        None => {
            let _ = writeln!(out, "  Temperature  {}", palette.dim("unavailable"));
        }
    }
    if let Some(f) = report.telemetry.frequency_mhz {
        let _ = writeln!(out, "  Frequency    min {:.0} MHz  avg {:.0} MHz", f.min, f.avg);
    }
    if let Some(v) = report.telemetry.voltage_v {
        let _ = writeln!(out, "  Core volts   min {:.4} V  max {:.4} V", v.min, v.max);
    }
    if let Some(t) = report.telemetry.storage_temperature_c {
        let _ = writeln!(out, "  Storage temp max {:.1}°C", t.max);
    }
    if let Some(f) = report.telemetry.gpu_frequency_mhz {
        let _ = writeln!(out, "  GPU clock    min {:.0} MHz  avg {:.0} MHz", f.min, f.avg);
    }
    if let Some(m) = report.telemetry.memory_used_mb {
        let _ = writeln!(out, "  Memory used  peak {:.0} MB", m.max);
    }

    let events = &report.events;
    let count = |n: u64| if n == 0 { palette.good("0") } else { palette.bad(n.to_string()) };
    let _ = writeln!(
        out,
        "  Events       throttling {}  under-voltage {}  I/O {}  kernel {}  SMART {}",
        count(events.throttling),
        count(events.under_voltage),
        count(events.io_errors),
        count(events.kernel_errors),
        if events.smart_warnings == 0 {
            palette.good("0")
        } else {
            palette.warn(events.smart_warnings.to_string())
        }
    );

    let flags = &report.historical_flags;
    let mut sticky = Vec::new();
    if flags.under_voltage_occurred {
        sticky.push("under-voltage");
    }
    if flags.frequency_capped_occurred {
        sticky.push("frequency capped");
    }
    if flags.throttled_occurred {
        sticky.push("throttled");
    }
    if flags.soft_temp_limit_occurred {
        sticky.push("soft temperature limit");
    }
    let sticky = if sticky.is_empty() {
        palette.good("none")
    } else {
        palette.warn(sticky.join(", "))
    };
    let _ = writeln!(out, "  Since boot   {} ({})", sticky, flags.raw);

    if !report.unavailable.is_empty() {
        let names: Vec<String> = report.unavailable.iter().map(|m| format!("{:?}", m)).collect();
        let _ = writeln!(out, "  Unavailable  {}", palette.dim(names.join(", ")));
    }

    if let Some(device) = &report.storage_device {
        let _ = writeln!(out, "\n  {}", palette.heading("Storage"));
        let _ = writeln!(out, "  Device       {} ({})", device.model, device.device_path);
        if let Some(smart) = &report.smart {
            let _ = writeln!(
                out,
                "  SMART        media errors {} -> {}, critical warning 0x{:02x} -> 0x{:02x}",
                smart.before.media_errors,
                smart.after.media_errors,
                smart.before.critical_warning,
                smart.after.critical_warning
            );
        }
    }

    if !report.failure_reasons.is_empty() {
        let _ = writeln!(out, "\n  {}", palette.heading("Failure reasons"));
        for reason in &report.failure_reasons {
            let _ = writeln!(out, "  • {}", palette.bad(reason.as_str()));
        }
    }
    let _ = writeln!(out, "{}", palette.heading(&rule));
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use std::collections::BTreeMap;
    use stress_core::observability::DomainLive;
    use stress_core::telemetry::{TelemetrySample, ThrottleFlags};
    use stress_core::workload::DomainProgress;
    use stress_core::Domain;

    #[test]
    fn test_format_clock() {
        assert_eq!(format_clock(Duration::from_secs(59)), "00:59");
        assert_eq!(format_clock(Duration::from_secs(3 * 60 + 5)), "03:05");
        assert_eq!(format_clock(Duration::from_secs(2 * 3600 + 30 * 60)), "02:30:00");
    }

    #[test]
    fn test_format_count() {
        assert_eq!(format_count(42), "42");
        assert_eq!(format_count(12_345), "12.3k");
        assert_eq!(format_count(25_000_000), "25.0M");
    }

    #[test]
    fn test_plain_palette_has_no_escapes() {
        let palette = Palette::new(false);
        assert_eq!(palette.bad("boom"), "boom");
        assert_eq!(palette.verdict(Verdict::Fail), "FAIL");
        assert!(Palette::new(true).bad("boom").contains('\u{1b}'));
    }

    #[test]
    fn test_status_line_shows_errors_and_flags() {
        let mut snapshot = LiveSnapshot::idle(Duration::from_secs(60));
        snapshot.elapsed = Duration::from_secs(30);
        snapshot.remaining = Duration::from_secs(30);
        snapshot.progress = 0.5;
        snapshot.latest = Some(TelemetrySample {
            temperature_c: Some(71.5),
            frequency_mhz: Some(2800),
            throttle: Some(ThrottleFlags(0x1)),
            ..TelemetrySample::empty(chrono::Utc::now())
        });
        snapshot.domains = BTreeMap::from([(
            Domain::Cpu,
            DomainLive {
                state: DomainState::Running,
                progress: DomainProgress {
                    errors: 2,
                    operations: 500,
                    bytes: 0,
                },
            },
        )]);

        let line = status_line(&snapshot, &Palette::new(false));
        assert!(line.starts_with("[00:30 / -00:30]  50%"));
        assert!(!line.contains("fan"));
        assert!(line.contains("71.5°C 2800 MHz"));
        assert!(line.contains("under-voltage detected"));
        assert!(line.contains("CPU 500 ops 2 err"));
    }

    #[test]
    fn test_status_line_shows_board_metrics() {
        let mut snapshot = LiveSnapshot::idle(Duration::from_secs(60));
        snapshot.latest = Some(TelemetrySample {
            temperature_c: Some(58.0),
            gpu_frequency_mhz: Some(910),
            fan: Some(FanStatus {
                speed_percent: Some(40),
                rpm: None,
            }),
            memory: Some(stress_core::telemetry::MemoryUsage {
                used_mb: 2048,
                total_mb: 8052,
            }),
            ..TelemetrySample::empty(chrono::Utc::now())
        });

        let line = status_line(&snapshot, &Palette::new(false));
        assert!(line.contains("GPU 910 MHz fan 40% mem 2048/8052 MB"));
    }

    #[test]
    fn test_format_fan() {
        let both = FanStatus {
            speed_percent: Some(40),
            rpm: Some(2900),
        };
        assert_eq!(format_fan(&both), "40% 2900 rpm");
        assert_eq!(format_fan(&FanStatus { rpm: None, ..both }), "40%");
        assert_eq!(format_fan(&FanStatus::default()), "--");
    }

    #[test]
    fn test_stream_ends_when_sender_drops() {
        let (tx, rx) = watch::channel(LiveSnapshot::idle(Duration::from_secs(10)));
        tx.send_replace(LiveSnapshot::idle(Duration::from_secs(9)));
        drop(tx);
        tokio_test::block_on(stream_lines(rx, Palette::new(false)));
    }

    proptest! {
        #[test]
        fn clock_fields_stay_in_range(secs in 0u64..400_000) {
            let text = format_clock(Duration::from_secs(secs));
            let fields: Vec<u64> = text.split(':').map(|f| f.parse().unwrap()).collect();
            prop_assert!(fields.len() == 2 || fields.len() == 3);
            // hours are unbounded, minutes and seconds are not
            prop_assert!(fields.iter().skip(usize::from(fields.len() == 3)).all(|f| *f < 60));
        }
    }
}
