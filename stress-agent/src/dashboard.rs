// stress-agent/src/dashboard.rs
// Full-screen terminal dashboard fed by the live snapshot channel

use std::collections::VecDeque;
use std::io::{self, Stdout};
use std::time::Duration;

use crossterm::{
    event::{self, Event, KeyCode, KeyEventKind, KeyModifiers},
    execute,
    terminal::{disable_raw_mode, enable_raw_mode, EnterAlternateScreen, LeaveAlternateScreen},
};
use ratatui::{
    prelude::*,
    widgets::{Block, Borders, Gauge, Paragraph, Sparkline},
};
use stress_core::observability::DomainState;
use stress_core::tuning::DisplayThresholds;
use stress_core::{HealthStatus, LiveSnapshot};
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::info;

use crate::display::{format_clock, format_count, format_fan};

const HISTORY: usize = 120;

struct DashboardState {
    temperatures: VecDeque<u64>,
    last_sample: Option<chrono::DateTime<chrono::Utc>>,
    stopping: bool,
    thresholds: DisplayThresholds,
}

impl DashboardState {
    fn new(thresholds: DisplayThresholds) -> Self {
        Self {
            temperatures: VecDeque::with_capacity(HISTORY),
            last_sample: None,
            stopping: false,
            thresholds,
        }
    }

    /// Appends the temperature once per new sample, not once per frame
    fn observe(&mut self, snapshot: &LiveSnapshot) {
        let Some(sample) = &snapshot.latest else {
            return;
        };
        if self.last_sample == Some(sample.timestamp) {
            return;
        }
        self.last_sample = Some(sample.timestamp);
        if let Some(t) = sample.temperature_c {
            if self.temperatures.len() == HISTORY {
                self.temperatures.pop_front();
            }
            self.temperatures.push_back(t.max(0.0).round() as u64);
        }
    }

    fn temperature_color(&self, celsius: f32) -> Color {
        if celsius >= self.thresholds.critical_temp_c {
            Color::Red
        } else if celsius >= self.thresholds.warning_temp_c {
            Color::LightRed
        } else if celsius >= self.thresholds.warm_temp_c {
            Color::Yellow
        } else {
            Color::Green
        }
    }
}

fn health_color(status: HealthStatus) -> Color {
    match status {
        HealthStatus::Critical => Color::Red,
        HealthStatus::Warning => Color::LightRed,
        HealthStatus::Warm => Color::Yellow,
        HealthStatus::Healthy => Color::Green,
        HealthStatus::Unknown => Color::Gray,
    }
}

/// Blocks until `done` is cancelled. q, Esc or Ctrl+C request a graceful stop
/// through `interrupt`; the session keeps rendering until it has wound down.
pub fn run(
    snapshots: watch::Receiver<LiveSnapshot>,
    thresholds: DisplayThresholds,
    interrupt: CancellationToken,
    done: CancellationToken,
) -> io::Result<()> {
    enable_raw_mode()?;
    let mut stdout = io::stdout();
    execute!(stdout, EnterAlternateScreen)?;
    let backend = CrosstermBackend::new(stdout);
    let mut terminal = Terminal::new(backend)?;

    let result = event_loop(&mut terminal, snapshots, thresholds, &interrupt, &done);

    disable_raw_mode()?;
    execute!(terminal.backend_mut(), LeaveAlternateScreen)?;
    terminal.show_cursor()?;
    result
}

fn event_loop(
    terminal: &mut Terminal<CrosstermBackend<Stdout>>,
    snapshots: watch::Receiver<LiveSnapshot>,
    thresholds: DisplayThresholds,
    interrupt: &CancellationToken,
    done: &CancellationToken,
) -> io::Result<()> {
    let mut state = DashboardState::new(thresholds);

    while !done.is_cancelled() {
        let snapshot = snapshots.borrow().clone();
        state.observe(&snapshot);
        terminal.draw(|f| ui(f, &snapshot, &state))?;

        if event::poll(Duration::from_millis(100))? {
            if let Event::Key(key) = event::read()? {
                if key.kind != KeyEventKind::Press {
                    continue;
                }
                let ctrl_c = key.code == KeyCode::Char('c') && key.modifiers.contains(KeyModifiers::CONTROL);
                if matches!(key.code, KeyCode::Char('q') | KeyCode::Esc) || ctrl_c {
                    if !state.stopping {
                        info!("Stop requested from dashboard");
                    }
                    state.stopping = true;
                    interrupt.cancel();
                }
            }
        }
    }
    Ok(())
}

fn ui(f: &mut Frame, snapshot: &LiveSnapshot, state: &DashboardState) {
    let area = f.area();

    let rows = Layout::default()
        .direction(Direction::Vertical)
        .constraints([
            Constraint::Length(3),
            Constraint::Min(8),
            Constraint::Length(3),
            Constraint::Length(3),
        ])
        .split(area);

    let columns = Layout::default()
        .direction(Direction::Horizontal)
        .constraints([Constraint::Percentage(55), Constraint::Percentage(45)])
        .split(rows[1]);

    // progress
    let ratio = snapshot.progress.clamp(0.0, 1.0);
    let gauge = Gauge::default()
        .block(
            Block::default()
                .borders(Borders::ALL)
                .border_style(Style::default().fg(Color::Cyan))
                .title(" oc-stress "),
        )
        .gauge_style(Style::default().fg(Color::Cyan).bg(Color::DarkGray))
        .ratio(ratio)
        .label(format!(
            "{} elapsed, {} remaining ({:.0}%)",
            format_clock(snapshot.elapsed),
            format_clock(snapshot.remaining),
            ratio * 100.0
        ));
    f.render_widget(gauge, rows[0]);

    render_telemetry(f, columns[0], snapshot, state);
    render_domains(f, columns[1], snapshot);

    // events
    let counts = snapshot.counts;
    let count_span = |label: &'static str, n: u64| {
        let color = if n == 0 { Color::Green } else { Color::Red };
        vec![
            Span::raw(format!("  {}: ", label)),
            Span::styled(n.to_string(), Style::default().fg(color).bold()),
        ]
    };
    let mut spans = Vec::new();
    spans.extend(count_span("Throttle events", counts.throttling));
    spans.extend(count_span("Under-voltage", counts.under_voltage));
    spans.extend(count_span("I/O errors", counts.io_errors));
    spans.extend(count_span("Kernel errors", counts.kernel_errors));
    spans.extend(count_span("Workload errors", snapshot.total_errors()));
    let events = Paragraph::new(Line::from(spans)).block(
        Block::default()
            .borders(Borders::ALL)
            .border_style(Style::default().fg(Color::Magenta))
            .title(" Events "),
    );
    f.render_widget(events, rows[2]);

    // status and controls
    let (status, color) = if state.stopping {
        ("Stopping, waiting for workloads".to_string(), Color::Yellow)
    } else {
        (format!("● {}", snapshot.health.label()), health_color(snapshot.health))
    };
    let controls = Paragraph::new(Line::from(vec![
        Span::styled(status, Style::default().fg(color).bold()),
        Span::raw("   "),
        Span::styled("[q]", Style::default().fg(Color::Cyan)),
        Span::raw(" Stop"),
    ]))
    .block(
        Block::default()
            .borders(Borders::ALL)
            .border_style(Style::default().fg(Color::DarkGray))
            .title(" Status "),
    );
    f.render_widget(controls, rows[3]);
}

fn render_telemetry(f: &mut Frame, area: Rect, snapshot: &LiveSnapshot, state: &DashboardState) {
    let block = Block::default()
        .borders(Borders::ALL)
        .border_style(Style::default().fg(Color::Cyan))
        .title(" Telemetry ");
    let inner = block.inner(area);
    f.render_widget(block, area);

    let parts = Layout::default()
        .direction(Direction::Vertical)
        .constraints([Constraint::Length(8), Constraint::Min(2)])
        .split(inner);

    let unavailable = || Span::styled("n/a", Style::default().fg(Color::DarkGray));
    let latest = snapshot.latest.as_ref();

    let temperature = match latest.and_then(|s| s.temperature_c) {
        Some(t) => Span::styled(format!("{:.1}°C", t), Style::default().fg(state.temperature_color(t)).bold()),
        None => unavailable(),
    };
    let peak = snapshot
        .temperature_c
        .map(|s| format!("   max {:.1}°C  avg {:.1}°C", s.max, s.avg))
        .unwrap_or_default();
    let frequency = match latest.and_then(|s| s.frequency_mhz) {
        Some(mhz) => Span::raw(format!("{} MHz", mhz)),
        None => unavailable(),
    };
    let governor = latest
        .and_then(|s| s.governor.as_deref())
        .map(|g| format!("  ({})", g))
        .unwrap_or_default();
    let gpu = match latest.and_then(|s| s.gpu_frequency_mhz) {
        Some(mhz) => Span::raw(format!("{} MHz", mhz)),
        None => unavailable(),
    };
    let fan = match latest.and_then(|s| s.fan) {
        Some(fan) => Span::raw(format_fan(&fan)),
        None => unavailable(),
    };
    let memory = match latest.and_then(|s| s.memory) {
        Some(m) => Span::raw(format!("{} / {} MB", m.used_mb, m.total_mb)),
        None => unavailable(),
    };
    let voltage = match latest.and_then(|s| s.voltage_v) {
        Some(v) => Span::raw(format!("{:.4} V", v)),
        None => unavailable(),
    };
    let storage = match latest.and_then(|s| s.storage_temperature_c) {
        Some(t) => Span::raw(format!("{:.1}°C", t)),
        None => unavailable(),
    };

    let current = snapshot.current_flags();
    let throttle = if current.is_empty() {
        Span::styled("OK", Style::default().fg(Color::Green))
    } else {
        let names: Vec<&str> = current.iter().map(|b| b.describe()).collect();
        Span::styled(names.join(", "), Style::default().fg(Color::Red).bold())
    };

    let lines = vec![
        Line::from(vec![Span::raw("  SoC temp:   "), temperature, Span::raw(peak)]),
        Line::from(vec![Span::raw("  ARM clock:  "), frequency, Span::raw(governor)]),
        Line::from(vec![Span::raw("  GPU clock:  "), gpu]),
        Line::from(vec![Span::raw("  Core volts: "), voltage]),
        Line::from(vec![Span::raw("  NVMe temp:  "), storage]),
        Line::from(vec![Span::raw("  Fan:        "), fan]),
        Line::from(vec![Span::raw("  Memory:     "), memory]),
        Line::from(vec![Span::raw("  Throttle:   "), throttle]),
    ];
    f.render_widget(Paragraph::new(lines), parts[0]);

    let data: Vec<u64> = state.temperatures.iter().copied().collect();
    let sparkline = Sparkline::default()
        .block(Block::default().title(" Temperature history "))
        .data(&data)
        .style(Style::default().fg(Color::Yellow));
    f.render_widget(sparkline, parts[1]);
}

fn render_domains(f: &mut Frame, area: Rect, snapshot: &LiveSnapshot) {
    let mut lines = vec![Line::from("")];
    for (domain, live) in &snapshot.domains {
        let (state, color) = match live.state {
            DomainState::Running => ("running", Color::Green),
            DomainState::Stopping => ("stopping", Color::Yellow),
            DomainState::Finished => ("finished", Color::Cyan),
            DomainState::Skipped => ("skipped", Color::DarkGray),
        };
        let errors = live.progress.errors;
        let error_style = if errors == 0 {
            Style::default().fg(Color::Green)
        } else {
            Style::default().fg(Color::Red).bold()
        };
        lines.push(Line::from(vec![
            Span::styled(format!("  {:<9}", domain.label()), Style::default().bold()),
            Span::styled(format!("{:<10}", state), Style::default().fg(color)),
            Span::raw(format!("{:>8} ops  ", format_count(live.progress.operations))),
            Span::styled(format!("{} errors", errors), error_style),
        ]));
    }
    if snapshot.domains.is_empty() {
        lines.push(Line::from(Span::styled("  starting...", Style::default().fg(Color::DarkGray))));
    }

    let panel = Paragraph::new(lines).block(
        Block::default()
            .borders(Borders::ALL)
            .border_style(Style::default().fg(Color::Green))
            .title(" Workloads "),
    );
    f.render_widget(panel, area);
}

#[cfg(test)]
mod tests {
    use super::*;
    use ratatui::backend::TestBackend;
    use std::collections::BTreeMap;
    use stress_core::observability::DomainLive;
    use stress_core::telemetry::{FanStatus, MemoryUsage, TelemetrySample};
    use stress_core::workload::DomainProgress;
    use stress_core::Domain;

    fn screen_text(snapshot: &LiveSnapshot, state: &DashboardState) -> String {
        let mut terminal = Terminal::new(TestBackend::new(100, 24)).unwrap();
        terminal.draw(|f| ui(f, snapshot, state)).unwrap();
        terminal
            .backend()
            .buffer()
            .content
            .iter()
            .map(|cell| cell.symbol())
            .collect()
    }

    #[test]
    fn test_renders_domains_and_temperature() {
        let mut snapshot = LiveSnapshot::idle(Duration::from_secs(120));
        snapshot.latest = Some(TelemetrySample {
            temperature_c: Some(64.2),
            ..TelemetrySample::empty(chrono::Utc::now())
        });
        snapshot.domains = BTreeMap::from([(
            Domain::Memory,
            DomainLive {
                state: DomainState::Running,
                progress: DomainProgress {
                    errors: 3,
                    operations: 12,
                    bytes: 0,
                },
            },
        )]);
        let state = DashboardState::new(DisplayThresholds::default());

        let text = screen_text(&snapshot, &state);
        assert!(text.contains("Memory"));
        assert!(text.contains("3 errors"));
        assert!(text.contains("64.2°C"));
        assert!(text.contains("n/a"));
    }

    #[test]
    fn test_renders_board_metrics() {
        let mut snapshot = LiveSnapshot::idle(Duration::from_secs(120));
        snapshot.latest = Some(TelemetrySample {
            frequency_mhz: Some(2800),
            governor: Some("performance".to_string()),
            gpu_frequency_mhz: Some(910),
            fan: Some(FanStatus {
                speed_percent: Some(75),
                rpm: Some(5200),
            }),
            memory: Some(MemoryUsage {
                used_mb: 3100,
                total_mb: 8052,
            }),
            ..TelemetrySample::empty(chrono::Utc::now())
        });
        let state = DashboardState::new(DisplayThresholds::default());

        let text = screen_text(&snapshot, &state);
        assert!(text.contains("2800 MHz  (performance)"));
        assert!(text.contains("910 MHz"));
        assert!(text.contains("75% 5200 rpm"));
        assert!(text.contains("3100 / 8052 MB"));
    }

    #[test]
    fn test_history_grows_once_per_sample() {
        let mut state = DashboardState::new(DisplayThresholds::default());
        let mut snapshot = LiveSnapshot::idle(Duration::from_secs(60));
        snapshot.latest = Some(TelemetrySample {
            temperature_c: Some(50.0),
            ..TelemetrySample::empty(chrono::Utc::now())
        });

        state.observe(&snapshot);
        state.observe(&snapshot);
        assert_eq!(state.temperatures.len(), 1);

        snapshot.latest = Some(TelemetrySample {
            temperature_c: Some(51.0),
            ..TelemetrySample::empty(chrono::Utc::now() + chrono::Duration::seconds(2))
        });
        state.observe(&snapshot);
        assert_eq!(state.temperatures, VecDeque::from([50, 51]));
    }

    #[test]
    fn test_temperature_bands() {
        let state = DashboardState::new(DisplayThresholds::default());
        assert_eq!(state.temperature_color(60.0), Color::Green);
        assert_eq!(state.temperature_color(72.0), Color::Yellow);
        assert_eq!(state.temperature_color(82.0), Color::LightRed);
        assert_eq!(state.temperature_color(90.0), Color::Red);
    }
}
