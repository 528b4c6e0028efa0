// stress-agent/src/main.rs
// oc-stress - stability verification for overclocked single-board computers

use anyhow::{Context, Result};
use std::fs::OpenOptions;
use std::io::IsTerminal;
use std::path::Path;
use std::process::ExitCode;
use std::sync::Mutex;
use stress_core::system::{OcConfig, SystemInfo};
use stress_core::telemetry::nvme::{StorageTopology, SysfsTopology};
use stress_core::{validate_session, Collaborators, Orchestrator, OutputMode, SystemConstraints};
use tokio::signal;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

mod cli;
mod config;
mod dashboard;
mod display;

use cli::{build_cli, CliOptions};
use config::load_tuning;
use display::Palette;

/// Configuration and environment failures
const EXIT_CONFIG: u8 = 2;

#[tokio::main]
async fn main() -> ExitCode {
    match run().await {
        Ok(code) => code,
        Err(e) => {
            error!("{:#}", e);
            eprintln!("Error: {:#}", e);
            ExitCode::from(EXIT_CONFIG)
        }
    }
}

async fn run() -> Result<ExitCode> {
    let matches = build_cli().get_matches();
    let mut options = CliOptions::from_matches(&matches)?;

    if options.output == OutputMode::Interactive && !std::io::stdout().is_terminal() {
        options.output = OutputMode::Simple;
    }
    if std::env::var_os("NO_COLOR").is_some() {
        options.color = false;
    }

    init_logging(&options)?;
    info!("🚀 oc-stress v{} starting", env!("CARGO_PKG_VERSION"));

    let tuning = load_tuning(options.config_path.as_deref())?;
    let config = options.session_config(tuning);
    let validation = validate_session(&config, SystemConstraints::detect()).context("invalid session")?;
    for issue in validation.warnings() {
        warn!("{}: {}", issue.field, issue.message);
    }

    let palette = Palette::new(options.color);
    if config.output != OutputMode::Json {
        let storage = SysfsTopology::new().detect();
        print!(
            "{}",
            display::banner(&SystemInfo::collect(), &OcConfig::load(), storage.as_ref(), &palette)
        );
        println!(
            "  Testing {} for {}\n",
            config
                .scope
                .domains()
                .map(|d| d.label())
                .collect::<Vec<_>>()
                .join(" + "),
            display::format_clock(config.duration)
        );
    }

    let output = config.output;
    let thresholds = config.tuning.display.clone();
    let orchestrator = Orchestrator::new(config, Collaborators::system());
    let interrupt = orchestrator.interrupt_token();
    let snapshots = orchestrator.subscribe();
    let done = CancellationToken::new();

    let signals = {
        let interrupt = interrupt.clone();
        tokio::spawn(async move {
            while signal::ctrl_c().await.is_ok() {
                info!("🛑 Interrupt received, stopping workloads");
                interrupt.cancel();
            }
        })
    };

    let renderer: Option<JoinHandle<()>> = match output {
        OutputMode::Interactive => {
            let (interrupt, done) = (interrupt.clone(), done.clone());
            Some(tokio::task::spawn_blocking(move || {
                if let Err(e) = dashboard::run(snapshots, thresholds, interrupt, done) {
                    error!("Dashboard failed: {}", e);
                }
            }))
        }
        OutputMode::Simple => Some(tokio::spawn(display::stream_lines(snapshots, palette))),
        OutputMode::Json => None,
    };

    let outcome = orchestrator.run().await;
    done.cancel();
    signals.abort();
    if let Some(renderer) = renderer {
        if let Err(e) = renderer.await {
            warn!("Renderer task ended abnormally: {}", e);
        }
    }
    let report = outcome?;

    match output {
        OutputMode::Json => println!("{}", report.to_json()?),
        _ => print!("{}", display::render_report(&report, &palette)),
    }
    info!("✅ Session finished: {}", report.verdict);

    Ok(ExitCode::from(report.exit_code() as u8))
}

/// stderr by default; a file when `--log-file` is given or the dashboard owns the terminal
fn init_logging(options: &CliOptions) -> Result<()> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let path = options.log_file.clone().or_else(|| {
        (options.output == OutputMode::Interactive).then(|| std::env::temp_dir().join("oc-stress.log"))
    });

    let builder = tracing_subscriber::fmt().with_env_filter(filter).with_target(false);
    match path {
        Some(path) => {
            let file = open_log(&path)?;
            builder.with_ansi(false).with_writer(Mutex::new(file)).init();
        }
        None => builder.with_writer(std::io::stderr).init(),
    }
    Ok(())
}

fn open_log(path: &Path) -> Result<std::fs::File> {
    OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .with_context(|| format!("cannot open log file {}", path.display()))
}
