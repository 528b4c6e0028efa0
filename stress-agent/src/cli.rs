// stress-agent/src/cli.rs
// Command line definition and conversion into session parameters

use clap::{value_parser, Arg, ArgAction, ArgGroup, ArgMatches, Command};
use std::path::PathBuf;
use std::time::Duration;
use stress_core::{parse_duration, Domain, OutputMode, Result, Scope, ScopeRequest, SessionConfig, StressTuning};

pub fn build_cli() -> Command {
    Command::new("oc-stress")
        .version(env!("CARGO_PKG_VERSION"))
        .about("Stability verification for overclocked single-board computers")
        .after_help(
            "NOTE: Run with sudo for full telemetry (kernel log, NVMe SMART).\n\nExample: sudo oc-stress --duration 1h --extended",
        )
        .arg(
            Arg::new("duration")
                .short('d')
                .long("duration")
                .value_name("DURATION")
                .help("Test duration, e.g. 30m, 1h, 2h30m")
                .default_value("30m"),
        )
        .arg(
            Arg::new("cpu-only")
                .short('c')
                .long("cpu-only")
                .help("Test only the CPU")
                .action(ArgAction::SetTrue),
        )
        .arg(
            Arg::new("memory-only")
                .short('m')
                .long("memory-only")
                .help("Test only memory")
                .action(ArgAction::SetTrue),
        )
        .arg(
            Arg::new("storage-only")
                .short('n')
                .long("storage-only")
                .visible_alias("nvme-only")
                .help("Test only storage")
                .action(ArgAction::SetTrue),
        )
        .arg(
            Arg::new("video-only")
                .long("video-only")
                .help("Test only the hardware video encoder")
                .action(ArgAction::SetTrue),
        )
        .group(
            ArgGroup::new("single-domain")
                .args(["cpu-only", "memory-only", "storage-only", "video-only"])
                .multiple(false),
        )
        .arg(
            Arg::new("extended")
                .short('e')
                .long("extended")
                .help("Add storage stress to the default CPU + memory run")
                .action(ArgAction::SetTrue),
        )
        .arg(
            Arg::new("video")
                .long("video")
                .help("Add hardware video encoder stress")
                .action(ArgAction::SetTrue),
        )
        .arg(
            Arg::new("threads")
                .short('t')
                .long("threads")
                .value_name("N")
                .help("CPU worker threads [default: all cores]")
                .value_parser(value_parser!(usize)),
        )
        .arg(
            Arg::new("interval")
                .short('i')
                .long("interval")
                .value_name("SECONDS")
                .help("Telemetry sample interval in seconds")
                .value_parser(value_parser!(u64))
                .default_value("2"),
        )
        .arg(
            Arg::new("simple")
                .long("simple")
                .help("Line-oriented status output instead of the dashboard")
                .action(ArgAction::SetTrue),
        )
        .arg(
            Arg::new("json")
                .long("json")
                .help("Print the final report as JSON")
                .action(ArgAction::SetTrue)
                .conflicts_with("simple"),
        )
        .arg(
            Arg::new("no-color")
                .long("no-color")
                .help("Disable colored output")
                .action(ArgAction::SetTrue),
        )
        .arg(
            Arg::new("nvme-path")
                .long("nvme-path")
                .value_name("PATH")
                .help("Directory or file for the storage scratch file")
                .value_parser(value_parser!(PathBuf)),
        )
        .arg(
            Arg::new("config")
                .long("config")
                .value_name("FILE")
                .help("Tuning file (TOML)")
                .value_parser(value_parser!(PathBuf)),
        )
        .arg(
            Arg::new("log-file")
                .long("log-file")
                .value_name("FILE")
                .help("Write logs to this file instead of stderr")
                .value_parser(value_parser!(PathBuf)),
        )
}

/// Parsed and checked command line
#[derive(Debug, Clone, PartialEq)]
pub struct CliOptions {
    pub duration: Duration,
    pub scope: ScopeRequest,
    pub threads: Option<usize>,
    pub interval: Duration,
    pub output: OutputMode,
    pub color: bool,
    pub nvme_path: Option<PathBuf>,
    pub config_path: Option<PathBuf>,
    pub log_file: Option<PathBuf>,
}

impl CliOptions {
    pub fn from_matches(matches: &ArgMatches) -> Result<Self> {
        let duration = parse_duration(
            matches
                .get_one::<String>("duration")
                .map(String::as_str)
                .unwrap_or("30m"),
        )?;

        let only = [
            ("cpu-only", Domain::Cpu),
            ("memory-only", Domain::Memory),
            ("storage-only", Domain::Storage),
            ("video-only", Domain::Video),
        ]
        .into_iter()
        .find(|(flag, _)| matches.get_flag(flag))
        .map(|(_, domain)| domain);

        let output = if matches.get_flag("json") {
            OutputMode::Json
        } else if matches.get_flag("simple") {
            OutputMode::Simple
        } else {
            OutputMode::Interactive
        };

        Ok(Self {
            duration,
            scope: ScopeRequest {
                only,
                extended: matches.get_flag("extended"),
                video: matches.get_flag("video"),
            },
            threads: matches.get_one::<usize>("threads").copied(),
            interval: Duration::from_secs(matches.get_one::<u64>("interval").copied().unwrap_or(2)),
            output,
            color: !matches.get_flag("no-color") && output != OutputMode::Json,
            nvme_path: matches.get_one::<PathBuf>("nvme-path").cloned(),
            config_path: matches.get_one::<PathBuf>("config").cloned(),
            log_file: matches.get_one::<PathBuf>("log-file").cloned(),
        })
    }

    pub fn session_config(&self, tuning: StressTuning) -> SessionConfig {
        let mut config = SessionConfig::new(self.duration, Scope::resolve(&self.scope));
        if let Some(threads) = self.threads {
            config.threads = threads;
        }
        config.sample_interval = self.interval;
        config.output = self.output;
        config.storage_path = self.nvme_path.clone();
        config.tuning = tuning;
        config
    }
}
