// stress-core/src/telemetry/kernel_log.rs
// Kernel log classification and the dmesg-backed log source

use regex::RegexSet;
use std::collections::BTreeSet;
use tracing::{debug, info};

use super::probe::{run_tool, KernelLogSource, TOOL_TIMEOUT};
use super::KernelLine;
use crate::error::*;
use crate::events::LogClass;
use crate::stress_error;
use crate::tuning::KernelLogTuning;

/// Matches kernel lines against the error and I/O pattern sets
#[derive(Debug, Clone)]
pub struct LogClassifier {
    errors: RegexSet,
    io: RegexSet,
}

impl LogClassifier {
    pub fn new(tuning: &KernelLogTuning) -> Result<Self> {
        let errors = compile(&tuning.error_patterns, "kernel_log.error_patterns")?;
        let io = compile(&tuning.io_patterns, "kernel_log.io_patterns")?;
        info!(
            "Kernel log classifier initialized with {} error / {} I/O patterns",
            errors.len(),
            io.len()
        );
        Ok(Self { errors, io })
    }

    /// `None` when the line is not an error
    pub fn classify(&self, line: &str) -> Option<KernelLine> {
        let is_io = self.io.is_match(line);
        if !is_io && !self.errors.is_match(line) {
            return None;
        }
        Some(KernelLine {
            class: if is_io { LogClass::Io } else { LogClass::Other },
            line: line.trim().to_string(),
        })
    }
}

impl Default for LogClassifier {
    fn default() -> Self {
        let tuning = KernelLogTuning::default();
        Self {
            errors: compile(&tuning.error_patterns, "error_patterns").unwrap_or_else(|_| RegexSet::empty()),
            io: compile(&tuning.io_patterns, "io_patterns").unwrap_or_else(|_| RegexSet::empty()),
        }
    }
}

fn compile(patterns: &[String], field: &str) -> Result<RegexSet> {
    RegexSet::new(patterns.iter().map(|p| format!("(?i){}", p)))
        .map_err(|e| stress_error!(config, field, format!("invalid pattern: {}", e)))
}

/// Position in the kernel ring buffer.
///
/// Timestamped lines are compared by their `[seconds.micros]` prefix. Lines
/// sharing the newest timestamp are remembered verbatim, so one printed later
/// in the same microsecond is still returned. Lines without a prefix (printk
/// time disabled) fall back to counting.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct LogCursor {
    last_timestamp: Option<f64>,
    at_last_timestamp: BTreeSet<String>,
    untimestamped_seen: usize,
}

impl LogCursor {
    /// Return the lines of `output` after the cursor and advance it
    pub fn advance<'a>(&mut self, output: &'a str) -> Vec<&'a str> {
        let mut fresh = Vec::new();
        let mut untimestamped = 0usize;
        let mut newest = self.last_timestamp;
        let seen_at_last = std::mem::take(&mut self.at_last_timestamp);
        let mut at_newest = seen_at_last.clone();

        for line in output.lines().filter(|l| !l.trim().is_empty()) {
            match kernel_timestamp(line) {
                Some(ts) => {
                    let unseen = match self.last_timestamp {
                        None => true,
                        Some(last) if ts > last => true,
                        Some(last) if ts == last => !seen_at_last.contains(line),
                        Some(_) => false,
                    };
                    if unseen {
                        fresh.push(line);
                    }
                    match newest {
                        Some(n) if ts < n => {}
                        Some(n) if ts == n => {
                            at_newest.insert(line.to_string());
                        }
                        _ => {
                            newest = Some(ts);
                            at_newest.clear();
                            at_newest.insert(line.to_string());
                        }
                    }
                }
                None => {
                    untimestamped += 1;
                    if untimestamped > self.untimestamped_seen {
                        fresh.push(line);
                    }
                }
            }
        }

        self.last_timestamp = newest;
        self.at_last_timestamp = at_newest;
        self.untimestamped_seen = self.untimestamped_seen.max(untimestamped);
        fresh
    }
}

/// Parse the `[ 1234.567890]` prefix of a dmesg line
pub fn kernel_timestamp(line: &str) -> Option<f64> {
    let rest = line.trim_start().strip_prefix('[')?;
    let end = rest.find(']')?;
    rest[..end].trim().parse().ok()
}

/// Reads `dmesg --level=err,warn` and returns only lines past the cursor
pub struct DmesgLogSource {
    cursor: LogCursor,
}

impl DmesgLogSource {
    /// Reads the ring buffer once so lines logged before the session are skipped
    pub fn open() -> Result<Self> {
        let mut cursor = LogCursor::default();
        let output = read_dmesg()?;
        let skipped = cursor.advance(&output).len();
        debug!("Kernel log cursor initialized past {} existing lines", skipped);
        Ok(Self { cursor })
    }
}

impl KernelLogSource for DmesgLogSource {
    fn read_new(&mut self) -> Result<Vec<String>> {
        let output = read_dmesg()?;
        Ok(self
            .cursor
            .advance(&output)
            .into_iter()
            .map(str::to_string)
            .collect())
    }
}

fn read_dmesg() -> Result<String> {
    run_tool("dmesg", &["--level=err,warn"], TOOL_TIMEOUT)
}
