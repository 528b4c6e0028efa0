// stress-core/src/config_validation.rs
// Session parameter and tunable validation against detected system constraints

use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::error::*;
use crate::session::SessionConfig;
use crate::system::read_meminfo;
use crate::workload::cpu::known_prime_count;
use crate::Domain;

const MIB: u64 = 1024 * 1024;

/// Validator with a fixed table of severity-graded rules
pub struct SessionValidator {
    system_constraints: SystemConstraints,
    validation_rules: Vec<ValidationRule>,
}

/// System resource constraints detected at runtime
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SystemConstraints {
    pub total_memory_mb: u64,
    pub available_memory_mb: u64,
    pub cpu_cores: usize,
}

impl SystemConstraints {
    /// Reads /proc/meminfo; unreadable values are left at zero and the
    /// memory rules skip themselves.
    pub fn detect() -> Self {
        Self {
            total_memory_mb: read_meminfo("MemTotal").map(|b| b / MIB).unwrap_or(0),
            available_memory_mb: read_meminfo("MemAvailable").map(|b| b / MIB).unwrap_or(0),
            cpu_cores: num_cpus::get(),
        }
    }
}

/// Configuration validation rule
#[derive(Debug, Clone)]
pub struct ValidationRule {
    pub name: &'static str,
    pub field: &'static str,
    pub validator: fn(&SessionConfig, &SystemConstraints) -> ValidationResult,
    pub severity: ValidationSeverity,
}

#[derive(Debug, Clone, PartialEq)]
pub enum ValidationResult {
    Valid,
    Invalid(String),
}

/// Validation severity levels
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub enum ValidationSeverity {
    Info,
    Warning,
    Error,
    Critical,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ValidationIssue {
    pub rule_name: String,
    pub field: String,
    pub severity: ValidationSeverity,
    pub message: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ValidationReport {
    pub is_valid: bool,
    pub issues: Vec<ValidationIssue>,
}

impl ValidationReport {
    pub fn warnings(&self) -> impl Iterator<Item = &ValidationIssue> {
        self.issues.iter().filter(|i| i.severity < ValidationSeverity::Error)
    }

    /// First blocking issue as a configuration error
    pub fn into_result(self) -> Result<()> {
        match self
            .issues
            .into_iter()
            .filter(|i| i.severity >= ValidationSeverity::Error)
            .max_by_key(|i| i.severity)
        {
            Some(issue) => Err(StressError::Configuration {
                field: issue.field,
                message: issue.message,
            }),
            None => Ok(()),
        }
    }
}

impl SessionValidator {
    pub fn new(system_constraints: SystemConstraints) -> Self {
        let validation_rules = Self::create_validation_rules();
        debug!(
            "Session validator with {} rules, constraints {:?}",
            validation_rules.len(),
            system_constraints
        );
        Self {
            system_constraints,
            validation_rules,
        }
    }

    pub fn detect() -> Self {
        Self::new(SystemConstraints::detect())
    }

    pub fn constraints(&self) -> &SystemConstraints {
        &self.system_constraints
    }

    pub fn validate(&self, config: &SessionConfig) -> ValidationReport {
        let issues: Vec<ValidationIssue> = self
            .validation_rules
            .iter()
            .filter_map(|rule| match (rule.validator)(config, &self.system_constraints) {
                ValidationResult::Valid => None,
                ValidationResult::Invalid(message) => Some(ValidationIssue {
                    rule_name: rule.name.to_string(),
                    field: rule.field.to_string(),
                    severity: rule.severity,
                    message,
                }),
            })
            .collect();

        for issue in &issues {
            match issue.severity {
                ValidationSeverity::Info => info!("{}: {}", issue.field, issue.message),
                ValidationSeverity::Warning => warn!("⚠️  {}: {}", issue.field, issue.message),
                _ => {}
            }
        }

        ValidationReport {
            is_valid: issues.iter().all(|i| i.severity < ValidationSeverity::Error),
            issues,
        }
    }

    fn create_validation_rules() -> Vec<ValidationRule> {
        vec![
            ValidationRule {
                name: "thread_count_bounds",
                field: "threads",
                validator: |config, constraints| {
                    let max = constraints.cpu_cores.max(1) * 4;
                    if config.threads == 0 {
                        ValidationResult::Invalid("thread count must be at least 1".to_string())
                    } else if config.threads > max {
                        ValidationResult::Invalid(format!(
                            "{} threads on {} cores oversubscribes the CPU (maximum {})",
                            config.threads, constraints.cpu_cores, max
                        ))
                    } else {
                        ValidationResult::Valid
                    }
                },
                severity: ValidationSeverity::Error,
            },
            ValidationRule {
                name: "threads_below_cores",
                field: "threads",
                validator: |config, constraints| {
                    if config.threads > 0 && config.threads < constraints.cpu_cores {
                        ValidationResult::Invalid(format!(
                            "{} threads leave {} core(s) unstressed",
                            config.threads,
                            constraints.cpu_cores - config.threads
                        ))
                    } else {
                        ValidationResult::Valid
                    }
                },
                severity: ValidationSeverity::Info,
            },
            ValidationRule {
                name: "sample_interval_positive",
                field: "interval",
                validator: |config, _| {
                    if config.sample_interval.is_zero() {
                        ValidationResult::Invalid("sample interval must be greater than zero".to_string())
                    } else {
                        ValidationResult::Valid
                    }
                },
                severity: ValidationSeverity::Error,
            },
            ValidationRule {
                name: "sample_interval_within_duration",
                field: "interval",
                validator: |config, _| {
                    if config.sample_interval >= config.duration {
                        ValidationResult::Invalid(format!(
                            "sample interval {:?} is not shorter than the session ({:?}); only start and end samples will be taken",
                            config.sample_interval, config.duration
                        ))
                    } else {
                        ValidationResult::Valid
                    }
                },
                severity: ValidationSeverity::Warning,
            },
            ValidationRule {
                name: "fft_power_of_two",
                field: "cpu.fft_size",
                validator: |config, _| {
                    let size = config.tuning.cpu.fft_size;
                    if size < 2 || !size.is_power_of_two() {
                        ValidationResult::Invalid(format!(
                            "FFT size {} is not a power of two (try {})",
                            size,
                            size.max(2).next_power_of_two()
                        ))
                    } else {
                        ValidationResult::Valid
                    }
                },
                severity: ValidationSeverity::Error,
            },
            ValidationRule {
                name: "prime_limit_known",
                field: "cpu.prime_limit",
                validator: |config, _| match known_prime_count(config.tuning.cpu.prime_limit) {
                    Some(_) => ValidationResult::Valid,
                    None => ValidationResult::Invalid(format!(
                        "prime limit {} has no reference count (use 1000, 10000, 100000 or 1000000)",
                        config.tuning.cpu.prime_limit
                    )),
                },
                severity: ValidationSeverity::Error,
            },
            ValidationRule {
                name: "epsilon_range",
                field: "cpu",
                validator: |config, _| {
                    let cpu = &config.tuning.cpu;
                    let in_range = |e: f64| e > 0.0 && e <= 1e-3;
                    if !in_range(cpu.fft_epsilon) || !in_range(cpu.matrix_epsilon) {
                        ValidationResult::Invalid(format!(
                            "tolerances must lie in (0, 1e-3], got fft {} matrix {}",
                            cpu.fft_epsilon, cpu.matrix_epsilon
                        ))
                    } else {
                        ValidationResult::Valid
                    }
                },
                severity: ValidationSeverity::Error,
            },
            ValidationRule {
                name: "cpu_sizes_nonzero",
                field: "cpu",
                validator: |config, _| {
                    let cpu = &config.tuning.cpu;
                    if cpu.matrix_size == 0 || cpu.cipher_blocks == 0 {
                        ValidationResult::Invalid("matrix_size and cipher_blocks must be non-zero".to_string())
                    } else {
                        ValidationResult::Valid
                    }
                },
                severity: ValidationSeverity::Error,
            },
            ValidationRule {
                name: "memory_fraction",
                field: "memory.fraction",
                validator: |config, _| {
                    let fraction = config.tuning.memory.fraction;
                    if !config.scope.contains(Domain::Memory) || (fraction > 0.0 && fraction <= 0.9) {
                        ValidationResult::Valid
                    } else {
                        ValidationResult::Invalid(format!("fraction {} must lie in (0, 0.9]", fraction))
                    }
                },
                severity: ValidationSeverity::Error,
            },
            ValidationRule {
                name: "memory_budget",
                field: "memory.bytes",
                validator: |config, constraints| {
                    let Some(bytes) = config.tuning.memory.bytes else {
                        return ValidationResult::Valid;
                    };
                    if !config.scope.contains(Domain::Memory) || constraints.available_memory_mb == 0 {
                        return ValidationResult::Valid;
                    }
                    if bytes / MIB > constraints.available_memory_mb {
                        ValidationResult::Invalid(format!(
                            "{} MiB requested but only {} MiB available",
                            bytes / MIB,
                            constraints.available_memory_mb
                        ))
                    } else {
                        ValidationResult::Valid
                    }
                },
                severity: ValidationSeverity::Critical,
            },
            ValidationRule {
                name: "storage_geometry",
                field: "storage",
                validator: |config, _| {
                    let storage = &config.tuning.storage;
                    if !config.scope.contains(Domain::Storage) {
                        return ValidationResult::Valid;
                    }
                    let largest = storage.random_block_bytes.max(storage.sequential_block_bytes) as u64;
                    if storage.random_block_bytes == 0 || storage.sequential_block_bytes == 0 {
                        ValidationResult::Invalid("block sizes must be non-zero".to_string())
                    } else if storage.file_bytes() < largest {
                        ValidationResult::Invalid(format!(
                            "scratch file of {} MiB is smaller than one {} byte block",
                            storage.file_mb, largest
                        ))
                    } else {
                        ValidationResult::Valid
                    }
                },
                severity: ValidationSeverity::Error,
            },
            ValidationRule {
                name: "grace_period",
                field: "grace_period_secs",
                validator: |config, _| {
                    if config.tuning.grace_period_secs == 0 {
                        ValidationResult::Invalid(
                            "zero grace period abandons every domain mid-pass at shutdown".to_string(),
                        )
                    } else {
                        ValidationResult::Valid
                    }
                },
                severity: ValidationSeverity::Warning,
            },
        ]
    }
}

/// Validate and convert blocking issues into a configuration error
pub fn validate_session(config: &SessionConfig, constraints: SystemConstraints) -> Result<ValidationReport> {
    let report = SessionValidator::new(constraints).validate(config);
    if !report.is_valid {
        report.clone().into_result()?;
    }
    Ok(report)
}
