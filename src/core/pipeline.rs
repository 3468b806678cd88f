//! Pipeline configuration and resolution.
//!
//! A pipeline is an ordered list of stages with per-stage timeouts, retry
//! limits, gates and skip behaviour. The resolved `PipelineConfig` is built
//! from compiled-in defaults plus layered `ConfigOverrides` (config file,
//! CLI flags, `--set key=value`), merged field by field.

use std::collections::{BTreeMap, HashSet};
use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Stage order used when nothing overrides it
pub const DEFAULT_STAGES: [&str; 5] = ["triage", "design", "spec", "build", "publish"];

/// Upper bound accepted for `max_retries`
pub const MAX_RETRIES_LIMIT: u32 = 20;

/// Exit code a command stage uses to signal "blocked"
pub const DEFAULT_BLOCKED_EXIT_CODE: i32 = 10;

/// Default artifact pattern, relative to the work item's artifact directory
pub const DEFAULT_ARTIFACT_PATTERN: &str = "{stage}.md";

const DEFAULT_TIMEOUT_SECS: u64 = 1800; // 30 min
const DEFAULT_MAX_RETRIES: u32 = 2;
const MAX_STAGE_NAME_LEN: usize = 64;

/// Errors raised while resolving configuration. Every variant names the
/// offending field.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("unknown configuration key '{field}'")]
    UnknownField { field: String },

    #[error("'{field}' refers to stage '{stage}', which is not in the pipeline order")]
    UnknownStage { field: String, stage: String },

    #[error("invalid value for '{field}': {reason}")]
    InvalidValue { field: String, reason: String },

    #[error("pipeline has no stages (field 'order' is empty)")]
    EmptyPipeline,

    #[error("missing required field '{field}'")]
    MissingField { field: String },

    #[error("failed to parse configuration from {origin}: {message}")]
    Parse { origin: String, message: String },

    #[error("failed to read configuration file {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

impl ConfigError {
    fn invalid(field: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::InvalidValue {
            field: field.into(),
            reason: reason.into(),
        }
    }

    /// The configuration field this error is about, if any
    pub fn field(&self) -> Option<&str> {
        match self {
            Self::UnknownField { field }
            | Self::UnknownStage { field, .. }
            | Self::InvalidValue { field, .. }
            | Self::MissingField { field } => Some(field),
            Self::EmptyPipeline => Some("order"),
            Self::Parse { .. } | Self::Read { .. } => None,
        }
    }
}

/// Fully resolved, validated pipeline configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PipelineConfig {
    /// Stages in execution order
    pub stages: Vec<StageSettings>,

    /// Delay policy between retry attempts
    #[serde(default)]
    pub backoff: RetryPolicy,
}

/// Settings for a single stage
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StageSettings {
    /// Stage name (unique within the pipeline)
    pub name: String,

    /// Deadline for one attempt, in seconds
    pub timeout_secs: u64,

    /// Retries after the first attempt
    pub max_retries: u32,

    /// Require human approval before this stage runs
    #[serde(default)]
    pub gate: bool,

    /// Skip the stage when its artifact already exists
    #[serde(default = "default_true")]
    pub skip_existing: bool,

    /// Artifact glob pattern (`{stage}` and `{work_item}` are substituted)
    #[serde(default = "default_artifact_pattern")]
    pub artifact: String,

    /// Command to run for this stage (used by the CLI command adapter)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub command: Option<Vec<String>>,

    /// Exit code that means "blocked" for command stages
    #[serde(default = "default_blocked_exit_code")]
    pub blocked_exit_code: i32,
}

fn default_true() -> bool {
    true
}
fn default_artifact_pattern() -> String {
    DEFAULT_ARTIFACT_PATTERN.to_string()
}
fn default_blocked_exit_code() -> i32 {
    DEFAULT_BLOCKED_EXIT_CODE
}

impl StageSettings {
    fn with_defaults(name: &str) -> Self {
        Self {
            name: name.to_string(),
            timeout_secs: DEFAULT_TIMEOUT_SECS,
            max_retries: DEFAULT_MAX_RETRIES,
            gate: false,
            skip_existing: true,
            artifact: default_artifact_pattern(),
            command: None,
            blocked_exit_code: DEFAULT_BLOCKED_EXIT_CODE,
        }
    }

    /// Per-attempt deadline
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }

    /// Total attempts allowed (first try plus retries)
    pub fn max_attempts(&self) -> u32 {
        self.max_retries + 1
    }
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            stages: DEFAULT_STAGES
                .iter()
                .map(|name| StageSettings::with_defaults(name))
                .collect(),
            backoff: RetryPolicy::default(),
        }
    }
}

impl PipelineConfig {
    /// Merge defaults with overrides and validate the result
    pub fn resolve(overrides: &ConfigOverrides) -> Result<Self, ConfigError> {
        let order: Vec<String> = match &overrides.order {
            Some(order) => order.clone(),
            None => DEFAULT_STAGES.iter().map(|s| s.to_string()).collect(),
        };
        validate_order(&order)?;

        for name in overrides.stages.keys() {
            if !order.contains(name) {
                return Err(ConfigError::UnknownStage {
                    field: format!("stages.{}", name),
                    stage: name.clone(),
                });
            }
        }

        let timeout_secs = match overrides.timeout_secs {
            Some(value) => check_timeout("timeout_secs", value)?,
            None => DEFAULT_TIMEOUT_SECS,
        };
        let max_retries = match overrides.max_retries {
            Some(value) => check_retries("max_retries", value)?,
            None => DEFAULT_MAX_RETRIES,
        };
        let skip_existing = overrides.skip_existing.unwrap_or(true);
        let backoff = overrides.backoff.resolve()?;

        let mut stages = Vec::with_capacity(order.len());
        for name in &order {
            let mut settings = StageSettings {
                timeout_secs,
                max_retries,
                skip_existing,
                ..StageSettings::with_defaults(name)
            };
            if let Some(stage) = overrides.stages.get(name) {
                stage.apply(name, &mut settings)?;
            }
            stages.push(settings);
        }

        Ok(Self { stages, backoff })
    }

    /// Get a stage by name
    pub fn stage(&self, name: &str) -> Option<&StageSettings> {
        self.stages.iter().find(|s| s.name == name)
    }

    /// Get the index of a stage by name
    pub fn stage_index(&self, name: &str) -> Option<usize> {
        self.stages.iter().position(|s| s.name == name)
    }

    /// Stage names in order
    pub fn stage_names(&self) -> Vec<&str> {
        self.stages.iter().map(|s| s.name.as_str()).collect()
    }

    /// Render as YAML (used by `conveyor config`)
    pub fn to_yaml(&self) -> String {
        serde_yaml::to_string(self).unwrap_or_default()
    }
}

fn validate_order(order: &[String]) -> Result<(), ConfigError> {
    if order.is_empty() {
        return Err(ConfigError::EmptyPipeline);
    }

    let mut seen = HashSet::new();
    for name in order {
        validate_stage_name(name).map_err(|reason| ConfigError::invalid("order", reason))?;
        if !seen.insert(name.as_str()) {
            return Err(ConfigError::invalid(
                "order",
                format!("stage '{}' is listed more than once", name),
            ));
        }
    }

    Ok(())
}

/// Stage names appear in file names and CLI flags
pub fn validate_stage_name(name: &str) -> Result<(), String> {
    if name.is_empty() {
        return Err("stage names cannot be empty".to_string());
    }
    if name.len() > MAX_STAGE_NAME_LEN {
        return Err(format!(
            "stage name '{}' is longer than {} characters",
            name, MAX_STAGE_NAME_LEN
        ));
    }
    if !name
        .chars()
        .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '-' || c == '_')
    {
        return Err(format!(
            "stage name '{}' may only contain a-z, 0-9, '-' and '_'",
            name
        ));
    }
    Ok(())
}

fn check_timeout(field: &str, value: i64) -> Result<u64, ConfigError> {
    if value <= 0 {
        return Err(ConfigError::invalid(
            field,
            format!("timeout must be a positive number of seconds, got {}", value),
        ));
    }
    Ok(value as u64)
}

fn check_retries(field: &str, value: i64) -> Result<u32, ConfigError> {
    if value < 0 || value > MAX_RETRIES_LIMIT as i64 {
        return Err(ConfigError::invalid(
            field,
            format!("must be between 0 and {}, got {}", MAX_RETRIES_LIMIT, value),
        ));
    }
    Ok(value as u32)
}

fn check_artifact_pattern(field: &str, pattern: &str) -> Result<(), ConfigError> {
    if pattern.trim().is_empty() {
        return Err(ConfigError::invalid(field, "artifact pattern cannot be empty"));
    }
    if pattern.starts_with('/') || pattern.split('/').any(|part| part == "..") {
        return Err(ConfigError::invalid(
            field,
            "artifact pattern must stay inside the work item's artifact directory",
        ));
    }
    let candidate = pattern
        .replace("{stage}", "stage")
        .replace("{work_item}", "item");
    glob::Pattern::new(&candidate)
        .map_err(|e| ConfigError::invalid(field, format!("invalid glob pattern: {}", e)))?;
    Ok(())
}

/// Delay policy between retry attempts
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetryPolicy {
    /// Delay after the first failed attempt in milliseconds
    #[serde(default = "default_initial_delay")]
    pub initial_delay_ms: u64,

    /// Maximum delay between retries in milliseconds
    #[serde(default = "default_max_delay")]
    pub max_delay_ms: u64,

    /// Backoff multiplier (delay *= multiplier after each retry)
    #[serde(default = "default_backoff_multiplier")]
    pub multiplier: f64,
}

fn default_initial_delay() -> u64 {
    1000
}
fn default_max_delay() -> u64 {
    30000
}
fn default_backoff_multiplier() -> f64 {
    2.0
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            initial_delay_ms: default_initial_delay(),
            max_delay_ms: default_max_delay(),
            multiplier: default_backoff_multiplier(),
        }
    }
}

impl RetryPolicy {
    /// Calculate the delay after a failed attempt (1-indexed)
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        if attempt <= 1 {
            return Duration::from_millis(self.initial_delay_ms.min(self.max_delay_ms));
        }

        let delay = self.initial_delay_ms as f64 * self.multiplier.powi((attempt - 1) as i32);

        let capped = delay.min(self.max_delay_ms as f64) as u64;
        Duration::from_millis(capped)
    }
}

/// Caller-supplied configuration overrides. Every field is optional and
/// wins over the layer below it.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ConfigOverrides {
    /// Stage execution order
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub order: Option<Vec<String>>,

    /// Default per-stage timeout in seconds
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout_secs: Option<i64>,

    /// Default per-stage retry limit
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_retries: Option<i64>,

    /// Default skip-existing behaviour
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub skip_existing: Option<bool>,

    #[serde(default)]
    pub backoff: BackoffOverrides,

    /// Per-stage overrides, keyed by stage name
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub stages: BTreeMap<String, StageOverrides>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct BackoffOverrides {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub initial_delay_ms: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_delay_ms: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub multiplier: Option<f64>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct StageOverrides {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout_secs: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_retries: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub gate: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub skip_existing: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub artifact: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub command: Option<Vec<String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub blocked_exit_code: Option<i32>,
}

impl BackoffOverrides {
    fn merge(self, other: Self) -> Self {
        Self {
            initial_delay_ms: other.initial_delay_ms.or(self.initial_delay_ms),
            max_delay_ms: other.max_delay_ms.or(self.max_delay_ms),
            multiplier: other.multiplier.or(self.multiplier),
        }
    }

    fn resolve(&self) -> Result<RetryPolicy, ConfigError> {
        let defaults = RetryPolicy::default();

        let initial_delay_ms = match self.initial_delay_ms {
            Some(v) if v < 0 => {
                return Err(ConfigError::invalid(
                    "backoff.initial_delay_ms",
                    format!("must not be negative, got {}", v),
                ))
            }
            Some(v) => v as u64,
            None => defaults.initial_delay_ms,
        };
        let max_delay_ms = match self.max_delay_ms {
            Some(v) if v < 0 => {
                return Err(ConfigError::invalid(
                    "backoff.max_delay_ms",
                    format!("must not be negative, got {}", v),
                ))
            }
            Some(v) => v as u64,
            None => defaults.max_delay_ms.max(initial_delay_ms),
        };
        if initial_delay_ms > max_delay_ms {
            return Err(ConfigError::invalid(
                "backoff.initial_delay_ms",
                format!(
                    "initial delay {}ms exceeds max delay {}ms",
                    initial_delay_ms, max_delay_ms
                ),
            ));
        }
        let multiplier = self.multiplier.unwrap_or(defaults.multiplier);
        if !multiplier.is_finite() || multiplier < 1.0 {
            return Err(ConfigError::invalid(
                "backoff.multiplier",
                format!("must be a finite number >= 1.0, got {}", multiplier),
            ));
        }

        Ok(RetryPolicy {
            initial_delay_ms,
            max_delay_ms,
            multiplier,
        })
    }
}

impl StageOverrides {
    fn merge(self, other: Self) -> Self {
        Self {
            timeout_secs: other.timeout_secs.or(self.timeout_secs),
            max_retries: other.max_retries.or(self.max_retries),
            gate: other.gate.or(self.gate),
            skip_existing: other.skip_existing.or(self.skip_existing),
            artifact: other.artifact.or(self.artifact),
            command: other.command.or(self.command),
            blocked_exit_code: other.blocked_exit_code.or(self.blocked_exit_code),
        }
    }

    fn apply(&self, stage: &str, settings: &mut StageSettings) -> Result<(), ConfigError> {
        let field = |key: &str| format!("stages.{}.{}", stage, key);

        if let Some(value) = self.timeout_secs {
            settings.timeout_secs = check_timeout(&field("timeout_secs"), value)?;
        }
        if let Some(value) = self.max_retries {
            settings.max_retries = check_retries(&field("max_retries"), value)?;
        }
        if let Some(gate) = self.gate {
            settings.gate = gate;
        }
        if let Some(skip) = self.skip_existing {
            settings.skip_existing = skip;
        }
        if let Some(pattern) = &self.artifact {
            check_artifact_pattern(&field("artifact"), pattern)?;
            settings.artifact = pattern.clone();
        }
        if let Some(command) = &self.command {
            if command.first().map_or(true, |program| program.trim().is_empty()) {
                return Err(ConfigError::invalid(
                    field("command"),
                    "command must name a program to run",
                ));
            }
            settings.command = Some(command.clone());
        }
        if let Some(code) = self.blocked_exit_code {
            if !(1..=255).contains(&code) {
                return Err(ConfigError::invalid(
                    field("blocked_exit_code"),
                    format!("must be between 1 and 255, got {}", code),
                ));
            }
            settings.blocked_exit_code = code;
        }

        Ok(())
    }
}

impl ConfigOverrides {
    /// Parse overrides from YAML (the `pipeline:` section of a config file)
    pub fn from_yaml(content: &str, origin: &str) -> Result<Self, ConfigError> {
        serde_yaml::from_str(content).map_err(|e| yaml_error(origin, &e))
    }

    /// Layer `other` on top of `self`; fields set in `other` win
    pub fn merge(self, other: ConfigOverrides) -> ConfigOverrides {
        let mut stages = self.stages;
        for (name, stage) in other.stages {
            let merged = match stages.remove(&name) {
                Some(existing) => existing.merge(stage),
                None => stage,
            };
            stages.insert(name, merged);
        }

        ConfigOverrides {
            order: other.order.or(self.order),
            timeout_secs: other.timeout_secs.or(self.timeout_secs),
            max_retries: other.max_retries.or(self.max_retries),
            skip_existing: other.skip_existing.or(self.skip_existing),
            backoff: self.backoff.merge(other.backoff),
            stages,
        }
    }

    /// Mutable access to a stage's overrides, creating them if absent
    pub fn stage_mut(&mut self, stage: &str) -> &mut StageOverrides {
        self.stages.entry(stage.to_string()).or_default()
    }

    /// Apply a dotted `key=value` assignment (from `--set`)
    pub fn set(&mut self, key: &str, value: &str) -> Result<(), ConfigError> {
        let value = value.trim();
        let parts: Vec<&str> = key.trim().split('.').collect();

        match parts.as_slice() {
            ["order"] => {
                self.order = Some(
                    value
                        .split(',')
                        .map(|s| s.trim().to_string())
                        .filter(|s| !s.is_empty())
                        .collect(),
                );
            }
            ["timeout_secs"] => self.timeout_secs = Some(parse_int(key, value)?),
            ["max_retries"] => self.max_retries = Some(parse_int(key, value)?),
            ["skip_existing"] => self.skip_existing = Some(parse_bool(key, value)?),
            ["backoff", "initial_delay_ms"] => {
                self.backoff.initial_delay_ms = Some(parse_int(key, value)?)
            }
            ["backoff", "max_delay_ms"] => self.backoff.max_delay_ms = Some(parse_int(key, value)?),
            ["backoff", "multiplier"] => {
                self.backoff.multiplier = Some(value.parse().map_err(|_| {
                    ConfigError::invalid(key, format!("expected a number, got '{}'", value))
                })?)
            }
            ["stages", stage, field] => {
                let parsed = match *field {
                    "timeout_secs" => StageOverrides {
                        timeout_secs: Some(parse_int(key, value)?),
                        ..Default::default()
                    },
                    "max_retries" => StageOverrides {
                        max_retries: Some(parse_int(key, value)?),
                        ..Default::default()
                    },
                    "gate" => StageOverrides {
                        gate: Some(parse_bool(key, value)?),
                        ..Default::default()
                    },
                    "skip_existing" => StageOverrides {
                        skip_existing: Some(parse_bool(key, value)?),
                        ..Default::default()
                    },
                    "artifact" => StageOverrides {
                        artifact: Some(value.to_string()),
                        ..Default::default()
                    },
                    "blocked_exit_code" => StageOverrides {
                        blocked_exit_code: Some(i32::try_from(parse_int(key, value)?).map_err(
                            |_| ConfigError::invalid(key, format!("out of range: {}", value)),
                        )?),
                        ..Default::default()
                    },
                    _ => {
                        return Err(ConfigError::UnknownField {
                            field: key.to_string(),
                        })
                    }
                };
                let existing = std::mem::take(self.stage_mut(stage));
                *self.stage_mut(stage) = existing.merge(parsed);
            }
            _ => {
                return Err(ConfigError::UnknownField {
                    field: key.to_string(),
                })
            }
        }

        Ok(())
    }

    /// Apply a `key=value` string
    pub fn set_assignment(&mut self, assignment: &str) -> Result<(), ConfigError> {
        let (key, value) = assignment.split_once('=').ok_or_else(|| {
            ConfigError::invalid(
                assignment,
                "expected KEY=VALUE (e.g. stages.build.max_retries=3)",
            )
        })?;
        self.set(key, value)
    }
}

/// Turn a YAML error into a `ConfigError`, naming the field when serde
/// rejected an unknown key
pub(crate) fn yaml_error(origin: &str, e: &serde_yaml::Error) -> ConfigError {
    let message = e.to_string();
    if let Some((path, rest)) = message.split_once("unknown field `") {
        if let Some((name, _)) = rest.split_once('`') {
            let path = path.trim().trim_end_matches(':');
            let field = if path.is_empty() || path.contains(' ') {
                name.to_string()
            } else {
                format!("{}.{}", path, name)
            };
            return ConfigError::UnknownField { field };
        }
    }
    ConfigError::Parse {
        origin: origin.to_string(),
        message,
    }
}

fn parse_int(field: &str, value: &str) -> Result<i64, ConfigError> {
    value
        .parse()
        .map_err(|_| ConfigError::invalid(field, format!("expected an integer, got '{}'", value)))
}

fn parse_bool(field: &str, value: &str) -> Result<bool, ConfigError> {
    match value.to_ascii_lowercase().as_str() {
        "true" | "yes" | "on" | "1" => Ok(true),
        "false" | "no" | "off" | "0" => Ok(false),
        _ => Err(ConfigError::invalid(
            field,
            format!("expected true or false, got '{}'", value),
        )),
    }
}
