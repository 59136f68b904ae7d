//! Run configuration.
//!
//! Loaded from a JSON or TOML file (format picked by extension) and overlaid
//! with `SIMREC_`-prefixed environment variables, `__` separating sections
//! from keys:
//!
//! ```text
//! SIMREC_RUN__DT=0.025
//! SIMREC_OUTPUT__OUTPUT_DIR=/scratch/run42
//! ```

use serde::{Deserialize, Serialize};
use simrec_core::EntityId;
use simrec_io::output_dir::{OutputLayout, DEFAULT_CELL_VARS_DIR, DEFAULT_LOG_FILE, DEFAULT_STATE_DIR};
use simrec_io::recorder::RecordingPlan;
use std::collections::BTreeSet;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use thiserror::Error;

/// Environment variable prefix.
pub const ENV_PREFIX: &str = "SIMREC";

/// Configuration error types
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Invalid log level: {0}. Must be one of: trace, debug, info, warn, error")]
    InvalidLogLevel(String),

    #[error("Configuration file error: {0}")]
    FileError(String),

    #[error("Configuration source error: {0}")]
    Source(#[from] ::config::ConfigError),

    #[error("Configuration parse error: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("Configuration serialisation error: {0}")]
    Serialise(#[from] serde_json::Error),

    #[error("Invalid configuration: {}", .0.join("; "))]
    Validation(Vec<String>),
}

/// Log levels accepted in `run.log_level`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Trace,
    Debug,
    #[default]
    Info,
    Warn,
    Error,
}

impl FromStr for LogLevel {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "trace" => Ok(LogLevel::Trace),
            "debug" => Ok(LogLevel::Debug),
            "info" => Ok(LogLevel::Info),
            "warn" => Ok(LogLevel::Warn),
            "error" => Ok(LogLevel::Error),
            _ => Err(ConfigError::InvalidLogLevel(s.to_string())),
        }
    }
}

impl LogLevel {
    /// Convert log level to tracing filter string
    pub fn as_filter_str(&self) -> &'static str {
        match self {
            LogLevel::Trace => "trace",
            LogLevel::Debug => "debug",
            LogLevel::Info => "info",
            LogLevel::Warn => "warn",
            LogLevel::Error => "error",
        }
    }
}

impl std::fmt::Display for LogLevel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_filter_str())
    }
}

fn deserialize_log_level<'de, D>(deserializer: D) -> Result<LogLevel, D::Error>
where
    D: serde::Deserializer<'de>,
{
    let s = String::deserialize(deserializer)?;
    LogLevel::from_str(&s).map_err(serde::de::Error::custom)
}

/// `output` section.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OutputConfig {
    /// Output root.
    pub output_dir: PathBuf,
    /// Dataset directory; `<output_dir>/cellvars` when unset.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cell_vars_dir: Option<PathBuf>,
    /// Checkpoint directory; `<output_dir>/state` when unset.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub state_dir: Option<PathBuf>,
    /// Log file; `<output_dir>/log.txt` when unset.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub log_file: Option<PathBuf>,
}

/// `run` section.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunParams {
    /// Time step.
    pub dt: f64,
    /// Simulated stop time.
    pub tstop: f64,
    /// Simulated start time.
    #[serde(default)]
    pub tstart: f64,
    /// Steps staged in memory between flushes.
    #[serde(default = "default_nsteps_block")]
    pub nsteps_block: usize,
    /// Replace an existing output directory.
    #[serde(default)]
    pub overwrite_output_dir: bool,
    /// Variables recorded on every selected entity.
    #[serde(default = "default_cell_vars")]
    pub save_cell_vars: Vec<String>,
    /// Write a checkpoint at the end of the run.
    #[serde(default)]
    pub save_state: bool,
    /// Resume from the checkpoint in the state directory.
    #[serde(default)]
    pub start_from_state: bool,
    /// Log level; `RUST_LOG` takes precedence.
    #[serde(default, deserialize_with = "deserialize_log_level")]
    pub log_level: LogLevel,
}

fn default_nsteps_block() -> usize {
    5000
}

fn default_cell_vars() -> Vec<String> {
    vec!["v".to_string()]
}

/// `node_id_selections` section.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct NodeIdSelections {
    /// Entities whose variables are recorded.
    #[serde(default)]
    pub save_cell_vars: BTreeSet<EntityId>,
}

/// Complete run configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunConfig {
    /// Output paths.
    pub output: OutputConfig,
    /// Timing and behaviour.
    pub run: RunParams,
    /// Recorded entity selection.
    #[serde(default)]
    pub node_id_selections: NodeIdSelections,
}

impl RunConfig {
    /// Loads from `path`, overlaid with the process environment.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        Self::load_with_env(path, None)
    }

    /// Loads from `path`, overlaid with `env` instead of the process
    /// environment when given. Keys in `env` carry the `SIMREC_` prefix.
    pub fn load_with_env(
        path: impl AsRef<Path>,
        env: Option<::config::Map<String, String>>,
    ) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        if !path.is_file() {
            return Err(ConfigError::FileError(format!(
                "{} does not exist",
                path.display()
            )));
        }

        let environment = ::config::Environment::with_prefix(ENV_PREFIX)
            .prefix_separator("_")
            .separator("__")
            .try_parsing(true)
            .source(env);

        let config: RunConfig = ::config::Config::builder()
            .add_source(::config::File::from(path))
            .add_source(environment)
            .build()?
            .try_deserialize()?;
        Ok(config)
    }

    /// Parses a TOML document.
    pub fn from_toml_str(s: &str) -> Result<Self, ConfigError> {
        Ok(toml::from_str(s)?)
    }

    /// Checks every field and reports all problems at once.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let mut errors = Vec::new();
        let run = &self.run;

        if self.output.output_dir.as_os_str().is_empty() {
            errors.push("output.output_dir must not be empty".to_string());
        }
        if !(run.dt.is_finite() && run.dt > 0.0) {
            errors.push(format!("run.dt must be positive, got {}", run.dt));
        }
        if !(run.tstop.is_finite() && run.tstop > 0.0) {
            errors.push(format!("run.tstop must be positive, got {}", run.tstop));
        }
        if !(run.tstart.is_finite() && run.tstart < run.tstop) {
            errors.push(format!(
                "run.tstart ({}) must be less than run.tstop ({})",
                run.tstart, run.tstop
            ));
        }
        if run.nsteps_block == 0 {
            errors.push("run.nsteps_block must be at least 1".to_string());
        }
        let mut seen = BTreeSet::new();
        for name in &run.save_cell_vars {
            if name.is_empty() {
                errors.push("run.save_cell_vars contains an empty name".to_string());
            } else if !seen.insert(name.as_str()) {
                errors.push(format!("run.save_cell_vars lists {name:?} twice"));
            }
        }

        if errors.is_empty() {
            Ok(())
        } else {
            Err(ConfigError::Validation(errors))
        }
    }

    /// Number of recorded steps, `round((tstop - tstart) / dt)`.
    pub fn total_steps(&self) -> usize {
        let steps = ((self.run.tstop - self.run.tstart) / self.run.dt).round();
        if steps.is_finite() && steps > 0.0 {
            steps as usize
        } else {
            0
        }
    }

    /// Output paths with defaults filled in.
    pub fn layout(&self) -> OutputLayout {
        let root = &self.output.output_dir;
        OutputLayout {
            root: root.clone(),
            cell_vars_dir: self
                .output
                .cell_vars_dir
                .clone()
                .unwrap_or_else(|| root.join(DEFAULT_CELL_VARS_DIR)),
            state_dir: self
                .output
                .state_dir
                .clone()
                .unwrap_or_else(|| root.join(DEFAULT_STATE_DIR)),
            log_file: self
                .output
                .log_file
                .clone()
                .unwrap_or_else(|| root.join(DEFAULT_LOG_FILE)),
        }
    }

    /// Recording plan derived from the `run` section. A run started from
    /// saved state extends the datasets of the run it continues.
    pub fn recording_plan(&self) -> RecordingPlan {
        let plan = RecordingPlan::new(
            self.total_steps(),
            self.run.nsteps_block,
            self.run.dt,
            self.run.tstart,
            self.run.tstop,
        );
        if self.run.start_from_state {
            plan.extending()
        } else {
            plan
        }
    }

    /// Pretty JSON of the effective configuration, for the snapshot file.
    pub fn snapshot(&self) -> Result<Vec<u8>, ConfigError> {
        Ok(serde_json::to_vec_pretty(self)?)
    }
}
