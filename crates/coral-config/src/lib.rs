//! # coral-config: Simulation parameter configuration
//!
//! The execution parameters a master consumes from outside: timing, step
//! size, and the communication budgets. Values merge from three sources,
//! in increasing precedence: built-in defaults, a TOML file, and
//! `CORAL_`-prefixed environment variables.

use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

/// Simulation and communication parameters for one execution.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SimulationSettings {
    /// Simulation start time, in seconds.
    pub start_time: f64,
    /// Simulation stop time; `None` runs until terminated.
    pub stop_time: Option<f64>,
    /// Size of each time step, in simulation seconds.
    pub step_size: f64,
    /// Reply budget for ordinary control commands, in milliseconds.
    pub comm_timeout_ms: u64,
    /// STEP replies may take this many times the ordinary budget, since
    /// they include the model computation itself.
    pub step_timeout_multiplier: f64,
    /// Startup budget for a slave spawned by a provider, in milliseconds.
    pub instantiation_timeout_ms: u64,
    /// Per-step input-barrier budget inside each slave, in milliseconds.
    pub variable_recv_timeout_ms: u64,
}

impl Default for SimulationSettings {
    fn default() -> Self {
        Self {
            start_time: 0.0,
            stop_time: None,
            step_size: 0.01,
            comm_timeout_ms: 5_000,
            step_timeout_multiplier: 10.0,
            instantiation_timeout_ms: 30_000,
            variable_recv_timeout_ms: 1_000,
        }
    }
}

impl SimulationSettings {
    /// The ordinary control-command reply budget.
    pub fn comm_timeout(&self) -> Duration {
        Duration::from_millis(self.comm_timeout_ms)
    }

    /// The reply budget for STEP commands.
    pub fn step_timeout(&self) -> Duration {
        Duration::from_millis((self.comm_timeout_ms as f64 * self.step_timeout_multiplier) as u64)
    }

    pub fn instantiation_timeout(&self) -> Duration {
        Duration::from_millis(self.instantiation_timeout_ms)
    }

    pub fn variable_recv_timeout(&self) -> Duration {
        Duration::from_millis(self.variable_recv_timeout_ms)
    }
}

/// Loads [`SimulationSettings`] with multi-source merging.
pub struct SettingsLoader {
    file: Option<PathBuf>,
    env_prefix: String,
}

impl SettingsLoader {
    pub fn new() -> Self {
        Self {
            file: None,
            env_prefix: "CORAL".to_string(),
        }
    }

    /// Reads settings from the given TOML file (when it exists) on top of
    /// the defaults.
    pub fn with_file(mut self, path: impl AsRef<Path>) -> Self {
        self.file = Some(path.as_ref().to_path_buf());
        self
    }

    /// Changes the environment variable prefix (default: `CORAL`).
    pub fn with_env_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.env_prefix = prefix.into();
        self
    }

    /// Loads and merges all sources.
    pub fn load(self) -> Result<SimulationSettings> {
        let mut builder = config::Config::builder();

        // 1. Built-in defaults
        builder = builder.add_source(config::Config::try_from(&SimulationSettings::default())?);

        // 2. TOML file
        if let Some(file) = self.file {
            builder = builder.add_source(
                config::File::from(file)
                    .required(false)
                    .format(config::FileFormat::Toml),
            );
        }

        // 3. Environment variables (CORAL_*)
        builder = builder.add_source(
            config::Environment::with_prefix(&self.env_prefix).try_parsing(true),
        );

        let merged = builder.build().context("failed to build configuration")?;
        merged
            .try_deserialize()
            .context("failed to deserialize configuration")
    }
}

impl Default for SettingsLoader {
    fn default() -> Self {
        Self::new()
    }
}
