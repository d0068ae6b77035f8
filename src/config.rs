use anyhow::{Context, Result};
use serde_derive::{Deserialize, Serialize};
use std::collections;
use std::fs;
use std::path::{Path, PathBuf};

use crate::status::StatusTiming;

#[derive(Deserialize, Debug, Copy, Clone, PartialEq, Eq, Serialize)]
pub enum PriorityClass {
    Idle,
    BelowNormal,
    Normal,
    AboveNormal,
    High,
    Realtime,
}

#[derive(Deserialize, Debug, Default, Serialize)]
pub struct JobObject {
    pub priority_class: Option<PriorityClass>,
}

#[derive(Deserialize, Debug, Default, Serialize)]
pub struct Registration {
    pub name: String,
    pub display_name: String,
    pub description: Option<String>,
}

#[derive(Deserialize, Debug, Default, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(tag = "type")]
pub enum ExistBehavior {
    #[default]
    Append,
    Truncate,
}

#[derive(Deserialize, Debug, Default, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "type")]
pub enum OutputStream {
    #[default]
    Null,
    File {
        path: PathBuf,
        #[serde(default)]
        exist_behavior: ExistBehavior,
    },
}

#[derive(Deserialize, Debug, Default, Clone, Serialize)]
pub struct Process {
    pub binary: String,
    #[serde(default)]
    pub args: Vec<String>,
    pub working_directory: Option<PathBuf>,
    #[serde(default)]
    pub environment: collections::HashMap<String, String>,
    #[serde(default)]
    pub stdout: OutputStream,
    #[serde(default)]
    pub stderr: OutputStream,
}

#[derive(Deserialize, Debug, Default, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    #[default]
    Text,
    Json,
}

#[derive(Deserialize, Debug, Default, Clone, Serialize)]
pub struct Logging {
    pub path: Option<PathBuf>,
    #[serde(default)]
    pub format: LogFormat,
    pub filter: Option<String>,
}

#[derive(Deserialize, Debug, Default, Serialize)]
pub struct Config {
    pub registration: Registration,
    pub process: Process,
    pub job_object: Option<JobObject>,
    #[serde(default)]
    pub lifecycle: StatusTiming,
    #[serde(default)]
    pub logging: Logging,
}

impl Config {
    pub fn load(path: &Path) -> Result<Self> {
        let text = fs::read_to_string(path)
            .with_context(|| format!("failed to read config file {}", path.display()))?;
        let config: Config = toml::from_str(&text)
            .with_context(|| format!("failed to parse config file {}", path.display()))?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.registration.name.trim().is_empty() {
            anyhow::bail!("registration.name must not be empty");
        }
        if self.process.binary.trim().is_empty() {
            anyhow::bail!("process.binary must not be empty");
        }
        if self.lifecycle.checkpoint_interval.is_zero() {
            anyhow::bail!("lifecycle.checkpoint_interval_ms must be greater than zero");
        }
        Ok(())
    }

    pub fn default_toml() -> Result<String> {
        toml::to_string(&Config::default()).context("failed to render default config")
    }
}
