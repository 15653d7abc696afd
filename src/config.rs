//! Configuration management for Fencer.
//!
//! The configuration file is JSON by default. Files ending in `.yaml` or
//! `.yml` are read as YAML. Key names contain spaces, matching the
//! established file format:
//!
//! ```json
//! {
//!   "listen type": "tcp",
//!   "listen address": "127.0.0.1:8007",
//!   "log": "/var/log/fencer/audit.log",
//!   "directions": [
//!     { "name": "login-by-ip", "type": "string", "window size": 60, "max hits": 5 }
//!   ]
//! }
//! ```

use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::info;

use crate::error::{FencerError, Result};
use crate::hitcounter::{DirectionSettings, ValueKind, DEFAULT_CLEAN_UP_INTERVAL};

/// Kind of socket the control server listens on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ListenType {
    Tcp,
    Unix,
}

/// Main configuration for the Fencer service, as read from disk.
///
/// Every field is optional at this stage so that validation can report all
/// missing or malformed values at once.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct FencerConfig {
    /// Socket type for the control server
    #[serde(rename = "listen type", default)]
    pub listen_type: Option<String>,

    /// Address (TCP) or socket path (Unix) for the control server
    #[serde(rename = "listen address", default)]
    pub listen_address: Option<String>,

    /// Audit log file; audit records go to the tracing output when unset
    #[serde(default)]
    pub log: Option<PathBuf>,

    /// Maximum concurrently served control connections
    #[serde(rename = "max connections", default)]
    pub max_connections: Option<usize>,

    /// Tracked directions
    #[serde(default)]
    pub directions: Vec<DirectionConfig>,
}

/// A direction as described in the configuration file.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DirectionConfig {
    #[serde(default)]
    pub name: Option<String>,

    #[serde(rename = "type", default)]
    pub kind: Option<String>,

    /// Seconds
    #[serde(rename = "window size", default)]
    pub window_size: Option<u64>,

    #[serde(rename = "max hits", default)]
    pub max_hits: Option<u64>,

    /// Seconds
    #[serde(rename = "clean up time", default)]
    pub clean_up_time: Option<u64>,

    #[serde(rename = "max tracked", default)]
    pub max_tracked: Option<usize>,
}

/// A configuration that passed validation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ValidatedConfig {
    pub listen_type: ListenType,
    pub listen_address: String,
    pub log: Option<PathBuf>,
    pub max_connections: Option<usize>,
    pub directions: Vec<DirectionSettings>,
}

impl FencerConfig {
    /// Load configuration from a file path, choosing the format by extension.
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        info!(path = %path.display(), "Loading configuration");

        let contents = std::fs::read_to_string(path)?;
        match path.extension().and_then(|e| e.to_str()) {
            Some("yaml") | Some("yml") => Self::from_yaml(&contents),
            _ => Self::from_json(&contents),
        }
    }

    /// Parse configuration from a JSON string.
    pub fn from_json(json: &str) -> Result<Self> {
        Ok(serde_json::from_str(json)?)
    }

    /// Parse configuration from a YAML string.
    pub fn from_yaml(yaml: &str) -> Result<Self> {
        Ok(serde_yaml::from_str(yaml)?)
    }

    /// Check every field, collecting all problems.
    pub fn validate(&self) -> Result<ValidatedConfig> {
        let mut problems = Vec::new();

        let listen_type = match self.listen_type.as_deref() {
            Some("tcp") => Some(ListenType::Tcp),
            Some("unix") if cfg!(unix) => Some(ListenType::Unix),
            Some("unix") => {
                problems.push("listen type \"unix\" is not supported on this platform".to_string());
                None
            }
            Some(other) => {
                problems.push(format!(
                    "unsupported listen type \"{}\" (expected \"tcp\" or \"unix\")",
                    other
                ));
                None
            }
            None => {
                problems.push("missing \"listen type\"".to_string());
                None
            }
        };

        let listen_address = match self.listen_address.as_deref() {
            Some(addr) if !addr.trim().is_empty() => Some(addr.to_string()),
            Some(_) => {
                problems.push("\"listen address\" must not be empty".to_string());
                None
            }
            None => {
                problems.push("missing \"listen address\"".to_string());
                None
            }
        };

        if self.max_connections == Some(0) {
            problems.push("\"max connections\" must be > 0".to_string());
        }

        if self.directions.is_empty() {
            problems.push("at least one direction is required".to_string());
        }

        let mut names = HashSet::new();
        let mut directions = Vec::with_capacity(self.directions.len());
        for (index, direction) in self.directions.iter().enumerate() {
            match direction.to_settings(index) {
                Ok(settings) => {
                    if !names.insert(settings.name.clone()) {
                        problems.push(format!("duplicate direction name \"{}\"", settings.name));
                    }
                    directions.push(settings);
                }
                Err(mut errs) => problems.append(&mut errs),
            }
        }

        match (listen_type, listen_address) {
            (Some(listen_type), Some(listen_address)) if problems.is_empty() => {
                Ok(ValidatedConfig {
                    listen_type,
                    listen_address,
                    log: self.log.clone(),
                    max_connections: self.max_connections,
                    directions,
                })
            }
            _ => Err(FencerError::InvalidConfig(problems)),
        }
    }
}

impl DirectionConfig {
    /// Convert to settings, reporting every problem with this entry.
    ///
    /// `index` names the entry in messages when it has no usable name.
    pub fn to_settings(&self, index: usize) -> std::result::Result<DirectionSettings, Vec<String>> {
        let label = match self.name.as_deref() {
            Some(name) if !name.is_empty() => format!("direction \"{}\"", name),
            _ => format!("direction #{}", index + 1),
        };
        let mut problems = Vec::new();

        let name = match self.name.as_deref() {
            Some(name) if !name.is_empty() => Some(name.to_string()),
            Some(_) => {
                problems.push(format!("{}: name must not be empty", label));
                None
            }
            None => {
                problems.push(format!("{}: missing \"name\"", label));
                None
            }
        };

        let kind = match self.kind.as_deref() {
            Some(kind) => match kind.parse::<ValueKind>() {
                Ok(kind) => Some(kind),
                Err(e) => {
                    problems.push(format!("{}: {}", label, e));
                    None
                }
            },
            None => {
                problems.push(format!("{}: missing \"type\"", label));
                None
            }
        };

        let window = positive_secs(&label, "window size", self.window_size, &mut problems);
        let max_hits = match self.max_hits {
            Some(0) => {
                problems.push(format!("{}: \"max hits\" must be > 0", label));
                None
            }
            Some(n) => Some(n),
            None => {
                problems.push(format!("{}: missing \"max hits\"", label));
                None
            }
        };

        let clean_up_interval = match self.clean_up_time {
            Some(0) => {
                problems.push(format!("{}: \"clean up time\" must be > 0", label));
                None
            }
            Some(secs) => Some(Duration::from_secs(secs)),
            None => Some(DEFAULT_CLEAN_UP_INTERVAL),
        };

        match (name, kind, window, max_hits, clean_up_interval) {
            (Some(name), Some(kind), Some(window), Some(max_hits), Some(interval))
                if problems.is_empty() =>
            {
                Ok(DirectionSettings::new(name, kind, window, max_hits)
                    .with_clean_up_interval(interval)
                    .with_max_tracked(self.max_tracked.unwrap_or(0)))
            }
            _ => Err(problems),
        }
    }
}

fn positive_secs(
    label: &str,
    field: &str,
    value: Option<u64>,
    problems: &mut Vec<String>,
) -> Option<Duration> {
    match value {
        Some(0) => {
            problems.push(format!("{}: \"{}\" must be > 0", label, field));
            None
        }
        Some(secs) => Some(Duration::from_secs(secs)),
        None => {
            problems.push(format!("{}: missing \"{}\"", label, field));
            None
        }
    }
}

/// Load and validate a configuration file.
pub fn load<P: AsRef<Path>>(path: P) -> Result<ValidatedConfig> {
    FencerConfig::from_file(path)?.validate()
}
