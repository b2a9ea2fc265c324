//! Session configuration
//!
//! One `StimConfig` describes a whole session. It is loaded by the launching
//! binary (TOML, YAML or JSON) and handed to every spawned participant as a
//! JSON snapshot.

use crate::core::state::MAX_PARTICIPANTS;
use crate::error::{StimError, StimResult};
use crate::memory::shm_base_dir;
use crate::protocol::{Protocol, ProtocolLibrary};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::{BTreeMap, HashSet};
use std::path::{Path, PathBuf};

/// Name reserved for the Controller in participant lists and RPC targets
pub const CONTROLLER_NAME: &str = "controller";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    /// Root directory for shared memory regions
    pub root: PathBuf,
    /// Session name; defaults to a fresh uuid
    pub name: String,
    /// Remove the session's regions when the Controller exits
    pub cleanup_on_exit: bool,
    /// Capacity of each channel queue in bytes
    pub queue_bytes: usize,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            root: shm_base_dir(),
            name: uuid::Uuid::new_v4().to_string(),
            cleanup_on_exit: true,
            queue_bytes: crate::communication::DEFAULT_QUEUE_BYTES,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ControllerConfig {
    pub tick_interval_ms: f64,
    /// Delay between all participants reporting READY and the phase start
    pub phase_start_delay_s: f64,
    /// Sleep granularity; measured at startup when unset
    pub min_sleep_s: Option<f64>,
    /// Floor for the readiness polling sleep
    pub readiness_poll_ms: f64,
    /// Abort the protocol when readiness takes longer than this
    pub ready_timeout_s: Option<f64>,
    pub shutdown_timeout_s: f64,
    /// Print drained participant log records on the console
    pub echo_logs: bool,
}

impl Default for ControllerConfig {
    fn default() -> Self {
        Self {
            tick_interval_ms: 1.0,
            phase_start_delay_s: 0.1,
            min_sleep_s: None,
            readiness_poll_ms: 0.5,
            ready_timeout_s: None,
            shutdown_timeout_s: 5.0,
            echo_logs: true,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    Camera,
    Display,
    Io,
    Worker,
    Gui,
}

/// One participant process of the session
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ParticipantSpec {
    pub name: String,
    pub role: Role,
    #[serde(default = "default_interval_ms")]
    pub interval_ms: f64,
    /// Routine names, resolved against the routine catalog
    #[serde(default)]
    pub routines: Vec<String>,
    /// Initial property values
    #[serde(default)]
    pub properties: BTreeMap<String, Value>,
}

fn default_interval_ms() -> f64 {
    1.0
}

impl ParticipantSpec {
    pub fn new(name: impl Into<String>, role: Role) -> Self {
        Self {
            name: name.into(),
            role,
            interval_ms: default_interval_ms(),
            routines: Vec::new(),
            properties: BTreeMap::new(),
        }
    }

    pub fn with_routine(mut self, routine: impl Into<String>) -> Self {
        self.routines.push(routine.into());
        self
    }

    pub fn with_interval_ms(mut self, interval_ms: f64) -> Self {
        self.interval_ms = interval_ms;
        self
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RecordingConfig {
    pub folder: Option<PathBuf>,
    pub start_on_launch: bool,
    /// Only record these attributes; empty means every flagged attribute
    pub attributes: Vec<String>,
}

impl RecordingConfig {
    pub fn includes(&self, attribute: &str) -> bool {
        self.attributes.is_empty() || self.attributes.iter().any(|a| a == attribute)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StimConfig {
    pub session: SessionConfig,
    pub controller: ControllerConfig,
    pub participants: Vec<ParticipantSpec>,
    pub protocols: Vec<Protocol>,
    pub recording: RecordingConfig,
}

impl StimConfig {
    pub fn from_toml_str(text: &str) -> StimResult<Self> {
        let config: Self = toml::from_str(text)?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_yaml_str(text: &str) -> StimResult<Self> {
        let config: Self = serde_yaml::from_str(text)?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_json_str(text: &str) -> StimResult<Self> {
        let config: Self = serde_json::from_str(text)?;
        config.validate()?;
        Ok(config)
    }

    /// Load a config file, picking the format from its extension
    pub fn load(path: &Path) -> StimResult<Self> {
        let text = std::fs::read_to_string(path)?;
        match path.extension().and_then(|e| e.to_str()) {
            Some("toml") => Self::from_toml_str(&text),
            Some("yaml") | Some("yml") => Self::from_yaml_str(&text),
            Some("json") => Self::from_json_str(&text),
            other => Err(StimError::config(format!(
                "unsupported config format {:?} for {}",
                other,
                path.display()
            ))),
        }
    }

    /// JSON snapshot handed to spawned participants
    pub fn to_snapshot(&self) -> StimResult<String> {
        Ok(serde_json::to_string(self)?)
    }

    pub fn session_dir(&self) -> PathBuf {
        crate::memory::shm_session_dir(&self.session.root, &self.session.name)
    }

    pub fn protocol_library(&self) -> StimResult<ProtocolLibrary> {
        ProtocolLibrary::from_list(self.protocols.clone())
    }

    pub fn participant(&self, name: &str) -> Option<&ParticipantSpec> {
        self.participants.iter().find(|p| p.name == name)
    }

    pub fn validate(&self) -> StimResult<()> {
        if self.session.name.trim().is_empty() {
            return Err(StimError::config("session name is empty"));
        }
        if self.participants.len() + 1 > MAX_PARTICIPANTS {
            return Err(StimError::config(format!(
                "{} participants configured, at most {} are supported",
                self.participants.len(),
                MAX_PARTICIPANTS - 1
            )));
        }

        let mut seen = HashSet::new();
        for participant in &self.participants {
            if participant.name.is_empty() || participant.name == CONTROLLER_NAME {
                return Err(StimError::config(format!(
                    "invalid participant name '{}'",
                    participant.name
                )));
            }
            if !participant
                .name
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-')
            {
                return Err(StimError::config(format!(
                    "participant name '{}' may only contain letters, digits, '_' and '-'",
                    participant.name
                )));
            }
            if !seen.insert(participant.name.as_str()) {
                return Err(StimError::config(format!(
                    "participant '{}' is listed twice",
                    participant.name
                )));
            }
            if !(participant.interval_ms > 0.0 && participant.interval_ms.is_finite()) {
                return Err(StimError::config(format!(
                    "participant '{}': interval_ms must be positive",
                    participant.name
                )));
            }
        }

        let controller = &self.controller;
        if !(controller.tick_interval_ms > 0.0 && controller.tick_interval_ms.is_finite()) {
            return Err(StimError::config("controller.tick_interval_ms must be positive"));
        }
        if !(controller.phase_start_delay_s >= 0.0 && controller.phase_start_delay_s.is_finite()) {
            return Err(StimError::config(
                "controller.phase_start_delay_s must be a non-negative number",
            ));
        }
        if controller.min_sleep_s.is_some_and(|s| !(s >= 0.0)) {
            return Err(StimError::config("controller.min_sleep_s must be non-negative"));
        }
        if controller.ready_timeout_s.is_some_and(|s| !(s > 0.0)) {
            return Err(StimError::config("controller.ready_timeout_s must be positive"));
        }
        if !(controller.shutdown_timeout_s > 0.0) {
            return Err(StimError::config("controller.shutdown_timeout_s must be positive"));
        }

        self.protocol_library()?;
        Ok(())
    }
}
