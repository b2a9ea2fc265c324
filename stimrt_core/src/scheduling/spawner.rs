//! Starting participants
//!
//! The Controller only needs to start a participant and later learn whether
//! it is still alive. Threads are used by tests and single-binary setups;
//! OS processes re-execute a binary that calls [`run_child`] on startup.

use crate::config::{ParticipantSpec, StimConfig};
use crate::core::catalog::Catalog;
use crate::core::log_buffer::SharedLogger;
use crate::core::process::{run_participant, ProcessMetrics};
use crate::error::{StimError, StimResult};
use crate::registry::Registry;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::process::{Child, Command};
use std::thread::{self, JoinHandle};

/// Environment variable naming the participant a child process runs
pub const PARTICIPANT_ENV: &str = "STIMRT_PARTICIPANT";
/// Environment variable carrying the JSON session snapshot
pub const SNAPSHOT_ENV: &str = "STIMRT_SNAPSHOT";
/// Log level of a child process (`log::LevelFilter` syntax)
pub const CHILD_LOG_ENV: &str = "STIMRT_LOG";

/// Everything a participant needs to join the session
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Snapshot {
    pub config: StimConfig,
    pub registry: Registry,
}

impl Snapshot {
    pub fn encode(&self) -> StimResult<String> {
        Ok(serde_json::to_string(self)?)
    }

    pub fn decode(text: &str) -> StimResult<Self> {
        Ok(serde_json::from_str(text)?)
    }
}

pub trait ParticipantHandle: Send {
    /// The participant's thread or process has exited
    fn is_finished(&mut self) -> bool;

    /// Stop it without cooperation, where the platform allows
    fn kill(&mut self) -> StimResult<()>;

    /// Wait for a finished participant and collect its outcome
    fn join(self: Box<Self>) -> StimResult<()>;
}

pub trait Spawner {
    fn spawn(
        &self,
        spec: &ParticipantSpec,
        config: &StimConfig,
        registry: &Registry,
    ) -> StimResult<Box<dyn ParticipantHandle>>;
}

/// Runs each participant on its own OS thread of the current process
#[derive(Clone)]
pub struct ThreadSpawner {
    catalog: Catalog,
}

impl ThreadSpawner {
    pub fn new(catalog: Catalog) -> Self {
        Self { catalog }
    }
}

struct ThreadHandle {
    name: String,
    handle: JoinHandle<StimResult<ProcessMetrics>>,
}

impl ParticipantHandle for ThreadHandle {
    fn is_finished(&mut self) -> bool {
        self.handle.is_finished()
    }

    fn kill(&mut self) -> StimResult<()> {
        log::warn!("participant thread '{}' cannot be killed, detaching it", self.name);
        Ok(())
    }

    fn join(self: Box<Self>) -> StimResult<()> {
        let name = self.name;
        match self.handle.join() {
            Ok(Ok(metrics)) => {
                log::debug!("{} exited after {} ticks", name, metrics.ticks);
                Ok(())
            }
            Ok(Err(e)) => Err(e),
            Err(panic) => Err(StimError::Internal(format!(
                "participant thread '{}' panicked: {}",
                name,
                crate::core::process::panic_message(panic.as_ref())
            ))),
        }
    }
}

impl Spawner for ThreadSpawner {
    fn spawn(
        &self,
        spec: &ParticipantSpec,
        config: &StimConfig,
        registry: &Registry,
    ) -> StimResult<Box<dyn ParticipantHandle>> {
        let registry = registry.fork();
        let catalog = self.catalog.clone();
        let thread_spec = spec.clone();
        let config = config.clone();
        let handle = thread::Builder::new()
            .name(format!("stimrt-{}", spec.name))
            .spawn(move || run_participant(&thread_spec, &config, registry, &catalog))
            .map_err(|e| StimError::Internal(format!("failed to spawn '{}': {}", spec.name, e)))?;
        Ok(Box::new(ThreadHandle {
            name: spec.name.clone(),
            handle,
        }))
    }
}

/// Re-executes a binary once per participant, passing the snapshot by environment
#[derive(Debug, Clone)]
pub struct ProcessSpawner {
    program: PathBuf,
    args: Vec<String>,
}

impl ProcessSpawner {
    pub fn new(program: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
        }
    }

    /// Re-execute the running binary
    pub fn current_exe() -> StimResult<Self> {
        Ok(Self::new(std::env::current_exe()?))
    }

    pub fn with_args(mut self, args: impl IntoIterator<Item = impl Into<String>>) -> Self {
        self.args = args.into_iter().map(Into::into).collect();
        self
    }
}

struct ChildHandle {
    name: String,
    child: Child,
}

impl ParticipantHandle for ChildHandle {
    fn is_finished(&mut self) -> bool {
        match self.child.try_wait() {
            Ok(Some(_)) => true,
            Ok(None) => false,
            Err(e) => {
                log::error!("error checking [{}]: {}", self.name, e);
                true
            }
        }
    }

    fn kill(&mut self) -> StimResult<()> {
        log::warn!("terminating [{}]", self.name);
        self.child.kill()?;
        Ok(())
    }

    fn join(mut self: Box<Self>) -> StimResult<()> {
        let status = self.child.wait()?;
        if status.success() {
            Ok(())
        } else {
            Err(StimError::Internal(format!(
                "participant [{}] exited with code {}",
                self.name,
                status.code().unwrap_or(-1)
            )))
        }
    }
}

impl Spawner for ProcessSpawner {
    fn spawn(
        &self,
        spec: &ParticipantSpec,
        config: &StimConfig,
        registry: &Registry,
    ) -> StimResult<Box<dyn ParticipantHandle>> {
        let snapshot = Snapshot {
            config: config.clone(),
            registry: registry.clone(),
        }
        .encode()?;
        let child = Command::new(&self.program)
            .args(&self.args)
            .env(PARTICIPANT_ENV, &spec.name)
            .env(SNAPSHOT_ENV, snapshot)
            .spawn()
            .map_err(|e| {
                StimError::Internal(format!(
                    "failed to start [{}] from {}: {}",
                    spec.name,
                    self.program.display(),
                    e
                ))
            })?;
        log::info!("started [{}] as pid {}", spec.name, child.id());
        Ok(Box::new(ChildHandle {
            name: spec.name.clone(),
            child,
        }))
    }
}

/// Child-side entry point.
///
/// Returns `Ok(None)` when this process was not started by a
/// [`ProcessSpawner`], so a binary can call it first thing in `main`.
pub fn run_child(catalog: &Catalog) -> StimResult<Option<ProcessMetrics>> {
    let Ok(name) = std::env::var(PARTICIPANT_ENV) else {
        return Ok(None);
    };
    let text = std::env::var(SNAPSHOT_ENV)
        .map_err(|_| StimError::config(format!("{} is set but {} is missing", PARTICIPANT_ENV, SNAPSHOT_ENV)))?;
    let snapshot = Snapshot::decode(&text)?;
    let spec = snapshot
        .config
        .participant(&name)
        .cloned()
        .ok_or_else(|| StimError::config(format!("participant '{}' is not in the snapshot", name)))?;

    let level = std::env::var(CHILD_LOG_ENV)
        .ok()
        .and_then(|l| l.parse().ok())
        .unwrap_or(log::LevelFilter::Info);
    SharedLogger::new(name.as_str(), snapshot.registry.log_queue()?, level).install()?;

    run_participant(&spec, &snapshot.config, snapshot.registry, catalog).map(Some)
}
