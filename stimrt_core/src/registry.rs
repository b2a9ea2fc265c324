//! Session registry
//!
//! Built once by the Controller at setup: it fixes the participant order
//! (slot 0 is the Controller) and the declared attributes, creates every
//! shared region, and travels to participants inside the session snapshot so
//! they can attach by name.

use crate::attribute::{
    ArrayAttribute, AttributeSpec, Element, LogicalClock, ObjectAttribute, RawAttribute, RingCore,
};
use crate::communication::{ChannelEnd, ChannelSide};
use crate::config::CONTROLLER_NAME;
use crate::core::log_buffer::SharedLogQueue;
use crate::core::state::{SharedState, MAX_PARTICIPANTS};
use crate::error::{StimError, StimResult};
use crate::memory::{shm_attributes_dir, shm_channels_dir};
use parking_lot::Mutex;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};
use std::sync::Arc;

/// Declared attribute and the routine producing it
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AttributeEntry {
    pub process: String,
    pub routine: String,
    pub spec: AttributeSpec,
}

/// Controller-side handles produced when the registry creates the session
#[derive(Debug)]
pub struct SessionHandles {
    pub shared: SharedState,
    pub logs: SharedLogQueue,
    /// Controller ends of the participant channels, by participant slot
    pub channels: BTreeMap<usize, ChannelEnd>,
}

#[derive(Clone, Serialize, Deserialize)]
pub struct Registry {
    session_dir: PathBuf,
    participants: Vec<String>,
    attributes: BTreeMap<String, AttributeEntry>,
    queue_bytes: usize,
    #[serde(skip)]
    clock: LogicalClock,
    #[serde(skip)]
    rings: Arc<Mutex<HashMap<String, Arc<RingCore>>>>,
}

impl Registry {
    pub fn new(session_dir: impl Into<PathBuf>, participants: &[String], queue_bytes: usize) -> StimResult<Self> {
        let mut names = vec![CONTROLLER_NAME.to_string()];
        for name in participants {
            if names.contains(name) {
                return Err(StimError::InvalidInput(format!(
                    "participant '{}' registered twice",
                    name
                )));
            }
            names.push(name.clone());
        }
        if names.len() > MAX_PARTICIPANTS {
            return Err(StimError::InvalidInput(format!(
                "{} participants exceed the limit of {}",
                names.len(),
                MAX_PARTICIPANTS
            )));
        }
        Ok(Self {
            session_dir: session_dir.into(),
            participants: names,
            attributes: BTreeMap::new(),
            queue_bytes,
            clock: LogicalClock::new(),
            rings: Arc::default(),
        })
    }

    /// Record an attribute declaration; names are unique per session
    pub fn declare(&mut self, process: &str, routine: &str, spec: AttributeSpec) -> StimResult<()> {
        spec.validate()?;
        self.slot_of(process)?;
        if let Some(existing) = self.attributes.get(&spec.name) {
            return Err(StimError::InvalidInput(format!(
                "attribute '{}' is already declared by {}.{}",
                spec.name, existing.process, existing.routine
            )));
        }
        self.attributes.insert(
            spec.name.clone(),
            AttributeEntry {
                process: process.to_string(),
                routine: routine.to_string(),
                spec,
            },
        );
        Ok(())
    }

    /// Create every shared region of the session.
    ///
    /// Must run before any participant starts.
    pub fn create_session(&self) -> StimResult<SessionHandles> {
        if self.session_dir.exists() {
            log::warn!(
                "session directory {} already exists, replacing it",
                self.session_dir.display()
            );
            std::fs::remove_dir_all(&self.session_dir)?;
        }
        std::fs::create_dir_all(&self.session_dir)?;

        let shared = SharedState::create(&self.session_dir, self.participants.len())?;
        let logs = SharedLogQueue::create(&self.session_dir)?;

        let channels_dir = shm_channels_dir(&self.session_dir);
        let mut channels = BTreeMap::new();
        for (slot, name) in self.participants.iter().enumerate().skip(1) {
            channels.insert(slot, ChannelEnd::create(&channels_dir, name, self.queue_bytes)?);
        }

        let attributes_dir = shm_attributes_dir(&self.session_dir);
        let mut rings = self.rings.lock();
        for (name, entry) in &self.attributes {
            rings.insert(
                name.clone(),
                Arc::new(RingCore::create(&attributes_dir, &entry.spec)?),
            );
        }

        log::info!(
            "session {} created: {} participants, {} attributes",
            self.session_dir.display(),
            self.participants.len(),
            self.attributes.len()
        );
        Ok(SessionHandles {
            shared,
            logs,
            channels,
        })
    }

    /// Copy for another process or thread: own clock, own attachments
    pub fn fork(&self) -> Self {
        Self {
            session_dir: self.session_dir.clone(),
            participants: self.participants.clone(),
            attributes: self.attributes.clone(),
            queue_bytes: self.queue_bytes,
            clock: LogicalClock::new(),
            rings: Arc::default(),
        }
    }

    pub fn session_dir(&self) -> &Path {
        &self.session_dir
    }

    /// Participant names in slot order, Controller first
    pub fn participants(&self) -> &[String] {
        &self.participants
    }

    pub fn slot_of(&self, name: &str) -> StimResult<usize> {
        self.participants
            .iter()
            .position(|p| p == name)
            .ok_or_else(|| StimError::InvalidInput(format!("unknown participant '{}'", name)))
    }

    pub fn attributes(&self) -> impl Iterator<Item = &AttributeEntry> {
        self.attributes.values()
    }

    pub fn attribute(&self, name: &str) -> StimResult<&AttributeEntry> {
        self.attributes
            .get(name)
            .ok_or_else(|| StimError::InvalidInput(format!("unknown attribute '{}'", name)))
    }

    pub fn clock(&self) -> &LogicalClock {
        &self.clock
    }

    /// Shared ring of a declared attribute, attached on first use
    pub fn ring(&self, name: &str) -> StimResult<Arc<RingCore>> {
        let entry = self.attribute(name)?;
        let mut rings = self.rings.lock();
        if let Some(ring) = rings.get(name) {
            return Ok(Arc::clone(ring));
        }

        let ring = RingCore::open(&shm_attributes_dir(&self.session_dir), name)?;
        if ring.spec() != &entry.spec {
            return Err(StimError::ShapeMismatch(format!(
                "attribute '{}' in shared memory does not match its declaration",
                name
            )));
        }
        let ring = Arc::new(ring);
        rings.insert(name.to_string(), Arc::clone(&ring));
        Ok(ring)
    }

    pub fn array<T: Element>(&self, name: &str) -> StimResult<ArrayAttribute<T>> {
        ArrayAttribute::new(self.ring(name)?, self.clock.clone())
    }

    pub fn object<T: Serialize + DeserializeOwned>(&self, name: &str) -> StimResult<ObjectAttribute<T>> {
        ObjectAttribute::new(self.ring(name)?, self.clock.clone())
    }

    pub fn raw(&self, name: &str) -> StimResult<RawAttribute> {
        Ok(RawAttribute::new(self.ring(name)?))
    }

    pub fn shared_state(&self) -> StimResult<SharedState> {
        SharedState::open(&self.session_dir)
    }

    pub fn log_queue(&self) -> StimResult<SharedLogQueue> {
        SharedLogQueue::open(&self.session_dir)
    }

    /// Participant-side end of `name`'s channel
    pub fn participant_channel(&self, name: &str) -> StimResult<ChannelEnd> {
        self.slot_of(name)?;
        ChannelEnd::open(
            &shm_channels_dir(&self.session_dir),
            name,
            ChannelSide::Participant,
        )
    }

    /// Remove every region of the session
    pub fn teardown(&self) -> StimResult<()> {
        self.rings.lock().clear();
        if self.session_dir.exists() {
            std::fs::remove_dir_all(&self.session_dir)?;
            log::info!("session {} removed", self.session_dir.display());
        }
        Ok(())
    }
}

impl std::fmt::Debug for Registry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Registry")
            .field("session_dir", &self.session_dir)
            .field("participants", &self.participants)
            .field("attributes", &self.attributes.keys().collect::<Vec<_>>())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::attribute::Dtype;
    use crate::core::state::ProcessState;

    fn registry(dir: &Path) -> Registry {
        let mut registry = Registry::new(
            dir.join("session"),
            &["camera".to_string(), "display".to_string()],
            4096,
        )
        .unwrap();
        registry
            .declare("camera", "Frames", AttributeSpec::array("frame", Dtype::U8, &[4, 4], 8))
            .unwrap();
        registry
            .declare("display", "Grating", AttributeSpec::scalar("phase", Dtype::F64, 16))
            .unwrap();
        registry
    }

    #[test]
    fn test_slots_and_declarations() {
        let dir = tempfile::tempdir().unwrap();
        let mut registry = registry(dir.path());
        assert_eq!(registry.participants()[0], CONTROLLER_NAME);
        assert_eq!(registry.slot_of("display").unwrap(), 2);
        assert!(registry.slot_of("gui").is_err());

        let duplicate = registry.declare("display", "Other", AttributeSpec::scalar("phase", Dtype::F64, 4));
        assert!(duplicate.is_err());
        let unknown_process = registry.declare("gui", "X", AttributeSpec::scalar("y", Dtype::F64, 4));
        assert!(unknown_process.is_err());
    }

    #[test]
    fn test_snapshot_fork_attaches_same_memory() {
        let dir = tempfile::tempdir().unwrap();
        let registry = registry(dir.path());
        let handles = registry.create_session().unwrap();
        assert_eq!(handles.channels.len(), 2);

        let json = serde_json::to_string(&registry).unwrap();
        let remote: Registry = serde_json::from_str(&json).unwrap();

        let writer = registry.array::<f64>("phase").unwrap();
        writer.write_at(&[0.25], 1.0).unwrap();
        let reader = remote.array::<f64>("phase").unwrap();
        assert_eq!(reader.read(1).unwrap().values, vec![0.25]);

        remote.shared_state().unwrap().set_state(1, ProcessState::Idle).unwrap();
        assert_eq!(handles.shared.state(1).unwrap(), ProcessState::Idle);

        assert!(matches!(remote.array::<f32>("phase"), Err(StimError::TypeMismatch(_))));
        assert!(remote.participant_channel("camera").is_ok());

        registry.teardown().unwrap();
        assert!(!registry.session_dir().exists());
    }

    #[test]
    fn test_fork_has_independent_clock() {
        let dir = tempfile::tempdir().unwrap();
        let registry = registry(dir.path());
        let fork = registry.fork();
        fork.clock().set(3.0);
        assert_eq!(registry.clock().now(), 0.0);
    }
}
