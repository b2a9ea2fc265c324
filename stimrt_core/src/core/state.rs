use crate::error::{StimError, StimResult};
use crate::memory::{SeqText, ShmRegion};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::mem;
use std::path::Path;
use std::ptr::NonNull;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;

const STATE_MAGIC: u64 = 0x5354_494d_5354_4154;
const NO_PHASE: u64 = u64::MAX;

/// Maximum participants in one session, Controller included
pub const MAX_PARTICIPANTS: usize = 32;

/// Region name of the shared state block
pub const SHARED_STATE_REGION: &str = "shared_state";

/// Lifecycle state of a participant (and of the Controller itself)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
#[repr(u8)]
pub enum ProcessState {
    Na = 0,
    Starting = 1,
    Idle = 2,
    PrepareProtocol = 3,
    WaitForPhase = 4,
    PreparePhase = 5,
    Ready = 6,
    Running = 7,
    PhaseEnd = 8,
    ProtocolAbort = 9,
    ProtocolEnd = 10,
    Stopped = 11,
}

impl ProcessState {
    pub fn from_u8(value: u8) -> Option<Self> {
        Some(match value {
            0 => ProcessState::Na,
            1 => ProcessState::Starting,
            2 => ProcessState::Idle,
            3 => ProcessState::PrepareProtocol,
            4 => ProcessState::WaitForPhase,
            5 => ProcessState::PreparePhase,
            6 => ProcessState::Ready,
            7 => ProcessState::Running,
            8 => ProcessState::PhaseEnd,
            9 => ProcessState::ProtocolAbort,
            10 => ProcessState::ProtocolEnd,
            11 => ProcessState::Stopped,
            _ => return None,
        })
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            ProcessState::Na => "NA",
            ProcessState::Starting => "STARTING",
            ProcessState::Idle => "IDLE",
            ProcessState::PrepareProtocol => "PREPARE_PROTOCOL",
            ProcessState::WaitForPhase => "WAIT_FOR_PHASE",
            ProcessState::PreparePhase => "PREPARE_PHASE",
            ProcessState::Ready => "READY",
            ProcessState::Running => "RUNNING",
            ProcessState::PhaseEnd => "PHASE_END",
            ProcessState::ProtocolAbort => "PROTOCOL_ABORT",
            ProcessState::ProtocolEnd => "PROTOCOL_END",
            ProcessState::Stopped => "STOPPED",
        }
    }

    /// Participants in these states take part in readiness checks
    pub fn is_live(&self) -> bool {
        !matches!(
            self,
            ProcessState::Na | ProcessState::Starting | ProcessState::Stopped
        )
    }
}

impl fmt::Display for ProcessState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[repr(C, align(64))]
struct StateSlot {
    state: AtomicU32,
    pid: AtomicU32,
    /// Logical time of the last tick, as f64 bits
    heartbeat: AtomicU64,
    ticks: AtomicU64,
}

#[repr(C)]
struct CursorBlock {
    generation: AtomicU64,
    phase_index: AtomicU64,
    phase_start: AtomicU64,
    phase_stop: AtomicU64,
    protocol: SeqText,
}

#[repr(C)]
struct ControlBlock {
    shutdown_requested: AtomicU32,
    recording_active: AtomicU32,
    recording_generation: AtomicU64,
    recording_folder: SeqText,
}

#[repr(C, align(64))]
struct SharedBlock {
    magic: AtomicU64,
    count: AtomicU32,
    cursor: CursorBlock,
    control: ControlBlock,
    slots: [StateSlot; MAX_PARTICIPANTS],
}

/// Snapshot of the protocol cursor
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProtocolCursor {
    /// Empty when no protocol is active
    pub protocol: String,
    pub phase_index: Option<usize>,
    pub phase_start: f64,
    pub phase_stop: f64,
    /// Incremented every time a protocol starts
    pub generation: u64,
}

impl ProtocolCursor {
    pub fn is_active(&self) -> bool {
        !self.protocol.is_empty()
    }
}

/// Process-wide shared values: one state slot per participant, the
/// protocol cursor and the control block.
///
/// Every field has exactly one writer: a participant owns its slot, the
/// Controller owns the cursor, the control block and slot 0. Readers never
/// lock.
#[derive(Clone)]
pub struct SharedState {
    region: Arc<ShmRegion>,
    block: NonNull<SharedBlock>,
}

unsafe impl Send for SharedState {}
unsafe impl Sync for SharedState {}

impl SharedState {
    pub fn create(dir: &Path, participants: usize) -> StimResult<Self> {
        if participants == 0 || participants > MAX_PARTICIPANTS {
            return Err(StimError::InvalidInput(format!(
                "{} participants, supported range is 1..={}",
                participants, MAX_PARTICIPANTS
            )));
        }
        let region = ShmRegion::create(dir, SHARED_STATE_REGION, mem::size_of::<SharedBlock>())?;
        let block = region.as_ptr() as *mut SharedBlock;
        unsafe {
            (*block).count.store(participants as u32, Ordering::Relaxed);
            (*block)
                .cursor
                .phase_index
                .store(NO_PHASE, Ordering::Relaxed);
            (*block).magic.store(STATE_MAGIC, Ordering::Release);
        }
        Self::from_region(region)
    }

    pub fn open(dir: &Path) -> StimResult<Self> {
        let region = ShmRegion::open(dir, SHARED_STATE_REGION)?;
        if region.size() < mem::size_of::<SharedBlock>() {
            return Err(StimError::Internal("shared state region is truncated".into()));
        }
        let state = Self::from_region(region)?;
        if state.block().magic.load(Ordering::Acquire) != STATE_MAGIC {
            return Err(StimError::Internal("shared state is not initialised".into()));
        }
        Ok(state)
    }

    fn from_region(region: ShmRegion) -> StimResult<Self> {
        let block = NonNull::new(region.as_ptr() as *mut SharedBlock)
            .ok_or_else(|| StimError::Internal("null shared state pointer".into()))?;
        Ok(Self {
            region: Arc::new(region),
            block,
        })
    }

    #[inline]
    fn block(&self) -> &SharedBlock {
        unsafe { self.block.as_ref() }
    }

    fn slot(&self, index: usize) -> StimResult<&StateSlot> {
        if index >= self.participant_count() {
            return Err(StimError::range(format!(
                "participant slot {} out of {}",
                index,
                self.participant_count()
            )));
        }
        Ok(&self.block().slots[index])
    }

    pub fn participant_count(&self) -> usize {
        (self.block().count.load(Ordering::Relaxed) as usize).min(MAX_PARTICIPANTS)
    }

    pub fn region_path(&self) -> &Path {
        self.region.path()
    }

    // ---- per-participant slots ----

    pub fn state(&self, index: usize) -> StimResult<ProcessState> {
        let raw = self.slot(index)?.state.load(Ordering::Acquire);
        Ok(ProcessState::from_u8(raw as u8).unwrap_or(ProcessState::Na))
    }

    pub fn set_state(&self, index: usize, state: ProcessState) -> StimResult<()> {
        self.slot(index)?
            .state
            .store(state as u32, Ordering::Release);
        Ok(())
    }

    pub fn states(&self) -> Vec<ProcessState> {
        (0..self.participant_count())
            .map(|i| self.state(i).unwrap_or(ProcessState::Na))
            .collect()
    }

    pub fn set_pid(&self, index: usize, pid: u32) -> StimResult<()> {
        self.slot(index)?.pid.store(pid, Ordering::Relaxed);
        Ok(())
    }

    pub fn pid(&self, index: usize) -> StimResult<u32> {
        Ok(self.slot(index)?.pid.load(Ordering::Relaxed))
    }

    /// Publish liveness for one tick
    pub fn beat(&self, index: usize, time: f64) -> StimResult<()> {
        let slot = self.slot(index)?;
        slot.heartbeat.store(time.to_bits(), Ordering::Relaxed);
        slot.ticks.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    pub fn heartbeat(&self, index: usize) -> StimResult<(f64, u64)> {
        let slot = self.slot(index)?;
        Ok((
            f64::from_bits(slot.heartbeat.load(Ordering::Relaxed)),
            slot.ticks.load(Ordering::Relaxed),
        ))
    }

    // ---- protocol cursor ----

    pub fn cursor(&self) -> ProtocolCursor {
        let cursor = &self.block().cursor;
        let phase_index = cursor.phase_index.load(Ordering::Acquire);
        ProtocolCursor {
            protocol: cursor.protocol.get(),
            phase_index: (phase_index != NO_PHASE).then_some(phase_index as usize),
            phase_start: f64::from_bits(cursor.phase_start.load(Ordering::Acquire)),
            phase_stop: f64::from_bits(cursor.phase_stop.load(Ordering::Acquire)),
            generation: cursor.generation.load(Ordering::Acquire),
        }
    }

    /// Name the active protocol and bump the generation
    pub fn begin_protocol(&self, name: &str) {
        let cursor = &self.block().cursor;
        cursor.protocol.set(name);
        cursor.phase_index.store(NO_PHASE, Ordering::Release);
        cursor.generation.fetch_add(1, Ordering::AcqRel);
    }

    pub fn set_phase_index(&self, index: usize) {
        self.block()
            .cursor
            .phase_index
            .store(index as u64, Ordering::Release);
    }

    pub fn set_phase_window(&self, start: f64, stop: f64) {
        let cursor = &self.block().cursor;
        cursor.phase_start.store(start.to_bits(), Ordering::Release);
        cursor.phase_stop.store(stop.to_bits(), Ordering::Release);
    }

    /// Force the running phase to end now
    pub fn set_phase_stop(&self, stop: f64) {
        self.block()
            .cursor
            .phase_stop
            .store(stop.to_bits(), Ordering::Release);
    }

    pub fn clear_protocol(&self) {
        let cursor = &self.block().cursor;
        cursor.protocol.clear();
        cursor.phase_index.store(NO_PHASE, Ordering::Release);
    }

    // ---- control block ----

    pub fn request_shutdown(&self) {
        self.block()
            .control
            .shutdown_requested
            .store(1, Ordering::Release);
    }

    pub fn shutdown_requested(&self) -> bool {
        self.block().control.shutdown_requested.load(Ordering::Acquire) != 0
    }

    /// Turn recording on or off; each switch-on starts a new recording generation
    pub fn set_recording(&self, active: bool) {
        let control = &self.block().control;
        if active {
            control.recording_generation.fetch_add(1, Ordering::AcqRel);
        }
        control
            .recording_active
            .store(active as u32, Ordering::Release);
    }

    pub fn recording_active(&self) -> bool {
        self.block().control.recording_active.load(Ordering::Acquire) != 0
    }

    pub fn recording_generation(&self) -> u64 {
        self.block()
            .control
            .recording_generation
            .load(Ordering::Acquire)
    }

    pub fn set_recording_folder(&self, folder: &str) -> StimResult<()> {
        if !self.block().control.recording_folder.set(folder) {
            return Err(StimError::InvalidInput(format!(
                "recording folder path is too long: {}",
                folder
            )));
        }
        Ok(())
    }

    pub fn recording_folder(&self) -> String {
        self.block().control.recording_folder.get()
    }
}

impl fmt::Debug for SharedState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SharedState")
            .field("states", &self.states())
            .field("cursor", &self.cursor())
            .field("recording", &self.recording_active())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_state_codes() {
        for code in 0..=11u8 {
            assert_eq!(ProcessState::from_u8(code).unwrap() as u8, code);
        }
        assert!(ProcessState::from_u8(12).is_none());
        assert_eq!(ProcessState::WaitForPhase.to_string(), "WAIT_FOR_PHASE");
        assert!(!ProcessState::Starting.is_live());
        assert!(ProcessState::Idle.is_live());
    }

    #[test]
    fn test_states_visible_across_handles() {
        let dir = tempfile::tempdir().unwrap();
        let controller = SharedState::create(dir.path(), 3).unwrap();
        let participant = SharedState::open(dir.path()).unwrap();

        assert_eq!(participant.states(), vec![ProcessState::Na; 3]);
        participant.set_state(2, ProcessState::Idle).unwrap();
        assert_eq!(controller.state(2).unwrap(), ProcessState::Idle);
        assert!(controller.state(3).is_err());
    }

    #[test]
    fn test_cursor_lifecycle() {
        let dir = tempfile::tempdir().unwrap();
        let state = SharedState::create(dir.path(), 2).unwrap();
        assert!(!state.cursor().is_active());
        assert_eq!(state.cursor().phase_index, None);

        state.begin_protocol("gratings");
        state.set_phase_index(1);
        state.set_phase_window(0.1, 1.1);
        let cursor = state.cursor();
        assert_eq!(cursor.protocol, "gratings");
        assert_eq!(cursor.phase_index, Some(1));
        assert_eq!((cursor.phase_start, cursor.phase_stop), (0.1, 1.1));
        assert_eq!(cursor.generation, 1);

        state.clear_protocol();
        assert_eq!(state.cursor().protocol, "");
    }

    #[test]
    fn test_control_block() {
        let dir = tempfile::tempdir().unwrap();
        let state = SharedState::create(dir.path(), 1).unwrap();
        assert!(!state.shutdown_requested());
        state.request_shutdown();
        assert!(state.shutdown_requested());

        state.set_recording_folder("/data/session1").unwrap();
        state.set_recording(true);
        assert!(state.recording_active());
        assert_eq!(state.recording_generation(), 1);
        assert_eq!(state.recording_folder(), "/data/session1");
        state.set_recording(false);
        assert!(!state.recording_active());
    }
}
