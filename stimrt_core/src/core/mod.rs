//! # Process-side building blocks
//!
//! - **Routine**: per-tick computation bundled with the attributes it produces
//! - **Participant**: process-specific hooks around the protocol state machine
//! - **ProcessCore**: the tick loop every participant runs
//! - **SharedState**: lifecycle states, protocol cursor and control flags
//! - **Recorder**: forwards recorded attributes to a durable sink
//!
//! ## Participant lifecycle
//!
//! 1. **STARTING** - attached to the session, routines being initialized
//! 2. **IDLE** - ticking, waiting for a protocol
//! 3. **Protocol** - follows the Controller phase by phase, back to IDLE
//! 4. **STOPPED** - after a shutdown message or the shared shutdown flag

pub mod catalog;
pub mod log_buffer;
pub mod process;
pub mod routine;
pub mod sink;
pub mod state;

pub use catalog::Catalog;
pub use log_buffer::{LogRecord, SharedLogQueue, SharedLogger};
pub use process::{
    run_participant, IdleParticipant, Participant, ProcessContext, ProcessCore, ProcessMetrics,
    ProcessOptions,
};
pub use routine::{
    AttributeSetup, ExposedTable, Routine, RoutineContext, RoutineEntry, RoutineSet, RoutineSlot,
    TickInputs,
};
pub use sink::{null_sink_factory, Dataset, DurableSink, MemorySink, NullSink, Recorder, SinkFactory};
pub use state::{ProcessState, ProtocolCursor, SharedState, MAX_PARTICIPANTS};
