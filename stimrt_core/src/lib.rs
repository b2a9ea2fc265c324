//! # stimrt core
//!
//! Runtime for multi-process stimulation experiments on one host.
//!
//! A Controller process sequences timed protocols across a group of
//! participant processes (camera, display, io, worker, gui). They share:
//!
//! - **Attributes**: named ring buffers of time-stamped values in shared memory
//! - **Shared state**: every participant's lifecycle state and the protocol cursor
//! - **Channels**: per-participant message queues carrying RPC and control signals
//! - **Log queue**: participant log records drained by the Controller
//!
//! ## Quick Start
//!
//! ```rust,ignore
//! use stimrt_core::{AttributeSetup, AttributeSpec, Dtype, Routine, RoutineContext, StimResult};
//!
//! struct Phase {
//!     out: Option<stimrt_core::ArrayAttribute<f64>>,
//! }
//!
//! impl Routine for Phase {
//!     fn name(&self) -> &str { "Phase" }
//!
//!     fn setup(&self, setup: &mut AttributeSetup) -> StimResult<()> {
//!         setup.declare(AttributeSpec::scalar("phase", Dtype::F64, 1024))
//!     }
//!
//!     fn initialize(&mut self, registry: &stimrt_core::Registry) -> StimResult<()> {
//!         self.out = Some(registry.array("phase")?);
//!         Ok(())
//!     }
//!
//!     fn main(&mut self, ctx: &mut RoutineContext<'_>) -> StimResult<()> {
//!         if let Some(out) = &self.out {
//!             out.write_scalar(ctx.time.sin())?;
//!         }
//!         Ok(())
//!     }
//! }
//! ```

pub mod attribute;
pub mod communication;
pub mod config;
pub mod core;
pub mod error;
pub mod memory;
pub mod params;
pub mod protocol;
pub mod registry;
pub mod scheduling;

// Re-export commonly used types for easy access
pub use attribute::{ArrayAttribute, AttributeSpec, Dtype, Element, Layout, ObjectAttribute, RawAttribute};
pub use communication::{Message, RpcCall, Signal};
pub use config::{ParticipantSpec, RecordingConfig, Role, StimConfig, CONTROLLER_NAME};
pub use core::{
    AttributeSetup, Catalog, DurableSink, ExposedTable, IdleParticipant, Participant, ProcessContext,
    ProcessCore, ProcessState, Routine, RoutineContext, SinkFactory, TickInputs,
};
pub use error::{StimError, StimResult};
pub use params::Params;
pub use protocol::{Phase, Protocol, ProtocolLibrary};
pub use registry::Registry;
pub use scheduling::{Controller, ProcessSpawner, Spawner, ThreadSpawner};
