//! # stimrt
//!
//! Shared-memory runtime for stimulation experiments spread over several
//! processes on one host: a Controller sequences timed protocols while
//! camera, display, io, worker and gui participants exchange data through
//! attributes and talk to each other by RPC.
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use stimrt::prelude::*;
//!
//! fn main() -> AnyResult<()> {
//!     let config = StimConfig::load("session.toml".as_ref())?;
//!     let catalog = stimrt::builtin::catalog()?;
//!     let mut controller = Controller::new(config, &catalog)?;
//!     controller.launch(&ThreadSpawner::new(catalog))?;
//!     controller.run()?;
//!     Ok(())
//! }
//! ```

// Re-export core components
pub use stimrt_core::{self, *};

pub mod builtin;

/// The stimrt prelude - everything a routine or participant needs
pub mod prelude {
    // Routines and participants
    pub use stimrt_core::core::{
        AttributeSetup, ExposedTable, Participant, ProcessContext, Routine, RoutineContext,
        TickInputs,
    };

    // Attributes
    pub use stimrt_core::attribute::{ArrayAttribute, AttributeSpec, Dtype, ObjectAttribute};

    // Messaging
    pub use stimrt_core::communication::{Message, RpcCall};

    // Session setup
    pub use stimrt_core::config::{ParticipantSpec, Role, StimConfig};
    pub use stimrt_core::core::Catalog;
    pub use stimrt_core::protocol::{Phase, Protocol};
    pub use stimrt_core::registry::Registry;
    pub use stimrt_core::scheduling::{Controller, ProcessSpawner, ThreadSpawner};

    // Error types
    pub use stimrt_core::error::{StimError, StimResult};

    // Common std types
    pub use std::sync::Arc;
    pub use std::time::Duration;

    // Common traits
    pub use serde::{Deserialize, Serialize};

    // Re-export anyhow for error handling
    pub use anyhow::{anyhow, bail, Context, Result as AnyResult};
}

/// Version information
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

pub fn version() -> &'static str {
    VERSION
}
