//! # Controller and timing
//!
//! - **Controller**: owns the session, relays messages, sequences protocols
//! - **ProtocolScheduler**: the Controller's protocol state machine, free of I/O
//! - **Spawner**: starts participants on threads or as OS processes
//! - **Ticker**: fixed-interval pacing, coarse sleep then busy-wait
//!
//! ## Usage
//!
//! ```rust,ignore
//! use stimrt_core::{Catalog, Controller, StimConfig, ThreadSpawner};
//!
//! let config = StimConfig::load("session.toml".as_ref())?;
//! let catalog = Catalog::new();
//! let mut controller = Controller::new(config, &catalog)?;
//! controller.launch(&ThreadSpawner::new(catalog))?;
//! controller.run()?;
//! ```

pub mod controller;
pub mod scheduler;
pub mod spawner;
pub mod timing;

pub use controller::Controller;
pub use scheduler::{ProtocolScheduler, SchedulerConfig, SchedulerEvent};
pub use spawner::{
    run_child, ParticipantHandle, ProcessSpawner, Snapshot, Spawner, ThreadSpawner,
    PARTICIPANT_ENV, SNAPSHOT_ENV,
};
pub use timing::{measure_min_sleep, now, sleep_until, Ticker};
