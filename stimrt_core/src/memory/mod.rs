//! # Shared memory primitives
//!
//! - **ShmRegion**: memory-mapped file regions shared by the processes of a session
//! - **ShmMutex**: process-shared spin mutex living inside a region
//! - **SeqText**: single-writer text slot readable without locks
//!
//! Every higher-level structure (attribute rings, shared state, channel
//! queues) is a `#[repr(C)]` layout placed on top of one `ShmRegion`.

pub mod platform;
pub mod seq_text;
pub mod shm_mutex;
pub mod shm_region;

pub use platform::*;
pub use seq_text::{SeqText, SEQ_TEXT_CAPACITY};
pub use shm_mutex::{ShmMutex, ShmMutexGuard};
pub use shm_region::ShmRegion;
