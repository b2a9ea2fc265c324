//! # Attributes
//!
//! Named, append-only circular buffers of time-stamped values living in
//! shared memory. One producer writes; any number of processes read.
//!
//! - [`ArrayAttribute`]: fixed-shape numeric records, optionally chunked
//! - [`ObjectAttribute`]: serde values encoded into fixed-size slots
//! - [`RawAttribute`]: type-erased view used when forwarding to a sink
//!
//! A record at index `i` lives in slot `i % capacity` and becomes visible
//! only once its data, index and timestamp are all stored.

mod array;
mod clock;
mod dtype;
mod object;
mod raw;
mod ring;
mod spec;

pub use array::{ArrayAttribute, ArrayRead};
pub use clock::LogicalClock;
pub use dtype::{Dtype, Element};
pub use object::{ObjectAttribute, ObjectRead};
pub use raw::{RawAttribute, RawRecord};
pub use ring::RingCore;
pub use spec::{AttributeSpec, Layout, MAX_CAPACITY, MAX_CHUNKS, MAX_DIMS};
