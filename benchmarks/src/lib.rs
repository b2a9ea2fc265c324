//! Shared fixtures for the stimrt benchmarks

use std::path::Path;
use std::sync::Arc;

use stimrt::attribute::{ArrayAttribute, AttributeSpec, LogicalClock, RingCore};
use stimrt::StimResult;

/// Deterministic payload of `size` bytes
pub fn create_payload(size: usize) -> Vec<u8> {
    (0..size).map(|i| (i & 0xFF) as u8).collect()
}

/// Byte attribute created in `dir`, ready for writing
pub fn byte_attribute(dir: &Path, spec: AttributeSpec) -> StimResult<ArrayAttribute<u8>> {
    let core = Arc::new(RingCore::create(dir, &spec)?);
    ArrayAttribute::new(core, LogicalClock::new())
}
