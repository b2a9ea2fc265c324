//! # Inter-process messaging
//!
//! Each participant owns one bidirectional channel to the Controller, made
//! of two shared-memory [`FrameQueue`]s. Frames carry JSON-encoded
//! [`Message`]s; peer-to-peer RPC is relayed by the Controller.

pub mod channel;
pub mod frame_queue;
pub mod message;

pub use channel::{ChannelEnd, ChannelSide};
pub use frame_queue::{FrameQueue, DEFAULT_QUEUE_BYTES};
pub use message::{Message, RpcCall, Signal};
