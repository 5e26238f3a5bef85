//! Wire connection, protocol types, and the session runtime.

pub mod bridge;
pub mod client;
pub mod pending;
pub mod protocol;
pub mod router;
pub mod terminal;
pub mod transport;

pub use client::AgentClient;
pub use protocol::{ContentBlock, StopReason};
