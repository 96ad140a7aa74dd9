//! Control channel between the driver and control clients
//!
//! One request queue owned by the server, one reply queue per client.

pub mod client;
pub mod protocol;
pub mod queue;
pub mod server;

pub use client::CompensationClient;
pub use protocol::{Reply, ReplyKind, ReplyStatus, Request, RequestKind, PROTOCOL_VERSION};
pub use queue::{default_namespace, MemoryNamespace, MessageQueue, QueueError, QueueNamespace};
pub use server::{ControlHandler, IpcServer};

#[cfg(unix)]
pub use queue::DatagramNamespace;
