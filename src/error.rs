use crate::ipc::protocol::{ProtocolError, ReplyStatus};
use crate::ipc::queue::QueueError;
use thiserror::Error;

/// Domain errors raised by the engine, the device registry and the driver context
#[derive(Error, Debug, Clone, PartialEq)]
pub enum CompensationError {
    #[error("Invalid device id: {0}")]
    InvalidDeviceId(u32),

    #[error("Device not found: {0}")]
    DeviceNotFound(u32),

    #[error("Device {0} cannot be both target and reference")]
    SameDevice(u32),

    #[error("Device {0} is a head-mounted display and cannot be the reference tracker")]
    HmdAsReference(u32),

    #[error("Device {0} has an invalid class and cannot be the reference tracker")]
    InvalidReferenceClass(u32),

    #[error("Device slot {0} already in use")]
    AlreadyInUse(u32),

    #[error("Device handle is stale")]
    StaleHandle,

    #[error("Zero pose already captured")]
    ZeroPoseAlreadySet,

    #[error("Invalid parameters: {0}")]
    InvalidParameters(String),

    #[error("Shared memory error: {0}")]
    SharedMemory(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl CompensationError {
    /// Wire status reported to IPC clients
    pub fn status(&self) -> ReplyStatus {
        match self {
            CompensationError::InvalidDeviceId(_)
            | CompensationError::SameDevice(_)
            | CompensationError::HmdAsReference(_)
            | CompensationError::InvalidReferenceClass(_) => ReplyStatus::InvalidId,
            CompensationError::DeviceNotFound(_) | CompensationError::StaleHandle => {
                ReplyStatus::NotFound
            }
            CompensationError::AlreadyInUse(_) => ReplyStatus::AlreadyInUse,
            CompensationError::ZeroPoseAlreadySet | CompensationError::InvalidParameters(_) => {
                ReplyStatus::InvalidOperation
            }
            CompensationError::SharedMemory(_) => ReplyStatus::SharedMemoryError,
            CompensationError::Internal(_) => ReplyStatus::UnknownError,
        }
    }
}

/// Result type for engine and driver operations
pub type CResult<T> = Result<T, CompensationError>;

/// Failures seen by an IPC client
#[derive(Error, Debug)]
pub enum ClientError {
    #[error("Not connected")]
    NotConnected,

    #[error("Already connected")]
    AlreadyConnected,

    #[error("Protocol version mismatch (client {client})")]
    VersionMismatch { client: u32 },

    #[error("Request failed: {0}")]
    Status(ReplyStatus),

    #[error("Unexpected reply: {0}")]
    UnexpectedReply(String),

    #[error("Connection closed")]
    ConnectionClosed,

    #[error("Timed out waiting for reply")]
    Timeout,

    #[error("Queue error: {0}")]
    Queue(#[from] QueueError),

    #[error("Protocol error: {0}")]
    Protocol(#[from] ProtocolError),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_domain_errors_map_to_status() {
        assert_eq!(CompensationError::SameDevice(1).status(), ReplyStatus::InvalidId);
        assert_eq!(CompensationError::HmdAsReference(0).status(), ReplyStatus::InvalidId);
        assert_eq!(CompensationError::DeviceNotFound(9).status(), ReplyStatus::NotFound);
        assert_eq!(
            CompensationError::InvalidParameters("nan".to_string()).status(),
            ReplyStatus::InvalidOperation
        );
        assert_eq!(
            CompensationError::SharedMemory("open".to_string()).status(),
            ReplyStatus::SharedMemoryError
        );
    }
}
