//! Wire records exchanged between the control client and the driver.
//!
//! Every record has a fixed size and little-endian layout so it fits one
//! message-queue slot.
//!
//! Request (152 bytes):
//! ```text
//!   0  u32  kind
//!   4  u32  message_id      0 = no reply expected
//!   8  i64  timestamp       ms since epoch
//!  16  u32  client_id
//!  20  u32  argument        protocol version / device id
//!  24  [u8; 128] body
//! ```
//!
//! Reply (32 bytes):
//! ```text
//!   0  u32  kind
//!   4  u32  message_id
//!   8  i64  timestamp
//!  16  u32  status
//!  20  [u8; 12] body
//! ```

use crate::compensation::{CompensationParameters, PoseOffset};
use crate::types::{CompensationMode, DeviceClass, DeviceRole};
use std::fmt;
use thiserror::Error;

pub const PROTOCOL_VERSION: u32 = 3;

pub const REQUEST_SIZE: usize = 152;
pub const REPLY_SIZE: usize = 32;

const REQUEST_BODY: usize = 24;
const REPLY_BODY: usize = 20;

/// Longest queue name a connect request can carry
pub const MAX_QUEUE_NAME: usize = REQUEST_SIZE - REQUEST_BODY;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum ProtocolError {
    #[error("Record size {actual} does not match expected {expected}")]
    WrongSize { expected: usize, actual: usize },

    #[error("Unknown request kind {0}")]
    UnknownRequest(u32),

    #[error("Unknown reply kind {0}")]
    UnknownReply(u32),

    #[error("Unknown reply status {0}")]
    UnknownStatus(u32),

    #[error("Invalid {field} value {value}")]
    InvalidField { field: &'static str, value: u32 },

    #[error("Queue name too long ({0} bytes)")]
    QueueNameTooLong(usize),

    #[error("Queue name is not valid UTF-8")]
    QueueNameEncoding,
}

/// Status carried by every reply
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum ReplyStatus {
    #[default]
    None,
    Ok,
    UnknownError,
    InvalidId,
    AlreadyInUse,
    NotFound,
    InvalidVersion,
    NotTracking,
    SharedMemoryError,
    InvalidOperation,
}

impl ReplyStatus {
    pub fn to_raw(self) -> u32 {
        match self {
            ReplyStatus::None => 0,
            ReplyStatus::Ok => 1,
            ReplyStatus::UnknownError => 2,
            ReplyStatus::InvalidId => 3,
            ReplyStatus::AlreadyInUse => 4,
            ReplyStatus::NotFound => 5,
            ReplyStatus::InvalidVersion => 6,
            ReplyStatus::NotTracking => 7,
            ReplyStatus::SharedMemoryError => 8,
            ReplyStatus::InvalidOperation => 9,
        }
    }

    pub fn from_raw(raw: u32) -> Result<Self, ProtocolError> {
        Ok(match raw {
            0 => ReplyStatus::None,
            1 => ReplyStatus::Ok,
            2 => ReplyStatus::UnknownError,
            3 => ReplyStatus::InvalidId,
            4 => ReplyStatus::AlreadyInUse,
            5 => ReplyStatus::NotFound,
            6 => ReplyStatus::InvalidVersion,
            7 => ReplyStatus::NotTracking,
            8 => ReplyStatus::SharedMemoryError,
            9 => ReplyStatus::InvalidOperation,
            other => return Err(ProtocolError::UnknownStatus(other)),
        })
    }
}

impl fmt::Display for ReplyStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let text = match self {
            ReplyStatus::None => "no status",
            ReplyStatus::Ok => "ok",
            ReplyStatus::UnknownError => "unknown error",
            ReplyStatus::InvalidId => "invalid id",
            ReplyStatus::AlreadyInUse => "already in use",
            ReplyStatus::NotFound => "not found",
            ReplyStatus::InvalidVersion => "invalid protocol version",
            ReplyStatus::NotTracking => "not tracking",
            ReplyStatus::SharedMemoryError => "shared memory error",
            ReplyStatus::InvalidOperation => "invalid operation",
        };
        f.write_str(text)
    }
}

#[derive(Clone, Debug, PartialEq)]
pub enum RequestKind {
    ClientConnect {
        protocol_version: u32,
        queue_name: String,
    },
    ClientDisconnect,
    Ping {
        nonce: u64,
    },
    GetDeviceInfo {
        device_id: u32,
    },
    SetCompensationMode {
        target_id: u32,
        reference_id: u32,
        mode: CompensationMode,
    },
    SetCompensationParameters(CompensationParameters),
    ResetZeroPose,
}

impl RequestKind {
    fn tag(&self) -> u32 {
        match self {
            RequestKind::ClientConnect { .. } => 1,
            RequestKind::ClientDisconnect => 2,
            RequestKind::Ping { .. } => 3,
            RequestKind::GetDeviceInfo { .. } => 4,
            RequestKind::SetCompensationMode { .. } => 5,
            RequestKind::SetCompensationParameters(_) => 6,
            RequestKind::ResetZeroPose => 7,
        }
    }
}

#[derive(Clone, Debug, PartialEq)]
pub struct Request {
    pub message_id: u32,
    pub client_id: u32,
    /// Milliseconds since epoch
    pub timestamp: i64,
    pub kind: RequestKind,
}

impl Request {
    pub fn new(client_id: u32, message_id: u32, kind: RequestKind) -> Self {
        Self {
            message_id,
            client_id,
            timestamp: now_millis(),
            kind,
        }
    }

    pub fn encode(&self) -> Result<[u8; REQUEST_SIZE], ProtocolError> {
        let mut buf = [0u8; REQUEST_SIZE];
        put_u32(&mut buf, 0, self.kind.tag());
        put_u32(&mut buf, 4, self.message_id);
        buf[8..16].copy_from_slice(&self.timestamp.to_le_bytes());
        put_u32(&mut buf, 16, self.client_id);

        let body = REQUEST_BODY;
        match &self.kind {
            RequestKind::ClientConnect {
                protocol_version,
                queue_name,
            } => {
                let name = queue_name.as_bytes();
                if name.len() > MAX_QUEUE_NAME {
                    return Err(ProtocolError::QueueNameTooLong(name.len()));
                }
                put_u32(&mut buf, 20, *protocol_version);
                buf[body..body + name.len()].copy_from_slice(name);
            }
            RequestKind::ClientDisconnect | RequestKind::ResetZeroPose => {}
            RequestKind::Ping { nonce } => {
                buf[body..body + 8].copy_from_slice(&nonce.to_le_bytes());
            }
            RequestKind::GetDeviceInfo { device_id } => put_u32(&mut buf, 20, *device_id),
            RequestKind::SetCompensationMode {
                target_id,
                reference_id,
                mode,
            } => {
                put_u32(&mut buf, body, *target_id);
                put_u32(&mut buf, body + 4, *reference_id);
                put_u32(&mut buf, body + 8, mode.to_raw());
            }
            RequestKind::SetCompensationParameters(params) => {
                put_f64(&mut buf, body, params.lpf_beta);
                put_u32(&mut buf, body + 8, params.samples);
                put_u32(&mut buf, body + 12, params.zero_velocity as u32);
                for (i, v) in params.offset.translation.iter().enumerate() {
                    put_f64(&mut buf, body + 16 + i * 8, *v);
                }
                for (i, v) in params.offset.rotation.iter().enumerate() {
                    put_f64(&mut buf, body + 40 + i * 8, *v);
                }
            }
        }
        Ok(buf)
    }

    /// Read only the routing fields, so a record with a bad body can still be answered
    pub fn decode_header(buf: &[u8]) -> Result<RequestHeader, ProtocolError> {
        if buf.len() != REQUEST_SIZE {
            return Err(ProtocolError::WrongSize {
                expected: REQUEST_SIZE,
                actual: buf.len(),
            });
        }
        Ok(RequestHeader {
            kind: get_u32(buf, 0),
            message_id: get_u32(buf, 4),
            client_id: get_u32(buf, 16),
        })
    }

    pub fn decode(buf: &[u8]) -> Result<Self, ProtocolError> {
        if buf.len() != REQUEST_SIZE {
            return Err(ProtocolError::WrongSize {
                expected: REQUEST_SIZE,
                actual: buf.len(),
            });
        }
        let body = REQUEST_BODY;
        let kind = match get_u32(buf, 0) {
            1 => {
                let raw = &buf[body..];
                let end = raw.iter().position(|b| *b == 0).unwrap_or(raw.len());
                let queue_name = std::str::from_utf8(&raw[..end])
                    .map_err(|_| ProtocolError::QueueNameEncoding)?
                    .to_string();
                RequestKind::ClientConnect {
                    protocol_version: get_u32(buf, 20),
                    queue_name,
                }
            }
            2 => RequestKind::ClientDisconnect,
            3 => RequestKind::Ping {
                nonce: get_u64(buf, body),
            },
            4 => RequestKind::GetDeviceInfo {
                device_id: get_u32(buf, 20),
            },
            5 => {
                let raw_mode = get_u32(buf, body + 8);
                let mode = CompensationMode::from_raw(raw_mode).ok_or(ProtocolError::InvalidField {
                    field: "compensation mode",
                    value: raw_mode,
                })?;
                RequestKind::SetCompensationMode {
                    target_id: get_u32(buf, body),
                    reference_id: get_u32(buf, body + 4),
                    mode,
                }
            }
            6 => {
                let read3 = |at: usize| {
                    [
                        get_f64(buf, at),
                        get_f64(buf, at + 8),
                        get_f64(buf, at + 16),
                    ]
                };
                RequestKind::SetCompensationParameters(CompensationParameters {
                    lpf_beta: get_f64(buf, body),
                    samples: get_u32(buf, body + 8),
                    zero_velocity: get_u32(buf, body + 12) != 0,
                    offset: PoseOffset {
                        translation: read3(body + 16),
                        rotation: read3(body + 40),
                    },
                })
            }
            7 => RequestKind::ResetZeroPose,
            other => return Err(ProtocolError::UnknownRequest(other)),
        };

        Ok(Self {
            message_id: get_u32(buf, 4),
            client_id: get_u32(buf, 16),
            timestamp: i64::from_le_bytes(take(buf, 8)),
            kind,
        })
    }
}

/// Routing fields of a request record
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct RequestHeader {
    pub kind: u32,
    pub message_id: u32,
    pub client_id: u32,
}

/// Wire tag of `ClientConnect`; its sender has no session to reply to yet
pub const CLIENT_CONNECT_TAG: u32 = 1;

#[derive(Clone, Debug, PartialEq)]
pub enum ReplyKind {
    ClientConnect {
        client_id: u32,
        protocol_version: u32,
    },
    Ping {
        nonce: u64,
    },
    Generic,
    DeviceInfo {
        device_id: u32,
        device_class: DeviceClass,
        role: DeviceRole,
    },
}

impl ReplyKind {
    fn tag(&self) -> u32 {
        match self {
            ReplyKind::ClientConnect { .. } => 1,
            ReplyKind::Ping { .. } => 2,
            ReplyKind::Generic => 3,
            ReplyKind::DeviceInfo { .. } => 4,
        }
    }
}

#[derive(Clone, Debug, PartialEq)]
pub struct Reply {
    pub message_id: u32,
    pub timestamp: i64,
    pub status: ReplyStatus,
    pub kind: ReplyKind,
}

impl Reply {
    pub fn new(message_id: u32, status: ReplyStatus, kind: ReplyKind) -> Self {
        Self {
            message_id,
            timestamp: now_millis(),
            status,
            kind,
        }
    }

    pub fn generic(message_id: u32, status: ReplyStatus) -> Self {
        Self::new(message_id, status, ReplyKind::Generic)
    }

    pub fn encode(&self) -> [u8; REPLY_SIZE] {
        let mut buf = [0u8; REPLY_SIZE];
        put_u32(&mut buf, 0, self.kind.tag());
        put_u32(&mut buf, 4, self.message_id);
        buf[8..16].copy_from_slice(&self.timestamp.to_le_bytes());
        put_u32(&mut buf, 16, self.status.to_raw());

        let body = REPLY_BODY;
        match &self.kind {
            ReplyKind::ClientConnect {
                client_id,
                protocol_version,
            } => {
                put_u32(&mut buf, body, *client_id);
                put_u32(&mut buf, body + 4, *protocol_version);
            }
            ReplyKind::Ping { nonce } => {
                buf[body..body + 8].copy_from_slice(&nonce.to_le_bytes());
            }
            ReplyKind::Generic => {}
            ReplyKind::DeviceInfo {
                device_id,
                device_class,
                role,
            } => {
                put_u32(&mut buf, body, *device_id);
                put_u32(&mut buf, body + 4, device_class.to_raw());
                put_u32(&mut buf, body + 8, role.to_raw());
            }
        }
        buf
    }

    pub fn decode(buf: &[u8]) -> Result<Self, ProtocolError> {
        if buf.len() != REPLY_SIZE {
            return Err(ProtocolError::WrongSize {
                expected: REPLY_SIZE,
                actual: buf.len(),
            });
        }
        let body = REPLY_BODY;
        let kind = match get_u32(buf, 0) {
            1 => ReplyKind::ClientConnect {
                client_id: get_u32(buf, body),
                protocol_version: get_u32(buf, body + 4),
            },
            2 => ReplyKind::Ping {
                nonce: get_u64(buf, body),
            },
            3 => ReplyKind::Generic,
            4 => {
                let raw_class = get_u32(buf, body + 4);
                let raw_role = get_u32(buf, body + 8);
                ReplyKind::DeviceInfo {
                    device_id: get_u32(buf, body),
                    device_class: DeviceClass::from_raw(raw_class).ok_or(
                        ProtocolError::InvalidField {
                            field: "device class",
                            value: raw_class,
                        },
                    )?,
                    role: DeviceRole::from_raw(raw_role).ok_or(ProtocolError::InvalidField {
                        field: "device role",
                        value: raw_role,
                    })?,
                }
            }
            other => return Err(ProtocolError::UnknownReply(other)),
        };

        Ok(Self {
            message_id: get_u32(buf, 4),
            timestamp: i64::from_le_bytes(take(buf, 8)),
            status: ReplyStatus::from_raw(get_u32(buf, 16))?,
            kind,
        })
    }
}

pub fn now_millis() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

// ===== Little-endian helpers =====

fn take<const N: usize>(buf: &[u8], offset: usize) -> [u8; N] {
    let mut out = [0u8; N];
    out.copy_from_slice(&buf[offset..offset + N]);
    out
}

fn put_u32(buf: &mut [u8], offset: usize, value: u32) {
    buf[offset..offset + 4].copy_from_slice(&value.to_le_bytes());
}

fn put_f64(buf: &mut [u8], offset: usize, value: f64) {
    buf[offset..offset + 8].copy_from_slice(&value.to_le_bytes());
}

fn get_u32(buf: &[u8], offset: usize) -> u32 {
    u32::from_le_bytes(take(buf, offset))
}

fn get_u64(buf: &[u8], offset: usize) -> u64 {
    u64::from_le_bytes(take(buf, offset))
}

fn get_f64(buf: &[u8], offset: usize) -> f64 {
    f64::from_le_bytes(take(buf, offset))
}
