use gantry_core::{GantryError, Result};

pub const PROTOCOL_VERSION: u8 = 1;

/// `magic(4) | version(1) | kind(1) | reserved(2) | session_id(8) | req_id(8) | payload_len(4)`
pub const HEADER_SIZE: usize = 28;

pub const GANTRY_MAGIC: [u8; 4] = *b"GNTY";

/// Upper bound on a single frame's payload.
pub const MAX_FRAME_LEN: usize = 1 << 20;

#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameKind {
    /// Opens a connection; names the stream kind and the caller.
    Hello = 0x01,

    // Control connection (0x10-0x1F): unary request/response in order.
    InfoRequest = 0x10,
    InfoResponse = 0x11,
    HealthRequest = 0x12,
    HealthResponse = 0x13,

    // Gate stream (0x20-0x2F): hall-pushed control traffic.
    GatePing = 0x20,

    // Session stream, gateway to hall (0x30).
    SessionData = 0x30,

    // Session stream, hall to gateway (0x31-0x3F).
    HallData = 0x31,
    HallUserInstead = 0x32,
    HallKick = 0x33,

    // Client-facing gateway surface (0x40-0x4F).
    ClientHello = 0x40,
    ClientRequest = 0x41,
    ClientResponse = 0x42,
    ClientPush = 0x43,
    ClientError = 0x44,
    ServerSuspend = 0x45,
    ServerResume = 0x46,
    ClientKick = 0x47,
}

impl FrameKind {
    pub fn try_from_u8(value: u8) -> Result<Self> {
        let kind = match value {
            0x01 => Self::Hello,
            0x10 => Self::InfoRequest,
            0x11 => Self::InfoResponse,
            0x12 => Self::HealthRequest,
            0x13 => Self::HealthResponse,
            0x20 => Self::GatePing,
            0x30 => Self::SessionData,
            0x31 => Self::HallData,
            0x32 => Self::HallUserInstead,
            0x33 => Self::HallKick,
            0x40 => Self::ClientHello,
            0x41 => Self::ClientRequest,
            0x42 => Self::ClientResponse,
            0x43 => Self::ClientPush,
            0x44 => Self::ClientError,
            0x45 => Self::ServerSuspend,
            0x46 => Self::ServerResume,
            0x47 => Self::ClientKick,
            other => {
                return Err(GantryError::Protocol(format!(
                    "unknown frame kind {other:#04x}"
                )))
            }
        };
        Ok(kind)
    }
}

#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamKind {
    Control = 1,
    Gate = 2,
    Session = 3,
}

impl StreamKind {
    pub fn try_from_u8(value: u8) -> Result<Self> {
        match value {
            1 => Ok(Self::Control),
            2 => Ok(Self::Gate),
            3 => Ok(Self::Session),
            other => Err(GantryError::Protocol(format!(
                "unknown stream kind {other}"
            ))),
        }
    }
}

/// Hall availability as reported by its health check.
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum HallStatus {
    Ok = 1,
    #[default]
    Unavailable = 2,
}

impl HallStatus {
    #[must_use]
    pub fn from_u8(value: u8) -> Self {
        if value == 1 {
            Self::Ok
        } else {
            Self::Unavailable
        }
    }
}
