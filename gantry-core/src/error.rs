use crate::peer::Peer;
use thiserror::Error;

/// Errors shared by every gantry crate.
///
/// Each kind carries a stable numeric code via [`GantryError::code`] so peers
/// on different build versions agree on what went wrong.
#[derive(Error, Debug)]
pub enum GantryError {
    #[error("invalid arguments")]
    InvalidArgs,

    #[error("invalid service name")]
    InvalidService,

    #[error("peer not found")]
    PeerNotFound,

    #[error("service is locked by another peer")]
    ServiceLocked { owner: Option<Box<Peer>> },

    #[error("service not found")]
    ServiceNotFound,

    #[error("user not found")]
    UserNotFound,

    #[error("user is locked by another peer")]
    UserLocked { owner: Option<Box<Peer>> },

    #[error("no upstream available")]
    UpstreamUnavailable,

    #[error("upstream unreachable")]
    UpstreamUnreachable,

    /// An internal precondition did not hold. Seeing this is a bug.
    #[error("null pointer: {0}")]
    NullPointer(&'static str),

    /// Placeholder for call sites that are not finished. Must not ship.
    #[error("not implemented")]
    Todo,

    #[error("service {0} already started")]
    ServiceAlreadyStarted(String),

    #[error("service {0} already stopped")]
    ServiceAlreadyStopped(String),

    #[error("store error: {0}")]
    Store(String),

    #[error("protocol error: {0}")]
    Protocol(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("{0}")]
    Internal(String),
}

impl GantryError {
    /// Stable wire code for this error kind.
    #[must_use]
    pub fn code(&self) -> i32 {
        match self {
            Self::InvalidArgs => 100,
            Self::InvalidService => 101,
            Self::NullPointer(_) => 102,
            Self::Todo => 103,
            Self::PeerNotFound => 200,
            Self::ServiceLocked { .. } => 201,
            Self::ServiceNotFound => 202,
            Self::ServiceAlreadyStarted(_) => 203,
            Self::ServiceAlreadyStopped(_) => 204,
            Self::UserNotFound => 300,
            Self::UserLocked { .. } => 301,
            Self::UpstreamUnavailable => 400,
            Self::UpstreamUnreachable => 401,
            Self::Store(_) => 500,
            Self::Protocol(_) => 501,
            Self::Io(_) => 502,
            Self::Internal(_) => 503,
        }
    }

    /// The peer currently holding the contested lock, if known.
    #[must_use]
    pub fn owner(&self) -> Option<&Peer> {
        match self {
            Self::ServiceLocked { owner } | Self::UserLocked { owner } => owner.as_deref(),
            _ => None,
        }
    }
}

pub type Result<T> = std::result::Result<T, GantryError>;
