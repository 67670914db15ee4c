//! Session errors and handshake result codes.

use std::io;

use thiserror::Error;

use crate::connection::ConnectionId;
use crate::session::SessionState;

/// Errors returned by fallible [`Session`](crate::session::Session) operations.
#[derive(Debug, Error)]
pub enum SessionError {
    #[error("failed to bind transport: {0}")]
    Bind(#[source] io::Error),
    #[error("transport I/O error: {0}")]
    Io(#[from] io::Error),
    #[error("cannot {operation} while {state:?}")]
    InvalidState {
        operation: &'static str,
        state: SessionState,
    },
    #[error("message types must be registered before the session starts")]
    AlreadyStarted,
    #[error("message type {0} is not registered")]
    UnknownMessageType(u8),
    #[error("payload of {len} bytes exceeds the {max}-byte message limit")]
    PayloadTooLarge { len: usize, max: usize },
    #[error("no connection at {0}")]
    NoSuchConnection(ConnectionId),
}

/// Outcome codes reported through [`Session::last_error`](crate::session::Session::last_error).
///
/// The join-deny variants travel on the wire as the JOIN_DENY payload byte.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Error)]
#[repr(u8)]
pub enum ErrorCode {
    #[error("socket could not be bound")]
    SocketBindFailed = 0,
    #[error("join denied: remote is not hosting")]
    JoinDeniedNotHost = 1,
    #[error("join denied: host is not accepting joins")]
    JoinDeniedClosed = 2,
    #[error("join denied: party is full")]
    JoinDeniedFull = 3,
    #[error("join denied: name already in use")]
    JoinDeniedGuidTaken = 4,
    #[error("host did not answer the join request")]
    JoinTimeout = 5,
    #[error("kicked by host")]
    Kicked = 6,
    #[error("host ended the session")]
    HostQuit = 7,
    #[error("host stopped responding")]
    ConnectionTimeout = 8,
}

impl ErrorCode {
    pub fn from_byte(b: u8) -> Option<Self> {
        match b {
            0 => Some(ErrorCode::SocketBindFailed),
            1 => Some(ErrorCode::JoinDeniedNotHost),
            2 => Some(ErrorCode::JoinDeniedClosed),
            3 => Some(ErrorCode::JoinDeniedFull),
            4 => Some(ErrorCode::JoinDeniedGuidTaken),
            5 => Some(ErrorCode::JoinTimeout),
            6 => Some(ErrorCode::Kicked),
            7 => Some(ErrorCode::HostQuit),
            8 => Some(ErrorCode::ConnectionTimeout),
            _ => None,
        }
    }

    pub fn is_join_denial(self) -> bool {
        matches!(
            self,
            ErrorCode::JoinDeniedNotHost
                | ErrorCode::JoinDeniedClosed
                | ErrorCode::JoinDeniedFull
                | ErrorCode::JoinDeniedGuidTaken
        )
    }
}
