// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

use thiserror::Error;

use crate::coap::Code;

/// Category of a 4.xx/5.xx CoAP response, as surfaced to callers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StatusKind {
    Permission,
    Invalid,
    NotFound,
    Busy,
    TooLarge,
    Unsupported,
    BadMessage,
}

/// Error delivered to request callbacks and awaitable service calls.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum GoliothError {
    /// Retransmissions exhausted without a response.
    #[error("request timed out")]
    Timeout,

    /// Transport closed while the request was in flight.
    #[error("connection shut down")]
    Shutdown,

    /// Request submitted while not connected.
    #[error("transport unavailable")]
    TransportUnavailable,

    /// Malformed CoAP message or unexpected payload structure.
    #[error("malformed message")]
    BadMessage,

    /// Operation not supported (e.g. blockwise Observe).
    #[error("operation not supported")]
    Unsupported,

    /// A bounded registry is full.
    #[error("no space left")]
    NoSpace,

    /// Server responded with an error status code.
    #[error("server status {code} ({kind:?})")]
    Status { code: Code, kind: StatusKind },
}

impl GoliothError {
    /// Maps a CoAP response code to an error, `None` for 2.xx success.
    pub(crate) fn from_response_code(code: Code) -> Option<Self> {
        let kind = match code.class() {
            2 => return None,
            4 => match code.0 & 0x1f {
                0x01 | 0x03 | 0x05 | 0x06 | 0x0c => StatusKind::Permission,
                0x02 | 0x08 => StatusKind::Invalid,
                0x04 => StatusKind::NotFound,
                0x09 | 0x1d => StatusKind::Busy,
                0x0d => StatusKind::TooLarge,
                0x0f => StatusKind::Unsupported,
                _ => StatusKind::BadMessage,
            },
            _ => StatusKind::BadMessage,
        };

        Some(GoliothError::Status { code, kind })
    }

    /// Status kind of a server error response, if this is one.
    pub fn status_kind(&self) -> Option<StatusKind> {
        match self {
            GoliothError::Status { kind, .. } => Some(*kind),
            _ => None,
        }
    }
}
