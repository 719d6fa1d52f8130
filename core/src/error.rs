/*
 * error.rs
 * Copyright (C) 2026 Chris Burdess
 *
 * This file is part of Corriere, an HTTP/1.x client engine.
 *
 * Corriere is free software: you can redistribute it and/or modify
 * it under the terms of the GNU General Public License as published by
 * the Free Software Foundation, either version 3 of the License, or
 * (at your option) any later version.
 *
 * Corriere is distributed in the hope that it will be useful,
 * but WITHOUT ANY WARRANTY; without even the implied warranty of
 * MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE.  See the
 * GNU General Public License for more details.
 *
 * You should have received a copy of the GNU General Public License
 * along with Corriere.  If not, see <http://www.gnu.org/licenses/>.
 */

//! Engine errors.
//!
//! Errors are `Clone` because one transport failure is fanned out to every
//! request queued on the connection and into any body stream still open.

use std::fmt;
use std::io;

use crate::protocol::http::auth::Challenge;

/// How far a request got onto the wire before its connection failed.
///
/// Ordered: a later variant always implies the earlier ones happened.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum Progress {
    /// No byte of the request was written.
    Unsent,
    /// Some or all of the head was written; no body byte was.
    HeadWritten,
    /// Body transmission began (or the request had no body and the head went out).
    BodyStarted,
}

/// Cause of a connection-level failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionErrorKind {
    Refused,
    Reset,
    TimedOut,
    /// Reused connection produced no response within the grace window.
    Stalled,
    /// Peer closed before the response completed.
    Closed,
    /// Peer is HTTP/1.0 or sent `Connection: close`; pipelined requests were dropped.
    NotPersistent,
    /// TLS handshake failure other than certificate rejection.
    Tls,
    /// Connection torn down because a caller abandoned an in-flight request.
    Cancelled,
}

impl fmt::Display for ConnectionErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ConnectionErrorKind::Refused => "refused",
            ConnectionErrorKind::Reset => "reset",
            ConnectionErrorKind::TimedOut => "timed out",
            ConnectionErrorKind::Stalled => "stalled",
            ConnectionErrorKind::Closed => "closed",
            ConnectionErrorKind::NotPersistent => "not persistent",
            ConnectionErrorKind::Tls => "tls",
            ConnectionErrorKind::Cancelled => "cancelled",
        };
        f.write_str(s)
    }
}

/// Errors produced by the HTTP engine.
#[derive(Debug, Clone, thiserror::Error)]
pub enum HttpError {
    /// Malformed wire data. Fatal to the connection, never retried.
    #[error("syntax error: {0}")]
    Syntax(String),

    /// Transport failure; retried according to idempotency and `progress`.
    #[error("connection {kind}: {message}")]
    Connection {
        kind: ConnectionErrorKind,
        progress: Progress,
        message: String,
    },

    /// The server certificate was rejected.
    #[error("certificate rejected for {host}: {message}")]
    Certificate { host: String, message: String },

    #[error("redirect limit of {limit} exceeded at {location}")]
    RedirectLimitExceeded { limit: usize, location: String },

    /// A credential was tried and the server challenged again.
    #[error("authentication failed with status {status}")]
    AuthenticationFailed { status: u16, challenges: Vec<Challenge> },

    /// 417 persisted after `Expect` was removed.
    #[error("expectation failed")]
    ExpectationFailed,

    /// Pool at capacity and no queue slot (or the wait timed out).
    #[error("connection pool busy for {target}")]
    Busy { target: String },

    #[error("invalid url: {0}")]
    InvalidUrl(String),

    #[error("config error: {0}")]
    Config(String),

    /// The client or pool has been shut down.
    #[error("client closed")]
    Closed,
}

impl HttpError {
    pub fn syntax(msg: impl Into<String>) -> Self {
        HttpError::Syntax(msg.into())
    }

    pub fn connection(kind: ConnectionErrorKind, progress: Progress, msg: impl Into<String>) -> Self {
        HttpError::Connection {
            kind,
            progress,
            message: msg.into(),
        }
    }

    /// Map a transport error, classifying the kind from the io error.
    pub fn from_io(err: &io::Error, progress: Progress) -> Self {
        let kind = match err.kind() {
            io::ErrorKind::ConnectionRefused => ConnectionErrorKind::Refused,
            io::ErrorKind::TimedOut => ConnectionErrorKind::TimedOut,
            io::ErrorKind::UnexpectedEof => ConnectionErrorKind::Closed,
            _ => ConnectionErrorKind::Reset,
        };
        HttpError::connection(kind, progress, err.to_string())
    }

    /// Same error with the transmission progress replaced (for fan-out to queued requests).
    pub fn with_progress(&self, progress: Progress) -> Self {
        match self {
            HttpError::Connection { kind, message, .. } => HttpError::Connection {
                kind: *kind,
                progress,
                message: message.clone(),
            },
            other => other.clone(),
        }
    }

    pub fn is_connection(&self) -> bool {
        matches!(self, HttpError::Connection { .. })
    }

    /// Whether the request manager may resubmit after this error.
    ///
    /// Only connection errors qualify: always for idempotent methods, otherwise only
    /// if body transmission had not begun.
    pub fn is_retryable(&self, idempotent: bool) -> bool {
        match self {
            HttpError::Connection { progress, .. } => {
                idempotent || *progress < Progress::BodyStarted
            }
            _ => false,
        }
    }
}
