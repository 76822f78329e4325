use std::{io, net::SocketAddr};

use thiserror::Error;

/// Raised when a line cannot be queued for a session.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum DeliveryError {
    #[error("session '{name}' is closed")]
    Closed { name: String },
    #[error("session '{name}' has too many unsent lines")]
    Backlogged { name: String },
}

/// Lines that do not follow the relay's wire format.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum ProtocolError {
    #[error("registration line is empty")]
    EmptyName,
    #[error("private message is missing its target or body: {line:?}")]
    MalformedPrivate { line: String },
    #[error("unrecognised server line: {line:?}")]
    UnknownServerLine { line: String },
}

#[derive(Debug, Error)]
pub enum ServerError {
    #[error("failed to bind listener on {addr}")]
    Bind {
        addr: SocketAddr,
        #[source]
        source: io::Error,
    },
}
