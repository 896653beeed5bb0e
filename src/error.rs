use std::io;

use crate::{codec::InvalidLine, connection::ConnectionState};

#[derive(Debug, thiserror::Error)]
pub enum ConnectionError {
    #[error("failed to connect to {addr}: {source}")]
    ConnectFailure {
        addr: String,
        #[source]
        source: io::Error,
    },
    #[error("transport error: {0}")]
    Transport(#[from] io::Error),
    #[error("cannot send on a connection that is {state}")]
    InvalidState { state: ConnectionState },
}

#[derive(Debug, thiserror::Error)]
pub enum ClientError {
    #[error(transparent)]
    Connection(#[from] ConnectionError),
    #[error("invalid message: {0}")]
    InvalidMessage(#[from] InvalidLine),
    #[error("connection failed: {0}")]
    Transport(io::Error),
    #[error("console error: {0}")]
    Console(io::Error),
}
