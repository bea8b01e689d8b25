use crate::parser::HttpCode;
use std::io;
use thiserror::Error;

/// Central error type for the etude engine.
#[derive(Debug, Error)]
pub enum EtudeError {
    /// Underlying I/O error from the OS or network.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// The read buffer filled up before a complete request was parsed.
    #[error("read buffer is full")]
    ReadBufferFull,

    /// A response did not fit into the write buffer.
    #[error("write buffer is full")]
    WriteBufferFull,

    /// The peer closed its end of the connection.
    #[error("connection closed by peer")]
    PeerClosed,

    /// The connection was already closed.
    #[error("connection is closed")]
    Closed,

    /// A parse outcome that has no response attached to it.
    #[error("no response for outcome {0:?}")]
    Unrespondable(HttpCode),

    /// Descriptor number beyond the connection table.
    #[error("connection table is full")]
    TableFull,

    /// Invalid configuration value.
    #[error("invalid configuration: {0}")]
    Config(String),
}

pub type EtudeResult<T> = Result<T, EtudeError>;
