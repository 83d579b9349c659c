use crate::parser::ParseError;
use std::io;
use thiserror::Error;

/// Central error type for the etude engine.
#[derive(Debug, Error)]
pub enum EtudeError {
    /// Underlying I/O error from the OS or network.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// Error during HTTP request parsing.
    #[error("parse error: {0}")]
    Parse(#[from] ParseError),

    /// A bounded queue was asked for zero slots.
    #[error("queue capacity must be at least 1")]
    ZeroCapacity,

    /// Connection slab reached its maximum capacity.
    #[error("connection slab is full")]
    SlabFull,

    /// The response head did not fit in the connection write buffer.
    #[error("response header exceeds the {0}-byte write buffer")]
    WriteBufferOverflow(usize),

    /// Rejected configuration value.
    #[error("invalid configuration: {0}")]
    Config(String),

    /// The backing credential store refused an operation.
    #[error("credential store error: {0}")]
    Credentials(String),
}

pub type EtudeResult<T> = Result<T, EtudeError>;
