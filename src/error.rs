use std::net::SocketAddr;

use thiserror::Error;

/// Reasons an inbound datagram or its arguments could not be understood.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ProtocolError {
    #[error("Empty payload")]
    Empty,

    #[error("Payload is not valid UTF-8")]
    NotUtf8,

    #[error("Unknown instruction: {0}")]
    UnknownInstruction(String),

    #[error("{instruction} expects at least {expected} argument(s), got {actual}")]
    MissingArgument {
        instruction: &'static str,
        expected: usize,
        actual: usize,
    },

    #[error("Invalid {name} argument: {value:?}")]
    InvalidArgument { name: &'static str, value: String },
}

#[derive(Error, Debug)]
pub enum DispatchError {
    #[error("Transport error: {0}")]
    Transport(#[from] std::io::Error),

    #[error("Protocol error: {0}")]
    Protocol(#[from] ProtocolError),

    #[error("Validation failed: {0}")]
    Validation(String),

    #[error("Job not found: {0}")]
    JobNotFound(u64),

    #[error("Node not found: {0}")]
    NodeNotFound(u64),

    #[error("No node registered at {0}")]
    UnknownEndpoint(SocketAddr),

    #[error("A controller is already registered at {0}")]
    ControllerAlreadyRegistered(SocketAddr),
}

pub type Result<T> = std::result::Result<T, DispatchError>;
