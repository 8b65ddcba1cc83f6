//! Error types for control-plane operations.

use thiserror::Error;

use crate::client::{ClientId, ClientState};
use crate::port::Frames;

/// Error type for every synchronous engine operation.
///
/// The real-time half never produces these; per-cycle problems travel back as
/// [`CycleEvent`](crate::CycleEvent)s and are handled in
/// [`Engine::maintain`](crate::Engine::maintain).
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum Error {
    #[error("Name already in use: {0}")]
    NameCollision(String),

    #[error("Invalid name: {0:?}")]
    InvalidName(String),

    #[error("Invalid port type: {0}")]
    InvalidType(String),

    #[error("Port not found: {0}")]
    PortNotFound(String),

    #[error("Client not found: {0}")]
    ClientNotFound(ClientId),

    #[error("Type mismatch: {from} carries {from_type:?}, {to} carries {to_type:?}")]
    TypeMismatch {
        from: String,
        to: String,
        from_type: String,
        to_type: String,
    },

    #[error("Direction error: {0}")]
    DirectionError(String),

    #[error("Already connected: {from} -> {to}")]
    AlreadyConnected { from: String, to: String },

    #[error("Not connected: {from} -> {to}")]
    NotConnected { from: String, to: String },

    #[error("Port is locked by its owner: {0}")]
    Locked(String),

    #[error("Port type has no mixdown, only one connection allowed: {0}")]
    MixdownUnsupported(String),

    #[error("Tie error: {0}")]
    TieError(String),

    #[error("Port {port} is not owned by client {client}")]
    NotOwner { client: ClientId, port: String },

    #[error("Cannot change activation of {client} while {state:?}")]
    ActivationError { client: String, state: ClientState },

    #[error("Timebase already owned by {0}")]
    TimebaseTaken(String),

    #[error("Engine unavailable")]
    EngineUnavailable,

    #[error("Capacity exceeded: no free {0} slot")]
    CapacityExceeded(&'static str),

    #[error("Invalid pattern: {0}")]
    InvalidPattern(String),

    #[error("Invalid buffer size: {0}")]
    InvalidBufferSize(Frames),

    #[error("Invalid sample rate: {0}")]
    InvalidSampleRate(u32),
}

/// Result type alias.
pub type Result<T> = core::result::Result<T, Error>;
