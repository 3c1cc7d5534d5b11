//! Error types shared by discovery and the command client.

use std::time::Duration;

use thiserror::Error;

use crate::control_interface::command::{CommandOutcome, Method};

/// Errors returned by the discovery engine and the command client.
#[derive(Debug, Error)]
pub enum Error {
    /// Socket level failure (refused, reset, bind failure, ...).
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// The TCP connect did not complete in time.
    #[error("timed out connecting to {host}:{port}")]
    ConnectTimeout { host: String, port: u16 },

    /// A command could not be serialized.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// The device answered with a frame that carries neither `result` nor `error`.
    #[error("protocol error: {0}")]
    Protocol(String),

    /// The device answered the command with an error object.
    #[error("command {} failed: {}", .0.action, .0.error_message())]
    Command(Box<CommandOutcome>),

    /// No response arrived within the command timeout.
    #[error("command {method} (id {id}) timed out")]
    Timeout { id: u64, method: Method },

    /// `send_command` was called without an open connection.
    #[error("not connected")]
    NotConnected,

    /// `connect` was called while already connecting or connected.
    #[error("already connected or connecting")]
    AlreadyConnected,

    /// The connection dropped while the command was still waiting.
    #[error("connection closed")]
    ConnectionClosed,

    /// Multicast discovery found nothing and fallback scanning is disabled.
    #[error("no device found after {waited:?}")]
    NoDeviceFound { waited: Duration },

    /// Neither multicast discovery nor the IP scan found anything.
    #[error("no device found after scan")]
    NoDeviceFoundAfterScan,

    /// The discovery session was destroyed while running.
    #[error("discovery cancelled")]
    Cancelled,

    #[error("invalid hex string: {0:?}")]
    InvalidHex(String),

    #[error("invalid value: {0}")]
    InvalidValue(String),
}

pub type Result<T> = std::result::Result<T, Error>;

impl Error {
    /// The outcome record carried by a device-side command failure.
    pub fn outcome(&self) -> Option<&CommandOutcome> {
        match self {
            Error::Command(outcome) => Some(outcome),
            _ => None,
        }
    }
}
