//! Error types for termrelay.

use std::io;
use std::time::Duration;
use thiserror::Error;

/// Main error type for termrelay operations.
#[derive(Error, Debug)]
pub enum Error {
    /// SSH transport-level errors
    #[error("Transport error: {0}")]
    Transport(#[from] TransportError),

    /// Session-level errors
    #[error("Session error: {0}")]
    Session(#[from] SessionError),
}

/// Transport layer errors (SSH connection, authentication, host keys).
#[derive(Error, Debug)]
pub enum TransportError {
    /// Failed to connect to host
    #[error("Connection failed to {host}:{port}: {source}")]
    ConnectionFailed {
        host: String,
        port: u16,
        #[source]
        source: io::Error,
    },

    /// SSH handshake or protocol error
    #[error("SSH error: {0}")]
    Ssh(#[from] russh::Error),

    /// Authentication failed
    #[error("Authentication failed for user '{user}'")]
    AuthenticationFailed { user: String },

    /// SSH key error
    #[error("SSH key error: {0}")]
    Key(String),

    /// Host key does not match the recorded known_hosts entry
    #[error("Host key for {host}:{port} changed (known_hosts line {line})")]
    HostKeyChanged {
        host: String,
        port: u16,
        line: usize,
    },

    /// Host is not present in known_hosts and strict checking is enabled
    #[error("Unknown host key for {host}:{port} ({fingerprint})")]
    HostKeyUnknown {
        host: String,
        port: u16,
        fingerprint: String,
    },

    /// known_hosts file could not be read or written
    #[error("known_hosts error: {0}")]
    KnownHosts(String),

    /// Connection was closed unexpectedly
    #[error("Connection disconnected")]
    Disconnected,

    /// Operation timed out
    #[error("Operation timed out after {0:?}")]
    Timeout(Duration),

    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
}

/// Session layer errors (command execution, lifecycle, registry lookups).
#[derive(Error, Debug)]
pub enum SessionError {
    /// A command is already in flight on this session. The submit is
    /// rejected rather than queued; the caller may retry once the
    /// in-flight command resolves.
    #[error("Session '{name}' is busy with another command")]
    Busy { name: String },

    /// The command did not produce a prompt boundary within its deadline.
    /// The session and its channel remain usable; the remote command may
    /// still complete on its own.
    #[error("Command timed out after {0:?}")]
    CommandTimeout(Duration),

    /// Operation on a session that has been closed or has failed.
    #[error("Session '{name}' is closed")]
    Closed { name: String },

    /// No session registered under this name.
    #[error("No session named '{name}'")]
    NotFound { name: String },

    /// A session with this name already exists.
    #[error("Session name '{name}' is already in use")]
    NameInUse { name: String },

    /// The remote shell never produced the injected prompt during connect.
    #[error("Session setup failed: {message}")]
    SetupFailed { message: String },

    /// The submitted command text cannot be executed as a single line.
    #[error("Invalid command: {message}")]
    InvalidCommand { message: String },
}

/// Result type alias using termrelay's Error.
pub type Result<T> = std::result::Result<T, Error>;
