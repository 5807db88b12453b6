//! SSH transport layer wrapping russh.
//!
//! This module provides the remote channel collaborator: connection
//! setup, authentication, host key verification, and interactive shell
//! channel creation. Channel consumption (reading the byte stream,
//! writing input) lives with the session's reader task.

pub mod config;
mod ssh;

pub use config::{AuthMethod, HostKeyVerification, SshConfig};
pub use ssh::SshTransport;
