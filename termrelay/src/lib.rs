//! # Termrelay
//!
//! Remote command execution over SSH with a byte-accurate, replayable
//! terminal history that any number of observers can watch live.
//!
//! Every session keeps one canonical, gap-free record of what its
//! remote shell emitted — echo, output, and prompts alike. A
//! late-joining observer gets the full replay and then the live tail,
//! each chunk exactly once; a control-plane caller executes commands
//! one at a time, with completion detected from prompt reappearance in
//! the same byte stream the observers see.
//!
//! ## Features
//!
//! - Async SSH sessions via russh, with host key verification
//! - Injected prompt literal for exact, line-anchored boundary detection
//! - Append-only sequence-numbered history with atomic replay-then-live
//!   observer attach
//! - Serialized command execution with sentinel-based exit codes
//! - Named session registry for a dispatch layer to drive
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use termrelay::{SessionConfig, SessionRegistry, SshConfig};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), termrelay::Error> {
//!     let registry = SessionRegistry::new();
//!
//!     let ssh = SshConfig::new("192.168.1.10", "ops").password("secret");
//!     registry.connect("web-1", SessionConfig::new(ssh)).await?;
//!
//!     let outcome = registry.exec("web-1", "uname -a", None).await?;
//!     println!("{} (exit {:?})", outcome.stdout, outcome.exit_code);
//!
//!     registry.disconnect("web-1").await?;
//!     Ok(())
//! }
//! ```

pub mod error;
pub mod history;
pub mod prompt;
pub mod session;
pub mod transport;

// Re-export main types for convenience
pub use error::{Error, Result, SessionError, TransportError};
pub use history::{BroadcastHub, MonitorEvent, MonitorStream, OutputChunk};
pub use prompt::PromptMatcher;
pub use session::{
    CommandOutcome, PendingCommand, PendingState, Session, SessionConfig, SessionInfo,
    SessionRegistry, SessionState,
};
pub use transport::{AuthMethod, HostKeyVerification, SshConfig, SshTransport};
