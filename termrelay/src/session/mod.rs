//! Session lifecycle and wiring.
//!
//! A session binds one remote shell channel, one prompt matcher, one
//! history hub, and one command executor. A single reader task per
//! session drains the channel's byte stream; matching, appending, and
//! boundary notification all happen on that one sequential path, which
//! is what keeps history ordering trivial.

mod executor;
mod registry;
pub(crate) mod writer;

pub use executor::{CommandExecutor, CommandOutcome, PendingCommand, PendingState};
pub use registry::SessionRegistry;

use std::sync::{Arc, Mutex as StdMutex};
use std::time::{Duration, SystemTime};

use bytes::Bytes;
use log::{debug, info, trace, warn};
use russh::ChannelMsg;
use russh::client::Msg;
use serde::Serialize;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;

use crate::error::{Result, SessionError};
use crate::history::{BroadcastHub, MonitorStream, OutputChunk};
use crate::prompt::{self, PromptMatcher};
use crate::transport::{SshConfig, SshTransport};
use writer::{ChannelWriter, WriterMsg};

/// Bytes retained while waiting for the first prompt. Only the recent
/// tail of a noisy login banner can contain the boundary.
const SETUP_KEEP: usize = 64 * 1024;

/// Lifecycle state of a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum SessionState {
    /// Transport connected, waiting for the injected prompt.
    Connecting,
    /// Idle at a prompt; commands may be submitted.
    Ready,
    /// A command is in flight.
    Executing,
    /// Close requested; draining in-flight work.
    Closing,
    /// Cleanly closed. Terminal.
    Closed,
    /// Unrecoverable channel error. Terminal.
    Failed,
}

impl SessionState {
    /// Whether no further commands will ever run.
    pub fn is_terminal(self) -> bool {
        matches!(self, SessionState::Closed | SessionState::Failed)
    }
}

impl std::fmt::Display for SessionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            SessionState::Connecting => "connecting",
            SessionState::Ready => "ready",
            SessionState::Executing => "executing",
            SessionState::Closing => "closing",
            SessionState::Closed => "closed",
            SessionState::Failed => "failed",
        };
        f.write_str(s)
    }
}

/// Configuration for one session.
#[derive(Debug, Clone)]
pub struct SessionConfig {
    /// Transport parameters.
    pub ssh: SshConfig,

    /// Default deadline for a submitted command.
    pub command_timeout: Duration,

    /// Deadline for the injected prompt to appear after connect.
    pub setup_timeout: Duration,

    /// How long close() waits for an in-flight command and the reader
    /// task before forcing closure.
    pub close_grace: Duration,
}

impl SessionConfig {
    /// Create a config with default timeouts.
    pub fn new(ssh: SshConfig) -> Self {
        Self {
            ssh,
            command_timeout: Duration::from_secs(60),
            setup_timeout: Duration::from_secs(30),
            close_grace: Duration::from_secs(5),
        }
    }

    /// Set the default command deadline.
    pub fn command_timeout(mut self, timeout: Duration) -> Self {
        self.command_timeout = timeout;
        self
    }

    /// Set the connect-time prompt deadline.
    pub fn setup_timeout(mut self, timeout: Duration) -> Self {
        self.setup_timeout = timeout;
        self
    }

    /// Set the close drain grace period.
    pub fn close_grace(mut self, grace: Duration) -> Self {
        self.close_grace = grace;
        self
    }
}

/// Snapshot of a session for listings.
#[derive(Debug, Clone, Serialize)]
pub struct SessionInfo {
    /// Caller-assigned session name.
    pub name: String,

    /// Current lifecycle state.
    pub status: SessionState,

    /// When the session was created.
    pub created_at: SystemTime,
}

/// One remote shell with its observable history.
///
/// Created by [`Session::connect`] (usually via
/// [`SessionRegistry`](crate::SessionRegistry)); destroyed by
/// [`Session::close`]. Observers attached through
/// [`attach`](Session::attach) never extend the session's lifetime.
pub struct Session {
    name: String,
    created_at: SystemTime,
    close_grace: Duration,
    state: Arc<watch::Sender<SessionState>>,
    hub: Arc<BroadcastHub>,
    executor: CommandExecutor,
    writer: ChannelWriter,
    transport: StdMutex<Option<SshTransport>>,
    reader: StdMutex<Option<JoinHandle<()>>>,
}

impl Session {
    /// Connect, inject the prompt literal, and wait until the shell is
    /// at a recognized prompt.
    pub async fn connect(name: impl Into<String>, config: SessionConfig) -> Result<Arc<Self>> {
        let name = name.into();

        let transport = SshTransport::connect(config.ssh.clone()).await?;
        let channel = transport.open_shell().await?;

        let literal = prompt::session_literal(&config.ssh.username, &config.ssh.host);
        let matcher = PromptMatcher::new(literal.as_bytes());

        let hub = Arc::new(BroadcastHub::new());
        let state = Arc::new(watch::channel(SessionState::Connecting).0);
        let (write_tx, write_rx) = mpsc::unbounded_channel();
        let (boundary_tx, boundary_rx) = mpsc::unbounded_channel();
        let writer = ChannelWriter::new(write_tx);

        let ctx = ReaderContext {
            name: name.clone(),
            matcher,
            hub: hub.clone(),
            boundary_tx,
            state: state.clone(),
            setup: SetupBuffer::default(),
        };
        let reader = tokio::spawn(read_loop(channel, write_rx, ctx));

        let executor = CommandExecutor::new(
            name.clone(),
            writer.clone(),
            hub.clone(),
            state.clone(),
            boundary_rx,
            literal.as_bytes(),
            config.command_timeout,
        );

        let session = Arc::new(Self {
            name,
            created_at: SystemTime::now(),
            close_grace: config.close_grace,
            state,
            hub,
            executor,
            writer,
            transport: StdMutex::new(Some(transport)),
            reader: StdMutex::new(Some(reader)),
        });

        // One-time prompt injection. Everything up to the first literal
        // emission — banner, default prompt, this command's echo — is
        // consumed by the reader and never enters the history.
        session
            .writer
            .send(prompt::init_command(&literal).into_bytes())
            .map_err(|_| SessionError::SetupFailed {
                message: "channel closed before initialization".into(),
            })?;

        if let Err(e) = session.wait_ready(config.setup_timeout).await {
            session.close().await.ok();
            return Err(e);
        }

        info!("session '{}' ready", session.name);
        Ok(session)
    }

    async fn wait_ready(&self, setup_timeout: Duration) -> Result<()> {
        let mut rx = self.state.subscribe();
        let wait = async {
            loop {
                match *rx.borrow_and_update() {
                    SessionState::Ready => return Ok(()),
                    s if s.is_terminal() => {
                        return Err(SessionError::SetupFailed {
                            message: "channel closed before the prompt appeared".into(),
                        });
                    }
                    _ => {}
                }
                if rx.changed().await.is_err() {
                    return Err(SessionError::SetupFailed {
                        message: "reader task stopped".into(),
                    });
                }
            }
        };
        tokio::time::timeout(setup_timeout, wait)
            .await
            .map_err(|_| SessionError::SetupFailed {
                message: format!("prompt did not appear within {:?}", setup_timeout),
            })?
            .map_err(Into::into)
    }

    /// Caller-assigned name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Creation timestamp.
    pub fn created_at(&self) -> SystemTime {
        self.created_at
    }

    /// Current lifecycle state.
    pub fn state(&self) -> SessionState {
        *self.state.borrow()
    }

    /// Listing snapshot.
    pub fn info(&self) -> SessionInfo {
        SessionInfo {
            name: self.name.clone(),
            status: self.state(),
            created_at: self.created_at,
        }
    }

    /// Execute one command. Fails with `Busy` while another command is
    /// in flight and with `Closed` once the session terminated.
    pub async fn exec(&self, command: &str, timeout: Option<Duration>) -> Result<CommandOutcome> {
        match self.state() {
            SessionState::Closing | SessionState::Closed | SessionState::Failed => {
                Err(SessionError::Closed {
                    name: self.name.clone(),
                }
                .into())
            }
            _ => self.executor.submit(command, timeout).await,
        }
    }

    /// Attach an observer: full replay first, then live chunks.
    pub fn attach(&self) -> MonitorStream {
        self.hub.attach()
    }

    /// Full history replay without subscribing.
    pub fn replay(&self) -> Vec<OutputChunk> {
        self.hub.replay()
    }

    /// Drive the session to `Closed`: drain any in-flight command for
    /// up to the close grace period, shut the channel down, release the
    /// transport. Idempotent.
    pub async fn close(&self) -> Result<()> {
        let mut already_terminal = false;
        self.state.send_if_modified(|s| {
            if s.is_terminal() {
                already_terminal = true;
                false
            } else {
                *s = SessionState::Closing;
                true
            }
        });

        if !already_terminal {
            debug!("closing session '{}'", self.name);
            let _ = tokio::time::timeout(self.close_grace, self.executor.drain()).await;
            self.writer.shutdown();

            let handle = self.reader.lock().unwrap().take();
            if let Some(mut handle) = handle {
                if tokio::time::timeout(self.close_grace, &mut handle)
                    .await
                    .is_err()
                {
                    warn!("reader for '{}' did not stop in time; aborting", self.name);
                    handle.abort();
                }
            }
        }

        let transport = self.transport.lock().unwrap().take();
        if let Some(transport) = transport {
            transport.close().await.ok();
        }

        // The reader normally finalizes state and hub; make both
        // unconditional so close() is safe even if it was aborted.
        self.state.send_if_modified(|s| {
            if s.is_terminal() {
                false
            } else {
                *s = SessionState::Closed;
                true
            }
        });
        self.hub.close(None);
        Ok(())
    }
}

/// Bytes seen before the first prompt boundary; never part of history.
#[derive(Default)]
struct SetupBuffer {
    pending: Vec<u8>,
    /// Absolute matcher-stream offset of `pending[0]`.
    pending_abs: u64,
    /// Matcher-stream offset of the first boundary, once seen. History
    /// offsets are matcher offsets minus this base.
    base: Option<u64>,
}

/// Everything the reader task needs to turn raw channel bytes into
/// history chunks and boundary notifications.
struct ReaderContext {
    name: String,
    matcher: PromptMatcher,
    hub: Arc<BroadcastHub>,
    boundary_tx: mpsc::UnboundedSender<u64>,
    state: Arc<watch::Sender<SessionState>>,
    setup: SetupBuffer,
}

impl ReaderContext {
    /// Process one delivery from the remote channel.
    fn handle_bytes(&mut self, data: &[u8]) {
        let boundaries = self.matcher.feed(data);

        match self.setup.base {
            None => {
                self.setup.pending.extend_from_slice(data);

                if let Some(&first) = boundaries.first() {
                    let Some(cut) = first.checked_sub(self.setup.pending_abs) else {
                        warn!("'{}': boundary at {} precedes retained setup bytes", self.name, first);
                        return;
                    };
                    let tail = self.setup.pending.split_off(cut as usize);
                    self.setup.pending = Vec::new();
                    self.setup.base = Some(first);

                    debug!("'{}' saw its first prompt; history begins", self.name);
                    self.hub.append(Bytes::from(tail), true);
                    for b in boundaries {
                        let _ = self.boundary_tx.send(b - first);
                    }
                    self.state.send_if_modified(|s| {
                        if *s == SessionState::Connecting {
                            *s = SessionState::Ready;
                            true
                        } else {
                            false
                        }
                    });
                } else if self.setup.pending.len() > SETUP_KEEP {
                    let excess = self.setup.pending.len() - SETUP_KEEP;
                    self.setup.pending.drain(..excess);
                    self.setup.pending_abs += excess as u64;
                }
            }
            Some(base) => {
                let flag = !boundaries.is_empty();
                self.hub.append(Bytes::copy_from_slice(data), flag);
                for b in boundaries {
                    let _ = self.boundary_tx.send(b - base);
                }
            }
        }
    }

    /// Reader is done: publish the terminal state and end all observer
    /// streams.
    fn finalize(&self, failure: Option<String>) {
        let closing = matches!(*self.state.borrow(), SessionState::Closing);
        if closing {
            self.state.send_replace(SessionState::Closed);
            self.hub.close(None);
            debug!("session '{}' closed", self.name);
        } else {
            let message =
                failure.unwrap_or_else(|| "remote channel closed unexpectedly".to_string());
            warn!("session '{}' failed: {}", self.name, message);
            self.state.send_replace(SessionState::Failed);
            self.hub.close(Some(message));
        }
    }
}

/// The per-session worker: sole owner of the shell channel. Reads and
/// writes interleave on this one task, so history order is exactly
/// arrival order.
async fn read_loop(
    mut channel: russh::Channel<Msg>,
    mut write_rx: mpsc::UnboundedReceiver<WriterMsg>,
    mut ctx: ReaderContext,
) {
    let mut failure: Option<String> = None;

    loop {
        tokio::select! {
            msg = channel.wait() => match msg {
                Some(ChannelMsg::Data { data }) => ctx.handle_bytes(&data),
                Some(ChannelMsg::ExtendedData { data, .. }) => ctx.handle_bytes(&data),
                Some(ChannelMsg::Eof) | Some(ChannelMsg::Close) => {
                    debug!("'{}': remote channel ended", ctx.name);
                    break;
                }
                Some(ChannelMsg::ExitStatus { exit_status }) => {
                    trace!("'{}': remote shell exited with {}", ctx.name, exit_status);
                }
                Some(_) => {}
                None => {
                    failure = Some("channel closed by transport".to_string());
                    break;
                }
            },
            op = write_rx.recv() => match op {
                Some(WriterMsg::Data(bytes)) => {
                    if let Err(e) = channel.data(&bytes[..]).await {
                        failure = Some(format!("write failed: {}", e));
                        break;
                    }
                }
                Some(WriterMsg::Shutdown) | None => {
                    let _ = channel.eof().await;
                    break;
                }
            },
        }
    }

    ctx.finalize(failure);
}
