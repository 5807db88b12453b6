//! Serialized command execution against one session's remote channel.
//!
//! One command at a time: the in-flight slot is a mutex acquired with
//! `try_lock`, so a concurrent submit fails fast with `Busy` instead of
//! queueing behind an unknown wait. Completion is detected purely from
//! prompt reappearance — the executor writes the user command plus an
//! internal status sentinel in one flush, and the boundary following the
//! sentinel's output is the completion signal.

use std::sync::Arc;
use std::time::{Duration, Instant};

use log::{debug, trace, warn};
use regex::bytes::Regex;
use serde::Serialize;
use tokio::sync::{Mutex, mpsc, watch};

use super::writer::ChannelWriter;
use super::SessionState;
use crate::error::{Error, Result, SessionError};
use crate::history::BroadcastHub;

/// Marker printed by the sentinel status command. Never shown to the
/// caller: the sentinel's echo and output are stripped from stdout.
pub(crate) const STATUS_MARKER: &str = "__trl_rc";

/// The internal command appended after every user command. `$?` still
/// holds the user command's status when the shell reaches this line.
pub(crate) fn sentinel_command() -> String {
    format!("echo {STATUS_MARKER} $?")
}

/// Result of one executed command.
#[derive(Debug, Clone, Serialize)]
pub struct CommandOutcome {
    /// The command that was executed.
    pub command: String,

    /// Output between the command echo and the next prompt, with the
    /// echo lines stripped. Line terminators are the remote's own.
    pub stdout: String,

    /// Exit code reported by the sentinel, or `None` if the sentinel
    /// output could not be parsed.
    pub exit_code: Option<i32>,

    /// Wall time from submission to completion.
    pub duration: Duration,
}

impl CommandOutcome {
    /// Whether the remote command reported exit code 0.
    pub fn is_success(&self) -> bool {
        self.exit_code == Some(0)
    }

    /// Duration in whole milliseconds, for callers that serialize.
    pub fn duration_ms(&self) -> u128 {
        self.duration.as_millis()
    }
}

impl std::fmt::Display for CommandOutcome {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.stdout)
    }
}

/// Lifecycle of one submitted command.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PendingState {
    Queued,
    Sent,
    AwaitingPrompt,
    Completed,
    TimedOut,
}

/// A command moving through the executor.
#[derive(Debug)]
pub struct PendingCommand {
    text: String,
    submitted_at: Instant,
    state: PendingState,
}

impl PendingCommand {
    fn new(text: &str) -> Self {
        Self {
            text: text.to_string(),
            submitted_at: Instant::now(),
            state: PendingState::Queued,
        }
    }

    fn advance(&mut self, next: PendingState) {
        trace!("command {:?}: {:?} -> {:?}", self.text, self.state, next);
        self.state = next;
    }

    /// Current lifecycle state.
    pub fn state(&self) -> PendingState {
        self.state
    }

    /// The submitted command text.
    pub fn text(&self) -> &str {
        &self.text
    }

    /// Time since submission.
    pub fn elapsed(&self) -> Duration {
        self.submitted_at.elapsed()
    }
}

/// Receiver side of the session's boundary notifications. Lives inside
/// the in-flight mutex, so holding the lock and listening for
/// boundaries are the same thing.
struct ExecSlot {
    boundaries: mpsc::UnboundedReceiver<u64>,
}

/// Serializes command execution for one session.
pub struct CommandExecutor {
    session_name: String,
    writer: ChannelWriter,
    hub: Arc<BroadcastHub>,
    state: Arc<watch::Sender<SessionState>>,
    slot: Mutex<ExecSlot>,
    prompt_literal: Vec<u8>,
    sentinel: String,
    status_re: Regex,
    default_timeout: Duration,
}

impl CommandExecutor {
    pub(crate) fn new(
        session_name: impl Into<String>,
        writer: ChannelWriter,
        hub: Arc<BroadcastHub>,
        state: Arc<watch::Sender<SessionState>>,
        boundaries: mpsc::UnboundedReceiver<u64>,
        prompt_literal: &[u8],
        default_timeout: Duration,
    ) -> Self {
        let status_re = Regex::new(&format!("{STATUS_MARKER} ([0-9]+)"))
            .expect("status pattern is a fixed literal");
        Self {
            session_name: session_name.into(),
            writer,
            hub,
            state,
            slot: Mutex::new(ExecSlot { boundaries }),
            prompt_literal: prompt_literal.to_vec(),
            sentinel: sentinel_command(),
            status_re,
            default_timeout,
        }
    }

    /// Submit one command for execution.
    ///
    /// Fails immediately with [`SessionError::Busy`] when another
    /// command holds the in-flight slot. On timeout the slot is
    /// released and the channel stays open; the remote command may
    /// still finish on its own, and any late prompt it produces is
    /// discarded by the next submit.
    pub async fn submit(&self, command: &str, timeout: Option<Duration>) -> Result<CommandOutcome> {
        if command.contains('\n') || command.contains('\r') {
            return Err(SessionError::InvalidCommand {
                message: "command must be a single line".into(),
            }
            .into());
        }

        let timeout = timeout.unwrap_or(self.default_timeout);
        let mut slot = self.slot.try_lock().map_err(|_| SessionError::Busy {
            name: self.session_name.clone(),
        })?;

        let mut pending = PendingCommand::new(command);

        // Boundaries queued before this submission are not ours: the
        // connect-time prompt, or a prompt that arrived after an earlier
        // command timed out.
        while let Ok(stale) = slot.boundaries.try_recv() {
            trace!("discarding stale boundary at offset {}", stale);
        }

        let start = self.hub.total_bytes();
        let payload = format!("{}\n{}\n", command, self.sentinel);
        self.writer
            .send(payload.into_bytes())
            .map_err(|_| SessionError::Closed {
                name: self.session_name.clone(),
            })?;
        pending.advance(PendingState::Sent);
        pending.advance(PendingState::AwaitingPrompt);

        self.state.send_if_modified(|s| {
            if *s == SessionState::Ready {
                *s = SessionState::Executing;
                true
            } else {
                false
            }
        });

        let result = self
            .await_completion(&mut slot, start, timeout, command)
            .await;

        self.state.send_if_modified(|s| {
            if *s == SessionState::Executing {
                *s = SessionState::Ready;
                true
            } else {
                false
            }
        });

        match &result {
            Ok(outcome) => {
                pending.advance(PendingState::Completed);
                debug!(
                    "'{}': command {:?} completed in {:?} (exit {:?})",
                    self.session_name, command, outcome.duration, outcome.exit_code
                );
            }
            Err(Error::Session(SessionError::CommandTimeout(_))) => {
                pending.advance(PendingState::TimedOut)
            }
            Err(_) => {}
        }

        result
    }

    /// Acquire and release the in-flight slot, waiting out any command
    /// currently executing. Used by session close to drain.
    pub(crate) async fn drain(&self) {
        let _slot = self.slot.lock().await;
    }

    async fn await_completion(
        &self,
        slot: &mut ExecSlot,
        start: u64,
        timeout: Duration,
        command: &str,
    ) -> Result<CommandOutcome> {
        let started = Instant::now();
        let deadline = tokio::time::Instant::now() + timeout;

        loop {
            let boundary = match tokio::time::timeout_at(deadline, slot.boundaries.recv()).await {
                Err(_) => {
                    debug!(
                        "'{}': no completion boundary within {:?} for {:?}",
                        self.session_name, timeout, command
                    );
                    return Err(SessionError::CommandTimeout(timeout).into());
                }
                Ok(None) => {
                    return Err(SessionError::Closed {
                        name: self.session_name.clone(),
                    }
                    .into());
                }
                Ok(Some(b)) => b,
            };

            if boundary < start {
                trace!("boundary at {} predates this command; skipping", boundary);
                continue;
            }

            let region = self.hub.slice(start..boundary);
            let Some(caps) = self.status_re.captures(&region) else {
                // Prompt reappeared but the sentinel has not printed yet:
                // this is the boundary ending the user command's output.
                trace!("boundary at {} precedes the status line; waiting", boundary);
                continue;
            };

            let status_match = caps.get(0).expect("capture 0 always present");
            let exit_code = parse_exit_code(caps.get(1).expect("digit group").as_bytes());
            if exit_code.is_none() {
                warn!(
                    "'{}': sentinel status for {:?} did not parse as i32",
                    self.session_name, command
                );
            }

            let body = trim_trailing_prompt(&region[..status_match.start()], &self.prompt_literal);
            let stdout = strip_echo_lines(body, command.as_bytes(), self.sentinel.as_bytes());

            return Ok(CommandOutcome {
                command: command.to_string(),
                stdout: String::from_utf8_lossy(stdout).into_owned(),
                exit_code,
                duration: started.elapsed(),
            });
        }
    }
}

fn parse_exit_code(digits: &[u8]) -> Option<i32> {
    std::str::from_utf8(digits).ok()?.parse().ok()
}

/// Remove the prompt emission that precedes the sentinel's output line.
fn trim_trailing_prompt<'a>(body: &'a [u8], literal: &[u8]) -> &'a [u8] {
    body.strip_suffix(literal).unwrap_or(body)
}

/// Remove the echoed command line and the echoed sentinel line from the
/// front of the captured region. The remote PTY echoes both submitted
/// lines before the command's output because they arrive in one flush.
fn strip_echo_lines<'a>(body: &'a [u8], command: &[u8], sentinel: &[u8]) -> &'a [u8] {
    let body = strip_echoed_line(body, command);
    strip_echoed_line(body, sentinel)
}

fn strip_echoed_line<'a>(body: &'a [u8], text: &[u8]) -> &'a [u8] {
    if !body.starts_with(text) {
        return body;
    }
    match memchr::memchr(b'\n', &body[text.len()..]) {
        Some(i) => &body[text.len() + i + 1..],
        None => &[],
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;
    use tokio::sync::mpsc::{UnboundedReceiver, UnboundedSender};

    use crate::error::Error;
    use crate::session::writer::WriterMsg;

    const PROMPT: &[u8] = b"__trl_ops@db1__$ ";

    struct Rig {
        exec: Arc<CommandExecutor>,
        written: UnboundedReceiver<WriterMsg>,
        boundaries: UnboundedSender<u64>,
        hub: Arc<BroadcastHub>,
    }

    fn rig() -> Rig {
        let hub = Arc::new(BroadcastHub::new());
        let (wtx, wrx) = mpsc::unbounded_channel();
        let (btx, brx) = mpsc::unbounded_channel();
        let (state_tx, _) = watch::channel(SessionState::Ready);
        let exec = CommandExecutor::new(
            "test",
            ChannelWriter::new(wtx),
            hub.clone(),
            Arc::new(state_tx),
            brx,
            PROMPT,
            Duration::from_secs(5),
        );
        Rig {
            exec: Arc::new(exec),
            written: wrx,
            boundaries: btx,
            hub,
        }
    }

    /// Simulate the remote side: echo both submitted lines, print the
    /// output, the prompt, the sentinel status, and the final prompt.
    fn play_round(
        hub: &BroadcastHub,
        boundaries: &UnboundedSender<u64>,
        command: &str,
        output: &[u8],
        status: &str,
    ) {
        let mut echoed = Vec::new();
        echoed.extend_from_slice(command.as_bytes());
        echoed.extend_from_slice(b"\r\n");
        echoed.extend_from_slice(sentinel_command().as_bytes());
        echoed.extend_from_slice(b"\r\n");
        echoed.extend_from_slice(output);
        hub.append(Bytes::from(echoed), false);

        let b1 = hub.total_bytes();
        hub.append(Bytes::copy_from_slice(PROMPT), true);
        boundaries.send(b1).unwrap();

        hub.append(
            Bytes::from(format!("{STATUS_MARKER} {status}\r\n").into_bytes()),
            false,
        );
        let b2 = hub.total_bytes();
        hub.append(Bytes::copy_from_slice(PROMPT), true);
        boundaries.send(b2).unwrap();
    }

    #[tokio::test]
    async fn test_submit_captures_stdout_and_exit_code() {
        let mut r = rig();
        // Connect-time prompt already in history; its boundary is stale.
        r.hub.append(Bytes::copy_from_slice(PROMPT), true);
        r.boundaries.send(0).unwrap();

        let command = "echo \"testing terminal fix\"";
        let (outcome, _) = tokio::join!(r.exec.submit(command, None), async {
            let WriterMsg::Data(payload) = r.written.recv().await.unwrap() else {
                panic!("expected data write");
            };
            assert_eq!(
                payload,
                format!("{command}\n{}\n", sentinel_command()).into_bytes()
            );
            play_round(
                &r.hub,
                &r.boundaries,
                command,
                b"testing terminal fix\r\n",
                "0",
            );
        });

        let outcome = outcome.unwrap();
        assert_eq!(outcome.stdout, "testing terminal fix\r\n");
        assert_eq!(outcome.exit_code, Some(0));
        assert!(outcome.is_success());
    }

    #[tokio::test]
    async fn test_nonzero_exit_code() {
        let mut r = rig();
        let (outcome, _) = tokio::join!(r.exec.submit("false", None), async {
            let _ = r.written.recv().await.unwrap();
            play_round(&r.hub, &r.boundaries, "false", b"", "1");
        });
        let outcome = outcome.unwrap();
        assert_eq!(outcome.exit_code, Some(1));
        assert!(!outcome.is_success());
        assert_eq!(outcome.stdout, "");
    }

    #[tokio::test]
    async fn test_false_boundary_in_output_does_not_complete() {
        let mut r = rig();
        let (outcome, _) = tokio::join!(r.exec.submit("cat notes", None), async {
            let _ = r.written.recv().await.unwrap();
            // Output that happens to reproduce the prompt at line start:
            // a boundary fires but no sentinel status exists yet.
            let mut echoed = b"cat notes\r\n".to_vec();
            echoed.extend_from_slice(sentinel_command().as_bytes());
            echoed.extend_from_slice(b"\r\n");
            r.hub.append(Bytes::from(echoed), false);
            let fake = r.hub.total_bytes();
            r.hub.append(Bytes::copy_from_slice(PROMPT), true);
            r.boundaries.send(fake).unwrap();
            r.hub.append(Bytes::from_static(b"real line\r\n"), false);

            let b1 = r.hub.total_bytes();
            r.hub.append(Bytes::copy_from_slice(PROMPT), true);
            r.boundaries.send(b1).unwrap();
            r.hub
                .append(Bytes::from(format!("{STATUS_MARKER} 0\r\n").into_bytes()), false);
            let b2 = r.hub.total_bytes();
            r.hub.append(Bytes::copy_from_slice(PROMPT), true);
            r.boundaries.send(b2).unwrap();
        });

        let outcome = outcome.unwrap();
        assert_eq!(outcome.exit_code, Some(0));
        assert!(outcome.stdout.contains("real line"));
    }

    #[tokio::test]
    async fn test_sequential_commands_each_follow_a_prompt() {
        let mut r = rig();
        // Connect-time prompt seeds the history.
        r.hub.append(Bytes::copy_from_slice(PROMPT), true);
        r.boundaries.send(0).unwrap();

        for (cmd, out) in [("pwd", &b"/home/ops\r\n"[..]), ("whoami", &b"ops\r\n"[..])] {
            let (outcome, _) = tokio::join!(r.exec.submit(cmd, None), async {
                let _ = r.written.recv().await.unwrap();
                play_round(&r.hub, &r.boundaries, cmd, out, "0");
            });
            assert!(outcome.unwrap().is_success());
        }

        // Every command echo in the history is immediately preceded by a
        // prompt emission — including the first command's.
        let history = r.hub.slice(0..r.hub.total_bytes());
        for cmd in ["pwd\r\n", "whoami\r\n"] {
            let mut expected = PROMPT.to_vec();
            expected.extend_from_slice(cmd.as_bytes());
            assert!(
                memchr::memmem::find(&history, &expected).is_some(),
                "echo for {:?} is not prompt-preceded",
                cmd
            );
        }
    }

    #[tokio::test]
    async fn test_concurrent_submit_fails_busy() {
        let r = rig();
        let exec = r.exec.clone();
        let first = tokio::spawn(async move { exec.submit("sleep 60", None).await });
        tokio::task::yield_now().await;
        tokio::task::yield_now().await;

        match r.exec.submit("pwd", None).await {
            Err(Error::Session(SessionError::Busy { name })) => assert_eq!(name, "test"),
            other => panic!("expected Busy, got {:?}", other),
        }
        first.abort();
    }

    #[tokio::test(start_paused = true)]
    async fn test_timeout_releases_lock() {
        let mut r = rig();
        match r.exec.submit("pwd", Some(Duration::from_millis(100))).await {
            Err(Error::Session(SessionError::CommandTimeout(_))) => {}
            other => panic!("expected CommandTimeout, got {:?}", other),
        }
        // First payload is still queued; discard it before the retry.
        let _ = r.written.try_recv().unwrap();

        let (outcome, _) = tokio::join!(r.exec.submit("pwd", None), async {
            let _ = r.written.recv().await.unwrap();
            play_round(&r.hub, &r.boundaries, "pwd", b"/home/ops\r\n", "0");
        });
        assert_eq!(outcome.unwrap().stdout, "/home/ops\r\n");
    }

    #[tokio::test]
    async fn test_closed_boundary_channel_yields_closed() {
        let mut r = rig();
        drop(r.boundaries);
        match r.exec.submit("pwd", None).await {
            Err(Error::Session(SessionError::Closed { name })) => assert_eq!(name, "test"),
            other => panic!("expected Closed, got {:?}", other),
        }
        let _ = r.written.try_recv().unwrap();
    }

    #[tokio::test]
    async fn test_multiline_command_rejected() {
        let r = rig();
        match r.exec.submit("pwd\nwhoami", None).await {
            Err(Error::Session(SessionError::InvalidCommand { .. })) => {}
            other => panic!("expected InvalidCommand, got {:?}", other),
        }
    }

    #[test]
    fn test_strip_echo_lines() {
        let body = b"pwd\r\necho __trl_rc $?\r\n/home/ops\r\n";
        assert_eq!(
            strip_echo_lines(body, b"pwd", sentinel_command().as_bytes()),
            b"/home/ops\r\n"
        );
        // Echo absent (remote without echo): body passes through.
        assert_eq!(strip_echo_lines(b"/tmp\r\n", b"pwd", b"echo"), b"/tmp\r\n");
    }

    #[test]
    fn test_trim_trailing_prompt() {
        let body = b"output\r\n__trl_ops@db1__$ ";
        assert_eq!(trim_trailing_prompt(body, PROMPT), b"output\r\n");
        assert_eq!(trim_trailing_prompt(b"output\r\n", PROMPT), b"output\r\n");
    }

    #[test]
    fn test_parse_exit_code() {
        assert_eq!(parse_exit_code(b"0"), Some(0));
        assert_eq!(parse_exit_code(b"127"), Some(127));
        assert_eq!(parse_exit_code(b"99999999999999999999"), None);
    }

    #[test]
    fn test_pending_command_transitions() {
        let mut pending = PendingCommand::new("uptime");
        assert_eq!(pending.state(), PendingState::Queued);
        pending.advance(PendingState::Sent);
        pending.advance(PendingState::AwaitingPrompt);
        assert_eq!(pending.state(), PendingState::AwaitingPrompt);
        pending.advance(PendingState::Completed);
        assert_eq!(pending.state(), PendingState::Completed);
        assert_eq!(pending.text(), "uptime");
    }
}
