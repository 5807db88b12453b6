//! Write-side handle for a session's remote channel.
//!
//! The reader task is the channel's only owner; everything written to
//! the remote goes through this handle and is applied between reads on
//! the same sequential path.

use tokio::sync::mpsc;

/// Instruction forwarded to the reader task.
#[derive(Debug)]
pub(crate) enum WriterMsg {
    /// Raw bytes to write to the remote channel.
    Data(Vec<u8>),

    /// Stop the reader: send EOF on the channel and finalize.
    Shutdown,
}

/// The channel on the far side of the writer is gone — the reader task
/// has stopped and the session is no longer usable.
#[derive(Debug)]
pub(crate) struct ChannelGone;

/// Cloneable handle for writing to a session's remote channel.
#[derive(Clone)]
pub(crate) struct ChannelWriter {
    tx: mpsc::UnboundedSender<WriterMsg>,
}

impl ChannelWriter {
    pub(crate) fn new(tx: mpsc::UnboundedSender<WriterMsg>) -> Self {
        Self { tx }
    }

    /// Queue raw bytes for the remote.
    pub(crate) fn send(&self, bytes: Vec<u8>) -> Result<(), ChannelGone> {
        self.tx.send(WriterMsg::Data(bytes)).map_err(|_| ChannelGone)
    }

    /// Ask the reader task to shut the channel down. Idempotent: once
    /// the reader is gone the message is simply dropped.
    pub(crate) fn shutdown(&self) {
        let _ = self.tx.send(WriterMsg::Shutdown);
    }
}
