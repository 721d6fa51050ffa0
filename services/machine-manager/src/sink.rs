//! Line-oriented output channel for provisioning logs and process output.
//!
//! A `LogSink` is the sending half of an unbounded `mpsc` channel. Sends
//! never block the producer, so a slow consumer cannot stall a build or a
//! process. A discarding sink drops every line; it is the default when the
//! caller declines output.

use tokio::sync::mpsc;

/// Receiving half handed back to the caller of [`LogSink::channel`].
pub type LogReceiver = mpsc::UnboundedReceiver<String>;

/// Ordered sink for lines of text.
#[derive(Debug, Clone, Default)]
pub struct LogSink {
    tx: Option<mpsc::UnboundedSender<String>>,
}

impl LogSink {
    /// Create a sink and the receiver its lines are delivered to.
    pub fn channel() -> (Self, LogReceiver) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx: Some(tx) }, rx)
    }

    /// A sink that drops everything.
    pub fn discard() -> Self {
        Self { tx: None }
    }

    /// Returns true if lines sent to this sink go nowhere.
    pub fn is_discarding(&self) -> bool {
        self.tx.as_ref().is_none_or(|tx| tx.is_closed())
    }

    /// Deliver one line. Lines sent after the receiver is dropped are lost.
    pub fn send_line(&self, line: impl Into<String>) {
        if let Some(tx) = &self.tx {
            let _ = tx.send(line.into());
        }
    }
}

/// Drain everything currently buffered in `rx` without waiting.
pub fn drain(rx: &mut LogReceiver) -> Vec<String> {
    let mut lines = Vec::new();
    while let Ok(line) = rx.try_recv() {
        lines.push(line);
    }
    lines
}
