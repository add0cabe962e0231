//! Container output routing.
//!
//! Every line a container writes is tagged with the workload's log GUID
//! and source name. Lines from one stream reach the sink in the order
//! they were written.

use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LogStream {
    Out,
    Err,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LogMessage {
    pub guid: String,
    pub source_name: String,
    pub stream: LogStream,
    pub line: String,
}

/// Destination for container output.
pub trait LogSink: Send + Sync {
    fn emit(&self, message: LogMessage);
}

/// Writes container output as tracing events.
#[derive(Debug, Clone, Default)]
pub struct TracingLogSink;

impl LogSink for TracingLogSink {
    fn emit(&self, message: LogMessage) {
        tracing::info!(
            target: "cellgrid::container",
            log_guid = %message.guid,
            source = %message.source_name,
            stream = ?message.stream,
            "{}",
            message.line
        );
    }
}

/// Forwards container output to a channel.
#[derive(Debug, Clone)]
pub struct ChannelLogSink {
    tx: mpsc::UnboundedSender<LogMessage>,
}

impl ChannelLogSink {
    pub fn new() -> (Self, mpsc::UnboundedReceiver<LogMessage>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }
}

impl LogSink for ChannelLogSink {
    fn emit(&self, message: LogMessage) {
        // Receiver gone means nobody is listening any more.
        let _ = self.tx.send(message);
    }
}
