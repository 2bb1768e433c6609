use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tokio_stream::wrappers::UnboundedReceiverStream;

use crate::types::ListingCandidate;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Status {
    Info,
    Success,
    Warning,
    Error,
}

/// One record of the progress stream, rendered as one JSON line.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProgressEvent {
    pub message: String,
    pub status: Status,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Vec<ListingCandidate>>,
}

impl ProgressEvent {
    pub fn new(status: Status, message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            status,
            data: None,
        }
    }

    pub fn to_ndjson(&self) -> String {
        // A struct of strings and enums always serializes.
        serde_json::to_string(self).unwrap_or_default()
    }
}

/// Producer side of the progress stream.
///
/// Every event is mirrored to `tracing` and then queued in production order.
/// A dropped consumer is not an error; the visit keeps running.
#[derive(Clone)]
pub struct ProgressSink {
    tx: mpsc::UnboundedSender<ProgressEvent>,
}

impl ProgressSink {
    pub fn channel() -> (Self, UnboundedReceiverStream<ProgressEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, UnboundedReceiverStream::new(rx))
    }

    pub fn emit(&self, event: ProgressEvent) {
        match event.status {
            Status::Info | Status::Success => tracing::info!(target: "progress", "{}", event.message),
            Status::Warning => tracing::warn!(target: "progress", "{}", event.message),
            Status::Error => tracing::error!(target: "progress", "{}", event.message),
        }
        let _ = self.tx.send(event);
    }

    pub fn info(&self, message: impl Into<String>) {
        self.emit(ProgressEvent::new(Status::Info, message));
    }

    pub fn warning(&self, message: impl Into<String>) {
        self.emit(ProgressEvent::new(Status::Warning, message));
    }

    pub fn error(&self, message: impl Into<String>) {
        self.emit(ProgressEvent::new(Status::Error, message));
    }

    pub fn success(&self, message: impl Into<String>, data: Vec<ListingCandidate>) {
        self.emit(ProgressEvent {
            message: message.into(),
            status: Status::Success,
            data: Some(data),
        });
    }
}
