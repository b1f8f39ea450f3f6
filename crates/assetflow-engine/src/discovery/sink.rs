//! Hand-off of run requests from discovery to whatever executes jobs.

use std::sync::{Mutex, PoisonError};

use assetflow_types::run::RunRequest;
use async_trait::async_trait;
use tokio::sync::mpsc;

/// The receiving side went away or refused the request.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("{0}")]
pub struct SinkError(pub String);

/// Durable hand-off point for run requests. `submit` returning `Ok` means
/// the request is the receiver's responsibility.
#[async_trait]
pub trait RunRequestSink: Send + Sync {
    /// # Errors
    ///
    /// Returns [`SinkError`] when the request could not be handed off.
    async fn submit(&self, request: RunRequest) -> Result<(), SinkError>;
}

/// Sink backed by a bounded tokio channel.
#[derive(Debug, Clone)]
pub struct ChannelSink {
    tx: mpsc::Sender<RunRequest>,
}

impl ChannelSink {
    #[must_use]
    pub fn new(tx: mpsc::Sender<RunRequest>) -> Self {
        Self { tx }
    }

    /// A sink and the receiver draining it.
    #[must_use]
    pub fn channel(capacity: usize) -> (Self, mpsc::Receiver<RunRequest>) {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        (Self { tx }, rx)
    }
}

#[async_trait]
impl RunRequestSink for ChannelSink {
    async fn submit(&self, request: RunRequest) -> Result<(), SinkError> {
        self.tx
            .send(request)
            .await
            .map_err(|e| SinkError(format!("receiver dropped request {}", e.0.run_key)))
    }
}

/// Sink that keeps every request in memory.
#[derive(Debug, Default)]
pub struct MemorySink {
    requests: Mutex<Vec<RunRequest>>,
}

impl MemorySink {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Requests received so far, in submission order.
    #[must_use]
    pub fn requests(&self) -> Vec<RunRequest> {
        self.requests
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Drain the received requests.
    pub fn take(&self) -> Vec<RunRequest> {
        std::mem::take(&mut *self.requests.lock().unwrap_or_else(PoisonError::into_inner))
    }
}

#[async_trait]
impl RunRequestSink for MemorySink {
    async fn submit(&self, request: RunRequest) -> Result<(), SinkError> {
        self.requests
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(request);
        Ok(())
    }
}
