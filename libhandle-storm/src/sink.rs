use crate::types::Finding;
use async_trait::async_trait;
use thiserror::Error;
use tokio::sync::mpsc;

#[derive(Debug, Error)]
#[error("Result delivery failed: {0}")]
pub struct SinkError(pub String);

/// Where positive findings and operator alerts go. Delivery is best-effort;
/// errors are logged by the caller and never stop the prober.
#[async_trait]
pub trait ResultSink: Send + Sync {
    async fn found(&self, finding: &Finding) -> Result<(), SinkError>;

    async fn alert(&self, _message: &str) -> Result<(), SinkError> {
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SinkEvent {
    Found(Finding),
    Alert(String),
}

/// Forwards everything into an unbounded channel.
#[derive(Clone)]
pub struct ChannelSink {
    tx: mpsc::UnboundedSender<SinkEvent>,
}

impl ChannelSink {
    pub fn channel() -> (Self, mpsc::UnboundedReceiver<SinkEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }

    fn send(&self, event: SinkEvent) -> Result<(), SinkError> {
        self.tx
            .send(event)
            .map_err(|_| SinkError("receiver dropped".to_string()))
    }
}

#[async_trait]
impl ResultSink for ChannelSink {
    async fn found(&self, finding: &Finding) -> Result<(), SinkError> {
        self.send(SinkEvent::Found(finding.clone()))
    }

    async fn alert(&self, message: &str) -> Result<(), SinkError> {
        self.send(SinkEvent::Alert(message.to_string()))
    }
}

/// Writes findings to the log.
pub struct LogSink;

#[async_trait]
impl ResultSink for LogSink {
    async fn found(&self, finding: &Finding) -> Result<(), SinkError> {
        tracing::info!(handle = %finding.handle, url = %finding.url, "Handle available");
        Ok(())
    }

    async fn alert(&self, message: &str) -> Result<(), SinkError> {
        tracing::error!("{}", message);
        Ok(())
    }
}
