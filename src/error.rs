//! Error taxonomy of the sync layer.

use std::future::Future;
use std::time::Duration;

use thiserror::Error;

use crate::model::ChannelId;

pub type Result<T> = std::result::Result<T, SyncError>;

#[derive(Error, Debug)]
pub enum SyncError {
    /// A list, watch-open or session call exceeded its deadline.
    #[error("{operation} timed out after {}ms", timeout.as_millis())]
    TransportTimeout {
        operation: &'static str,
        timeout: Duration,
    },

    /// The backend command itself failed.
    #[error("{operation} failed: {source:#}")]
    Backend {
        operation: &'static str,
        #[source]
        source: anyhow::Error,
    },

    /// In-band `ERROR` on an otherwise open channel.
    #[error("stream error on {channel}: {message}")]
    Stream { channel: ChannelId, message: String },

    /// A caller-supplied event handler failed or panicked.
    #[error("event handler failed on {channel}: {message}")]
    ConsumerCallback { channel: ChannelId, message: String },

    #[error("undecodable payload on {channel}: {source}")]
    Decode {
        channel: ChannelId,
        #[source]
        source: serde_json::Error,
    },
}

impl SyncError {
    pub fn is_timeout(&self) -> bool {
        matches!(self, Self::TransportTimeout { .. })
    }
}

/// Runs one backend round trip under a deadline.
pub async fn with_deadline<T, F>(operation: &'static str, timeout: Duration, call: F) -> Result<T>
where
    F: Future<Output = anyhow::Result<T>>,
{
    match tokio::time::timeout(timeout, call).await {
        Ok(Ok(value)) => Ok(value),
        Ok(Err(source)) => Err(SyncError::Backend { operation, source }),
        Err(_) => Err(SyncError::TransportTimeout { operation, timeout }),
    }
}
