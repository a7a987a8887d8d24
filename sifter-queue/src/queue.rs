//! Work queue capability shared by all queue backends

use crate::error::QueueError;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sifter_core::{dedup_key, QueueBody, QueueConfig};
use std::fmt;
use std::time::Duration;

/// Identifier assigned to a message when it is first appended
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct MessageId(String);

impl MessageId {
    pub fn generate() -> Self {
        Self(uuid::Uuid::new_v4().simple().to_string())
    }

    pub fn from_string(id: String) -> Self {
        Self(id)
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for MessageId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Result of an append
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AppendOutcome {
    /// The new message, or the original one when the key was already used
    pub id: MessageId,
    /// Nothing was appended because the dedup key was used within the window
    pub duplicate: bool,
}

impl AppendOutcome {
    pub(crate) fn appended(id: MessageId) -> Self {
        Self {
            id,
            duplicate: false,
        }
    }

    pub(crate) fn duplicate_of(id: MessageId) -> Self {
        Self {
            id,
            duplicate: true,
        }
    }
}

/// Proof of one particular delivery, required to acknowledge it.
///
/// Every redelivery gets a fresh handle; acknowledging with an old one is a no-op.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ReceiptHandle(String);

impl ReceiptHandle {
    pub fn generate() -> Self {
        Self(uuid::Uuid::new_v4().simple().to_string())
    }

    pub fn from_string(handle: String) -> Self {
        Self(handle)
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

/// A delivered message
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueueMessage {
    pub id: MessageId,
    pub group: String,
    pub body: String,
    pub dedup_key: String,
    pub sent_at: DateTime<Utc>,
    /// Number of times this message has been handed out, including this one
    pub receive_count: u32,
    pub receipt: ReceiptHandle,
}

impl QueueMessage {
    /// Decode the raw body into an item or the stop sentinel
    pub fn decode(&self) -> QueueBody {
        QueueBody::decode(&self.body)
    }
}

/// Point-in-time queue depth
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueueStats {
    /// Messages waiting to be taken
    pub visible: usize,
    /// Messages taken but not yet acknowledged
    pub in_flight: usize,
}

impl QueueStats {
    pub fn is_empty(&self) -> bool {
        self.visible == 0 && self.in_flight == 0
    }
}

/// Timing behaviour of a queue
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QueueOptions {
    pub visibility_timeout: Duration,
    pub dedup_window: Duration,
    /// Rescan interval for backends that cannot be woken up (spool)
    pub poll_interval: Duration,
    /// How long a dedup key may stay reserved without its message being
    /// published before another producer may take it over (spool)
    pub reservation_timeout: Duration,
}

impl Default for QueueOptions {
    fn default() -> Self {
        Self {
            visibility_timeout: Duration::from_secs(30),
            dedup_window: Duration::from_secs(300),
            poll_interval: Duration::from_millis(200),
            reservation_timeout: Duration::from_secs(5),
        }
    }
}

impl QueueOptions {
    pub fn from_config(config: &QueueConfig) -> Self {
        Self {
            visibility_timeout: config.visibility_timeout(),
            dedup_window: config.dedup_window(),
            poll_interval: config.poll_interval(),
            ..Self::default()
        }
    }

    pub fn with_visibility_timeout(mut self, timeout: Duration) -> Self {
        self.visibility_timeout = timeout;
        self
    }

    pub fn with_dedup_window(mut self, window: Duration) -> Self {
        self.dedup_window = window;
        self
    }

    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    pub fn with_reservation_timeout(mut self, timeout: Duration) -> Self {
        self.reservation_timeout = timeout;
        self
    }
}

/// Ordered, deduplicating, at-least-once delivery channel
#[async_trait]
pub trait WorkQueue: Send + Sync {
    /// Queue name
    fn name(&self) -> &str;

    /// Append `body` to `group` under an explicit deduplication key.
    ///
    /// If the key was used within the dedup window nothing is appended and the
    /// outcome carries the id of the original message, marked as a duplicate.
    async fn append_with_key(
        &self,
        group: &str,
        body: &str,
        dedup_key: &str,
    ) -> Result<AppendOutcome, QueueError>;

    /// Append `body` to `group` with the key `"{group}:{body}"`
    async fn append(&self, group: &str, body: &str) -> Result<AppendOutcome, QueueError> {
        let key = dedup_key(group, body);
        self.append_with_key(group, body, &key).await
    }

    /// Append a decoded body
    async fn send(&self, group: &str, body: &QueueBody) -> Result<AppendOutcome, QueueError> {
        self.append(group, body.encode()).await
    }

    /// Take at most one message, waiting up to `wait` for one to become visible
    async fn take(&self, wait: Duration) -> Result<Option<QueueMessage>, QueueError>;

    /// Remove a delivered message. Unknown or stale receipts are ignored.
    async fn ack(&self, message: &QueueMessage) -> Result<(), QueueError>;

    /// Current depth
    async fn stats(&self) -> Result<QueueStats, QueueError>;

    /// Drop every message and dedup key
    async fn purge(&self) -> Result<(), QueueError>;

    /// Forget every dedup key but keep the messages; returns how many keys
    /// were dropped. Producers call this when they start a new run.
    async fn forget_keys(&self) -> Result<usize, QueueError>;

    /// Release the handle; further calls fail with [`QueueError::Closed`]
    async fn close(&self) -> Result<(), QueueError> {
        Ok(())
    }
}

pub(crate) fn check_group(group: &str) -> Result<(), QueueError> {
    if group.is_empty() {
        return Err(QueueError::InvalidGroup("group cannot be empty".to_string()));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_options_from_config() {
        let config = QueueConfig::default();
        let options = QueueOptions::from_config(&config);
        assert_eq!(options.visibility_timeout, Duration::from_secs(30));
        assert_eq!(options.dedup_window, Duration::from_secs(300));
        assert_eq!(options.poll_interval, Duration::from_millis(200));
        assert_eq!(options.reservation_timeout, Duration::from_secs(5));
    }

    #[test]
    fn test_generated_ids_are_unique() {
        assert_ne!(MessageId::generate(), MessageId::generate());
        assert_ne!(ReceiptHandle::generate(), ReceiptHandle::generate());
    }

    #[test]
    fn test_generated_ids_have_no_dots() {
        // Spool file names use '.' as a field separator
        assert!(!MessageId::generate().as_str().contains('.'));
        assert!(!ReceiptHandle::generate().as_str().contains('.'));
    }
}
