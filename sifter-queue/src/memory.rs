//! In-process work queue

use crate::error::QueueError;
use crate::queue::{
    check_group, AppendOutcome, MessageId, QueueMessage, QueueOptions, QueueStats, ReceiptHandle,
    WorkQueue,
};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tokio::sync::Notify;
use tokio::time::Instant;
use tracing::{debug, info};

#[derive(Debug, Clone)]
struct StoredMessage {
    seq: u64,
    id: MessageId,
    group: String,
    body: String,
    dedup_key: String,
    sent_at: DateTime<Utc>,
    receive_count: u32,
}

impl StoredMessage {
    fn deliver(&self, receipt: ReceiptHandle) -> QueueMessage {
        QueueMessage {
            id: self.id.clone(),
            group: self.group.clone(),
            body: self.body.clone(),
            dedup_key: self.dedup_key.clone(),
            sent_at: self.sent_at,
            receive_count: self.receive_count,
            receipt,
        }
    }
}

#[derive(Debug)]
struct Lease {
    message: StoredMessage,
    expires_at: Instant,
}

#[derive(Debug, Default)]
struct QueueState {
    next_seq: u64,
    /// Visible messages keyed by append order
    pending: BTreeMap<u64, StoredMessage>,
    in_flight: HashMap<ReceiptHandle, Lease>,
    /// Dedup key -> (original message, when the key was first seen)
    dedup: HashMap<String, (MessageId, Instant)>,
}

impl QueueState {
    /// Put messages whose lease ran out back in line, at their original position
    fn release_expired(&mut self, queue: &str, now: Instant) {
        let expired: Vec<ReceiptHandle> = self
            .in_flight
            .iter()
            .filter(|(_, lease)| lease.expires_at <= now)
            .map(|(receipt, _)| receipt.clone())
            .collect();

        for receipt in expired {
            if let Some(lease) = self.in_flight.remove(&receipt) {
                debug!(
                    "Visibility timeout expired on '{}', message {} is visible again",
                    queue, lease.message.id
                );
                self.pending.insert(lease.message.seq, lease.message);
            }
        }
    }

    fn prune_dedup(&mut self, now: Instant, window: Duration) {
        self.dedup
            .retain(|_, (_, first_seen)| now.saturating_duration_since(*first_seen) < window);
    }

    fn next_expiry(&self) -> Option<Instant> {
        self.in_flight.values().map(|lease| lease.expires_at).min()
    }
}

/// Work queue held in process memory.
///
/// Only usable when producer and consumer share a process (tests, `sifter run`).
pub struct MemoryQueue {
    name: String,
    options: QueueOptions,
    state: Mutex<QueueState>,
    notify: Notify,
    closed: AtomicBool,
}

impl MemoryQueue {
    /// Create a queue with default options
    pub fn new(name: impl Into<String>) -> Self {
        Self::with_options(name, QueueOptions::default())
    }

    pub fn with_options(name: impl Into<String>, options: QueueOptions) -> Self {
        Self {
            name: name.into(),
            options,
            state: Mutex::new(QueueState::default()),
            notify: Notify::new(),
            closed: AtomicBool::new(false),
        }
    }

    pub fn options(&self) -> &QueueOptions {
        &self.options
    }

    fn ensure_open(&self) -> Result<(), QueueError> {
        if self.closed.load(Ordering::Acquire) {
            return Err(QueueError::Closed(self.name.clone()));
        }
        Ok(())
    }

    fn try_claim(&self, now: Instant) -> Option<QueueMessage> {
        let mut state = self.state.lock();
        state.release_expired(&self.name, now);

        // A group with a message in flight is blocked until that message is
        // acknowledged or its lease expires.
        let busy: HashSet<String> = state
            .in_flight
            .values()
            .map(|lease| lease.message.group.clone())
            .collect();

        let seq = state
            .pending
            .values()
            .find(|m| !busy.contains(&m.group))
            .map(|m| m.seq)?;

        let mut message = state.pending.remove(&seq)?;
        message.receive_count += 1;

        let receipt = ReceiptHandle::generate();
        let delivered = message.deliver(receipt.clone());
        state.in_flight.insert(
            receipt,
            Lease {
                message,
                expires_at: now + self.options.visibility_timeout,
            },
        );

        Some(delivered)
    }
}

#[async_trait]
impl WorkQueue for MemoryQueue {
    fn name(&self) -> &str {
        &self.name
    }

    async fn append_with_key(
        &self,
        group: &str,
        body: &str,
        dedup_key: &str,
    ) -> Result<AppendOutcome, QueueError> {
        self.ensure_open()?;
        check_group(group)?;

        let now = Instant::now();
        let id = {
            let mut state = self.state.lock();
            state.prune_dedup(now, self.options.dedup_window);

            if let Some((original, _)) = state.dedup.get(dedup_key) {
                debug!(
                    "Duplicate append to '{}' suppressed (key {}), original message {}",
                    self.name, dedup_key, original
                );
                return Ok(AppendOutcome::duplicate_of(original.clone()));
            }

            let seq = state.next_seq;
            state.next_seq += 1;

            let id = MessageId::generate();
            state.dedup.insert(dedup_key.to_string(), (id.clone(), now));
            state.pending.insert(
                seq,
                StoredMessage {
                    seq,
                    id: id.clone(),
                    group: group.to_string(),
                    body: body.to_string(),
                    dedup_key: dedup_key.to_string(),
                    sent_at: Utc::now(),
                    receive_count: 0,
                },
            );
            id
        };

        debug!("Appended {} to '{}' group '{}' as {}", body, self.name, group, id);
        self.notify.notify_one();
        Ok(AppendOutcome::appended(id))
    }

    async fn take(&self, wait: Duration) -> Result<Option<QueueMessage>, QueueError> {
        let deadline = Instant::now() + wait;

        loop {
            self.ensure_open()?;

            let now = Instant::now();
            if let Some(message) = self.try_claim(now) {
                debug!(
                    "Delivered {} from '{}' (receive #{})",
                    message.body, self.name, message.receive_count
                );
                return Ok(Some(message));
            }

            if now >= deadline {
                return Ok(None);
            }

            let mut sleep_for = deadline - now;
            if let Some(expiry) = self.state.lock().next_expiry() {
                sleep_for = sleep_for.min(expiry.saturating_duration_since(now));
            }

            // Woken early by append/ack; a timeout just means re-check.
            let _ = tokio::time::timeout(sleep_for, self.notify.notified()).await;
        }
    }

    async fn ack(&self, message: &QueueMessage) -> Result<(), QueueError> {
        let removed = {
            let mut state = self.state.lock();
            state.release_expired(&self.name, Instant::now());
            state.in_flight.remove(&message.receipt).is_some()
        };

        if removed {
            debug!("Acknowledged {} on '{}'", message.id, self.name);
            self.notify.notify_one();
        } else {
            debug!(
                "Ignoring ack of {} on '{}': receipt is stale or already used",
                message.id, self.name
            );
        }
        Ok(())
    }

    async fn stats(&self) -> Result<QueueStats, QueueError> {
        let mut state = self.state.lock();
        state.release_expired(&self.name, Instant::now());
        Ok(QueueStats {
            visible: state.pending.len(),
            in_flight: state.in_flight.len(),
        })
    }

    async fn purge(&self) -> Result<(), QueueError> {
        let mut state = self.state.lock();
        let dropped = state.pending.len() + state.in_flight.len();
        state.pending.clear();
        state.in_flight.clear();
        state.dedup.clear();
        info!("Purged '{}' ({} messages dropped)", self.name, dropped);
        Ok(())
    }

    async fn forget_keys(&self) -> Result<usize, QueueError> {
        self.ensure_open()?;
        let mut state = self.state.lock();
        let forgotten = state.dedup.len();
        state.dedup.clear();
        debug!("Forgot {} dedup keys on '{}'", forgotten, self.name);
        Ok(forgotten)
    }

    async fn close(&self) -> Result<(), QueueError> {
        if !self.closed.swap(true, Ordering::AcqRel) {
            debug!("Closed queue '{}'", self.name);
        }
        self.notify.notify_waiters();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn short_lease() -> QueueOptions {
        QueueOptions::default().with_visibility_timeout(Duration::from_millis(50))
    }

    #[tokio::test]
    async fn test_fifo_within_group() {
        let queue = MemoryQueue::new("q");
        for body in ["a", "b", "c"] {
            queue.append("g", body).await.unwrap();
        }

        for expected in ["a", "b", "c"] {
            let message = queue.take(Duration::ZERO).await.unwrap().unwrap();
            assert_eq!(message.body, expected);
            queue.ack(&message).await.unwrap();
        }
        assert!(queue.take(Duration::ZERO).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_duplicate_append_returns_original_id() {
        let queue = MemoryQueue::new("q");
        let first = queue.append("g", "a").await.unwrap();
        let second = queue.append("g", "a").await.unwrap();
        assert!(!first.duplicate);
        assert!(second.duplicate);
        assert_eq!(first.id, second.id);
        assert_eq!(queue.stats().await.unwrap().visible, 1);
    }

    #[tokio::test]
    async fn test_forget_keys_keeps_messages() {
        let queue = MemoryQueue::new("q");
        queue.append("g", "a").await.unwrap();
        queue.append("g", "-1").await.unwrap();

        assert_eq!(queue.forget_keys().await.unwrap(), 2);
        assert_eq!(queue.stats().await.unwrap().visible, 2);

        // The same bodies count as new appends again
        let again = queue.append("g", "-1").await.unwrap();
        assert!(!again.duplicate);
        assert_eq!(queue.stats().await.unwrap().visible, 3);
    }

    #[tokio::test]
    async fn test_same_body_in_other_group_is_not_a_duplicate() {
        let queue = MemoryQueue::new("q");
        queue.append("g1", "a").await.unwrap();
        queue.append("g2", "a").await.unwrap();
        assert_eq!(queue.stats().await.unwrap().visible, 2);
    }

    #[tokio::test]
    async fn test_dedup_window_expires() {
        let options = QueueOptions::default().with_dedup_window(Duration::from_millis(20));
        let queue = MemoryQueue::with_options("q", options);
        let first = queue.append("g", "a").await.unwrap();
        tokio::time::sleep(Duration::from_millis(40)).await;
        let second = queue.append("g", "a").await.unwrap();
        assert!(!second.duplicate);
        assert_ne!(first.id, second.id);
        assert_eq!(queue.stats().await.unwrap().visible, 2);
    }

    #[tokio::test]
    async fn test_group_blocked_while_in_flight() {
        let queue = MemoryQueue::new("q");
        queue.append("g", "a").await.unwrap();
        queue.append("g", "b").await.unwrap();
        queue.append("h", "x").await.unwrap();

        let a = queue.take(Duration::ZERO).await.unwrap().unwrap();
        assert_eq!(a.body, "a");

        // "b" waits behind "a"; the other group is unaffected
        let x = queue.take(Duration::ZERO).await.unwrap().unwrap();
        assert_eq!(x.body, "x");
        assert!(queue.take(Duration::ZERO).await.unwrap().is_none());

        queue.ack(&a).await.unwrap();
        let b = queue.take(Duration::ZERO).await.unwrap().unwrap();
        assert_eq!(b.body, "b");
    }

    #[tokio::test]
    async fn test_redelivery_after_visibility_timeout() {
        let queue = MemoryQueue::with_options("q", short_lease());
        queue.append("g", "a").await.unwrap();

        let first = queue.take(Duration::ZERO).await.unwrap().unwrap();
        assert_eq!(first.receive_count, 1);
        assert!(queue.take(Duration::ZERO).await.unwrap().is_none());

        let second = queue
            .take(Duration::from_millis(500))
            .await
            .unwrap()
            .expect("message should come back after its lease expires");
        assert_eq!(second.id, first.id);
        assert_eq!(second.receive_count, 2);
        assert_ne!(second.receipt, first.receipt);
    }

    #[tokio::test]
    async fn test_stale_ack_is_a_noop() {
        let queue = MemoryQueue::with_options("q", short_lease());
        queue.append("g", "a").await.unwrap();

        let first = queue.take(Duration::ZERO).await.unwrap().unwrap();
        tokio::time::sleep(Duration::from_millis(80)).await;

        // Lease is gone, the old receipt no longer removes anything
        queue.ack(&first).await.unwrap();
        let again = queue.take(Duration::ZERO).await.unwrap().unwrap();
        assert_eq!(again.id, first.id);

        queue.ack(&again).await.unwrap();
        queue.ack(&again).await.unwrap();
        assert!(queue.stats().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_take_times_out_empty() {
        let queue = MemoryQueue::new("q");
        let started = Instant::now();
        let message = queue.take(Duration::from_millis(30)).await.unwrap();
        assert!(message.is_none());
        assert!(started.elapsed() >= Duration::from_millis(30));
    }

    #[tokio::test]
    async fn test_take_wakes_on_append() {
        let queue = std::sync::Arc::new(MemoryQueue::new("q"));
        let producer = queue.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            producer.append("g", "late").await.unwrap();
        });

        let message = queue.take(Duration::from_secs(5)).await.unwrap().unwrap();
        assert_eq!(message.body, "late");
    }

    #[tokio::test]
    async fn test_empty_group_rejected() {
        let queue = MemoryQueue::new("q");
        assert!(matches!(
            queue.append("", "a").await,
            Err(QueueError::InvalidGroup(_))
        ));
    }

    #[tokio::test]
    async fn test_closed_queue_refuses_work() {
        let queue = MemoryQueue::new("q");
        queue.close().await.unwrap();
        assert!(matches!(queue.append("g", "a").await, Err(QueueError::Closed(_))));
        assert!(matches!(queue.take(Duration::ZERO).await, Err(QueueError::Closed(_))));
    }

    #[tokio::test]
    async fn test_purge() {
        let queue = MemoryQueue::new("q");
        queue.append("g", "a").await.unwrap();
        queue.append("g", "b").await.unwrap();
        let _taken = queue.take(Duration::ZERO).await.unwrap().unwrap();

        queue.purge().await.unwrap();
        assert!(queue.stats().await.unwrap().is_empty());

        // Dedup keys are forgotten too
        queue.append("g", "a").await.unwrap();
        assert_eq!(queue.stats().await.unwrap().visible, 1);
    }
}
