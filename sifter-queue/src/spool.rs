//! Directory-backed work queue shared between processes
//!
//! Layout under `<root>/<queue>/`:
//!
//! ```text
//! pending/   {seq}.{id}.{receives}.msg                       visible messages
//! inflight/  {seq}.{id}.{receives}.{expires_ms}.{lease}.msg  taken, not acked
//! dedup/     {sha256(dedup key)}                             marker for the key
//! tmp/       staging area for atomic publication
//! ```
//!
//! A dedup marker reads `reserved {id}` while its producer is publishing the
//! message and `sent {id}` once the message is in `pending/`. A reservation
//! left behind by a producer that died before publishing is taken over after
//! `reservation_timeout`.
//!
//! Every state change is a single `rename` (claim, release) or `remove_file`
//! (ack), so two processes racing on the same message cannot both win. File
//! contents are written once and never modified; the mutable parts of a message
//! (receive count, lease) live in its file name.

use crate::error::QueueError;
use crate::queue::{
    check_group, AppendOutcome, MessageId, QueueMessage, QueueOptions, QueueStats, ReceiptHandle,
    WorkQueue,
};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::HashSet;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, SystemTime};
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tokio::time::Instant;
use tracing::{debug, info, warn};

const PENDING: &str = "pending";
const INFLIGHT: &str = "inflight";
const DEDUP: &str = "dedup";
const TMP: &str = "tmp";
const EXT: &str = "msg";
const RESERVED: &str = "reserved";
const SENT: &str = "sent";

/// Immutable part of a message, stored as JSON
#[derive(Debug, Clone, Serialize, Deserialize)]
struct SpooledMessage {
    id: MessageId,
    group: String,
    body: String,
    dedup_key: String,
    sent_at: DateTime<Utc>,
}

/// Name of a visible message file
#[derive(Debug, Clone, PartialEq, Eq)]
struct PendingName {
    seq: u64,
    id: String,
    receives: u32,
}

impl PendingName {
    fn parse(name: &str) -> Option<Self> {
        let stem = name.strip_suffix(&format!(".{}", EXT))?;
        let mut parts = stem.split('.');
        let seq = parts.next()?.parse().ok()?;
        let id = parts.next()?.to_string();
        let receives = parts.next()?.parse().ok()?;
        if parts.next().is_some() {
            return None;
        }
        Some(Self { seq, id, receives })
    }

    fn file_name(&self) -> String {
        format!("{:020}.{}.{}.{}", self.seq, self.id, self.receives, EXT)
    }

    fn lease(&self, expires_ms: i64, lease: &str) -> InflightName {
        InflightName {
            seq: self.seq,
            id: self.id.clone(),
            receives: self.receives + 1,
            expires_ms,
            lease: lease.to_string(),
        }
    }
}

/// Name of a taken message file; doubles as the receipt handle
#[derive(Debug, Clone, PartialEq, Eq)]
struct InflightName {
    seq: u64,
    id: String,
    receives: u32,
    expires_ms: i64,
    lease: String,
}

impl InflightName {
    fn parse(name: &str) -> Option<Self> {
        let stem = name.strip_suffix(&format!(".{}", EXT))?;
        let mut parts = stem.split('.');
        let seq = parts.next()?.parse().ok()?;
        let id = parts.next()?.to_string();
        let receives = parts.next()?.parse().ok()?;
        let expires_ms = parts.next()?.parse().ok()?;
        let lease = parts.next()?.to_string();
        if parts.next().is_some() {
            return None;
        }
        Some(Self {
            seq,
            id,
            receives,
            expires_ms,
            lease,
        })
    }

    fn file_name(&self) -> String {
        format!(
            "{:020}.{}.{}.{}.{}.{}",
            self.seq, self.id, self.receives, self.expires_ms, self.lease, EXT
        )
    }

    fn released(&self) -> PendingName {
        PendingName {
            seq: self.seq,
            id: self.id.clone(),
            receives: self.receives,
        }
    }

    fn is_expired(&self, now_ms: i64) -> bool {
        self.expires_ms <= now_ms
    }
}

/// State recorded in a dedup marker
#[derive(Debug, Clone, PartialEq, Eq)]
enum Marker {
    /// Key claimed; the id is missing while the marker is still being written
    Reserved(Option<MessageId>),
    /// Message published under this id
    Sent(MessageId),
}

impl Marker {
    fn parse(content: &str) -> Self {
        let mut parts = content.split_whitespace();
        let state = parts.next();
        let id = parts
            .next()
            .map(|id| MessageId::from_string(id.to_string()));
        match (state, id) {
            (Some(SENT), Some(id)) => Marker::Sent(id),
            (Some(RESERVED), id) => Marker::Reserved(id),
            _ => Marker::Reserved(None),
        }
    }

    fn reserved(id: &MessageId) -> String {
        format!("{} {}", RESERVED, id)
    }

    fn sent(id: &MessageId) -> String {
        format!("{} {}", SENT, id)
    }
}

/// Work queue stored as files in a directory.
///
/// Several `SpoolQueue` handles (in one or many processes) opened on the same
/// directory behave as one queue. Ordering inside a group follows append order
/// of a single producer process.
pub struct SpoolQueue {
    name: String,
    dir: PathBuf,
    options: QueueOptions,
    last_seq: Mutex<u64>,
    closed: AtomicBool,
}

impl SpoolQueue {
    /// Open (creating if needed) the queue `name` under `root`
    pub async fn open(
        root: impl AsRef<Path>,
        name: &str,
        options: QueueOptions,
    ) -> Result<Self, QueueError> {
        validate_name(name)?;
        let dir = root.as_ref().join(name);
        for sub in [PENDING, INFLIGHT, DEDUP, TMP] {
            fs::create_dir_all(dir.join(sub)).await.map_err(|e| {
                QueueError::Unavailable(format!("cannot prepare {}: {}", dir.display(), e))
            })?;
        }

        info!("Opened spool queue '{}' at {}", name, dir.display());
        Ok(Self {
            name: name.to_string(),
            dir,
            options,
            last_seq: Mutex::new(0),
            closed: AtomicBool::new(false),
        })
    }

    pub fn path(&self) -> &Path {
        &self.dir
    }

    fn ensure_open(&self) -> Result<(), QueueError> {
        if self.closed.load(Ordering::Acquire) {
            return Err(QueueError::Closed(self.name.clone()));
        }
        Ok(())
    }

    /// Monotonic per handle and roughly time ordered across processes
    fn next_seq(&self) -> u64 {
        let now = Utc::now().timestamp_nanos_opt().unwrap_or(0).max(0) as u64;
        let mut last = self.last_seq.lock();
        *last = (*last + 1).max(now);
        *last
    }

    fn sub(&self, sub: &str) -> PathBuf {
        self.dir.join(sub)
    }

    async fn list(&self, sub: &str) -> Result<Vec<String>, QueueError> {
        let mut names = Vec::new();
        let mut entries = fs::read_dir(self.sub(sub)).await?;
        while let Some(entry) = entries.next_entry().await? {
            if let Some(name) = entry.file_name().to_str() {
                names.push(name.to_string());
            }
        }
        names.sort();
        Ok(names)
    }

    async fn read_message(&self, path: &Path) -> Result<Option<SpooledMessage>, QueueError> {
        match fs::read(path).await {
            Ok(bytes) => Ok(Some(serde_json::from_slice(&bytes)?)),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    /// Write `bytes` to `dest` so that readers only ever see the complete file
    async fn publish(&self, dest: &Path, bytes: &[u8]) -> Result<(), QueueError> {
        let staging = self.sub(TMP).join(uuid::Uuid::new_v4().simple().to_string());
        let mut file = fs::File::create(&staging).await?;
        file.write_all(bytes).await?;
        file.sync_all().await?;
        drop(file);
        fs::rename(&staging, dest).await?;
        Ok(())
    }

    /// Move expired leases back to `pending/`; returns groups still in flight
    async fn release_expired(&self) -> Result<HashSet<String>, QueueError> {
        let now_ms = Utc::now().timestamp_millis();
        let mut busy = HashSet::new();

        for name in self.list(INFLIGHT).await? {
            let Some(inflight) = InflightName::parse(&name) else {
                warn!("Ignoring unexpected file {} in '{}'", name, self.name);
                continue;
            };
            let from = self.sub(INFLIGHT).join(&name);

            if inflight.is_expired(now_ms) {
                let to = self.sub(PENDING).join(inflight.released().file_name());
                match fs::rename(&from, &to).await {
                    Ok(()) => debug!(
                        "Visibility timeout expired on '{}', message {} is visible again",
                        self.name, inflight.id
                    ),
                    // Acked or released by someone else meanwhile
                    Err(e) if e.kind() == ErrorKind::NotFound => {}
                    Err(e) => return Err(e.into()),
                }
                continue;
            }

            if let Some(message) = self.read_message(&from).await? {
                busy.insert(message.group);
            }
        }

        Ok(busy)
    }

    async fn try_claim(&self) -> Result<Option<QueueMessage>, QueueError> {
        let mut busy = self.release_expired().await?;

        for name in self.list(PENDING).await? {
            let Some(pending) = PendingName::parse(&name) else {
                warn!("Ignoring unexpected file {} in '{}'", name, self.name);
                continue;
            };
            let from = self.sub(PENDING).join(&name);
            let Some(message) = self.read_message(&from).await? else {
                continue;
            };

            if busy.contains(&message.group) {
                continue;
            }

            let expires = Utc::now()
                + chrono::Duration::from_std(self.options.visibility_timeout)
                    .unwrap_or_else(|_| chrono::Duration::seconds(30));
            let lease = ReceiptHandle::generate();
            let inflight = pending.lease(expires.timestamp_millis(), lease.as_str());
            let to = self.sub(INFLIGHT).join(inflight.file_name());

            match fs::rename(&from, &to).await {
                Ok(()) => {
                    return Ok(Some(QueueMessage {
                        id: message.id,
                        group: message.group,
                        body: message.body,
                        dedup_key: message.dedup_key,
                        sent_at: message.sent_at,
                        receive_count: inflight.receives,
                        receipt: ReceiptHandle::from_string(inflight.file_name()),
                    }));
                }
                Err(e) if e.kind() == ErrorKind::NotFound => {
                    // Another consumer claimed it first; its group is now busy
                    busy.insert(message.group);
                }
                Err(e) => return Err(e.into()),
            }
        }

        Ok(None)
    }

    /// Reserve `dedup_key` for `id`; returns the original message id if the
    /// key is already in use
    async fn reserve_key(
        &self,
        dedup_key: &str,
        id: &MessageId,
    ) -> Result<Option<MessageId>, QueueError> {
        let path = self.dedup_path(dedup_key);
        let give_up = Instant::now() + self.options.reservation_timeout * 2;

        loop {
            if Instant::now() >= give_up {
                return Err(QueueError::Unavailable(format!(
                    "could not reserve dedup key {} on '{}'",
                    dedup_key, self.name
                )));
            }

            match fs::OpenOptions::new()
                .write(true)
                .create_new(true)
                .open(&path)
                .await
            {
                Ok(mut file) => {
                    file.write_all(Marker::reserved(id).as_bytes()).await?;
                    file.sync_all().await?;
                    return Ok(None);
                }
                Err(e) if e.kind() == ErrorKind::AlreadyExists => {}
                Err(e) => return Err(e.into()),
            }

            // Removed between create_new and here; try again
            let Some((marker, age)) = self.read_marker(&path).await? else {
                continue;
            };

            match marker {
                Marker::Sent(original) if age < self.options.dedup_window => {
                    return Ok(Some(original));
                }
                Marker::Sent(_) => {
                    // Window passed; forget the key and try again
                    remove_if_present(&path).await?;
                }
                Marker::Reserved(reserved_for) => {
                    if let Some(original) = reserved_for {
                        if self.is_published(&original).await? {
                            // Published but never marked sent; finish the marker for it
                            self.publish(&path, Marker::sent(&original).as_bytes()).await?;
                            return Ok(Some(original));
                        }
                    }

                    if age >= self.options.reservation_timeout {
                        warn!(
                            "Taking over dedup key {} on '{}': its producer never published",
                            dedup_key, self.name
                        );
                        remove_if_present(&path).await?;
                    } else {
                        // Another producer is publishing right now
                        tokio::time::sleep(
                            self.options.poll_interval.min(Duration::from_millis(20)),
                        )
                        .await;
                    }
                }
            }
        }
    }

    /// Marker content and age, or `None` if there is no marker
    async fn read_marker(&self, path: &Path) -> Result<Option<(Marker, Duration)>, QueueError> {
        let modified = match fs::metadata(path).await {
            Ok(meta) => meta.modified()?,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };
        let content = match fs::read_to_string(path).await {
            Ok(content) => content,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };
        let age = SystemTime::now()
            .duration_since(modified)
            .unwrap_or(Duration::ZERO);
        Ok(Some((Marker::parse(&content), age)))
    }

    /// Whether a message with this id is waiting or in flight
    async fn is_published(&self, id: &MessageId) -> Result<bool, QueueError> {
        for name in self.list(PENDING).await? {
            if PendingName::parse(&name).is_some_and(|p| p.id == id.as_str()) {
                return Ok(true);
            }
        }
        for name in self.list(INFLIGHT).await? {
            if InflightName::parse(&name).is_some_and(|i| i.id == id.as_str()) {
                return Ok(true);
            }
        }
        Ok(false)
    }

    fn dedup_path(&self, dedup_key: &str) -> PathBuf {
        let digest = Sha256::digest(dedup_key.as_bytes());
        self.sub(DEDUP).join(hex::encode(digest))
    }

    async fn clear(&self, sub: &str) -> Result<usize, QueueError> {
        let mut removed = 0;
        for name in self.list(sub).await? {
            match fs::remove_file(self.sub(sub).join(&name)).await {
                Ok(()) => removed += 1,
                Err(e) if e.kind() == ErrorKind::NotFound => {}
                Err(e) => return Err(e.into()),
            }
        }
        Ok(removed)
    }
}

async fn remove_if_present(path: &Path) -> Result<(), QueueError> {
    match fs::remove_file(path).await {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
        Err(e) => Err(e.into()),
    }
}

fn validate_name(name: &str) -> Result<(), QueueError> {
    let valid = !name.is_empty()
        && name != "."
        && name != ".."
        && name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-' || c == '.');
    if !valid {
        return Err(QueueError::InvalidName(format!(
            "'{}' (use letters, digits, '_', '-' or '.')",
            name
        )));
    }
    Ok(())
}

#[async_trait]
impl WorkQueue for SpoolQueue {
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

        let id = MessageId::generate();
        if let Some(original) = self.reserve_key(dedup_key, &id).await? {
            debug!(
                "Duplicate append to '{}' suppressed (key {}), original message {}",
                self.name, dedup_key, original
            );
            return Ok(AppendOutcome::duplicate_of(original));
        }

        let message = SpooledMessage {
            id: id.clone(),
            group: group.to_string(),
            body: body.to_string(),
            dedup_key: dedup_key.to_string(),
            sent_at: Utc::now(),
        };
        let name = PendingName {
            seq: self.next_seq(),
            id: id.to_string(),
            receives: 0,
        };

        let marker = self.dedup_path(dedup_key);
        let published = match serde_json::to_vec(&message) {
            Ok(bytes) => {
                self.publish(&self.sub(PENDING).join(name.file_name()), &bytes)
                    .await
            }
            Err(e) => Err(e.into()),
        };
        if let Err(e) = published {
            // Give the key back so a retry is not swallowed as a duplicate
            if let Err(cleanup) = remove_if_present(&marker).await {
                warn!(
                    "Could not release dedup key {} on '{}': {}",
                    dedup_key, self.name, cleanup
                );
            }
            return Err(e);
        }

        if let Err(e) = self.publish(&marker, Marker::sent(&id).as_bytes()).await {
            // The next producer that hits the reservation finds the message
            warn!(
                "Appended {} to '{}' but could not mark key {} as sent: {}",
                body, self.name, dedup_key, e
            );
        }

        debug!("Appended {} to '{}' group '{}' as {}", body, self.name, group, id);
        Ok(AppendOutcome::appended(id))
    }

    async fn take(&self, wait: Duration) -> Result<Option<QueueMessage>, QueueError> {
        let deadline = Instant::now() + wait;

        loop {
            self.ensure_open()?;

            if let Some(message) = self.try_claim().await? {
                debug!(
                    "Delivered {} from '{}' (receive #{})",
                    message.body, self.name, message.receive_count
                );
                return Ok(Some(message));
            }

            let now = Instant::now();
            if now >= deadline {
                return Ok(None);
            }
            tokio::time::sleep(self.options.poll_interval.min(deadline - now)).await;
        }
    }

    async fn ack(&self, message: &QueueMessage) -> Result<(), QueueError> {
        let Some(inflight) = InflightName::parse(message.receipt.as_str()) else {
            debug!(
                "Ignoring ack of {} on '{}': receipt is not from this queue",
                message.id, self.name
            );
            return Ok(());
        };

        if inflight.is_expired(Utc::now().timestamp_millis()) {
            debug!(
                "Ignoring ack of {} on '{}': lease already expired",
                message.id, self.name
            );
            return Ok(());
        }

        match fs::remove_file(self.sub(INFLIGHT).join(inflight.file_name())).await {
            Ok(()) => {
                debug!("Acknowledged {} on '{}'", message.id, self.name);
                Ok(())
            }
            Err(e) if e.kind() == ErrorKind::NotFound => {
                debug!(
                    "Ignoring ack of {} on '{}': receipt is stale or already used",
                    message.id, self.name
                );
                Ok(())
            }
            Err(e) => Err(e.into()),
        }
    }

    async fn stats(&self) -> Result<QueueStats, QueueError> {
        self.release_expired().await?;
        Ok(QueueStats {
            visible: self.list(PENDING).await?.len(),
            in_flight: self.list(INFLIGHT).await?.len(),
        })
    }

    async fn purge(&self) -> Result<(), QueueError> {
        let mut dropped = 0;
        dropped += self.clear(PENDING).await?;
        dropped += self.clear(INFLIGHT).await?;
        self.clear(DEDUP).await?;
        self.clear(TMP).await?;
        info!("Purged '{}' ({} messages dropped)", self.name, dropped);
        Ok(())
    }

    async fn forget_keys(&self) -> Result<usize, QueueError> {
        self.ensure_open()?;
        let forgotten = self.clear(DEDUP).await?;
        debug!("Forgot {} dedup keys on '{}'", forgotten, self.name);
        Ok(forgotten)
    }

    async fn close(&self) -> Result<(), QueueError> {
        if !self.closed.swap(true, Ordering::AcqRel) {
            debug!("Closed spool queue '{}'", self.name);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pending_name_round_trip() {
        let name = PendingName {
            seq: 42,
            id: "abc".to_string(),
            receives: 3,
        };
        assert_eq!(name.file_name(), "00000000000000000042.abc.3.msg");
        assert_eq!(PendingName::parse(&name.file_name()), Some(name));
    }

    #[test]
    fn test_lease_increments_receives() {
        let pending = PendingName {
            seq: 7,
            id: "abc".to_string(),
            receives: 0,
        };
        let inflight = pending.lease(1_000, "lease1");
        assert_eq!(inflight.receives, 1);
        assert_eq!(InflightName::parse(&inflight.file_name()), Some(inflight.clone()));
        assert_eq!(inflight.released().receives, 1);
        assert!(inflight.is_expired(1_000));
        assert!(!inflight.is_expired(999));
    }

    #[test]
    fn test_foreign_names_do_not_parse() {
        assert!(PendingName::parse("notes.txt").is_none());
        assert!(PendingName::parse("1.abc.2.3.msg").is_none());
        assert!(InflightName::parse("1.abc.2.msg").is_none());
    }

    #[test]
    fn test_queue_name_validation() {
        assert!(validate_name("car_indexes").is_ok());
        assert!(validate_name("people-indexes.fifo").is_ok());
        assert!(validate_name("").is_err());
        assert!(validate_name("..").is_err());
        assert!(validate_name("a/b").is_err());
    }

    #[test]
    fn test_marker_states() {
        let id = MessageId::from_string("abc".to_string());
        assert_eq!(Marker::parse(&Marker::sent(&id)), Marker::Sent(id.clone()));
        assert_eq!(Marker::parse(&Marker::reserved(&id)), Marker::Reserved(Some(id)));
        // Half-written or foreign content never yields an id to hand out
        assert_eq!(Marker::parse(""), Marker::Reserved(None));
        assert_eq!(Marker::parse("deadbeef"), Marker::Reserved(None));
    }

    fn quick_takeover() -> QueueOptions {
        QueueOptions::default()
            .with_poll_interval(Duration::from_millis(10))
            .with_reservation_timeout(Duration::from_millis(200))
    }

    #[tokio::test]
    async fn test_orphaned_reservation_is_taken_over() {
        let dir = tempfile::tempdir().unwrap();
        let queue = SpoolQueue::open(dir.path(), "q", quick_takeover()).await.unwrap();

        // A producer reserved the key and died before publishing
        std::fs::write(queue.dedup_path("q:A"), "deadbeef").unwrap();

        let outcome = queue.append("q", "A").await.unwrap();
        assert!(!outcome.duplicate);
        assert_ne!(outcome.id.as_str(), "deadbeef");
        assert_eq!(queue.stats().await.unwrap().visible, 1);

        let message = queue.take(Duration::ZERO).await.unwrap().unwrap();
        assert_eq!(message.body, "A");
        assert_eq!(message.id, outcome.id);

        // The key now protects the delivered message
        let retried = queue.append("q", "A").await.unwrap();
        assert!(retried.duplicate);
        assert_eq!(retried.id, outcome.id);
    }

    #[tokio::test]
    async fn test_reservation_of_published_message_counts_as_sent() {
        let dir = tempfile::tempdir().unwrap();
        let queue = SpoolQueue::open(dir.path(), "q", quick_takeover()).await.unwrap();

        // Producer published the message but died before marking the key sent
        let first = queue.append("g", "A").await.unwrap();
        std::fs::write(queue.dedup_path("g:A"), Marker::reserved(&first.id)).unwrap();

        let retried = queue.append("g", "A").await.unwrap();
        assert!(retried.duplicate);
        assert_eq!(retried.id, first.id);
        assert_eq!(queue.stats().await.unwrap().visible, 1);
        let content = std::fs::read_to_string(queue.dedup_path("g:A")).unwrap();
        assert_eq!(Marker::parse(&content), Marker::Sent(first.id));
    }

    #[tokio::test]
    async fn test_forget_keys_keeps_messages() {
        let dir = tempfile::tempdir().unwrap();
        let queue = SpoolQueue::open(dir.path(), "q", QueueOptions::default())
            .await
            .unwrap();
        queue.append("g", "A").await.unwrap();

        assert_eq!(queue.forget_keys().await.unwrap(), 1);
        assert_eq!(queue.stats().await.unwrap().visible, 1);
        assert!(!queue.append("g", "A").await.unwrap().duplicate);
    }

    #[tokio::test]
    async fn test_open_creates_layout() {
        let dir = tempfile::tempdir().unwrap();
        let queue = SpoolQueue::open(dir.path(), "q", QueueOptions::default())
            .await
            .unwrap();
        for sub in [PENDING, INFLIGHT, DEDUP, TMP] {
            assert!(queue.path().join(sub).is_dir());
        }
    }
}
