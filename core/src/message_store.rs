/// Message persistence seam and the in-memory store used in demo mode
use crate::error::{Result, StudyHubError};
use crate::messenger_types::{Message, MessageRecord, NewMessage};
use async_trait::async_trait;
use chrono::{DateTime, Duration, TimeZone, Utc};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::debug;
use uuid::Uuid;

/// Row selection understood by every store
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MessageFilter {
    /// Sent or received by the user
    Involving(String),
    /// Exchanged between the two users, either direction
    Between(String, String),
    /// Received by the user and not read yet
    UnreadFor(String),
}

impl MessageFilter {
    pub fn matches(&self, rec: &MessageRecord) -> bool {
        let sender = rec.sender_id.as_deref();
        let receiver = rec.receiver_id.as_deref();
        match self {
            MessageFilter::Involving(user) => {
                sender == Some(user.as_str()) || receiver == Some(user.as_str())
            }
            MessageFilter::Between(a, b) => {
                (sender == Some(a.as_str()) && receiver == Some(b.as_str()))
                    || (sender == Some(b.as_str()) && receiver == Some(a.as_str()))
            }
            MessageFilter::UnreadFor(user) => {
                receiver == Some(user.as_str()) && !rec.read.unwrap_or(false)
            }
        }
    }
}

/// The rows `mark_read` flips: sent by `sender_id` to `receiver_id`, still unread
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReadScope {
    pub receiver_id: String,
    pub sender_id: String,
}

impl ReadScope {
    pub fn new(receiver_id: &str, sender_id: &str) -> Self {
        Self {
            receiver_id: receiver_id.to_string(),
            sender_id: sender_id.to_string(),
        }
    }

    pub fn matches(&self, rec: &MessageRecord) -> bool {
        rec.receiver_id.as_deref() == Some(self.receiver_id.as_str())
            && rec.sender_id.as_deref() == Some(self.sender_id.as_str())
            && !rec.read.unwrap_or(false)
    }
}

/// Append-only message table with a scoped read-flag update
#[async_trait]
pub trait MessageStore: Send + Sync {
    /// Append one message; the store assigns id and timestamp
    async fn insert(&self, draft: NewMessage) -> Result<MessageRecord>;

    /// Rows matching the filter, ordered by `(created_at, id)` ascending
    async fn select(&self, filter: &MessageFilter) -> Result<Vec<MessageRecord>>;

    /// Set `read = true` on every row in scope; returns how many changed
    async fn mark_read(&self, scope: &ReadScope) -> Result<usize>;
}

fn record_order(a: &MessageRecord, b: &MessageRecord) -> std::cmp::Ordering {
    let ts = |r: &MessageRecord| r.created_at.as_deref().and_then(crate::messenger_types::parse_timestamp);
    (ts(a), a.id.as_deref()).cmp(&(ts(b), b.id.as_deref()))
}

/// In-memory message table.
///
/// Backs demo mode and tests. `set_reachable(false)` makes every call fail
/// with `StoreUnavailable`, the same way a lost backend connection does.
#[derive(Clone, Default)]
pub struct MemoryStore {
    rows: Arc<RwLock<Vec<MessageRecord>>>,
    unreachable: Arc<AtomicBool>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Store holding the given rows as-is (bad rows included)
    pub fn with_records(records: Vec<MessageRecord>) -> Self {
        Self {
            rows: Arc::new(RwLock::new(records)),
            unreachable: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Store pre-filled with the demo conversation set
    pub fn seeded() -> Self {
        Self::with_records(demo_messages().iter().map(MessageRecord::from).collect())
    }

    pub fn set_reachable(&self, reachable: bool) {
        self.unreachable.store(!reachable, Ordering::SeqCst);
    }

    /// Append a pre-built row, bypassing draft validation
    pub async fn push_record(&self, rec: MessageRecord) {
        self.rows.write().await.push(rec);
    }

    /// Number of stored rows
    pub async fn len(&self) -> usize {
        self.rows.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.rows.read().await.is_empty()
    }

    fn check(&self) -> Result<()> {
        if self.unreachable.load(Ordering::SeqCst) {
            return Err(StudyHubError::StoreUnavailable(
                "in-memory store marked unreachable".to_string(),
            ));
        }
        Ok(())
    }
}

#[async_trait]
impl MessageStore for MemoryStore {
    async fn insert(&self, draft: NewMessage) -> Result<MessageRecord> {
        self.check()?;
        draft.validate()?;

        let mut rows = self.rows.write().await;
        // keep timestamps strictly increasing so insertion order is the total order
        let latest = rows
            .iter()
            .filter_map(|r| r.created_at.as_deref().and_then(crate::messenger_types::parse_timestamp))
            .max();
        let now = Utc::now();
        let created_at = match latest {
            Some(ts) if ts >= now => ts + Duration::milliseconds(1),
            _ => now,
        };
        let msg = draft.into_message(format!("demo-{}", Uuid::new_v4()), created_at);
        let rec = MessageRecord::from(&msg);
        rows.push(rec.clone());
        debug!("Stored message {} ({} rows)", msg.id, rows.len());
        Ok(rec)
    }

    async fn select(&self, filter: &MessageFilter) -> Result<Vec<MessageRecord>> {
        self.check()?;
        let rows = self.rows.read().await;
        let mut out: Vec<MessageRecord> = rows.iter().filter(|r| filter.matches(r)).cloned().collect();
        out.sort_by(record_order);
        Ok(out)
    }

    async fn mark_read(&self, scope: &ReadScope) -> Result<usize> {
        self.check()?;
        let mut rows = self.rows.write().await;
        let mut affected = 0;
        for rec in rows.iter_mut().filter(|r| scope.matches(r)) {
            rec.read = Some(true);
            affected += 1;
        }
        debug!(
            "Marked {} messages from {} to {} as read",
            affected, scope.sender_id, scope.receiver_id
        );
        Ok(affected)
    }
}

fn at(day: u32, hour: u32, minute: u32) -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2024, 1, day, hour, minute, 0)
        .single()
        .unwrap_or_else(Utc::now)
}

/// Example conversations for `demo-user` so the inbox is not empty offline
pub fn demo_messages() -> Vec<Message> {
    use crate::messenger_types::MessageKind;

    let mk = |id: &str, from: &str, to: &str, body: &str, kind: MessageKind, link: Option<&str>, read: bool, ts| Message {
        id: id.to_string(),
        sender_id: from.to_string(),
        receiver_id: to.to_string(),
        body: body.to_string(),
        kind,
        linked_entity_id: link.map(str::to_string),
        read,
        created_at: ts,
    };

    vec![
        mk(
            "demo-msg-1",
            "demo-user",
            "demo-user-1",
            "Hi Arjun, I saw your React dashboard assignment. I can help with the charts.",
            MessageKind::LinkedAssignment,
            Some("demo-1"),
            true,
            at(8, 11, 0),
        ),
        mk(
            "demo-msg-2",
            "demo-user-1",
            "demo-user",
            "Great! Can you share some previous work?",
            MessageKind::Text,
            None,
            true,
            at(8, 11, 20),
        ),
        mk(
            "demo-msg-3",
            "demo-user-1",
            "demo-user",
            "Also, the deadline is Feb 15th. Does that work?",
            MessageKind::Text,
            None,
            false,
            at(8, 11, 25),
        ),
        mk(
            "demo-msg-4",
            "demo-user-2",
            "demo-user",
            "Hey! Are you still looking for help with data structures?",
            MessageKind::LinkedAssignment,
            Some("demo-2"),
            false,
            at(8, 9, 5),
        ),
        mk(
            "demo-msg-5",
            "demo-user",
            "demo-user-3",
            "Is the bike repair service available this weekend?",
            MessageKind::LinkedService,
            Some("demo-service-1"),
            true,
            at(7, 16, 40),
        ),
        mk(
            "demo-msg-6",
            "demo-user-3",
            "demo-user",
            "Yes, Saturday morning works.",
            MessageKind::Text,
            None,
            true,
            at(7, 17, 2),
        ),
    ]
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_seeded_store_select_is_ordered() {
        let store = MemoryStore::seeded();
        let rows = store
            .select(&MessageFilter::Involving("demo-user".into()))
            .await
            .unwrap();
        assert_eq!(rows.len(), 6);
        let ids: Vec<_> = rows.iter().map(|r| r.id.clone().unwrap()).collect();
        assert_eq!(ids.first().map(String::as_str), Some("demo-msg-5"));
        assert_eq!(ids.last().map(String::as_str), Some("demo-msg-3"));
    }

    #[tokio::test]
    async fn test_between_and_unread_filters() {
        let store = MemoryStore::seeded();
        let between = store
            .select(&MessageFilter::Between("demo-user-1".into(), "demo-user".into()))
            .await
            .unwrap();
        assert_eq!(between.len(), 3);

        let unread = store
            .select(&MessageFilter::UnreadFor("demo-user".into()))
            .await
            .unwrap()
            .len();
        assert_eq!(unread, 2);
    }

    #[tokio::test]
    async fn test_insert_assigns_id_and_increasing_time() {
        let store = MemoryStore::new();
        let a = store.insert(NewMessage::text("u1", "u2", "first")).await.unwrap();
        let b = store.insert(NewMessage::text("u1", "u2", "second")).await.unwrap();
        assert_ne!(a.id, b.id);
        let rows = store
            .select(&MessageFilter::Between("u1".into(), "u2".into()))
            .await
            .unwrap();
        assert_eq!(rows[0].message.as_deref(), Some("first"));
        assert_eq!(rows[1].message.as_deref(), Some("second"));
    }

    #[tokio::test]
    async fn test_insert_rejects_invalid_draft() {
        let store = MemoryStore::new();
        let err = store.insert(NewMessage::text("u1", "u1", "me")).await.unwrap_err();
        assert!(matches!(err, StudyHubError::Validation(_)));
        assert!(store.is_empty().await);
    }

    #[tokio::test]
    async fn test_mark_read_scoped_and_idempotent() {
        let store = MemoryStore::seeded();
        let scope = ReadScope::new("demo-user", "demo-user-1");
        assert_eq!(store.mark_read(&scope).await.unwrap(), 1);
        assert_eq!(store.mark_read(&scope).await.unwrap(), 0);
        // other conversation untouched
        let unread = store
            .select(&MessageFilter::UnreadFor("demo-user".into()))
            .await
            .unwrap()
            .len();
        assert_eq!(unread, 1);
    }

    #[tokio::test]
    async fn test_unreachable_store_fails_without_mutation() {
        let store = MemoryStore::seeded();
        store.set_reachable(false);
        let err = store
            .mark_read(&ReadScope::new("demo-user", "demo-user-1"))
            .await
            .unwrap_err();
        assert!(err.is_store_unavailable());

        store.set_reachable(true);
        let unread = store
            .select(&MessageFilter::UnreadFor("demo-user".into()))
            .await
            .unwrap()
            .len();
        assert_eq!(unread, 2);
    }
}
