/// Per-viewer inbox: fetches the viewer's messages, derives conversations and
/// unread counts, and keeps the result in step with writes and pushes.
use crate::aggregator::{self, Anomaly};
use crate::error::{Result, StudyHubError};
use crate::message_store::{MessageFilter, MessageStore, ReadScope};
use crate::messenger_types::{ConversationEntry, InboxEvent, InboxView, Message, MessageRecord, NewMessage};
use crate::profile_store::{resolve_display_names, ProfileLookup};
use crate::realtime::{FeedStatus, Notifier, Subscription};
use std::sync::Arc;
use tokio::sync::{broadcast, Mutex, RwLock};
use tracing::{debug, info, warn};

/// Outcome of a refresh.
///
/// When the store could not be read, `view` is the last successfully
/// derived view (empty before the first success) and `stale` holds the error.
#[derive(Debug)]
pub struct Refreshed {
    pub view: InboxView,
    pub stale: Option<StudyHubError>,
}

#[derive(Default)]
struct Snapshot {
    /// Messages behind `view`; only consulted when the store is unreachable
    messages: Vec<Message>,
    view: InboxView,
}

struct InboxInner {
    viewer_id: String,
    store: Arc<dyn MessageStore>,
    profiles: Arc<dyn ProfileLookup>,
    snapshot: RwLock<Snapshot>,
    /// Serializes fetch-and-publish so an older fetch never overwrites a newer one
    refresh_lock: Mutex<()>,
    events: broadcast::Sender<InboxEvent>,
}

/// Conversation list for one viewer
#[derive(Clone)]
pub struct Inbox {
    inner: Arc<InboxInner>,
}

impl Inbox {
    pub fn new(viewer_id: &str, store: Arc<dyn MessageStore>, profiles: Arc<dyn ProfileLookup>) -> Self {
        let (events, _) = broadcast::channel(64);
        Self {
            inner: Arc::new(InboxInner {
                viewer_id: viewer_id.to_string(),
                store,
                profiles,
                snapshot: RwLock::new(Snapshot::default()),
                refresh_lock: Mutex::new(()),
                events,
            }),
        }
    }

    pub fn viewer_id(&self) -> &str {
        &self.inner.viewer_id
    }

    /// Inbox events (refreshes, pushes, anomalies, realtime health)
    pub fn events(&self) -> broadcast::Receiver<InboxEvent> {
        self.inner.events.subscribe()
    }

    /// Last derived view
    pub async fn view(&self) -> InboxView {
        self.inner.snapshot.read().await.view.clone()
    }

    /// Re-derive conversations from the store's current contents
    pub async fn refresh(&self) -> Refreshed {
        let _guard = self.inner.refresh_lock.lock().await;
        match self.fetch(MessageFilter::Involving(self.inner.viewer_id.clone())).await {
            Ok(messages) => {
                let view = self.publish(messages).await;
                Refreshed { view, stale: None }
            }
            Err(e) => {
                warn!("Inbox refresh for {} failed: {}", self.inner.viewer_id, e);
                Refreshed {
                    view: self.inner.snapshot.read().await.view.clone(),
                    stale: Some(e),
                }
            }
        }
    }

    /// Mark everything received from `counterparty_id` as read.
    ///
    /// The local view changes only after the store acknowledged the write.
    pub async fn mark_conversation_read(&self, counterparty_id: &str) -> Result<usize> {
        let scope = ReadScope::new(&self.inner.viewer_id, counterparty_id);
        let affected = self.inner.store.mark_read(&scope).await?;
        info!(
            "Marked {} messages from {} as read for {}",
            affected, counterparty_id, self.inner.viewer_id
        );

        if self.refresh().await.stale.is_some() {
            // write is durable; reflect it on the snapshot we have
            self.reflect_locally(|messages| {
                for m in messages.iter_mut().filter(|m| {
                    m.receiver_id == scope.receiver_id && m.sender_id == scope.sender_id
                }) {
                    m.read = true;
                }
            })
            .await;
        }
        Ok(affected)
    }

    /// Send a message from the viewer
    pub async fn send(&self, draft: NewMessage) -> Result<Message> {
        if draft.sender_id != self.inner.viewer_id {
            return Err(StudyHubError::Validation(format!(
                "cannot send as {} from {}'s inbox",
                draft.sender_id, self.inner.viewer_id
            )));
        }
        draft.validate()?;
        let stored = self.inner.store.insert(draft).await?;
        let message = Message::try_from(stored)?;
        debug!("Sent message {} to {}", message.id, message.receiver_id);

        if self.refresh().await.stale.is_some() {
            let sent = message.clone();
            self.reflect_locally(move |messages| aggregator::upsert(messages, sent)).await;
        }
        Ok(message)
    }

    pub async fn send_text(&self, receiver_id: &str, body: &str) -> Result<Message> {
        self.send(NewMessage::text(&self.inner.viewer_id, receiver_id, body)).await
    }

    /// Open a conversation about an assignment
    pub async fn start_assignment_conversation(
        &self,
        receiver_id: &str,
        assignment_id: &str,
        body: &str,
    ) -> Result<Message> {
        self.send(NewMessage::about_assignment(&self.inner.viewer_id, receiver_id, assignment_id, body))
            .await
    }

    /// Open a conversation about a local service
    pub async fn start_service_conversation(
        &self,
        receiver_id: &str,
        service_id: &str,
        body: &str,
    ) -> Result<Message> {
        self.send(NewMessage::about_service(&self.inner.viewer_id, receiver_id, service_id, body))
            .await
    }

    /// Every message with `counterparty_id`, oldest first
    pub async fn thread(&self, counterparty_id: &str) -> Result<Vec<Message>> {
        let messages = self
            .fetch(MessageFilter::Between(
                self.inner.viewer_id.clone(),
                counterparty_id.to_string(),
            ))
            .await?;
        Ok(aggregator::thread_between(&self.inner.viewer_id, counterparty_id, &messages))
    }

    /// Unread total over the store's current unread rows.
    ///
    /// Rows are validated the same way `refresh` validates them, so the
    /// result always matches the derived `unread_total`.
    pub async fn unread_count(&self) -> Result<usize> {
        let messages = self
            .fetch(MessageFilter::UnreadFor(self.inner.viewer_id.clone()))
            .await?;
        Ok(aggregator::count_unread(&self.inner.viewer_id, &messages))
    }

    /// Realtime hook: a new message for the viewer arrived.
    ///
    /// Re-derives from the store; if the store is unreachable the pushed
    /// message is folded into the last snapshot instead.
    pub async fn apply_incoming(&self, message: Message) {
        if message.receiver_id != self.inner.viewer_id {
            debug!("Ignoring message {} for another viewer", message.id);
            return;
        }
        let _ = self.inner.events.send(InboxEvent::NewMessage {
            message: message.clone(),
        });
        if self.refresh().await.stale.is_some() {
            self.reflect_locally(move |messages| aggregator::upsert(messages, message))
                .await;
        }
    }

    /// Subscribe this inbox to realtime delivery.
    ///
    /// Channel health is forwarded as `Degraded` / `Recovered` events.
    pub async fn watch(&self, notifier: &Notifier) -> Result<Subscription> {
        let inbox = self.clone();
        let subscription = notifier
            .subscribe(&self.inner.viewer_id, move |message| {
                let inbox = inbox.clone();
                async move { inbox.apply_incoming(message).await }
            })
            .await?;

        let mut status = subscription.status();
        let events = self.inner.events.clone();
        tokio::spawn(async move {
            let mut interrupted = false;
            while status.changed().await.is_ok() {
                let current = status.borrow_and_update().clone();
                match current {
                    FeedStatus::Connecting => interrupted = true,
                    FeedStatus::Live if interrupted => {
                        interrupted = false;
                        let _ = events.send(InboxEvent::Recovered);
                    }
                    FeedStatus::Degraded(reason) => {
                        let _ = events.send(InboxEvent::Degraded { reason });
                    }
                    FeedStatus::Closed => break,
                    _ => {}
                }
            }
        });
        Ok(subscription)
    }

    async fn fetch(&self, filter: MessageFilter) -> Result<Vec<Message>> {
        let records: Vec<MessageRecord> = self.inner.store.select(&filter).await?;
        let parsed = aggregator::parse_records(records);
        for Anomaly { id, reason } in parsed.anomalies {
            warn!("Skipping malformed message {}: {}", id, reason);
            let _ = self.inner.events.send(InboxEvent::Anomaly { id, reason });
        }
        Ok(aggregator::dedupe_by_id(parsed.messages))
    }

    async fn project(&self, messages: &[Message]) -> InboxView {
        let viewer = &self.inner.viewer_id;
        let conversations = aggregator::derive_conversations(viewer, messages);
        let ids: Vec<String> = conversations.iter().map(|c| c.counterparty_id.clone()).collect();
        let mut names = resolve_display_names(self.inner.profiles.as_ref(), &ids).await;
        InboxView {
            unread_total: aggregator::count_unread(viewer, messages),
            conversations: conversations
                .into_iter()
                .map(|conversation| ConversationEntry {
                    display_name: names
                        .remove(&conversation.counterparty_id)
                        .unwrap_or_else(|| crate::profile_store::UNKNOWN_USER.to_string()),
                    conversation,
                })
                .collect(),
        }
    }

    async fn publish(&self, messages: Vec<Message>) -> InboxView {
        let view = self.project(&messages).await;
        {
            let mut snap = self.inner.snapshot.write().await;
            snap.messages = messages;
            snap.view = view.clone();
        }
        let _ = self.inner.events.send(InboxEvent::Refreshed {
            unread_total: view.unread_total,
        });
        view
    }

    async fn reflect_locally<F>(&self, apply: F)
    where
        F: FnOnce(&mut Vec<Message>),
    {
        let _guard = self.inner.refresh_lock.lock().await;
        let mut messages = self.inner.snapshot.read().await.messages.clone();
        apply(&mut messages);
        self.publish(messages).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message_store::MemoryStore;
    use crate::messenger_types::MessageKind;
    use crate::profile_store::MemoryProfiles;
    use async_trait::async_trait;
    use chrono::{TimeZone, Utc};
    use std::sync::atomic::{AtomicBool, Ordering};

    /// Store whose reads start failing once a read-flag update went through
    struct ReadsFailAfterWrite {
        inner: MemoryStore,
        broken: AtomicBool,
    }

    #[async_trait]
    impl MessageStore for ReadsFailAfterWrite {
        async fn insert(&self, draft: NewMessage) -> Result<MessageRecord> {
            self.inner.insert(draft).await
        }

        async fn select(&self, filter: &MessageFilter) -> Result<Vec<MessageRecord>> {
            if self.broken.load(Ordering::SeqCst) {
                return Err(StudyHubError::StoreUnavailable("read replica down".to_string()));
            }
            self.inner.select(filter).await
        }

        async fn mark_read(&self, scope: &ReadScope) -> Result<usize> {
            let affected = self.inner.mark_read(scope).await?;
            self.broken.store(true, Ordering::SeqCst);
            Ok(affected)
        }
    }

    fn pushed(id: &str, from: &str) -> Message {
        Message {
            id: id.to_string(),
            sender_id: from.to_string(),
            receiver_id: "demo-user".to_string(),
            body: "are you around?".to_string(),
            kind: MessageKind::Text,
            linked_entity_id: None,
            read: false,
            created_at: Utc
                .with_ymd_and_hms(2024, 1, 9, 8, 0, 0)
                .single()
                .unwrap(),
        }
    }

    fn demo_inbox() -> (Inbox, MemoryStore) {
        let store = MemoryStore::seeded();
        let inbox = Inbox::new("demo-user", Arc::new(store.clone()), Arc::new(MemoryProfiles::seeded()));
        (inbox, store)
    }

    #[tokio::test]
    async fn test_refresh_derives_demo_inbox() {
        let (inbox, _) = demo_inbox();
        let refreshed = inbox.refresh().await;
        assert!(refreshed.stale.is_none());
        let view = refreshed.view;
        assert_eq!(view.conversations.len(), 3);
        assert_eq!(view.conversations[0].conversation.counterparty_id, "demo-user-1");
        assert_eq!(view.conversations[0].display_name, "Arjun Patel");
        assert_eq!(view.unread_total, 2);
        assert_eq!(inbox.view().await, view);
    }

    #[tokio::test]
    async fn test_unreachable_store_returns_last_view() {
        let (inbox, store) = demo_inbox();
        let first = inbox.refresh().await.view;

        store.set_reachable(false);
        let refreshed = inbox.refresh().await;
        assert!(matches!(refreshed.stale, Some(StudyHubError::StoreUnavailable(_))));
        assert_eq!(refreshed.view, first);
    }

    #[tokio::test]
    async fn test_unreachable_before_first_refresh_is_empty() {
        let (inbox, store) = demo_inbox();
        store.set_reachable(false);
        let refreshed = inbox.refresh().await;
        assert!(refreshed.stale.is_some());
        assert!(refreshed.view.conversations.is_empty());
    }

    #[tokio::test]
    async fn test_failed_mark_read_does_not_touch_view() {
        let (inbox, store) = demo_inbox();
        inbox.refresh().await;

        store.set_reachable(false);
        let err = inbox.mark_conversation_read("demo-user-1").await.unwrap_err();
        assert!(err.is_store_unavailable());
        assert_eq!(inbox.view().await.unread_total, 2);
    }

    #[tokio::test]
    async fn test_send_rejects_foreign_sender() {
        let (inbox, _) = demo_inbox();
        let err = inbox
            .send(NewMessage::text("demo-user-2", "demo-user-1", "spoof"))
            .await
            .unwrap_err();
        assert!(matches!(err, StudyHubError::Validation(_)));
    }

    #[tokio::test]
    async fn test_malformed_rows_reported_not_fatal() {
        let (inbox, store) = demo_inbox();
        store
            .push_record(MessageRecord {
                id: Some("broken".into()),
                receiver_id: Some("demo-user".into()),
                message: Some("no sender".into()),
                created_at: Some("2024-01-09T00:00:00Z".into()),
                ..Default::default()
            })
            .await;
        let mut events = inbox.events();

        let refreshed = inbox.refresh().await;
        assert!(refreshed.stale.is_none());
        assert_eq!(refreshed.view.conversations.len(), 3);

        let mut saw_anomaly = false;
        while let Ok(event) = events.try_recv() {
            if let InboxEvent::Anomaly { id, .. } = event {
                assert_eq!(id, "broken");
                saw_anomaly = true;
            }
        }
        assert!(saw_anomaly);
    }

    #[tokio::test]
    async fn test_push_folded_in_when_store_unreachable() {
        let (inbox, store) = demo_inbox();
        inbox.refresh().await;

        store.set_reachable(false);
        inbox.apply_incoming(pushed("push-1", "demo-user-4")).await;
        inbox.apply_incoming(pushed("push-1", "demo-user-4")).await;

        let view = inbox.view().await;
        assert_eq!(view.conversations.len(), 4);
        let first = &view.conversations[0].conversation;
        assert_eq!(first.counterparty_id, "demo-user-4");
        assert_eq!(first.last_message.id, "push-1");
        assert_eq!(first.unread_count, 1);
        assert_eq!(view.unread_total, 3);
    }

    #[tokio::test]
    async fn test_acknowledged_read_reflected_when_refresh_fails() {
        let store = ReadsFailAfterWrite {
            inner: MemoryStore::seeded(),
            broken: AtomicBool::new(false),
        };
        let inbox = Inbox::new("demo-user", Arc::new(store), Arc::new(MemoryProfiles::seeded()));
        assert_eq!(inbox.refresh().await.view.unread_total, 2);

        assert_eq!(inbox.mark_conversation_read("demo-user-1").await.unwrap(), 1);

        let view = inbox.view().await;
        let conv = view
            .conversations
            .iter()
            .find(|e| e.conversation.counterparty_id == "demo-user-1")
            .unwrap();
        assert_eq!(conv.conversation.unread_count, 0);
        assert!(conv.conversation.last_message.read);
        assert_eq!(view.unread_total, 1);
        // the refresh really did fail
        assert!(inbox.refresh().await.stale.is_some());
    }

    #[tokio::test]
    async fn test_unread_count_ignores_malformed_rows() {
        let (inbox, store) = demo_inbox();
        store
            .push_record(MessageRecord {
                id: Some("orphan".into()),
                receiver_id: Some("demo-user".into()),
                message: Some("sender lost".into()),
                message_type: Some("text".into()),
                read: Some(false),
                created_at: Some("2024-01-09T00:00:00Z".into()),
                ..Default::default()
            })
            .await;

        let view = inbox.refresh().await.view;
        let summed: usize = view.conversations.iter().map(|e| e.conversation.unread_count).sum();
        assert_eq!(view.unread_total, 2);
        assert_eq!(summed, 2);
        assert_eq!(inbox.unread_count().await.unwrap(), 2);
    }
}
