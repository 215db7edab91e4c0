/// Realtime delivery: bridges a push channel of inserted message rows into
/// a per-viewer callback, with resubscription when the channel drops.
use crate::config::Config;
use crate::error::{Result, StudyHubError};
use crate::messenger_types::{Message, MessageRecord};
use async_trait::async_trait;
use std::future::Future;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Buffered events per subscription before the producer waits
pub const FEED_CAPACITY: usize = 256;

/// What a push channel delivers
#[derive(Debug, Clone, PartialEq)]
pub enum ChannelEvent {
    /// A row was inserted into the message table for this receiver
    Inserted(MessageRecord),
    /// The channel lost its connection; no more events will follow
    Dropped(String),
}

/// Result of registering interest with a push channel
#[derive(Debug)]
pub enum Feed {
    /// Events arrive on the receiver; dropping it releases the registration
    Live(mpsc::Receiver<ChannelEvent>),
    /// The channel has no push capability (demo mode)
    Inert,
}

/// Push channel filtered by receiver id
#[async_trait]
pub trait RealtimeChannel: Send + Sync {
    async fn subscribe(&self, receiver_id: &str) -> Result<Feed>;
}

/// Channel that never delivers anything
#[derive(Debug, Clone, Copy, Default)]
pub struct InertChannel;

#[async_trait]
impl RealtimeChannel for InertChannel {
    async fn subscribe(&self, receiver_id: &str) -> Result<Feed> {
        debug!("Realtime disabled; inert subscription for {}", receiver_id);
        Ok(Feed::Inert)
    }
}

/// In-process channel: rows handed to `publish` go straight to matching
/// subscribers. Used for local simulation and tests.
#[derive(Clone, Default)]
pub struct LoopbackChannel {
    subscribers: Arc<Mutex<Vec<(String, mpsc::Sender<ChannelEvent>)>>>,
    failures: Arc<AtomicU32>,
}

impl LoopbackChannel {
    pub fn new() -> Self {
        Self::default()
    }

    /// Deliver an inserted row to subscribers of its receiver; returns deliveries
    pub fn publish(&self, rec: MessageRecord) -> usize {
        let mut subs = self.lock();
        subs.retain(|(_, tx)| !tx.is_closed());
        let receiver = rec.receiver_id.clone().unwrap_or_default();
        let mut delivered = 0;
        for (_, tx) in subs.iter().filter(|(id, _)| *id == receiver) {
            match tx.try_send(ChannelEvent::Inserted(rec.clone())) {
                Ok(()) => delivered += 1,
                Err(e) => warn!("Loopback subscriber for {} lagging: {}", receiver, e),
            }
        }
        delivered
    }

    /// Simulate a connection loss for every subscriber
    pub fn disconnect_all(&self) {
        let subs = std::mem::take(&mut *self.lock());
        for (_, tx) in subs {
            let _ = tx.try_send(ChannelEvent::Dropped("loopback disconnected".to_string()));
        }
    }

    /// Make the next `n` subscribe calls fail
    pub fn fail_next(&self, n: u32) {
        self.failures.store(n, Ordering::SeqCst);
    }

    /// Registrations whose receiver is still alive
    pub fn subscriber_count(&self) -> usize {
        let mut subs = self.lock();
        subs.retain(|(_, tx)| !tx.is_closed());
        subs.len()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Vec<(String, mpsc::Sender<ChannelEvent>)>> {
        // a panic while holding the lock cannot leave the list inconsistent
        self.subscribers.lock().unwrap_or_else(|e| e.into_inner())
    }
}

#[async_trait]
impl RealtimeChannel for LoopbackChannel {
    async fn subscribe(&self, receiver_id: &str) -> Result<Feed> {
        let pending = self.failures.load(Ordering::SeqCst);
        if pending > 0 {
            self.failures.store(pending - 1, Ordering::SeqCst);
            return Err(StudyHubError::SubscriptionDropped(
                "loopback refused subscription".to_string(),
            ));
        }
        let (tx, rx) = mpsc::channel(FEED_CAPACITY);
        self.lock().push((receiver_id.to_string(), tx));
        Ok(Feed::Live(rx))
    }
}

/// Lifecycle of one subscription as seen by the UI
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FeedStatus {
    Connecting,
    Live,
    /// No push capability; manual refresh only
    Inert,
    /// Resubscription gave up; manual refresh only
    Degraded(String),
    Closed,
}

/// Handle returned by [`Notifier::subscribe`].
///
/// `close` may be called any number of times, including after the channel
/// already dropped. Dropping the handle closes it.
pub struct Subscription {
    shutdown: watch::Sender<bool>,
    status: Arc<watch::Sender<FeedStatus>>,
    task: Option<JoinHandle<()>>,
}

impl Subscription {
    fn inert() -> Self {
        let (shutdown, _) = watch::channel(false);
        let (status, _) = watch::channel(FeedStatus::Inert);
        Self {
            shutdown,
            status: Arc::new(status),
            task: None,
        }
    }

    /// Stop delivery
    pub fn close(&self) {
        if self.shutdown.send_replace(true) {
            return;
        }
        self.status.send_replace(FeedStatus::Closed);
        debug!("Subscription closed");
    }

    pub fn is_closed(&self) -> bool {
        *self.shutdown.borrow()
    }

    /// Current status and future changes
    pub fn status(&self) -> watch::Receiver<FeedStatus> {
        self.status.subscribe()
    }

    /// Whether the delivery task has ended (closed, degraded, or never started)
    pub fn is_finished(&self) -> bool {
        self.task.as_ref().map_or(true, |t| t.is_finished())
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.close();
    }
}

/// Subscribes viewers to a [`RealtimeChannel`] and keeps them subscribed
#[derive(Clone)]
pub struct Notifier {
    channel: Arc<dyn RealtimeChannel>,
    resubscribe_attempts: u32,
    resubscribe_interval: Duration,
}

impl Notifier {
    pub fn new(
        channel: Arc<dyn RealtimeChannel>,
        resubscribe_attempts: u32,
        resubscribe_interval: Duration,
    ) -> Self {
        Self {
            channel,
            resubscribe_attempts,
            resubscribe_interval,
        }
    }

    pub fn from_config(channel: Arc<dyn RealtimeChannel>, config: &Config) -> Self {
        Self::new(channel, config.resubscribe_attempts, config.resubscribe_interval)
    }

    /// Deliver every new message addressed to `viewer_id` to `on_message`.
    ///
    /// Callbacks run one at a time in arrival order. Rows that fail
    /// validation or are addressed to someone else are skipped.
    pub async fn subscribe<F, Fut>(&self, viewer_id: &str, on_message: F) -> Result<Subscription>
    where
        F: Fn(Message) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let rx = match self.channel.subscribe(viewer_id).await? {
            Feed::Live(rx) => rx,
            Feed::Inert => return Ok(Subscription::inert()),
        };
        info!("Realtime subscription started for {}", viewer_id);

        let (shutdown, shutdown_rx) = watch::channel(false);
        let status = Arc::new(watch::channel(FeedStatus::Live).0);
        let worker = FeedWorker {
            channel: self.channel.clone(),
            viewer_id: viewer_id.to_string(),
            attempts: self.resubscribe_attempts,
            interval: self.resubscribe_interval,
            status: status.clone(),
            shutdown: shutdown_rx,
        };
        let task = tokio::spawn(worker.run(rx, on_message));

        Ok(Subscription {
            shutdown,
            status,
            task: Some(task),
        })
    }
}

struct FeedWorker {
    channel: Arc<dyn RealtimeChannel>,
    viewer_id: String,
    attempts: u32,
    interval: Duration,
    status: Arc<watch::Sender<FeedStatus>>,
    shutdown: watch::Receiver<bool>,
}

impl FeedWorker {
    async fn run<F, Fut>(mut self, mut rx: mpsc::Receiver<ChannelEvent>, on_message: F)
    where
        F: Fn(Message) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        loop {
            let event = tokio::select! {
                _ = self.shutdown.changed() => break,
                event = rx.recv() => event,
            };

            match event {
                Some(ChannelEvent::Inserted(rec)) => match Message::try_from(rec) {
                    Ok(msg) if msg.receiver_id == self.viewer_id => on_message(msg).await,
                    Ok(msg) => debug!("Ignoring pushed message {} not addressed to {}", msg.id, self.viewer_id),
                    Err(e) => warn!("Skipping pushed record: {}", e),
                },
                Some(ChannelEvent::Dropped(reason)) => {
                    warn!("Realtime channel dropped for {}: {}", self.viewer_id, reason);
                    match self.resubscribe(&reason).await {
                        Some(next) => rx = next,
                        None => break,
                    }
                }
                None => {
                    warn!("Realtime feed for {} closed by channel", self.viewer_id);
                    match self.resubscribe("feed closed").await {
                        Some(next) => rx = next,
                        None => break,
                    }
                }
            }
        }
        debug!("Realtime worker for {} stopped", self.viewer_id);
    }

    /// Retry the subscription; `None` means closed or gave up (status already set)
    async fn resubscribe(&mut self, cause: &str) -> Option<mpsc::Receiver<ChannelEvent>> {
        if *self.shutdown.borrow() {
            return None;
        }
        self.status.send_replace(FeedStatus::Connecting);
        let mut last_error = cause.to_string();

        for attempt in 1..=self.attempts {
            tokio::select! {
                _ = self.shutdown.changed() => return None,
                _ = tokio::time::sleep(self.interval) => {}
            }
            match self.channel.subscribe(&self.viewer_id).await {
                Ok(Feed::Live(rx)) => {
                    info!("Realtime resubscribed for {} (attempt {})", self.viewer_id, attempt);
                    self.status.send_replace(FeedStatus::Live);
                    return Some(rx);
                }
                Ok(Feed::Inert) => {
                    last_error = "channel no longer offers push delivery".to_string();
                    break;
                }
                Err(e) => {
                    warn!("Resubscribe attempt {}/{} failed: {}", attempt, self.attempts, e);
                    last_error = e.to_string();
                }
            }
        }

        if !*self.shutdown.borrow() {
            warn!("Realtime degraded for {}: {}", self.viewer_id, last_error);
            self.status.send_replace(FeedStatus::Degraded(last_error));
        }
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::messenger_types::MessageKind;
    use chrono::Utc;
    use tokio::time::timeout;

    fn row(id: &str, from: &str, to: &str) -> MessageRecord {
        MessageRecord::from(&Message {
            id: id.to_string(),
            sender_id: from.to_string(),
            receiver_id: to.to_string(),
            body: "hi".to_string(),
            kind: MessageKind::Text,
            linked_entity_id: None,
            read: false,
            created_at: Utc::now(),
        })
    }

    fn notifier(channel: &LoopbackChannel, attempts: u32) -> Notifier {
        Notifier::new(Arc::new(channel.clone()), attempts, Duration::from_millis(10))
    }

    async fn wait_for(status: &mut watch::Receiver<FeedStatus>, want: FeedStatus) {
        timeout(Duration::from_secs(2), status.wait_for(|s| *s == want))
            .await
            .expect("status timeout")
            .expect("status sender gone");
    }

    #[tokio::test]
    async fn test_delivers_only_viewer_messages() {
        let channel = LoopbackChannel::new();
        let (tx, mut rx) = mpsc::unbounded_channel();
        let sub = notifier(&channel, 1)
            .subscribe("u1", move |m| {
                let tx = tx.clone();
                async move {
                    let _ = tx.send(m.id);
                }
            })
            .await
            .unwrap();

        assert_eq!(channel.publish(row("other", "u1", "u2")), 0);
        assert_eq!(channel.publish(row("m1", "u2", "u1")), 1);
        let got = timeout(Duration::from_secs(1), rx.recv()).await.unwrap();
        assert_eq!(got.as_deref(), Some("m1"));
        sub.close();
    }

    #[tokio::test]
    async fn test_malformed_push_is_skipped() {
        let channel = LoopbackChannel::new();
        let (tx, mut rx) = mpsc::unbounded_channel();
        let _sub = notifier(&channel, 1)
            .subscribe("u1", move |m| {
                let tx = tx.clone();
                async move {
                    let _ = tx.send(m.id);
                }
            })
            .await
            .unwrap();

        let mut bad = row("bad", "u2", "u1");
        bad.message = None;
        channel.publish(bad);
        channel.publish(row("good", "u2", "u1"));
        let got = timeout(Duration::from_secs(1), rx.recv()).await.unwrap();
        assert_eq!(got.as_deref(), Some("good"));
    }

    #[tokio::test]
    async fn test_close_is_idempotent_and_releases_channel() {
        let channel = LoopbackChannel::new();
        let sub = notifier(&channel, 1).subscribe("u1", |_| async {}).await.unwrap();
        assert_eq!(channel.subscriber_count(), 1);

        sub.close();
        sub.close();
        assert!(sub.is_closed());
        assert_eq!(*sub.status().borrow(), FeedStatus::Closed);

        timeout(Duration::from_secs(1), async {
            while !sub.is_finished() {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .unwrap();
        assert_eq!(channel.subscriber_count(), 0);
    }

    #[tokio::test]
    async fn test_close_after_channel_drop() {
        let channel = LoopbackChannel::new();
        let sub = notifier(&channel, 0).subscribe("u1", |_| async {}).await.unwrap();
        let mut status = sub.status();
        channel.disconnect_all();
        wait_for(&mut status, FeedStatus::Degraded("loopback disconnected".into())).await;
        sub.close();
        sub.close();
        assert_eq!(*sub.status().borrow(), FeedStatus::Closed);
    }

    #[tokio::test]
    async fn test_resubscribes_after_drop() {
        let channel = LoopbackChannel::new();
        let (tx, mut rx) = mpsc::unbounded_channel();
        let sub = notifier(&channel, 5)
            .subscribe("u1", move |m| {
                let tx = tx.clone();
                async move {
                    let _ = tx.send(m.id);
                }
            })
            .await
            .unwrap();
        let mut status = sub.status();

        channel.fail_next(2);
        channel.disconnect_all();
        wait_for(&mut status, FeedStatus::Connecting).await;
        wait_for(&mut status, FeedStatus::Live).await;

        channel.publish(row("after", "u2", "u1"));
        let got = timeout(Duration::from_secs(1), rx.recv()).await.unwrap();
        assert_eq!(got.as_deref(), Some("after"));
    }

    #[tokio::test]
    async fn test_degrades_when_resubscribe_keeps_failing() {
        let channel = LoopbackChannel::new();
        let sub = notifier(&channel, 3).subscribe("u1", |_| async {}).await.unwrap();
        let mut status = sub.status();

        channel.fail_next(10);
        channel.disconnect_all();
        timeout(
            Duration::from_secs(2),
            status.wait_for(|s| matches!(s, FeedStatus::Degraded(_))),
        )
        .await
        .unwrap()
        .unwrap();
        timeout(Duration::from_secs(1), async {
            while !sub.is_finished() {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_retries_wait_between_attempts() {
        let channel = LoopbackChannel::new();
        let notifier = Notifier::new(Arc::new(channel.clone()), 3, Duration::from_secs(30));
        let sub = notifier.subscribe("u1", |_| async {}).await.unwrap();
        let mut status = sub.status();

        let started = tokio::time::Instant::now();
        channel.fail_next(10);
        channel.disconnect_all();
        timeout(
            Duration::from_secs(600),
            status.wait_for(|s| matches!(s, FeedStatus::Degraded(_))),
        )
        .await
        .unwrap()
        .unwrap();

        let waited = started.elapsed();
        assert!(waited >= Duration::from_secs(90), "gave up after {:?}", waited);
        assert!(waited < Duration::from_secs(120));
    }

    #[tokio::test]
    async fn test_initial_failure_is_reported() {
        let channel = LoopbackChannel::new();
        channel.fail_next(1);
        let err = notifier(&channel, 3).subscribe("u1", |_| async {}).await.err();
        assert!(matches!(err, Some(StudyHubError::SubscriptionDropped(_))));
    }

    #[tokio::test]
    async fn test_inert_channel_handle() {
        let notifier = Notifier::new(Arc::new(InertChannel), 3, Duration::from_millis(10));
        let sub = notifier.subscribe("u1", |_| async {}).await.unwrap();
        assert_eq!(*sub.status().borrow(), FeedStatus::Inert);
        assert!(sub.is_finished());
        sub.close();
        sub.close();
        assert!(sub.is_closed());
    }
}
