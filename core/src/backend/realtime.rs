/// Realtime push over the backend's websocket (Phoenix channel framing).
///
/// One socket per subscription: join a `postgres_changes` channel filtered
/// on `receiver_id`, keep it alive with heartbeats, forward inserted rows.
use super::BackendClient;
use crate::error::{Result, StudyHubError};
use crate::messenger_types::MessageRecord;
use crate::realtime::{ChannelEvent, Feed, RealtimeChannel, FEED_CAPACITY};
use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use serde_json::{json, Value};
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::time::{interval, timeout, MissedTickBehavior};
use tokio_tungstenite::tungstenite::Message as WsMessage;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use tracing::{debug, info, warn};

const TOPIC: &str = "realtime:public:messages";
const JOIN_REF: &str = "1";

type Socket = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// What a text frame means for the subscriber
#[derive(Debug, Clone, PartialEq)]
pub enum FrameAction {
    Insert(MessageRecord),
    Joined,
    JoinRejected(String),
    Closed(String),
}

/// Join message for the inserted-messages channel of `receiver_id`
pub fn join_frame(receiver_id: &str, access_token: Option<&str>) -> Value {
    let mut payload = json!({
        "config": {
            "broadcast": { "self": false },
            "presence": { "key": "" },
            "postgres_changes": [{
                "event": "INSERT",
                "schema": "public",
                "table": "messages",
                "filter": format!("receiver_id=eq.{}", receiver_id),
            }],
        },
    });
    if let Some(token) = access_token {
        payload["access_token"] = Value::String(token.to_string());
    }
    json!({
        "topic": TOPIC,
        "event": "phx_join",
        "payload": payload,
        "ref": JOIN_REF,
        "join_ref": JOIN_REF,
    })
}

fn control_frame(topic: &str, event: &str, reference: u64) -> Value {
    json!({
        "topic": topic,
        "event": event,
        "payload": {},
        "ref": reference.to_string(),
    })
}

/// Interpret one text frame; `None` for frames the subscriber ignores
pub fn parse_frame(text: &str) -> Option<FrameAction> {
    let frame: Value = serde_json::from_str(text).ok()?;
    let event = frame.get("event")?.as_str()?;
    let payload = frame.get("payload").cloned().unwrap_or(Value::Null);

    match event {
        "postgres_changes" => {
            let data = payload.get("data")?;
            if data.get("type").and_then(Value::as_str) != Some("INSERT") {
                return None;
            }
            let record = data.get("record")?.clone();
            serde_json::from_value(record).ok().map(FrameAction::Insert)
        }
        // older servers send the change type as the event name
        "INSERT" => {
            let record = payload.get("record")?.clone();
            serde_json::from_value(record).ok().map(FrameAction::Insert)
        }
        "phx_reply" if frame.get("ref").and_then(Value::as_str) == Some(JOIN_REF) => {
            match payload.get("status").and_then(Value::as_str) {
                Some("ok") => Some(FrameAction::Joined),
                _ => Some(FrameAction::JoinRejected(
                    payload
                        .pointer("/response/reason")
                        .and_then(Value::as_str)
                        .unwrap_or("join refused")
                        .to_string(),
                )),
            }
        }
        "phx_error" => Some(FrameAction::Closed("channel error".to_string())),
        "phx_close" => Some(FrameAction::Closed("channel closed by server".to_string())),
        "system" if payload.get("status").and_then(Value::as_str) == Some("error") => {
            Some(FrameAction::Closed(
                payload
                    .get("message")
                    .and_then(Value::as_str)
                    .unwrap_or("system error")
                    .to_string(),
            ))
        }
        _ => None,
    }
}

fn dropped(reason: impl std::fmt::Display) -> StudyHubError {
    StudyHubError::SubscriptionDropped(reason.to_string())
}

/// [`RealtimeChannel`] backed by the hosted realtime service
#[derive(Clone)]
pub struct BackendRealtime {
    client: BackendClient,
    heartbeat: Duration,
    join_timeout: Duration,
}

impl BackendRealtime {
    pub fn new(client: BackendClient, heartbeat: Duration, join_timeout: Duration) -> Self {
        Self {
            client,
            heartbeat,
            join_timeout,
        }
    }

    async fn join(&self, socket: &mut Socket, receiver_id: &str) -> Result<()> {
        let token = self.client.access_token().await;
        let frame = join_frame(receiver_id, token.as_deref());
        socket
            .send(WsMessage::Text(frame.to_string()))
            .await
            .map_err(dropped)?;

        let wait = async {
            while let Some(msg) = socket.next().await {
                match msg.map_err(dropped)? {
                    WsMessage::Text(text) => match parse_frame(&text) {
                        Some(FrameAction::Joined) => return Ok(()),
                        Some(FrameAction::JoinRejected(reason)) | Some(FrameAction::Closed(reason)) => {
                            return Err(dropped(reason))
                        }
                        _ => {}
                    },
                    WsMessage::Close(_) => return Err(dropped("socket closed during join")),
                    _ => {}
                }
            }
            Err::<(), StudyHubError>(dropped("socket ended during join"))
        };
        timeout(self.join_timeout, wait)
            .await
            .map_err(|_| dropped("join timed out"))?
    }
}

#[async_trait]
impl RealtimeChannel for BackendRealtime {
    async fn subscribe(&self, receiver_id: &str) -> Result<Feed> {
        let url = self.client.realtime_url();
        let (mut socket, _) = timeout(self.join_timeout, connect_async(url.as_str()))
            .await
            .map_err(|_| dropped("connect timed out"))?
            .map_err(dropped)?;
        self.join(&mut socket, receiver_id).await?;
        info!("Joined realtime channel for {}", receiver_id);

        let (tx, rx) = mpsc::channel(FEED_CAPACITY);
        tokio::spawn(pump(socket, tx, self.heartbeat));
        Ok(Feed::Live(rx))
    }
}

/// Forward frames until the socket drops or the subscriber goes away
async fn pump(socket: Socket, tx: mpsc::Sender<ChannelEvent>, heartbeat: Duration) {
    let (mut sink, mut stream) = socket.split();
    let mut ticker = interval(heartbeat);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    ticker.tick().await;
    let mut next_ref: u64 = 2;

    let reason = loop {
        tokio::select! {
            _ = tx.closed() => {
                debug!("Realtime subscriber gone; leaving channel");
                let leave = control_frame(TOPIC, "phx_leave", next_ref);
                let _ = sink.send(WsMessage::Text(leave.to_string())).await;
                let _ = sink.close().await;
                return;
            }
            _ = ticker.tick() => {
                let beat = control_frame("phoenix", "heartbeat", next_ref);
                next_ref += 1;
                if let Err(e) = sink.send(WsMessage::Text(beat.to_string())).await {
                    break format!("heartbeat failed: {}", e);
                }
            }
            frame = stream.next() => match frame {
                Some(Ok(WsMessage::Text(text))) => match parse_frame(&text) {
                    Some(FrameAction::Insert(rec)) => {
                        if tx.send(ChannelEvent::Inserted(rec)).await.is_err() {
                            let _ = sink.close().await;
                            return;
                        }
                    }
                    Some(FrameAction::Closed(reason)) => break reason,
                    _ => {}
                },
                Some(Ok(WsMessage::Close(_))) | None => break "socket closed".to_string(),
                Some(Ok(_)) => {}
                Some(Err(e)) => break e.to_string(),
            }
        }
    };

    warn!("Realtime socket dropped: {}", reason);
    let _ = tx.send(ChannelEvent::Dropped(reason)).await;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_join_frame_filters_on_receiver() {
        let frame = join_frame("user-7", Some("jwt"));
        assert_eq!(frame["event"], "phx_join");
        assert_eq!(frame["topic"], TOPIC);
        assert_eq!(
            frame["payload"]["config"]["postgres_changes"][0]["filter"],
            "receiver_id=eq.user-7"
        );
        assert_eq!(frame["payload"]["access_token"], "jwt");
        assert!(join_frame("u", None)["payload"].get("access_token").is_none());
    }

    #[test]
    fn test_parse_insert_frame() {
        let text = json!({
            "topic": TOPIC,
            "event": "postgres_changes",
            "payload": {
                "data": {
                    "type": "INSERT",
                    "table": "messages",
                    "record": {
                        "id": "m-1",
                        "sender_id": "u2",
                        "receiver_id": "u1",
                        "message": "hello",
                        "message_type": "text",
                        "read": false,
                        "created_at": "2024-01-08T10:00:00.000000+00:00"
                    }
                },
                "ids": [1]
            },
            "ref": null
        })
        .to_string();
        match parse_frame(&text) {
            Some(FrameAction::Insert(rec)) => {
                assert_eq!(rec.id.as_deref(), Some("m-1"));
                assert_eq!(rec.receiver_id.as_deref(), Some("u1"));
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_parse_join_reply_and_errors() {
        let ok = json!({"event": "phx_reply", "ref": "1", "payload": {"status": "ok", "response": {}}});
        assert_eq!(parse_frame(&ok.to_string()), Some(FrameAction::Joined));

        let refused = json!({"event": "phx_reply", "ref": "1", "payload": {"status": "error", "response": {"reason": "unauthorized"}}});
        assert_eq!(
            parse_frame(&refused.to_string()),
            Some(FrameAction::JoinRejected("unauthorized".into()))
        );

        // heartbeat replies carry other refs
        let beat = json!({"event": "phx_reply", "ref": "5", "payload": {"status": "ok"}});
        assert_eq!(parse_frame(&beat.to_string()), None);

        let err = json!({"event": "phx_error", "payload": {}});
        assert!(matches!(parse_frame(&err.to_string()), Some(FrameAction::Closed(_))));
        assert_eq!(parse_frame("not json"), None);
    }

    #[test]
    fn test_update_changes_ignored() {
        let text = json!({
            "event": "postgres_changes",
            "payload": { "data": { "type": "UPDATE", "record": { "id": "m" } } }
        })
        .to_string();
        assert_eq!(parse_frame(&text), None);
    }
}
