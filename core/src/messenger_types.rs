/// Shared types for the messaging layer
use crate::error::{Result, StudyHubError};
use chrono::{DateTime, NaiveDateTime, Utc};
use serde::{Deserialize, Serialize};

/// Classifies a message for display and optional cross-referencing
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageKind {
    Text,
    File,
    LinkedAssignment,
    LinkedService,
}

impl MessageKind {
    /// Value stored in the `message_type` column.
    ///
    /// The table only knows `text`, `file` and `assignment`; service links
    /// are `assignment` rows carrying `service_id` instead of `assignment_id`.
    pub fn as_wire(&self) -> &'static str {
        match self {
            MessageKind::Text => "text",
            MessageKind::File => "file",
            MessageKind::LinkedAssignment | MessageKind::LinkedService => "assignment",
        }
    }

    pub fn is_linked(&self) -> bool {
        matches!(self, MessageKind::LinkedAssignment | MessageKind::LinkedService)
    }
}

/// A validated, directed message between two users
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Message {
    pub id: String,
    pub sender_id: String,
    pub receiver_id: String,
    pub body: String,
    pub kind: MessageKind,
    /// Assignment or service id; only set for linked kinds
    pub linked_entity_id: Option<String>,
    pub read: bool,
    pub created_at: DateTime<Utc>,
}

impl Message {
    /// Total order key: `(created_at, id)`
    pub fn order_key(&self) -> (DateTime<Utc>, &str) {
        (self.created_at, self.id.as_str())
    }

    /// The other participant relative to `viewer_id`, if the viewer is one of them
    pub fn counterparty_of(&self, viewer_id: &str) -> Option<&str> {
        if self.sender_id == viewer_id {
            Some(&self.receiver_id)
        } else if self.receiver_id == viewer_id {
            Some(&self.sender_id)
        } else {
            None
        }
    }

    /// Received by `viewer_id` and not yet read
    pub fn is_unread_for(&self, viewer_id: &str) -> bool {
        self.receiver_id == viewer_id && !self.read
    }
}

/// Raw row as stored by the message table.
///
/// Every column is optional so that bad rows can be reported instead of
/// failing a whole batch during deserialization.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct MessageRecord {
    #[serde(default, deserialize_with = "lenient_id")]
    pub id: Option<String>,
    #[serde(default, deserialize_with = "lenient_id")]
    pub sender_id: Option<String>,
    #[serde(default, deserialize_with = "lenient_id")]
    pub receiver_id: Option<String>,
    #[serde(default)]
    pub message: Option<String>,
    #[serde(default)]
    pub message_type: Option<String>,
    #[serde(default, deserialize_with = "lenient_id", skip_serializing_if = "Option::is_none")]
    pub assignment_id: Option<String>,
    #[serde(default, deserialize_with = "lenient_id", skip_serializing_if = "Option::is_none")]
    pub service_id: Option<String>,
    #[serde(default)]
    pub read: Option<bool>,
    #[serde(default)]
    pub created_at: Option<String>,
}

/// Accept ids stored as strings or numbers
fn lenient_id<'de, D>(deserializer: D) -> std::result::Result<Option<String>, D::Error>
where
    D: serde::Deserializer<'de>,
{
    Ok(match serde_json::Value::deserialize(deserializer)? {
        serde_json::Value::String(s) => Some(s),
        serde_json::Value::Number(n) => Some(n.to_string()),
        _ => None,
    })
}

fn malformed(id: &Option<String>, reason: &str) -> StudyHubError {
    StudyHubError::MalformedMessage {
        id: id.clone().unwrap_or_else(|| "<no id>".to_string()),
        reason: reason.to_string(),
    }
}

fn non_blank(value: &Option<String>) -> Option<&str> {
    value.as_deref().map(str::trim).filter(|s| !s.is_empty())
}

/// Parse a timestamp column (RFC 3339, or naive ISO 8601 taken as UTC)
pub fn parse_timestamp(raw: &str) -> Option<DateTime<Utc>> {
    if let Ok(ts) = DateTime::parse_from_rfc3339(raw) {
        return Some(ts.with_timezone(&Utc));
    }
    NaiveDateTime::parse_from_str(raw, "%Y-%m-%dT%H:%M:%S%.f")
        .or_else(|_| NaiveDateTime::parse_from_str(raw, "%Y-%m-%d %H:%M:%S%.f"))
        .ok()
        .map(|naive| naive.and_utc())
}

impl TryFrom<MessageRecord> for Message {
    type Error = StudyHubError;

    fn try_from(rec: MessageRecord) -> Result<Self> {
        let id = non_blank(&rec.id).ok_or_else(|| malformed(&rec.id, "missing id"))?;
        let sender_id =
            non_blank(&rec.sender_id).ok_or_else(|| malformed(&rec.id, "missing sender_id"))?;
        let receiver_id =
            non_blank(&rec.receiver_id).ok_or_else(|| malformed(&rec.id, "missing receiver_id"))?;
        if sender_id == receiver_id {
            return Err(malformed(&rec.id, "sender and receiver are the same user"));
        }
        let body = rec
            .message
            .as_deref()
            .filter(|b| !b.trim().is_empty())
            .ok_or_else(|| malformed(&rec.id, "empty body"))?;
        let created_at = rec
            .created_at
            .as_deref()
            .ok_or_else(|| malformed(&rec.id, "missing created_at"))
            .and_then(|raw| {
                parse_timestamp(raw).ok_or_else(|| malformed(&rec.id, "unparseable created_at"))
            })?;

        let assignment_id = non_blank(&rec.assignment_id);
        let service_id = non_blank(&rec.service_id);
        let (kind, linked_entity_id) = match rec.message_type.as_deref().unwrap_or("text") {
            "text" => (MessageKind::Text, None),
            "file" => (MessageKind::File, None),
            "assignment" => match (assignment_id, service_id) {
                (Some(a), _) => (MessageKind::LinkedAssignment, Some(a)),
                (None, Some(s)) => (MessageKind::LinkedService, Some(s)),
                (None, None) => return Err(malformed(&rec.id, "linked message without entity id")),
            },
            // tolerated on read, never written
            "service" => match service_id {
                Some(s) => (MessageKind::LinkedService, Some(s)),
                None => return Err(malformed(&rec.id, "linked message without entity id")),
            },
            other => {
                return Err(malformed(
                    &rec.id,
                    &format!("unknown message_type '{}'", other),
                ))
            }
        };

        Ok(Message {
            id: id.to_string(),
            sender_id: sender_id.to_string(),
            receiver_id: receiver_id.to_string(),
            body: body.to_string(),
            kind,
            linked_entity_id: linked_entity_id.map(str::to_string),
            read: rec.read.unwrap_or(false),
            created_at,
        })
    }
}

impl From<&Message> for MessageRecord {
    fn from(msg: &Message) -> Self {
        let (assignment_id, service_id) = match msg.kind {
            MessageKind::LinkedAssignment => (msg.linked_entity_id.clone(), None),
            MessageKind::LinkedService => (None, msg.linked_entity_id.clone()),
            _ => (None, None),
        };
        Self {
            id: Some(msg.id.clone()),
            sender_id: Some(msg.sender_id.clone()),
            receiver_id: Some(msg.receiver_id.clone()),
            message: Some(msg.body.clone()),
            message_type: Some(msg.kind.as_wire().to_string()),
            assignment_id,
            service_id,
            read: Some(msg.read),
            created_at: Some(msg.created_at.to_rfc3339()),
        }
    }
}

/// A message about to be sent; id and timestamp are assigned by the store
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NewMessage {
    pub sender_id: String,
    pub receiver_id: String,
    pub body: String,
    pub kind: MessageKind,
    pub linked_entity_id: Option<String>,
}

impl NewMessage {
    pub fn text(sender_id: &str, receiver_id: &str, body: &str) -> Self {
        Self {
            sender_id: sender_id.to_string(),
            receiver_id: receiver_id.to_string(),
            body: body.to_string(),
            kind: MessageKind::Text,
            linked_entity_id: None,
        }
    }

    pub fn about_assignment(sender_id: &str, receiver_id: &str, assignment_id: &str, body: &str) -> Self {
        Self {
            kind: MessageKind::LinkedAssignment,
            linked_entity_id: Some(assignment_id.to_string()),
            ..Self::text(sender_id, receiver_id, body)
        }
    }

    pub fn about_service(sender_id: &str, receiver_id: &str, service_id: &str, body: &str) -> Self {
        Self {
            kind: MessageKind::LinkedService,
            linked_entity_id: Some(service_id.to_string()),
            ..Self::text(sender_id, receiver_id, body)
        }
    }

    /// Reject drafts that would produce a malformed row
    pub fn validate(&self) -> Result<()> {
        if self.sender_id.trim().is_empty() || self.receiver_id.trim().is_empty() {
            return Err(StudyHubError::Validation("sender and receiver are required".into()));
        }
        if self.sender_id == self.receiver_id {
            return Err(StudyHubError::Validation("cannot send a message to yourself".into()));
        }
        if self.body.trim().is_empty() {
            return Err(StudyHubError::Validation("message body is empty".into()));
        }
        let has_link = self
            .linked_entity_id
            .as_deref()
            .is_some_and(|id| !id.trim().is_empty());
        if self.kind.is_linked() != has_link {
            return Err(StudyHubError::Validation(format!(
                "{} message {} a linked entity id",
                self.kind.as_wire(),
                if has_link { "must not carry" } else { "requires" }
            )));
        }
        Ok(())
    }

    /// Materialize into a stored message
    pub fn into_message(self, id: String, created_at: DateTime<Utc>) -> Message {
        Message {
            id,
            sender_id: self.sender_id,
            receiver_id: self.receiver_id,
            body: self.body.trim().to_string(),
            kind: self.kind,
            linked_entity_id: self.linked_entity_id,
            read: false,
            created_at,
        }
    }

    /// Insert payload for the message table (server assigns id and created_at)
    pub fn to_insert_row(&self) -> serde_json::Value {
        let mut row = serde_json::json!({
            "sender_id": self.sender_id,
            "receiver_id": self.receiver_id,
            "message": self.body.trim(),
            "message_type": self.kind.as_wire(),
        });
        match self.kind {
            MessageKind::LinkedAssignment => row["assignment_id"] = self.linked_entity_id.clone().into(),
            MessageKind::LinkedService => row["service_id"] = self.linked_entity_id.clone().into(),
            _ => {}
        }
        row
    }
}

/// One derived conversation from the perspective of a viewer
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Conversation {
    pub counterparty_id: String,
    /// Message with the greatest `(created_at, id)` in the conversation
    pub last_message: Message,
    /// Received from the counterparty and still unread
    pub unread_count: usize,
}

/// Conversation plus the counterparty's resolved display name
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConversationEntry {
    pub conversation: Conversation,
    pub display_name: String,
}

/// Everything the conversation list shows for one viewer
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct InboxView {
    pub conversations: Vec<ConversationEntry>,
    pub unread_total: usize,
}

/// Events published by the inbox to whoever renders it
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum InboxEvent {
    /// Conversations were re-derived
    Refreshed { unread_total: usize },
    /// A pushed message addressed to the viewer arrived
    NewMessage { message: Message },
    /// A record was skipped during derivation
    Anomaly { id: String, reason: String },
    /// Realtime delivery gave up; manual refresh still works
    Degraded { reason: String },
    /// Realtime delivery resumed after a drop
    Recovered,
}
