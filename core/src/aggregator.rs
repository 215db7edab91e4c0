/// Conversation derivation: groups a flat set of directed messages into
/// one conversation per counterparty, with unread counts.
///
/// Everything here is a pure projection over its inputs. Callers pass the
/// complete current message set every time; nothing is cached.
use crate::messenger_types::{Conversation, Message, MessageRecord};
use std::collections::{BTreeMap, HashMap};

/// A record skipped while parsing
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Anomaly {
    pub id: String,
    pub reason: String,
}

/// Result of validating raw rows
#[derive(Debug, Default)]
pub struct Parsed {
    pub messages: Vec<Message>,
    pub anomalies: Vec<Anomaly>,
}

/// Validate raw rows, keeping the good ones and reporting the rest.
pub fn parse_records<I>(records: I) -> Parsed
where
    I: IntoIterator<Item = MessageRecord>,
{
    let mut parsed = Parsed::default();
    for rec in records {
        match Message::try_from(rec) {
            Ok(msg) => parsed.messages.push(msg),
            Err(crate::StudyHubError::MalformedMessage { id, reason }) => {
                parsed.anomalies.push(Anomaly { id, reason })
            }
            Err(other) => parsed.anomalies.push(Anomaly {
                id: "<unknown>".to_string(),
                reason: other.to_string(),
            }),
        }
    }
    parsed
}

/// Group messages by counterparty. Messages the viewer is not part of are ignored.
pub fn partition_by_counterparty<'a>(
    viewer_id: &str,
    messages: &'a [Message],
) -> BTreeMap<&'a str, Vec<&'a Message>> {
    let mut groups: BTreeMap<&str, Vec<&Message>> = BTreeMap::new();
    for msg in messages {
        if let Some(counterparty) = msg.counterparty_of(viewer_id) {
            groups.entry(counterparty).or_default().push(msg);
        }
    }
    groups
}

/// One conversation per counterparty, most recently active first.
///
/// Output does not depend on input order: ties on `created_at` fall back to
/// the last message id, then the counterparty id.
pub fn derive_conversations(viewer_id: &str, messages: &[Message]) -> Vec<Conversation> {
    let mut conversations: Vec<Conversation> = partition_by_counterparty(viewer_id, messages)
        .into_iter()
        .filter_map(|(counterparty, group)| {
            let last = group.iter().max_by(|a, b| a.order_key().cmp(&b.order_key()))?;
            let unread_count = group.iter().filter(|m| m.is_unread_for(viewer_id)).count();
            Some(Conversation {
                counterparty_id: counterparty.to_string(),
                last_message: (*last).clone(),
                unread_count,
            })
        })
        .collect();

    conversations.sort_by(|a, b| {
        b.last_message
            .order_key()
            .cmp(&a.last_message.order_key())
            .then_with(|| a.counterparty_id.cmp(&b.counterparty_id))
    });
    conversations
}

/// Messages received by the viewer that are still unread
pub fn count_unread(viewer_id: &str, messages: &[Message]) -> usize {
    messages.iter().filter(|m| m.is_unread_for(viewer_id)).count()
}

/// Messages exchanged between `viewer_id` and `counterparty_id`, oldest first
pub fn thread_between(viewer_id: &str, counterparty_id: &str, messages: &[Message]) -> Vec<Message> {
    let mut thread: Vec<Message> = messages
        .iter()
        .filter(|m| m.counterparty_of(viewer_id) == Some(counterparty_id))
        .cloned()
        .collect();
    sort_chronologically(&mut thread);
    thread
}

/// Sort by `(created_at, id)` ascending
pub fn sort_chronologically(messages: &mut [Message]) {
    messages.sort_by(|a, b| a.order_key().cmp(&b.order_key()));
}

/// Insert or replace a message by id, keeping the set free of duplicates.
pub fn upsert(messages: &mut Vec<Message>, incoming: Message) {
    match messages.iter_mut().find(|m| m.id == incoming.id) {
        Some(existing) => *existing = incoming,
        None => messages.push(incoming),
    }
}

/// Collapse repeated ids, keeping the last occurrence in its first position
pub fn dedupe_by_id(messages: Vec<Message>) -> Vec<Message> {
    let mut out: Vec<Message> = Vec::with_capacity(messages.len());
    let mut index: HashMap<String, usize> = HashMap::with_capacity(messages.len());
    for m in messages {
        match index.get(&m.id) {
            Some(&i) => out[i] = m,
            None => {
                index.insert(m.id.clone(), out.len());
                out.push(m);
            }
        }
    }
    out
}
