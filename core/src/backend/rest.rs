/// Message table and profile lookups over the backend's REST interface
use super::{check_status, unreachable, BackendClient};
use crate::error::{Result, StudyHubError};
use crate::message_store::{MessageFilter, MessageStore, ReadScope};
use crate::messenger_types::{MessageRecord, NewMessage};
use crate::profile_store::ProfileLookup;
use async_trait::async_trait;
use serde::Deserialize;
use std::collections::HashMap;
use tracing::debug;

const MESSAGES: &str = "messages";
const PROFILES: &str = "profiles";
const CHRONOLOGICAL: &str = "created_at.asc,id.asc";

/// Quote a value for use inside a logical filter (`or=(...)`, `in.(...)`)
fn quoted(value: &str) -> String {
    format!("\"{}\"", value.replace('\\', "\\\\").replace('"', "\\\""))
}

/// Query parameters selecting the rows of `filter`
pub fn filter_params(filter: &MessageFilter) -> Vec<(String, String)> {
    match filter {
        MessageFilter::Involving(user) => vec![(
            "or".to_string(),
            format!("(sender_id.eq.{0},receiver_id.eq.{0})", quoted(user)),
        )],
        MessageFilter::Between(a, b) => vec![(
            "or".to_string(),
            format!(
                "(and(sender_id.eq.{0},receiver_id.eq.{1}),and(sender_id.eq.{1},receiver_id.eq.{0}))",
                quoted(a),
                quoted(b)
            ),
        )],
        MessageFilter::UnreadFor(user) => vec![
            ("receiver_id".to_string(), format!("eq.{}", user)),
            ("read".to_string(), "eq.false".to_string()),
        ],
    }
}

/// Query parameters for the scoped read update
pub fn scope_params(scope: &ReadScope) -> Vec<(String, String)> {
    vec![
        ("receiver_id".to_string(), format!("eq.{}", scope.receiver_id)),
        ("sender_id".to_string(), format!("eq.{}", scope.sender_id)),
        ("read".to_string(), "eq.false".to_string()),
    ]
}

#[async_trait]
impl MessageStore for BackendClient {
    async fn insert(&self, draft: NewMessage) -> Result<MessageRecord> {
        draft.validate()?;
        let req = self
            .http()
            .post(self.rest_url(MESSAGES))
            .header("Prefer", "return=representation")
            .json(&[draft.to_insert_row()]);
        let resp = self.authorized(req).await.send().await.map_err(unreachable)?;
        let mut rows: Vec<MessageRecord> = check_status(resp).await?.json().await.map_err(unreachable)?;
        rows.pop()
            .ok_or_else(|| StudyHubError::StoreUnavailable("insert returned no row".to_string()))
    }

    async fn select(&self, filter: &MessageFilter) -> Result<Vec<MessageRecord>> {
        let mut params = filter_params(filter);
        params.push(("select".to_string(), "*".to_string()));
        params.push(("order".to_string(), CHRONOLOGICAL.to_string()));
        let req = self.http().get(self.rest_url(MESSAGES)).query(&params);
        let resp = self.authorized(req).await.send().await.map_err(unreachable)?;
        let rows: Vec<MessageRecord> = check_status(resp).await?.json().await.map_err(unreachable)?;
        debug!("Fetched {} message rows for {:?}", rows.len(), filter);
        Ok(rows)
    }

    async fn mark_read(&self, scope: &ReadScope) -> Result<usize> {
        let mut params = scope_params(scope);
        params.push(("select".to_string(), "id".to_string()));
        let req = self
            .http()
            .patch(self.rest_url(MESSAGES))
            .query(&params)
            .header("Prefer", "return=representation")
            .json(&serde_json::json!({ "read": true }));
        let resp = self.authorized(req).await.send().await.map_err(unreachable)?;
        let updated: Vec<serde_json::Value> = check_status(resp).await?.json().await.map_err(unreachable)?;
        Ok(updated.len())
    }
}

#[derive(Deserialize)]
struct ProfileRow {
    id: String,
    #[serde(default)]
    full_name: Option<String>,
}

#[async_trait]
impl ProfileLookup for BackendClient {
    async fn display_names(&self, ids: &[String]) -> Result<HashMap<String, String>> {
        if ids.is_empty() {
            return Ok(HashMap::new());
        }
        let list = ids.iter().map(|id| quoted(id)).collect::<Vec<_>>().join(",");
        let req = self.http().get(self.rest_url(PROFILES)).query(&[
            ("select", "id,full_name".to_string()),
            ("id", format!("in.({})", list)),
        ]);
        let resp = self.authorized(req).await.send().await.map_err(unreachable)?;
        let rows: Vec<ProfileRow> = check_status(resp).await?.json().await.map_err(unreachable)?;
        Ok(rows
            .into_iter()
            .filter_map(|r| r.full_name.map(|name| (r.id, name)))
            .collect())
    }
}
