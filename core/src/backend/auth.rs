/// Password authentication against the backend's auth endpoints
use super::{check_status, status_error, BackendClient};
use crate::error::{Result, StudyHubError};
use crate::session::{AuthProvider, SignUpDetails, User};
use async_trait::async_trait;
use reqwest::StatusCode;
use serde_json::Value;
use tracing::{debug, warn};

fn auth_unreachable(e: reqwest::Error) -> StudyHubError {
    StudyHubError::Auth(format!("auth service unreachable: {}", e))
}

/// Build a [`User`] from an auth user object
pub fn user_from_json(user: &Value) -> Option<User> {
    let id = user.get("id")?.as_str()?.to_string();
    let email = user
        .get("email")
        .and_then(Value::as_str)
        .unwrap_or_default()
        .to_string();
    let meta = user.get("user_metadata");
    let name = ["name", "full_name"]
        .iter()
        .find_map(|k| meta.and_then(|m| m.get(*k)).and_then(Value::as_str))
        .filter(|n| !n.trim().is_empty())
        .map(str::to_string)
        .unwrap_or_else(|| email.clone());
    Some(User { id, email, name })
}

impl BackendClient {
    /// Store the token (if any) and extract the user from a session response
    async fn accept_session(&self, body: &Value) -> Result<User> {
        if let Some(token) = body.get("access_token").and_then(Value::as_str) {
            self.set_access_token(Some(token.to_string())).await;
        }
        // sign-up without email confirmation returns the bare user object
        body.get("user")
            .and_then(user_from_json)
            .or_else(|| user_from_json(body))
            .ok_or_else(|| StudyHubError::Auth("auth response without user".to_string()))
    }
}

#[async_trait]
impl AuthProvider for BackendClient {
    async fn current_user(&self) -> Result<Option<User>> {
        let Some(token) = self.access_token().await else {
            return Ok(None);
        };
        let resp = self
            .http()
            .get(self.auth_url("user"))
            .header("apikey", self.anon_key())
            .header("Authorization", format!("Bearer {}", token))
            .send()
            .await
            .map_err(auth_unreachable)?;
        if resp.status() == StatusCode::UNAUTHORIZED {
            debug!("Stored token rejected; treating session as signed out");
            self.set_access_token(None).await;
            return Ok(None);
        }
        let body: Value = check_status(resp).await?.json().await.map_err(auth_unreachable)?;
        Ok(user_from_json(&body))
    }

    async fn sign_in(&self, email: &str, password: &str) -> Result<User> {
        let resp = self
            .http()
            .post(self.auth_url("token"))
            .query(&[("grant_type", "password")])
            .header("apikey", self.anon_key())
            .json(&serde_json::json!({ "email": email, "password": password }))
            .send()
            .await
            .map_err(auth_unreachable)?;
        let status = resp.status();
        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            // the auth service answers bad credentials with 400
            return Err(match status_error(status, &body) {
                StudyHubError::Validation(m) => StudyHubError::Auth(m),
                other => other,
            });
        }
        let body: Value = resp.json().await.map_err(auth_unreachable)?;
        self.accept_session(&body).await
    }

    async fn sign_up(&self, email: &str, password: &str, details: &SignUpDetails) -> Result<User> {
        let resp = self
            .http()
            .post(self.auth_url("signup"))
            .header("apikey", self.anon_key())
            .json(&serde_json::json!({
                "email": email,
                "password": password,
                "data": {
                    "name": details.name,
                    "major": details.major,
                    "year": details.year,
                },
            }))
            .send()
            .await
            .map_err(auth_unreachable)?;
        let body: Value = check_status(resp).await?.json().await.map_err(auth_unreachable)?;
        self.accept_session(&body).await
    }

    async fn sign_out(&self) -> Result<()> {
        let Some(token) = self.access_token().await else {
            return Ok(());
        };
        self.set_access_token(None).await;
        let resp = self
            .http()
            .post(self.auth_url("logout"))
            .header("apikey", self.anon_key())
            .header("Authorization", format!("Bearer {}", token))
            .send()
            .await
            .map_err(auth_unreachable)?;
        if let Err(e) = check_status(resp).await {
            warn!("Logout not acknowledged: {}", e);
            return Err(e);
        }
        Ok(())
    }
}
