/// Authentication session context.
///
/// A `Session` is created explicitly at startup, initialized once from the
/// auth provider and cleared on sign-out. Interested parties subscribe to
/// its events instead of reading shared globals.
use crate::error::{Result, StudyHubError};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{broadcast, RwLock};
use tracing::{info, warn};

/// Signed-in user
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct User {
    pub id: String,
    pub email: String,
    pub name: String,
}

/// Extra profile data collected at sign-up
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SignUpDetails {
    pub name: String,
    pub major: String,
    pub year: String,
}

#[async_trait]
pub trait AuthProvider: Send + Sync {
    /// User of the current session, if any
    async fn current_user(&self) -> Result<Option<User>>;
    async fn sign_in(&self, email: &str, password: &str) -> Result<User>;
    async fn sign_up(&self, email: &str, password: &str, details: &SignUpDetails) -> Result<User>;
    async fn sign_out(&self) -> Result<()>;
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionEvent {
    SignedIn(User),
    SignedOut,
}

/// Session state shared by everything that needs the current user
pub struct Session {
    auth: Arc<dyn AuthProvider>,
    user: RwLock<Option<User>>,
    events: broadcast::Sender<SessionEvent>,
}

impl Session {
    pub fn new(auth: Arc<dyn AuthProvider>) -> Self {
        let (events, _) = broadcast::channel(16);
        Self {
            auth,
            user: RwLock::new(None),
            events,
        }
    }

    /// Load the existing session from the provider. Failure leaves the
    /// session signed out.
    pub async fn init(&self) -> Option<User> {
        match self.auth.current_user().await {
            Ok(Some(user)) => {
                info!("Restored session for {}", user.email);
                self.set(Some(user.clone())).await;
                Some(user)
            }
            Ok(None) => None,
            Err(e) => {
                warn!("Session initialization failed: {}", e);
                None
            }
        }
    }

    pub async fn sign_in(&self, email: &str, password: &str) -> Result<User> {
        let user = self.auth.sign_in(email, password).await?;
        info!("Signed in as {}", user.email);
        self.set(Some(user.clone())).await;
        Ok(user)
    }

    pub async fn sign_up(&self, email: &str, password: &str, details: &SignUpDetails) -> Result<User> {
        let user = self.auth.sign_up(email, password, details).await?;
        info!("Registered {}", user.email);
        self.set(Some(user.clone())).await;
        Ok(user)
    }

    /// Clear the session and notify subscribers. The local session is
    /// cleared even if the provider call fails; the error is still returned.
    pub async fn sign_out(&self) -> Result<()> {
        let result = self.auth.sign_out().await;
        if let Err(e) = &result {
            warn!("Provider sign-out failed: {}", e);
        }
        self.set(None).await;
        result
    }

    pub async fn current_user(&self) -> Option<User> {
        self.user.read().await.clone()
    }

    /// Current user or an auth error
    pub async fn require_user(&self) -> Result<User> {
        self.current_user()
            .await
            .ok_or_else(|| StudyHubError::Auth("not signed in".to_string()))
    }

    pub fn subscribe(&self) -> broadcast::Receiver<SessionEvent> {
        self.events.subscribe()
    }

    async fn set(&self, user: Option<User>) {
        let mut slot = self.user.write().await;
        let changed = *slot != user;
        *slot = user.clone();
        drop(slot);
        if changed {
            let event = match user {
                Some(u) => SessionEvent::SignedIn(u),
                None => SessionEvent::SignedOut,
            };
            // no subscribers is fine
            let _ = self.events.send(event);
        }
    }
}

/// Accounts held in memory (demo mode).
///
/// Starts signed in as `initial` when given, mirroring a browser that still
/// has a session.
pub struct MemoryAuth {
    accounts: RwLock<HashMap<String, (String, User)>>,
    current: RwLock<Option<User>>,
}

impl MemoryAuth {
    pub fn new(initial: Option<User>) -> Self {
        Self {
            accounts: RwLock::new(HashMap::new()),
            current: RwLock::new(initial),
        }
    }

    /// Demo provider signed in as `viewer_id`, with a matching demo account
    pub fn demo(viewer_id: &str) -> Self {
        let user = User {
            id: viewer_id.to_string(),
            email: format!("{}@studyhub.demo", viewer_id).to_lowercase(),
            name: crate::profile_store::demo_profiles()
                .into_iter()
                .find(|p| p.id == viewer_id)
                .map(|p| p.full_name)
                .unwrap_or_else(|| viewer_id.to_string()),
        };
        let mut accounts = HashMap::new();
        accounts.insert(user.email.clone(), ("demo".to_string(), user.clone()));
        Self {
            accounts: RwLock::new(accounts),
            current: RwLock::new(Some(user)),
        }
    }
}

#[async_trait]
impl AuthProvider for MemoryAuth {
    async fn current_user(&self) -> Result<Option<User>> {
        Ok(self.current.read().await.clone())
    }

    async fn sign_in(&self, email: &str, password: &str) -> Result<User> {
        let accounts = self.accounts.read().await;
        let (stored, user) = accounts
            .get(&email.trim().to_lowercase())
            .ok_or_else(|| StudyHubError::Auth("invalid login credentials".to_string()))?;
        if stored != password {
            return Err(StudyHubError::Auth("invalid login credentials".to_string()));
        }
        *self.current.write().await = Some(user.clone());
        Ok(user.clone())
    }

    async fn sign_up(&self, email: &str, password: &str, details: &SignUpDetails) -> Result<User> {
        let email = email.trim().to_lowercase();
        if !email.contains('@') {
            return Err(StudyHubError::Validation(format!("invalid email '{}'", email)));
        }
        if password.len() < 6 {
            return Err(StudyHubError::Validation(
                "password must be at least 6 characters".to_string(),
            ));
        }
        let mut accounts = self.accounts.write().await;
        if accounts.contains_key(&email) {
            return Err(StudyHubError::Auth("user already registered".to_string()));
        }
        let user = User {
            id: format!("demo-{}", uuid::Uuid::new_v4()),
            email: email.clone(),
            name: details.name.clone(),
        };
        accounts.insert(email, (password.to_string(), user.clone()));
        *self.current.write().await = Some(user.clone());
        Ok(user)
    }

    async fn sign_out(&self) -> Result<()> {
        *self.current.write().await = None;
        Ok(())
    }
}
