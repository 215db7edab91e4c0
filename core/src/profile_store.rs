/// Display-name lookup for conversation counterparties
use crate::error::Result;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::warn;

/// Label shown when a counterparty cannot be resolved
pub const UNKNOWN_USER: &str = "Unknown User";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Profile {
    pub id: String,
    pub full_name: String,
    #[serde(default)]
    pub course: Option<String>,
}

/// Resolves user ids to display names. Partial results are fine.
#[async_trait]
pub trait ProfileLookup: Send + Sync {
    async fn display_names(&self, ids: &[String]) -> Result<HashMap<String, String>>;
}

/// Resolve one counterparty; never fails.
pub async fn resolve_display_name(lookup: &dyn ProfileLookup, counterparty_id: &str) -> String {
    let mut names = resolve_display_names(lookup, &[counterparty_id.to_string()]).await;
    names.remove(counterparty_id).unwrap_or_else(|| UNKNOWN_USER.to_string())
}

/// Resolve many counterparties with one lookup call.
///
/// Every requested id gets an entry; misses and lookup failures map to
/// [`UNKNOWN_USER`].
pub async fn resolve_display_names(lookup: &dyn ProfileLookup, ids: &[String]) -> HashMap<String, String> {
    let found = match lookup.display_names(ids).await {
        Ok(found) => found,
        Err(e) => {
            warn!("Profile lookup failed, using fallback names: {}", e);
            HashMap::new()
        }
    };
    ids.iter()
        .map(|id| {
            let name = found
                .get(id)
                .map(|n| n.trim())
                .filter(|n| !n.is_empty())
                .unwrap_or(UNKNOWN_USER);
            (id.clone(), name.to_string())
        })
        .collect()
}

/// Profiles held in memory (demo mode, tests)
#[derive(Clone, Default)]
pub struct MemoryProfiles {
    profiles: Arc<RwLock<HashMap<String, Profile>>>,
}

impl MemoryProfiles {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn seeded() -> Self {
        let profiles = demo_profiles()
            .into_iter()
            .map(|p| (p.id.clone(), p))
            .collect();
        Self {
            profiles: Arc::new(RwLock::new(profiles)),
        }
    }

    pub async fn upsert(&self, profile: Profile) {
        self.profiles.write().await.insert(profile.id.clone(), profile);
    }

    pub async fn get(&self, id: &str) -> Option<Profile> {
        self.profiles.read().await.get(id).cloned()
    }
}

#[async_trait]
impl ProfileLookup for MemoryProfiles {
    async fn display_names(&self, ids: &[String]) -> Result<HashMap<String, String>> {
        let profiles = self.profiles.read().await;
        Ok(ids
            .iter()
            .filter_map(|id| profiles.get(id).map(|p| (id.clone(), p.full_name.clone())))
            .collect())
    }
}

pub fn demo_profiles() -> Vec<Profile> {
    let p = |id: &str, name: &str, course: &str| Profile {
        id: id.to_string(),
        full_name: name.to_string(),
        course: Some(course.to_string()),
    };
    vec![
        p("demo-user", "Demo User", "B.Tech CSE, Year 2"),
        p("demo-user-1", "Arjun Patel", "B.Tech CSE, Year 3"),
        p("demo-user-2", "Sneha Sharma", "MCA, Year 2"),
        p("demo-user-3", "Rohit Kumar", "B.Com, Year 1"),
    ]
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::StudyHubError;

    struct FailingLookup;

    #[async_trait]
    impl ProfileLookup for FailingLookup {
        async fn display_names(&self, _ids: &[String]) -> Result<HashMap<String, String>> {
            Err(StudyHubError::StoreUnavailable("profiles offline".into()))
        }
    }

    #[tokio::test]
    async fn test_resolve_known_and_unknown() {
        let profiles = MemoryProfiles::seeded();
        assert_eq!(resolve_display_name(&profiles, "demo-user-2").await, "Sneha Sharma");
        assert_eq!(resolve_display_name(&profiles, "ghost").await, UNKNOWN_USER);
    }

    #[tokio::test]
    async fn test_lookup_failure_falls_back() {
        let ids = vec!["a".to_string(), "b".to_string()];
        let names = resolve_display_names(&FailingLookup, &ids).await;
        assert_eq!(names.len(), 2);
        assert!(names.values().all(|n| n == UNKNOWN_USER));
    }

    #[tokio::test]
    async fn test_blank_name_falls_back() {
        let profiles = MemoryProfiles::new();
        profiles
            .upsert(Profile {
                id: "x".into(),
                full_name: "  ".into(),
                course: None,
            })
            .await;
        assert_eq!(resolve_display_name(&profiles, "x").await, UNKNOWN_USER);
    }
}
