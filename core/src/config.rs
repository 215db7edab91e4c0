/// Configuration management
use crate::error::{Result, StudyHubError};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::warn;

/// Viewer used in demo mode when none is given
pub const DEFAULT_DEMO_VIEWER: &str = "demo-user";

/// Which implementation set backs the services
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Mode {
    /// In-memory shadow seeded with example data
    Demo,
    /// Hosted backend-as-a-service
    Backend { url: String, anon_key: String },
}

/// Client configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Backend project URL (e.g. `https://xyz.supabase.co`)
    pub backend_url: Option<String>,

    /// Public anon key sent with every backend request
    pub anon_key: Option<String>,

    /// Force demo mode even when backend credentials are present
    pub force_demo: bool,

    /// User to view the inbox as (demo mode)
    pub viewer_id: Option<String>,

    /// Sign-in email for backend mode
    pub email: Option<String>,

    /// Sign-in password for backend mode
    #[serde(skip_serializing)]
    pub password: Option<String>,

    /// Timeout for a single backend request
    pub request_timeout: Duration,

    /// Resubscribe attempts after the push channel drops
    pub resubscribe_attempts: u32,

    /// Pause between resubscribe attempts
    pub resubscribe_interval: Duration,

    /// Realtime socket heartbeat interval
    pub heartbeat_interval: Duration,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            backend_url: None,
            anon_key: None,
            force_demo: false,
            viewer_id: None,
            email: None,
            password: None,
            request_timeout: Duration::from_secs(10),
            resubscribe_attempts: 5,
            resubscribe_interval: Duration::from_secs(2),
            heartbeat_interval: Duration::from_secs(30),
        }
    }
}

fn non_blank(value: &Option<String>) -> Option<&str> {
    value.as_deref().map(str::trim).filter(|s| !s.is_empty())
}

impl Config {
    /// Defaults overridden by `STUDYHUB_*` environment variables
    pub fn from_env() -> Self {
        let mut config = Self::default();
        config.apply_env(|key| std::env::var(key).ok());
        config
    }

    /// Apply environment overrides through `lookup`
    pub fn apply_env<F>(&mut self, lookup: F)
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(url) = lookup("STUDYHUB_SUPABASE_URL") {
            self.backend_url = Some(url);
        }
        if let Some(key) = lookup("STUDYHUB_SUPABASE_ANON_KEY") {
            self.anon_key = Some(key);
        }
        if let Some(viewer) = lookup("STUDYHUB_VIEWER") {
            self.viewer_id = Some(viewer);
        }
        if let Some(email) = lookup("STUDYHUB_EMAIL") {
            self.email = Some(email);
        }
        if let Some(password) = lookup("STUDYHUB_PASSWORD") {
            self.password = Some(password);
        }
        if let Some(n) = lookup("STUDYHUB_RESUBSCRIBE_ATTEMPTS").and_then(|s| s.parse::<u32>().ok()) {
            self.resubscribe_attempts = n;
        }
        if lookup("STUDYHUB_DEMO").is_some() {
            self.force_demo = true;
        }
    }

    /// Environment config plus command line flags.
    ///
    /// Returns the config and the remaining positional arguments (program
    /// name excluded).
    pub fn from_args(args: &[String]) -> Result<(Self, Vec<String>)> {
        let mut config = Self::from_env();
        let rest = config.apply_flags(args.get(1..).unwrap_or_default())?;
        Ok((config, rest))
    }

    /// Consume known flags, returning everything else in order
    pub fn apply_flags(&mut self, args: &[String]) -> Result<Vec<String>> {
        let mut rest = Vec::new();
        let mut i = 0;
        while i < args.len() {
            match args[i].as_str() {
                "--demo" => {
                    self.force_demo = true;
                    i += 1;
                }
                flag @ ("--backend-url" | "--anon-key" | "--as" | "--email" | "--password") => {
                    let value = args.get(i + 1).ok_or_else(|| {
                        StudyHubError::Config(format!("{} requires a value", flag))
                    })?;
                    let slot = match flag {
                        "--backend-url" => &mut self.backend_url,
                        "--anon-key" => &mut self.anon_key,
                        "--as" => &mut self.viewer_id,
                        "--email" => &mut self.email,
                        _ => &mut self.password,
                    };
                    *slot = Some(value.clone());
                    i += 2;
                }
                "--resubscribe-attempts" => {
                    let n = args.get(i + 1).ok_or_else(|| {
                        StudyHubError::Config("--resubscribe-attempts requires a number".to_string())
                    })?;
                    self.resubscribe_attempts = n.parse::<u32>().map_err(|_| {
                        StudyHubError::Config(
                            "--resubscribe-attempts must be a non-negative number".to_string(),
                        )
                    })?;
                    i += 2;
                }
                other => {
                    rest.push(other.to_string());
                    i += 1;
                }
            }
        }

        if let Some(url) = non_blank(&self.backend_url) {
            url::Url::parse(url)
                .map_err(|e| StudyHubError::Config(format!("Invalid backend URL '{}': {}", url, e)))?;
        }
        Ok(rest)
    }

    /// Backend mode needs both URL and anon key; anything less is demo mode.
    pub fn mode(&self) -> Mode {
        if self.force_demo {
            return Mode::Demo;
        }
        match (non_blank(&self.backend_url), non_blank(&self.anon_key)) {
            (Some(url), Some(key)) => Mode::Backend {
                url: url.trim_end_matches('/').to_string(),
                anon_key: key.to_string(),
            },
            (url, key) => {
                if url.is_some() || key.is_some() {
                    warn!("Backend partially configured (URL and anon key are both required); using demo mode");
                } else {
                    warn!("Backend not configured; using demo mode");
                }
                Mode::Demo
            }
        }
    }

    /// Viewer for demo mode
    pub fn demo_viewer(&self) -> String {
        non_blank(&self.viewer_id)
            .unwrap_or(DEFAULT_DEMO_VIEWER)
            .to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn args(list: &[&str]) -> Vec<String> {
        list.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn test_default_is_demo() {
        let config = Config::default();
        assert_eq!(config.mode(), Mode::Demo);
        assert_eq!(config.demo_viewer(), DEFAULT_DEMO_VIEWER);
    }

    #[test]
    fn test_backend_requires_both_values() {
        let mut config = Config {
            backend_url: Some("https://proj.example.co/".into()),
            ..Default::default()
        };
        assert_eq!(config.mode(), Mode::Demo);

        config.anon_key = Some("anon".into());
        assert_eq!(
            config.mode(),
            Mode::Backend {
                url: "https://proj.example.co".into(),
                anon_key: "anon".into()
            }
        );

        config.anon_key = Some("   ".into());
        assert_eq!(config.mode(), Mode::Demo);
    }

    #[test]
    fn test_flags_and_positionals() {
        let mut config = Config::default();
        let rest = config
            .apply_flags(&args(&["send", "--as", "u1", "u2", "hello", "--demo", "there"]))
            .unwrap();
        assert_eq!(rest, args(&["send", "u2", "hello", "there"]));
        assert_eq!(config.viewer_id.as_deref(), Some("u1"));
        assert!(config.force_demo);
    }

    #[test]
    fn test_flag_missing_value() {
        let mut config = Config::default();
        let err = config.apply_flags(&args(&["--backend-url"])).unwrap_err();
        assert!(matches!(err, StudyHubError::Config(_)));
    }

    #[test]
    fn test_invalid_url_rejected() {
        let mut config = Config::default();
        assert!(config.apply_flags(&args(&["--backend-url", "not a url"])).is_err());
    }

    #[test]
    fn test_env_overrides() {
        let env: HashMap<&str, &str> = [
            ("STUDYHUB_SUPABASE_URL", "https://p.example.co"),
            ("STUDYHUB_SUPABASE_ANON_KEY", "k"),
            ("STUDYHUB_RESUBSCRIBE_ATTEMPTS", "9"),
        ]
        .into_iter()
        .collect();
        let mut config = Config::default();
        config.apply_env(|k| env.get(k).map(|v| v.to_string()));
        assert_eq!(config.resubscribe_attempts, 9);
        assert!(matches!(config.mode(), Mode::Backend { .. }));
    }
}
