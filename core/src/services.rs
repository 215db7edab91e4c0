/// Startup wiring: picks the demo or backend implementation set once
use crate::backend::{BackendClient, BackendRealtime};
use crate::config::{Config, Mode};
use crate::error::Result;
use crate::inbox::Inbox;
use crate::message_store::{MemoryStore, MessageStore};
use crate::profile_store::{MemoryProfiles, ProfileLookup};
use crate::realtime::{InertChannel, Notifier, RealtimeChannel};
use crate::session::{AuthProvider, MemoryAuth, Session};
use std::sync::Arc;
use tracing::info;

/// Capabilities the rest of the crate works against
#[derive(Clone)]
pub struct Services {
    pub store: Arc<dyn MessageStore>,
    pub channel: Arc<dyn RealtimeChannel>,
    pub profiles: Arc<dyn ProfileLookup>,
    pub auth: Arc<dyn AuthProvider>,
    pub notifier: Notifier,
    demo: bool,
}

impl Services {
    pub fn from_config(config: &Config) -> Result<Self> {
        match config.mode() {
            Mode::Demo => Ok(Self::demo(config)),
            Mode::Backend { url, anon_key } => {
                let client = BackendClient::new(&url, &anon_key, config.request_timeout)?;
                info!("Using backend at {}", client.base_url());
                let channel: Arc<dyn RealtimeChannel> = Arc::new(BackendRealtime::new(
                    client.clone(),
                    config.heartbeat_interval,
                    config.request_timeout,
                ));
                Ok(Self {
                    store: Arc::new(client.clone()),
                    profiles: Arc::new(client.clone()),
                    auth: Arc::new(client),
                    notifier: Notifier::from_config(channel.clone(), config),
                    channel,
                    demo: false,
                })
            }
        }
    }

    /// In-memory services seeded with example data
    pub fn demo(config: &Config) -> Self {
        let viewer = config.demo_viewer();
        info!("Demo mode: viewing as {}", viewer);
        let channel: Arc<dyn RealtimeChannel> = Arc::new(InertChannel);
        Self {
            store: Arc::new(MemoryStore::seeded()),
            profiles: Arc::new(MemoryProfiles::seeded()),
            auth: Arc::new(MemoryAuth::demo(&viewer)),
            notifier: Notifier::from_config(channel.clone(), config),
            channel,
            demo: true,
        }
    }

    /// Assemble from explicit parts (tests, embedding)
    pub fn from_parts(
        store: Arc<dyn MessageStore>,
        channel: Arc<dyn RealtimeChannel>,
        profiles: Arc<dyn ProfileLookup>,
        auth: Arc<dyn AuthProvider>,
        config: &Config,
    ) -> Self {
        Self {
            store,
            notifier: Notifier::from_config(channel.clone(), config),
            channel,
            profiles,
            auth,
            demo: false,
        }
    }

    pub fn is_demo(&self) -> bool {
        self.demo
    }

    pub fn session(&self) -> Session {
        Session::new(self.auth.clone())
    }

    pub fn inbox(&self, viewer_id: &str) -> Inbox {
        Inbox::new(viewer_id, self.store.clone(), self.profiles.clone())
    }
}
