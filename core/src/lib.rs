/// StudyHub messaging core
///
/// Derives per-counterparty conversations and unread counts from a flat
/// message table, keeps them current through realtime pushes, and runs
/// against either a hosted backend or an in-memory demo data set.

pub mod error;
pub mod config;
pub mod messenger_types;
pub mod aggregator;
pub mod message_store;
pub mod profile_store;
pub mod realtime;
pub mod session;
pub mod inbox;
pub mod backend;
pub mod services;
pub mod cli_app;

pub use config::Config;
pub use error::{Result, StudyHubError};
pub use inbox::Inbox;
pub use services::Services;
