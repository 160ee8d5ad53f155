pub mod auth;
pub mod config;
pub mod error;
pub mod platform;
pub mod routes;
pub mod supervisor;

use std::sync::Arc;

use config::{Config, PlatformKind};
use platform::discord::DiscordConnector;
use platform::memory::MemoryPlatform;
use platform::PlatformConnector;
use supervisor::Supervisor;

/// Shared application state available to all route handlers.
#[derive(Clone)]
pub struct AppState {
    pub supervisor: Arc<Supervisor>,
}

impl AppState {
    pub fn new(config: Config, connector: Arc<dyn PlatformConnector>) -> Self {
        Self {
            supervisor: Arc::new(Supervisor::new(connector, &config)),
        }
    }

    /// Build state with the platform backend selected by `config`.
    pub fn from_config(config: Config) -> Self {
        let connector: Arc<dyn PlatformConnector> = match config.platform {
            PlatformKind::Discord => Arc::new(DiscordConnector::new(&config.discord_api_base)),
            PlatformKind::Memory => Arc::new(MemoryPlatform::demo()),
        };
        Self::new(config, connector)
    }
}
