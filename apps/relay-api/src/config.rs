use std::time::Duration;

/// Which platform backend sessions authenticate against.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PlatformKind {
    /// Discord HTTP API.
    Discord,
    /// In-memory demo platform, for local runs without real credentials.
    Memory,
}

/// Relay API configuration, loaded from environment variables.
#[derive(Debug, Clone)]
pub struct Config {
    /// Port the HTTP server binds to.
    pub port: u16,
    pub platform: PlatformKind,
    /// Base URL of the Discord HTTP API.
    pub discord_api_base: String,
    /// How often the dispatcher drains session job queues.
    pub dispatch_interval: Duration,
    /// Readiness checks a Connect request makes before reporting failure.
    pub connect_poll_attempts: u32,
    pub connect_poll_interval: Duration,
    /// Upper bound on a session's authenticate + initial group sync.
    pub connect_timeout: Duration,
    /// Upper bound on a single direct-message send.
    pub send_timeout: Duration,
    /// Per-recipient pause used when a job does not specify one.
    pub default_delay: Duration,
    /// How long shutdown waits for running jobs to wind down.
    pub shutdown_grace: Duration,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            port: 4010,
            platform: PlatformKind::Discord,
            discord_api_base: "https://discord.com/api/v10".to_string(),
            dispatch_interval: Duration::from_millis(500),
            connect_poll_attempts: 20,
            connect_poll_interval: Duration::from_secs(1),
            connect_timeout: Duration::from_secs(20),
            send_timeout: Duration::from_secs(30),
            default_delay: Duration::from_millis(500),
            shutdown_grace: Duration::from_secs(10),
        }
    }
}

impl Config {
    /// Load configuration from environment variables, falling back to the
    /// defaults for anything unset or unparsable.
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            port: parsed_var("PORT").unwrap_or(defaults.port),
            platform: match std::env::var("PLATFORM").ok().as_deref() {
                Some("memory") => PlatformKind::Memory,
                _ => PlatformKind::Discord,
            },
            discord_api_base: std::env::var("DISCORD_API_BASE")
                .ok()
                .filter(|s| !s.is_empty())
                .unwrap_or(defaults.discord_api_base),
            dispatch_interval: parsed_var("DISPATCH_INTERVAL_MS")
                .map(Duration::from_millis)
                .unwrap_or(defaults.dispatch_interval),
            connect_poll_attempts: parsed_var("CONNECT_POLL_ATTEMPTS")
                .unwrap_or(defaults.connect_poll_attempts),
            connect_poll_interval: parsed_var("CONNECT_POLL_INTERVAL_MS")
                .map(Duration::from_millis)
                .unwrap_or(defaults.connect_poll_interval),
            connect_timeout: parsed_var("CONNECT_TIMEOUT_SECS")
                .map(Duration::from_secs)
                .unwrap_or(defaults.connect_timeout),
            send_timeout: parsed_var("SEND_TIMEOUT_SECS")
                .map(Duration::from_secs)
                .unwrap_or(defaults.send_timeout),
            default_delay: parsed_var::<f64>("DEFAULT_DELAY_SECS")
                .and_then(|s| Duration::try_from_secs_f64(s).ok())
                .unwrap_or(defaults.default_delay),
            shutdown_grace: parsed_var("SHUTDOWN_GRACE_SECS")
                .map(Duration::from_secs)
                .unwrap_or(defaults.shutdown_grace),
        }
    }

    /// Total time a Connect request waits for the session to become ready.
    pub fn connect_wait(&self) -> Duration {
        self.connect_poll_interval * self.connect_poll_attempts
    }
}

fn parsed_var<T: std::str::FromStr>(name: &str) -> Option<T> {
    std::env::var(name).ok().and_then(|v| v.trim().parse().ok())
}
