use relay_common::Snowflake;

use crate::platform::PlatformError;

/// Errors surfaced by the supervisor core.
///
/// Per-recipient send failures are never errors; they are counted in the
/// job's stats.
#[derive(Debug, thiserror::Error)]
pub enum SupervisorError {
    #[error("connection failed: {0}")]
    Auth(#[source] PlatformError),
    #[error("session is not ready")]
    SessionNotReady,
    #[error("group {0} not found")]
    GroupNotFound(Snowflake),
    #[error("invalid job: {field} {message}")]
    InvalidJob {
        field: &'static str,
        message: String,
    },
    #[error(transparent)]
    Platform(#[from] PlatformError),
}
