pub mod broadcasts;
pub mod health;
pub mod sessions;

use axum::Router;
use utoipa::openapi::security::{Http, HttpAuthScheme, SecurityScheme};
use utoipa::{Modify, OpenApi};

use crate::AppState;

pub fn router() -> Router<AppState> {
    Router::new().merge(health::router()).nest(
        "/api/v1",
        sessions::router().merge(broadcasts::router()),
    )
}

struct SecurityAddon;

impl Modify for SecurityAddon {
    fn modify(&self, openapi: &mut utoipa::openapi::OpenApi) {
        if let Some(components) = openapi.components.as_mut() {
            components.add_security_scheme(
                "bearer",
                SecurityScheme::Http(Http::new(HttpAuthScheme::Bearer)),
            );
        }
    }
}

#[derive(OpenApi)]
#[openapi(
    paths(
        // Health
        health::health,
        // Sessions
        sessions::connect,
        sessions::session_status,
        sessions::list_groups,
        // Broadcasts
        broadcasts::submit_broadcast,
        broadcasts::stop_broadcast,
        broadcasts::get_stats,
    ),
    components(
        schemas(
            // Error types
            crate::error::ApiErrorBody,
            crate::error::ApiErrorDetail,
            crate::error::FieldError,
            // Core types
            crate::supervisor::ConnectOutcome,
            crate::supervisor::GroupSummary,
            crate::supervisor::JobReceipt,
            crate::supervisor::StopReceipt,
            crate::supervisor::session::Readiness,
            crate::supervisor::stats::JobStats,
            crate::platform::RoleInfo,
            // Route request/response types
            health::HealthResponse,
            sessions::SessionStatusResponse,
            broadcasts::SubmitBroadcastRequest,
        )
    ),
    modifiers(&SecurityAddon),
    tags(
        (name = "Health", description = "Health check"),
        (name = "Sessions", description = "Platform sessions"),
        (name = "Broadcasts", description = "Broadcast jobs"),
    )
)]
pub struct ApiDoc;
