//! Operator credential extraction.

use axum::extract::FromRequestParts;
use axum::http::header::AUTHORIZATION;
use axum::http::request::Parts;

use crate::error::ApiError;
use crate::supervisor::credential::Credential;
use crate::AppState;

/// Platform credential extracted from the `Authorization: Bearer <credential>` header.
///
/// Holding a credential is the only operator check; the credential also
/// selects which supervised session a request acts on.
#[derive(Debug, Clone)]
pub struct OperatorCredential(pub Credential);

impl FromRequestParts<AppState> for OperatorCredential {
    type Rejection = ApiError;

    async fn from_request_parts(
        parts: &mut Parts,
        _state: &AppState,
    ) -> Result<Self, Self::Rejection> {
        let header = parts
            .headers
            .get(AUTHORIZATION)
            .and_then(|v| v.to_str().ok())
            .ok_or_else(|| ApiError::unauthorized("Missing Authorization header"))?;

        let raw = header
            .strip_prefix("Bearer ")
            .ok_or_else(|| ApiError::unauthorized("Invalid Authorization header format"))?;

        Credential::new(raw)
            .map(OperatorCredential)
            .ok_or_else(|| ApiError::unauthorized("Empty credential"))
    }
}
