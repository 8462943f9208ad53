//! Shared-secret authentication extractor for Axum handlers.

use axum::extract::FromRequestParts;
use axum::http::request::Parts;
use relay_core::error::CoreError;

use crate::config::ServerConfig;
use crate::error::AppError;
use crate::state::AppState;

/// Header callers put the shared secret in.
pub const API_KEY_HEADER: &str = "x-api-key";

/// Proof that the request carried the configured `X-API-Key`.
///
/// Always succeeds when no key is configured. Use it as an extractor
/// parameter on any protected handler:
///
/// ```ignore
/// async fn my_handler(_key: RequireApiKey) -> AppResult<Json<()>> {
///     Ok(Json(()))
/// }
/// ```
#[derive(Debug, Clone, Copy)]
pub struct RequireApiKey;

impl FromRequestParts<AppState> for RequireApiKey {
    type Rejection = AppError;

    async fn from_request_parts(
        parts: &mut Parts,
        state: &AppState,
    ) -> Result<Self, Self::Rejection> {
        let Some(expected) = state.config.api_key.as_deref() else {
            return Ok(RequireApiKey);
        };

        let provided = parts
            .headers
            .get(API_KEY_HEADER)
            .and_then(|v| v.to_str().ok())
            .ok_or_else(|| {
                AppError::Core(CoreError::Unauthorized("Missing X-API-Key header".into()))
            })?;

        if provided != expected {
            return Err(AppError::Core(CoreError::Forbidden(
                "Could not validate credentials".into(),
            )));
        }

        Ok(RequireApiKey)
    }
}

/// Check a key supplied outside the header (e.g. a WebSocket `token`
/// query parameter).
pub fn key_matches(config: &ServerConfig, provided: Option<&str>) -> bool {
    match config.api_key.as_deref() {
        None => true,
        Some(expected) => provided == Some(expected),
    }
}
