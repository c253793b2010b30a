use axum::extract::{Request, State};
use axum::http::HeaderMap;
use axum::http::header::AUTHORIZATION;
use axum::middleware::Next;
use axum::response::Response;

use crate::error::ProxyError;

use super::ProxyService;

/// Check `Authorization: Bearer <key>` against the configured master key.
/// With no key configured every request passes.
pub(super) fn check_bearer(
    master_key: Option<&str>,
    headers: &HeaderMap,
) -> Result<(), ProxyError> {
    let Some(expected) = master_key else {
        return Ok(());
    };

    let Some(raw) = headers.get(AUTHORIZATION) else {
        return Err(ProxyError::Unauthorized(
            "Unauthorized: Missing Authorization header.".to_string(),
        ));
    };

    let malformed = || {
        ProxyError::Unauthorized(
            "Invalid authentication scheme. Use 'Bearer <your_api_key>'.".to_string(),
        )
    };
    let value = raw.to_str().map_err(|_| malformed())?;
    let mut parts = value.split_whitespace();
    let (Some(scheme), Some(token), None) = (parts.next(), parts.next(), parts.next()) else {
        return Err(malformed());
    };
    if !scheme.eq_ignore_ascii_case("bearer") {
        return Err(malformed());
    }

    if token != expected {
        return Err(ProxyError::Forbidden("Forbidden: Invalid API Key.".to_string()));
    }
    Ok(())
}

pub(super) async fn require_master_key(
    State(proxy): State<ProxyService>,
    req: Request,
    next: Next,
) -> Result<Response, ProxyError> {
    check_bearer(proxy.master_key(), req.headers())?;
    Ok(next.run(req).await)
}
