use std::panic::AssertUnwindSafe;
use std::sync::Arc;

use anyhow::Result;
use axum::body::Bytes;
use axum::extract::State;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router, middleware};
use futures_util::FutureExt;
use serde_json::Value;
use tracing::{debug, info, warn};

mod aggregate;
mod auth;
mod stream;

use crate::config::ProxyConfig;
use crate::credentials::CredentialRotator;
use crate::error::ProxyError;
use crate::logging::{http_debug_options, make_body_preview};
use crate::models::ModelCatalog;
use crate::obfuscate;
use crate::openai::{ChatRequest, new_completion_id, unix_now};
use crate::upstream::{UpstreamClient, UpstreamPayload};

use self::aggregate::aggregate;
use self::stream::{StreamContext, chat_frames, sse_response};

pub const APP_NAME: &str = "sense-proxy";

/// Shared, cheaply clonable state behind every route.
#[derive(Clone)]
pub struct ProxyService {
    upstream: UpstreamClient,
    rotator: CredentialRotator,
    catalog: Arc<ModelCatalog>,
    master_key: Option<Arc<str>>,
}

impl ProxyService {
    pub fn new(
        upstream: UpstreamClient,
        rotator: CredentialRotator,
        catalog: ModelCatalog,
        master_key: Option<String>,
    ) -> Self {
        Self {
            upstream,
            rotator,
            catalog: Arc::new(catalog),
            master_key: master_key.map(Arc::from),
        }
    }

    pub fn from_config(cfg: &ProxyConfig) -> Result<Self> {
        Ok(Self::new(
            UpstreamClient::from_settings(&cfg.upstream)?,
            CredentialRotator::from_config(&cfg.credentials),
            ModelCatalog::new(cfg.model_mapping.clone()),
            cfg.auth.effective_master_key().map(str::to_string),
        ))
    }

    pub fn master_key(&self) -> Option<&str> {
        self.master_key.as_deref()
    }

    pub fn rotator(&self) -> &CredentialRotator {
        &self.rotator
    }

    /// Validate, rotate credentials, prime the upstream session and dispatch
    /// to the streaming or aggregated path.
    async fn handle_chat(&self, body: Bytes) -> Result<Response, ProxyError> {
        let value: Value = serde_json::from_slice(&body)
            .map_err(|e| ProxyError::InvalidRequest(format!("Invalid JSON body: {e}")))?;
        let request = ChatRequest::from_value(&value)?;

        let creds = self.rotator.next()?;
        let priming_headers = self.upstream.headers(&creds)?;
        self.upstream.prime(&priming_headers).await;

        let model_id = self.catalog.resolve(&request.model);
        let payload = UpstreamPayload::new(model_id, request.messages);
        info!(
            "new conversation session_id={} model={} upstream_model={} credential={} stream={}",
            payload.session_id, request.model, payload.model_id, creds.index, request.stream
        );

        let encoded = obfuscate::encode(&payload)
            .map_err(|e| ProxyError::Internal(format!("failed to encode upstream payload: {e}")))?;
        let debug_opt = http_debug_options();
        if debug_opt.enabled {
            // Log what the upstream will see once it strips the envelope.
            match obfuscate::decode(&encoded) {
                Ok(plain) => debug!(
                    "upstream payload: {}",
                    make_body_preview(plain.as_bytes(), debug_opt.max_body_bytes)
                ),
                Err(err) => warn!("obfuscated payload does not decode: {}", err),
            }
            debug!(
                "obfuscated payload: {}",
                make_body_preview(encoded.as_bytes(), debug_opt.max_body_bytes)
            );
        }

        let ctx = StreamContext {
            completion_id: new_completion_id(),
            model: request.model.clone(),
        };
        let chat_headers = self.upstream.headers(&creds)?;
        let frames = chat_frames(
            self.upstream.clone(),
            chat_headers,
            obfuscate::wrap(encoded),
            ctx,
        );

        if request.stream {
            Ok(sse_response(frames))
        } else {
            let completion = aggregate(frames, &request.model).await;
            Ok(Json(completion).into_response())
        }
    }
}

fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "handler panicked".to_string()
    }
}

/// Run a handler future, turning a panic into a structured 500.
async fn guarded<F>(handler: F) -> Response
where
    F: Future<Output = Result<Response, ProxyError>>,
{
    match AssertUnwindSafe(handler).catch_unwind().await {
        Ok(Ok(resp)) => resp,
        Ok(Err(err)) => err.into_response(),
        Err(panic) => ProxyError::Internal(panic_message(panic.as_ref())).into_response(),
    }
}

async fn chat_completions(State(proxy): State<ProxyService>, body: Bytes) -> Response {
    guarded(proxy.handle_chat(body)).await
}

async fn list_models(State(proxy): State<ProxyService>) -> impl IntoResponse {
    Json(proxy.catalog.list(unix_now()))
}

async fn root() -> impl IntoResponse {
    Json(serde_json::json!({
        "message": format!("Welcome to {APP_NAME}"),
        "version": env!("CARGO_PKG_VERSION"),
    }))
}

pub fn router(proxy: ProxyService) -> Router {
    let protected = Router::new()
        .route("/v1/chat/completions", post(chat_completions))
        .route("/v1/models", get(list_models))
        .route_layer(middleware::from_fn_with_state(
            proxy.clone(),
            auth::require_master_key,
        ));

    Router::new()
        .route("/", get(root))
        .merge(protected)
        .with_state(proxy)
}
