//! HTTP plumbing towards the SenseChat web API: endpoints, the browser-like
//! header set, session priming and the chat call itself.

use std::time::Duration;

use anyhow::Result;
use axum::http::{HeaderMap, HeaderName, HeaderValue, StatusCode};
use reqwest::Client;
use serde::Serialize;
use serde_json::Value;
use tracing::{debug, info, warn};

use crate::config::UpstreamSettings;
use crate::credentials::CredentialPair;
use crate::error::ProxyError;
use crate::openai::ChatMessage;

pub const GUIDANCE_PATH: &str =
    "/api/richmodal/v1.0.2/guidance/query?client_chan=chatOnCom&channel=chat-web";
pub const LIVE_PATH: &str = "/api/auth/v2.1.0/live";
pub const WATERMARK_PATH: &str = "/api/auth/v2.1.0/watermark";
pub const CHAT_PATH: &str = "/api/richmodal/v1.0.2/chat";

const USER_AGENT: &str = "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/140.0.0.0 Safari/537.36";
const ORIGIN: &str = "https://chat.sensetime.com";
const REFERER: &str = "https://chat.sensetime.com/";

/// Warm-up calls issued before every chat request, in this order.
const PRIMING_STEPS: [(&str, &str); 3] = [
    ("guidance", GUIDANCE_PATH),
    ("live", LIVE_PATH),
    ("watermark", WATERMARK_PATH),
];

/// Plain chat body, before obfuscation. Field order is the wire order.
#[derive(Debug, Clone, Serialize)]
pub struct UpstreamPayload {
    pub model_id: String,
    pub stream: bool,
    pub session_id: String,
    pub messages: Vec<ChatMessage>,
}

impl UpstreamPayload {
    /// Full history under a fresh session id; nothing is kept upstream-side
    /// between requests.
    pub fn new(model_id: String, messages: Vec<ChatMessage>) -> Self {
        Self {
            model_id,
            stream: true,
            session_id: uuid::Uuid::new_v4().to_string(),
            messages,
        }
    }
}

#[derive(Clone)]
pub struct UpstreamClient {
    client: Client,
    base_url: String,
}

impl UpstreamClient {
    pub fn new(client: Client, base_url: impl Into<String>) -> Self {
        let base_url = base_url.into().trim_end_matches('/').to_string();
        Self { client, base_url }
    }

    /// One pooled client for the whole process; `read_timeout` bounds each
    /// wait on a slow stream rather than the stream's total length.
    pub fn from_settings(settings: &UpstreamSettings) -> Result<Self> {
        let client = Client::builder()
            .connect_timeout(Duration::from_secs(settings.connect_timeout_secs))
            .read_timeout(Duration::from_secs(settings.timeout_secs))
            .build()?;
        Ok(Self::new(client, settings.base_url.clone()))
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }

    /// Header set for one logical request; every call gets a fresh
    /// `x-request-id`. Accept-Encoding is left to reqwest so that it can
    /// decompress what it advertises.
    pub fn headers(&self, creds: &CredentialPair) -> Result<HeaderMap, ProxyError> {
        fn value(name: &str, v: &str) -> Result<HeaderValue, ProxyError> {
            HeaderValue::from_str(v).map_err(|_| {
                ProxyError::Configuration(format!(
                    "credential value for header '{name}' contains invalid characters"
                ))
            })
        }

        let mut headers = HeaderMap::new();
        headers.insert(
            axum::http::header::AUTHORIZATION,
            value("authorization", &format!("Bearer {}", creds.auth_token))?,
        );
        headers.insert(axum::http::header::COOKIE, value("cookie", &creds.cookie)?);
        let fixed = [
            ("content-type", "application/json;charset=UTF-8"),
            ("accept", "application/json, text/plain, */*"),
            ("accept-language", "zh-CN,zh;q=0.9,en;q=0.8"),
            ("user-agent", USER_AGENT),
            ("origin", ORIGIN),
            ("referer", REFERER),
            ("system-type", "web"),
        ];
        for (name, v) in fixed {
            headers.insert(HeaderName::from_static(name), HeaderValue::from_static(v));
        }
        let request_id = uuid::Uuid::new_v4().to_string();
        headers.insert(
            HeaderName::from_static("x-request-id"),
            value("x-request-id", &request_id)?,
        );
        Ok(headers)
    }

    async fn prime_step(&self, path: &str, headers: &HeaderMap) -> reqwest::Result<StatusCode> {
        let resp = self
            .client
            .get(self.url(path))
            .headers(headers.clone())
            .send()
            .await?;
        Ok(resp.status())
    }

    /// Replay the browser's navigation calls. Failures are logged and
    /// swallowed; the chat request proceeds either way.
    pub async fn prime(&self, headers: &HeaderMap) {
        for (name, path) in PRIMING_STEPS {
            info!("priming session: /{}", name);
            match self.prime_step(path, headers).await {
                Ok(status) if status.is_success() => {
                    debug!("priming /{} ok ({})", name, status);
                }
                Ok(status) => warn!("priming /{} returned status {}", name, status),
                Err(err) => warn!("priming /{} failed: {}", name, err),
            }
        }
    }

    /// Open the streaming chat call with an already wrapped body.
    pub async fn open_chat(
        &self,
        headers: HeaderMap,
        body: &Value,
    ) -> reqwest::Result<reqwest::Response> {
        self.client
            .post(self.url(CHAT_PATH))
            .headers(headers)
            .json(body)
            .send()
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use std::sync::{Arc, Mutex};

    use axum::extract::OriginalUri;
    use pretty_assertions::assert_eq;

    fn creds() -> CredentialPair {
        CredentialPair {
            index: 0,
            auth_token: "tok".to_string(),
            cookie: "sid=1".to_string(),
        }
    }

    #[test]
    fn headers_carry_credentials_and_browser_identity() {
        let up = UpstreamClient::new(Client::new(), "http://example.test/");
        assert_eq!(up.base_url(), "http://example.test");

        let h = up.headers(&creds()).expect("headers");
        assert_eq!(h.get("authorization").unwrap(), "Bearer tok");
        assert_eq!(h.get("cookie").unwrap(), "sid=1");
        assert_eq!(h.get("origin").unwrap(), ORIGIN);
        assert_eq!(h.get("system-type").unwrap(), "web");
        assert!(h.get("accept-encoding").is_none());

        let h2 = up.headers(&creds()).expect("headers");
        assert_ne!(h.get("x-request-id"), h2.get("x-request-id"));
    }

    #[test]
    fn invalid_credential_is_configuration_error() {
        let up = UpstreamClient::new(Client::new(), "http://example.test");
        let mut bad = creds();
        bad.cookie = "line\nbreak".to_string();
        assert!(matches!(
            up.headers(&bad),
            Err(ProxyError::Configuration(_))
        ));
    }

    #[tokio::test]
    async fn prime_hits_endpoints_in_order_and_ignores_failures() {
        let seen = Arc::new(Mutex::new(Vec::<String>::new()));
        let record = {
            let seen = seen.clone();
            move |OriginalUri(uri): OriginalUri| {
                let seen = seen.clone();
                async move {
                    seen.lock().unwrap().push(uri.path().to_string());
                    if uri.path().ends_with("/live") {
                        StatusCode::INTERNAL_SERVER_ERROR
                    } else {
                        StatusCode::OK
                    }
                }
            }
        };
        let app = axum::Router::new().fallback(record);
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
            .await
            .expect("bind");
        let addr = listener.local_addr().expect("addr");
        let handle = tokio::spawn(async move {
            axum::serve(listener, app).await.expect("serve");
        });

        let up = UpstreamClient::new(Client::new(), format!("http://{addr}"));
        let headers = up.headers(&creds()).expect("headers");
        up.prime(&headers).await;

        assert_eq!(
            *seen.lock().unwrap(),
            vec![
                "/api/richmodal/v1.0.2/guidance/query",
                "/api/auth/v2.1.0/live",
                "/api/auth/v2.1.0/watermark",
            ]
        );
        handle.abort();
    }

    #[tokio::test]
    async fn prime_survives_unreachable_upstream() {
        // Port 9 on localhost is almost never listening; connection refused.
        let up = UpstreamClient::new(Client::new(), "http://127.0.0.1:9");
        let headers = up.headers(&creds()).expect("headers");
        up.prime(&headers).await;
    }
}
