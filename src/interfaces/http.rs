//! HTTP trigger channel. `POST /trigger` starts a run; output goes to the
//! request's `callback_url` when one is given, otherwise to the log.

use anyhow::{Context, Result};
use async_trait::async_trait;
use axum::{
    Json, Router,
    extract::State,
    http::{HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    routing::{get, post},
};
use serde::Deserialize;
use serde_json::{Value, json};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::core::channel::{
    ChannelDefinition, ChannelEvent, ChannelSink, ConcurrencyPolicy, EventSender, ListenerHandle,
    StreamHandler,
};
use crate::core::config::{HttpChannelConfig, OutputConfig};
use crate::core::output::{BufferSettings, LogOnlyHandler, OutputBuffer, Verbosity};

#[derive(Debug, Deserialize)]
struct TriggerRequest {
    prompt: String,
    #[serde(default)]
    session: Option<String>,
    #[serde(default)]
    callback_url: Option<String>,
}

#[derive(Clone)]
struct AppState {
    events: EventSender,
    secret: Option<String>,
}

fn session_key_for(session: &str) -> String {
    format!("http:{}", session)
}

fn authorized(headers: &HeaderMap, secret: Option<&str>) -> bool {
    let Some(secret) = secret.filter(|s| !s.is_empty()) else {
        return true;
    };
    headers
        .get("authorization")
        .and_then(|v| v.to_str().ok())
        .and_then(|s| s.strip_prefix("Bearer "))
        .is_some_and(|token| constant_time_eq(token.as_bytes(), secret.as_bytes()))
}

/// Compares without an early exit on the first differing byte.
fn constant_time_eq(a: &[u8], b: &[u8]) -> bool {
    if a.len() != b.len() {
        return false;
    }
    a.iter()
        .zip(b.iter())
        .fold(0u8, |acc, (x, y)| acc | (x ^ y))
        == 0
}

async fn health() -> Json<Value> {
    Json(json!({ "status": "ok" }))
}

async fn trigger(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(req): Json<TriggerRequest>,
) -> Response {
    if !authorized(&headers, state.secret.as_deref()) {
        return (
            StatusCode::UNAUTHORIZED,
            Json(json!({ "error": "Missing or invalid Authorization header. Use: Bearer <secret>" })),
        )
            .into_response();
    }

    let prompt = req.prompt.trim();
    if prompt.is_empty() {
        return (
            StatusCode::BAD_REQUEST,
            Json(json!({ "error": "prompt must not be empty" })),
        )
            .into_response();
    }

    // A caller without a session id gets a fresh one per request.
    let session = req
        .session
        .as_deref()
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
        .unwrap_or_else(|| uuid::Uuid::new_v4().to_string());
    let payload = json!({
        "session": session,
        "callback_url": req.callback_url,
    });
    let session_key = state.events.session_key(&payload);

    if !state.events.emit(prompt, payload) {
        return (
            StatusCode::SERVICE_UNAVAILABLE,
            Json(json!({ "error": "router is shutting down" })),
        )
            .into_response();
    }
    info!("[http] Accepted trigger for {}", session_key);
    (
        StatusCode::ACCEPTED,
        Json(json!({ "status": "accepted", "session_key": session_key })),
    )
        .into_response()
}

fn build_router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/trigger", post(trigger))
        .with_state(state)
}

/// Posts every chunk, then a completion marker, to the caller's URL.
struct CallbackSink {
    client: reqwest::Client,
    url: String,
    session_key: String,
}

impl CallbackSink {
    async fn post(&self, body: Value) -> Result<()> {
        let res = self
            .client
            .post(&self.url)
            .json(&body)
            .send()
            .await
            .with_context(|| format!("posting to {}", self.url))?;
        if !res.status().is_success() {
            anyhow::bail!("callback {} answered {}", self.url, res.status());
        }
        Ok(())
    }
}

#[async_trait]
impl ChannelSink for CallbackSink {
    async fn send(&self, text: &str) -> Result<()> {
        self.post(json!({ "session_key": self.session_key, "text": text }))
            .await
    }

    async fn completed(&self, success: bool) {
        let body = json!({ "session_key": self.session_key, "done": true, "success": success });
        if let Err(e) = self.post(body).await {
            warn!("[http] Completion callback failed: {:#}", e);
        }
    }
}

pub struct HttpChannel {
    config: HttpChannelConfig,
    output: OutputConfig,
    client: reqwest::Client,
}

impl HttpChannel {
    pub fn new(config: HttpChannelConfig, output: OutputConfig) -> Self {
        Self {
            config,
            output,
            client: reqwest::Client::new(),
        }
    }
}

#[async_trait]
impl ChannelDefinition for HttpChannel {
    fn name(&self) -> &str {
        "http"
    }

    fn concurrency(&self) -> ConcurrencyPolicy {
        ConcurrencyPolicy::None
    }

    async fn start_listener(&self, events: EventSender) -> Result<ListenerHandle> {
        let addr = format!("{}:{}", self.config.host, self.config.port);
        let listener = tokio::net::TcpListener::bind(&addr)
            .await
            .with_context(|| format!("binding {}", addr))?;
        let app = build_router(AppState {
            events,
            secret: self.config.secret.clone(),
        });

        let token = CancellationToken::new();
        let stop = token.clone();
        info!("[http] Trigger endpoint at http://{}/trigger", addr);
        tokio::spawn(async move {
            let shutdown = async move { stop.cancelled().await };
            if let Err(e) = axum::serve(listener, app)
                .with_graceful_shutdown(shutdown)
                .await
            {
                error!("[http] Server crashed: {}", e);
            }
        });
        Ok(ListenerHandle::new(token))
    }

    fn create_handler(&self, event: &ChannelEvent, verbosity: Verbosity) -> Arc<dyn StreamHandler> {
        let callback = event
            .payload
            .get("callback_url")
            .and_then(Value::as_str)
            .filter(|u| !u.is_empty());
        match callback {
            Some(url) => Arc::new(OutputBuffer::new(
                Arc::new(CallbackSink {
                    client: self.client.clone(),
                    url: url.to_string(),
                    session_key: event.session_key.clone(),
                }),
                BufferSettings::from_config(&self.output, verbosity),
            )),
            None => Arc::new(LogOnlyHandler::new(event.session_key.clone())),
        }
    }

    fn session_key(&self, payload: &Value) -> String {
        let session = payload
            .get("session")
            .and_then(Value::as_str)
            .unwrap_or("default");
        session_key_for(session)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::Body;
    use axum::http::{Method, Request};
    use tokio::sync::mpsc;
    use tower::ServiceExt;

    type Received = mpsc::UnboundedReceiver<(String, ChannelEvent)>;

    fn app(secret: Option<&str>) -> (Router, Received) {
        let (tx, rx) = mpsc::unbounded_channel();
        let state = AppState {
            events: EventSender::new(
                Arc::new(HttpChannel::new(HttpChannelConfig::default(), OutputConfig::default())),
                tx,
            ),
            secret: secret.map(str::to_string),
        };
        (build_router(state), rx)
    }

    async fn send(app: Router, body: Value, auth: Option<&str>) -> (StatusCode, Value) {
        let mut req = Request::builder()
            .method(Method::POST)
            .uri("/trigger")
            .header("content-type", "application/json");
        if let Some(auth) = auth {
            req = req.header("authorization", auth);
        }
        let req = req
            .body(Body::from(serde_json::to_string(&body).unwrap()))
            .unwrap();
        let resp = app.oneshot(req).await.unwrap();
        let status = resp.status();
        let bytes = axum::body::to_bytes(resp.into_body(), 1024 * 1024)
            .await
            .unwrap();
        (status, serde_json::from_slice(&bytes).unwrap_or(json!({})))
    }

    #[tokio::test]
    async fn health_reports_ok() {
        let (app, _rx) = app(None);
        let req = Request::builder().uri("/health").body(Body::empty()).unwrap();
        let resp = app.oneshot(req).await.unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn trigger_emits_event_and_returns_session_key() {
        let (app, mut rx) = app(None);
        let (status, body) = send(
            app,
            json!({ "prompt": "  build report ", "session": "nightly", "callback_url": "http://127.0.0.1:9/cb" }),
            None,
        )
        .await;
        assert_eq!(status, StatusCode::ACCEPTED);
        assert_eq!(body["session_key"], "http:nightly");

        let (channel, event) = rx.recv().await.unwrap();
        assert_eq!(channel, "http");
        assert_eq!(event.session_key, "http:nightly");
        assert_eq!(event.prompt, "build report");
        assert_eq!(event.payload["callback_url"], "http://127.0.0.1:9/cb");

        let channel = HttpChannel::new(HttpChannelConfig::default(), OutputConfig::default());
        assert_eq!(channel.session_key(&event.payload), event.session_key);
    }

    #[tokio::test]
    async fn trigger_without_session_gets_a_generated_one() {
        let (app, mut rx) = app(None);
        let (status, body) = send(app, json!({ "prompt": "hi" }), None).await;
        assert_eq!(status, StatusCode::ACCEPTED);
        let key = body["session_key"].as_str().unwrap().to_string();
        assert!(key.starts_with("http:") && key.len() > "http:".len());
        let (_, event) = rx.recv().await.unwrap();
        assert_eq!(event.session_key, key);
    }

    #[tokio::test]
    async fn trigger_rejects_empty_prompt() {
        let (app, mut rx) = app(None);
        let (status, _) = send(app, json!({ "prompt": "   " }), None).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn trigger_requires_bearer_secret_when_configured() {
        let (app_a, _rx_a) = app(Some("s3cret"));
        let (status, _) = send(app_a, json!({ "prompt": "hi" }), None).await;
        assert_eq!(status, StatusCode::UNAUTHORIZED);

        let (app_b, _rx_b) = app(Some("s3cret"));
        let (status, _) = send(app_b, json!({ "prompt": "hi" }), Some("Bearer wrong")).await;
        assert_eq!(status, StatusCode::UNAUTHORIZED);

        let (app_c, _rx_c) = app(Some("s3cret"));
        let (status, _) = send(app_c, json!({ "prompt": "hi" }), Some("Bearer s3cret")).await;
        assert_eq!(status, StatusCode::ACCEPTED);
    }

    #[test]
    fn bearer_check_compares_whole_token() {
        assert!(constant_time_eq(b"s3cret", b"s3cret"));
        assert!(!constant_time_eq(b"s3cret", b"s3creT"));
        assert!(!constant_time_eq(b"s3cret", b"s3cret-longer"));
        assert!(!constant_time_eq(b"", b"s3cret"));

        let mut headers = HeaderMap::new();
        headers.insert("authorization", "Bearer s3cre".parse().unwrap());
        assert!(!authorized(&headers, Some("s3cret")));
        headers.insert("authorization", "Bearer s3cret".parse().unwrap());
        assert!(authorized(&headers, Some("s3cret")));
        assert!(authorized(&HeaderMap::new(), None));
    }

    #[tokio::test]
    async fn trigger_reports_unavailable_after_router_shutdown() {
        let (app, rx) = app(None);
        drop(rx);
        let (status, _) = send(app, json!({ "prompt": "hi" }), None).await;
        assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
    }
}
