//! HTTP front end of the metering proxy.
//!
//! # Usage
//!
//! ```rust,ignore
//! use gpt_meter::config::ProxyConfig;
//! use gpt_meter::proxy::ProxyServer;
//! use gpt_meter::store::SqliteStore;
//!
//! let config = ProxyConfig {
//!     api_key: Some("sk-...".to_string()),
//!     ..Default::default()
//! };
//! let store = SqliteStore::open("gpt-meter.db").await?;
//!
//! let server = ProxyServer::new(config, store)?;
//! server.run().await?;
//! ```

use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;

use axum::{
    body::{Body, Bytes},
    extract::{ConnectInfo, State},
    http::{HeaderMap, Method, Uri},
    response::{IntoResponse, Response},
    routing::{any, get},
    Json, Router,
};
use serde_json::json;
use tokio::net::TcpListener;
use tower_http::trace::TraceLayer;
use tracing::{field, Instrument};
use uuid::Uuid;

use super::attribution::bearer_key;
use super::relay::{relay, ClientSink, Meter};
use super::{Attribution, ProxyError, Upstream};
use crate::config::ProxyConfig;
use crate::error::{MeterError, Result};
use crate::store::SqliteStore;
use crate::tokenizer::{BpeTokenizers, TokenizerSource};

/// Shared proxy state
pub struct ProxyState {
    config: ProxyConfig,
    attribution: Attribution,
    store: SqliteStore,
    upstream: Upstream,
    tokenizers: Arc<dyn TokenizerSource>,
}

impl ProxyState {
    fn new(
        config: ProxyConfig,
        store: SqliteStore,
        tokenizers: Arc<dyn TokenizerSource>,
    ) -> Result<Self> {
        let api_key = config
            .api_key
            .as_deref()
            .filter(|k| !k.is_empty())
            .ok_or_else(|| {
                MeterError::Config("Upstream API key is not set (OPENAI_KEY)".to_string())
            })?;
        let upstream = Upstream::new(config.upstream_endpoint(), api_key, config.timeout())?;

        Ok(Self {
            attribution: Attribution::new(store.clone()),
            config,
            store,
            upstream,
            tokenizers,
        })
    }

    /// Active configuration
    pub fn config(&self) -> &ProxyConfig {
        &self.config
    }

    /// Usage ledger
    pub fn store(&self) -> &SqliteStore {
        &self.store
    }
}

/// Metering proxy server
pub struct ProxyServer {
    state: Arc<ProxyState>,
}

impl ProxyServer {
    /// Create a proxy metering with tiktoken encodings.
    ///
    /// Fails when no upstream API key is configured.
    pub fn new(config: ProxyConfig, store: SqliteStore) -> Result<Self> {
        Self::with_tokenizers(config, store, Arc::new(BpeTokenizers))
    }

    /// Create a proxy with a custom tokenizer source
    pub fn with_tokenizers(
        config: ProxyConfig,
        store: SqliteStore,
        tokenizers: Arc<dyn TokenizerSource>,
    ) -> Result<Self> {
        Ok(Self {
            state: Arc::new(ProxyState::new(config, store, tokenizers)?),
        })
    }

    /// Shared state
    pub fn state(&self) -> &ProxyState {
        &self.state
    }

    /// Get the router for the proxy
    pub fn router(&self) -> Router {
        Router::new()
            .route("/health", get(health_handler))
            .route(self.state.config.request_kind.path(), any(proxy_handler))
            .layer(TraceLayer::new_for_http())
            .with_state(self.state.clone())
    }

    /// Bind the configured address and serve until Ctrl-C.
    pub async fn run(&self) -> Result<()> {
        let addr = self.state.config.listen_addr()?;
        let listener = TcpListener::bind(addr)
            .await
            .map_err(|e| MeterError::Server(format!("Failed to bind {addr}: {e}")))?;

        self.serve(listener, shutdown_signal()).await
    }

    /// Serve on an already bound listener until `shutdown` resolves.
    pub async fn serve<F>(&self, listener: TcpListener, shutdown: F) -> Result<()>
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let addr = listener
            .local_addr()
            .map_err(|e| MeterError::Server(format!("Failed to get local address: {e}")))?;

        tracing::info!("gpt-meter listening on {}", addr);
        tracing::info!("Upstream: {}", self.state.upstream.endpoint());
        tracing::info!("Request kind: {}", self.state.config.request_kind);
        tracing::info!("Usage ledger: {}", self.state.store.path().display());

        axum::serve(
            listener,
            self.router()
                .into_make_service_with_connect_info::<SocketAddr>(),
        )
        .with_graceful_shutdown(shutdown)
        .await
        .map_err(|e| MeterError::Server(format!("Server error: {e}")))?;

        tracing::info!("gpt-meter stopped");
        Ok(())
    }
}

async fn shutdown_signal() {
    match tokio::signal::ctrl_c().await {
        Ok(()) => tracing::info!("Shutdown signal received"),
        Err(e) => tracing::error!("Failed to listen for shutdown signal: {}", e),
    }
}

// === Handlers ===

async fn health_handler(State(state): State<Arc<ProxyState>>) -> impl IntoResponse {
    Json(json!({
        "status": "ok",
        "version": env!("CARGO_PKG_VERSION"),
        "kind": state.config.request_kind,
    }))
}

/// Metered endpoint.
///
/// Rejections that need no storage happen inline. Everything else runs on a
/// detached task so that accounting survives the client going away; the
/// handler only waits for the response head.
async fn proxy_handler(
    State(state): State<Arc<ProxyState>>,
    connect_info: Option<ConnectInfo<SocketAddr>>,
    method: Method,
    uri: Uri,
    headers: HeaderMap,
    body: Body,
) -> Response {
    let remote = connect_info.map_or_else(|| "-".to_string(), |ConnectInfo(addr)| addr.to_string());

    if method != Method::POST {
        tracing::warn!(%remote, %method, "Rejected request method");
        return ProxyError::BadRequest(format!("method {method} is not allowed, use POST"))
            .into_response();
    }
    if uri.query().is_some_and(|q| !q.is_empty()) {
        tracing::warn!(%remote, "Rejected request with query parameters");
        return ProxyError::BadRequest("query parameters are not supported".to_string())
            .into_response();
    }

    // Keyless callers never get to make us buffer a body
    if bearer_key(&headers).is_empty() {
        tracing::warn!(%remote, "Rejected request without API key");
        return ProxyError::Unauthorized.into_response();
    }

    let body = match axum::body::to_bytes(body, state.config.max_body_size).await {
        Ok(body) => body,
        Err(e) => {
            return ProxyError::BadRequest(format!("failed to read request body: {e}"))
                .into_response()
        },
    };

    let span = tracing::info_span!(
        "call",
        request_id = %Uuid::new_v4(),
        %remote,
        user = field::Empty,
        project = field::Empty,
        model = field::Empty,
    );

    let (sink, head) = ClientSink::new();
    tokio::spawn(run_call(state, headers, body, sink).instrument(span));

    match head.await {
        Ok(response) => response,
        Err(_) => ProxyError::Internal("call ended without a response".to_string()).into_response(),
    }
}

async fn run_call(state: Arc<ProxyState>, headers: HeaderMap, body: Bytes, mut sink: ClientSink) {
    let deadline = state.config.timeout();

    let outcome = tokio::time::timeout(deadline, call(&state, &headers, body, &mut sink)).await;
    let err = match outcome {
        Ok(Ok(())) => return,
        Ok(Err(e)) => e,
        Err(_) => ProxyError::Gateway(format!(
            "upstream call exceeded {}s deadline",
            deadline.as_secs()
        )),
    };

    if err.status().is_server_error() {
        tracing::error!(status = %err.status(), "Call failed: {}", err);
    } else {
        tracing::warn!(status = %err.status(), "Call rejected: {}", err);
    }
    sink.fail(err).await;
}

async fn call(
    state: &ProxyState,
    headers: &HeaderMap,
    body: Bytes,
    sink: &mut ClientSink,
) -> std::result::Result<(), ProxyError> {
    let span = tracing::Span::current();

    let user = state.attribution.authenticate(headers).await?;
    span.record("user", user.name.as_str());

    let ctx = state.attribution.project(user, headers).await?;
    span.record("project", ctx.project.as_str());

    let request = state.config.request_kind.decode(&body)?;
    span.record("model", request.model.as_str());

    // Unsupported models are rejected before a model row exists
    let tokenizer = state.tokenizers.for_model(&request.model).ok_or_else(|| {
        ProxyError::BadRequest(format!("unsupported model: {}", request.model))
    })?;
    let model_id = state.attribution.model(&request.model).await?;

    tracing::info!(stream = request.stream, "Forwarding request");
    let response = state.upstream.forward(headers, body).await?;

    let meter = Meter::new(state.store.clone(), model_id, ctx.project_id);
    relay(response, &request, tokenizer, sink, &meter).await
}
