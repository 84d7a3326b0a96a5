// PoW Proxy - Ethereum JSON-RPC relay
// Copyright (C) 2024 Zhuo Zhang and Wuqi Zhang
//
// This program is free software: you can redistribute it and/or modify
// it under the terms of the GNU Affero General Public License as published by
// the Free Software Foundation, either version 3 of the License, or
// (at your option) any later version.
//
// This program is distributed in the hope that it will be useful,
// but WITHOUT ANY WARRANTY; without even the implied warranty of
// MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE. See the
// GNU Affero General Public License for more details.
//
// You should have received a copy of the GNU Affero General Public License
// along with this program. If not, see <https://www.gnu.org/licenses/>.

//! HTTP relay
//!
//! Every request accepted on the local port is forwarded, as-is, to the
//! resolved upstream with a single HTTP call and the upstream's answer is
//! copied back. The relay never parses the JSON-RPC payload on the success
//! path. When the upstream cannot be reached the caller still receives a
//! well-formed JSON-RPC error envelope.

use crate::providers::ResolvedEndpoint;
use axum::{
    body::{to_bytes, Bytes},
    extract::{Request, State},
    http::{header, HeaderMap, HeaderName, Method, StatusCode},
    response::{IntoResponse, Json, Response},
    Router,
};
use eyre::{Result, WrapErr};
use serde::Serialize;
use serde_json::Value;
use std::{future::Future, net::SocketAddr, sync::Arc, time::Duration};
use tokio::net::TcpListener;
use tower_http::trace::TraceLayer;
use tracing::{debug, info, warn};

/// Headers that only apply to a single transport hop and must not be relayed
static HOP_BY_HOP_HEADERS: [HeaderName; 8] = [
    header::CONNECTION,
    HeaderName::from_static("keep-alive"),
    header::PROXY_AUTHENTICATE,
    header::PROXY_AUTHORIZATION,
    header::TE,
    header::TRAILER,
    header::TRANSFER_ENCODING,
    header::UPGRADE,
];

/// JSON-RPC error codes used in synthesized responses
pub mod error_codes {
    /// Invalid request - the body could not be accepted
    pub const INVALID_REQUEST: i32 = -32600;
    /// Internal error - the upstream could not be reached
    pub const INTERNAL_ERROR: i32 = -32603;
}

/// JSON-RPC 2.0 error object
#[derive(Debug, Serialize)]
pub struct RpcError {
    /// Numeric error code indicating the error type
    pub code: i32,
    /// Human-readable error message
    pub message: String,
}

/// JSON-RPC 2.0 error response synthesized by the relay
#[derive(Debug, Serialize)]
pub struct RpcErrorResponse {
    /// JSON-RPC version (always "2.0")
    pub jsonrpc: &'static str,
    /// Error details
    pub error: RpcError,
    /// Identifier of the failed request, or null when it cannot be recovered
    pub id: Value,
}

impl RpcErrorResponse {
    /// Create an error response for the request with the given `id`
    pub fn new(id: Value, code: i32, message: impl Into<String>) -> Self {
        Self { jsonrpc: "2.0", error: RpcError { code, message: message.into() }, id }
    }

    /// Pair the envelope with an HTTP status
    pub fn with_status(self, status: StatusCode) -> Response {
        (status, Json(self)).into_response()
    }
}

/// Why a forwarded request produced no upstream response
#[derive(Debug, thiserror::Error)]
pub enum ForwardError {
    /// The per-request timeout elapsed
    #[error("upstream request timed out after {0:?}")]
    Timeout(Duration),
    /// Connection refused, DNS failure, TLS failure and the like
    #[error("upstream unreachable: {0}")]
    Unreachable(String),
    /// The upstream answered but its body could not be read
    #[error("failed to read upstream response: {0}")]
    Body(String),
}

/// The upstream's answer, copied back to the local caller unchanged
#[derive(Debug)]
pub struct UpstreamResponse {
    /// Upstream status code
    pub status: StatusCode,
    /// Upstream headers with hop-by-hop headers removed
    pub headers: HeaderMap,
    /// Upstream body bytes
    pub body: Bytes,
}

impl IntoResponse for UpstreamResponse {
    fn into_response(self) -> Response {
        (self.status, self.headers, self.body).into_response()
    }
}

/// Performs the single upstream round trip for each relayed request
///
/// Holds one pooled [`reqwest::Client`] and the immutable upstream endpoint;
/// no other state is shared between requests.
pub struct RpcForwarder {
    client: reqwest::Client,
    endpoint: ResolvedEndpoint,
    timeout: Duration,
}

impl RpcForwarder {
    /// Creates a forwarder for `endpoint` that gives up after `timeout`
    pub fn new(endpoint: ResolvedEndpoint, timeout: Duration) -> Result<Self> {
        let client = reqwest::Client::builder().timeout(timeout).build()?;
        Ok(Self { client, endpoint, timeout })
    }

    /// The upstream this forwarder talks to
    pub fn endpoint(&self) -> &ResolvedEndpoint {
        &self.endpoint
    }

    /// Forward one request verbatim and collect the upstream's answer
    pub async fn forward(
        &self,
        method: Method,
        headers: &HeaderMap,
        body: Bytes,
    ) -> Result<UpstreamResponse, ForwardError> {
        let response = self
            .client
            .request(method, self.endpoint.as_str())
            .headers(strip_hop_by_hop(headers))
            .body(body)
            .send()
            .await
            .map_err(|e| self.classify(e))?;

        let status = response.status();
        let headers = strip_hop_by_hop(response.headers());
        let body = response.bytes().await.map_err(|e| {
            if e.is_timeout() {
                ForwardError::Timeout(self.timeout)
            } else {
                ForwardError::Body(e.to_string())
            }
        })?;

        Ok(UpstreamResponse { status, headers, body })
    }

    fn classify(&self, err: reqwest::Error) -> ForwardError {
        if err.is_timeout() {
            return ForwardError::Timeout(self.timeout);
        }
        // reqwest embeds the full URL in its message; keep credentials out of responses
        ForwardError::Unreachable(err.without_url().to_string())
    }
}

/// Copy `headers`, dropping hop-by-hop headers, any header listed in
/// `Connection`, and the headers the HTTP client regenerates itself
pub fn strip_hop_by_hop(headers: &HeaderMap) -> HeaderMap {
    let mut forwarded = headers.clone();

    for value in headers.get_all(header::CONNECTION) {
        if let Ok(value) = value.to_str() {
            for name in value.split(',').map(str::trim).filter(|n| !n.is_empty()) {
                if let Ok(name) = HeaderName::from_bytes(name.as_bytes()) {
                    forwarded.remove(name);
                }
            }
        }
    }

    for name in &HOP_BY_HOP_HEADERS {
        forwarded.remove(name);
    }
    forwarded.remove(header::HOST);
    forwarded.remove(header::CONTENT_LENGTH);

    forwarded
}

/// Best-effort recovery of the JSON-RPC `id` for error envelopes
///
/// Only called on failure paths. Batches and non-JSON bodies yield `null`.
pub fn request_id(body: &[u8]) -> Value {
    serde_json::from_slice::<Value>(body)
        .ok()
        .and_then(|request| request.get("id").cloned())
        .unwrap_or(Value::Null)
}

#[derive(Clone)]
struct AppState {
    forwarder: Arc<RpcForwarder>,
    max_body_size: usize,
}

/// HTTP relay bound to a local port
///
/// ```no_run
/// # use pow_proxy::{config::{ProxyConfig, Transport}, providers, rpc::HttpRelay};
/// # async fn example(config: ProxyConfig) -> eyre::Result<()> {
/// let endpoint = providers::resolve(&config, Transport::Http)?;
/// let relay = HttpRelay::bind(
///     "127.0.0.1:8545".parse()?,
///     endpoint,
///     config.request_timeout,
///     config.max_body_size,
/// )
/// .await?;
/// relay.serve(std::future::pending()).await?;
/// # Ok(())
/// # }
/// ```
pub struct HttpRelay {
    listener: TcpListener,
    state: AppState,
}

impl HttpRelay {
    /// Bind the local listener; failures here are fatal for the transport
    pub async fn bind(
        addr: SocketAddr,
        endpoint: ResolvedEndpoint,
        timeout: Duration,
        max_body_size: usize,
    ) -> Result<Self> {
        let forwarder = Arc::new(RpcForwarder::new(endpoint, timeout)?);
        let listener = TcpListener::bind(addr)
            .await
            .wrap_err_with(|| format!("failed to bind HTTP relay on {addr}"))?;

        Ok(Self { listener, state: AppState { forwarder, max_body_size } })
    }

    /// Address the listener is bound to
    pub fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.listener.local_addr()?)
    }

    /// Serve requests until `shutdown` completes
    ///
    /// Individual request failures never stop the listener.
    pub async fn serve<F>(self, shutdown: F) -> Result<()>
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let addr = self.local_addr()?;
        info!(
            %addr,
            upstream = %self.state.forwarder.endpoint().redacted(),
            "HTTP relay listening"
        );

        let app = Router::new()
            .fallback(relay_request)
            .layer(TraceLayer::new_for_http())
            .with_state(self.state);

        axum::serve(self.listener, app).with_graceful_shutdown(shutdown).await?;

        info!(%addr, "HTTP relay stopped");
        Ok(())
    }
}

async fn relay_request(State(state): State<AppState>, request: Request) -> Response {
    let (parts, body) = request.into_parts();

    let declared_length = parts
        .headers
        .get(header::CONTENT_LENGTH)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.parse::<usize>().ok());
    if declared_length.is_some_and(|len| len > state.max_body_size) {
        warn!(limit = state.max_body_size, "Rejected oversized request body");
        return RpcErrorResponse::new(
            Value::Null,
            error_codes::INVALID_REQUEST,
            format!("request body exceeds {} bytes", state.max_body_size),
        )
        .with_status(StatusCode::PAYLOAD_TOO_LARGE);
    }

    let body = match to_bytes(body, state.max_body_size).await {
        Ok(body) => body,
        Err(e) => {
            warn!("Failed to read request body: {}", e);
            return RpcErrorResponse::new(
                Value::Null,
                error_codes::INVALID_REQUEST,
                format!("failed to read request body: {e}"),
            )
            .with_status(StatusCode::BAD_REQUEST);
        }
    };

    debug!(method = %parts.method, bytes = body.len(), "Relaying request");

    match state.forwarder.forward(parts.method, &parts.headers, body.clone()).await {
        Ok(response) => {
            debug!(status = %response.status, bytes = response.body.len(), "Upstream responded");
            response.into_response()
        }
        Err(e) => {
            warn!("Upstream request failed: {}", e);
            RpcErrorResponse::new(request_id(&body), error_codes::INTERNAL_ERROR, e.to_string())
                .with_status(StatusCode::BAD_GATEWAY)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::HeaderValue;
    use serde_json::json;

    #[test]
    fn test_strip_hop_by_hop_headers() {
        let mut headers = HeaderMap::new();
        headers.insert(header::CONTENT_TYPE, HeaderValue::from_static("application/json"));
        headers.insert(header::AUTHORIZATION, HeaderValue::from_static("Bearer token"));
        headers.insert(header::CONNECTION, HeaderValue::from_static("keep-alive, x-session"));
        headers.insert("keep-alive", HeaderValue::from_static("timeout=5"));
        headers.insert("x-session", HeaderValue::from_static("abc"));
        headers.insert(header::TRANSFER_ENCODING, HeaderValue::from_static("chunked"));
        headers.insert(header::UPGRADE, HeaderValue::from_static("websocket"));
        headers.insert(header::HOST, HeaderValue::from_static("127.0.0.1:8545"));
        headers.insert(header::CONTENT_LENGTH, HeaderValue::from_static("42"));

        let forwarded = strip_hop_by_hop(&headers);

        assert_eq!(forwarded.len(), 2);
        assert_eq!(forwarded[header::CONTENT_TYPE], "application/json");
        assert_eq!(forwarded[header::AUTHORIZATION], "Bearer token");
    }

    #[test]
    fn test_every_hop_by_hop_header_is_stripped() {
        for name in &HOP_BY_HOP_HEADERS {
            let mut headers = HeaderMap::new();
            headers.insert(name.clone(), HeaderValue::from_static("x"));
            headers.insert(header::ACCEPT, HeaderValue::from_static("*/*"));

            let forwarded = strip_hop_by_hop(&headers);
            assert!(!forwarded.contains_key(name), "{name} was relayed");
            assert_eq!(forwarded[header::ACCEPT], "*/*");
        }
    }

    #[test]
    fn test_request_id_recovery() {
        assert_eq!(request_id(br#"{"jsonrpc":"2.0","id":7,"method":"eth_chainId"}"#), json!(7));
        assert_eq!(request_id(br#"{"jsonrpc":"2.0","id":"a","method":"x"}"#), json!("a"));
        assert_eq!(request_id(br#"[{"jsonrpc":"2.0","id":1,"method":"x"}]"#), Value::Null);
        assert_eq!(request_id(b"not json"), Value::Null);
        assert_eq!(request_id(b""), Value::Null);
    }

    #[test]
    fn test_error_envelope_shape() {
        let envelope =
            RpcErrorResponse::new(json!(3), error_codes::INTERNAL_ERROR, "upstream unreachable");
        let value = serde_json::to_value(&envelope).unwrap();

        assert_eq!(
            value,
            json!({
                "jsonrpc": "2.0",
                "error": { "code": -32603, "message": "upstream unreachable" },
                "id": 3
            })
        );
    }
}
