//! Upstream forwarder.
//!
//! Sends the caller's body unchanged to the fixed upstream endpoint with the
//! deployment's own credential, and hands back the un-consumed response.

use std::time::Duration;

use axum::http::{header, HeaderMap, HeaderName, HeaderValue};
use bytes::Bytes;
use reqwest::Client;

use super::ProxyError;
use crate::error::{MeterError, Result};

/// Request headers never copied upstream. `authorization` is replaced;
/// `accept-encoding` is dropped so the body arrives uncompressed and can be
/// metered.
static SKIPPED_REQUEST_HEADERS: [HeaderName; 6] = [
    header::AUTHORIZATION,
    header::HOST,
    header::CONTENT_LENGTH,
    header::TRANSFER_ENCODING,
    header::CONNECTION,
    header::ACCEPT_ENCODING,
];

/// Hop-by-hop response headers that must not be echoed to the client.
static SKIPPED_RESPONSE_HEADERS: [HeaderName; 2] = [header::TRANSFER_ENCODING, header::CONNECTION];

/// Client for the single upstream endpoint
#[derive(Debug, Clone)]
pub struct Upstream {
    client: Client,
    endpoint: String,
    authorization: HeaderValue,
}

impl Upstream {
    /// Create a forwarder for `endpoint` authenticating with `api_key`.
    ///
    /// `timeout` bounds each call including the body stream.
    pub fn new(endpoint: impl Into<String>, api_key: &str, timeout: Duration) -> Result<Self> {
        let client = Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| MeterError::Network(format!("Failed to create HTTP client: {e}")))?;

        let mut authorization = HeaderValue::from_str(&format!("Bearer {api_key}"))
            .map_err(|_| MeterError::Config("Upstream API key is not a valid header value".into()))?;
        authorization.set_sensitive(true);

        Ok(Self {
            client,
            endpoint: endpoint.into(),
            authorization,
        })
    }

    /// Upstream URL calls are sent to
    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }

    /// POST `body` upstream with the caller's headers and our credential.
    ///
    /// Only transport failures are errors; any HTTP status is returned as a
    /// response.
    pub async fn forward(
        &self,
        inbound: &HeaderMap,
        body: Bytes,
    ) -> std::result::Result<reqwest::Response, ProxyError> {
        self.client
            .post(&self.endpoint)
            .headers(self.outbound_headers(inbound))
            .body(body)
            .send()
            .await
            .map_err(|e| ProxyError::Gateway(format!("Failed to connect to upstream: {e}")))
    }

    fn outbound_headers(&self, inbound: &HeaderMap) -> HeaderMap {
        let mut headers = inbound.clone();
        for name in &SKIPPED_REQUEST_HEADERS {
            headers.remove(name);
        }
        headers.insert(header::AUTHORIZATION, self.authorization.clone());
        headers
    }
}

/// Upstream response headers as they should be sent to the client.
pub(crate) fn client_headers(upstream: &HeaderMap) -> HeaderMap {
    let mut headers = upstream.clone();
    for name in &SKIPPED_RESPONSE_HEADERS {
        headers.remove(name);
    }
    headers
}

#[cfg(test)]
mod tests {
    use super::*;

    fn upstream() -> Upstream {
        Upstream::new(
            "http://127.0.0.1:9/v1/chat/completions",
            "sk-upstream",
            Duration::from_secs(5),
        )
        .unwrap()
    }

    #[test]
    fn test_outbound_headers_replace_credential() {
        let mut inbound = HeaderMap::new();
        inbound.insert(header::AUTHORIZATION, HeaderValue::from_static("Bearer caller-key"));
        inbound.insert(header::HOST, HeaderValue::from_static("proxy.local:8080"));
        inbound.insert(header::ACCEPT_ENCODING, HeaderValue::from_static("gzip"));
        inbound.insert(header::CONTENT_TYPE, HeaderValue::from_static("application/json"));
        inbound.insert("x-project", HeaderValue::from_static("search"));
        inbound.append("openai-organization", HeaderValue::from_static("org-1"));

        let outbound = upstream().outbound_headers(&inbound);

        assert_eq!(outbound[header::AUTHORIZATION], "Bearer sk-upstream");
        assert!(outbound[header::AUTHORIZATION].is_sensitive());
        assert!(outbound.get(header::HOST).is_none());
        assert!(outbound.get(header::ACCEPT_ENCODING).is_none());
        assert_eq!(outbound[header::CONTENT_TYPE], "application/json");
        assert_eq!(outbound["x-project"], "search");
        assert_eq!(outbound["openai-organization"], "org-1");
        assert_eq!(outbound.get_all(header::AUTHORIZATION).iter().count(), 1);
    }

    #[test]
    fn test_client_headers_drop_hop_by_hop() {
        let mut upstream = HeaderMap::new();
        upstream.insert(header::CONTENT_TYPE, HeaderValue::from_static("text/event-stream"));
        upstream.insert(header::TRANSFER_ENCODING, HeaderValue::from_static("chunked"));
        upstream.insert("x-request-id", HeaderValue::from_static("req_1"));

        let headers = client_headers(&upstream);
        assert_eq!(headers[header::CONTENT_TYPE], "text/event-stream");
        assert_eq!(headers["x-request-id"], "req_1");
        assert!(headers.get(header::TRANSFER_ENCODING).is_none());
    }

    #[test]
    fn test_rejects_unprintable_api_key() {
        let result = Upstream::new("http://127.0.0.1:9", "bad\nkey", Duration::from_secs(1));
        assert!(matches!(result, Err(MeterError::Config(_))));
    }

    #[tokio::test]
    async fn test_transport_failure_is_gateway_error() {
        // Port 9 (discard) is not listening on loopback
        let result = upstream().forward(&HeaderMap::new(), Bytes::from_static(b"{}")).await;
        assert!(matches!(result, Err(ProxyError::Gateway(_))));
    }
}
