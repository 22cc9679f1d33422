use async_trait::async_trait;
use axum::http::{
    HeaderMap, HeaderName, HeaderValue, Method,
    header::{
        ACCEPT_ENCODING, AUTHORIZATION, CONNECTION, CONTENT_LENGTH, CONTENT_TYPE, HOST,
        PROXY_AUTHENTICATE, PROXY_AUTHORIZATION, TE, TRAILER, TRANSFER_ENCODING, UPGRADE,
    },
};
use futures::{StreamExt, TryStreamExt};
use reqwest::Client;

use crate::{
    config::{AttributionConfig, UpstreamProtocol},
    errors::{AppError, AppResult},
    upstream::{AdapterOutput, InboundRequest, RawUpstreamResponse, UpstreamAdapter, UpstreamDescriptor},
};

/// Site URL hint some upstreams use for usage attribution
pub const REFERER_HEADER: &str = "http-referer";
/// Site title hint some upstreams use for usage attribution
pub const TITLE_HEADER: &str = "x-title";

/// Raw HTTP forwarding adapter
///
/// Replays the caller's method, headers and body against the upstream with
/// the gateway's own credential, and returns as soon as the response headers
/// arrive. The body is left unread for the normalizer.
pub struct PassthroughAdapter {
    client: Client,
    attribution: AttributionConfig,
}

impl PassthroughAdapter {
    pub fn new(client: Client, attribution: AttributionConfig) -> Self {
        Self { client, attribution }
    }

    /// Build the outbound header set from the caller's headers
    fn outbound_headers(&self, inbound: &HeaderMap, credential: &str) -> AppResult<HeaderMap> {
        let mut headers = inbound.clone();
        // hop-by-hop and caller-specific headers stay behind
        for name in [
            HOST,
            CONTENT_LENGTH,
            AUTHORIZATION,
            ACCEPT_ENCODING,
            CONNECTION,
            TRANSFER_ENCODING,
            UPGRADE,
            TE,
            TRAILER,
            PROXY_AUTHENTICATE,
            PROXY_AUTHORIZATION,
        ] {
            headers.remove(name);
        }
        headers.remove("keep-alive");

        let bearer = HeaderValue::from_str(&format!("Bearer {}", credential))
            .map_err(|e| AppError::ConfigError(format!("Credential is not a valid header value: {}", e)))?;
        headers.insert(AUTHORIZATION, bearer);
        headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));

        for (name, value) in [
            (REFERER_HEADER, &self.attribution.referer),
            (TITLE_HEADER, &self.attribution.title),
        ] {
            let value = HeaderValue::from_str(value)
                .map_err(|e| AppError::ConfigError(format!("Invalid {} header value: {}", name, e)))?;
            headers.insert(HeaderName::from_static(name), value);
        }

        Ok(headers)
    }
}

/// `GET` and `HEAD` are forwarded without a body
fn carries_body(method: &Method) -> bool {
    !matches!(*method, Method::GET | Method::HEAD)
}

#[async_trait]
impl UpstreamAdapter for PassthroughAdapter {
    fn protocol(&self) -> UpstreamProtocol {
        UpstreamProtocol::Passthrough
    }

    async fn send(
        &self,
        descriptor: &UpstreamDescriptor,
        request: InboundRequest,
    ) -> AppResult<AdapterOutput> {
        let credential = descriptor.require_credential()?;
        let url = descriptor.endpoint_url();
        let headers = self.outbound_headers(&request.headers, credential)?;

        tracing::debug!(
            upstream = %descriptor.name,
            method = %request.method,
            url = %url,
            "Forwarding request upstream"
        );

        let mut builder = self
            .client
            .request(request.method.clone(), &url)
            .headers(headers);

        if carries_body(&request.method) {
            let body = serde_json::to_vec(&request.body)
                .map_err(|e| AppError::internal(format!("Failed to encode request body: {}", e)))?;
            builder = builder.body(body);
        }

        let response = builder.send().await.map_err(|e| {
            AppError::upstream_unreachable(format!("{} request failed: {}", descriptor.name, e))
        })?;

        let status = response.status();
        let content_type = response
            .headers()
            .get(CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .unwrap_or_default()
            .to_string();

        let upstream = descriptor.name.clone();
        let body = response
            .bytes_stream()
            .map_err(move |e| {
                AppError::upstream_failure(format!("{} body read failed: {}", upstream, e))
            })
            .boxed();

        Ok(AdapterOutput::Raw(RawUpstreamResponse {
            status,
            content_type,
            body,
        }))
    }
}
