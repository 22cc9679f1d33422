use std::time::Instant;
use axum::{
    extract::Request,
    http::{HeaderMap, HeaderValue},
    middleware::Next,
    response::Response,
};
use tracing::{Instrument, info, warn};
use uuid::Uuid;

/// Request ID header name
pub const REQUEST_ID_HEADER: &str = "x-request-id";

/// Request context information for logging and tracing
#[derive(Debug, Clone)]
pub struct RequestContext {
    pub request_id: String,
    pub method: String,
    pub uri: String,
    pub user_agent: Option<String>,
    pub start_time: Instant,
}

impl RequestContext {
    /// Create request context, reusing the caller's request ID when it sent a usable one
    pub fn from_request(request: &Request) -> Self {
        let headers = request.headers();
        let request_id = request_id_from(headers).unwrap_or_else(|| Uuid::new_v4().to_string());
        let user_agent = headers
            .get("user-agent")
            .and_then(|v| v.to_str().ok())
            .map(|s| s.to_string());

        Self {
            request_id,
            method: request.method().to_string(),
            uri: request.uri().to_string(),
            user_agent,
            start_time: Instant::now(),
        }
    }

    /// Get elapsed time since request start
    pub fn elapsed(&self) -> std::time::Duration {
        self.start_time.elapsed()
    }
}

fn request_id_from(headers: &HeaderMap) -> Option<String> {
    headers
        .get(REQUEST_ID_HEADER)
        .and_then(|v| v.to_str().ok())
        .filter(|id| !id.is_empty())
        .map(|s| s.to_string())
}

/// Logging middleware that adds request ID and structured logging
///
/// For streamed responses the completion log marks when headers were sent,
/// not when the stream ended.
pub async fn logging_middleware(mut request: Request, next: Next) -> Response {
    let context = RequestContext::from_request(&request);

    let header_value = HeaderValue::from_str(&context.request_id).ok();
    if let Some(value) = &header_value {
        request.headers_mut().insert(REQUEST_ID_HEADER, value.clone());
    }

    let span = tracing::info_span!(
        "http_request",
        request_id = %context.request_id,
        method = %context.method,
        uri = %context.uri,
        user_agent = context.user_agent.as_deref().unwrap_or("unknown")
    );

    async move {
        info!("Request started");

        let mut response = next.run(request).await;
        let status = response.status();
        let duration_ms = context.elapsed().as_millis() as u64;

        if let Some(value) = header_value {
            response.headers_mut().insert(REQUEST_ID_HEADER, value);
        }

        if status.is_success() {
            info!(status = status.as_u16(), duration_ms, "Request completed");
        } else {
            warn!(status = status.as_u16(), duration_ms, "Request completed with error status");
        }

        response
    }
    .instrument(span)
    .await
}
