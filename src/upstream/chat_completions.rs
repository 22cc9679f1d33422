use async_trait::async_trait;
use eventsource_stream::Eventsource;
use futures::{stream, StreamExt};
use reqwest::{header::CONTENT_TYPE, Client};
use serde_json::Value;

use crate::{
    config::UpstreamProtocol,
    errors::{AppError, AppResult},
    upstream::{
        AdapterOutput, ChunkStream, InboundRequest, ResponseChunk, UpstreamAdapter,
        UpstreamDescriptor, is_event_stream,
    },
};

/// Sentinel an upstream uses to end its own event stream
const DONE_SENTINEL: &str = "[DONE]";

/// Structured chat-completion adapter
///
/// Posts the request to `<base_url>/chat/completions` and decodes the SSE
/// response into a lazy sequence of [`ResponseChunk`]s. Each chunk is only
/// read from the network when the consumer asks for it.
pub struct ChatCompletionsAdapter {
    client: Client,
}

impl ChatCompletionsAdapter {
    pub fn new(client: Client) -> Self {
        Self { client }
    }
}

#[async_trait]
impl UpstreamAdapter for ChatCompletionsAdapter {
    fn protocol(&self) -> UpstreamProtocol {
        UpstreamProtocol::ChatCompletions
    }

    async fn send(
        &self,
        descriptor: &UpstreamDescriptor,
        request: InboundRequest,
    ) -> AppResult<AdapterOutput> {
        let credential = descriptor.require_credential()?;
        let url = descriptor.endpoint_url();

        tracing::debug!(upstream = %descriptor.name, url = %url, "Sending chat completion request");

        let response = self
            .client
            .post(&url)
            .bearer_auth(credential)
            .json(&request.body)
            .send()
            .await
            .map_err(|e| {
                AppError::upstream_unreachable(format!("{} request failed: {}", descriptor.name, e))
            })?;

        // Handle HTTP errors
        if !response.status().is_success() {
            let status = response.status();
            let error_body = match response.text().await {
                Ok(text) => text,
                Err(e) => format!("<failed to read error body: {}>", e),
            };
            return Err(AppError::upstream_failure(format!(
                "{} returned {}: {}",
                descriptor.name, status, error_body
            )));
        }

        let content_type = response
            .headers()
            .get(CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .unwrap_or_default()
            .to_string();

        if is_event_stream(&content_type) {
            return Ok(AdapterOutput::Chunks(decode_event_stream(
                descriptor.name.clone(),
                response,
            )));
        }

        // A plain JSON completion is a sequence of exactly one chunk
        let value: Value = response.json().await.map_err(|e| {
            AppError::upstream_failure(format!(
                "Failed to parse {} response: {}",
                descriptor.name, e
            ))
        })?;
        let chunk = into_chunk(&descriptor.name, value);
        Ok(AdapterOutput::Chunks(stream::once(async move { chunk }).boxed()))
    }
}

/// Decode an SSE body into chunks, one network read at a time
///
/// The sequence ends at the upstream's `[DONE]`, at end of body, or after
/// yielding a single error.
fn decode_event_stream(upstream: String, response: reqwest::Response) -> ChunkStream {
    let events = Box::pin(response.bytes_stream().eventsource());

    stream::unfold(Some(events), move |state| {
        let upstream = upstream.clone();
        async move {
            let mut events = state?;
            loop {
                match events.next().await? {
                    Ok(event) => {
                        let data = event.data.trim();
                        if data.is_empty() {
                            continue;
                        }
                        if data == DONE_SENTINEL {
                            return None;
                        }
                        let chunk = serde_json::from_str::<Value>(data)
                            .map_err(|e| {
                                AppError::upstream_failure(format!(
                                    "Invalid chunk from {}: {}",
                                    upstream, e
                                ))
                            })
                            .and_then(|value| into_chunk(&upstream, value));
                        return match chunk {
                            Ok(chunk) => Some((Ok(chunk), Some(events))),
                            Err(e) => Some((Err(e), None)),
                        };
                    }
                    Err(e) => {
                        return Some((
                            Err(AppError::upstream_failure(format!(
                                "{} stream interrupted: {}",
                                upstream, e
                            ))),
                            None,
                        ));
                    }
                }
            }
        }
    })
    .boxed()
}

fn into_chunk(upstream: &str, value: Value) -> AppResult<ResponseChunk> {
    let chunk = ResponseChunk::try_from(value).map_err(|other| {
        AppError::upstream_failure(format!(
            "Unexpected payload from {}: {}",
            upstream, other
        ))
    })?;

    if let Some(error) = chunk.error() {
        let message = error
            .get("message")
            .and_then(Value::as_str)
            .map(str::to_string)
            .unwrap_or_else(|| error.to_string());
        return Err(AppError::upstream_failure(format!("{}: {}", upstream, message)));
    }

    Ok(chunk)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_into_chunk_rejects_embedded_error() {
        let err = into_chunk("dashscope", json!({"error": {"message": "quota exceeded"}}))
            .unwrap_err();
        assert!(matches!(err, AppError::UpstreamFailure(ref m) if m.contains("quota exceeded")));
    }

    #[test]
    fn test_into_chunk_accepts_null_error() {
        assert!(into_chunk("dashscope", json!({"id": "c", "error": null})).is_ok());
    }

    #[test]
    fn test_into_chunk_rejects_non_object() {
        assert!(into_chunk("dashscope", json!("hello")).is_err());
    }
}
