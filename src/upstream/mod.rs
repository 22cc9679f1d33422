pub mod chat_completions;
pub mod passthrough;
pub mod registry;

use std::sync::Arc;

use async_trait::async_trait;
use axum::http::{HeaderMap, Method, StatusCode};
use bytes::Bytes;
use futures::stream::BoxStream;
use reqwest::Client;
use serde::{Deserialize, Deserializer, Serialize};
use serde_json::{Map, Value};

use crate::{
    config::{AttributionConfig, UpstreamProtocol},
    errors::AppResult,
};

pub use chat_completions::ChatCompletionsAdapter;
pub use passthrough::PassthroughAdapter;
pub use registry::{UpstreamDescriptor, UpstreamRegistry};

/// Caller-supplied chat-completion body, opaque apart from `model`
pub type CompletionRequest = Map<String, Value>;

/// Lazy, single-pass sequence of decoded chunks
pub type ChunkStream = BoxStream<'static, AppResult<ResponseChunk>>;

/// Unconsumed upstream body
pub type ByteStream = BoxStream<'static, AppResult<Bytes>>;

/// Inbound request as handed over by the HTTP layer
#[derive(Debug, Clone)]
pub struct InboundRequest {
    pub method: Method,
    pub headers: HeaderMap,
    pub body: CompletionRequest,
}

impl InboundRequest {
    pub fn new(method: Method, headers: HeaderMap, body: CompletionRequest) -> Self {
        Self { method, headers, body }
    }

    /// The `model` field when it is a non-empty string
    pub fn model(&self) -> Option<&str> {
        self.body
            .get("model")
            .and_then(Value::as_str)
            .filter(|model| !model.is_empty())
    }

    pub fn set_model(&mut self, model: impl Into<String>) {
        self.body.insert("model".to_string(), Value::String(model.into()));
    }
}

/// One decoded unit of a streamed completion
///
/// Kept as a raw JSON object so provider-specific fields survive
/// re-serialization untouched.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ResponseChunk(Map<String, Value>);

impl ResponseChunk {
    pub fn new(fields: Map<String, Value>) -> Self {
        Self(fields)
    }

    pub fn fields(&self) -> &Map<String, Value> {
        &self.0
    }

    /// Token usage, present only on the terminal usage-bearing chunk
    ///
    /// A `usage` object always counts as a report; counts that are null or
    /// not numbers read as 0.
    pub fn usage(&self) -> Option<TokenUsage> {
        match self.0.get("usage") {
            Some(value @ Value::Object(_)) => Some(TokenUsage::deserialize(value).unwrap_or_default()),
            _ => None,
        }
    }

    /// Error object some upstreams embed in the stream instead of failing the request
    pub fn error(&self) -> Option<&Value> {
        self.0.get("error").filter(|value| !value.is_null())
    }
}

impl TryFrom<Value> for ResponseChunk {
    type Error = Value;

    fn try_from(value: Value) -> Result<Self, Self::Error> {
        match value {
            Value::Object(fields) => Ok(Self(fields)),
            other => Err(other),
        }
    }
}

/// Token counts reported by the upstream
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenUsage {
    #[serde(default, deserialize_with = "count_or_zero")]
    pub prompt_tokens: u64,
    #[serde(default, deserialize_with = "count_or_zero")]
    pub completion_tokens: u64,
    #[serde(default, deserialize_with = "count_or_zero")]
    pub total_tokens: u64,
}

/// `null` token counts read as 0
fn count_or_zero<'de, D>(deserializer: D) -> Result<u64, D::Error>
where
    D: Deserializer<'de>,
{
    Ok(Option::<u64>::deserialize(deserializer)?.unwrap_or(0))
}

/// Proxied upstream response whose body has not been read yet
///
/// Dropping it releases the upstream connection.
pub struct RawUpstreamResponse {
    pub status: StatusCode,
    pub content_type: String,
    pub body: ByteStream,
}

impl RawUpstreamResponse {
    pub fn is_event_stream(&self) -> bool {
        is_event_stream(&self.content_type)
    }
}

impl std::fmt::Debug for RawUpstreamResponse {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RawUpstreamResponse")
            .field("status", &self.status)
            .field("content_type", &self.content_type)
            .finish_non_exhaustive()
    }
}

/// What an adapter hands to the normalizer; exactly one shape per request
pub enum AdapterOutput {
    Chunks(ChunkStream),
    Raw(RawUpstreamResponse),
}

pub fn is_event_stream(content_type: &str) -> bool {
    content_type.to_ascii_lowercase().contains("text/event-stream")
}

/// One implementation per upstream wire protocol
///
/// The adapter is chosen once at startup from the configured upstream and
/// shared by every request task.
#[async_trait]
pub trait UpstreamAdapter: Send + Sync {
    fn protocol(&self) -> UpstreamProtocol;

    /// Perform the single upstream call for this request
    ///
    /// Must fail with `MissingCredential` before touching the network when
    /// the descriptor carries no credential.
    async fn send(
        &self,
        descriptor: &UpstreamDescriptor,
        request: InboundRequest,
    ) -> AppResult<AdapterOutput>;
}

/// Build the adapter for a protocol
pub fn adapter_for(
    protocol: UpstreamProtocol,
    client: Client,
    attribution: &AttributionConfig,
) -> Arc<dyn UpstreamAdapter> {
    match protocol {
        UpstreamProtocol::ChatCompletions => Arc::new(ChatCompletionsAdapter::new(client)),
        UpstreamProtocol::Passthrough => {
            Arc::new(PassthroughAdapter::new(client, attribution.clone()))
        }
    }
}
