use std::convert::Infallible;

use axum::{
    body::Body,
    http::{
        HeaderValue, StatusCode,
        header::{ACCESS_CONTROL_ALLOW_ORIGIN, CACHE_CONTROL, CONNECTION, CONTENT_TYPE},
    },
    response::Response,
};
use bytes::{Bytes, BytesMut};
use futures::{Stream, StreamExt, TryStreamExt, stream};

use crate::{
    errors::{AppError, AppResult},
    metrics::{GatewayMetrics, StreamOutcome},
    upstream::{AdapterOutput, ByteStream, ChunkStream, RawUpstreamResponse, ResponseChunk, TokenUsage},
};

/// Terminal frame written after a chunk stream completes normally
pub const DONE_FRAME: &[u8] = b"data: [DONE]\n\n";

const EVENT_STREAM: &str = "text/event-stream";

/// Encode one chunk as `data: <json>\n\n`
pub fn encode_frame(chunk: &ResponseChunk) -> Result<Bytes, serde_json::Error> {
    let mut frame = Vec::with_capacity(256);
    frame.extend_from_slice(b"data: ");
    serde_json::to_writer(&mut frame, chunk)?;
    frame.extend_from_slice(b"\n\n");
    Ok(Bytes::from(frame))
}

/// Turns either adapter output into the single downstream response shape
///
/// Chunk streams become `data:` frames closed by `[DONE]`. Raw event streams
/// are relayed byte for byte. Any other raw body is buffered and returned
/// with the upstream status.
#[derive(Debug, Clone)]
pub struct Normalizer {
    metrics: GatewayMetrics,
}

impl Normalizer {
    pub fn new(metrics: GatewayMetrics) -> Self {
        Self { metrics }
    }

    pub async fn normalize(&self, upstream: &str, output: AdapterOutput) -> AppResult<Response> {
        match output {
            AdapterOutput::Chunks(chunks) => self.forward_chunks(upstream, chunks).await,
            AdapterOutput::Raw(raw) => self.forward_raw(upstream, raw).await,
        }
    }

    /// 将分块序列转换为SSE响应
    ///
    /// ## 内部实现逻辑
    /// 1. 在写出任何字节之前先拉取第一个分块；此时出错直接返回错误（500 JSON）
    /// 2. 设置SSE响应头，逐个写出 `data: <json>\n\n` 帧，每写完一帧才拉取下一个
    /// 3. 带有usage的分块记录Token用量（仅日志和指标，不影响转发）
    /// 4. 序列正常结束后写出 `data: [DONE]\n\n`
    /// 5. 开始写出后出错只记录日志并结束流，不写 [DONE]
    pub async fn forward_chunks(&self, upstream: &str, mut chunks: ChunkStream) -> AppResult<Response> {
        let pending = match chunks.next().await {
            Some(Ok(chunk)) => Some(chunk),
            Some(Err(e)) => return Err(e),
            None => None,
        };

        let relay = ChunkRelay {
            chunks,
            pending,
            metrics: self.metrics.clone(),
            guard: StreamGuard::new(upstream, self.metrics.clone()),
        };

        Response::builder()
            .status(StatusCode::OK)
            .header(CONTENT_TYPE, EVENT_STREAM)
            .header(CACHE_CONTROL, "no-cache")
            .header(CONNECTION, "keep-alive")
            .header(ACCESS_CONTROL_ALLOW_ORIGIN, "*")
            .body(Body::from_stream(relay.into_frames()))
            .map_err(|e| AppError::internal(format!("Failed to build SSE response: {}", e)))
    }

    /// 转发透传上游的响应
    ///
    /// 事件流以200原样转发；其他内容先完整读入内存，再以上游状态码返回，
    /// 这样读取失败时仍可返回干净的错误响应
    pub async fn forward_raw(&self, upstream: &str, raw: RawUpstreamResponse) -> AppResult<Response> {
        if raw.is_event_stream() {
            let RawUpstreamResponse { status, body, .. } = raw;
            if !status.is_success() {
                tracing::warn!(
                    upstream = %upstream,
                    status = status.as_u16(),
                    "Upstream event stream has a non-success status; relaying as 200"
                );
            }
            let guard = StreamGuard::new(upstream, self.metrics.clone());

            return Response::builder()
                .status(StatusCode::OK)
                .header(CONTENT_TYPE, EVENT_STREAM)
                .body(Body::from_stream(relay_bytes(body, guard)))
                .map_err(|e| AppError::internal(format!("Failed to build SSE response: {}", e)));
        }

        let RawUpstreamResponse { status, content_type, body } = raw;
        let buffered = body
            .try_fold(BytesMut::new(), |mut buffer, bytes| async move {
                buffer.extend_from_slice(&bytes);
                Ok(buffer)
            })
            .await?;

        tracing::debug!(
            upstream = %upstream,
            status = status.as_u16(),
            bytes = buffered.len(),
            "Upstream returned a buffered response"
        );

        let mut response = Response::builder().status(status);
        if !content_type.is_empty() {
            if let Ok(value) = HeaderValue::from_str(&content_type) {
                response = response.header(CONTENT_TYPE, value);
            }
        }

        response
            .body(Body::from(buffered.freeze()))
            .map_err(|e| AppError::internal(format!("Failed to build response: {}", e)))
    }
}

/// Records how a streamed body ended
///
/// A guard dropped without an outcome means hyper dropped the body because
/// the caller went away; the upstream stream is dropped with it.
struct StreamGuard {
    upstream: String,
    metrics: GatewayMetrics,
    outcome: Option<StreamOutcome>,
    frames: u64,
}

impl StreamGuard {
    fn new(upstream: &str, metrics: GatewayMetrics) -> Self {
        Self {
            upstream: upstream.to_string(),
            metrics,
            outcome: None,
            frames: 0,
        }
    }

    fn finish(&mut self, outcome: StreamOutcome) {
        self.outcome = Some(outcome);
    }

    fn truncate(&mut self, reason: &str) {
        tracing::error!(
            upstream = %self.upstream,
            frames = self.frames,
            error = %reason,
            "Upstream stream failed after streaming began; closing downstream stream"
        );
        self.finish(StreamOutcome::Truncated);
    }
}

impl Drop for StreamGuard {
    fn drop(&mut self) {
        let outcome = self.outcome.unwrap_or(StreamOutcome::Cancelled);
        match outcome {
            StreamOutcome::Completed => tracing::debug!(
                upstream = %self.upstream,
                frames = self.frames,
                "Stream completed"
            ),
            StreamOutcome::Cancelled => tracing::info!(
                upstream = %self.upstream,
                frames = self.frames,
                "Caller disconnected; upstream connection released"
            ),
            StreamOutcome::Truncated => {}
        }
        self.metrics.record_stream_end(outcome);
    }
}

struct ChunkRelay {
    chunks: ChunkStream,
    pending: Option<ResponseChunk>,
    metrics: GatewayMetrics,
    guard: StreamGuard,
}

impl ChunkRelay {
    fn report_usage(&self, usage: &TokenUsage) {
        tracing::info!(
            upstream = %self.guard.upstream,
            prompt_tokens = usage.prompt_tokens,
            completion_tokens = usage.completion_tokens,
            total_tokens = usage.total_tokens,
            "Request usage"
        );
        self.metrics.record_usage(usage);
    }

    fn into_frames(self) -> impl Stream<Item = Result<Bytes, Infallible>> + Send + 'static {
        stream::unfold(Some(self), |state| async move {
            let mut relay = state?;

            let next = match relay.pending.take() {
                Some(chunk) => Some(Ok(chunk)),
                None => relay.chunks.next().await,
            };

            match next {
                Some(Ok(chunk)) => {
                    if let Some(usage) = chunk.usage() {
                        relay.report_usage(&usage);
                    }
                    match encode_frame(&chunk) {
                        Ok(frame) => {
                            relay.guard.frames += 1;
                            Some((Ok(frame), Some(relay)))
                        }
                        Err(e) => {
                            relay.guard.truncate(&format!("failed to encode chunk: {}", e));
                            None
                        }
                    }
                }
                Some(Err(e)) => {
                    relay.guard.truncate(&e.to_string());
                    None
                }
                None => {
                    relay.guard.finish(StreamOutcome::Completed);
                    Some((Ok(Bytes::from_static(DONE_FRAME)), None))
                }
            }
        })
    }
}

/// Relay raw bytes unchanged until the upstream closes or fails
fn relay_bytes(
    body: ByteStream,
    guard: StreamGuard,
) -> impl Stream<Item = Result<Bytes, Infallible>> + Send + 'static {
    stream::unfold(Some((body, guard)), |state| async move {
        let (mut body, mut guard) = state?;
        match body.next().await {
            Some(Ok(bytes)) => {
                guard.frames += 1;
                Some((Ok(bytes), Some((body, guard))))
            }
            Some(Err(e)) => {
                guard.truncate(&e.to_string());
                None
            }
            None => {
                guard.finish(StreamOutcome::Completed);
                None
            }
        }
    })
}
