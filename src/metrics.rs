use serde::Serialize;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;

use crate::upstream::TokenUsage;

/// 网关指标收集器
///
/// 负责收集请求计数、流结束方式以及上游报告的Token用量。
/// 克隆开销很小，所有克隆共享同一组计数器
#[derive(Debug, Clone)]
pub struct GatewayMetrics {
    inner: Arc<Counters>,
}

#[derive(Debug)]
struct Counters {
    /// 请求计数器
    requests: AtomicU64,
    /// 失败请求计数器（在提交任何响应字节前失败）
    failed_requests: AtomicU64,
    /// 以 [DONE] 正常结束或上游自然关闭的流
    streams_completed: AtomicU64,
    /// 开始后因上游错误中断的流
    streams_truncated: AtomicU64,
    /// 调用方提前断开的流
    streams_cancelled: AtomicU64,
    /// 携带usage的分块数量
    usage_reports: AtomicU64,
    prompt_tokens: AtomicU64,
    completion_tokens: AtomicU64,
    total_tokens: AtomicU64,
    /// 系统启动时间
    start_time: Instant,
}

/// How a streamed response ended
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamOutcome {
    Completed,
    Truncated,
    Cancelled,
}

/// 系统指标摘要
#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct MetricsSnapshot {
    /// 系统运行时间（秒）
    pub uptime_seconds: u64,
    pub requests: u64,
    pub failed_requests: u64,
    pub streams_completed: u64,
    pub streams_truncated: u64,
    pub streams_cancelled: u64,
    pub usage_reports: u64,
    pub prompt_tokens: u64,
    pub completion_tokens: u64,
    pub total_tokens: u64,
}

impl Default for GatewayMetrics {
    fn default() -> Self {
        Self::new()
    }
}

impl GatewayMetrics {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Counters {
                requests: AtomicU64::new(0),
                failed_requests: AtomicU64::new(0),
                streams_completed: AtomicU64::new(0),
                streams_truncated: AtomicU64::new(0),
                streams_cancelled: AtomicU64::new(0),
                usage_reports: AtomicU64::new(0),
                prompt_tokens: AtomicU64::new(0),
                completion_tokens: AtomicU64::new(0),
                total_tokens: AtomicU64::new(0),
                start_time: Instant::now(),
            }),
        }
    }

    pub fn record_request(&self) {
        self.inner.requests.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_failure(&self) {
        self.inner.failed_requests.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_usage(&self, usage: &TokenUsage) {
        let counters = &self.inner;
        counters.usage_reports.fetch_add(1, Ordering::Relaxed);
        counters.prompt_tokens.fetch_add(usage.prompt_tokens, Ordering::Relaxed);
        counters.completion_tokens.fetch_add(usage.completion_tokens, Ordering::Relaxed);
        counters.total_tokens.fetch_add(usage.total_tokens, Ordering::Relaxed);
    }

    pub fn record_stream_end(&self, outcome: StreamOutcome) {
        let counter = match outcome {
            StreamOutcome::Completed => &self.inner.streams_completed,
            StreamOutcome::Truncated => &self.inner.streams_truncated,
            StreamOutcome::Cancelled => &self.inner.streams_cancelled,
        };
        counter.fetch_add(1, Ordering::Relaxed);
    }

    /// 获取指标快照
    pub fn snapshot(&self) -> MetricsSnapshot {
        let counters = &self.inner;
        MetricsSnapshot {
            uptime_seconds: counters.start_time.elapsed().as_secs(),
            requests: counters.requests.load(Ordering::Relaxed),
            failed_requests: counters.failed_requests.load(Ordering::Relaxed),
            streams_completed: counters.streams_completed.load(Ordering::Relaxed),
            streams_truncated: counters.streams_truncated.load(Ordering::Relaxed),
            streams_cancelled: counters.streams_cancelled.load(Ordering::Relaxed),
            usage_reports: counters.usage_reports.load(Ordering::Relaxed),
            prompt_tokens: counters.prompt_tokens.load(Ordering::Relaxed),
            completion_tokens: counters.completion_tokens.load(Ordering::Relaxed),
            total_tokens: counters.total_tokens.load(Ordering::Relaxed),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_usage_accumulates() {
        let metrics = GatewayMetrics::new();
        metrics.record_usage(&TokenUsage { prompt_tokens: 10, completion_tokens: 5, total_tokens: 15 });
        metrics.record_usage(&TokenUsage { prompt_tokens: 1, completion_tokens: 2, total_tokens: 3 });

        let snapshot = metrics.snapshot();
        assert_eq!(snapshot.usage_reports, 2);
        assert_eq!(snapshot.prompt_tokens, 11);
        assert_eq!(snapshot.completion_tokens, 7);
        assert_eq!(snapshot.total_tokens, 18);
    }

    #[test]
    fn test_clones_share_counters() {
        let metrics = GatewayMetrics::new();
        let clone = metrics.clone();
        clone.record_request();
        clone.record_stream_end(StreamOutcome::Cancelled);

        let snapshot = metrics.snapshot();
        assert_eq!(snapshot.requests, 1);
        assert_eq!(snapshot.streams_cancelled, 1);
        assert_eq!(snapshot.streams_completed, 0);
    }
}
