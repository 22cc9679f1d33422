use std::sync::Arc;

use axum::response::Response;
use reqwest::Client;

use crate::{
    config::Config,
    errors::AppResult,
    metrics::GatewayMetrics,
    normalizer::Normalizer,
    upstream::{InboundRequest, UpstreamAdapter, UpstreamDescriptor, UpstreamRegistry, adapter_for},
};

/// Forwards every inbound request to the one configured upstream
///
/// The upstream and its adapter are fixed at construction; nothing in the
/// request influences where it goes.
pub struct Dispatcher {
    registry: Arc<UpstreamRegistry>,
    upstream: String,
    default_model: Option<String>,
    adapter: Arc<dyn UpstreamAdapter>,
    normalizer: Normalizer,
    metrics: GatewayMetrics,
}

impl Dispatcher {
    pub fn new(
        registry: Arc<UpstreamRegistry>,
        upstream: impl Into<String>,
        default_model: Option<String>,
        adapter: Arc<dyn UpstreamAdapter>,
        metrics: GatewayMetrics,
    ) -> Self {
        Self {
            registry,
            upstream: upstream.into(),
            default_model: default_model.filter(|model| !model.is_empty()),
            adapter,
            normalizer: Normalizer::new(metrics.clone()),
            metrics,
        }
    }

    /// 根据配置创建分发器
    ///
    /// ## 内部实现逻辑
    /// 1. 在注册表中查找配置选定的上游（找不到视为配置错误）
    /// 2. 根据上游协议选择适配器（ChatCompletions 或 Passthrough），整个进程只选一次
    /// 3. 注入共享的HTTP客户端与指标收集器
    pub fn from_config(
        config: &Config,
        registry: Arc<UpstreamRegistry>,
        client: Client,
        metrics: GatewayMetrics,
    ) -> AppResult<Self> {
        let protocol = registry.resolve(&config.gateway.upstream)?.protocol;
        let adapter = adapter_for(protocol, client, &config.attribution);

        tracing::info!(
            upstream = %config.gateway.upstream,
            protocol = ?protocol,
            "Upstream adapter selected"
        );

        Ok(Self::new(
            registry,
            config.gateway.upstream.clone(),
            config.gateway.default_model.clone(),
            adapter,
            metrics,
        ))
    }

    pub fn upstream(&self) -> &str {
        &self.upstream
    }

    pub fn adapter(&self) -> &Arc<dyn UpstreamAdapter> {
        &self.adapter
    }

    /// Inbound model if non-empty, else the configured default, else the upstream's own
    pub fn effective_model(&self, descriptor: &UpstreamDescriptor, request: &InboundRequest) -> String {
        request
            .model()
            .or(self.default_model.as_deref())
            .unwrap_or(&descriptor.model)
            .to_string()
    }

    /// 分发一次请求
    ///
    /// ## 内部实现逻辑
    /// 1. 查找上游描述符，凭证缺失时在任何网络调用之前返回 MissingCredential
    /// 2. 确定最终模型并写回请求体，其余字段原样保留
    /// 3. 调用适配器，把结果交给 Normalizer
    ///
    /// 只尝试一次，不做重试
    pub async fn dispatch(&self, request: InboundRequest) -> AppResult<Response> {
        self.metrics.record_request();

        let result = self.forward(request).await;
        if let Err(e) = &result {
            self.metrics.record_failure();
            tracing::warn!(upstream = %self.upstream, error = %e, "Request failed before streaming");
        }
        result
    }

    async fn forward(&self, mut request: InboundRequest) -> AppResult<Response> {
        let descriptor = self.registry.resolve(&self.upstream)?;
        descriptor.require_credential()?;

        let model = self.effective_model(descriptor, &request);
        request.set_model(model.as_str());

        tracing::info!(
            upstream = %descriptor.name,
            model = %model,
            method = %request.method,
            "Dispatching request"
        );

        let output = self.adapter.send(descriptor, request).await?;
        self.normalizer.normalize(&descriptor.name, output).await
    }
}
