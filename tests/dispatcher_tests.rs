use std::sync::{
    Arc, Mutex,
    atomic::{AtomicUsize, Ordering},
};

use async_trait::async_trait;
use axum::http::{HeaderMap, HeaderValue, Method, StatusCode};
use futures::{StreamExt, stream};
use reqwest::Client;
use serde_json::{Map, Value, json};
use tokio_test::assert_ok;

use universal_ai_proxy::{
    config::{Config, UpstreamProtocol},
    dispatcher::Dispatcher,
    errors::{AppError, AppResult},
    metrics::GatewayMetrics,
    upstream::{
        AdapterOutput, InboundRequest, ResponseChunk, UpstreamAdapter, UpstreamDescriptor,
        UpstreamRegistry,
    },
};

/// Adapter double that records every request it is handed
#[derive(Default)]
struct RecordingAdapter {
    calls: AtomicUsize,
    last: Mutex<Option<InboundRequest>>,
    fail_with_unreachable: bool,
}

impl RecordingAdapter {
    fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    fn last_request(&self) -> InboundRequest {
        self.last.lock().unwrap().clone().expect("adapter was not called")
    }
}

#[async_trait]
impl UpstreamAdapter for RecordingAdapter {
    fn protocol(&self) -> UpstreamProtocol {
        UpstreamProtocol::ChatCompletions
    }

    async fn send(
        &self,
        descriptor: &UpstreamDescriptor,
        request: InboundRequest,
    ) -> AppResult<AdapterOutput> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        *self.last.lock().unwrap() = Some(request.clone());

        if self.fail_with_unreachable {
            return Err(AppError::upstream_unreachable(format!("{} is down", descriptor.name)));
        }

        let echo = json!({
            "id": "echo",
            "model": request.body.get("model").cloned().unwrap_or(Value::Null),
            "choices": []
        });
        let chunk = ResponseChunk::try_from(echo).unwrap();
        Ok(AdapterOutput::Chunks(stream::iter([Ok(chunk)]).boxed()))
    }
}

fn registry(credential: Option<&str>) -> Arc<UpstreamRegistry> {
    Arc::new(UpstreamRegistry::from_descriptors([UpstreamDescriptor {
        name: "dashscope".to_string(),
        base_url: "https://dashscope.example.com/compatible-mode/v1".to_string(),
        model: "qwen3-max".to_string(),
        credential: credential.map(str::to_string),
        protocol: UpstreamProtocol::ChatCompletions,
    }]))
}

fn dispatcher(
    registry: Arc<UpstreamRegistry>,
    default_model: Option<&str>,
    adapter: Arc<RecordingAdapter>,
    metrics: GatewayMetrics,
) -> Dispatcher {
    Dispatcher::new(
        registry,
        "dashscope",
        default_model.map(str::to_string),
        adapter,
        metrics,
    )
}

fn request(body: Value) -> InboundRequest {
    let body: Map<String, Value> = serde_json::from_value(body).unwrap();
    InboundRequest::new(Method::POST, HeaderMap::new(), body)
}

#[tokio::test]
async fn test_missing_credential_never_reaches_adapter() {
    let adapter = Arc::new(RecordingAdapter::default());
    let metrics = GatewayMetrics::new();
    let dispatcher = dispatcher(registry(None), None, adapter.clone(), metrics.clone());

    let result = dispatcher.dispatch(request(json!({"model": "qwen-plus", "messages": []}))).await;

    match result {
        Err(AppError::MissingCredential(upstream)) => assert_eq!(upstream, "dashscope"),
        Err(other) => panic!("Expected MissingCredential, got {:?}", other),
        Ok(response) => panic!("Expected an error, got status {}", response.status()),
    }
    assert_eq!(adapter.calls(), 0);

    let snapshot = metrics.snapshot();
    assert_eq!(snapshot.requests, 1);
    assert_eq!(snapshot.failed_requests, 1);
}

#[tokio::test]
async fn test_empty_credential_counts_as_missing() {
    let adapter = Arc::new(RecordingAdapter::default());
    let dispatcher = dispatcher(registry(Some("")), None, adapter.clone(), GatewayMetrics::new());

    let result = dispatcher.dispatch(request(json!({}))).await;
    assert!(matches!(result, Err(AppError::MissingCredential(_))));
    assert_eq!(adapter.calls(), 0);
}

#[tokio::test]
async fn test_empty_model_replaced_by_upstream_default() {
    let adapter = Arc::new(RecordingAdapter::default());
    let dispatcher = dispatcher(registry(Some("sk-test")), None, adapter.clone(), GatewayMetrics::new());

    assert_ok!(dispatcher.dispatch(request(json!({"model": "", "messages": []}))).await);

    assert_eq!(adapter.calls(), 1);
    assert_eq!(adapter.last_request().body["model"], "qwen3-max");
}

#[tokio::test]
async fn test_absent_model_uses_configured_default_model() {
    let adapter = Arc::new(RecordingAdapter::default());
    let dispatcher = dispatcher(
        registry(Some("sk-test")),
        Some("qwen-turbo"),
        adapter.clone(),
        GatewayMetrics::new(),
    );

    assert_ok!(dispatcher.dispatch(request(json!({"messages": []}))).await);
    assert_eq!(adapter.last_request().body["model"], "qwen-turbo");
}

#[tokio::test]
async fn test_inbound_model_is_preserved() {
    let adapter = Arc::new(RecordingAdapter::default());
    let dispatcher = dispatcher(
        registry(Some("sk-test")),
        Some("qwen-turbo"),
        adapter.clone(),
        GatewayMetrics::new(),
    );

    let response = assert_ok!(dispatcher.dispatch(request(json!({"model": "qwen-plus"}))).await);
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(adapter.last_request().body["model"], "qwen-plus");

    // the adapter's echo carries the forwarded model back through the SSE frame
    let body = axum::body::to_bytes(response.into_body(), usize::MAX).await.unwrap();
    let text = String::from_utf8(body.to_vec()).unwrap();
    assert!(text.starts_with("data: {\"id\":\"echo\",\"model\":\"qwen-plus\""));
    assert!(text.ends_with("data: [DONE]\n\n"));
}

#[tokio::test]
async fn test_other_fields_pass_through_unchanged() {
    let adapter = Arc::new(RecordingAdapter::default());
    let dispatcher = dispatcher(registry(Some("sk-test")), None, adapter.clone(), GatewayMetrics::new());

    let mut headers = HeaderMap::new();
    headers.insert("x-trace", HeaderValue::from_static("abc"));
    let body: Map<String, Value> = serde_json::from_str(
        r#"{"stream":true,"messages":[{"role":"user","content":"hi"}],"temperature":0.2,"vendor_flag":{"deep":[1,2]}}"#,
    )
    .unwrap();
    let inbound = InboundRequest::new(Method::PUT, headers, body.clone());

    assert_ok!(dispatcher.dispatch(inbound).await);

    let forwarded = adapter.last_request();
    assert_eq!(forwarded.method, Method::PUT);
    assert_eq!(forwarded.headers["x-trace"], "abc");
    for (key, value) in &body {
        assert_eq!(&forwarded.body[key], value, "field {} changed", key);
    }

    // model is appended after the caller's own fields
    let keys: Vec<&str> = forwarded.body.keys().map(String::as_str).collect();
    assert_eq!(keys, ["stream", "messages", "temperature", "vendor_flag", "model"]);
}

#[tokio::test]
async fn test_unknown_upstream_is_not_found() {
    let adapter = Arc::new(RecordingAdapter::default());
    let dispatcher = Dispatcher::new(
        registry(Some("sk-test")),
        "openrouter",
        None,
        adapter.clone(),
        GatewayMetrics::new(),
    );

    let result = dispatcher.dispatch(request(json!({}))).await;
    assert!(matches!(result, Err(AppError::UpstreamNotFound(name)) if name == "openrouter"));
    assert_eq!(adapter.calls(), 0);
}

#[tokio::test]
async fn test_adapter_failure_is_single_attempt() {
    let adapter = Arc::new(RecordingAdapter {
        fail_with_unreachable: true,
        ..RecordingAdapter::default()
    });
    let metrics = GatewayMetrics::new();
    let dispatcher = dispatcher(registry(Some("sk-test")), None, adapter.clone(), metrics.clone());

    let result = dispatcher.dispatch(request(json!({"model": "qwen-plus"}))).await;
    assert!(matches!(result, Err(AppError::UpstreamUnreachable(_))));
    assert_eq!(adapter.calls(), 1);
    assert_eq!(metrics.snapshot().failed_requests, 1);
}

#[tokio::test]
async fn test_from_config_selects_adapter_by_protocol() {
    let mut config = Config::default();
    config.gateway.upstream = "openrouter".to_string();
    let registry = Arc::new(UpstreamRegistry::from_config(&config));

    let dispatcher = assert_ok!(Dispatcher::from_config(
        &config,
        registry.clone(),
        Client::new(),
        GatewayMetrics::new(),
    ));
    assert_eq!(dispatcher.upstream(), "openrouter");
    assert_eq!(dispatcher.adapter().protocol(), UpstreamProtocol::Passthrough);

    config.gateway.upstream = "dashscope".to_string();
    let dispatcher = assert_ok!(Dispatcher::from_config(
        &config,
        registry.clone(),
        Client::new(),
        GatewayMetrics::new(),
    ));
    assert_eq!(dispatcher.adapter().protocol(), UpstreamProtocol::ChatCompletions);

    config.gateway.upstream = "missing".to_string();
    let result = Dispatcher::from_config(&config, registry, Client::new(), GatewayMetrics::new());
    assert!(matches!(result, Err(AppError::UpstreamNotFound(_))));
}

#[tokio::test]
async fn test_concurrent_dispatch_shares_one_adapter() {
    let adapter = Arc::new(RecordingAdapter::default());
    let dispatcher = Arc::new(dispatcher(
        registry(Some("sk-test")),
        None,
        adapter.clone(),
        GatewayMetrics::new(),
    ));

    let tasks: Vec<_> = (0..16)
        .map(|i| {
            let dispatcher = dispatcher.clone();
            tokio::spawn(async move {
                dispatcher
                    .dispatch(request(json!({"model": format!("m-{}", i)})))
                    .await
                    .map(|response| response.status())
            })
        })
        .collect();

    for task in tasks {
        assert_eq!(task.await.unwrap().unwrap(), StatusCode::OK);
    }
    assert_eq!(adapter.calls(), 16);
}
