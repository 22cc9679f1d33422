use serde::{Deserialize, Serialize};
use figment::{Figment, providers::{Env, Format, Serialized, Toml}};
use std::collections::HashMap;
use std::path::Path;
use anyhow::{Context, Result};

/// 默认配置文件路径
pub const DEFAULT_CONFIG_PATH: &str = "config.toml";

/// 主配置结构体
///
/// 包含网关的全部配置信息，进程启动时加载一次，之后只读共享
#[derive(Deserialize, Serialize, Debug, Clone)]
pub struct Config {
    /// 服务器配置
    #[serde(default)]
    pub server: ServerConfig,
    /// 网关配置（选用哪个上游、默认模型）
    #[serde(default)]
    pub gateway: GatewayConfig,
    /// 透传上游所需的归属标识头
    #[serde(default)]
    pub attribution: AttributionConfig,
    /// 上游配置映射（上游名称 -> 上游详情）
    #[serde(default = "default_upstreams")]
    pub upstreams: HashMap<String, UpstreamConfig>,
    /// 日志配置（可选，有默认值）
    #[serde(default)]
    pub logging: LoggingConfig,
}

#[derive(Deserialize, Serialize, Debug, Clone)]
pub struct ServerConfig {
    #[serde(default = "default_host")]
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
    #[serde(default = "default_max_request_size")]
    pub max_request_size_bytes: usize,
    #[serde(default = "default_connect_timeout")]
    pub connect_timeout_seconds: u64,
    #[serde(default = "default_pool_idle_timeout")]
    pub pool_idle_timeout_seconds: u64,
    #[serde(default = "default_pool_max_idle_per_host")]
    pub pool_max_idle_per_host: usize,
}

#[derive(Deserialize, Serialize, Debug, Clone)]
pub struct GatewayConfig {
    /// Name of the single upstream this process forwards to
    #[serde(default = "default_upstream")]
    pub upstream: String,
    /// Model used when the inbound request carries none
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub default_model: Option<String>,
}

#[derive(Deserialize, Serialize, Debug, Clone)]
pub struct AttributionConfig {
    #[serde(default = "default_referer")]
    pub referer: String,
    #[serde(default = "default_title")]
    pub title: String,
}

/// Wire protocol spoken by an upstream
#[derive(Deserialize, Serialize, Debug, Clone, Copy, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum UpstreamProtocol {
    /// Structured chat-completion call whose response is decoded into chunks
    #[default]
    ChatCompletions,
    /// Raw HTTP forwarding; the upstream body is relayed or buffered as-is
    Passthrough,
}

#[derive(Deserialize, Serialize, Debug, Clone)]
pub struct UpstreamConfig {
    pub base_url: String,
    pub model: String,
    #[serde(default)]
    pub protocol: UpstreamProtocol,
    /// Inline credential, takes precedence over `credential_env`
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub credential: Option<String>,
    /// Name of the environment variable holding the credential
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub credential_env: Option<String>,
}

#[derive(Deserialize, Serialize, Debug, Clone)]
pub struct LoggingConfig {
    #[serde(default = "default_log_level")]
    pub level: String,
    #[serde(default = "default_log_format")]
    pub format: String,
}

// Default value functions
fn default_host() -> String { "0.0.0.0".to_string() }
fn default_port() -> u16 { 3000 }
fn default_max_request_size() -> usize { 10 * 1024 * 1024 } // 10MB
fn default_connect_timeout() -> u64 { 10 }
fn default_pool_idle_timeout() -> u64 { 90 }
fn default_pool_max_idle_per_host() -> usize { 10 }
fn default_upstream() -> String { "dashscope".to_string() }
fn default_referer() -> String { "http://api.ai-proxy.com".to_string() }
fn default_title() -> String { "ai-proxy".to_string() }
fn default_log_level() -> String { "info".to_string() }
fn default_log_format() -> String { "json".to_string() }

/// 内置上游列表
///
/// 配置文件未声明的上游使用这里的设置，凭证从对应的环境变量读取
fn default_upstreams() -> HashMap<String, UpstreamConfig> {
    let builtin = [
        (
            "dashscope",
            "https://dashscope.aliyuncs.com/compatible-mode/v1",
            "qwen3-max",
            UpstreamProtocol::ChatCompletions,
            "DASHSCOPE_KEY",
        ),
        (
            "openrouter",
            "https://openrouter.ai/api/v1",
            "qwen/qwen2.5-coder",
            UpstreamProtocol::Passthrough,
            "OPENROUTER_KEY",
        ),
        (
            "deepseek-chat",
            "https://api.deepseek.com",
            "deepseek-chat",
            UpstreamProtocol::ChatCompletions,
            "DEEPSEEK_KEY",
        ),
        (
            "openrouter-qwen",
            "https://openrouter.ai/api/v1",
            "qwen/qwen2.5-coder",
            UpstreamProtocol::Passthrough,
            "OPENROUTER_KEY",
        ),
    ];

    builtin
        .into_iter()
        .map(|(name, base_url, model, protocol, env)| {
            (
                name.to_string(),
                UpstreamConfig {
                    base_url: base_url.to_string(),
                    model: model.to_string(),
                    protocol,
                    credential: None,
                    credential_env: Some(env.to_string()),
                },
            )
        })
        .collect()
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            max_request_size_bytes: default_max_request_size(),
            connect_timeout_seconds: default_connect_timeout(),
            pool_idle_timeout_seconds: default_pool_idle_timeout(),
            pool_max_idle_per_host: default_pool_max_idle_per_host(),
        }
    }
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            upstream: default_upstream(),
            default_model: None,
        }
    }
}

impl Default for AttributionConfig {
    fn default() -> Self {
        Self {
            referer: default_referer(),
            title: default_title(),
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            format: default_log_format(),
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            server: ServerConfig::default(),
            gateway: GatewayConfig::default(),
            attribution: AttributionConfig::default(),
            upstreams: default_upstreams(),
            logging: LoggingConfig::default(),
        }
    }
}

/// 构建配置加载器
///
/// ## 功能说明
/// 按优先级合并配置源，后合并的覆盖先合并的：
/// 1. 内置默认值
/// 2. 配置文件（默认 config.toml，文件不存在时跳过）
/// 3. 以 AI_PROXY_ 开头的环境变量，`__` 表示嵌套，例如 `AI_PROXY_GATEWAY__UPSTREAM`
/// 4. 兼容旧部署的环境变量：`PORT`、`UPSTREAM_SERVICE`、`DEFAULT_MODEL`
pub fn figment(path: &Path) -> Figment {
    Figment::from(Serialized::defaults(Config::default()))
        .merge(Toml::file(path))
        .merge(Env::prefixed("AI_PROXY_").split("__"))
        .merge(legacy_env())
}

/// Plain environment variables understood by earlier deployments
fn legacy_env() -> Env {
    Env::raw().filter_map(|key| {
        let mapped = if key.as_str().eq_ignore_ascii_case("port") {
            "server.port"
        } else if key.as_str().eq_ignore_ascii_case("upstream_service") {
            "gateway.upstream"
        } else if key.as_str().eq_ignore_ascii_case("default_model") {
            "gateway.default_model"
        } else {
            return None;
        };
        Some(mapped.into())
    })
}

/// 加载配置文件和环境变量
///
/// ## 功能说明
/// 合并所有配置源，反序列化为 Config，验证配置，并确认至少有一个上游配置了凭证
///
/// ## 错误处理
/// - 配置文件格式错误时返回解析错误
/// - 配置验证失败时返回验证错误
/// - 所有上游都缺少凭证时返回错误（启动即失败）
pub fn load_config(path: &Path) -> Result<Config> {
    let config: Config = figment(path)
        .extract()
        .with_context(|| format!("Failed to load configuration from {} or environment variables", path.display()))?;

    config.validate()
        .context("Configuration validation failed")?;

    config.ensure_credentials()?;

    Ok(config)
}

impl Config {
    /// 验证整个配置的有效性
    ///
    /// ## 内部实现逻辑
    /// 1. 验证服务器配置
    /// 2. 检查至少配置了一个上游，且逐个验证
    /// 3. 检查选定的上游存在
    /// 4. 验证日志配置
    pub fn validate(&self) -> Result<()> {
        self.server.validate()
            .context("Server configuration validation failed")?;

        if self.upstreams.is_empty() {
            return Err(anyhow::anyhow!("At least one upstream must be configured"));
        }

        for (name, upstream) in &self.upstreams {
            upstream.validate()
                .with_context(|| format!("Upstream '{}' configuration validation failed", name))?;
        }

        if self.gateway.upstream.is_empty() {
            return Err(anyhow::anyhow!("Selected upstream name cannot be empty"));
        }

        if !self.upstreams.contains_key(&self.gateway.upstream) {
            let mut known: Vec<&str> = self.upstreams.keys().map(String::as_str).collect();
            known.sort_unstable();
            return Err(anyhow::anyhow!(
                "Selected upstream '{}' is not configured. Known upstreams: {}",
                self.gateway.upstream,
                known.join(", ")
            ));
        }

        self.logging.validate()
            .context("Logging configuration validation failed")?;

        Ok(())
    }

    /// 确认至少一个上游有可用凭证
    ///
    /// 选定上游缺少凭证不在这里报错：它会在每次请求时以 MissingCredential 返回
    pub fn ensure_credentials(&self) -> Result<()> {
        let any = self
            .upstreams
            .values()
            .any(|upstream| upstream.resolve_credential().is_some());

        if !any {
            let mut vars: Vec<&str> = self
                .upstreams
                .values()
                .filter_map(|upstream| upstream.credential_env.as_deref())
                .collect();
            vars.sort_unstable();
            vars.dedup();
            return Err(anyhow::anyhow!(
                "No upstream credential configured; set at least one of: {}",
                vars.join(", ")
            ));
        }

        Ok(())
    }
}

impl ServerConfig {
    /// 验证服务器配置参数
    ///
    /// ## 参数验证规则
    /// - `host`: 不能为空字符串
    /// - `port`: 必须大于0
    /// - `max_request_size_bytes`: 1字节-100MB之间
    /// - `connect_timeout_seconds`: 1-300秒之间
    pub fn validate(&self) -> Result<()> {
        if self.host.is_empty() {
            return Err(anyhow::anyhow!("Server host cannot be empty"));
        }

        if self.port == 0 {
            return Err(anyhow::anyhow!("Server port cannot be 0"));
        }

        if self.max_request_size_bytes == 0 {
            return Err(anyhow::anyhow!("Max request size must be greater than 0"));
        }

        if self.max_request_size_bytes > 100 * 1024 * 1024 {
            return Err(anyhow::anyhow!("Max request size cannot exceed 100MB"));
        }

        if self.connect_timeout_seconds == 0 || self.connect_timeout_seconds > 300 {
            return Err(anyhow::anyhow!("Connect timeout must be between 1 and 300 seconds"));
        }

        Ok(())
    }
}

impl UpstreamConfig {
    /// 验证上游配置参数
    ///
    /// ## 参数验证规则
    /// - `base_url`: 必须以http://或https://开头
    /// - `model`: 不能为空
    pub fn validate(&self) -> Result<()> {
        if self.base_url.is_empty() {
            return Err(anyhow::anyhow!("Upstream base URL cannot be empty"));
        }

        if !self.base_url.starts_with("http://") && !self.base_url.starts_with("https://") {
            return Err(anyhow::anyhow!("Upstream base URL must start with http:// or https://"));
        }

        if self.model.is_empty() {
            return Err(anyhow::anyhow!("Upstream model cannot be empty"));
        }

        Ok(())
    }

    /// Inline credential first, then the named environment variable
    pub fn resolve_credential(&self) -> Option<String> {
        self.resolve_credential_with(|name| std::env::var(name).ok())
    }

    pub fn resolve_credential_with<F>(&self, lookup: F) -> Option<String>
    where
        F: Fn(&str) -> Option<String>,
    {
        self.credential
            .clone()
            .filter(|value| !value.is_empty())
            .or_else(|| {
                self.credential_env
                    .as_deref()
                    .and_then(|name| lookup(name))
                    .filter(|value| !value.is_empty())
            })
    }
}

impl LoggingConfig {
    /// 验证日志配置参数
    ///
    /// ## 参数验证规则
    /// - `level`: 必须是 "trace", "debug", "info", "warn", "error" 之一
    /// - `format`: 必须是 "json", "pretty", "compact" 之一
    pub fn validate(&self) -> Result<()> {
        let valid_levels = ["trace", "debug", "info", "warn", "error"];
        if !valid_levels.contains(&self.level.as_str()) {
            return Err(anyhow::anyhow!(
                "Invalid log level '{}': must be one of {:?}",
                self.level, valid_levels
            ));
        }

        let valid_formats = ["json", "pretty", "compact"];
        if !valid_formats.contains(&self.format.as_str()) {
            return Err(anyhow::anyhow!(
                "Invalid log format '{}': must be one of {:?}",
                self.format, valid_formats
            ));
        }

        Ok(())
    }
}
