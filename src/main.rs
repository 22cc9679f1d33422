use std::path::PathBuf;

use anyhow::Context;
use clap::Parser;
use universal_ai_proxy::{config::LoggingConfig, load_config, start_server};
use tracing_subscriber::{
    fmt::{self, format::FmtSpan},
    layer::SubscriberExt,
    util::SubscriberInitExt,
    EnvFilter, Layer,
};

/// Forward chat-completion requests to a single configured AI upstream
#[derive(Parser, Debug)]
#[command(name = "universal-ai-proxy", version, about)]
struct Cli {
    /// Path to the TOML configuration file
    #[arg(short, long, default_value = universal_ai_proxy::config::DEFAULT_CONFIG_PATH)]
    config: PathBuf,

    /// Override the listen host
    #[arg(long)]
    host: Option<String>,

    /// Override the listen port
    #[arg(short, long)]
    port: Option<u16>,

    /// Override the upstream to forward to
    #[arg(short, long)]
    upstream: Option<String>,
}

/// 主函数 - 网关服务的入口点
///
/// 负责加载配置、初始化日志系统并启动HTTP服务器
#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    // 加载配置文件和环境变量配置；没有任何上游凭证时直接退出
    let mut config = load_config(&cli.config)?;

    if let Some(host) = cli.host {
        config.server.host = host;
    }
    if let Some(port) = cli.port {
        config.server.port = port;
    }
    if let Some(upstream) = cli.upstream {
        config.gateway.upstream = upstream;
        config.validate().context("Invalid --upstream")?;
    }

    init_tracing(&config.logging)?;

    tracing::info!(
        host = %config.server.host,
        port = config.server.port,
        upstream = %config.gateway.upstream,
        upstreams_count = config.upstreams.len(),
        "Configuration loaded successfully"
    );

    start_server(config).await?;

    Ok(())
}

/// 初始化结构化日志系统
///
/// RUST_LOG 优先，否则使用配置中的日志级别；格式支持 json / pretty / compact
fn init_tracing(logging: &LoggingConfig) -> anyhow::Result<()> {
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        EnvFilter::new(format!(
            "universal_ai_proxy={},tower_http=debug",
            logging.level
        ))
    });

    let fmt_layer = match logging.format.as_str() {
        "pretty" => fmt::layer().pretty().boxed(),
        "compact" => fmt::layer().compact().with_target(false).boxed(),
        _ => fmt::layer()
            .with_target(true)
            .with_file(true)
            .with_line_number(true)
            .with_span_events(FmtSpan::CLOSE)
            .json()
            .boxed(),
    };

    tracing_subscriber::registry()
        .with(env_filter)
        .with(fmt_layer)
        .try_init()
        .context("Failed to initialize tracing")?;

    tracing::info!("Structured logging system initialized");
    Ok(())
}
