//! trace-collector - AI 编码会话遥测采集服务
//!
//! 负责：
//! - HTTP 批量摄入 + 规范化
//! - SQLite 批量落盘（唯一写入者）
//! - Agent 注册与心跳
//! - WebSocket 实时会话流

use ai_trace_pipeline::{CollectorConfig, CollectorServer};
use anyhow::Result;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

#[tokio::main]
async fn main() -> Result<()> {
    // 初始化日志
    tracing_subscriber::registry()
        .with(fmt::layer())
        .with(EnvFilter::from_default_env().add_directive("ai_trace_pipeline=debug".parse()?))
        .init();

    tracing::info!("🚀 trace-collector v{}", env!("CARGO_PKG_VERSION"));

    let config = CollectorConfig::from_env();
    tracing::info!("📂 Database: {:?}", config.db_path);

    let server = CollectorServer::new(config)?;

    let cancel = CancellationToken::new();
    let shutdown = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::info!("🛑 Shutdown signal received");
            shutdown.cancel();
        }
    });

    server.run(cancel).await?;

    tracing::info!("👋 trace-collector exiting");
    Ok(())
}
