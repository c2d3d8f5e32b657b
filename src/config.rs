//! Collector / Hub 配置

use std::path::PathBuf;
use std::time::Duration;

/// 默认监听端口
pub const DEFAULT_PORT: u16 = 8785;
/// 默认批量刷盘的条目阈值
pub const DEFAULT_BATCH_SIZE: usize = 100;
/// 默认定时刷盘间隔
pub const DEFAULT_FLUSH_INTERVAL: Duration = Duration::from_secs(2);
/// WebSocket ticket 有效期
pub const DEFAULT_TICKET_TTL: Duration = Duration::from_secs(30);
/// 心跳超过此时长视为 stale
pub const STALE_AGENT_THRESHOLD: Duration = Duration::from_secs(5 * 60);

/// Collector 服务配置
#[derive(Debug, Clone)]
pub struct CollectorConfig {
    /// 监听地址
    pub host: String,
    /// 监听端口
    pub port: u16,
    /// 数据库文件路径
    pub db_path: PathBuf,
    /// Bearer token（为空时不启用鉴权）
    pub token: Option<String>,
    /// 批量刷盘的条目阈值
    pub batch_size: usize,
    /// 定时刷盘间隔
    pub flush_interval: Duration,
}

impl CollectorConfig {
    /// 从环境变量或默认路径创建配置
    ///
    /// - `AI_TRACE_DB_PATH`: 数据库路径覆盖
    /// - `AI_TRACE_TOKEN`: Bearer token
    /// - `AI_TRACE_PORT`: 端口覆盖
    pub fn from_env() -> Self {
        let mut cfg = Self::default();

        if let Ok(path) = std::env::var("AI_TRACE_DB_PATH") {
            cfg.db_path = PathBuf::from(path);
        }
        if let Ok(token) = std::env::var("AI_TRACE_TOKEN") {
            if !token.is_empty() {
                cfg.token = Some(token);
            }
        }
        if let Ok(port) = std::env::var("AI_TRACE_PORT") {
            if let Ok(p) = port.parse() {
                cfg.port = p;
            }
        }

        cfg
    }

    /// 默认数据目录（~/.ai-trace）
    pub fn default_data_dir() -> PathBuf {
        dirs::home_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join(".ai-trace")
    }
}

impl Default for CollectorConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: DEFAULT_PORT,
            db_path: Self::default_data_dir().join("collector.db"),
            token: None,
            batch_size: DEFAULT_BATCH_SIZE,
            flush_interval: DEFAULT_FLUSH_INTERVAL,
        }
    }
}

/// Agent Hub 配置
#[derive(Debug, Clone)]
pub struct HubConfig {
    /// 远端 collector 基地址列表（如 "http://host:8785"）
    pub collector_urls: Vec<String>,
    /// 轮询间隔
    pub poll_interval: Duration,
    /// 访问远端 collector 的 Bearer token
    pub token: Option<String>,
}

impl Default for HubConfig {
    fn default() -> Self {
        Self {
            collector_urls: Vec::new(),
            poll_interval: Duration::from_secs(5),
            token: None,
        }
    }
}
