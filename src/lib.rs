//! AI Trace Pipeline - AI 编码会话遥测管线
//!
//! 本地优先的会话采集与聚合：
//!
//! 核心功能：
//! - 📡 Collector 服务：HTTP 批量摄入 + WebSocket 实时会话流
//! - 📦 SQLite 持久化：单写入 worker 批量落盘，读路径直查
//! - 🔍 规范化：入站条目统一 role / 时间戳 / 派生标记
//! - 🤝 Agent 注册表：注册、心跳、过期清理（内存态）
//! - 🌐 Agent Hub：本地检测 + 多 collector 聚合的统一 agent 视图
//! - 👁️ 实时流：本地 JSONL tail 与远端 WS 重连流，产出同一种条目
//!
//! 架构：
//! ```text
//! agents ──POST /v1/traces──▶ normalizer ──▶ batch writer ──▶ SQLite
//!                                 │
//!                                 └──▶ pubsub ──▶ WS subscribers
//!
//! AgentHub ──▶ Detector (本地) + GET /v1/agents (远端) ──▶ 统一视图
//! ```

pub mod config;
pub mod error;
pub mod fingerprint;
pub mod hub;
pub mod normalizer;
pub mod pubsub;
pub mod registry;
pub mod schema;
pub mod server;
pub mod store;
pub mod tickets;
pub mod types;

pub use config::{CollectorConfig, HubConfig};
pub use error::{Error, Result};
pub use hub::AgentHub;
pub use pubsub::SessionPubSub;
pub use registry::AgentRegistry;
pub use server::CollectorServer;
pub use store::TraceStore;
pub use tickets::TicketStore;
pub use types::{
    AgentInfo, AgentRegistration, CollectorStats, IngestEntry, IngestRequest, IngestResponse,
    Role, SessionActivityEvent, SessionFilter, SessionSummary,
};
