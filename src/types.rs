//! 数据类型定义

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;

/// 条目角色
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    User,
    Assistant,
    ToolUse,
    ToolResult,
    System,
}

impl FromStr for Role {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "user" => Ok(Role::User),
            "assistant" => Ok(Role::Assistant),
            "tool_use" => Ok(Role::ToolUse),
            "tool_result" => Ok(Role::ToolResult),
            "system" => Ok(Role::System),
            _ => Err(format!("invalid role: {}", s)),
        }
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Role::User => write!(f, "user"),
            Role::Assistant => write!(f, "assistant"),
            Role::ToolUse => write!(f, "tool_use"),
            Role::ToolResult => write!(f, "tool_result"),
            Role::System => write!(f, "system"),
        }
    }
}

/// Exporter 上报的批量请求（POST /v1/traces）
///
/// 到达后即被拆解：session 聚合 + 逐条 entry，不整体存储。
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct IngestRequest {
    #[serde(default)]
    pub instance_id: String,
    #[serde(default)]
    pub source: String,
    #[serde(default)]
    pub project_path: String,
    #[serde(default)]
    pub session_id: String,
    #[serde(default)]
    pub entries: Vec<IngestEntry>,
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub metadata: HashMap<String, serde_json::Value>,
}

/// 单条 trace 条目
///
/// `has_thinking` / `has_tool_use` 使用 `Option<bool>`：
/// 缺省时由 `thinking_len` / `tool_name` 推导，显式 false 不会被覆盖。
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct IngestEntry {
    #[serde(default)]
    pub uuid: String,
    #[serde(default)]
    pub role: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timestamp: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub model: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub text: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub tool_name: String,
    #[serde(default)]
    pub is_error: bool,
    #[serde(default)]
    pub input_tokens: i64,
    #[serde(default)]
    pub output_tokens: i64,
    #[serde(default)]
    pub thinking_len: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub has_thinking: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub has_tool_use: Option<bool>,
}

impl IngestEntry {
    /// 归一化后的时间戳（毫秒）；归一化保证 timestamp 非空
    pub fn timestamp_ms(&self) -> i64 {
        self.timestamp
            .unwrap_or_else(Utc::now)
            .timestamp_millis()
    }
}

/// POST /v1/traces 响应
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IngestResponse {
    pub accepted: usize,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

/// Agent 注册请求（POST /v1/agents/register）
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AgentRegistration {
    #[serde(default)]
    pub instance_id: String,
    #[serde(default)]
    pub platform: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub region: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub project: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub hostname: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub version: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub machine_id: String,
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub metadata: HashMap<String, serde_json::Value>,
}

/// Agent 状态（派生字段，由心跳时间计算）
pub mod agent_status {
    pub const ACTIVE: &str = "active";
    pub const STALE: &str = "stale";
}

/// 已注册的 exporter agent
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AgentInfo {
    pub instance_id: String,
    #[serde(default)]
    pub platform: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub region: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub hostname: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub version: String,
    /// 心跳先于注册创建的 agent 此字段为空，由后续注册回填
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,
    pub last_heartbeat: DateTime<Utc>,
    #[serde(default)]
    pub trace_count: i64,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub project: String,
    /// "active" 或 "stale"
    pub status: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub machine_id: String,
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub metadata: HashMap<String, serde_json::Value>,
}

/// 会话生命周期状态（由 activity 事件维护；从未上报过的会话为空）
pub mod session_status {
    pub const ACTIVE: &str = "active";
    pub const ENDED: &str = "ended";
}

/// 会话聚合摘要（持久化，按 session_id 主键）
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionSummary {
    pub id: String,
    pub project_path: String,
    pub source: String,
    pub instance_id: String,
    pub model: String,
    pub entry_count: i64,
    pub first_seen: DateTime<Utc>,
    pub last_updated: DateTime<Utc>,
    /// "active" / "ended"，未上报过生命周期事件时为空
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub status: String,
    /// 最近一次生命周期事件时间
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_activity: Option<DateTime<Utc>>,
}

/// exporter 上报的会话生命周期事件（POST /v1/sessions/activity）
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SessionActivityEvent {
    #[serde(default)]
    pub instance_id: String,
    #[serde(default)]
    pub source: String,
    #[serde(default)]
    pub project_path: String,
    #[serde(default)]
    pub session_id: String,
    /// "session_start" / "session_active" / "session_end"
    #[serde(default)]
    pub event: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timestamp: Option<DateTime<Utc>>,
}

/// 会话查询过滤条件
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SessionFilter {
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub source: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub project_path: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub instance_id: String,
    /// 只返回状态为 active 的会话
    #[serde(default)]
    pub active_only: bool,
    #[serde(default)]
    pub limit: usize,
    #[serde(default)]
    pub offset: usize,
}

/// Collector 统计信息（GET /v1/stats）
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CollectorStats {
    pub total_traces: i64,
    pub total_sessions: i64,
    pub total_agents: usize,
    pub active_agents: usize,
    pub db_size_bytes: i64,
    pub uptime_seconds: f64,
    pub started_at: DateTime<Utc>,
}

/// API 错误响应
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorResponse {
    pub error: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}
