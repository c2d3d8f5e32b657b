//! Agent Hub 数据类型

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// 统一的 agent 形态，本地与远端共用一个 shape
///
/// 本地 / 远端不是类型层级：`is_local(fingerprint)` 一个布尔函数派生。
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct UnifiedAgent {
    pub id: String,
    /// "claude", "codex", "gemini" 等
    pub source: String,
    #[serde(default)]
    pub project_path: String,
    pub session_id: String,
    #[serde(default)]
    pub hostname: String,
    /// "active", "stale", "ended"
    pub status: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub detected_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_seen: Option<DateTime<Utc>>,
    /// 机器指纹
    #[serde(default)]
    pub machine_id: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub machine_name: String,

    // 仅本地 agent 有
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub method: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub ide: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pid: Option<u32>,
    /// 会话文件路径，直接 tail 用
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub session_path: String,

    // 仅远端 agent 有
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub instance_id: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub region: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub version: String,
    #[serde(default)]
    pub trace_count: i64,
    /// 来源 collector 的基地址
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub collector_url: String,
}

impl UnifiedAgent {
    /// 该 agent 是否运行在本机
    pub fn is_local(&self, local_fingerprint: &str) -> bool {
        !self.machine_id.is_empty() && self.machine_id == local_fingerprint
    }
}

/// Agent 列表过滤条件
#[derive(Debug, Clone, Default)]
pub struct AgentFilter {
    pub source: Option<String>,
    pub status: Option<String>,
    pub machine_id: Option<String>,
    pub local_only: bool,
    pub remote_only: bool,
}

impl AgentFilter {
    /// agent 是否满足全部过滤条件；local_fp 为本机指纹
    pub fn matches(&self, agent: &UnifiedAgent, local_fp: &str) -> bool {
        if let Some(ref source) = self.source {
            if &agent.source != source {
                return false;
            }
        }
        if let Some(ref status) = self.status {
            if &agent.status != status {
                return false;
            }
        }
        if let Some(ref machine_id) = self.machine_id {
            if &agent.machine_id != machine_id {
                return false;
            }
        }
        if self.local_only && !agent.is_local(local_fp) {
            return false;
        }
        if self.remote_only && agent.is_local(local_fp) {
            return false;
        }
        true
    }
}

/// Agent 列表变化事件
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", content = "agent", rename_all = "lowercase")]
pub enum AgentEvent {
    Added(UnifiedAgent),
    Updated(UnifiedAgent),
    Removed(UnifiedAgent),
}

impl AgentEvent {
    /// 事件涉及的 agent
    pub fn agent(&self) -> &UnifiedAgent {
        match self {
            AgentEvent::Added(a) | AgentEvent::Updated(a) | AgentEvent::Removed(a) => a,
        }
    }
}

/// 内容块（Claude 风格会话文件的结构化内容）
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ContentBlock {
    Text {
        text: String,
    },
    Thinking {
        thinking: String,
    },
    ToolUse {
        tool_name: String,
        #[serde(default, skip_serializing_if = "String::is_empty")]
        tool_use_id: String,
    },
    ToolResult {
        result: String,
        #[serde(default)]
        is_error: bool,
    },
}

/// 实时流的统一条目，两种流来源（本地 tail / 远端 WS）共用
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct StreamEntry {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timestamp: Option<DateTime<Utc>>,
    pub role: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub text: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub model: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub tool_name: String,
    #[serde(default)]
    pub is_error: bool,
    #[serde(default)]
    pub input_tokens: i64,
    #[serde(default)]
    pub output_tokens: i64,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub session_id: String,
    /// 流层注入的状态消息（"connection lost" 等），不会向上游持久化
    #[serde(default)]
    pub synthetic: bool,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub content_blocks: Vec<ContentBlock>,
}

impl StreamEntry {
    /// 构造一条流层注入的状态消息
    pub fn synthetic(text: &str) -> Self {
        Self {
            timestamp: Some(Utc::now()),
            role: "system".to_string(),
            text: text.to_string(),
            synthetic: true,
            ..Default::default()
        }
    }
}

/// 外部检测器发现的本地活跃会话（collaborator 契约）
#[derive(Debug, Clone, Default)]
pub struct LocalAgent {
    pub session_id: String,
    pub source: String,
    pub project_path: String,
    /// 会话文件路径
    pub session_path: String,
    pub method: String,
    pub ide: String,
    pub pid: Option<u32>,
    pub detected_at: Option<DateTime<Utc>>,
}

/// 本地活跃会话检测（OS 层扫描由外部实现）
pub trait Detector: Send + Sync {
    /// 返回当前检测到的本地活跃会话
    fn detect(&self) -> anyhow::Result<Vec<LocalAgent>>;
}
