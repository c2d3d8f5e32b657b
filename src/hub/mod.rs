//! Agent Hub：本地检测 + 远端 collector 聚合的统一 agent 视图
//!
//! Hub 周期性地将两路来源合并进一个 map：
//! - 本地：外部 `Detector` 扫描出的活跃会话（machine_id 取本机指纹）
//! - 远端：逐个轮询 collector 的 `/v1/agents`
//!
//! 每轮用新 map 整体替换旧 map，并把差异以 `AgentEvent` 广播给订阅者。
//! 某个 collector 拉取失败只记日志，不影响其它来源。

pub mod local;
pub mod remote;
pub mod types;

use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use parking_lot::RwLock;
use serde::Deserialize;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

pub use local::{parse_jsonl_line, stream_local, STREAM_ENDING_TEXT};
pub use remote::{stream_remote, RETRYING_TEXT};
pub use types::{
    AgentEvent, AgentFilter, ContentBlock, Detector, LocalAgent, StreamEntry, UnifiedAgent,
};

use crate::config::HubConfig;
use crate::error::{Error, Result};
use crate::fingerprint;
use crate::types::AgentInfo;

/// 单个 collector 的拉取超时
const REMOTE_FETCH_TIMEOUT: Duration = Duration::from_secs(5);
/// 事件订阅者的通道容量
const EVENT_BUFFER: usize = 64;
/// 打开流时默认回放的条目数
pub const DEFAULT_BACKLOG: usize = 50;

struct EventSubscriber {
    id: u64,
    tx: mpsc::Sender<AgentEvent>,
}

struct HubInner {
    agents: HashMap<String, UnifiedAgent>,
    subscribers: Vec<EventSubscriber>,
    next_sub_id: u64,
}

/// 统一 agent 视图的所有者
pub struct AgentHub {
    config: HubConfig,
    detector: Option<Arc<dyn Detector>>,
    local_fingerprint: String,
    hostname: String,
    client: reqwest::Client,
    inner: RwLock<HubInner>,
}

/// `/v1/agents` 的响应体
#[derive(Deserialize)]
struct AgentListResponse {
    #[serde(default)]
    agents: Vec<AgentInfo>,
}

impl AgentHub {
    pub fn new(config: HubConfig, detector: Option<Arc<dyn Detector>>) -> Self {
        let client = reqwest::Client::builder()
            .timeout(REMOTE_FETCH_TIMEOUT)
            .build()
            .unwrap_or_default();
        Self {
            config,
            detector,
            local_fingerprint: fingerprint::machine_id(),
            hostname: fingerprint::hostname(),
            client,
            inner: RwLock::new(HubInner {
                agents: HashMap::new(),
                subscribers: Vec::new(),
                next_sub_id: 0,
            }),
        }
    }

    /// 本机指纹，用于 is_local 判定
    pub fn local_fingerprint(&self) -> &str {
        &self.local_fingerprint
    }

    /// 按过滤条件返回 agent 快照，最近活跃的在前
    pub fn agents(&self, filter: &AgentFilter) -> Vec<UnifiedAgent> {
        let inner = self.inner.read();
        let mut list: Vec<UnifiedAgent> = inner
            .agents
            .values()
            .filter(|a| filter.matches(a, &self.local_fingerprint))
            .cloned()
            .collect();
        list.sort_by(|a, b| b.last_seen.cmp(&a.last_seen).then(a.id.cmp(&b.id)));
        list
    }

    pub fn get(&self, agent_id: &str) -> Option<UnifiedAgent> {
        self.inner.read().agents.get(agent_id).cloned()
    }

    /// 订阅 agent 列表变化
    pub fn subscribe(&self) -> (u64, mpsc::Receiver<AgentEvent>) {
        let (tx, rx) = mpsc::channel(EVENT_BUFFER);
        let mut inner = self.inner.write();
        inner.next_sub_id += 1;
        let id = inner.next_sub_id;
        inner.subscribers.push(EventSubscriber { id, tx });
        (id, rx)
    }

    pub fn unsubscribe(&self, sub_id: u64) {
        let mut inner = self.inner.write();
        inner.subscribers.retain(|s| s.id != sub_id);
    }

    /// 执行一轮合并，返回合并后的 agent 总数
    pub async fn poll_once(&self) -> usize {
        let mut next: HashMap<String, UnifiedAgent> = HashMap::new();

        if let Some(detector) = &self.detector {
            match detector.detect() {
                Ok(locals) => {
                    for agent in locals {
                        let unified = self.local_to_unified(agent);
                        next.insert(unified.id.clone(), unified);
                    }
                }
                Err(e) => tracing::warn!("🔍 Local detection failed: {}", e),
            }
        }

        for base in &self.config.collector_urls {
            match self.fetch_remote_agents(base).await {
                Ok(remotes) => {
                    for agent in remotes {
                        next.insert(agent.id.clone(), agent);
                    }
                }
                Err(e) => tracing::warn!("📡 Collector {} unreachable: {}", base, e),
            }
        }

        let (count, events) = {
            let mut inner = self.inner.write();
            let events = diff_agents(&inner.agents, &next);
            inner.agents = next;
            (inner.agents.len(), events)
        };

        for event in events {
            self.broadcast(event);
        }
        count
    }

    /// 周期轮询，直到取消
    pub async fn run(&self, cancel: CancellationToken) {
        let mut ticker = tokio::time::interval(self.config.poll_interval);
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    let count = self.poll_once().await;
                    tracing::debug!("🔄 Hub poll complete: {} agents", count);
                    // 顺带清理已断开的订阅者
                    self.inner.write().subscribers.retain(|s| !s.tx.is_closed());
                }
                _ = cancel.cancelled() => {
                    tracing::info!("🛑 Agent hub stopped");
                    return;
                }
            }
        }
    }

    /// 打开某个 agent 的实时条目流
    ///
    /// 本地 agent 直接 tail 会话文件，远端 agent 走 collector 的
    /// WebSocket；两路产出相同的 `StreamEntry`。
    pub async fn stream(
        &self,
        agent_id: &str,
        backlog: usize,
        cancel: CancellationToken,
    ) -> Result<mpsc::Receiver<StreamEntry>> {
        let agent = self
            .get(agent_id)
            .ok_or_else(|| Error::Validation(format!("unknown agent: {}", agent_id)))?;

        if agent.is_local(&self.local_fingerprint) && !agent.session_path.is_empty() {
            return stream_local(Path::new(&agent.session_path), backlog, cancel).await;
        }

        if !agent.collector_url.is_empty() {
            let url = format!(
                "{}/v1/sessions/{}/ws",
                http_to_ws(&agent.collector_url),
                agent.session_id
            );
            return Ok(stream_remote(url, self.config.token.clone(), cancel));
        }

        Err(Error::Validation(format!(
            "agent {} has neither a session file nor a collector",
            agent_id
        )))
    }

    fn local_to_unified(&self, agent: LocalAgent) -> UnifiedAgent {
        UnifiedAgent {
            id: agent.session_id.clone(),
            source: agent.source,
            project_path: agent.project_path,
            session_id: agent.session_id,
            hostname: self.hostname.clone(),
            status: crate::types::agent_status::ACTIVE.to_string(),
            detected_at: agent.detected_at,
            last_seen: Some(Utc::now()),
            machine_id: self.local_fingerprint.clone(),
            machine_name: self.hostname.clone(),
            method: agent.method,
            ide: agent.ide,
            pid: agent.pid,
            session_path: agent.session_path,
            ..Default::default()
        }
    }

    async fn fetch_remote_agents(&self, base: &str) -> anyhow::Result<Vec<UnifiedAgent>> {
        let mut request = self.client.get(format!("{}/v1/agents", base));
        if let Some(token) = &self.config.token {
            request = request.bearer_auth(token);
        }
        let response = request.send().await?.error_for_status()?;
        let list: AgentListResponse = response.json().await?;

        Ok(list
            .agents
            .into_iter()
            .map(|info| remote_to_unified(info, base))
            .collect())
    }

    fn broadcast(&self, event: AgentEvent) {
        let senders: Vec<mpsc::Sender<AgentEvent>> = {
            let inner = self.inner.read();
            inner.subscribers.iter().map(|s| s.tx.clone()).collect()
        };
        for tx in senders {
            if let Err(mpsc::error::TrySendError::Full(_)) = tx.try_send(event.clone()) {
                tracing::warn!("🐌 Agent event subscriber inbox full, dropping event");
            }
        }
    }
}

fn remote_to_unified(info: AgentInfo, collector_url: &str) -> UnifiedAgent {
    UnifiedAgent {
        id: info.instance_id.clone(),
        source: info.platform,
        project_path: info.project,
        session_id: info.instance_id.clone(),
        hostname: info.hostname,
        status: info.status,
        detected_at: info.started_at,
        last_seen: Some(info.last_heartbeat),
        machine_id: info.machine_id,
        instance_id: info.instance_id,
        region: info.region,
        version: info.version,
        trace_count: info.trace_count,
        collector_url: collector_url.trim_end_matches('/').to_string(),
        ..Default::default()
    }
}

/// 新旧 map 对比，产出 Added / Updated / Removed 事件
///
/// 两轮都在场的 agent 一律发 Updated：一次轮询就是一次观测，
/// 订阅者以此刷新 last_seen 等时变字段，无需字段级比较。
fn diff_agents(
    old: &HashMap<String, UnifiedAgent>,
    new: &HashMap<String, UnifiedAgent>,
) -> Vec<AgentEvent> {
    let mut events = Vec::new();
    for (id, agent) in new {
        if old.contains_key(id) {
            events.push(AgentEvent::Updated(agent.clone()));
        } else {
            events.push(AgentEvent::Added(agent.clone()));
        }
    }
    for (id, agent) in old {
        if !new.contains_key(id) {
            events.push(AgentEvent::Removed(agent.clone()));
        }
    }
    events
}

/// http(s) 基地址转成对应的 ws(s) 地址
fn http_to_ws(base: &str) -> String {
    let base = base.trim_end_matches('/');
    if let Some(rest) = base.strip_prefix("https://") {
        format!("wss://{}", rest)
    } else if let Some(rest) = base.strip_prefix("http://") {
        format!("ws://{}", rest)
    } else {
        base.to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn agent(id: &str, status: &str, count: i64) -> UnifiedAgent {
        UnifiedAgent {
            id: id.to_string(),
            session_id: id.to_string(),
            status: status.to_string(),
            trace_count: count,
            ..Default::default()
        }
    }

    #[test]
    fn test_diff_added_updated_removed() {
        let mut old = HashMap::new();
        old.insert("a".to_string(), agent("a", "active", 1));
        old.insert("b".to_string(), agent("b", "active", 1));

        let mut new = HashMap::new();
        new.insert("a".to_string(), agent("a", "stale", 1));
        new.insert("c".to_string(), agent("c", "active", 0));

        let events = diff_agents(&old, &new);
        assert_eq!(events.len(), 3);
        assert!(events
            .iter()
            .any(|e| matches!(e, AgentEvent::Updated(a) if a.id == "a" && a.status == "stale")));
        assert!(events
            .iter()
            .any(|e| matches!(e, AgentEvent::Added(a) if a.id == "c")));
        assert!(events
            .iter()
            .any(|e| matches!(e, AgentEvent::Removed(a) if a.id == "b")));
    }

    #[test]
    fn test_diff_present_in_both_is_always_updated() {
        // 字段没变也要发 Updated：每轮轮询都是一次观测
        let mut old = HashMap::new();
        old.insert("a".to_string(), agent("a", "active", 5));
        let new = old.clone();
        let events = diff_agents(&old, &new);
        assert_eq!(events.len(), 1);
        assert!(matches!(&events[0], AgentEvent::Updated(a) if a.id == "a"));
    }

    #[test]
    fn test_diff_carries_new_snapshot_in_update() {
        let mut old = HashMap::new();
        old.insert("a".to_string(), agent("a", "active", 5));
        let mut new = HashMap::new();
        new.insert("a".to_string(), agent("a", "stale", 6));
        let events = diff_agents(&old, &new);
        assert_eq!(events.len(), 1);
        assert!(matches!(
            &events[0],
            AgentEvent::Updated(a) if a.trace_count == 6 && a.status == "stale"
        ));
    }

    #[test]
    fn test_http_to_ws() {
        assert_eq!(http_to_ws("http://localhost:8785"), "ws://localhost:8785");
        assert_eq!(
            http_to_ws("https://collector.example/"),
            "wss://collector.example"
        );
    }

    #[tokio::test]
    async fn test_subscribe_receives_broadcast() {
        let hub = AgentHub::new(HubConfig::default(), None);
        let (_id, mut rx) = hub.subscribe();
        hub.broadcast(AgentEvent::Added(agent("a", "active", 0)));
        let event = rx.recv().await.unwrap();
        assert_eq!(event.agent().id, "a");
    }

    #[tokio::test]
    async fn test_unsubscribe_closes_inbox() {
        let hub = AgentHub::new(HubConfig::default(), None);
        let (id, mut rx) = hub.subscribe();
        hub.unsubscribe(id);
        assert!(rx.recv().await.is_none());
    }

    #[tokio::test]
    async fn test_poll_with_no_sources_is_empty() {
        let hub = AgentHub::new(HubConfig::default(), None);
        assert_eq!(hub.poll_once().await, 0);
    }
}
