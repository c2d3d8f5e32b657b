//! Agent 注册表
//!
//! 跟踪 exporter agent 的存活状态：注册、心跳、staleness 清理

use std::collections::HashMap;
use std::time::Duration;

use chrono::{DateTime, Utc};
use parking_lot::RwLock;

use crate::config::STALE_AGENT_THRESHOLD;
use crate::types::{agent_status, AgentInfo, AgentRegistration};

/// Agent 注册表（纯内存，进程生命周期）
pub struct AgentRegistry {
    agents: RwLock<HashMap<String, AgentInfo>>,
}

impl AgentRegistry {
    /// 创建新的注册表
    pub fn new() -> Self {
        Self {
            agents: RwLock::new(HashMap::new()),
        }
    }

    /// 注册或更新一个 agent，返回当前信息
    ///
    /// 心跳先于注册创建的条目 `started_at` 为空，在此回填。
    pub fn register(&self, reg: AgentRegistration) -> AgentInfo {
        let now = Utc::now();
        let mut agents = self.agents.write();

        let info = agents
            .entry(reg.instance_id.clone())
            .or_insert_with(|| AgentInfo {
                instance_id: reg.instance_id.clone(),
                last_heartbeat: now,
                ..Default::default()
            });

        info.platform = reg.platform;
        info.region = reg.region;
        info.hostname = reg.hostname;
        info.version = reg.version;
        info.project = reg.project;
        info.machine_id = reg.machine_id;
        info.last_heartbeat = now;
        info.status = agent_status::ACTIVE.to_string();
        if info.started_at.is_none() {
            info.started_at = reg.started_at;
        }
        if !reg.metadata.is_empty() {
            info.metadata = reg.metadata;
        }

        info.clone()
    }

    /// 更新心跳时间
    ///
    /// 未注册的 agent 会创建一个最小条目，保证活跃上报的 exporter
    /// 即使没有显式注册也可见。返回该 agent 此前是否已存在。
    pub fn heartbeat(&self, instance_id: &str) -> bool {
        if instance_id.is_empty() {
            return false;
        }

        let now = Utc::now();
        let mut agents = self.agents.write();
        match agents.get_mut(instance_id) {
            Some(info) => {
                info.last_heartbeat = now;
                info.status = agent_status::ACTIVE.to_string();
                true
            }
            None => {
                agents.insert(
                    instance_id.to_string(),
                    AgentInfo {
                        instance_id: instance_id.to_string(),
                        last_heartbeat: now,
                        status: agent_status::ACTIVE.to_string(),
                        ..Default::default()
                    },
                );
                false
            }
        }
    }

    /// 累加 trace 计数（同时刷新心跳）
    pub fn increment_trace_count(&self, instance_id: &str, count: i64) {
        if instance_id.is_empty() {
            return;
        }

        let now = Utc::now();
        let mut agents = self.agents.write();
        let info = agents
            .entry(instance_id.to_string())
            .or_insert_with(|| AgentInfo {
                instance_id: instance_id.to_string(),
                last_heartbeat: now,
                ..Default::default()
            });
        info.trace_count += count;
        info.last_heartbeat = now;
        info.status = agent_status::ACTIVE.to_string();
    }

    /// 所有 agent 的快照，status 按当前心跳年龄派生
    pub fn list(&self) -> Vec<AgentInfo> {
        let now = Utc::now();
        let agents = self.agents.read();
        agents
            .values()
            .map(|info| {
                let mut cp = info.clone();
                cp.status = if is_stale(now, info.last_heartbeat, STALE_AGENT_THRESHOLD) {
                    agent_status::STALE.to_string()
                } else {
                    agent_status::ACTIVE.to_string()
                };
                cp
            })
            .collect()
    }

    /// 移除心跳超过 max_age 的 agent，返回移除数量
    pub fn clean_stale(&self, max_age: Duration) -> usize {
        let now = Utc::now();
        let mut agents = self.agents.write();
        let before = agents.len();
        agents.retain(|_, info| !is_stale(now, info.last_heartbeat, max_age));
        before - agents.len()
    }

    /// 总数与活跃数
    pub fn count(&self) -> (usize, usize) {
        let now = Utc::now();
        let agents = self.agents.read();
        let total = agents.len();
        let active = agents
            .values()
            .filter(|info| !is_stale(now, info.last_heartbeat, STALE_AGENT_THRESHOLD))
            .count();
        (total, active)
    }
}

impl Default for AgentRegistry {
    fn default() -> Self {
        Self::new()
    }
}

fn is_stale(now: DateTime<Utc>, last_heartbeat: DateTime<Utc>, threshold: Duration) -> bool {
    (now - last_heartbeat).to_std().unwrap_or_default() > threshold
}
