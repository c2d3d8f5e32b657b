//! WebSocket 单次认证 ticket
//!
//! 浏览器端无法在 WebSocket 升级时携带 Authorization 头：
//! 先用 bearer token 换取一张限时单次 ticket，再以查询参数连接。

use std::collections::HashMap;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use uuid::Uuid;

use crate::config::DEFAULT_TICKET_TTL;

struct TicketEntry {
    expires_at: Instant,
    session_id: String,
}

/// Ticket 存储（纯内存）
pub struct TicketStore {
    tickets: Mutex<HashMap<String, TicketEntry>>,
    ttl: Duration,
}

impl TicketStore {
    /// 创建 ticket 存储（默认 30s 有效期）
    pub fn new() -> Self {
        Self::with_ttl(DEFAULT_TICKET_TTL)
    }

    /// 指定有效期创建（测试用）
    pub fn with_ttl(ttl: Duration) -> Self {
        Self {
            tickets: Mutex::new(HashMap::new()),
            ttl,
        }
    }

    /// 签发一张绑定到 session 的单次 ticket
    pub fn issue(&self, session_id: &str) -> String {
        let ticket = Uuid::new_v4().simple().to_string();

        self.tickets.lock().insert(
            ticket.clone(),
            TicketEntry {
                expires_at: Instant::now() + self.ttl,
                session_id: session_id.to_string(),
            },
        );

        ticket
    }

    /// 校验并销毁一张 ticket
    ///
    /// 查到即删除（无论是否有效），防止重放探测；
    /// 仅当未过期且 session 匹配时返回 true。
    pub fn redeem(&self, ticket: &str, session_id: &str) -> bool {
        let entry = match self.tickets.lock().remove(ticket) {
            Some(e) => e,
            None => return false,
        };

        if Instant::now() > entry.expires_at {
            return false;
        }
        entry.session_id == session_id
    }

    /// 清理过期未兑换的 ticket
    pub fn cleanup(&self) {
        let now = Instant::now();
        self.tickets.lock().retain(|_, e| now <= e.expires_at);
    }

    /// 当前存量（测试用）
    pub fn len(&self) -> usize {
        self.tickets.lock().len()
    }

    /// 是否为空
    pub fn is_empty(&self) -> bool {
        self.tickets.lock().is_empty()
    }
}

impl Default for TicketStore {
    fn default() -> Self {
        Self::new()
    }
}
