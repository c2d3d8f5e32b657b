//! 会话级事件扇出
//!
//! 将新摄入的条目实时推送给订阅该会话的 WebSocket 观看者。
//! 纯内存，进程重启丢失在途订阅（观看者重连后重新回填）。

use std::collections::HashMap;

use parking_lot::RwLock;
use tokio::sync::mpsc;

use crate::types::IngestEntry;

/// 订阅者收件箱容量；写满即丢弃该次推送（只影响慢订阅者自己）
const SUBSCRIBER_BUFFER: usize = 64;

/// 订阅 ID
pub type SubscriptionId = u64;

struct Subscriber {
    id: SubscriptionId,
    tx: mpsc::Sender<Vec<IngestEntry>>,
}

/// 会话级 Pub/Sub
pub struct SessionPubSub {
    inner: RwLock<PubSubInner>,
}

struct PubSubInner {
    subs: HashMap<String, Vec<Subscriber>>,
    next_id: SubscriptionId,
}

impl SessionPubSub {
    /// 创建新的 Pub/Sub
    pub fn new() -> Self {
        Self {
            inner: RwLock::new(PubSubInner {
                subs: HashMap::new(),
                next_id: 1,
            }),
        }
    }

    /// 订阅某会话的新条目，返回订阅 ID 与有界收件箱
    pub fn subscribe(
        &self,
        session_id: &str,
    ) -> (SubscriptionId, mpsc::Receiver<Vec<IngestEntry>>) {
        let (tx, rx) = mpsc::channel(SUBSCRIBER_BUFFER);

        let mut inner = self.inner.write();
        let id = inner.next_id;
        inner.next_id += 1;
        inner
            .subs
            .entry(session_id.to_string())
            .or_default()
            .push(Subscriber { id, tx });

        tracing::debug!("📡 Subscriber added: session_id={}, sub_id={}", session_id, id);
        (id, rx)
    }

    /// 取消订阅（幂等）：移除 sender，收件箱随之关闭
    pub fn unsubscribe(&self, session_id: &str, id: SubscriptionId) {
        let mut inner = self.inner.write();
        if let Some(subs) = inner.subs.get_mut(session_id) {
            subs.retain(|s| s.id != id);
            if subs.is_empty() {
                inner.subs.remove(session_id);
            }
            tracing::debug!("📡 Subscriber removed: session_id={}, sub_id={}", session_id, id);
        }
    }

    /// 向某会话的全部订阅者扇出一批条目
    ///
    /// 非阻塞：某订阅者收件箱满时仅丢弃它这一份，不影响发布方和其他订阅者。
    pub fn publish(&self, session_id: &str, entries: Vec<IngestEntry>) {
        let targets: Vec<(SubscriptionId, mpsc::Sender<Vec<IngestEntry>>)> = {
            let inner = self.inner.read();
            match inner.subs.get(session_id) {
                Some(subs) => subs.iter().map(|s| (s.id, s.tx.clone())).collect(),
                None => return,
            }
        };

        for (id, tx) in targets {
            if let Err(e) = tx.try_send(entries.clone()) {
                match e {
                    mpsc::error::TrySendError::Full(_) => {
                        tracing::warn!(
                            "📡 Subscriber inbox full, dropping publish: session_id={}, sub_id={}",
                            session_id,
                            id
                        );
                    }
                    mpsc::error::TrySendError::Closed(_) => {
                        tracing::debug!("📡 Subscriber gone: session_id={}, sub_id={}", session_id, id);
                    }
                }
            }
        }
    }

    /// 当前某会话的订阅者数量
    pub fn subscriber_count(&self, session_id: &str) -> usize {
        self.inner
            .read()
            .subs
            .get(session_id)
            .map(|s| s.len())
            .unwrap_or(0)
    }
}

impl Default for SessionPubSub {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(uuid: &str) -> IngestEntry {
        IngestEntry {
            uuid: uuid.to_string(),
            role: "assistant".to_string(),
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn test_publish_fans_out_to_session_subscribers() {
        let pubsub = SessionPubSub::new();
        let (_id1, mut rx1) = pubsub.subscribe("s1");
        let (_id2, mut rx2) = pubsub.subscribe("s1");
        let (_id3, mut rx3) = pubsub.subscribe("s2");

        pubsub.publish("s1", vec![entry("u1")]);

        assert_eq!(rx1.recv().await.unwrap()[0].uuid, "u1");
        assert_eq!(rx2.recv().await.unwrap()[0].uuid, "u1");
        // s2 的订阅者收不到
        assert!(rx3.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_unsubscribe_closes_inbox_once() {
        let pubsub = SessionPubSub::new();
        let (id, mut rx) = pubsub.subscribe("s1");

        pubsub.unsubscribe("s1", id);
        // 幂等：重复取消无副作用
        pubsub.unsubscribe("s1", id);

        assert!(rx.recv().await.is_none());
        assert_eq!(pubsub.subscriber_count("s1"), 0);
    }

    #[tokio::test]
    async fn test_full_inbox_drops_only_that_subscriber() {
        let pubsub = SessionPubSub::new();
        let (_slow, mut slow_rx) = pubsub.subscribe("s1");
        let (_fast, mut fast_rx) = pubsub.subscribe("s1");

        // 填满 slow 的收件箱
        for i in 0..SUBSCRIBER_BUFFER + 10 {
            pubsub.publish("s1", vec![entry(&format!("u{}", i))]);
            // fast 持续消费
            let _ = fast_rx.try_recv();
        }

        // slow 只留下了缓冲区容量内的条目，fast 未受影响
        let mut slow_received = 0;
        while slow_rx.try_recv().is_ok() {
            slow_received += 1;
        }
        assert_eq!(slow_received, SUBSCRIBER_BUFFER);
    }

    #[tokio::test]
    async fn test_publish_preserves_order_per_subscriber() {
        let pubsub = SessionPubSub::new();
        let (_id, mut rx) = pubsub.subscribe("s1");

        for i in 0..10 {
            pubsub.publish("s1", vec![entry(&format!("u{}", i))]);
        }
        for i in 0..10 {
            assert_eq!(rx.recv().await.unwrap()[0].uuid, format!("u{}", i));
        }
    }
}
