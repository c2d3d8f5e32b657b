//! Agent Hub 集成测试

use std::io::Write;
use std::sync::Arc;
use std::time::Duration;

use ai_trace_pipeline::hub::{
    stream_local, stream_remote, AgentEvent, AgentFilter, Detector, LocalAgent, StreamEntry,
    STREAM_ENDING_TEXT,
};
use ai_trace_pipeline::{AgentHub, CollectorConfig, CollectorServer, HubConfig};
use parking_lot::Mutex;
use serde_json::json;
use tempfile::tempdir;
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tokio::time::{sleep, timeout};
use tokio_util::sync::CancellationToken;

/// 返回预置列表的检测器，测试里随时换内容
struct FakeDetector {
    agents: Mutex<Vec<LocalAgent>>,
}

impl FakeDetector {
    fn new(agents: Vec<LocalAgent>) -> Arc<Self> {
        Arc::new(Self {
            agents: Mutex::new(agents),
        })
    }

    fn set(&self, agents: Vec<LocalAgent>) {
        *self.agents.lock() = agents;
    }
}

impl Detector for FakeDetector {
    fn detect(&self) -> anyhow::Result<Vec<LocalAgent>> {
        Ok(self.agents.lock().clone())
    }
}

fn local_agent(session_id: &str, session_path: &str) -> LocalAgent {
    LocalAgent {
        session_id: session_id.to_string(),
        source: "claude".to_string(),
        project_path: "/tmp/project".to_string(),
        session_path: session_path.to_string(),
        ..Default::default()
    }
}

async fn recv_entry(rx: &mut mpsc::Receiver<StreamEntry>) -> StreamEntry {
    timeout(Duration::from_secs(3), rx.recv())
        .await
        .expect("timed out waiting for stream entry")
        .expect("stream closed unexpectedly")
}

#[tokio::test]
async fn test_hub_merges_local_agents() {
    let detector = FakeDetector::new(vec![local_agent("sess-1", "/tmp/none.jsonl")]);
    let hub = AgentHub::new(HubConfig::default(), Some(detector.clone()));

    let (_sub, mut events) = hub.subscribe();
    assert_eq!(hub.poll_once().await, 1);

    let agents = hub.agents(&AgentFilter::default());
    assert_eq!(agents.len(), 1);
    assert_eq!(agents[0].session_id, "sess-1");
    assert!(agents[0].is_local(hub.local_fingerprint()));

    let event = timeout(Duration::from_secs(1), events.recv())
        .await
        .unwrap()
        .unwrap();
    assert!(matches!(event, AgentEvent::Added(ref a) if a.session_id == "sess-1"));

    // 第二轮 agent 仍在场：即使内容没变也必须收到 Updated
    assert_eq!(hub.poll_once().await, 1);
    let event = timeout(Duration::from_secs(1), events.recv())
        .await
        .unwrap()
        .unwrap();
    assert!(matches!(event, AgentEvent::Updated(ref a) if a.session_id == "sess-1"));

    // 检测不到了就是 Removed
    detector.set(Vec::new());
    assert_eq!(hub.poll_once().await, 0);
    let event = timeout(Duration::from_secs(1), events.recv())
        .await
        .unwrap()
        .unwrap();
    assert!(matches!(event, AgentEvent::Removed(ref a) if a.session_id == "sess-1"));
}

#[tokio::test]
async fn test_hub_filters_local_only() {
    let detector = FakeDetector::new(vec![local_agent("sess-1", "")]);
    let hub = AgentHub::new(HubConfig::default(), Some(detector));
    hub.poll_once().await;

    let local = hub.agents(&AgentFilter {
        local_only: true,
        ..Default::default()
    });
    assert_eq!(local.len(), 1);

    let remote = hub.agents(&AgentFilter {
        remote_only: true,
        ..Default::default()
    });
    assert!(remote.is_empty());
}

/// 起一个真 collector（无鉴权），返回基地址
async fn start_collector(dir: &tempfile::TempDir) -> (String, CancellationToken) {
    let config = CollectorConfig {
        host: "127.0.0.1".to_string(),
        port: 0,
        db_path: dir.path().join("collector.db"),
        token: None,
        batch_size: 1,
        flush_interval: Duration::from_millis(50),
    };
    let server = CollectorServer::new(config).unwrap();
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let cancel = CancellationToken::new();
    let serve_cancel = cancel.clone();
    tokio::spawn(async move {
        server.serve(listener, serve_cancel).await.unwrap();
    });
    sleep(Duration::from_millis(100)).await;
    (format!("http://{}", addr), cancel)
}

#[tokio::test]
async fn test_hub_sees_remote_agents_from_collector() {
    let dir = tempdir().unwrap();
    let (base, cancel) = start_collector(&dir).await;

    reqwest::Client::new()
        .post(format!("{}/v1/agents/register", base))
        .json(&json!({
            "instance_id": "remote-1",
            "platform": "modal",
            "machine_id": "fp-other-machine",
        }))
        .send()
        .await
        .unwrap();

    let hub = AgentHub::new(
        HubConfig {
            collector_urls: vec![base],
            ..Default::default()
        },
        None,
    );
    assert_eq!(hub.poll_once().await, 1);

    let agents = hub.agents(&AgentFilter::default());
    assert_eq!(agents[0].id, "remote-1");
    assert_eq!(agents[0].source, "modal");
    assert!(!agents[0].is_local(hub.local_fingerprint()));
    assert!(!agents[0].collector_url.is_empty());

    cancel.cancel();
}

#[tokio::test]
async fn test_stream_local_backlog_then_live() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("session.jsonl");

    let mut file = std::fs::File::create(&path).unwrap();
    for i in 0..5 {
        writeln!(
            file,
            r#"{{"type":"user","message":{{"content":"backlog {}"}}}}"#,
            i
        )
        .unwrap();
    }
    file.flush().unwrap();

    let cancel = CancellationToken::new();
    let mut rx = stream_local(&path, 2, cancel.clone()).await.unwrap();

    // 只回放最后 2 条
    let first = recv_entry(&mut rx).await;
    assert_eq!(first.role, "user");
    let second = recv_entry(&mut rx).await;
    assert_eq!(second.role, "user");

    // 追加新行，经 watcher + 去抖后到达
    let mut file = std::fs::OpenOptions::new().append(true).open(&path).unwrap();
    writeln!(
        file,
        r#"{{"type":"assistant","message":{{"model":"claude-x","content":[{{"type":"text","text":"live"}}]}}}}"#
    )
    .unwrap();
    file.flush().unwrap();
    drop(file);

    let live = recv_entry(&mut rx).await;
    assert_eq!(live.role, "assistant");
    assert_eq!(live.model, "claude-x");

    cancel.cancel();
}

#[tokio::test]
async fn test_stream_local_file_removal_ends_stream() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("session.jsonl");
    std::fs::write(&path, "").unwrap();

    let cancel = CancellationToken::new();
    let mut rx = stream_local(&path, 0, cancel.clone()).await.unwrap();

    sleep(Duration::from_millis(100)).await;
    std::fs::remove_file(&path).unwrap();

    let last = recv_entry(&mut rx).await;
    assert!(last.synthetic);
    assert_eq!(last.text, STREAM_ENDING_TEXT);
    // 随后通道关闭
    assert!(timeout(Duration::from_secs(2), rx.recv())
        .await
        .unwrap()
        .is_none());
}

#[tokio::test]
async fn test_hub_stream_dispatches_to_local_tail() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("session.jsonl");
    std::fs::write(
        &path,
        r#"{"type":"user","message":{"content":"hello"}}
"#,
    )
    .unwrap();

    let detector = FakeDetector::new(vec![local_agent("sess-1", path.to_str().unwrap())]);
    let hub = AgentHub::new(HubConfig::default(), Some(detector));
    hub.poll_once().await;

    let cancel = CancellationToken::new();
    let mut rx = hub.stream("sess-1", 10, cancel.clone()).await.unwrap();
    let entry = recv_entry(&mut rx).await;
    assert_eq!(entry.role, "user");
    assert!(!entry.content_blocks.is_empty());

    cancel.cancel();
}

#[tokio::test]
async fn test_stream_remote_backfill_then_live() {
    let dir = tempdir().unwrap();
    let (base, cancel) = start_collector(&dir).await;
    let client = reqwest::Client::new();

    let ingest = |uuid: &str| {
        json!({
            "instance_id": "inst-1",
            "source": "claude",
            "session_id": "sess-1",
            "entries": [{"uuid": uuid, "role": "user", "text": format!("text {}", uuid)}],
        })
    };

    // 历史数据落盘后再建连，回放应包含它
    client
        .post(format!("{}/v1/traces", base))
        .json(&ingest("old-1"))
        .send()
        .await
        .unwrap();
    sleep(Duration::from_millis(300)).await;

    let ws_url = format!(
        "{}/v1/sessions/sess-1/ws",
        base.replace("http://", "ws://")
    );
    let stream_cancel = CancellationToken::new();
    let mut rx = stream_remote(ws_url, None, stream_cancel.clone());

    let backfill = recv_entry(&mut rx).await;
    assert_eq!(backfill.role, "user");
    assert_eq!(backfill.text, "text old-1");
    assert!(!backfill.synthetic);

    // 实时发布经 pubsub 直达
    client
        .post(format!("{}/v1/traces", base))
        .json(&ingest("live-1"))
        .send()
        .await
        .unwrap();
    let live = recv_entry(&mut rx).await;
    assert_eq!(live.text, "text live-1");

    stream_cancel.cancel();
    cancel.cancel();
}

#[tokio::test]
async fn test_hub_stream_unknown_agent_errors() {
    let hub = AgentHub::new(HubConfig::default(), None);
    let cancel = CancellationToken::new();
    assert!(hub.stream("nope", 0, cancel).await.is_err());
}
