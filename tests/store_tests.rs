//! 存储层集成测试

use std::time::Duration;

use ai_trace_pipeline::types::{IngestEntry, IngestRequest, SessionActivityEvent, SessionFilter};
use ai_trace_pipeline::TraceStore;
use chrono::{TimeZone, Utc};
use tempfile::tempdir;
use tokio::time::sleep;

/// 创建测试存储（小批量 + 短刷盘间隔，测试里不用等太久）
fn test_store(dir: &tempfile::TempDir) -> TraceStore {
    TraceStore::open(&dir.path().join("test.db"), 4, Duration::from_millis(50)).unwrap()
}

fn entry(uuid: &str, role: &str, seq: i64) -> IngestEntry {
    IngestEntry {
        uuid: uuid.to_string(),
        role: role.to_string(),
        timestamp: Some(Utc.timestamp_millis_opt(1_700_000_000_000 + seq * 1000).unwrap()),
        text: format!("entry {}", seq),
        ..Default::default()
    }
}

fn request(session_id: &str, entries: Vec<IngestEntry>) -> IngestRequest {
    IngestRequest {
        instance_id: "inst-1".to_string(),
        source: "claude".to_string(),
        project_path: "/tmp/project".to_string(),
        session_id: session_id.to_string(),
        entries,
        ..Default::default()
    }
}

#[tokio::test]
async fn test_ingest_and_query_entries() {
    let dir = tempdir().unwrap();
    let store = test_store(&dir);

    let entries = vec![
        entry("u1", "user", 1),
        entry("u2", "assistant", 2),
        entry("u3", "user", 3),
    ];
    store.ingest_batch(request("s1", entries)).await.unwrap();
    sleep(Duration::from_millis(200)).await;

    let got = store.query_entries("s1", 10, 0).unwrap();
    assert_eq!(got.len(), 3);
    // 按时间升序
    assert_eq!(got[0].uuid, "u1");
    assert_eq!(got[2].uuid, "u3");

    // offset 分页
    let page = store.query_entries("s1", 10, 2).unwrap();
    assert_eq!(page.len(), 1);
    assert_eq!(page[0].uuid, "u3");

    store.close().await;
}

#[tokio::test]
async fn test_duplicate_uuid_is_idempotent() {
    let dir = tempdir().unwrap();
    let store = test_store(&dir);

    store
        .ingest_batch(request("s1", vec![entry("dup", "user", 1)]))
        .await
        .unwrap();
    store
        .ingest_batch(request("s1", vec![entry("dup", "user", 1)]))
        .await
        .unwrap();
    sleep(Duration::from_millis(200)).await;

    let got = store.query_entries("s1", 10, 0).unwrap();
    assert_eq!(got.len(), 1);

    store.close().await;
}

#[tokio::test]
async fn test_session_model_backfilled_only_when_empty() {
    let dir = tempdir().unwrap();
    let store = test_store(&dir);

    // 第一批没有 model
    store
        .ingest_batch(request("s1", vec![entry("u1", "user", 1)]))
        .await
        .unwrap();

    // 第二批带 model，应回填
    let mut e2 = entry("u2", "assistant", 2);
    e2.model = "claude-x".to_string();
    store.ingest_batch(request("s1", vec![e2])).await.unwrap();

    // 第三批换了 model，不应覆盖
    let mut e3 = entry("u3", "assistant", 3);
    e3.model = "claude-y".to_string();
    store.ingest_batch(request("s1", vec![e3])).await.unwrap();

    sleep(Duration::from_millis(300)).await;

    let session = store.get_session("s1").unwrap().unwrap();
    assert_eq!(session.model, "claude-x");
    assert_eq!(session.entry_count, 3);

    store.close().await;
}

#[tokio::test]
async fn test_close_drains_pending_writes() {
    let dir = tempdir().unwrap();
    let store = test_store(&dir);

    // 单条不够 batch_size，也不给刷盘计时器时间
    store
        .ingest_batch(request("s1", vec![entry("u1", "user", 1)]))
        .await
        .unwrap();
    store.close().await;

    let got = store.query_entries("s1", 10, 0).unwrap();
    assert_eq!(got.len(), 1);

    // 关停后继续摄入应报错
    let err = store
        .ingest_batch(request("s1", vec![entry("u2", "user", 2)]))
        .await;
    assert!(err.is_err());
}

#[tokio::test]
async fn test_query_sessions_with_filter() {
    let dir = tempdir().unwrap();
    let store = test_store(&dir);

    store
        .ingest_batch(request("s1", vec![entry("a1", "user", 1)]))
        .await
        .unwrap();
    let mut other = request("s2", vec![entry("b1", "user", 2)]);
    other.source = "codex".to_string();
    store.ingest_batch(other).await.unwrap();
    sleep(Duration::from_millis(200)).await;

    let all = store.query_sessions(&SessionFilter::default()).unwrap();
    assert_eq!(all.len(), 2);

    let filter = SessionFilter {
        source: "codex".to_string(),
        ..Default::default()
    };
    let codex = store.query_sessions(&filter).unwrap();
    assert_eq!(codex.len(), 1);
    assert_eq!(codex[0].id, "s2");

    store.close().await;
}

#[tokio::test]
async fn test_search_and_stats() {
    let dir = tempdir().unwrap();
    let store = test_store(&dir);

    let mut e = entry("u1", "assistant", 1);
    e.text = "refactor the websocket handler".to_string();
    store.ingest_batch(request("s1", vec![e])).await.unwrap();
    store
        .ingest_batch(request("s2", vec![entry("u2", "user", 2)]))
        .await
        .unwrap();
    sleep(Duration::from_millis(200)).await;

    let hits = store.search_traces("websocket", 10).unwrap();
    assert_eq!(hits.len(), 1);
    assert_eq!(hits[0].id, "s1");

    let stats = store.get_stats().unwrap();
    assert_eq!(stats.total_traces, 2);
    assert_eq!(stats.total_sessions, 2);
    assert!(stats.db_size_bytes > 0);

    store.close().await;
}

fn activity(session_id: &str, event: &str) -> SessionActivityEvent {
    SessionActivityEvent {
        instance_id: "inst-1".to_string(),
        source: "claude".to_string(),
        project_path: "/tmp/project".to_string(),
        session_id: session_id.to_string(),
        event: event.to_string(),
        timestamp: None,
    }
}

#[tokio::test]
async fn test_activity_lifecycle_tracks_status() {
    let dir = tempdir().unwrap();
    let store = test_store(&dir);

    // 生命周期事件可以先于任何条目到达，自己建会话行
    store.record_activity(&activity("s1", "session_start")).unwrap();
    store.record_activity(&activity("s2", "session_start")).unwrap();

    let active = store.query_active_sessions().unwrap();
    assert_eq!(active.len(), 2);
    assert!(active.iter().all(|s| s.status == "active"));
    assert!(active.iter().all(|s| s.last_activity.is_some()));

    store.record_activity(&activity("s1", "session_end")).unwrap();

    let active = store.query_active_sessions().unwrap();
    assert_eq!(active.len(), 1);
    assert_eq!(active[0].id, "s2");

    let ended = store.get_session("s1").unwrap().unwrap();
    assert_eq!(ended.status, "ended");

    // active_only 过滤与 /sessions/active 结果一致
    let filter = SessionFilter {
        active_only: true,
        ..Default::default()
    };
    let filtered = store.query_sessions(&filter).unwrap();
    assert_eq!(filtered.len(), 1);
    assert_eq!(filtered[0].id, "s2");

    store.close().await;
}

#[tokio::test]
async fn test_activity_does_not_clobber_aggregates() {
    let dir = tempdir().unwrap();
    let store = test_store(&dir);

    let mut e = entry("u1", "assistant", 1);
    e.model = "claude-x".to_string();
    store.ingest_batch(request("s1", vec![e])).await.unwrap();
    sleep(Duration::from_millis(200)).await;

    store.record_activity(&activity("s1", "session_active")).unwrap();

    let session = store.get_session("s1").unwrap().unwrap();
    assert_eq!(session.entry_count, 1);
    assert_eq!(session.model, "claude-x");
    assert_eq!(session.status, "active");

    store.close().await;
}

#[tokio::test]
async fn test_recent_entries_returns_tail_in_order() {
    let dir = tempdir().unwrap();
    let store = test_store(&dir);

    let entries: Vec<IngestEntry> = (0..10)
        .map(|i| entry(&format!("u{}", i), "user", i))
        .collect();
    store.ingest_batch(request("s1", entries)).await.unwrap();
    sleep(Duration::from_millis(200)).await;

    let tail = store.recent_entries("s1", 3).unwrap();
    assert_eq!(tail.len(), 3);
    // 最后 3 条，时间升序
    assert_eq!(tail[0].uuid, "u7");
    assert_eq!(tail[2].uuid, "u9");

    store.close().await;
}
