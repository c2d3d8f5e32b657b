//! 批量持久化存储
//!
//! 单写入者模式：上报请求进入有界队列，由唯一的后台 worker
//! 按条目阈值或定时器批量落库；读取不受限制。

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use rusqlite::{params, Connection, OptionalExtension};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::error::{Error, Result};
use crate::schema;
use crate::types::{
    session_status, CollectorStats, IngestEntry, IngestRequest, SessionActivityEvent,
    SessionFilter, SessionSummary,
};

/// WebSocket 回填的最近条目数
pub const BACKFILL_LIMIT: usize = 50;

/// Trace 存储
pub struct TraceStore {
    conn: Arc<Mutex<Connection>>,
    db_path: PathBuf,
    started_at: DateTime<Utc>,
    ingest_tx: mpsc::Sender<IngestRequest>,
    cancel: CancellationToken,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl TraceStore {
    /// 打开（或创建）数据库并启动批量写入 worker
    ///
    /// 必须在 tokio runtime 内调用。
    pub fn open(db_path: &Path, batch_size: usize, flush_interval: Duration) -> Result<Self> {
        if let Some(parent) = db_path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let conn = Connection::open(db_path)?;
        conn.execute_batch("PRAGMA journal_mode=WAL;")?;
        conn.execute_batch(schema::SCHEMA_SQL)?;

        let conn = Arc::new(Mutex::new(conn));
        let batch_size = batch_size.max(1);
        // 队列容量按请求数计，2 倍阈值：满时 ingest_batch 挂起，形成可见背压
        let (ingest_tx, ingest_rx) = mpsc::channel(batch_size * 2);
        let cancel = CancellationToken::new();

        let worker = tokio::spawn(batch_writer(
            conn.clone(),
            ingest_rx,
            batch_size,
            flush_interval,
            cancel.clone(),
        ));

        tracing::info!("数据库已连接: {:?}", db_path);

        Ok(Self {
            conn,
            db_path: db_path.to_path_buf(),
            started_at: Utc::now(),
            ingest_tx,
            cancel,
            worker: Mutex::new(Some(worker)),
        })
    }

    /// 入队一次上报请求
    ///
    /// 队列满时挂起调用方直到被接收；store 关闭后返回连接错误。
    pub async fn ingest_batch(&self, req: IngestRequest) -> Result<()> {
        self.ingest_tx
            .send(req)
            .await
            .map_err(|_| Error::Connection("store is closed".into()))
    }

    /// 关闭存储：通知 worker 排空队列并做最后一次 flush
    pub async fn close(&self) {
        self.cancel.cancel();
        let worker = self.worker.lock().take();
        if let Some(handle) = worker {
            let _ = handle.await;
        }
        tracing::info!("🧹 TraceStore 已关闭");
    }

    /// 记录一次会话生命周期事件，upsert 状态与活动时间
    ///
    /// 生命周期事件低频且需要立即可见，不走批量队列直接落库。
    /// 只更新 status / last_activity，不动 entry_count 与 model。
    pub fn record_activity(&self, ev: &SessionActivityEvent) -> Result<()> {
        let status = if ev.event == "session_end" {
            session_status::ENDED
        } else {
            session_status::ACTIVE
        };
        let ts = ev.timestamp.unwrap_or_else(Utc::now).timestamp_millis();

        let conn = self.conn.lock();
        conn.execute(
            "INSERT INTO collected_sessions
                 (id, project_path, source, instance_id, model, entry_count,
                  first_seen, last_updated, status, last_activity)
             VALUES (?1, ?2, ?3, ?4, '', 0, ?5, ?5, ?6, ?5)
             ON CONFLICT(id) DO UPDATE SET
                 status = excluded.status,
                 last_activity = excluded.last_activity",
            params![
                ev.session_id,
                ev.project_path,
                ev.source,
                ev.instance_id,
                ts,
                status
            ],
        )?;
        Ok(())
    }

    // ==================== 查询 ====================

    /// 按时间正序查询某会话的条目（分页）
    pub fn query_entries(
        &self,
        session_id: &str,
        limit: usize,
        offset: usize,
    ) -> Result<Vec<IngestEntry>> {
        let limit = if limit == 0 { 100 } else { limit };
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(
            "SELECT uuid, role, timestamp, model, text, tool_name, is_error,
                    input_tokens, output_tokens, thinking_len, has_thinking, has_tool_use
             FROM collected_entries
             WHERE session_id = ?1
             ORDER BY timestamp ASC
             LIMIT ?2 OFFSET ?3",
        )?;
        let rows = stmt.query_map(params![session_id, limit as i64, offset as i64], row_to_entry)?;
        rows.collect::<std::result::Result<Vec<_>, _>>()
            .map_err(Into::into)
    }

    /// 最近 N 条条目（按时间正序返回），用于 WebSocket 回填
    pub fn recent_entries(&self, session_id: &str, limit: usize) -> Result<Vec<IngestEntry>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(
            "SELECT uuid, role, timestamp, model, text, tool_name, is_error,
                    input_tokens, output_tokens, thinking_len, has_thinking, has_tool_use
             FROM collected_entries
             WHERE session_id = ?1
             ORDER BY timestamp DESC
             LIMIT ?2",
        )?;
        let rows = stmt.query_map(params![session_id, limit as i64], row_to_entry)?;
        let mut entries = rows.collect::<std::result::Result<Vec<_>, _>>()?;
        entries.reverse();
        Ok(entries)
    }

    /// 获取单个会话聚合
    pub fn get_session(&self, session_id: &str) -> Result<Option<SessionSummary>> {
        let conn = self.conn.lock();
        conn.query_row(
            "SELECT id, project_path, source, instance_id, model, entry_count,
                    first_seen, last_updated, status, last_activity
             FROM collected_sessions WHERE id = ?1",
            params![session_id],
            row_to_session,
        )
        .optional()
        .map_err(Into::into)
    }

    /// 按过滤条件查询会话摘要
    pub fn query_sessions(&self, filter: &SessionFilter) -> Result<Vec<SessionSummary>> {
        let mut sql = String::from(
            "SELECT id, project_path, source, instance_id, model, entry_count,
                    first_seen, last_updated, status, last_activity
             FROM collected_sessions",
        );
        let mut conditions = Vec::new();
        let mut args: Vec<&dyn rusqlite::ToSql> = Vec::new();

        if !filter.source.is_empty() {
            conditions.push("source = ?");
            args.push(&filter.source);
        }
        if !filter.project_path.is_empty() {
            conditions.push("project_path = ?");
            args.push(&filter.project_path);
        }
        if !filter.instance_id.is_empty() {
            conditions.push("instance_id = ?");
            args.push(&filter.instance_id);
        }
        if filter.active_only {
            conditions.push("status = ?");
            args.push(&session_status::ACTIVE);
        }
        if !conditions.is_empty() {
            sql.push_str(" WHERE ");
            sql.push_str(&conditions.join(" AND "));
        }
        sql.push_str(" ORDER BY last_updated DESC");

        let limit = if filter.limit == 0 { 50 } else { filter.limit };
        sql.push_str(&format!(" LIMIT {}", limit));
        if filter.offset > 0 {
            sql.push_str(&format!(" OFFSET {}", filter.offset));
        }

        let conn = self.conn.lock();
        let mut stmt = conn.prepare(&sql)?;
        let rows = stmt.query_map(args.as_slice(), row_to_session)?;
        rows.collect::<std::result::Result<Vec<_>, _>>()
            .map_err(Into::into)
    }

    /// 当前处于 active 状态的会话，按最近活动时间倒序
    pub fn query_active_sessions(&self) -> Result<Vec<SessionSummary>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(
            "SELECT id, project_path, source, instance_id, model, entry_count,
                    first_seen, last_updated, status, last_activity
             FROM collected_sessions
             WHERE status = ?1
             ORDER BY last_activity DESC",
        )?;
        let rows = stmt.query_map(params![session_status::ACTIVE], row_to_session)?;
        rows.collect::<std::result::Result<Vec<_>, _>>()
            .map_err(Into::into)
    }

    /// 子串搜索：匹配条目文本、工具名或项目路径，返回命中的会话
    pub fn search_traces(&self, query: &str, limit: usize) -> Result<Vec<SessionSummary>> {
        let limit = if limit == 0 { 50 } else { limit };
        let pattern = format!("%{}%", query);

        let conn = self.conn.lock();
        let mut stmt = conn.prepare(
            "SELECT DISTINCT cs.id, cs.project_path, cs.source, cs.instance_id, cs.model,
                    cs.entry_count, cs.first_seen, cs.last_updated, cs.status, cs.last_activity
             FROM collected_sessions cs
             JOIN collected_entries ce ON ce.session_id = cs.id
             WHERE ce.text LIKE ?1 OR ce.tool_name LIKE ?1 OR cs.project_path LIKE ?1
             ORDER BY cs.last_updated DESC
             LIMIT ?2",
        )?;
        let rows = stmt.query_map(params![pattern, limit as i64], row_to_session)?;
        rows.collect::<std::result::Result<Vec<_>, _>>()
            .map_err(Into::into)
    }

    /// 聚合统计（不含 agent 计数，由 server 层补充）
    pub fn get_stats(&self) -> Result<CollectorStats> {
        let (total_traces, total_sessions) = {
            let conn = self.conn.lock();
            let traces: i64 =
                conn.query_row("SELECT COUNT(*) FROM collected_entries", [], |r| r.get(0))?;
            let sessions: i64 =
                conn.query_row("SELECT COUNT(*) FROM collected_sessions", [], |r| r.get(0))?;
            (traces, sessions)
        };

        let db_size_bytes = std::fs::metadata(&self.db_path)
            .map(|m| m.len() as i64)
            .unwrap_or(0);

        Ok(CollectorStats {
            total_traces,
            total_sessions,
            total_agents: 0,
            active_agents: 0,
            db_size_bytes,
            uptime_seconds: (Utc::now() - self.started_at)
                .to_std()
                .unwrap_or_default()
                .as_secs_f64(),
            started_at: self.started_at,
        })
    }
}

/// 唯一的批量写入 worker
async fn batch_writer(
    conn: Arc<Mutex<Connection>>,
    mut rx: mpsc::Receiver<IngestRequest>,
    batch_size: usize,
    flush_interval: Duration,
    cancel: CancellationToken,
) {
    let mut ticker = tokio::time::interval(flush_interval);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

    let mut batch: Vec<IngestRequest> = Vec::new();
    let mut buffered = 0usize;

    loop {
        tokio::select! {
            maybe = rx.recv() => match maybe {
                Some(req) => {
                    buffered += req.entries.len();
                    batch.push(req);
                    if buffered >= batch_size {
                        flush_batch(&conn, std::mem::take(&mut batch)).await;
                        buffered = 0;
                    }
                }
                None => break,
            },
            _ = ticker.tick() => {
                if !batch.is_empty() {
                    flush_batch(&conn, std::mem::take(&mut batch)).await;
                    buffered = 0;
                }
            }
            _ = cancel.cancelled() => break,
        }
    }

    // 退出前尽力排空队列，做最后一次 flush
    while let Ok(req) = rx.try_recv() {
        batch.push(req);
    }
    if !batch.is_empty() {
        flush_batch(&conn, batch).await;
    }
}

/// 单事务写入一个批次；任何失败回滚整个事务，该批次丢弃并记日志
async fn flush_batch(conn: &Arc<Mutex<Connection>>, batch: Vec<IngestRequest>) {
    if batch.is_empty() {
        return;
    }
    let requests = batch.len();
    let entries: usize = batch.iter().map(|r| r.entries.len()).sum();

    let conn = conn.clone();
    let result = tokio::task::spawn_blocking(move || -> Result<()> {
        let mut guard = conn.lock();
        let tx = guard.transaction()?;
        for req in &batch {
            write_request(&tx, req)?;
        }
        tx.commit()?;
        Ok(())
    })
    .await;

    match result {
        Ok(Ok(())) => {
            tracing::debug!("📦 Flushed batch: requests={}, entries={}", requests, entries);
        }
        Ok(Err(e)) => {
            tracing::error!("批量写入失败，丢弃该批次: {}", e);
        }
        Err(e) => {
            tracing::error!("批量写入任务异常: {}", e);
        }
    }
}

/// 事务内写入一次上报：upsert 会话聚合 + 逐条插入（重复 uuid 忽略）
fn write_request(tx: &rusqlite::Transaction<'_>, req: &IngestRequest) -> Result<()> {
    let now = Utc::now().timestamp_millis();

    // 取第一条带模型的条目作为会话模型候选
    let model = req
        .entries
        .iter()
        .find(|e| !e.model.is_empty())
        .map(|e| e.model.as_str())
        .unwrap_or("");

    tx.execute(
        "INSERT INTO collected_sessions
             (id, project_path, source, instance_id, model, entry_count, first_seen, last_updated)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?7)
         ON CONFLICT(id) DO UPDATE SET
             entry_count = entry_count + excluded.entry_count,
             last_updated = excluded.last_updated,
             model = CASE WHEN collected_sessions.model = ''
                          THEN excluded.model
                          ELSE collected_sessions.model END",
        params![
            req.session_id,
            req.project_path,
            req.source,
            req.instance_id,
            model,
            req.entries.len() as i64,
            now
        ],
    )?;

    let mut stmt = tx.prepare_cached(
        "INSERT OR IGNORE INTO collected_entries
             (uuid, session_id, role, timestamp, model, text, tool_name, is_error,
              input_tokens, output_tokens, thinking_len, has_thinking, has_tool_use, ingested_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14)",
    )?;
    for e in &req.entries {
        stmt.execute(params![
            e.uuid,
            req.session_id,
            e.role,
            e.timestamp_ms(),
            e.model,
            e.text,
            e.tool_name,
            e.is_error,
            e.input_tokens,
            e.output_tokens,
            e.thinking_len,
            e.has_thinking.unwrap_or(false),
            e.has_tool_use.unwrap_or(false),
            now
        ])?;
    }

    Ok(())
}

fn row_to_entry(row: &rusqlite::Row<'_>) -> rusqlite::Result<IngestEntry> {
    let ts_ms: i64 = row.get(2)?;
    Ok(IngestEntry {
        uuid: row.get(0)?,
        role: row.get(1)?,
        timestamp: DateTime::from_timestamp_millis(ts_ms),
        model: row.get(3)?,
        text: row.get(4)?,
        tool_name: row.get(5)?,
        is_error: row.get(6)?,
        input_tokens: row.get(7)?,
        output_tokens: row.get(8)?,
        thinking_len: row.get(9)?,
        has_thinking: Some(row.get(10)?),
        has_tool_use: Some(row.get(11)?),
    })
}

fn row_to_session(row: &rusqlite::Row<'_>) -> rusqlite::Result<SessionSummary> {
    let first_seen: i64 = row.get(6)?;
    let last_updated: i64 = row.get(7)?;
    let last_activity: i64 = row.get(9)?;
    Ok(SessionSummary {
        id: row.get(0)?,
        project_path: row.get(1)?,
        source: row.get(2)?,
        instance_id: row.get(3)?,
        model: row.get(4)?,
        entry_count: row.get(5)?,
        first_seen: DateTime::from_timestamp_millis(first_seen).unwrap_or_default(),
        last_updated: DateTime::from_timestamp_millis(last_updated).unwrap_or_default(),
        status: row.get(8)?,
        last_activity: if last_activity > 0 {
            DateTime::from_timestamp_millis(last_activity)
        } else {
            None
        },
    })
}
