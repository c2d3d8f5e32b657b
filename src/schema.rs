//! 数据库 Schema 定义

/// Collector Schema SQL
pub const SCHEMA_SQL: &str = r#"
-- 会话聚合表（按 session_id 主键，逐批 upsert）
CREATE TABLE IF NOT EXISTS collected_sessions (
    id TEXT PRIMARY KEY,
    project_path TEXT NOT NULL DEFAULT '',
    source TEXT NOT NULL DEFAULT '',
    instance_id TEXT NOT NULL DEFAULT '',
    model TEXT NOT NULL DEFAULT '',
    entry_count INTEGER NOT NULL DEFAULT 0,
    first_seen INTEGER NOT NULL,   -- 毫秒时间戳
    last_updated INTEGER NOT NULL, -- 毫秒时间戳
    status TEXT NOT NULL DEFAULT '',        -- 'active' / 'ended'，空表示未上报过
    last_activity INTEGER NOT NULL DEFAULT 0 -- 毫秒时间戳，0 表示未上报过
);

-- 条目表（按 uuid 主键，重复 uuid 直接忽略，重试投递安全）
CREATE TABLE IF NOT EXISTS collected_entries (
    uuid TEXT PRIMARY KEY,
    session_id TEXT NOT NULL,
    role TEXT NOT NULL,
    timestamp INTEGER NOT NULL,    -- 毫秒时间戳
    model TEXT NOT NULL DEFAULT '',
    text TEXT NOT NULL DEFAULT '',
    tool_name TEXT NOT NULL DEFAULT '',
    is_error INTEGER NOT NULL DEFAULT 0,
    input_tokens INTEGER NOT NULL DEFAULT 0,
    output_tokens INTEGER NOT NULL DEFAULT 0,
    thinking_len INTEGER NOT NULL DEFAULT 0,
    has_thinking INTEGER NOT NULL DEFAULT 0,
    has_tool_use INTEGER NOT NULL DEFAULT 0,
    ingested_at INTEGER NOT NULL   -- 毫秒时间戳
);

-- 索引
CREATE INDEX IF NOT EXISTS idx_entries_session ON collected_entries(session_id);
CREATE INDEX IF NOT EXISTS idx_entries_timestamp ON collected_entries(timestamp);
CREATE INDEX IF NOT EXISTS idx_sessions_updated ON collected_sessions(last_updated DESC);
"#;
