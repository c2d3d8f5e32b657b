//! 本地会话文件实时 tail
//!
//! 打开 JSONL 会话文件，可选回放最后 N 条 backlog，之后监听文件写入
//! 并以去抖后的读取批次解析新行。文件被删除/改名时发出一条合成的
//! "stream ending" 条目并关闭通道。

use std::path::Path;
use std::time::Duration;

use chrono::{DateTime, Utc};
use notify::event::ModifyKind;
use notify::{EventKind, RecursiveMode, Watcher};
use tokio::fs::File;
use tokio::io::{AsyncBufReadExt, AsyncSeekExt, BufReader, SeekFrom};
use tokio::sync::mpsc;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use super::types::{ContentBlock, StreamEntry};
use crate::error::{Error, Result};

/// 写入事件去抖窗口；每个新事件重置计时，将突发写入合并为一次读取
const DEBOUNCE: Duration = Duration::from_millis(100);
/// 下游通道容量
const STREAM_BUFFER: usize = 64;

/// 文件删除/改名时的合成条目文本
pub const STREAM_ENDING_TEXT: &str = "Session file removed, stream ending.";

enum FileEvent {
    Write,
    Removed,
}

/// 开始 tail 一个本地会话文件
///
/// `backlog > 0` 时先发送文件中最后 N 条可解析的条目，再从文件末尾
/// 开始监听新行。返回的通道在取消或文件消失时关闭。
pub async fn stream_local(
    session_path: &Path,
    backlog: usize,
    cancel: CancellationToken,
) -> Result<mpsc::Receiver<StreamEntry>> {
    let file = File::open(session_path).await?;
    let mut reader = BufReader::new(file);

    // backlog 读取会顺带把读取位置推到文件末尾；不回放时直接 seek
    let backlog_entries = if backlog > 0 {
        read_backlog(&mut reader, backlog).await
    } else {
        reader.seek(SeekFrom::End(0)).await?;
        Vec::new()
    };

    // 监听父目录而不是文件本身：inotify 对仍被打开的文件不投递
    // 删除事件，目录级监听才能在持有读句柄时看到 unlink/rename
    let watch_dir = session_path
        .parent()
        .filter(|p| !p.as_os_str().is_empty())
        .unwrap_or_else(|| Path::new("."))
        .to_path_buf();
    let file_name = session_path
        .file_name()
        .ok_or_else(|| Error::Validation(format!("not a file path: {:?}", session_path)))?
        .to_os_string();

    // notify 回调跑在自己的线程上，经 blocking_send 桥接进 tokio
    let (event_tx, event_rx) = mpsc::channel::<FileEvent>(100);
    let mut watcher = notify::recommended_watcher(move |res: notify::Result<notify::Event>| {
        let event = match res {
            Ok(e) => e,
            Err(e) => {
                tracing::warn!("Local stream watcher error: {}", e);
                return;
            }
        };
        // 目录里别的文件不关心
        if !event
            .paths
            .iter()
            .any(|p| p.file_name() == Some(file_name.as_os_str()))
        {
            return;
        }
        let mapped = match event.kind {
            EventKind::Remove(_) | EventKind::Modify(ModifyKind::Name(_)) => FileEvent::Removed,
            EventKind::Modify(_) | EventKind::Create(_) => FileEvent::Write,
            _ => return,
        };
        let _ = event_tx.blocking_send(mapped);
    })
    .map_err(|e| Error::Connection(format!("create watcher: {}", e)))?;

    watcher
        .watch(&watch_dir, RecursiveMode::NonRecursive)
        .map_err(|e| Error::Connection(format!("watch {:?}: {}", watch_dir, e)))?;

    tracing::debug!("👁️ Tailing session file: {:?}", session_path);

    let (tx, rx) = mpsc::channel(STREAM_BUFFER);
    tokio::spawn(stream_local_loop(
        reader,
        session_path.to_path_buf(),
        watcher,
        event_rx,
        tx,
        backlog_entries,
        cancel,
    ));

    Ok(rx)
}

/// 读完整个文件，返回最后 n 条可解析的条目
async fn read_backlog(reader: &mut BufReader<File>, n: usize) -> Vec<StreamEntry> {
    let mut entries = Vec::new();
    let mut line = String::new();
    loop {
        line.clear();
        match reader.read_line(&mut line).await {
            Ok(0) | Err(_) => break,
            Ok(_) => {
                if let Some(entry) = parse_jsonl_line(&line) {
                    entries.push(entry);
                }
            }
        }
    }
    if entries.len() > n {
        entries.drain(..entries.len() - n);
    }
    entries
}

async fn stream_local_loop(
    mut reader: BufReader<File>,
    session_path: std::path::PathBuf,
    _watcher: notify::RecommendedWatcher,
    mut events: mpsc::Receiver<FileEvent>,
    tx: mpsc::Sender<StreamEntry>,
    backlog: Vec<StreamEntry>,
    cancel: CancellationToken,
) {
    for entry in backlog {
        tokio::select! {
            result = tx.send(entry) => {
                if result.is_err() {
                    return;
                }
            }
            _ = cancel.cancelled() => return,
        }
    }

    let debounce = tokio::time::sleep(Duration::from_secs(0));
    tokio::pin!(debounce);
    let mut armed = false;

    let mut line = String::new();
    loop {
        tokio::select! {
            _ = cancel.cancelled() => return,

            maybe = events.recv() => match maybe {
                None => return,
                Some(FileEvent::Write) => {
                    debounce.as_mut().reset(Instant::now() + DEBOUNCE);
                    armed = true;
                }
                Some(FileEvent::Removed) => {
                    let _ = tx.send(StreamEntry::synthetic(STREAM_ENDING_TEXT)).await;
                    return;
                }
            },

            _ = &mut debounce, if armed => {
                armed = false;
                // 读出所有新可用的行，按顺序解析发送
                loop {
                    line.clear();
                    match reader.read_line(&mut line).await {
                        Ok(0) | Err(_) => break,
                        Ok(_) => {
                            if let Some(entry) = parse_jsonl_line(&line) {
                                if tx.send(entry).await.is_err() {
                                    return;
                                }
                            }
                        }
                    }
                }
                // 目录事件漏投时的兜底：文件已不在就结束流
                if tokio::fs::metadata(&session_path).await.is_err() {
                    let _ = tx.send(StreamEntry::synthetic(STREAM_ENDING_TEXT)).await;
                    return;
                }
            }
        }
    }
}

/// 尝试把一行 JSONL 解析为 StreamEntry
///
/// 会话文件格式随来源（Claude、Codex 等）不同但共享基本模式；
/// 无法解析的行返回 None，由调用方静默跳过，保持对新格式的前向兼容。
pub fn parse_jsonl_line(line: &str) -> Option<StreamEntry> {
    let raw: serde_json::Value = serde_json::from_str(line.trim()).ok()?;
    let obj = raw.as_object()?;

    let mut entry = StreamEntry {
        timestamp: Some(Utc::now()),
        ..Default::default()
    };

    let entry_type = obj.get("type").and_then(|v| v.as_str()).unwrap_or("");
    match entry_type {
        "human" | "user" => entry.role = "user".to_string(),
        "assistant" => {
            entry.role = "assistant".to_string();
            entry.model = extract_string(obj, "model");
        }
        _ => {
            // 退化为通用 role 字段
            match obj.get("role").and_then(|v| v.as_str()) {
                Some(role) if !role.is_empty() => entry.role = role.to_string(),
                _ => return None,
            }
        }
    }

    entry.content_blocks = extract_content_blocks(obj);
    if entry.content_blocks.is_empty() {
        entry.text = extract_text(obj);
    }

    if let Some(ts) = obj.get("timestamp").and_then(|v| v.as_str()) {
        if let Ok(t) = DateTime::parse_from_rfc3339(ts) {
            entry.timestamp = Some(t.with_timezone(&Utc));
        }
    }

    Some(entry)
}

/// 解析 message.content：可能是纯字符串，也可能是类型化内容块数组
fn extract_content_blocks(obj: &serde_json::Map<String, serde_json::Value>) -> Vec<ContentBlock> {
    let content = match obj.get("message").and_then(|m| m.get("content")) {
        Some(c) => c,
        None => return Vec::new(),
    };

    // 纯字符串（user 条目常见："content": "hello"）
    if let Some(s) = content.as_str() {
        if s.is_empty() {
            return Vec::new();
        }
        return vec![ContentBlock::Text {
            text: s.to_string(),
        }];
    }

    let arr = match content.as_array() {
        Some(a) => a,
        None => return Vec::new(),
    };

    let mut blocks = Vec::new();
    for c in arr {
        let block_type = c.get("type").and_then(|v| v.as_str()).unwrap_or("");
        match block_type {
            "text" => {
                if let Some(text) = c.get("text").and_then(|v| v.as_str()) {
                    if !text.is_empty() {
                        blocks.push(ContentBlock::Text {
                            text: text.to_string(),
                        });
                    }
                }
            }
            "thinking" => {
                if let Some(thinking) = c.get("thinking").and_then(|v| v.as_str()) {
                    if !thinking.is_empty() {
                        blocks.push(ContentBlock::Thinking {
                            thinking: thinking.to_string(),
                        });
                    }
                }
            }
            "tool_use" => {
                blocks.push(ContentBlock::ToolUse {
                    tool_name: c
                        .get("name")
                        .and_then(|v| v.as_str())
                        .unwrap_or("")
                        .to_string(),
                    tool_use_id: c
                        .get("id")
                        .and_then(|v| v.as_str())
                        .unwrap_or("")
                        .to_string(),
                });
            }
            "tool_result" => {
                let result = c
                    .get("content")
                    .and_then(|v| v.as_str())
                    .unwrap_or("(result)")
                    .to_string();
                blocks.push(ContentBlock::ToolResult {
                    result,
                    is_error: c.get("is_error").and_then(|v| v.as_bool()).unwrap_or(false),
                });
            }
            _ => {}
        }
    }
    blocks
}

fn extract_text(obj: &serde_json::Map<String, serde_json::Value>) -> String {
    if let Some(content) = obj.get("message").and_then(|m| m.get("content")) {
        if let Some(s) = content.as_str() {
            if !s.is_empty() {
                return s.to_string();
            }
        }
        if let Some(arr) = content.as_array() {
            for c in arr {
                let block_type = c.get("type").and_then(|v| v.as_str()).unwrap_or("");
                if block_type == "text" {
                    if let Some(text) = c.get("text").and_then(|v| v.as_str()) {
                        if !text.is_empty() {
                            return text.to_string();
                        }
                    }
                }
                if block_type == "tool_use" {
                    if let Some(name) = c.get("name").and_then(|v| v.as_str()) {
                        if !name.is_empty() {
                            return format!("[tool_use: {}]", name);
                        }
                    }
                }
            }
        }
    }

    obj.get("text")
        .and_then(|v| v.as_str())
        .unwrap_or("")
        .to_string()
}

/// 先查顶层字段，再查 message 内嵌字段
fn extract_string(obj: &serde_json::Map<String, serde_json::Value>, key: &str) -> String {
    if let Some(s) = obj.get(key).and_then(|v| v.as_str()) {
        return s.to_string();
    }
    obj.get("message")
        .and_then(|m| m.get(key))
        .and_then(|v| v.as_str())
        .unwrap_or("")
        .to_string()
}
