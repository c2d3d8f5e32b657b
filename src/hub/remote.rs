//! 远端会话 WebSocket 流
//!
//! 连接采集器的会话 WebSocket 端点并持续转发条目。连接断开后按
//! 指数退避重连，重连时带上最后收到条目的时间戳避免重复回放。

use std::time::Duration;

use chrono::{DateTime, SecondsFormat, Utc};
use futures_util::StreamExt;
use tokio::sync::mpsc;
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::header::AUTHORIZATION;
use tokio_tungstenite::tungstenite::http::HeaderValue;
use tokio_tungstenite::tungstenite::Message;
use tokio_util::sync::CancellationToken;

use super::types::StreamEntry;

/// 退避起点
const BACKOFF_BASE: Duration = Duration::from_secs(1);
/// 退避上限
const BACKOFF_CAP: Duration = Duration::from_secs(30);
/// 连续失败达到该次数时，向下游发一条合成的"重连中"提示
const FAIL_NOTICE_THRESHOLD: u32 = 5;
/// 下游通道容量
const STREAM_BUFFER: usize = 64;

/// 连续失败越过阈值时的合成条目文本
pub const RETRYING_TEXT: &str = "Connection lost, retrying...";

/// 开始流式读取一个远端会话
///
/// 立即返回接收端；后台任务负责连接、重连与转发，直到取消或下游
/// 关闭。单次连接失败不会终止流，只会进入退避。
pub fn stream_remote(
    ws_url: String,
    token: Option<String>,
    cancel: CancellationToken,
) -> mpsc::Receiver<StreamEntry> {
    let (tx, rx) = mpsc::channel(STREAM_BUFFER);
    tokio::spawn(stream_remote_loop(ws_url, token, tx, cancel));
    rx
}

async fn stream_remote_loop(
    ws_url: String,
    token: Option<String>,
    tx: mpsc::Sender<StreamEntry>,
    cancel: CancellationToken,
) {
    let mut fails: u32 = 0;
    let mut last_ts: Option<DateTime<Utc>> = None;

    loop {
        if cancel.is_cancelled() || tx.is_closed() {
            return;
        }

        match stream_once(&ws_url, token.as_deref(), &mut fails, &mut last_ts, &tx, &cancel).await
        {
            Ok(()) => {
                // 正常完成只可能来自取消或下游关闭
                return;
            }
            Err(e) => {
                fails += 1;
                tracing::debug!("📡 Remote stream {} failed ({}): {}", ws_url, fails, e);
                // 只在刚越过阈值时通知一次，避免刷屏
                if fails == FAIL_NOTICE_THRESHOLD {
                    if tx.send(StreamEntry::synthetic(RETRYING_TEXT)).await.is_err() {
                        return;
                    }
                }
            }
        }

        let delay = backoff_delay(fails);
        tokio::select! {
            _ = tokio::time::sleep(delay) => {}
            _ = cancel.cancelled() => return,
        }
    }
}

/// 指数退避：base * 2^(fails-1)，封顶 30s
fn backoff_delay(fails: u32) -> Duration {
    let shift = fails.saturating_sub(1).min(5);
    let delay = BACKOFF_BASE * 2u32.pow(shift);
    delay.min(BACKOFF_CAP)
}

/// 单次连接：建连、转发直到断开
///
/// Ok 表示取消或下游关闭（流结束），Err 表示需要退避重连。
async fn stream_once(
    ws_url: &str,
    token: Option<&str>,
    fails: &mut u32,
    last_ts: &mut Option<DateTime<Utc>>,
    tx: &mpsc::Sender<StreamEntry>,
    cancel: &CancellationToken,
) -> anyhow::Result<()> {
    let url = match last_ts {
        Some(ts) => format!(
            "{}?after={}",
            ws_url,
            ts.to_rfc3339_opts(SecondsFormat::Millis, true)
        ),
        None => ws_url.to_string(),
    };

    let mut request = url.as_str().into_client_request()?;
    if let Some(token) = token {
        request.headers_mut().insert(
            AUTHORIZATION,
            HeaderValue::from_str(&format!("Bearer {}", token))?,
        );
    }

    let (ws, _) = tokio::select! {
        result = connect_async(request) => result?,
        _ = cancel.cancelled() => return Ok(()),
    };
    tracing::debug!("📡 Remote stream connected: {}", ws_url);
    *fails = 0;

    let (_, mut read) = ws.split();

    loop {
        let msg = tokio::select! {
            msg = read.next() => msg,
            _ = cancel.cancelled() => return Ok(()),
        };

        let msg = match msg {
            Some(Ok(m)) => m,
            Some(Err(e)) => anyhow::bail!("read: {}", e),
            None => anyhow::bail!("connection closed"),
        };

        let text = match msg {
            Message::Text(t) => t,
            Message::Close(_) => anyhow::bail!("server closed connection"),
            _ => continue,
        };

        let entry: StreamEntry = match serde_json::from_str(&text) {
            Ok(e) => e,
            Err(e) => {
                tracing::debug!("📡 Skipping unparseable stream message: {}", e);
                continue;
            }
        };

        if let Some(ts) = entry.timestamp {
            *last_ts = Some(ts);
        }

        if tx.send(entry).await.is_err() {
            return Ok(());
        }
    }
}
