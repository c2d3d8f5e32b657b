//! 请求归一化
//!
//! 校验并清洗一次上报请求：信封级问题拒绝整个请求，
//! 条目级问题仅剔除该条目并计数。

use chrono::Utc;

use crate::error::{Error, Result};
use crate::types::{IngestEntry, IngestRequest, Role};

/// 归一化一次上报请求（原地修改）
///
/// 信封无效（session_id / source / entries 为空）时返回错误，不落库。
/// 返回被剔除的条目数；全部被剔除时 `req.entries` 为空，调用方跳过存储。
pub fn normalize_request(req: &mut IngestRequest) -> Result<usize> {
    if req.session_id.is_empty() {
        return Err(Error::Validation("session_id is required".into()));
    }
    if req.source.trim().is_empty() {
        return Err(Error::Validation("source is required".into()));
    }
    if req.entries.is_empty() {
        return Err(Error::Validation("entries must not be empty".into()));
    }

    req.source = req.source.trim().to_lowercase();
    req.project_path = req.project_path.trim().to_string();
    req.instance_id = req.instance_id.trim().to_string();

    let mut dropped = 0;
    req.entries.retain_mut(|e| {
        if normalize_entry(e).is_ok() {
            true
        } else {
            dropped += 1;
            false
        }
    });

    Ok(dropped)
}

/// 归一化单条条目
fn normalize_entry(e: &mut IngestEntry) -> Result<()> {
    if e.uuid.is_empty() {
        return Err(Error::Validation("entry uuid is required".into()));
    }
    e.role = e.role.trim().to_lowercase();
    let role: Role = e
        .role
        .parse()
        .map_err(Error::Validation)?;
    e.role = role.to_string();

    if e.timestamp.is_none() {
        e.timestamp = Some(Utc::now());
    }
    e.model = e.model.trim().to_string();
    e.tool_name = e.tool_name.trim().to_string();
    if e.input_tokens < 0 {
        e.input_tokens = 0;
    }
    if e.output_tokens < 0 {
        e.output_tokens = 0;
    }
    if e.thinking_len < 0 {
        e.thinking_len = 0;
    }

    // 分类标志缺省时由已有数据推导，显式值（含 false）不覆盖。
    // 旧版 exporter 不发送这两个字段，也能得到正确分类。
    if e.has_thinking.is_none() {
        e.has_thinking = Some(e.thinking_len > 0);
    }
    if e.has_tool_use.is_none() {
        e.has_tool_use = Some(!e.tool_name.is_empty());
    }
    Ok(())
}
