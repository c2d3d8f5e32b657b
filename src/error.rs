//! 错误类型定义

use thiserror::Error;

/// 库错误类型
#[derive(Error, Debug)]
pub enum Error {
    /// 数据库错误
    #[error("数据库错误: {0}")]
    Database(#[from] rusqlite::Error),

    /// IO 错误
    #[error("IO 错误: {0}")]
    Io(#[from] std::io::Error),

    /// 请求校验错误（整个请求被拒绝，不落库）
    #[error("校验错误: {0}")]
    Validation(String),

    /// 连接错误
    #[error("连接错误: {0}")]
    Connection(String),
}

/// Result 类型别名
pub type Result<T> = std::result::Result<T, Error>;
