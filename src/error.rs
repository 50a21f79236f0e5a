//! 同步引擎错误分类

use serde::{Deserialize, Serialize};

/// 同步引擎错误
#[derive(Debug, thiserror::Error)]
pub enum SyncError {
    #[error("对象不存在: {0}")]
    NotFound(String),
    #[error("无权访问: {0}")]
    AccessDenied(String),
    #[error("存储配额已用尽: {0}")]
    QuotaExceeded(String),
    #[error("完整性校验失败: {path} (expected {expected}, actual {actual})")]
    IntegrityMismatch {
        path: String,
        expected: String,
        actual: String,
    },
    #[error("元数据已损坏: {0}")]
    CorruptMetadata(String),
    #[error("路径大小写冲突: {0}")]
    AmbiguousPath(String),
    #[error("路径不能映射到同步目录内: {0}")]
    InvalidPath(String),
    #[error("传输超时 ({secs}s): {path}")]
    TransferTimeout { path: String, secs: u64 },
    #[error("连接失败: {0}")]
    ConnectivityError(String),
    #[error("配置无效: {0}")]
    InvalidConfig(String),
    #[error("IO 错误: {0}")]
    Io(#[from] std::io::Error),
    #[error("存储后端错误: {0}")]
    Backend(String),
}

/// 可序列化的错误类别，写入运行报告
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    NotFound,
    AccessDenied,
    QuotaExceeded,
    IntegrityMismatch,
    CorruptMetadata,
    AmbiguousPath,
    InvalidPath,
    TransferTimeout,
    ConnectivityError,
    InvalidConfig,
    Io,
    Backend,
}

impl SyncError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            SyncError::NotFound(_) => ErrorKind::NotFound,
            SyncError::AccessDenied(_) => ErrorKind::AccessDenied,
            SyncError::QuotaExceeded(_) => ErrorKind::QuotaExceeded,
            SyncError::IntegrityMismatch { .. } => ErrorKind::IntegrityMismatch,
            SyncError::CorruptMetadata(_) => ErrorKind::CorruptMetadata,
            SyncError::AmbiguousPath(_) => ErrorKind::AmbiguousPath,
            SyncError::InvalidPath(_) => ErrorKind::InvalidPath,
            SyncError::TransferTimeout { .. } => ErrorKind::TransferTimeout,
            SyncError::ConnectivityError(_) => ErrorKind::ConnectivityError,
            SyncError::InvalidConfig(_) => ErrorKind::InvalidConfig,
            SyncError::Io(_) => ErrorKind::Io,
            SyncError::Backend(_) => ErrorKind::Backend,
        }
    }
}

impl From<opendal::Error> for SyncError {
    fn from(e: opendal::Error) -> Self {
        let message = e.to_string();
        match e.kind() {
            opendal::ErrorKind::NotFound => SyncError::NotFound(message),
            opendal::ErrorKind::PermissionDenied => SyncError::AccessDenied(message),
            opendal::ErrorKind::RateLimited => SyncError::QuotaExceeded(message),
            _ if message.contains("QuotaExceeded") || message.contains("quota") => {
                SyncError::QuotaExceeded(message)
            }
            _ if e.is_temporary() => SyncError::ConnectivityError(message),
            _ => SyncError::Backend(message),
        }
    }
}

pub type Result<T, E = SyncError> = std::result::Result<T, E>;
