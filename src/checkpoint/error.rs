//! Checkpoint 引擎错误定义

use std::path::PathBuf;
use std::time::Duration;

/// 错误分类，供调用方渲染具体提示
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    NotFound,
    AlreadyExists,
    IoFailure,
    InvariantViolation,
    ConcurrencyTimeout,
    Storage,
    Invalid,
}

/// Checkpoint 相关错误
#[derive(Debug, thiserror::Error)]
pub enum CheckpointError {
    #[error("会话不存在: {session_id}")]
    SessionNotFound { session_id: String },

    #[error("Checkpoint 不存在: {checkpoint_id} (session {session_id})")]
    CheckpointNotFound {
        session_id: String,
        checkpoint_id: String,
    },

    #[error("Blob 不存在: {0}")]
    BlobNotFound(String),

    #[error("会话已存在: {0}")]
    SessionAlreadyExists(String),

    #[error("会话初始化失败: {session_id} ({reason})")]
    SessionBootstrapFailed { session_id: String, reason: String },

    #[error("工作区路径无效: {0}")]
    InvalidWorkspace(String),

    #[error("IO 错误 {}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("数据库错误: {0}")]
    Database(#[from] sqlx::Error),

    #[error("时间线不变量被破坏: {0}")]
    InvariantViolation(String),

    #[error("等待会话锁超时: {session_id} ({waited:?})")]
    ConcurrencyTimeout { session_id: String, waited: Duration },

    #[error("解析错误: {0}")]
    Parse(String),

    #[error("后台任务失败: {0}")]
    Join(String),
}

impl CheckpointError {
    pub fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::Io {
            path: path.into(),
            source,
        }
    }

    pub fn checkpoint_not_found(session_id: &str, checkpoint_id: &str) -> Self {
        Self::CheckpointNotFound {
            session_id: session_id.to_string(),
            checkpoint_id: checkpoint_id.to_string(),
        }
    }

    pub fn session_not_found(session_id: &str) -> Self {
        Self::SessionNotFound {
            session_id: session_id.to_string(),
        }
    }

    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::SessionNotFound { .. } | Self::CheckpointNotFound { .. } | Self::BlobNotFound(_) => {
                ErrorKind::NotFound
            }
            Self::SessionAlreadyExists(_) => ErrorKind::AlreadyExists,
            Self::Io { .. } | Self::SessionBootstrapFailed { .. } => ErrorKind::IoFailure,
            Self::InvariantViolation(_) => ErrorKind::InvariantViolation,
            Self::ConcurrencyTimeout { .. } => ErrorKind::ConcurrencyTimeout,
            Self::Database(_) | Self::Join(_) => ErrorKind::Storage,
            Self::InvalidWorkspace(_) | Self::Parse(_) => ErrorKind::Invalid,
        }
    }

    /// 调用方是否可以直接重试
    pub fn is_retryable(&self) -> bool {
        matches!(self.kind(), ErrorKind::ConcurrencyTimeout)
    }
}

impl From<tokio::task::JoinError> for CheckpointError {
    fn from(err: tokio::task::JoinError) -> Self {
        Self::Join(err.to_string())
    }
}

pub type CheckpointResult<T> = Result<T, CheckpointError>;
