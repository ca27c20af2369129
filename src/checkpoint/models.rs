//! Checkpoint 系统数据模型定义

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::error::CheckpointError;

/// 毫秒时间戳转 DateTime
pub fn timestamp_to_datetime(ts_millis: i64) -> DateTime<Utc> {
    DateTime::from_timestamp_millis(ts_millis).unwrap_or_default()
}

/// 自动 checkpoint 策略
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum CheckpointStrategy {
    Manual,
    PerPrompt,
    PerToolUse,
    #[default]
    Smart,
}

impl CheckpointStrategy {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Manual => "manual",
            Self::PerPrompt => "per_prompt",
            Self::PerToolUse => "per_tool_use",
            Self::Smart => "smart",
        }
    }
}

impl fmt::Display for CheckpointStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for CheckpointStrategy {
    type Err = CheckpointError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "manual" => Ok(Self::Manual),
            "per_prompt" => Ok(Self::PerPrompt),
            "per_tool_use" => Ok(Self::PerToolUse),
            "smart" => Ok(Self::Smart),
            other => Err(CheckpointError::Parse(format!(
                "Unknown checkpoint strategy: {}",
                other
            ))),
        }
    }
}

/// fork 来源
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct ForkOrigin {
    pub session_id: String,
    pub checkpoint_id: String,
}

/// Checkpoint 元数据
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct CheckpointMetadata {
    pub total_tokens: i64,
    pub model_used: Option<String>,
    pub user_prompt: String,
    /// 相对父 checkpoint 新增、修改、删除的文件数
    pub file_changes_count: i64,
    /// 快照中所有存活文件的字节总数
    pub snapshot_size: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub fork_origin: Option<ForkOrigin>,
}

/// Checkpoint 记录：时间线上的一个节点
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct Checkpoint {
    pub id: String,
    pub session_id: String,
    pub project_id: String,
    pub message_index: i64,
    pub timestamp: DateTime<Utc>,
    pub parent_checkpoint_id: Option<String>,
    pub description: Option<String>,
    pub metadata: CheckpointMetadata,
}

/// 文件变更类型
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum FileChangeType {
    Added,
    Modified,
    Deleted,
    Unchanged,
}

impl FileChangeType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Added => "added",
            Self::Modified => "modified",
            Self::Deleted => "deleted",
            Self::Unchanged => "unchanged",
        }
    }

    pub fn is_change(&self) -> bool {
        !matches!(self, Self::Unchanged)
    }
}

impl FromStr for FileChangeType {
    type Err = CheckpointError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "added" => Ok(Self::Added),
            "modified" => Ok(Self::Modified),
            "deleted" => Ok(Self::Deleted),
            "unchanged" => Ok(Self::Unchanged),
            other => Err(CheckpointError::Parse(format!(
                "Unknown file change type: {}",
                other
            ))),
        }
    }
}

/// 文件快照：记录某个文件在 checkpoint 时的状态
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct FileSnapshot {
    pub id: i64,
    pub checkpoint_id: String,
    pub file_path: String,
    /// 墓碑记录没有内容
    pub content_hash: Option<String>,
    pub change_type: FileChangeType,
    pub is_deleted: bool,
    pub permissions: Option<u32>,
    pub size: i64,
}

/// 新建文件快照的输入参数（尚未绑定 checkpoint）
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewFileSnapshot {
    pub file_path: String,
    pub content_hash: Option<String>,
    pub change_type: FileChangeType,
    pub is_deleted: bool,
    pub permissions: Option<u32>,
    pub size: i64,
}

impl NewFileSnapshot {
    pub fn tombstone(file_path: String) -> Self {
        Self {
            file_path,
            content_hash: None,
            change_type: FileChangeType::Deleted,
            is_deleted: true,
            permissions: None,
            size: 0,
        }
    }
}

/// 快照过程中被跳过或降级处理的文件
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct SnapshotWarning {
    pub path: String,
    pub reason: String,
}

/// 时间线树节点（对外展示用，按需从 arena 构建）
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TimelineNode {
    pub checkpoint: Checkpoint,
    pub children: Vec<TimelineNode>,
    pub file_snapshot_ids: Vec<i64>,
}

/// 会话时间线
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionTimeline {
    pub session_id: String,
    pub root_node: Option<TimelineNode>,
    pub current_checkpoint_id: Option<String>,
    pub auto_checkpoint_enabled: bool,
    pub checkpoint_strategy: CheckpointStrategy,
    pub total_checkpoints: usize,
}

/// 会话设置投影
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct CheckpointSettings {
    pub auto_checkpoint_enabled: bool,
    pub checkpoint_strategy: CheckpointStrategy,
    pub total_checkpoints: usize,
    pub current_checkpoint_id: Option<String>,
}

/// 创建、恢复、fork 操作的返回值
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CheckpointOutcome {
    pub checkpoint: Checkpoint,
    pub files_processed: usize,
    pub warnings: Vec<SnapshotWarning>,
}

/// 单个文件的差异
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct FileDiff {
    pub path: String,
    pub additions: usize,
    pub deletions: usize,
    /// unified diff 内容，仅在显式请求时计算
    pub diff_content: Option<String>,
}

/// 两个 checkpoint 之间的差异
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CheckpointDiff {
    pub from_checkpoint_id: String,
    pub to_checkpoint_id: String,
    pub modified_files: Vec<FileDiff>,
    pub added_files: Vec<String>,
    pub deleted_files: Vec<String>,
    pub token_delta: i64,
}

/// 会话持久化状态（checkpoint_sessions 表的一行）
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionRecord {
    pub session_id: String,
    pub project_id: String,
    pub project_path: String,
    pub current_checkpoint_id: Option<String>,
    pub auto_checkpoint_enabled: bool,
    pub checkpoint_strategy: CheckpointStrategy,
    pub forked_from: Option<ForkOrigin>,
}

/// 注册表状态统计
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CheckpointStateStats {
    pub active_managers: usize,
    pub active_sessions: Vec<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn strategy_round_trips_through_storage_strings() {
        for strategy in [
            CheckpointStrategy::Manual,
            CheckpointStrategy::PerPrompt,
            CheckpointStrategy::PerToolUse,
            CheckpointStrategy::Smart,
        ] {
            assert_eq!(strategy.as_str().parse::<CheckpointStrategy>().unwrap(), strategy);
        }
        assert!("hourly".parse::<CheckpointStrategy>().is_err());
    }

    #[test]
    fn strategy_serializes_snake_case() {
        let json = serde_json::to_string(&CheckpointStrategy::PerToolUse).unwrap();
        assert_eq!(json, "\"per_tool_use\"");
    }

    #[test]
    fn tombstone_has_no_content() {
        let tombstone = NewFileSnapshot::tombstone("src/lib.rs".into());
        assert!(tombstone.is_deleted);
        assert!(tombstone.content_hash.is_none());
        assert_eq!(tombstone.change_type, FileChangeType::Deleted);
    }
}
