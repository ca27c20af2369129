//! Checkpoint 系统模块
//!
//! 为交互式编码会话提供类似 Git 的工作区快照：
//! - 按策略自动或手动创建 checkpoint
//! - 以树形时间线组织历史，支持从任意节点 fork
//! - 恢复到任意历史状态
//! - 任意两个 checkpoint 之间的文件差异

mod blob_store;
mod config;
mod diff;
mod error;
mod models;
mod policy;
mod registry;
mod service;
mod snapshot;
mod storage;
mod timeline;
mod tree;

pub use blob_store::{BlobStoreStats, ContentStore, StoredBlob};
pub use config::{CheckpointConfig, IgnoreRules, SmartStrategyConfig};
pub use error::{CheckpointError, CheckpointResult, ErrorKind};
pub use models::{
    Checkpoint, CheckpointDiff, CheckpointMetadata, CheckpointOutcome, CheckpointSettings,
    CheckpointStateStats, CheckpointStrategy, FileChangeType, FileDiff, FileSnapshot, ForkOrigin,
    SessionTimeline, SnapshotWarning, TimelineNode,
};
pub use policy::{classify as classify_message, AutoCheckpointPolicy, MessageKind};
pub use registry::{CheckpointManagerRegistry, SessionHandle};
pub use service::CheckpointService;
pub use snapshot::SnapshotEngine;
pub use storage::CheckpointStorage;
pub use timeline::{CheckpointDraft, TimelineManager};
