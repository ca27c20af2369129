//! Checkpoint 引擎
//!
//! 为交互式编码会话提供工作区版本管理：
//! - 内容寻址、引用计数的 blob 存储
//! - 可分叉的 checkpoint 时间线
//! - 恢复、差异对比与 fork
//! - 基于消息流的自动 checkpoint 策略

// 模块声明
pub mod checkpoint; // checkpoint 引擎核心模块
pub mod storage; // SQLite 存储与路径模块
pub mod utils; // 工具和错误处理模块

pub use checkpoint::{
    CheckpointConfig, CheckpointError, CheckpointResult, CheckpointService, CheckpointStrategy,
};
pub use storage::{DatabaseManager, DatabaseOptions, StoragePaths};
pub use utils::init_logging;
