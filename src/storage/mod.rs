/*!
 * 存储系统模块
 *
 * 负责 checkpoint 引擎的 SQLite 数据层：路径解析、连接池与表结构初始化。
 * blob 字节存放在数据目录下的 blobs 目录中，由 checkpoint::ContentStore 管理。
 */

pub mod database;
pub mod error;
pub mod paths;
pub mod sql_scripts;

pub use database::{DatabaseManager, DatabaseOptions};
pub use error::{StoragePathsError, StoragePathsResult};
pub use paths::{StoragePaths, StoragePathsBuilder};

/// 存储目录名称
pub const DATA_DIR_NAME: &str = "data";
pub const BLOBS_DIR_NAME: &str = "blobs";

/// 文件名称
pub const DATABASE_FILE_NAME: &str = "checkpoints.db";
