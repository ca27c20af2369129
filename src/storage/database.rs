/*!
 * Checkpoint 数据库连接管理
 *
 * 一个数据目录对应一个 SQLite 文件，所有会话共享同一个连接池。
 */

use crate::storage::paths::StoragePaths;
use crate::storage::sql_scripts::{SqlScript, SqlScriptCatalog};
use crate::utils::error::AppResult;
use anyhow::Context;
use sqlx::sqlite::{
    SqliteConnectOptions, SqliteJournalMode, SqlitePool, SqlitePoolOptions, SqliteSynchronous,
};
use sqlx::ConnectOptions;
use std::fmt;
use std::time::Duration;
use tracing::{debug, info};

/// 连接池参数
#[derive(Debug, Clone)]
pub struct DatabaseOptions {
    /// 上限为 0 时按 CPU 数推算
    pub max_connections: u32,
    pub min_connections: u32,
    pub acquire_timeout: Duration,
    /// 写锁冲突时 SQLite 的等待时间
    pub busy_timeout: Duration,
    pub wal: bool,
}

impl Default for DatabaseOptions {
    fn default() -> Self {
        Self {
            max_connections: 0,
            min_connections: 1,
            acquire_timeout: Duration::from_secs(10),
            busy_timeout: Duration::from_secs(30),
            wal: true,
        }
    }
}

impl DatabaseOptions {
    fn connection_limits(&self) -> (u32, u32) {
        let min = self.min_connections.max(1);
        let max = if self.max_connections == 0 {
            std::thread::available_parallelism()
                .map(|n| n.get() as u32 * 2)
                .unwrap_or(8)
                .min(16)
        } else {
            self.max_connections
        };
        (min, max.max(min))
    }

    fn connect_options(&self, paths: &StoragePaths) -> SqliteConnectOptions {
        let journal = if self.wal {
            SqliteJournalMode::Wal
        } else {
            SqliteJournalMode::Delete
        };

        // 删除 checkpoint 依赖外键级联清理文件快照，必须逐连接开启
        SqliteConnectOptions::new()
            .filename(paths.database_file())
            .create_if_missing(true)
            .foreign_keys(true)
            .journal_mode(journal)
            .synchronous(SqliteSynchronous::Normal)
            .busy_timeout(self.busy_timeout)
            .disable_statement_logging()
    }
}

pub struct DatabaseManager {
    pool: SqlitePool,
    paths: StoragePaths,
    scripts: Vec<SqlScript>,
}

impl fmt::Debug for DatabaseManager {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DatabaseManager")
            .field("database", &self.paths.database_file())
            .field("connections", &self.pool.size())
            .finish()
    }
}

impl DatabaseManager {
    /// 打开数据库并确保表结构存在
    pub async fn open(paths: StoragePaths, options: DatabaseOptions) -> AppResult<Self> {
        let db_file = paths.database_file();
        if let Some(dir) = db_file.parent() {
            tokio::fs::create_dir_all(dir)
                .await
                .with_context(|| format!("无法创建数据库目录: {}", dir.display()))?;
        }

        let (min_connections, max_connections) = options.connection_limits();
        debug!(
            "Opening checkpoint database {} (connections {}..={})",
            db_file.display(),
            min_connections,
            max_connections
        );

        let pool = SqlitePoolOptions::new()
            .min_connections(min_connections)
            .max_connections(max_connections)
            .acquire_timeout(options.acquire_timeout)
            .connect_with(options.connect_options(&paths))
            .await
            .with_context(|| format!("无法打开数据库: {}", db_file.display()))?;

        let manager = Self {
            pool,
            paths,
            scripts: SqlScriptCatalog::load().context("SQL 脚本解析失败")?,
        };
        manager.apply_schema().await?;
        Ok(manager)
    }

    /// 执行全部建表脚本；脚本均为 IF NOT EXISTS，可重复执行
    pub async fn apply_schema(&self) -> AppResult<()> {
        for script in &self.scripts {
            for statement in &script.statements {
                sqlx::query(statement)
                    .execute(&self.pool)
                    .await
                    .with_context(|| format!("脚本 {} 执行失败", script.name))?;
            }
            debug!("Applied SQL script {}", script.name);
        }

        info!(
            "Checkpoint schema ready at {}",
            self.paths.database_file().display()
        );
        Ok(())
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    pub fn paths(&self) -> &StoragePaths {
        &self.paths
    }

    pub async fn close(&self) {
        self.pool.close().await;
    }
}
