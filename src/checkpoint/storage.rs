//! CheckpointStorage：数据访问层
//!
//! 负责会话、checkpoint 和文件快照的数据库 CRUD 操作。
//! 涉及多张表的写入全部放在单个事务中，任何一步失败都不会留下半成品。

use std::collections::HashMap;
use std::str::FromStr;

use chrono::Utc;
use sqlx::sqlite::SqliteRow;
use sqlx::{Row, SqliteConnection, SqlitePool};

use super::error::CheckpointResult;
use super::models::{
    timestamp_to_datetime, Checkpoint, CheckpointMetadata, CheckpointStrategy, FileChangeType,
    FileSnapshot, ForkOrigin, NewFileSnapshot, SessionRecord,
};

const CHECKPOINT_COLUMNS: &str = r#"
    id, session_id, project_id, message_index, parent_checkpoint_id, description,
    total_tokens, model_used, user_prompt, file_changes_count, snapshot_size,
    fork_origin_session_id, fork_origin_checkpoint_id, created_at
"#;

const SNAPSHOT_COLUMNS: &str = r#"
    id, checkpoint_id, file_path, content_hash, change_type, is_deleted, permissions, file_size
"#;

/// Checkpoint 数据访问层
pub struct CheckpointStorage {
    pool: SqlitePool,
}

impl CheckpointStorage {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    fn now() -> i64 {
        Utc::now().timestamp_millis()
    }

    // ==================== Session ====================

    pub async fn get_session(&self, session_id: &str) -> CheckpointResult<Option<SessionRecord>> {
        let row = sqlx::query(
            r#"
            SELECT session_id, project_id, project_path, current_checkpoint_id,
                   auto_checkpoint_enabled, checkpoint_strategy,
                   forked_from_session_id, forked_from_checkpoint_id
            FROM checkpoint_sessions
            WHERE session_id = ?
            "#,
        )
        .bind(session_id)
        .fetch_optional(&self.pool)
        .await?;

        row.map(|r| row_to_session(&r)).transpose()
    }

    pub async fn session_exists(&self, session_id: &str) -> CheckpointResult<bool> {
        let row = sqlx::query("SELECT 1 FROM checkpoint_sessions WHERE session_id = ?")
            .bind(session_id)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row.is_some())
    }

    pub async fn insert_session(&self, record: &SessionRecord) -> CheckpointResult<()> {
        let mut conn = self.pool.acquire().await?;
        insert_session_row(&mut conn, record).await?;

        tracing::debug!(
            "CheckpointStorage: inserted session {} for project {}",
            record.session_id,
            record.project_id
        );
        Ok(())
    }

    pub async fn set_current_checkpoint(
        &self,
        session_id: &str,
        checkpoint_id: Option<&str>,
    ) -> CheckpointResult<()> {
        sqlx::query(
            "UPDATE checkpoint_sessions SET current_checkpoint_id = ?, updated_at = ? WHERE session_id = ?",
        )
        .bind(checkpoint_id)
        .bind(Self::now())
        .bind(session_id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn update_settings(
        &self,
        session_id: &str,
        auto_checkpoint_enabled: bool,
        strategy: CheckpointStrategy,
    ) -> CheckpointResult<()> {
        sqlx::query(
            r#"
            UPDATE checkpoint_sessions
            SET auto_checkpoint_enabled = ?, checkpoint_strategy = ?, updated_at = ?
            WHERE session_id = ?
            "#,
        )
        .bind(auto_checkpoint_enabled)
        .bind(strategy.as_str())
        .bind(Self::now())
        .bind(session_id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    // ==================== Checkpoint ====================

    /// 在同一事务中写入 checkpoint、全部文件快照并移动会话的当前指针
    ///
    /// 返回按输入顺序排列的快照 ID。
    pub async fn insert_checkpoint(
        &self,
        checkpoint: &Checkpoint,
        snapshots: &[NewFileSnapshot],
    ) -> CheckpointResult<Vec<i64>> {
        let mut tx = self.pool.begin().await?;

        insert_checkpoint_row(&mut tx, checkpoint).await?;
        let ids = insert_snapshot_rows(&mut tx, &checkpoint.id, snapshots).await?;
        update_current_row(&mut tx, &checkpoint.session_id, Some(&checkpoint.id)).await?;

        tx.commit().await?;

        tracing::debug!(
            "CheckpointStorage: inserted checkpoint {} (session {}, {} snapshots)",
            checkpoint.id,
            checkpoint.session_id,
            ids.len()
        );
        Ok(ids)
    }

    /// 新建 fork 会话：会话行、根 checkpoint 及其快照一次性落库
    pub async fn insert_forked_session(
        &self,
        record: &SessionRecord,
        root: &Checkpoint,
        snapshots: &[NewFileSnapshot],
    ) -> CheckpointResult<Vec<i64>> {
        let mut tx = self.pool.begin().await?;

        insert_session_row(&mut tx, record).await?;
        insert_checkpoint_row(&mut tx, root).await?;
        let ids = insert_snapshot_rows(&mut tx, &root.id, snapshots).await?;
        update_current_row(&mut tx, &record.session_id, Some(&root.id)).await?;

        tx.commit().await?;
        Ok(ids)
    }

    /// 会话的全部 checkpoint，按创建顺序
    pub async fn list_checkpoints(&self, session_id: &str) -> CheckpointResult<Vec<Checkpoint>> {
        let sql = format!(
            "SELECT {} FROM checkpoints WHERE session_id = ? ORDER BY seq ASC",
            CHECKPOINT_COLUMNS
        );
        let rows = sqlx::query(&sql)
            .bind(session_id)
            .fetch_all(&self.pool)
            .await?;

        Ok(rows.iter().map(row_to_checkpoint).collect())
    }

    /// 删除一批 checkpoint，并把幸存子节点挂到新的父节点上
    ///
    /// 返回被删除快照所引用的内容哈希（每行一次，调用方据此释放引用）。
    pub async fn delete_checkpoints(
        &self,
        session_id: &str,
        checkpoint_ids: &[String],
        reparent: &[(String, Option<String>)],
    ) -> CheckpointResult<Vec<String>> {
        let mut tx = self.pool.begin().await?;
        let mut hashes = Vec::new();

        for (child, new_parent) in reparent {
            sqlx::query(
                "UPDATE checkpoints SET parent_checkpoint_id = ? WHERE session_id = ? AND id = ?",
            )
            .bind(new_parent)
            .bind(session_id)
            .bind(child)
            .execute(&mut *tx)
            .await?;
        }

        for checkpoint_id in checkpoint_ids {
            let rows = sqlx::query(
                r#"
                SELECT content_hash FROM checkpoint_file_snapshots
                WHERE checkpoint_id = ? AND content_hash IS NOT NULL
                "#,
            )
            .bind(checkpoint_id)
            .fetch_all(&mut *tx)
            .await?;
            hashes.extend(rows.iter().map(|r| r.get::<String, _>("content_hash")));

            // 文件快照通过外键级联删除
            sqlx::query("DELETE FROM checkpoints WHERE session_id = ? AND id = ?")
                .bind(session_id)
                .bind(checkpoint_id)
                .execute(&mut *tx)
                .await?;
        }

        tx.commit().await?;

        tracing::debug!(
            "CheckpointStorage: deleted {} checkpoints from session {}",
            checkpoint_ids.len(),
            session_id
        );
        Ok(hashes)
    }

    // ==================== FileSnapshot ====================

    /// checkpoint 的全部快照记录（含墓碑）
    pub async fn get_file_snapshots(
        &self,
        checkpoint_id: &str,
    ) -> CheckpointResult<Vec<FileSnapshot>> {
        let sql = format!(
            "SELECT {} FROM checkpoint_file_snapshots WHERE checkpoint_id = ? ORDER BY file_path",
            SNAPSHOT_COLUMNS
        );
        let rows = sqlx::query(&sql)
            .bind(checkpoint_id)
            .fetch_all(&self.pool)
            .await?;

        rows.iter().map(row_to_snapshot).collect()
    }

    /// checkpoint 时刻存在于工作区中的文件
    pub async fn live_snapshots(&self, checkpoint_id: &str) -> CheckpointResult<Vec<FileSnapshot>> {
        let sql = format!(
            r#"
            SELECT {} FROM checkpoint_file_snapshots
            WHERE checkpoint_id = ? AND is_deleted = 0
            ORDER BY file_path
            "#,
            SNAPSHOT_COLUMNS
        );
        let rows = sqlx::query(&sql)
            .bind(checkpoint_id)
            .fetch_all(&self.pool)
            .await?;

        rows.iter().map(row_to_snapshot).collect()
    }

    pub async fn get_file_snapshot(
        &self,
        checkpoint_id: &str,
        file_path: &str,
    ) -> CheckpointResult<Option<FileSnapshot>> {
        let sql = format!(
            "SELECT {} FROM checkpoint_file_snapshots WHERE checkpoint_id = ? AND file_path = ?",
            SNAPSHOT_COLUMNS
        );
        let row = sqlx::query(&sql)
            .bind(checkpoint_id)
            .bind(file_path)
            .fetch_optional(&self.pool)
            .await?;

        row.as_ref().map(row_to_snapshot).transpose()
    }

    /// 会话内每个 checkpoint 的快照 ID，构建时间线时使用
    pub async fn snapshot_ids_by_session(
        &self,
        session_id: &str,
    ) -> CheckpointResult<HashMap<String, Vec<i64>>> {
        let rows = sqlx::query(
            r#"
            SELECT f.checkpoint_id, f.id
            FROM checkpoint_file_snapshots f
            INNER JOIN checkpoints c ON c.id = f.checkpoint_id
            WHERE c.session_id = ?
            ORDER BY f.id
            "#,
        )
        .bind(session_id)
        .fetch_all(&self.pool)
        .await?;

        let mut grouped: HashMap<String, Vec<i64>> = HashMap::new();
        for row in rows {
            grouped
                .entry(row.get("checkpoint_id"))
                .or_default()
                .push(row.get("id"));
        }
        Ok(grouped)
    }
}

async fn insert_session_row(
    conn: &mut SqliteConnection,
    record: &SessionRecord,
) -> CheckpointResult<()> {
    let now = CheckpointStorage::now();
    let (forked_session, forked_checkpoint) = match &record.forked_from {
        Some(origin) => (
            Some(origin.session_id.as_str()),
            Some(origin.checkpoint_id.as_str()),
        ),
        None => (None, None),
    };

    sqlx::query(
        r#"
        INSERT INTO checkpoint_sessions
            (session_id, project_id, project_path, current_checkpoint_id,
             auto_checkpoint_enabled, checkpoint_strategy,
             forked_from_session_id, forked_from_checkpoint_id, created_at, updated_at)
        VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
        "#,
    )
    .bind(&record.session_id)
    .bind(&record.project_id)
    .bind(&record.project_path)
    .bind(&record.current_checkpoint_id)
    .bind(record.auto_checkpoint_enabled)
    .bind(record.checkpoint_strategy.as_str())
    .bind(forked_session)
    .bind(forked_checkpoint)
    .bind(now)
    .bind(now)
    .execute(&mut *conn)
    .await?;

    Ok(())
}

async fn insert_checkpoint_row(
    conn: &mut SqliteConnection,
    checkpoint: &Checkpoint,
) -> CheckpointResult<()> {
    let meta = &checkpoint.metadata;
    let (origin_session, origin_checkpoint) = match &meta.fork_origin {
        Some(origin) => (
            Some(origin.session_id.as_str()),
            Some(origin.checkpoint_id.as_str()),
        ),
        None => (None, None),
    };

    sqlx::query(
        r#"
        INSERT INTO checkpoints
            (id, session_id, project_id, message_index, parent_checkpoint_id, description,
             total_tokens, model_used, user_prompt, file_changes_count, snapshot_size,
             fork_origin_session_id, fork_origin_checkpoint_id, created_at)
        VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
        "#,
    )
    .bind(&checkpoint.id)
    .bind(&checkpoint.session_id)
    .bind(&checkpoint.project_id)
    .bind(checkpoint.message_index)
    .bind(&checkpoint.parent_checkpoint_id)
    .bind(&checkpoint.description)
    .bind(meta.total_tokens)
    .bind(&meta.model_used)
    .bind(&meta.user_prompt)
    .bind(meta.file_changes_count)
    .bind(meta.snapshot_size)
    .bind(origin_session)
    .bind(origin_checkpoint)
    .bind(checkpoint.timestamp.timestamp_millis())
    .execute(&mut *conn)
    .await?;

    Ok(())
}

async fn insert_snapshot_rows(
    conn: &mut SqliteConnection,
    checkpoint_id: &str,
    snapshots: &[NewFileSnapshot],
) -> CheckpointResult<Vec<i64>> {
    let mut ids = Vec::with_capacity(snapshots.len());

    for snapshot in snapshots {
        let result = sqlx::query(
            r#"
            INSERT INTO checkpoint_file_snapshots
                (checkpoint_id, file_path, content_hash, change_type, is_deleted, permissions, file_size)
            VALUES (?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(checkpoint_id)
        .bind(&snapshot.file_path)
        .bind(&snapshot.content_hash)
        .bind(snapshot.change_type.as_str())
        .bind(snapshot.is_deleted)
        .bind(snapshot.permissions.map(i64::from))
        .bind(snapshot.size)
        .execute(&mut *conn)
        .await?;

        ids.push(result.last_insert_rowid());
    }

    Ok(ids)
}

async fn update_current_row(
    conn: &mut SqliteConnection,
    session_id: &str,
    checkpoint_id: Option<&str>,
) -> CheckpointResult<()> {
    sqlx::query(
        "UPDATE checkpoint_sessions SET current_checkpoint_id = ?, updated_at = ? WHERE session_id = ?",
    )
    .bind(checkpoint_id)
    .bind(CheckpointStorage::now())
    .bind(session_id)
    .execute(&mut *conn)
    .await?;
    Ok(())
}

fn row_to_session(r: &SqliteRow) -> CheckpointResult<SessionRecord> {
    let strategy: String = r.get("checkpoint_strategy");
    let forked_session: Option<String> = r.get("forked_from_session_id");
    let forked_checkpoint: Option<String> = r.get("forked_from_checkpoint_id");

    Ok(SessionRecord {
        session_id: r.get("session_id"),
        project_id: r.get("project_id"),
        project_path: r.get("project_path"),
        current_checkpoint_id: r.get("current_checkpoint_id"),
        auto_checkpoint_enabled: r.get("auto_checkpoint_enabled"),
        checkpoint_strategy: CheckpointStrategy::from_str(&strategy)?,
        forked_from: forked_session
            .zip(forked_checkpoint)
            .map(|(session_id, checkpoint_id)| ForkOrigin {
                session_id,
                checkpoint_id,
            }),
    })
}

fn row_to_checkpoint(r: &SqliteRow) -> Checkpoint {
    let origin_session: Option<String> = r.get("fork_origin_session_id");
    let origin_checkpoint: Option<String> = r.get("fork_origin_checkpoint_id");

    Checkpoint {
        id: r.get("id"),
        session_id: r.get("session_id"),
        project_id: r.get("project_id"),
        message_index: r.get("message_index"),
        timestamp: timestamp_to_datetime(r.get("created_at")),
        parent_checkpoint_id: r.get("parent_checkpoint_id"),
        description: r.get("description"),
        metadata: CheckpointMetadata {
            total_tokens: r.get("total_tokens"),
            model_used: r.get("model_used"),
            user_prompt: r.get("user_prompt"),
            file_changes_count: r.get("file_changes_count"),
            snapshot_size: r.get("snapshot_size"),
            fork_origin: origin_session
                .zip(origin_checkpoint)
                .map(|(session_id, checkpoint_id)| ForkOrigin {
                    session_id,
                    checkpoint_id,
                }),
        },
    }
}

fn row_to_snapshot(r: &SqliteRow) -> CheckpointResult<FileSnapshot> {
    let change_type: String = r.get("change_type");
    let permissions: Option<i64> = r.get("permissions");

    Ok(FileSnapshot {
        id: r.get("id"),
        checkpoint_id: r.get("checkpoint_id"),
        file_path: r.get("file_path"),
        content_hash: r.get("content_hash"),
        change_type: FileChangeType::from_str(&change_type)?,
        is_deleted: r.get("is_deleted"),
        permissions: permissions.and_then(|p| u32::try_from(p).ok()),
        size: r.get("file_size"),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::checkpoint::test_support::memory_pool;

    fn session(id: &str) -> SessionRecord {
        SessionRecord {
            session_id: id.to_string(),
            project_id: "project".to_string(),
            project_path: "/tmp/project".to_string(),
            current_checkpoint_id: None,
            auto_checkpoint_enabled: true,
            checkpoint_strategy: CheckpointStrategy::Smart,
            forked_from: None,
        }
    }

    fn checkpoint(session_id: &str, id: &str, parent: Option<&str>) -> Checkpoint {
        Checkpoint {
            id: id.to_string(),
            session_id: session_id.to_string(),
            project_id: "project".to_string(),
            message_index: 0,
            timestamp: Utc::now(),
            parent_checkpoint_id: parent.map(str::to_string),
            description: Some(format!("checkpoint {}", id)),
            metadata: CheckpointMetadata::default(),
        }
    }

    fn live(path: &str, hash: &str) -> NewFileSnapshot {
        NewFileSnapshot {
            file_path: path.to_string(),
            content_hash: Some(hash.to_string()),
            change_type: FileChangeType::Added,
            is_deleted: false,
            permissions: Some(0o644),
            size: 3,
        }
    }

    #[tokio::test]
    async fn insert_moves_current_pointer() {
        let storage = CheckpointStorage::new(memory_pool().await);
        storage.insert_session(&session("s1")).await.unwrap();

        let ids = storage
            .insert_checkpoint(
                &checkpoint("s1", "c1", None),
                &[live("a.txt", "h1"), NewFileSnapshot::tombstone("b.txt".into())],
            )
            .await
            .unwrap();
        assert_eq!(ids.len(), 2);

        let record = storage.get_session("s1").await.unwrap().unwrap();
        assert_eq!(record.current_checkpoint_id.as_deref(), Some("c1"));

        let live_files = storage.live_snapshots("c1").await.unwrap();
        assert_eq!(live_files.len(), 1);
        assert_eq!(live_files[0].permissions, Some(0o644));
        assert_eq!(storage.get_file_snapshots("c1").await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn delete_reparents_and_returns_hashes() {
        let storage = CheckpointStorage::new(memory_pool().await);
        storage.insert_session(&session("s1")).await.unwrap();
        storage
            .insert_checkpoint(&checkpoint("s1", "c1", None), &[live("a", "h1")])
            .await
            .unwrap();
        storage
            .insert_checkpoint(&checkpoint("s1", "c2", Some("c1")), &[live("a", "h2")])
            .await
            .unwrap();
        storage
            .insert_checkpoint(&checkpoint("s1", "c3", Some("c2")), &[live("a", "h3")])
            .await
            .unwrap();

        let released = storage
            .delete_checkpoints(
                "s1",
                &["c2".to_string()],
                &[("c3".to_string(), Some("c1".to_string()))],
            )
            .await
            .unwrap();
        assert_eq!(released, vec!["h2".to_string()]);

        let remaining = storage.list_checkpoints("s1").await.unwrap();
        let ids: Vec<_> = remaining.iter().map(|c| c.id.as_str()).collect();
        assert_eq!(ids, vec!["c1", "c3"]);
        assert_eq!(remaining[1].parent_checkpoint_id.as_deref(), Some("c1"));
        assert!(storage.get_file_snapshots("c2").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn settings_persist() {
        let storage = CheckpointStorage::new(memory_pool().await);
        storage.insert_session(&session("s1")).await.unwrap();
        storage
            .update_settings("s1", false, CheckpointStrategy::PerToolUse)
            .await
            .unwrap();

        let record = storage.get_session("s1").await.unwrap().unwrap();
        assert!(!record.auto_checkpoint_enabled);
        assert_eq!(record.checkpoint_strategy, CheckpointStrategy::PerToolUse);
        assert!(storage.session_exists("s1").await.unwrap());
        assert!(!storage.session_exists("s2").await.unwrap());
    }
}
