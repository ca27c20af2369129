//! Checkpoint 服务层
//!
//! 对外暴露的命令入口。每个方法都先通过注册表拿到会话状态（必要时从数据库加载或新建），
//! 再在会话锁内调用 TimelineManager。

use std::sync::Arc;

use tracing::{debug, info, warn};

use crate::storage::{DatabaseManager, DatabaseOptions, StoragePaths};
use crate::utils::error::AppResult;

use super::blob_store::{BlobStoreStats, ContentStore};
use super::config::CheckpointConfig;
use super::error::{CheckpointError, CheckpointResult};
use super::models::{
    Checkpoint, CheckpointDiff, CheckpointOutcome, CheckpointSettings, CheckpointStateStats,
    CheckpointStrategy, FileDiff, SessionRecord, SessionTimeline,
};
use super::policy::AutoCheckpointPolicy;
use super::registry::{CheckpointManagerRegistry, SessionHandle};
use super::snapshot::SnapshotEngine;
use super::storage::CheckpointStorage;
use super::timeline::{CheckpointDraft, TimelineManager};

/// Checkpoint 服务
pub struct CheckpointService {
    database: Arc<DatabaseManager>,
    registry: CheckpointManagerRegistry,
    storage: Arc<CheckpointStorage>,
    engine: Arc<SnapshotEngine>,
    config: Arc<CheckpointConfig>,
}

impl CheckpointService {
    pub fn new(database: Arc<DatabaseManager>, config: CheckpointConfig) -> Self {
        let config = Arc::new(config);
        let pool = database.pool().clone();
        let paths = database.paths();

        let store = Arc::new(ContentStore::new(
            pool.clone(),
            paths.blobs_dir.clone(),
            config.clone(),
        ));
        // 存储目录位于工作区内时不能把自己快照进去
        let engine = Arc::new(SnapshotEngine::new(
            store,
            config.clone(),
            vec![paths.app_dir.clone()],
        ));

        Self {
            database,
            registry: CheckpointManagerRegistry::new(),
            storage: Arc::new(CheckpointStorage::new(pool)),
            engine,
            config,
        }
    }

    /// 准备存储目录、打开数据库并构建服务
    pub async fn open(
        paths: StoragePaths,
        options: DatabaseOptions,
        config: CheckpointConfig,
    ) -> AppResult<Self> {
        paths.validate()?;
        paths.ensure_directories()?;
        let database = DatabaseManager::open(paths, options).await?;
        Ok(Self::new(Arc::new(database), config))
    }

    pub fn database(&self) -> &Arc<DatabaseManager> {
        &self.database
    }

    pub fn config(&self) -> &CheckpointConfig {
        &self.config
    }

    pub fn content_store(&self) -> &Arc<ContentStore> {
        self.engine.store()
    }

    // ==================== 会话解析 ====================

    async fn session(
        &self,
        session_id: &str,
        project_id: &str,
        project_path: &str,
    ) -> CheckpointResult<Arc<SessionHandle>> {
        self.registry
            .get_or_try_insert_with(session_id, || async {
                let manager = self
                    .load_or_bootstrap(session_id, project_id, project_path)
                    .await?;
                let policy = self.policy_for(&manager);
                Ok(SessionHandle::new(manager, policy, self.config.lock_timeout))
            })
            .await
    }

    async fn load_or_bootstrap(
        &self,
        session_id: &str,
        project_id: &str,
        project_path: &str,
    ) -> CheckpointResult<TimelineManager> {
        if let Some(record) = self.storage.get_session(session_id).await? {
            debug!("Reloading persisted checkpoint session {}", session_id);
            return TimelineManager::load(
                record,
                self.storage.clone(),
                self.engine.clone(),
                self.config.clone(),
            )
            .await;
        }

        if project_path.trim().is_empty() {
            return Err(CheckpointError::session_not_found(session_id));
        }

        match tokio::fs::metadata(project_path).await {
            Ok(meta) if meta.is_dir() => {}
            Ok(_) => {
                return Err(CheckpointError::SessionBootstrapFailed {
                    session_id: session_id.to_string(),
                    reason: format!("{} is not a directory", project_path),
                })
            }
            Err(e) => {
                return Err(CheckpointError::SessionBootstrapFailed {
                    session_id: session_id.to_string(),
                    reason: format!("{}: {}", project_path, e),
                })
            }
        }

        let record = SessionRecord {
            session_id: session_id.to_string(),
            project_id: project_id.to_string(),
            project_path: project_path.to_string(),
            current_checkpoint_id: None,
            auto_checkpoint_enabled: true,
            checkpoint_strategy: CheckpointStrategy::default(),
            forked_from: None,
        };
        TimelineManager::bootstrap(
            record,
            self.storage.clone(),
            self.engine.clone(),
            self.config.clone(),
        )
        .await
    }

    /// 新建策略状态，计数从已有时间线接续
    fn policy_for(&self, manager: &TimelineManager) -> AutoCheckpointPolicy {
        let mut policy =
            AutoCheckpointPolicy::new(self.config.smart.clone(), self.config.max_tracked_messages);
        if let Some((message_index, total_tokens)) = manager.resume_point() {
            policy.resume_from(message_index, total_tokens);
        }
        policy
    }

    // ==================== 时间线操作 ====================

    pub async fn create_checkpoint(
        &self,
        session_id: &str,
        project_id: &str,
        project_path: &str,
        message_index: Option<i64>,
        description: Option<String>,
    ) -> CheckpointResult<CheckpointOutcome> {
        let handle = self.session(session_id, project_id, project_path).await?;

        let draft = {
            let policy = handle.policy();
            CheckpointDraft {
                message_index: message_index.unwrap_or(policy.message_count() as i64),
                user_prompt: policy
                    .last_prompt()
                    .map(str::to_string)
                    .or_else(|| description.clone())
                    .unwrap_or_default(),
                description,
                total_tokens: policy.total_tokens(),
                model_used: policy.model_used().map(str::to_string),
            }
        };

        let outcome = {
            let mut manager = handle.write().await?;
            manager.create_checkpoint(draft).await?
        };
        handle.policy().mark_checkpoint_created();

        Ok(outcome)
    }

    pub async fn restore_checkpoint(
        &self,
        checkpoint_id: &str,
        session_id: &str,
        project_id: &str,
        project_path: &str,
    ) -> CheckpointResult<CheckpointOutcome> {
        let handle = self.session(session_id, project_id, project_path).await?;
        let mut manager = handle.write().await?;
        manager.restore(checkpoint_id).await
    }

    pub async fn list_checkpoints(
        &self,
        session_id: &str,
        project_id: &str,
        project_path: &str,
    ) -> CheckpointResult<Vec<Checkpoint>> {
        let handle = self.session(session_id, project_id, project_path).await?;
        let manager = handle.read().await?;
        Ok(manager.list())
    }

    pub async fn fork_from_checkpoint(
        &self,
        checkpoint_id: &str,
        session_id: &str,
        project_id: &str,
        project_path: &str,
        new_session_id: &str,
        description: Option<String>,
    ) -> CheckpointResult<CheckpointOutcome> {
        if self.registry.contains(new_session_id) || self.storage.session_exists(new_session_id).await? {
            return Err(CheckpointError::SessionAlreadyExists(new_session_id.to_string()));
        }

        let handle = self.session(session_id, project_id, project_path).await?;
        let manager = handle.write().await?;

        let (forked, outcome) = match manager
            .fork_into(new_session_id, checkpoint_id, description)
            .await
        {
            Ok(result) => result,
            Err(CheckpointError::Database(e)) => {
                // 并发 fork 到同一个 ID 时主键冲突
                if self.storage.session_exists(new_session_id).await? {
                    return Err(CheckpointError::SessionAlreadyExists(
                        new_session_id.to_string(),
                    ));
                }
                return Err(CheckpointError::Database(e));
            }
            Err(e) => return Err(e),
        };
        drop(manager);

        let policy = self.policy_for(&forked);
        self.registry
            .insert_new(SessionHandle::new(forked, policy, self.config.lock_timeout))?;

        Ok(outcome)
    }

    pub async fn get_session_timeline(
        &self,
        session_id: &str,
        project_id: &str,
        project_path: &str,
    ) -> CheckpointResult<SessionTimeline> {
        let handle = self.session(session_id, project_id, project_path).await?;
        let manager = handle.read().await?;
        Ok(manager.timeline())
    }

    pub async fn update_checkpoint_settings(
        &self,
        session_id: &str,
        project_id: &str,
        project_path: &str,
        auto_checkpoint_enabled: bool,
        checkpoint_strategy: CheckpointStrategy,
    ) -> CheckpointResult<()> {
        let handle = self.session(session_id, project_id, project_path).await?;
        let mut manager = handle.write().await?;
        manager
            .update_settings(auto_checkpoint_enabled, checkpoint_strategy)
            .await
    }

    pub async fn get_checkpoint_settings(
        &self,
        session_id: &str,
        project_id: &str,
        project_path: &str,
    ) -> CheckpointResult<CheckpointSettings> {
        let handle = self.session(session_id, project_id, project_path).await?;
        let manager = handle.read().await?;
        Ok(manager.settings())
    }

    /// 比较两个 checkpoint；只查询已加载或已持久化的会话
    pub async fn get_checkpoint_diff(
        &self,
        from_checkpoint_id: &str,
        to_checkpoint_id: &str,
        session_id: &str,
        project_id: &str,
    ) -> CheckpointResult<CheckpointDiff> {
        let handle = self.session(session_id, project_id, "").await?;
        let manager = handle.read().await?;
        manager.diff(from_checkpoint_id, to_checkpoint_id).await
    }

    /// 单个文件的 unified diff
    pub async fn get_file_diff(
        &self,
        from_checkpoint_id: &str,
        to_checkpoint_id: &str,
        session_id: &str,
        project_id: &str,
        file_path: &str,
    ) -> CheckpointResult<FileDiff> {
        let handle = self.session(session_id, project_id, "").await?;
        let manager = handle.read().await?;
        manager
            .file_diff(from_checkpoint_id, to_checkpoint_id, file_path)
            .await
    }

    pub async fn get_checkpoint_file_content(
        &self,
        checkpoint_id: &str,
        session_id: &str,
        project_id: &str,
        file_path: &str,
    ) -> CheckpointResult<Option<Vec<u8>>> {
        let handle = self.session(session_id, project_id, "").await?;
        let manager = handle.read().await?;
        manager.file_content(checkpoint_id, file_path).await
    }

    pub async fn cleanup_old_checkpoints(
        &self,
        session_id: &str,
        project_id: &str,
        project_path: &str,
        keep_count: usize,
    ) -> CheckpointResult<usize> {
        let handle = self.session(session_id, project_id, project_path).await?;
        let mut manager = handle.write().await?;
        manager.cleanup(keep_count).await
    }

    // ==================== 自动 checkpoint ====================

    pub async fn track_checkpoint_message(
        &self,
        session_id: &str,
        project_id: &str,
        project_path: &str,
        message: &str,
    ) -> CheckpointResult<()> {
        let handle = self.session(session_id, project_id, project_path).await?;
        let kind = handle.policy().track(message);
        debug!("Tracked {:?} message for session {}", kind, session_id);
        Ok(())
    }

    pub async fn track_session_messages(
        &self,
        session_id: &str,
        project_id: &str,
        project_path: &str,
        messages: &[String],
    ) -> CheckpointResult<()> {
        let handle = self.session(session_id, project_id, project_path).await?;
        let mut policy = handle.policy();
        for message in messages {
            policy.track(message);
        }
        debug!(
            "Tracked {} messages for session {}",
            messages.len(),
            session_id
        );
        Ok(())
    }

    /// 判断是否应自动创建 checkpoint；只做判断，不会创建
    pub async fn check_auto_checkpoint(
        &self,
        session_id: &str,
        project_id: &str,
        project_path: &str,
        message: &str,
    ) -> CheckpointResult<bool> {
        let handle = self.session(session_id, project_id, project_path).await?;
        let (enabled, strategy) = {
            let manager = handle.read().await?;
            (manager.auto_checkpoint_enabled(), manager.checkpoint_strategy())
        };

        if !enabled {
            return Ok(false);
        }
        let decision = handle.policy().should_checkpoint(strategy, message);
        Ok(decision)
    }

    // ==================== 注册表 ====================

    /// 释放会话的内存状态，持久化数据保持不变
    pub fn clear_checkpoint_manager(&self, session_id: &str) {
        if self.registry.clear(session_id) {
            info!("Checkpoint manager cleared for session {}", session_id);
        }
    }

    pub fn get_checkpoint_state_stats(&self) -> CheckpointStateStats {
        self.registry.stats()
    }

    // ==================== 存储维护 ====================

    pub async fn blob_stats(&self) -> CheckpointResult<BlobStoreStats> {
        self.content_store().stats().await
    }

    pub async fn collect_garbage(&self) -> CheckpointResult<u64> {
        let removed = self.content_store().gc().await?;
        if removed == 0 {
            debug!("Blob GC found nothing to remove");
        }
        Ok(removed)
    }

    pub async fn shutdown(&self) {
        let stats = self.registry.stats();
        for session_id in &stats.active_sessions {
            self.registry.clear(session_id);
        }
        self.database.close().await;
        if stats.active_managers > 0 {
            warn!(
                "Checkpoint service shut down with {} active sessions",
                stats.active_managers
            );
        }
    }
}
