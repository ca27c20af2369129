//! CheckpointManagerRegistry：session_id → 会话状态
//!
//! 每个会话拥有独立的读写锁，不同会话之间互不阻塞。
//! 注册表只管理内存状态，`clear` 不会触碰已持久化的数据。

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use parking_lot::{Mutex, MutexGuard};
use tokio::sync::{RwLock, RwLockReadGuard, RwLockWriteGuard};

use super::error::{CheckpointError, CheckpointResult};
use super::models::CheckpointStateStats;
use super::policy::AutoCheckpointPolicy;
use super::timeline::TimelineManager;

/// 单个会话的运行时状态
pub struct SessionHandle {
    session_id: String,
    timeline: RwLock<TimelineManager>,
    policy: Mutex<AutoCheckpointPolicy>,
    lock_timeout: Duration,
}

impl SessionHandle {
    pub fn new(manager: TimelineManager, policy: AutoCheckpointPolicy, lock_timeout: Duration) -> Self {
        Self {
            session_id: manager.session_id().to_string(),
            timeline: RwLock::new(manager),
            policy: Mutex::new(policy),
            lock_timeout,
        }
    }

    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    /// 共享锁，只读操作使用
    pub async fn read(&self) -> CheckpointResult<RwLockReadGuard<'_, TimelineManager>> {
        tokio::time::timeout(self.lock_timeout, self.timeline.read())
            .await
            .map_err(|_| self.timed_out())
    }

    /// 独占锁，所有修改操作使用
    pub async fn write(&self) -> CheckpointResult<RwLockWriteGuard<'_, TimelineManager>> {
        tokio::time::timeout(self.lock_timeout, self.timeline.write())
            .await
            .map_err(|_| self.timed_out())
    }

    /// 策略只做内存记账，持有时间极短
    pub fn policy(&self) -> MutexGuard<'_, AutoCheckpointPolicy> {
        self.policy.lock()
    }

    fn timed_out(&self) -> CheckpointError {
        tracing::warn!(
            "Timed out after {:?} waiting for session {} lock",
            self.lock_timeout,
            self.session_id
        );
        CheckpointError::ConcurrencyTimeout {
            session_id: self.session_id.clone(),
            waited: self.lock_timeout,
        }
    }
}

#[derive(Default)]
pub struct CheckpointManagerRegistry {
    sessions: DashMap<String, Arc<SessionHandle>>,
    /// 串行化冷启动，避免同一会话被并发初始化两次
    bootstrap: tokio::sync::Mutex<()>,
}

impl CheckpointManagerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, session_id: &str) -> Option<Arc<SessionHandle>> {
        self.sessions.get(session_id).map(|entry| entry.value().clone())
    }

    pub fn contains(&self, session_id: &str) -> bool {
        self.sessions.contains_key(session_id)
    }

    /// 获取会话状态，不存在时用 `init` 构造
    ///
    /// `init` 失败时不会注册任何内容。
    pub async fn get_or_try_insert_with<F, Fut>(
        &self,
        session_id: &str,
        init: F,
    ) -> CheckpointResult<Arc<SessionHandle>>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = CheckpointResult<SessionHandle>>,
    {
        if let Some(handle) = self.get(session_id) {
            return Ok(handle);
        }

        let _guard = self.bootstrap.lock().await;
        if let Some(handle) = self.get(session_id) {
            return Ok(handle);
        }

        let handle = Arc::new(init().await?);
        let registered = match self.sessions.entry(session_id.to_string()) {
            Entry::Occupied(existing) => existing.get().clone(),
            Entry::Vacant(slot) => slot.insert(handle).clone(),
        };

        tracing::debug!("Registered checkpoint session {}", session_id);
        Ok(registered)
    }

    /// 注册一个全新的会话；已存在时返回 `SessionAlreadyExists`
    pub fn insert_new(&self, handle: SessionHandle) -> CheckpointResult<Arc<SessionHandle>> {
        match self.sessions.entry(handle.session_id.clone()) {
            Entry::Occupied(existing) => Err(CheckpointError::SessionAlreadyExists(
                existing.key().clone(),
            )),
            Entry::Vacant(slot) => Ok(slot.insert(Arc::new(handle)).clone()),
        }
    }

    /// 释放会话的内存状态；未知会话直接忽略
    pub fn clear(&self, session_id: &str) -> bool {
        let removed = self.sessions.remove(session_id).is_some();
        if removed {
            tracing::debug!("Cleared checkpoint session {}", session_id);
        }
        removed
    }

    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }

    pub fn stats(&self) -> CheckpointStateStats {
        let mut active_sessions: Vec<String> =
            self.sessions.iter().map(|entry| entry.key().clone()).collect();
        active_sessions.sort();

        CheckpointStateStats {
            active_managers: active_sessions.len(),
            active_sessions,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::checkpoint::blob_store::ContentStore;
    use crate::checkpoint::config::{CheckpointConfig, SmartStrategyConfig};
    use crate::checkpoint::models::{CheckpointStrategy, SessionRecord};
    use crate::checkpoint::snapshot::SnapshotEngine;
    use crate::checkpoint::storage::CheckpointStorage;
    use crate::checkpoint::test_support::memory_pool;
    use sqlx::SqlitePool;
    use tempfile::TempDir;

    async fn handle(pool: &SqlitePool, dir: &TempDir, session_id: &str, timeout: Duration) -> SessionHandle {
        let config = Arc::new(CheckpointConfig::default());
        let store = Arc::new(ContentStore::new(
            pool.clone(),
            dir.path().join("blobs"),
            config.clone(),
        ));
        let engine = Arc::new(SnapshotEngine::new(store, config.clone(), vec![]));
        let storage = Arc::new(CheckpointStorage::new(pool.clone()));
        let record = SessionRecord {
            session_id: session_id.to_string(),
            project_id: "p".into(),
            project_path: dir.path().to_string_lossy().into_owned(),
            current_checkpoint_id: None,
            auto_checkpoint_enabled: true,
            checkpoint_strategy: CheckpointStrategy::Smart,
            forked_from: None,
        };
        let manager = TimelineManager::bootstrap(record, storage, engine, config)
            .await
            .unwrap();
        SessionHandle::new(
            manager,
            AutoCheckpointPolicy::new(SmartStrategyConfig::default(), 10),
            timeout,
        )
    }

    #[tokio::test]
    async fn init_runs_once_per_session() {
        let pool = memory_pool().await;
        let dir = TempDir::new().unwrap();
        let registry = CheckpointManagerRegistry::new();

        let first = registry
            .get_or_try_insert_with("s1", || async {
                Ok(handle(&pool, &dir, "s1", Duration::from_secs(1)).await)
            })
            .await
            .unwrap();
        let second = registry
            .get_or_try_insert_with("s1", || async {
                Err(CheckpointError::InvariantViolation("initialized twice".into()))
            })
            .await
            .unwrap();

        assert!(Arc::ptr_eq(&first, &second));
        assert_eq!(registry.stats().active_sessions, vec!["s1".to_string()]);
    }

    #[tokio::test]
    async fn failed_init_registers_nothing() {
        let registry = CheckpointManagerRegistry::new();
        let result = registry
            .get_or_try_insert_with("s1", || async {
                Err(CheckpointError::session_not_found("s1"))
            })
            .await;

        assert!(matches!(result, Err(CheckpointError::SessionNotFound { .. })));
        assert!(registry.is_empty());
    }

    #[tokio::test]
    async fn insert_new_rejects_duplicates_and_clear_is_idempotent() {
        let pool = memory_pool().await;
        let dir = TempDir::new().unwrap();
        let registry = CheckpointManagerRegistry::new();

        registry
            .insert_new(handle(&pool, &dir, "s1", Duration::from_secs(1)).await)
            .unwrap();
        // 另一个数据库中的同名会话
        let other_pool = memory_pool().await;
        let duplicate = handle(&other_pool, &dir, "s1", Duration::from_secs(1)).await;
        assert!(matches!(
            registry.insert_new(duplicate),
            Err(CheckpointError::SessionAlreadyExists(_))
        ));

        assert!(registry.clear("s1"));
        assert!(!registry.clear("s1"));
        assert!(!registry.clear("unknown"));
    }

    #[tokio::test]
    async fn write_lock_times_out() {
        let pool = memory_pool().await;
        let dir = TempDir::new().unwrap();
        let handle = handle(&pool, &dir, "s1", Duration::from_millis(20)).await;

        let _held = handle.write().await.unwrap();
        let err = handle.write().await.err().expect("second write should fail");
        assert!(matches!(err, CheckpointError::ConcurrencyTimeout { .. }));
        assert!(err.is_retryable());
    }
}
