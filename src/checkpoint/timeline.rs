//! TimelineManager：单个会话的 checkpoint 时间线
//!
//! 持有会话的 checkpoint 树、当前指针和自动 checkpoint 设置，
//! 负责创建、恢复、差异、清理与 fork。调用方通过注册表中的会话锁串行化写操作。

use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use chrono::Utc;
use futures::stream::{self, StreamExt};
use tokio::fs;
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::config::CheckpointConfig;
use super::diff;
use super::error::{CheckpointError, CheckpointResult};
use super::models::{
    Checkpoint, CheckpointDiff, CheckpointMetadata, CheckpointOutcome, CheckpointSettings,
    CheckpointStrategy, FileChangeType, FileDiff, FileSnapshot, ForkOrigin, NewFileSnapshot,
    SessionRecord, SessionTimeline, SnapshotWarning,
};
use super::snapshot::{
    canonicalize_workspace, normalize_relative_path, prune_empty_dirs, ScannedFile, SnapshotEngine,
};
use super::storage::CheckpointStorage;
use super::tree::CheckpointTree;

/// 创建 checkpoint 时由调用方提供的元数据
#[derive(Debug, Clone, Default)]
pub struct CheckpointDraft {
    pub message_index: i64,
    pub description: Option<String>,
    pub total_tokens: i64,
    pub model_used: Option<String>,
    pub user_prompt: String,
}

pub struct TimelineManager {
    session_id: String,
    project_id: String,
    project_path: PathBuf,
    tree: CheckpointTree,
    current_checkpoint_id: Option<String>,
    auto_checkpoint_enabled: bool,
    checkpoint_strategy: CheckpointStrategy,
    forked_from: Option<ForkOrigin>,
    storage: Arc<CheckpointStorage>,
    engine: Arc<SnapshotEngine>,
    config: Arc<CheckpointConfig>,
}

impl TimelineManager {
    /// 从数据库重建已持久化的会话
    pub async fn load(
        record: SessionRecord,
        storage: Arc<CheckpointStorage>,
        engine: Arc<SnapshotEngine>,
        config: Arc<CheckpointConfig>,
    ) -> CheckpointResult<Self> {
        let checkpoints = storage.list_checkpoints(&record.session_id).await?;
        let snapshot_ids = storage.snapshot_ids_by_session(&record.session_id).await?;
        let tree = CheckpointTree::from_checkpoints(checkpoints, snapshot_ids)?;

        let mut current = record.current_checkpoint_id.clone();
        if let Some(id) = current.as_deref() {
            if !tree.contains(id) {
                warn!(
                    "Session {} points at missing checkpoint {}, falling back to latest",
                    record.session_id, id
                );
                current = tree.ids_in_order().last().cloned();
                storage
                    .set_current_checkpoint(&record.session_id, current.as_deref())
                    .await?;
            }
        }

        debug!(
            "Loaded session {} with {} checkpoints",
            record.session_id,
            tree.len()
        );

        Ok(Self {
            session_id: record.session_id,
            project_id: record.project_id,
            project_path: PathBuf::from(record.project_path),
            tree,
            current_checkpoint_id: current,
            auto_checkpoint_enabled: record.auto_checkpoint_enabled,
            checkpoint_strategy: record.checkpoint_strategy,
            forked_from: record.forked_from,
            storage,
            engine,
            config,
        })
    }

    /// 新建一个空会话并写入数据库
    pub async fn bootstrap(
        record: SessionRecord,
        storage: Arc<CheckpointStorage>,
        engine: Arc<SnapshotEngine>,
        config: Arc<CheckpointConfig>,
    ) -> CheckpointResult<Self> {
        storage.insert_session(&record).await?;
        info!(
            "Created checkpoint session {} for {}",
            record.session_id, record.project_path
        );

        Ok(Self {
            session_id: record.session_id,
            project_id: record.project_id,
            project_path: PathBuf::from(record.project_path),
            tree: CheckpointTree::new(),
            current_checkpoint_id: None,
            auto_checkpoint_enabled: record.auto_checkpoint_enabled,
            checkpoint_strategy: record.checkpoint_strategy,
            forked_from: None,
            storage,
            engine,
            config,
        })
    }

    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    pub fn project_id(&self) -> &str {
        &self.project_id
    }

    pub fn project_path(&self) -> &Path {
        &self.project_path
    }

    pub fn current_checkpoint_id(&self) -> Option<&str> {
        self.current_checkpoint_id.as_deref()
    }

    pub fn auto_checkpoint_enabled(&self) -> bool {
        self.auto_checkpoint_enabled
    }

    pub fn checkpoint_strategy(&self) -> CheckpointStrategy {
        self.checkpoint_strategy
    }

    pub fn forked_from(&self) -> Option<&ForkOrigin> {
        self.forked_from.as_ref()
    }

    pub fn len(&self) -> usize {
        self.tree.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tree.is_empty()
    }

    fn require(&self, checkpoint_id: &str) -> CheckpointResult<&Checkpoint> {
        self.tree
            .get(checkpoint_id)
            .ok_or_else(|| CheckpointError::checkpoint_not_found(&self.session_id, checkpoint_id))
    }

    /// 已有历史中最大的 message_index 与最新 checkpoint 的 token 累计
    pub fn resume_point(&self) -> Option<(i64, i64)> {
        let ids = self.tree.ids_in_order();
        let latest = ids.last().and_then(|id| self.tree.get(id))?;
        let message_index = ids
            .iter()
            .filter_map(|id| self.tree.get(id))
            .map(|c| c.message_index)
            .max()
            .unwrap_or(latest.message_index);
        Some((message_index, latest.metadata.total_tokens))
    }

    /// 对工作区做快照，并作为当前 checkpoint 的子节点追加到树上
    pub async fn create_checkpoint(&mut self, draft: CheckpointDraft) -> CheckpointResult<CheckpointOutcome> {
        // message_index 不得小于父节点
        let message_index = self
            .current_checkpoint_id
            .as_deref()
            .and_then(|id| self.tree.get(id))
            .map_or(draft.message_index, |parent| {
                draft.message_index.max(parent.message_index)
            });

        let previous = match self.current_checkpoint_id.as_deref() {
            Some(id) => self.storage.live_snapshots(id).await?,
            None => Vec::new(),
        };

        let build = self.engine.capture(&self.project_path, &previous).await?;

        let checkpoint = Checkpoint {
            id: Uuid::new_v4().to_string(),
            session_id: self.session_id.clone(),
            project_id: self.project_id.clone(),
            message_index,
            timestamp: Utc::now(),
            parent_checkpoint_id: self.current_checkpoint_id.clone(),
            description: draft.description,
            metadata: CheckpointMetadata {
                total_tokens: draft.total_tokens,
                model_used: draft.model_used,
                user_prompt: draft.user_prompt,
                file_changes_count: build.file_changes as i64,
                snapshot_size: build.total_size,
                fork_origin: None,
            },
        };

        let snapshot_ids = match self.storage.insert_checkpoint(&checkpoint, &build.entries).await {
            Ok(ids) => ids,
            Err(e) => {
                self.engine.release_all(&build.held_hashes()).await;
                return Err(e);
            }
        };

        self.tree.insert(checkpoint.clone(), snapshot_ids)?;
        self.current_checkpoint_id = Some(checkpoint.id.clone());

        info!(
            "Created checkpoint {} for session {} ({} files, {} changes, {} warnings)",
            checkpoint.id,
            self.session_id,
            build.files_processed,
            build.file_changes,
            build.warnings.len()
        );

        let max_checkpoints = self.config.max_checkpoints;
        if max_checkpoints > 0 && self.tree.len() > max_checkpoints {
            if let Err(e) = self.cleanup(max_checkpoints).await {
                warn!(
                    "Automatic cleanup for session {} failed: {}",
                    self.session_id, e
                );
            }
        }

        Ok(CheckpointOutcome {
            checkpoint,
            files_processed: build.files_processed,
            warnings: build.warnings,
        })
    }

    /// 将工作区恢复到指定 checkpoint 的状态
    pub async fn restore(&mut self, checkpoint_id: &str) -> CheckpointResult<CheckpointOutcome> {
        let checkpoint = self.require(checkpoint_id)?.clone();

        if self.current_checkpoint_id.as_deref() == Some(checkpoint_id) {
            debug!(
                "Checkpoint {} is already current for session {}",
                checkpoint_id, self.session_id
            );
            return Ok(CheckpointOutcome {
                checkpoint,
                files_processed: 0,
                warnings: Vec::new(),
            });
        }

        let root = canonicalize_workspace(&self.project_path).await?;
        let target = self.storage.live_snapshots(checkpoint_id).await?;
        let scan = self.engine.scan(&root).await?;
        let mut warnings = scan.warnings;

        let wanted: HashSet<&str> = target.iter().map(|s| s.file_path.as_str()).collect();
        let on_disk: HashMap<&str, &ScannedFile> = scan
            .files
            .iter()
            .map(|f| (f.relative.as_str(), f))
            .collect();

        for file in &scan.files {
            if wanted.contains(file.relative.as_str()) {
                continue;
            }
            match fs::remove_file(&file.absolute).await {
                Ok(_) => prune_empty_dirs(&root, &file.absolute).await,
                Err(e) => {
                    warn!("Failed to remove {} during restore: {}", file.relative, e);
                    warnings.push(SnapshotWarning {
                        path: file.relative.clone(),
                        reason: e.to_string(),
                    });
                }
            }
        }

        let concurrency = self.config.max_concurrent_files.max(1);
        let results: Vec<Option<SnapshotWarning>> = stream::iter(target.iter())
            .map(|snapshot| {
                let existing = on_disk.get(snapshot.file_path.as_str()).copied();
                self.restore_file(&root, snapshot, existing)
            })
            .buffer_unordered(concurrency)
            .collect()
            .await;
        warnings.extend(results.into_iter().flatten());

        self.storage
            .set_current_checkpoint(&self.session_id, Some(checkpoint_id))
            .await?;
        self.current_checkpoint_id = Some(checkpoint_id.to_string());

        info!(
            "Restored session {} to checkpoint {} ({} files, {} warnings)",
            self.session_id,
            checkpoint_id,
            target.len(),
            warnings.len()
        );

        Ok(CheckpointOutcome {
            checkpoint,
            files_processed: target.len(),
            warnings,
        })
    }

    /// 写回单个文件；内容与权限都一致时跳过
    async fn restore_file(
        &self,
        root: &Path,
        snapshot: &FileSnapshot,
        existing: Option<&ScannedFile>,
    ) -> Option<SnapshotWarning> {
        let hash = snapshot.content_hash.as_deref()?;
        let store = self.engine.store();

        if let Some(current) = existing {
            let same_mode = snapshot.permissions.is_none() || snapshot.permissions == current.permissions;
            if same_mode && current.size as i64 == snapshot.size {
                if let Ok(hashed) = store.hash_file(&current.absolute).await {
                    if hashed.hash == hash {
                        return None;
                    }
                }
            }
        }

        let dest = root.join(&snapshot.file_path);
        match store.restore_to(hash, &dest, snapshot.permissions).await {
            Ok(()) => None,
            Err(e) => {
                warn!("Failed to restore {}: {}", snapshot.file_path, e);
                Some(SnapshotWarning {
                    path: snapshot.file_path.clone(),
                    reason: e.to_string(),
                })
            }
        }
    }

    /// 按创建顺序返回全部 checkpoint
    pub fn list(&self) -> Vec<Checkpoint> {
        self.tree.list()
    }

    pub fn timeline(&self) -> SessionTimeline {
        SessionTimeline {
            session_id: self.session_id.clone(),
            root_node: self.tree.build_root(),
            current_checkpoint_id: self.current_checkpoint_id.clone(),
            auto_checkpoint_enabled: self.auto_checkpoint_enabled,
            checkpoint_strategy: self.checkpoint_strategy,
            total_checkpoints: self.tree.len(),
        }
    }

    pub fn settings(&self) -> CheckpointSettings {
        CheckpointSettings {
            auto_checkpoint_enabled: self.auto_checkpoint_enabled,
            checkpoint_strategy: self.checkpoint_strategy,
            total_checkpoints: self.tree.len(),
            current_checkpoint_id: self.current_checkpoint_id.clone(),
        }
    }

    pub async fn update_settings(
        &mut self,
        auto_checkpoint_enabled: bool,
        checkpoint_strategy: CheckpointStrategy,
    ) -> CheckpointResult<()> {
        self.storage
            .update_settings(&self.session_id, auto_checkpoint_enabled, checkpoint_strategy)
            .await?;
        self.auto_checkpoint_enabled = auto_checkpoint_enabled;
        self.checkpoint_strategy = checkpoint_strategy;

        debug!(
            "Session {} settings updated: auto={}, strategy={}",
            self.session_id, auto_checkpoint_enabled, checkpoint_strategy
        );
        Ok(())
    }

    /// 比较两个 checkpoint；行数即时计算，diff 文本留给 [`Self::file_diff`]
    pub async fn diff(&self, from_id: &str, to_id: &str) -> CheckpointResult<CheckpointDiff> {
        let from = self.require(from_id)?;
        let to = self.require(to_id)?;
        let token_delta = to.metadata.total_tokens - from.metadata.total_tokens;

        let from_files = self.storage.live_snapshots(from_id).await?;
        let to_files = self.storage.live_snapshots(to_id).await?;
        let delta = diff::partition(&from_files, &to_files);

        let store = self.engine.store();
        let mut modified_files = Vec::with_capacity(delta.modified.len());
        for (path, from_hash, to_hash) in delta.modified {
            let before = store.get(&from_hash).await?;
            let after = store.get(&to_hash).await?;
            let (additions, deletions) = diff::line_counts(&before, &after);
            modified_files.push(FileDiff {
                path,
                additions,
                deletions,
                diff_content: None,
            });
        }

        Ok(CheckpointDiff {
            from_checkpoint_id: from_id.to_string(),
            to_checkpoint_id: to_id.to_string(),
            modified_files,
            added_files: delta.added,
            deleted_files: delta.deleted,
            token_delta,
        })
    }

    /// 单个文件在两个 checkpoint 之间的 unified diff
    pub async fn file_diff(&self, from_id: &str, to_id: &str, path: &str) -> CheckpointResult<FileDiff> {
        self.require(from_id)?;
        self.require(to_id)?;

        let before = self.file_content(from_id, path).await?.unwrap_or_default();
        let after = self.file_content(to_id, path).await?.unwrap_or_default();
        let (additions, deletions) = diff::line_counts(&before, &after);
        let key = normalize_relative_path(path).unwrap_or_else(|| path.to_string());

        Ok(FileDiff {
            diff_content: Some(diff::unified_diff(&key, &before, &after)),
            path: key,
            additions,
            deletions,
        })
    }

    /// 文件在某个 checkpoint 时的内容；当时不存在则返回 None
    pub async fn file_content(&self, checkpoint_id: &str, path: &str) -> CheckpointResult<Option<Vec<u8>>> {
        self.require(checkpoint_id)?;
        let Some(key) = normalize_relative_path(path) else {
            return Ok(None);
        };

        let snapshot = self.storage.get_file_snapshot(checkpoint_id, &key).await?;
        match snapshot.and_then(|s| if s.is_deleted { None } else { s.content_hash }) {
            Some(hash) => Ok(Some(self.engine.store().get(&hash).await?)),
            None => Ok(None),
        }
    }

    /// 清理旧 checkpoint
    ///
    /// 保留最近的 `keep_count` 个以及当前 checkpoint 的全部祖先，
    /// 被删节点的子节点挂到最近的幸存祖先上。返回删除数量。
    pub async fn cleanup(&mut self, keep_count: usize) -> CheckpointResult<usize> {
        let protected: HashSet<String> = self
            .current_checkpoint_id
            .as_deref()
            .map(|id| self.tree.ancestors(id).into_iter().collect())
            .unwrap_or_default();

        let order = self.tree.ids_in_order();
        let recent_start = order.len().saturating_sub(keep_count);
        let doomed: HashSet<String> = order[..recent_start]
            .iter()
            .filter(|id| !protected.contains(*id))
            .cloned()
            .collect();

        if doomed.is_empty() {
            return Ok(0);
        }

        if let Some(root) = self.tree.root_id() {
            if doomed.contains(root) {
                return Err(CheckpointError::InvariantViolation(format!(
                    "cleanup of session {} would remove root {}",
                    self.session_id, root
                )));
            }
        }

        let plan = self.tree.plan_reparent(&doomed);
        let ordered: Vec<String> = order.iter().filter(|id| doomed.contains(*id)).cloned().collect();
        let released = self
            .storage
            .delete_checkpoints(&self.session_id, &ordered, &plan)
            .await?;
        self.tree.remove_and_reparent(&doomed, &plan)?;

        self.engine.release_all(&released).await;
        let swept = self.engine.store().gc().await?;

        info!(
            "Cleaned up {} checkpoints for session {} (released {} refs, swept {} blobs)",
            ordered.len(),
            self.session_id,
            released.len(),
            swept
        );
        Ok(ordered.len())
    }

    /// 以指定 checkpoint 为根创建一个独立的新会话
    pub async fn fork_into(
        &self,
        new_session_id: &str,
        checkpoint_id: &str,
        description: Option<String>,
    ) -> CheckpointResult<(TimelineManager, CheckpointOutcome)> {
        let source = self.require(checkpoint_id)?.clone();
        let files = self.storage.live_snapshots(checkpoint_id).await?;
        let store = self.engine.store();

        let mut retained = Vec::with_capacity(files.len());
        for file in &files {
            if let Some(hash) = &file.content_hash {
                if let Err(e) = store.retain(hash).await {
                    self.engine.release_all(&retained).await;
                    return Err(e);
                }
                retained.push(hash.clone());
            }
        }

        let origin = ForkOrigin {
            session_id: self.session_id.clone(),
            checkpoint_id: checkpoint_id.to_string(),
        };
        let root = Checkpoint {
            id: Uuid::new_v4().to_string(),
            session_id: new_session_id.to_string(),
            project_id: self.project_id.clone(),
            message_index: source.message_index,
            timestamp: Utc::now(),
            parent_checkpoint_id: None,
            description: description.or(source.description),
            metadata: CheckpointMetadata {
                fork_origin: Some(origin.clone()),
                ..source.metadata
            },
        };
        let entries: Vec<NewFileSnapshot> = files
            .iter()
            .map(|f| NewFileSnapshot {
                file_path: f.file_path.clone(),
                content_hash: f.content_hash.clone(),
                change_type: FileChangeType::Added,
                is_deleted: false,
                permissions: f.permissions,
                size: f.size,
            })
            .collect();
        let record = SessionRecord {
            session_id: new_session_id.to_string(),
            project_id: self.project_id.clone(),
            project_path: self.project_path.to_string_lossy().into_owned(),
            current_checkpoint_id: None,
            auto_checkpoint_enabled: self.auto_checkpoint_enabled,
            checkpoint_strategy: self.checkpoint_strategy,
            forked_from: Some(origin.clone()),
        };

        let snapshot_ids = match self.storage.insert_forked_session(&record, &root, &entries).await {
            Ok(ids) => ids,
            Err(e) => {
                self.engine.release_all(&retained).await;
                return Err(e);
            }
        };

        let mut tree = CheckpointTree::new();
        tree.insert(root.clone(), snapshot_ids)?;

        info!(
            "Forked session {} from {}@{} ({} files)",
            new_session_id,
            self.session_id,
            checkpoint_id,
            entries.len()
        );

        let forked = TimelineManager {
            session_id: record.session_id,
            project_id: record.project_id,
            project_path: self.project_path.clone(),
            tree,
            current_checkpoint_id: Some(root.id.clone()),
            auto_checkpoint_enabled: record.auto_checkpoint_enabled,
            checkpoint_strategy: record.checkpoint_strategy,
            forked_from: Some(origin),
            storage: self.storage.clone(),
            engine: self.engine.clone(),
            config: self.config.clone(),
        };

        Ok((
            forked,
            CheckpointOutcome {
                checkpoint: root,
                files_processed: entries.len(),
                warnings: Vec::new(),
            },
        ))
    }
}
