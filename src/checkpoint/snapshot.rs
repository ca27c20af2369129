//! SnapshotEngine：扫描工作区并生成全量文件快照
//!
//! 每个 checkpoint 都记录当时工作区中所有被跟踪文件的完整状态；
//! 内容未变化的文件只增加 blob 引用，不会重复存储。

use std::collections::{HashMap, HashSet};
use std::io;
use std::path::{Component, Path, PathBuf};
use std::sync::Arc;

use futures::stream::{self, StreamExt};
use ignore::WalkBuilder;
use tokio::fs;

use super::blob_store::ContentStore;
use super::config::{CheckpointConfig, IgnoreRules};
use super::error::{CheckpointError, CheckpointResult};
use super::models::{FileChangeType, FileSnapshot, NewFileSnapshot, SnapshotWarning};

/// 工作区中一个可被跟踪的文件
#[derive(Debug, Clone)]
pub struct ScannedFile {
    pub relative: String,
    pub absolute: PathBuf,
    pub size: u64,
    pub permissions: Option<u32>,
}

/// 一次工作区扫描的结果
#[derive(Debug, Default)]
pub struct WorkspaceScan {
    pub files: Vec<ScannedFile>,
    /// 存在于磁盘但因大小或读取错误被跳过的路径
    pub skipped: HashSet<String>,
    /// 无法遍历的目录（相对路径，空串表示整个工作区）
    pub skipped_dirs: Vec<String>,
    pub warnings: Vec<SnapshotWarning>,
}

impl WorkspaceScan {
    /// 路径本身或其所在目录在本次扫描中被跳过
    pub fn is_skipped(&self, relative: &str) -> bool {
        self.skipped.contains(relative)
            || self.skipped_dirs.iter().any(|dir| {
                dir.is_empty()
                    || relative == dir
                    || relative
                        .strip_prefix(dir.as_str())
                        .is_some_and(|rest| rest.starts_with('/'))
            })
    }
}

/// 待写入数据库的快照集合
#[derive(Debug, Default)]
pub struct SnapshotBuild {
    pub entries: Vec<NewFileSnapshot>,
    pub warnings: Vec<SnapshotWarning>,
    pub files_processed: usize,
    pub file_changes: usize,
    pub total_size: i64,
}

impl SnapshotBuild {
    /// 本次快照持有的 blob 引用（每个存活条目一个）
    pub fn held_hashes(&self) -> Vec<String> {
        self.entries
            .iter()
            .filter_map(|e| e.content_hash.clone())
            .collect()
    }
}

enum FileOutcome {
    Captured(NewFileSnapshot),
    CarriedForward(NewFileSnapshot, SnapshotWarning),
    Skipped(SnapshotWarning),
}

pub struct SnapshotEngine {
    store: Arc<ContentStore>,
    config: Arc<CheckpointConfig>,
    rules: IgnoreRules,
    excluded: Vec<PathBuf>,
}

impl SnapshotEngine {
    /// `excluded` 中的目录（通常是引擎自己的存储目录）永远不会被扫描
    pub fn new(store: Arc<ContentStore>, config: Arc<CheckpointConfig>, excluded: Vec<PathBuf>) -> Self {
        let rules = config.ignore_rules();
        let excluded = excluded
            .into_iter()
            .map(|p| std::fs::canonicalize(&p).unwrap_or(p))
            .collect();

        Self {
            store,
            config,
            rules,
            excluded,
        }
    }

    pub fn store(&self) -> &Arc<ContentStore> {
        &self.store
    }

    /// 列出工作区中所有可跟踪的文件
    pub async fn scan(&self, root: &Path) -> CheckpointResult<WorkspaceScan> {
        let root = canonicalize_workspace(root).await?;
        let rules = self.rules.clone();
        let excluded = self.excluded.clone();
        let respect_gitignore = self.config.respect_gitignore;
        let config = self.config.clone();

        tokio::task::spawn_blocking(move || {
            walk_workspace(&root, rules, excluded, respect_gitignore, &config)
        })
        .await?
    }

    /// 基于父 checkpoint 的存活文件生成新的全量快照
    pub async fn capture(
        &self,
        root: &Path,
        previous: &[FileSnapshot],
    ) -> CheckpointResult<SnapshotBuild> {
        let scan = self.scan(root).await?;
        self.capture_scan(scan, previous).await
    }

    /// 对已完成的扫描结果生成快照
    ///
    /// 父快照中存在、但本次被跳过的文件沿用原记录，只有确实消失的文件才记为删除。
    pub async fn capture_scan(
        &self,
        mut scan: WorkspaceScan,
        previous: &[FileSnapshot],
    ) -> CheckpointResult<SnapshotBuild> {
        let files = std::mem::take(&mut scan.files);
        let baseline: HashMap<&str, &FileSnapshot> = previous
            .iter()
            .filter(|s| !s.is_deleted && s.content_hash.is_some())
            .map(|s| (s.file_path.as_str(), s))
            .collect();

        let present: HashSet<String> = files.iter().map(|f| f.relative.clone()).collect();
        let concurrency = self.config.max_concurrent_files.max(1);

        let outcomes: Vec<CheckpointResult<FileOutcome>> = stream::iter(files)
            .map(|file| {
                let prior = baseline.get(file.relative.as_str()).copied();
                self.capture_file(file, prior)
            })
            .buffer_unordered(concurrency)
            .collect()
            .await;

        let mut build = SnapshotBuild {
            warnings: std::mem::take(&mut scan.warnings),
            ..SnapshotBuild::default()
        };
        let mut failure = None;

        for outcome in outcomes {
            match outcome {
                Ok(FileOutcome::Captured(entry)) => {
                    if entry.change_type.is_change() {
                        build.file_changes += 1;
                    }
                    build.entries.push(entry);
                }
                Ok(FileOutcome::CarriedForward(entry, warning)) => {
                    build.warnings.push(warning);
                    build.entries.push(entry);
                }
                Ok(FileOutcome::Skipped(warning)) => build.warnings.push(warning),
                Err(e) => {
                    if failure.is_none() {
                        failure = Some(e);
                    }
                }
            }
        }

        if let Some(err) = failure {
            self.release_all(&build.held_hashes()).await;
            return Err(err);
        }

        let mut missing: Vec<&FileSnapshot> = baseline
            .iter()
            .filter(|(path, _)| !present.contains(**path))
            .map(|(_, prior)| *prior)
            .collect();
        missing.sort_by(|a, b| a.file_path.cmp(&b.file_path));

        for prior in missing {
            if !scan.is_skipped(&prior.file_path) {
                build
                    .entries
                    .push(NewFileSnapshot::tombstone(prior.file_path.clone()));
                build.file_changes += 1;
                continue;
            }

            if let Some(hash) = prior.content_hash.as_deref() {
                if let Err(e) = self.store.retain(hash).await {
                    self.release_all(&build.held_hashes()).await;
                    return Err(e);
                }
            }
            tracing::debug!("Keeping previous snapshot of skipped {}", prior.file_path);
            build.entries.push(carried_entry(prior));
        }

        let live = build.entries.iter().filter(|e| !e.is_deleted);
        build.files_processed = live.clone().count();
        build.total_size = live.map(|e| e.size).sum();

        build.entries.sort_by(|a, b| a.file_path.cmp(&b.file_path));
        Ok(build)
    }

    /// 释放一组 blob 引用；失败只记录日志
    pub async fn release_all(&self, hashes: &[String]) {
        for hash in hashes {
            if let Err(e) = self.store.release(hash).await {
                tracing::warn!("Failed to release blob {}: {}", hash, e);
            }
        }
    }

    async fn capture_file(
        &self,
        file: ScannedFile,
        prior: Option<&FileSnapshot>,
    ) -> CheckpointResult<FileOutcome> {
        let previous_hash = prior.and_then(|p| p.content_hash.as_deref());

        if let (Some(prior), Some(previous_hash)) = (prior, previous_hash) {
            if prior.size == file.size as i64 {
                match self.store.hash_file(&file.absolute).await {
                    Ok(hashed) if hashed.hash == previous_hash => {
                        self.store.retain(previous_hash).await?;
                        return Ok(FileOutcome::Captured(NewFileSnapshot {
                            file_path: file.relative,
                            content_hash: Some(hashed.hash),
                            change_type: FileChangeType::Unchanged,
                            is_deleted: false,
                            permissions: file.permissions,
                            size: hashed.size as i64,
                        }));
                    }
                    Ok(_) => {}
                    Err(CheckpointError::Io { source, .. }) => {
                        return self.carry_forward(file, prior, source).await;
                    }
                    Err(e) => return Err(e),
                }
            }
        }

        match self.store.put_file(&file.absolute).await {
            Ok(stored) => {
                let change_type = match previous_hash {
                    Some(hash) if hash == stored.hash => FileChangeType::Unchanged,
                    Some(_) => FileChangeType::Modified,
                    None => FileChangeType::Added,
                };
                Ok(FileOutcome::Captured(NewFileSnapshot {
                    file_path: file.relative,
                    content_hash: Some(stored.hash),
                    change_type,
                    is_deleted: false,
                    permissions: file.permissions,
                    size: stored.size as i64,
                }))
            }
            Err(CheckpointError::Io { path, source }) if path == file.absolute => match prior {
                Some(prior) => self.carry_forward(file, prior, source).await,
                None => {
                    tracing::warn!("Skipping unreadable file {}: {}", file.relative, source);
                    Ok(FileOutcome::Skipped(SnapshotWarning {
                        path: file.relative,
                        reason: source.to_string(),
                    }))
                }
            },
            Err(e) => Err(e),
        }
    }

    /// 文件暂时不可读时沿用父 checkpoint 中的记录
    async fn carry_forward(
        &self,
        file: ScannedFile,
        prior: &FileSnapshot,
        source: io::Error,
    ) -> CheckpointResult<FileOutcome> {
        if let Some(hash) = prior.content_hash.as_deref() {
            self.store.retain(hash).await?;
        }

        tracing::warn!(
            "File {} unreadable, keeping previous snapshot: {}",
            file.relative,
            source
        );

        Ok(FileOutcome::CarriedForward(
            carried_entry(prior),
            SnapshotWarning {
                path: file.relative,
                reason: format!("unreadable, previous content kept: {}", source),
            },
        ))
    }
}

fn carried_entry(prior: &FileSnapshot) -> NewFileSnapshot {
    NewFileSnapshot {
        file_path: prior.file_path.clone(),
        content_hash: prior.content_hash.clone(),
        change_type: FileChangeType::Unchanged,
        is_deleted: false,
        permissions: prior.permissions,
        size: prior.size,
    }
}

fn walk_workspace(
    root: &Path,
    rules: IgnoreRules,
    excluded: Vec<PathBuf>,
    respect_gitignore: bool,
    config: &CheckpointConfig,
) -> CheckpointResult<WorkspaceScan> {
    let filter_root = root.to_path_buf();
    let walker = WalkBuilder::new(root)
        .hidden(false)
        .parents(respect_gitignore)
        .ignore(respect_gitignore)
        .git_ignore(respect_gitignore)
        .git_exclude(respect_gitignore)
        .git_global(false)
        .require_git(false)
        .follow_links(false)
        .filter_entry(move |entry| {
            if entry.depth() == 0 {
                return true;
            }
            let path = entry.path();
            if excluded.iter().any(|dir| path.starts_with(dir)) {
                return false;
            }
            let Ok(relative) = path.strip_prefix(&filter_root) else {
                return false;
            };
            let is_dir = entry.file_type().is_some_and(|t| t.is_dir());
            !rules.is_ignored(&path_to_unix_string(relative), is_dir)
        })
        .build();

    let mut scan = WorkspaceScan::default();

    for result in walker {
        let entry = match result {
            Ok(entry) => entry,
            Err(err) => {
                tracing::warn!("Workspace walk error: {}", err);
                let path = error_path(&err).map(|p| match p.strip_prefix(root) {
                    Ok(relative) => path_to_unix_string(relative),
                    Err(_) => p.display().to_string(),
                });
                // 无法定位的错误按整个工作区处理，宁可保留旧记录也不误记删除
                let relative = path.unwrap_or_default();
                scan.skipped_dirs.push(relative.clone());
                scan.warnings.push(SnapshotWarning {
                    path: relative,
                    reason: err.to_string(),
                });
                continue;
            }
        };

        if entry.depth() == 0 {
            continue;
        }

        let Some(file_type) = entry.file_type() else {
            continue;
        };
        if file_type.is_symlink() {
            tracing::debug!("Skipping symlink {}", entry.path().display());
            continue;
        }
        if !file_type.is_file() {
            continue;
        }

        let Ok(relative_path) = entry.path().strip_prefix(root) else {
            continue;
        };
        let relative = path_to_unix_string(relative_path);

        let metadata = match entry.metadata() {
            Ok(m) => m,
            Err(err) => {
                tracing::warn!("Cannot stat {}: {}", relative, err);
                scan.skipped.insert(relative.clone());
                scan.warnings.push(SnapshotWarning {
                    path: relative,
                    reason: err.to_string(),
                });
                continue;
            }
        };

        if config.is_file_too_large(metadata.len()) {
            tracing::warn!(
                "Skipping {} ({} bytes exceeds limit of {})",
                relative,
                metadata.len(),
                config.max_file_size
            );
            scan.skipped.insert(relative.clone());
            scan.warnings.push(SnapshotWarning {
                path: relative,
                reason: format!("file too large ({} bytes)", metadata.len()),
            });
            continue;
        }

        scan.files.push(ScannedFile {
            relative,
            absolute: entry.path().to_path_buf(),
            size: metadata.len(),
            permissions: file_mode(&metadata),
        });
    }

    scan.files.sort_by(|a, b| a.relative.cmp(&b.relative));
    Ok(scan)
}

fn error_path(err: &ignore::Error) -> Option<&Path> {
    match err {
        ignore::Error::WithPath { path, .. } => Some(path.as_path()),
        ignore::Error::WithDepth { err, .. } | ignore::Error::WithLineNumber { err, .. } => {
            error_path(err)
        }
        _ => None,
    }
}

#[cfg(unix)]
fn file_mode(metadata: &std::fs::Metadata) -> Option<u32> {
    use std::os::unix::fs::PermissionsExt;
    Some(metadata.permissions().mode() & 0o7777)
}

#[cfg(not(unix))]
fn file_mode(_metadata: &std::fs::Metadata) -> Option<u32> {
    None
}

// === 辅助函数 ===

pub(crate) async fn canonicalize_workspace(path: &Path) -> CheckpointResult<PathBuf> {
    let canonical = fs::canonicalize(path)
        .await
        .map_err(|e| CheckpointError::InvalidWorkspace(format!("{} ({})", path.display(), e)))?;

    let metadata = fs::metadata(&canonical).await.map_err(|e| {
        CheckpointError::InvalidWorkspace(format!("{} ({})", canonical.display(), e))
    })?;

    if !metadata.is_dir() {
        return Err(CheckpointError::InvalidWorkspace(format!(
            "{} is not a directory",
            canonical.display()
        )));
    }

    Ok(canonical)
}

/// 将调用方传入的相对路径规整为快照中的 key，拒绝逃出工作区的路径
pub(crate) fn normalize_relative_path(path: &str) -> Option<String> {
    let mut normalized = PathBuf::new();
    for component in Path::new(path).components() {
        match component {
            Component::CurDir => {}
            Component::ParentDir => {
                if !normalized.pop() {
                    return None;
                }
            }
            Component::Normal(part) => normalized.push(part),
            Component::RootDir | Component::Prefix(_) => return None,
        }
    }

    let key = path_to_unix_string(&normalized);
    (!key.is_empty()).then_some(key)
}

pub(crate) fn path_to_unix_string(path: &Path) -> String {
    path.components()
        .filter_map(|c| {
            let part = c.as_os_str();
            if part.is_empty() {
                None
            } else {
                Some(part.to_string_lossy().to_string())
            }
        })
        .collect::<Vec<_>>()
        .join("/")
}

/// 删除文件后向上清理空目录，直到工作区根目录
pub(crate) async fn prune_empty_dirs(root: &Path, removed_file: &Path) {
    let mut current = removed_file.parent();
    while let Some(dir) = current {
        if dir == root || !dir.starts_with(root) {
            break;
        }
        // 非空目录会返回错误，到此为止
        if fs::remove_dir(dir).await.is_err() {
            break;
        }
        current = dir.parent();
    }
}
