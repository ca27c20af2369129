//! ContentStore：内容寻址存储
//!
//! 使用 SHA-256 哈希作为内容标识符，实现跨 checkpoint、跨会话的去重存储。
//! 引用计数保存在 `checkpoint_blobs` 表中，内容经 zlib 压缩后按哈希分目录落盘。
//! 大文件全程流式处理，不会整体读入内存。
//!
//! 引用计数归零的 blob 不会立即删除，而是在 [`ContentStore::gc`] 中统一清理；
//! gc 持有写闸门，其余读写操作持有读闸门，因此清理不会与进行中的读取交错。

use std::fs::File;
use std::io::{self, BufReader, BufWriter, Read, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use chrono::Utc;
use flate2::read::ZlibDecoder;
use flate2::write::ZlibEncoder;
use flate2::Compression;
use sha2::{Digest, Sha256};
use sqlx::{Row, SqlitePool};
use tokio::sync::RwLock;
use uuid::Uuid;

use super::config::CheckpointConfig;
use super::error::{CheckpointError, CheckpointResult};

/// 写入成功的 blob
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoredBlob {
    pub hash: String,
    pub size: u64,
}

/// 内容寻址存储
pub struct ContentStore {
    pool: SqlitePool,
    root: PathBuf,
    config: Arc<CheckpointConfig>,
    gate: RwLock<()>,
}

impl ContentStore {
    pub fn new(pool: SqlitePool, root: PathBuf, config: Arc<CheckpointConfig>) -> Self {
        Self {
            pool,
            root,
            config,
            gate: RwLock::new(()),
        }
    }

    /// 计算内容的 SHA-256 哈希
    pub fn compute_hash(content: &[u8]) -> String {
        let mut hasher = Sha256::new();
        hasher.update(content);
        hex::encode(hasher.finalize())
    }

    /// 流式计算文件哈希，不写入存储
    pub async fn hash_file(&self, path: &Path) -> CheckpointResult<StoredBlob> {
        let path = path.to_path_buf();
        let buffer_size = self.config.stream_buffer_size.max(4096);

        blocking(move || {
            let file = File::open(&path).map_err(|e| CheckpointError::io(&path, e))?;
            let mut reader = BufReader::with_capacity(buffer_size, file);
            let mut hasher = Sha256::new();
            let mut buffer = vec![0u8; buffer_size];
            let mut size = 0u64;

            loop {
                let read = reader
                    .read(&mut buffer)
                    .map_err(|e| CheckpointError::io(&path, e))?;
                if read == 0 {
                    break;
                }
                hasher.update(&buffer[..read]);
                size += read as u64;
            }

            Ok(StoredBlob {
                hash: hex::encode(hasher.finalize()),
                size,
            })
        })
        .await
    }

    /// 存储内容，返回 SHA-256 哈希
    /// 如果内容已存在，增加引用计数
    pub async fn put(&self, content: &[u8]) -> CheckpointResult<String> {
        let hash = Self::compute_hash(content);
        let _guard = self.gate.read().await;

        let blob_path = self.blob_path(&hash);
        if !blob_path.exists() {
            let temp_path = self.temp_path();
            let bytes = content.to_vec();
            let temp = temp_path.clone();
            blocking(move || {
                let mut encoder = ZlibEncoder::new(create_file(&temp)?, Compression::fast());
                encoder
                    .write_all(&bytes)
                    .and_then(|_| encoder.finish().map(|_| ()))
                    .map_err(|e| CheckpointError::io(&temp, e))
            })
            .await?;
            self.commit_temp(&temp_path, &blob_path).await?;
        }

        self.upsert_ref(&hash, content.len() as u64, &blob_path).await?;
        Ok(hash)
    }

    /// 流式存储文件内容
    ///
    /// 读取、哈希与压缩在同一遍中完成；返回的哈希对应实际写入的字节，
    /// 即便文件在此期间被修改也保持一致。
    pub async fn put_file(&self, path: &Path) -> CheckpointResult<StoredBlob> {
        let source = path.to_path_buf();
        let temp_path = self.temp_path();
        let temp = temp_path.clone();
        let buffer_size = self.config.stream_buffer_size.max(4096);

        let stored = blocking(move || {
            let file = File::open(&source).map_err(|e| CheckpointError::io(&source, e))?;
            let mut reader = BufReader::with_capacity(buffer_size, file);
            let mut encoder = ZlibEncoder::new(create_file(&temp)?, Compression::fast());
            let mut hasher = Sha256::new();
            let mut buffer = vec![0u8; buffer_size];
            let mut size = 0u64;

            loop {
                let read = match reader.read(&mut buffer) {
                    Ok(0) => break,
                    Ok(n) => n,
                    Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                    Err(e) => {
                        let _ = std::fs::remove_file(&temp);
                        return Err(CheckpointError::io(&source, e));
                    }
                };
                hasher.update(&buffer[..read]);
                if let Err(e) = encoder.write_all(&buffer[..read]) {
                    let _ = std::fs::remove_file(&temp);
                    return Err(CheckpointError::io(&temp, e));
                }
                size += read as u64;
            }

            encoder
                .finish()
                .map_err(|e| CheckpointError::io(&temp, e))?;

            Ok(StoredBlob {
                hash: hex::encode(hasher.finalize()),
                size,
            })
        })
        .await?;

        let _guard = self.gate.read().await;
        let blob_path = self.blob_path(&stored.hash);
        if blob_path.exists() {
            let _ = tokio::fs::remove_file(&temp_path).await;
        } else {
            self.commit_temp(&temp_path, &blob_path).await?;
        }

        self.upsert_ref(&stored.hash, stored.size, &blob_path).await?;

        tracing::debug!(
            "ContentStore: stored file {} as {} ({} bytes)",
            path.display(),
            stored.hash,
            stored.size
        );
        Ok(stored)
    }

    /// 为已存在的 blob 增加引用（内容未变化时的去重路径）
    pub async fn retain(&self, hash: &str) -> CheckpointResult<()> {
        let _guard = self.gate.read().await;
        let result = sqlx::query("UPDATE checkpoint_blobs SET ref_count = ref_count + 1 WHERE hash = ?")
            .bind(hash)
            .execute(&self.pool)
            .await?;

        if result.rows_affected() == 0 {
            return Err(CheckpointError::BlobNotFound(hash.to_string()));
        }
        Ok(())
    }

    /// 减少引用计数；归零的 blob 等待下一次 gc
    pub async fn release(&self, hash: &str) -> CheckpointResult<()> {
        let _guard = self.gate.read().await;
        sqlx::query(
            r#"
            UPDATE checkpoint_blobs
            SET ref_count = ref_count - 1
            WHERE hash = ? AND ref_count > 0
            "#,
        )
        .bind(hash)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    /// 根据哈希获取完整内容
    pub async fn get(&self, hash: &str) -> CheckpointResult<Vec<u8>> {
        let _guard = self.gate.read().await;
        if !self.exists(hash).await? {
            return Err(CheckpointError::BlobNotFound(hash.to_string()));
        }

        let blob_path = self.blob_path(hash);
        let missing = hash.to_string();
        blocking(move || {
            let file = match File::open(&blob_path) {
                Ok(f) => f,
                Err(e) if e.kind() == io::ErrorKind::NotFound => {
                    return Err(CheckpointError::BlobNotFound(missing));
                }
                Err(e) => return Err(CheckpointError::io(&blob_path, e)),
            };
            let mut content = Vec::new();
            ZlibDecoder::new(BufReader::new(file))
                .read_to_end(&mut content)
                .map_err(|e| CheckpointError::io(&blob_path, e))?;
            Ok(content)
        })
        .await
    }

    /// 将 blob 内容流式写回到目标路径
    ///
    /// 先写入同目录下的临时文件再重命名，避免目标文件出现半写状态。
    pub async fn restore_to(
        &self,
        hash: &str,
        dest: &Path,
        permissions: Option<u32>,
    ) -> CheckpointResult<()> {
        let _guard = self.gate.read().await;
        let blob_path = self.blob_path(hash);
        let dest = dest.to_path_buf();
        let missing = hash.to_string();

        blocking(move || {
            let blob = match File::open(&blob_path) {
                Ok(f) => f,
                Err(e) if e.kind() == io::ErrorKind::NotFound => {
                    return Err(CheckpointError::BlobNotFound(missing));
                }
                Err(e) => return Err(CheckpointError::io(&blob_path, e)),
            };

            let parent = dest
                .parent()
                .ok_or_else(|| CheckpointError::InvalidWorkspace(dest.display().to_string()))?;
            std::fs::create_dir_all(parent).map_err(|e| CheckpointError::io(parent, e))?;

            let file_name = dest
                .file_name()
                .map(|n| n.to_string_lossy().into_owned())
                .unwrap_or_default();
            let temp = parent.join(format!(".{}.{}.restore", file_name, Uuid::new_v4().simple()));

            let written = (|| -> io::Result<()> {
                let mut decoder = ZlibDecoder::new(BufReader::new(blob));
                let mut writer = BufWriter::new(File::create(&temp)?);
                io::copy(&mut decoder, &mut writer)?;
                writer.flush()?;
                writer.get_ref().sync_all()?;
                apply_permissions(&temp, permissions)?;
                std::fs::rename(&temp, &dest)
            })();

            if let Err(e) = written {
                let _ = std::fs::remove_file(&temp);
                return Err(CheckpointError::io(&dest, e));
            }
            Ok(())
        })
        .await
    }

    /// 检查哈希是否存在
    pub async fn exists(&self, hash: &str) -> CheckpointResult<bool> {
        let row = sqlx::query("SELECT 1 FROM checkpoint_blobs WHERE hash = ?")
            .bind(hash)
            .fetch_optional(&self.pool)
            .await?;

        Ok(row.is_some())
    }

    /// 当前引用计数，未知哈希返回 None
    pub async fn ref_count(&self, hash: &str) -> CheckpointResult<Option<i64>> {
        let row = sqlx::query("SELECT ref_count FROM checkpoint_blobs WHERE hash = ?")
            .bind(hash)
            .fetch_optional(&self.pool)
            .await?;

        Ok(row.map(|r| r.get("ref_count")))
    }

    /// 垃圾回收：清理引用计数为 0 的 blob
    pub async fn gc(&self) -> CheckpointResult<u64> {
        let _guard = self.gate.write().await;

        let mut tx = self.pool.begin().await?;
        let rows = sqlx::query("SELECT hash FROM checkpoint_blobs WHERE ref_count <= 0")
            .fetch_all(&mut *tx)
            .await?;
        sqlx::query("DELETE FROM checkpoint_blobs WHERE ref_count <= 0")
            .execute(&mut *tx)
            .await?;
        tx.commit().await?;

        let mut deleted = 0u64;
        for row in rows {
            let hash: String = row.get("hash");
            match tokio::fs::remove_file(self.blob_path(&hash)).await {
                Ok(_) => {}
                Err(e) if e.kind() == io::ErrorKind::NotFound => {}
                Err(e) => {
                    tracing::warn!("ContentStore GC: failed to remove blob {}: {}", hash, e);
                }
            }
            deleted += 1;
        }

        if deleted > 0 {
            tracing::info!("ContentStore GC: deleted {} orphaned blobs", deleted);
        }
        Ok(deleted)
    }

    /// 获取存储统计信息
    pub async fn stats(&self) -> CheckpointResult<BlobStoreStats> {
        let row = sqlx::query(
            r#"
            SELECT
                COUNT(*) as blob_count,
                COALESCE(SUM(size), 0) as total_size,
                COALESCE(SUM(stored_size), 0) as stored_size,
                COALESCE(SUM(ref_count), 0) as total_refs,
                COUNT(CASE WHEN ref_count <= 0 THEN 1 END) as orphaned_count
            FROM checkpoint_blobs
            "#,
        )
        .fetch_one(&self.pool)
        .await?;

        Ok(BlobStoreStats {
            blob_count: row.get("blob_count"),
            total_size: row.get("total_size"),
            stored_size: row.get("stored_size"),
            total_refs: row.get("total_refs"),
            orphaned_count: row.get("orphaned_count"),
        })
    }

    fn blob_path(&self, hash: &str) -> PathBuf {
        if hash.len() > 2 {
            self.root.join(&hash[..2]).join(&hash[2..])
        } else {
            self.root.join(hash)
        }
    }

    fn temp_path(&self) -> PathBuf {
        self.root
            .join("tmp")
            .join(format!("{}.partial", Uuid::new_v4().simple()))
    }

    async fn commit_temp(&self, temp: &Path, blob_path: &Path) -> CheckpointResult<()> {
        if let Some(parent) = blob_path.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|e| CheckpointError::io(parent, e))?;
        }
        tokio::fs::rename(temp, blob_path)
            .await
            .map_err(|e| CheckpointError::io(blob_path, e))
    }

    async fn upsert_ref(&self, hash: &str, size: u64, blob_path: &Path) -> CheckpointResult<()> {
        let stored_size = tokio::fs::metadata(blob_path)
            .await
            .map(|m| m.len() as i64)
            .unwrap_or_default();

        sqlx::query(
            r#"
            INSERT INTO checkpoint_blobs (hash, size, stored_size, ref_count, created_at)
            VALUES (?, ?, ?, 1, ?)
            ON CONFLICT(hash) DO UPDATE SET ref_count = ref_count + 1
            "#,
        )
        .bind(hash)
        .bind(size as i64)
        .bind(stored_size)
        .bind(Utc::now().timestamp_millis())
        .execute(&self.pool)
        .await?;

        Ok(())
    }
}

/// ContentStore 统计信息
#[derive(Debug, Clone)]
pub struct BlobStoreStats {
    pub blob_count: i64,
    pub total_size: i64,
    pub stored_size: i64,
    pub total_refs: i64,
    pub orphaned_count: i64,
}

/// 在阻塞线程池中执行文件 IO
async fn blocking<T, F>(f: F) -> CheckpointResult<T>
where
    T: Send + 'static,
    F: FnOnce() -> CheckpointResult<T> + Send + 'static,
{
    tokio::task::spawn_blocking(f).await?
}

fn create_file(path: &Path) -> CheckpointResult<BufWriter<File>> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent).map_err(|e| CheckpointError::io(parent, e))?;
    }
    File::create(path)
        .map(BufWriter::new)
        .map_err(|e| CheckpointError::io(path, e))
}

#[cfg(unix)]
fn apply_permissions(path: &Path, permissions: Option<u32>) -> io::Result<()> {
    use std::os::unix::fs::PermissionsExt;
    if let Some(mode) = permissions {
        std::fs::set_permissions(path, std::fs::Permissions::from_mode(mode))?;
    }
    Ok(())
}

#[cfg(not(unix))]
fn apply_permissions(_path: &Path, _permissions: Option<u32>) -> io::Result<()> {
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::checkpoint::test_support::memory_pool;
    use tempfile::TempDir;

    async fn setup_store() -> (TempDir, ContentStore) {
        let temp_dir = TempDir::new().unwrap();
        let store = ContentStore::new(
            memory_pool().await,
            temp_dir.path().join("blobs"),
            Arc::new(CheckpointConfig::default()),
        );
        (temp_dir, store)
    }

    #[tokio::test]
    async fn test_store_and_get() {
        let (_dir, store) = setup_store().await;

        let content = b"Hello, World!";
        let hash = store.put(content).await.unwrap();

        let retrieved = store.get(&hash).await.unwrap();
        assert_eq!(content, retrieved.as_slice());
        assert_eq!(hash, ContentStore::compute_hash(content));
    }

    #[tokio::test]
    async fn test_deduplication() {
        let (_dir, store) = setup_store().await;

        let content = b"Hello, World!";
        let hash1 = store.put(content).await.unwrap();
        let hash2 = store.put(content).await.unwrap();

        assert_eq!(hash1, hash2);

        let stats = store.stats().await.unwrap();
        assert_eq!(stats.blob_count, 1);
        assert_eq!(stats.total_refs, 2);
    }

    #[tokio::test]
    async fn put_file_streams_large_content() {
        let (dir, store) = setup_store().await;
        let source = dir.path().join("large.bin");
        // 大于缓冲区若干倍，确保经过多次分块
        let content: Vec<u8> = (0..(512 * 1024u32)).map(|i| (i % 251) as u8).collect();
        std::fs::write(&source, &content).unwrap();

        let stored = store.put_file(&source).await.unwrap();
        assert_eq!(stored.size, content.len() as u64);
        assert_eq!(stored.hash, ContentStore::compute_hash(&content));
        assert_eq!(store.hash_file(&source).await.unwrap(), stored);

        let restored = dir.path().join("out").join("large.bin");
        store.restore_to(&stored.hash, &restored, None).await.unwrap();
        assert_eq!(std::fs::read(&restored).unwrap(), content);
    }

    #[tokio::test]
    async fn get_unknown_hash_is_not_found() {
        let (_dir, store) = setup_store().await;
        let result = store.get("deadbeef").await;
        assert!(matches!(result, Err(CheckpointError::BlobNotFound(_))));
        assert!(matches!(
            store.retain("deadbeef").await,
            Err(CheckpointError::BlobNotFound(_))
        ));
    }

    #[tokio::test]
    async fn release_is_lazy_until_gc() {
        let (_dir, store) = setup_store().await;
        let hash = store.put(b"short lived").await.unwrap();

        store.release(&hash).await.unwrap();
        assert_eq!(store.ref_count(&hash).await.unwrap(), Some(0));
        // 释放后在 gc 之前仍然可读
        assert_eq!(store.get(&hash).await.unwrap(), b"short lived");

        assert_eq!(store.gc().await.unwrap(), 1);
        assert!(!store.exists(&hash).await.unwrap());
        assert!(!store.blob_path(&hash).exists());
    }

    #[tokio::test]
    async fn retain_keeps_blob_alive_through_gc() {
        let (_dir, store) = setup_store().await;
        let hash = store.put(b"shared").await.unwrap();
        store.retain(&hash).await.unwrap();
        store.release(&hash).await.unwrap();

        assert_eq!(store.gc().await.unwrap(), 0);
        assert_eq!(store.ref_count(&hash).await.unwrap(), Some(1));
    }
}
