/*!
 * 存储路径管理模块
 *
 * 统一解析数据库文件与 blob 目录的位置
 */

use crate::storage::error::{StoragePathsError, StoragePathsResult};
use std::fs;
use std::path::{Path, PathBuf};

/// 存储路径管理器
#[derive(Debug, Clone)]
pub struct StoragePaths {
    /// 应用根目录
    pub app_dir: PathBuf,
    /// 数据目录（数据库文件所在位置）
    pub data_dir: PathBuf,
    /// 内容寻址 blob 目录
    pub blobs_dir: PathBuf,
}

impl StoragePaths {
    /// 创建新的路径管理器
    pub fn new(app_dir: PathBuf) -> StoragePathsResult<Self> {
        StoragePathsBuilder::new().app_dir(app_dir).build()
    }

    /// 获取数据库文件路径
    pub fn database_file(&self) -> PathBuf {
        self.data_dir.join(super::DATABASE_FILE_NAME)
    }

    /// 确保所有目录存在
    pub fn ensure_directories(&self) -> StoragePathsResult<()> {
        for dir in [&self.app_dir, &self.data_dir, &self.blobs_dir] {
            if !dir.exists() {
                fs::create_dir_all(dir)
                    .map_err(|e| StoragePathsError::directory_create(dir.to_path_buf(), e))?;
            }
        }
        Ok(())
    }

    /// 验证路径的有效性
    pub fn validate(&self) -> StoragePathsResult<()> {
        if !self.app_dir.exists() {
            fs::create_dir_all(&self.app_dir)
                .map_err(|e| StoragePathsError::directory_create(self.app_dir.clone(), e))?;
        }

        if let Err(e) = fs::metadata(&self.app_dir) {
            return Err(StoragePathsError::directory_access(self.app_dir.clone(), e));
        }

        Ok(())
    }

    /// 判断给定路径是否位于存储目录内（快照时需要排除）
    pub fn contains(&self, path: &Path) -> bool {
        path.starts_with(&self.app_dir)
    }
}

/// 存储路径构建器
#[derive(Debug, Default)]
pub struct StoragePathsBuilder {
    app_dir: Option<PathBuf>,
    custom_data_dir: Option<PathBuf>,
    custom_blobs_dir: Option<PathBuf>,
}

impl StoragePathsBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn app_dir(mut self, dir: PathBuf) -> Self {
        self.app_dir = Some(dir);
        self
    }

    pub fn data_dir(mut self, dir: PathBuf) -> Self {
        self.custom_data_dir = Some(dir);
        self
    }

    pub fn blobs_dir(mut self, dir: PathBuf) -> Self {
        self.custom_blobs_dir = Some(dir);
        self
    }

    pub fn build(self) -> StoragePathsResult<StoragePaths> {
        let Some(app_dir) = self.app_dir else {
            return Err(StoragePathsError::AppDirectoryMissing);
        };

        let data_dir = self
            .custom_data_dir
            .unwrap_or_else(|| app_dir.join(super::DATA_DIR_NAME));
        let blobs_dir = self
            .custom_blobs_dir
            .unwrap_or_else(|| data_dir.join(super::BLOBS_DIR_NAME));

        let paths = StoragePaths {
            app_dir,
            data_dir,
            blobs_dir,
        };

        paths.validate()?;
        Ok(paths)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn builder_derives_default_layout() {
        let temp_dir = TempDir::new().unwrap();
        let paths = StoragePaths::new(temp_dir.path().join("app")).unwrap();

        assert_eq!(paths.data_dir, temp_dir.path().join("app").join("data"));
        assert_eq!(paths.blobs_dir, paths.data_dir.join("blobs"));
        assert_eq!(paths.database_file(), paths.data_dir.join("checkpoints.db"));

        paths.ensure_directories().unwrap();
        assert!(paths.blobs_dir.is_dir());
    }

    #[test]
    fn builder_requires_app_dir() {
        let result = StoragePathsBuilder::new().build();
        assert!(matches!(result, Err(StoragePathsError::AppDirectoryMissing)));
    }
}
