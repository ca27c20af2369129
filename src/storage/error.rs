use std::path::PathBuf;

use thiserror::Error;

pub type StoragePathsResult<T> = Result<T, StoragePathsError>;

#[derive(Debug, Error)]
pub enum StoragePathsError {
    #[error("Application directory is not set")]
    AppDirectoryMissing,
    #[error("Failed to access directory {path}: {source}")]
    DirectoryAccess {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("Failed to create directory {path}: {source}")]
    DirectoryCreate {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

impl StoragePathsError {
    pub fn directory_access(path: PathBuf, source: std::io::Error) -> Self {
        StoragePathsError::DirectoryAccess { path, source }
    }

    pub fn directory_create(path: PathBuf, source: std::io::Error) -> Self {
        StoragePathsError::DirectoryCreate { path, source }
    }
}
