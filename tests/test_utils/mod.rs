/*!
 * 集成测试公共夹具
 *
 * 每个 TestEnv 拥有独立的应用目录（数据库 + blob）和项目目录。
 */

#![allow(dead_code)]

use std::collections::BTreeMap;
use std::path::Path;

use tempfile::TempDir;

use checkpoint_lib::checkpoint::{CheckpointConfig, CheckpointOutcome, CheckpointService};
use checkpoint_lib::storage::{DatabaseOptions, StoragePathsBuilder};

pub const SESSION: &str = "session-main";
pub const PROJECT: &str = "project-1";

pub struct TestEnv {
    pub app_dir: TempDir,
    pub project: TempDir,
    pub service: CheckpointService,
    config: CheckpointConfig,
}

impl TestEnv {
    pub async fn new() -> Self {
        Self::with_config(CheckpointConfig::default()).await
    }

    pub async fn with_config(config: CheckpointConfig) -> Self {
        let app_dir = TempDir::new().expect("创建应用目录失败");
        let project = TempDir::new().expect("创建项目目录失败");
        let service = open_service(app_dir.path(), config.clone()).await;

        Self {
            app_dir,
            project,
            service,
            config,
        }
    }

    /// 关闭后在同一目录上重新打开服务，模拟进程重启
    pub async fn reopen(&mut self) {
        self.service.shutdown().await;
        self.service = open_service(self.app_dir.path(), self.config.clone()).await;
    }

    pub fn project_path(&self) -> String {
        self.project.path().to_string_lossy().into_owned()
    }

    pub fn write(&self, relative: &str, content: &str) {
        let path = self.project.path().join(relative);
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).expect("创建目录失败");
        }
        std::fs::write(path, content).expect("写入文件失败");
    }

    pub fn read(&self, relative: &str) -> String {
        std::fs::read_to_string(self.project.path().join(relative)).expect("读取文件失败")
    }

    pub fn remove(&self, relative: &str) {
        std::fs::remove_file(self.project.path().join(relative)).expect("删除文件失败");
    }

    pub fn exists(&self, relative: &str) -> bool {
        self.project.path().join(relative).exists()
    }

    pub async fn create(&self, session_id: &str) -> CheckpointOutcome {
        self.service
            .create_checkpoint(session_id, PROJECT, &self.project_path(), None, None)
            .await
            .expect("创建 checkpoint 失败")
    }

    pub async fn restore(&self, session_id: &str, checkpoint_id: &str) -> CheckpointOutcome {
        self.service
            .restore_checkpoint(checkpoint_id, session_id, PROJECT, &self.project_path())
            .await
            .expect("恢复 checkpoint 失败")
    }

    /// 项目目录中所有文件的内容（相对路径 → 字节）
    pub fn file_state(&self) -> BTreeMap<String, Vec<u8>> {
        let mut state = BTreeMap::new();
        collect_files(self.project.path(), self.project.path(), &mut state);
        state
    }
}

pub async fn open_service(app_dir: &Path, config: CheckpointConfig) -> CheckpointService {
    let paths = StoragePathsBuilder::new()
        .app_dir(app_dir.to_path_buf())
        .build()
        .expect("创建存储路径失败");

    CheckpointService::open(paths, DatabaseOptions::default(), config)
        .await
        .expect("打开 checkpoint 服务失败")
}

fn collect_files(root: &Path, dir: &Path, state: &mut BTreeMap<String, Vec<u8>>) {
    for entry in std::fs::read_dir(dir).expect("读取目录失败") {
        let path = entry.expect("读取目录项失败").path();
        if path.is_dir() {
            collect_files(root, &path, state);
        } else {
            let relative = path
                .strip_prefix(root)
                .expect("路径不在项目内")
                .to_string_lossy()
                .replace('\\', "/");
            state.insert(relative, std::fs::read(&path).expect("读取文件失败"));
        }
    }
}
