//! Checkpoint 配置系统

use std::time::Duration;

use glob::Pattern;
use tracing::warn;

/// Smart 策略的阈值
#[derive(Debug, Clone)]
pub struct SmartStrategyConfig {
    /// 距离上次 checkpoint 超过该时长即触发
    pub min_interval: Duration,
    /// 上次 checkpoint 以来的工具调用数达到该值即触发
    pub min_tool_uses: usize,
}

impl Default for SmartStrategyConfig {
    fn default() -> Self {
        Self {
            min_interval: Duration::from_secs(300),
            min_tool_uses: 5,
        }
    }
}

/// Checkpoint 系统配置
#[derive(Debug, Clone)]
pub struct CheckpointConfig {
    /// 最大文件大小（字节），超过此大小的文件不会被快照
    pub max_file_size: u64,

    /// 忽略的文件模式（glob 格式）
    pub ignored_patterns: Vec<String>,

    /// 是否遵循项目中的 .gitignore
    pub respect_gitignore: bool,

    /// 每个会话保留的最大 checkpoint 数量（0 表示不自动清理）
    pub max_checkpoints: usize,

    /// 流式处理的缓冲区大小
    pub stream_buffer_size: usize,

    /// 并发处理文件的最大数量
    pub max_concurrent_files: usize,

    /// 获取会话锁的超时时间
    pub lock_timeout: Duration,

    /// 每个会话保留的最近消息数
    pub max_tracked_messages: usize,

    pub smart: SmartStrategyConfig,
}

impl Default for CheckpointConfig {
    fn default() -> Self {
        Self {
            max_file_size: 50 * 1024 * 1024, // 50MB
            ignored_patterns: vec![
                "node_modules/**".to_string(),
                "target/**".to_string(),
                "dist/**".to_string(),
                "build/**".to_string(),
                ".git/**".to_string(),
                "__pycache__/**".to_string(),
                "*.log".to_string(),
                "*.tmp".to_string(),
                ".DS_Store".to_string(),
                "Thumbs.db".to_string(),
            ],
            respect_gitignore: true,
            max_checkpoints: 0,
            stream_buffer_size: 64 * 1024, // 64KB
            max_concurrent_files: 10,
            lock_timeout: Duration::from_secs(30),
            max_tracked_messages: 200,
            smart: SmartStrategyConfig::default(),
        }
    }
}

impl CheckpointConfig {
    /// 检查文件大小是否超过限制
    pub fn is_file_too_large(&self, size: u64) -> bool {
        size > self.max_file_size
    }

    pub fn ignore_rules(&self) -> IgnoreRules {
        IgnoreRules::new(&self.ignored_patterns)
    }
}

/// 编译后的忽略规则
///
/// 不含 `/` 的模式匹配任意层级的文件名；`dir/**` 形式同时匹配目录本身，
/// 使遍历时可以直接剪掉整棵子树。
#[derive(Debug, Clone, Default)]
pub struct IgnoreRules {
    path_patterns: Vec<Pattern>,
    name_patterns: Vec<Pattern>,
    dir_patterns: Vec<Pattern>,
}

impl IgnoreRules {
    pub fn new<S: AsRef<str>>(patterns: &[S]) -> Self {
        let mut rules = Self::default();

        for raw in patterns {
            let raw = raw.as_ref().trim();
            if raw.is_empty() {
                continue;
            }

            let compiled = match Pattern::new(raw) {
                Ok(p) => p,
                Err(e) => {
                    warn!("Invalid ignore pattern '{}': {}", raw, e);
                    continue;
                }
            };

            if let Some(dir) = raw.strip_suffix("/**") {
                if let Ok(dir_pattern) = Pattern::new(dir) {
                    rules.dir_patterns.push(dir_pattern);
                }
            }

            if raw.contains('/') {
                rules.path_patterns.push(compiled);
            } else {
                rules.name_patterns.push(compiled);
            }
        }

        rules
    }

    /// `relative` 为使用 `/` 分隔的相对路径
    pub fn is_ignored(&self, relative: &str, is_dir: bool) -> bool {
        let name = relative.rsplit('/').next().unwrap_or(relative);

        if self.path_patterns.iter().any(|p| p.matches(relative))
            || self.name_patterns.iter().any(|p| p.matches(name))
        {
            return true;
        }

        is_dir
            && self
                .dir_patterns
                .iter()
                .any(|p| p.matches(relative) || (!p.as_str().contains('/') && p.matches(name)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_should_ignore_file() {
        let rules = CheckpointConfig::default().ignore_rules();

        assert!(rules.is_ignored("node_modules/react/index.js", false));
        assert!(rules.is_ignored("target/debug/main", false));
        assert!(rules.is_ignored("test.log", false));
        assert!(rules.is_ignored("logs/nested/app.log", false));
        assert!(rules.is_ignored(".DS_Store", false));
        assert!(!rules.is_ignored("src/main.rs", false));
    }

    #[test]
    fn directory_patterns_prune_at_any_depth() {
        let rules = CheckpointConfig::default().ignore_rules();

        assert!(rules.is_ignored("node_modules", true));
        assert!(rules.is_ignored("crates/app/target", true));
        assert!(rules.is_ignored(".git", true));
        assert!(!rules.is_ignored("src", true));
        // 同名文件不被当作目录处理
        assert!(!rules.is_ignored("build", false));
    }

    #[test]
    fn invalid_patterns_are_skipped() {
        let rules = IgnoreRules::new(&["[", "*.bak"]);
        assert!(rules.is_ignored("a.bak", false));
        assert!(!rules.is_ignored("a.txt", false));
    }

    #[test]
    fn test_file_size_limit() {
        let config = CheckpointConfig::default();

        assert!(!config.is_file_too_large(1024)); // 1KB
        assert!(config.is_file_too_large(100 * 1024 * 1024)); // 100MB
    }
}
