//! 两个 checkpoint 之间的差异计算

use std::collections::BTreeMap;

use diffy::{create_patch, Line, PatchFormatter};

use super::models::FileSnapshot;

/// 二进制检测只看文件开头的这部分字节
const BINARY_PROBE_LEN: usize = 8 * 1024;

/// 按路径划分的三类变化，尚未计算行数
#[derive(Debug, Default, PartialEq, Eq)]
pub struct SnapshotDelta {
    pub added: Vec<String>,
    pub deleted: Vec<String>,
    /// (路径, from 哈希, to 哈希)
    pub modified: Vec<(String, String, String)>,
}

/// 比较两组存活文件；三个集合互不相交
pub fn partition(from: &[FileSnapshot], to: &[FileSnapshot]) -> SnapshotDelta {
    let from_map: BTreeMap<&str, &str> = live_hashes(from);
    let to_map: BTreeMap<&str, &str> = live_hashes(to);
    let mut delta = SnapshotDelta::default();

    for (path, to_hash) in &to_map {
        match from_map.get(path) {
            None => delta.added.push(path.to_string()),
            Some(from_hash) if from_hash != to_hash => delta.modified.push((
                path.to_string(),
                from_hash.to_string(),
                to_hash.to_string(),
            )),
            Some(_) => {}
        }
    }

    delta.deleted = from_map
        .keys()
        .filter(|path| !to_map.contains_key(*path))
        .map(|path| path.to_string())
        .collect();

    delta
}

fn live_hashes(snapshots: &[FileSnapshot]) -> BTreeMap<&str, &str> {
    snapshots
        .iter()
        .filter(|s| !s.is_deleted)
        .filter_map(|s| Some((s.file_path.as_str(), s.content_hash.as_deref()?)))
        .collect()
}

pub fn is_binary(content: &[u8]) -> bool {
    content.iter().take(BINARY_PROBE_LEN).any(|b| *b == 0)
}

/// 统计新增与删除的行数，二进制内容返回 (0, 0)
pub fn line_counts(from: &[u8], to: &[u8]) -> (usize, usize) {
    if is_binary(from) || is_binary(to) {
        return (0, 0);
    }

    let from_str = String::from_utf8_lossy(from);
    let to_str = String::from_utf8_lossy(to);
    let patch = create_patch(&from_str, &to_str);

    let mut additions = 0;
    let mut deletions = 0;
    for hunk in patch.hunks() {
        for line in hunk.lines() {
            match line {
                Line::Insert(_) => additions += 1,
                Line::Delete(_) => deletions += 1,
                Line::Context(_) => {}
            }
        }
    }
    (additions, deletions)
}

/// 生成 unified diff 文本
pub fn unified_diff(path: &str, from: &[u8], to: &[u8]) -> String {
    if is_binary(from) || is_binary(to) {
        return format!("Binary files a/{path} and b/{path} differ\n");
    }

    let from_str = String::from_utf8_lossy(from);
    let to_str = String::from_utf8_lossy(to);
    let original = format!("a/{}", path);
    let modified = format!("b/{}", path);
    let patch = create_patch(&from_str, &to_str);
    let formatted = PatchFormatter::new().fmt_patch(&patch).to_string();

    // diffy 默认使用 original/modified 作为文件头
    formatted
        .replacen("--- original", &format!("--- {}", original), 1)
        .replacen("+++ modified", &format!("+++ {}", modified), 1)
}
