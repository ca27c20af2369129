//! 时间线树
//!
//! 节点保存在以 checkpoint ID 为键的 arena 中，父子关系只存 ID；
//! 对外展示的嵌套结构 [`TimelineNode`] 在需要时现场构建。

use std::collections::{HashMap, HashSet};

use super::error::{CheckpointError, CheckpointResult};
use super::models::{Checkpoint, TimelineNode};

#[derive(Debug, Clone)]
struct ArenaNode {
    checkpoint: Checkpoint,
    children: Vec<String>,
    file_snapshot_ids: Vec<i64>,
}

#[derive(Debug, Default)]
pub struct CheckpointTree {
    nodes: HashMap<String, ArenaNode>,
    /// 插入顺序，即创建顺序
    order: Vec<String>,
    root: Option<String>,
}

impl CheckpointTree {
    pub fn new() -> Self {
        Self::default()
    }

    /// 从按创建顺序排列的 checkpoint 重建树
    pub fn from_checkpoints(
        checkpoints: Vec<Checkpoint>,
        mut snapshot_ids: HashMap<String, Vec<i64>>,
    ) -> CheckpointResult<Self> {
        let mut tree = Self::new();
        for checkpoint in checkpoints {
            let ids = snapshot_ids.remove(&checkpoint.id).unwrap_or_default();
            tree.insert(checkpoint, ids)?;
        }
        Ok(tree)
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    pub fn contains(&self, id: &str) -> bool {
        self.nodes.contains_key(id)
    }

    pub fn get(&self, id: &str) -> Option<&Checkpoint> {
        self.nodes.get(id).map(|n| &n.checkpoint)
    }

    pub fn root_id(&self) -> Option<&str> {
        self.root.as_deref()
    }

    /// 插入新节点；父节点必须已存在，且整棵树只能有一个根
    pub fn insert(&mut self, checkpoint: Checkpoint, file_snapshot_ids: Vec<i64>) -> CheckpointResult<()> {
        let id = checkpoint.id.clone();
        if self.nodes.contains_key(&id) {
            return Err(CheckpointError::InvariantViolation(format!(
                "duplicate checkpoint id {}",
                id
            )));
        }

        match checkpoint.parent_checkpoint_id.as_deref() {
            Some(parent) => {
                let parent_node = self.nodes.get_mut(parent).ok_or_else(|| {
                    CheckpointError::InvariantViolation(format!(
                        "checkpoint {} references missing parent {}",
                        id, parent
                    ))
                })?;
                parent_node.children.push(id.clone());
            }
            None => {
                if let Some(root) = &self.root {
                    return Err(CheckpointError::InvariantViolation(format!(
                        "checkpoint {} would be a second root (existing root {})",
                        id, root
                    )));
                }
                self.root = Some(id.clone());
            }
        }

        self.nodes.insert(
            id.clone(),
            ArenaNode {
                checkpoint,
                children: Vec::new(),
                file_snapshot_ids,
            },
        );
        self.order.push(id);
        Ok(())
    }

    /// 从 `id` 开始沿父链向上，包含 `id` 本身
    pub fn ancestors(&self, id: &str) -> Vec<String> {
        let mut chain = Vec::new();
        let mut cursor = self.nodes.get(id).map(|_| id.to_string());
        let mut seen = HashSet::new();

        while let Some(current) = cursor {
            if !seen.insert(current.clone()) {
                break;
            }
            cursor = self
                .nodes
                .get(&current)
                .and_then(|n| n.checkpoint.parent_checkpoint_id.clone());
            chain.push(current);
        }
        chain
    }

    /// 按创建顺序列出全部 checkpoint
    pub fn list(&self) -> Vec<Checkpoint> {
        self.order
            .iter()
            .filter_map(|id| self.nodes.get(id))
            .map(|n| n.checkpoint.clone())
            .collect()
    }

    pub fn ids_in_order(&self) -> &[String] {
        &self.order
    }

    /// 计算删除 `doomed` 后每个受影响子节点的新父节点
    ///
    /// 新父节点是沿父链向上第一个未被删除的祖先。
    pub fn plan_reparent(&self, doomed: &HashSet<String>) -> Vec<(String, Option<String>)> {
        let mut plan = Vec::new();
        for id in &self.order {
            if doomed.contains(id) {
                continue;
            }
            let Some(node) = self.nodes.get(id) else {
                continue;
            };
            let Some(parent) = node.checkpoint.parent_checkpoint_id.as_deref() else {
                continue;
            };
            if !doomed.contains(parent) {
                continue;
            }
            let survivor = self
                .ancestors(parent)
                .into_iter()
                .find(|candidate| !doomed.contains(candidate));
            plan.push((id.clone(), survivor));
        }
        plan
    }

    /// 删除节点并应用重新挂载计划
    pub fn remove_and_reparent(
        &mut self,
        doomed: &HashSet<String>,
        plan: &[(String, Option<String>)],
    ) -> CheckpointResult<()> {
        for (child, new_parent) in plan {
            if let Some(node) = self.nodes.get_mut(child) {
                node.checkpoint.parent_checkpoint_id = new_parent.clone();
            }
        }

        self.nodes.retain(|id, _| !doomed.contains(id));
        self.order.retain(|id| !doomed.contains(id));

        // 以父指针为准重建子列表与根
        for node in self.nodes.values_mut() {
            node.children.clear();
        }
        self.root = None;
        for id in self.order.clone() {
            let parent = self
                .nodes
                .get(&id)
                .and_then(|n| n.checkpoint.parent_checkpoint_id.clone());
            match parent {
                Some(parent) => match self.nodes.get_mut(&parent) {
                    Some(parent_node) => parent_node.children.push(id),
                    None => {
                        return Err(CheckpointError::InvariantViolation(format!(
                            "checkpoint {} left with missing parent {}",
                            id, parent
                        )))
                    }
                },
                None => {
                    if self.root.is_some() {
                        return Err(CheckpointError::InvariantViolation(format!(
                            "removal left multiple roots (second: {})",
                            id
                        )));
                    }
                    self.root = Some(id);
                }
            }
        }
        Ok(())
    }

    /// 构建以根节点为起点的嵌套树
    pub fn build_root(&self) -> Option<TimelineNode> {
        self.root.as_deref().and_then(|id| self.build_node(id))
    }

    pub fn build_node(&self, id: &str) -> Option<TimelineNode> {
        let node = self.nodes.get(id)?;
        Some(TimelineNode {
            checkpoint: node.checkpoint.clone(),
            children: node
                .children
                .iter()
                .filter_map(|child| self.build_node(child))
                .collect(),
            file_snapshot_ids: node.file_snapshot_ids.clone(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::checkpoint::models::CheckpointMetadata;
    use chrono::Utc;

    fn cp(id: &str, parent: Option<&str>) -> Checkpoint {
        Checkpoint {
            id: id.into(),
            session_id: "s".into(),
            project_id: "p".into(),
            message_index: 0,
            timestamp: Utc::now(),
            parent_checkpoint_id: parent.map(str::to_string),
            description: None,
            metadata: CheckpointMetadata::default(),
        }
    }

    fn sample() -> CheckpointTree {
        // a -> b -> c
        //        \-> d
        let mut tree = CheckpointTree::new();
        tree.insert(cp("a", None), vec![1]).unwrap();
        tree.insert(cp("b", Some("a")), vec![2]).unwrap();
        tree.insert(cp("c", Some("b")), vec![3]).unwrap();
        tree.insert(cp("d", Some("b")), vec![4]).unwrap();
        tree
    }

    #[test]
    fn rejects_orphans_and_second_root() {
        let mut tree = sample();
        assert!(matches!(
            tree.insert(cp("x", Some("missing")), vec![]),
            Err(CheckpointError::InvariantViolation(_))
        ));
        assert!(matches!(
            tree.insert(cp("y", None), vec![]),
            Err(CheckpointError::InvariantViolation(_))
        ));
        assert_eq!(tree.len(), 4);
    }

    #[test]
    fn ancestors_walk_to_root() {
        let tree = sample();
        assert_eq!(tree.ancestors("d"), vec!["d", "b", "a"]);
        assert!(tree.ancestors("missing").is_empty());
    }

    #[test]
    fn builds_nested_timeline() {
        let root = sample().build_root().unwrap();
        assert_eq!(root.checkpoint.id, "a");
        assert_eq!(root.children.len(), 1);
        let b = &root.children[0];
        let child_ids: Vec<_> = b.children.iter().map(|c| c.checkpoint.id.as_str()).collect();
        assert_eq!(child_ids, vec!["c", "d"]);
        assert_eq!(b.file_snapshot_ids, vec![2]);
    }

    #[test]
    fn removing_middle_node_reparents_children() {
        let mut tree = sample();
        let doomed: HashSet<String> = ["b".to_string()].into_iter().collect();
        let plan = tree.plan_reparent(&doomed);
        assert_eq!(
            plan,
            vec![
                ("c".to_string(), Some("a".to_string())),
                ("d".to_string(), Some("a".to_string()))
            ]
        );

        tree.remove_and_reparent(&doomed, &plan).unwrap();
        assert_eq!(tree.len(), 3);
        assert_eq!(tree.get("c").unwrap().parent_checkpoint_id.as_deref(), Some("a"));
        assert_eq!(tree.build_root().unwrap().children.len(), 2);
    }

    #[test]
    fn removing_root_promotes_single_child() {
        let mut tree = sample();
        let doomed: HashSet<String> = ["a".to_string()].into_iter().collect();
        let plan = tree.plan_reparent(&doomed);
        assert_eq!(plan, vec![("b".to_string(), None)]);

        tree.remove_and_reparent(&doomed, &plan).unwrap();
        assert_eq!(tree.root_id(), Some("b"));
    }
}
