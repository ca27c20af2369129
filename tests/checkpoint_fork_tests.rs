//! 会话 fork 集成测试

mod test_utils;

use checkpoint_lib::checkpoint::{CheckpointError, CheckpointStorage, FileChangeType};
use test_utils::{TestEnv, PROJECT, SESSION};

async fn fork(env: &TestEnv, checkpoint_id: &str, new_session: &str) -> Result<String, CheckpointError> {
    env.service
        .fork_from_checkpoint(
            checkpoint_id,
            SESSION,
            PROJECT,
            &env.project_path(),
            new_session,
            Some("branch".to_string()),
        )
        .await
        .map(|outcome| outcome.checkpoint.id)
}

#[tokio::test]
async fn forked_session_evolves_independently() {
    let env = TestEnv::new().await;
    env.write("main.py", "v1");
    let c1 = env.create(SESSION).await;
    env.write("main.py", "v2");
    let c2 = env.create(SESSION).await;

    let fork_root = fork(&env, &c1.checkpoint.id, "branch").await.unwrap();

    env.write("main.py", "branch work");
    let b1 = env.create("branch").await;
    assert_eq!(b1.checkpoint.parent_checkpoint_id.as_deref(), Some(fork_root.as_str()));

    // 分支的根内容来自 c1
    let content = env
        .service
        .get_checkpoint_file_content(&fork_root, "branch", PROJECT, "main.py")
        .await
        .unwrap();
    assert_eq!(content.as_deref(), Some(b"v1".as_slice()));

    let original = env
        .service
        .get_session_timeline(SESSION, PROJECT, &env.project_path())
        .await
        .unwrap();
    assert_eq!(original.total_checkpoints, 2);
    assert_eq!(
        original.current_checkpoint_id.as_deref(),
        Some(c2.checkpoint.id.as_str())
    );

    let branch = env
        .service
        .get_session_timeline("branch", PROJECT, &env.project_path())
        .await
        .unwrap();
    assert_eq!(branch.total_checkpoints, 2);
    assert_eq!(branch.root_node.unwrap().checkpoint.id, fork_root);

    // 原会话的 checkpoint 在分支中不可见
    let err = env
        .service
        .restore_checkpoint(&c2.checkpoint.id, "branch", PROJECT, &env.project_path())
        .await
        .unwrap_err();
    assert!(matches!(err, CheckpointError::CheckpointNotFound { .. }));
}

#[tokio::test]
async fn fork_root_records_origin() {
    let env = TestEnv::new().await;
    env.write("lib.rs", "fn main() {}");
    let c1 = env.create(SESSION).await;

    let outcome = env
        .service
        .fork_from_checkpoint(&c1.checkpoint.id, SESSION, PROJECT, &env.project_path(), "b", None)
        .await
        .unwrap();

    assert_eq!(outcome.files_processed, 1);
    assert_eq!(outcome.checkpoint.session_id, "b");
    assert!(outcome.checkpoint.parent_checkpoint_id.is_none());
    let origin = outcome.checkpoint.metadata.fork_origin.expect("缺少 fork 来源");
    assert_eq!(origin.session_id, SESSION);
    assert_eq!(origin.checkpoint_id, c1.checkpoint.id);

    let settings = env
        .service
        .get_checkpoint_settings("b", PROJECT, &env.project_path())
        .await
        .unwrap();
    assert_eq!(
        settings.current_checkpoint_id.as_deref(),
        Some(outcome.checkpoint.id.as_str())
    );

    // fork 出的 blob 被新会话额外引用一次
    let stats = env.service.blob_stats().await.unwrap();
    assert_eq!(stats.blob_count, 1);
    assert_eq!(stats.total_refs, 2);
}

#[tokio::test]
async fn fork_root_snapshot_marks_files_added() {
    let env = TestEnv::new().await;
    env.write("a.txt", "a");
    env.write("b.txt", "b");
    env.create(SESSION).await;
    env.remove("b.txt");
    let c2 = env.create(SESSION).await;
    let root = fork(&env, &c2.checkpoint.id, "b").await.unwrap();

    let storage = CheckpointStorage::new(env.service.database().pool().clone());
    let snapshots = storage.get_file_snapshots(&root).await.unwrap();

    // 墓碑不会带入分支
    assert_eq!(snapshots.len(), 1);
    assert_eq!(snapshots[0].file_path, "a.txt");
    assert_eq!(snapshots[0].change_type, FileChangeType::Added);
    assert!(!snapshots[0].is_deleted);

    let timeline = env
        .service
        .get_session_timeline("b", PROJECT, &env.project_path())
        .await
        .unwrap();
    assert_eq!(timeline.root_node.unwrap().file_snapshot_ids.len(), 1);
}

#[tokio::test]
async fn fork_rejects_existing_session_ids() {
    let env = TestEnv::new().await;
    env.write("a.txt", "a");
    let c1 = env.create(SESSION).await;

    // 不能 fork 到自己
    let err = fork(&env, &c1.checkpoint.id, SESSION).await.unwrap_err();
    assert!(matches!(err, CheckpointError::SessionAlreadyExists(_)));

    fork(&env, &c1.checkpoint.id, "taken").await.unwrap();
    let err = fork(&env, &c1.checkpoint.id, "taken").await.unwrap_err();
    assert!(matches!(err, CheckpointError::SessionAlreadyExists(_)));

    // 释放内存状态后，已持久化的会话仍然占用该 ID
    env.service.clear_checkpoint_manager("taken");
    let err = fork(&env, &c1.checkpoint.id, "taken").await.unwrap_err();
    assert!(matches!(err, CheckpointError::SessionAlreadyExists(_)));
}

#[tokio::test]
async fn fork_from_unknown_checkpoint_creates_nothing() {
    let env = TestEnv::new().await;
    env.write("a.txt", "a");
    env.create(SESSION).await;

    let err = fork(&env, "no-such-checkpoint", "orphan").await.unwrap_err();
    assert!(matches!(err, CheckpointError::CheckpointNotFound { .. }));
    assert!(!env
        .service
        .get_checkpoint_state_stats()
        .active_sessions
        .contains(&"orphan".to_string()));

    // 失败的 fork 不应持久化新会话
    let err = env
        .service
        .get_checkpoint_diff("x", "y", "orphan", PROJECT)
        .await
        .unwrap_err();
    assert!(matches!(err, CheckpointError::SessionNotFound { .. }));

    let stats = env.service.blob_stats().await.unwrap();
    assert_eq!(stats.total_refs, 1);
}

#[tokio::test]
async fn fork_survives_cleanup_of_source() {
    let env = TestEnv::new().await;
    env.write("main.py", "first");
    let c1 = env.create(SESSION).await;
    env.write("main.py", "second");
    let c2 = env.create(SESSION).await;
    env.write("main.py", "third");
    env.create(SESSION).await;

    let root = fork(&env, &c2.checkpoint.id, "b").await.unwrap();

    let removed = env
        .service
        .cleanup_old_checkpoints(SESSION, PROJECT, &env.project_path(), 0)
        .await
        .unwrap();
    assert_eq!(removed, 0);

    env.restore(SESSION, &c1.checkpoint.id).await;
    env.service
        .cleanup_old_checkpoints(SESSION, PROJECT, &env.project_path(), 0)
        .await
        .unwrap();
    env.service.collect_garbage().await.unwrap();

    // 源会话的 c2 已被清理，分支根仍持有其内容
    let content = env
        .service
        .get_checkpoint_file_content(&root, "b", PROJECT, "main.py")
        .await
        .unwrap();
    assert_eq!(content.as_deref(), Some(b"second".as_slice()));

    env.write("main.py", "branch work");
    env.create("b").await;
    env.restore("b", &root).await;
    assert_eq!(env.read("main.py"), "second");
}

#[tokio::test]
async fn forked_session_reloads_after_restart() {
    let mut env = TestEnv::new().await;
    env.write("a.txt", "a");
    let c1 = env.create(SESSION).await;
    let root = fork(&env, &c1.checkpoint.id, "b").await.unwrap();

    env.reopen().await;

    let timeline = env
        .service
        .get_session_timeline("b", PROJECT, "")
        .await
        .unwrap();
    assert_eq!(timeline.current_checkpoint_id.as_deref(), Some(root.as_str()));
    let root_node = timeline.root_node.unwrap();
    assert_eq!(
        root_node.checkpoint.metadata.fork_origin.unwrap().checkpoint_id,
        c1.checkpoint.id
    );
}
