use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use maplit::btreeset;

use fixtures::RaftRouter;
use sqlraft::replication::ProgressMode;
use sqlraft::Config;
use sqlraft::RaftStorage;
use sqlraft::SnapshotPolicy;

mod fixtures;

/// Follower snapshot install after a partition.
///
/// What does this test do?
///
/// - brings 3 voters online, then partitions one of the followers.
/// - writes enough entries for the leader to take a snapshot and compact its log.
/// - reconnects the follower and asserts it is brought back via a snapshot, after which
///   replication resumes in pipeline mode.
///
/// RUST_LOG=sqlraft,memstore,snapshot_catchup=trace cargo test -p sqlraft --test snapshot_catchup
#[tokio::test(flavor = "multi_thread", worker_threads = 5)]
async fn snapshot_catchup() -> Result<()> {
    fixtures::init_tracing();

    // Pre-vote keeps the partitioned follower from driving its term up while isolated, so the
    // reconnect does not disrupt the leader.
    let config = Arc::new(
        Config::build("test".into())
            .pre_vote(true)
            .snapshot_policy(SnapshotPolicy::LogsSinceLast(10))
            .snapshot_trailing(5)
            .validate()
            .expect("failed to build Raft config"),
    );
    let router = Arc::new(RaftRouter::new(config.clone()));

    let mut want = router.new_cluster(btreeset![1, 2, 3]).await?;
    let leader = router.leader().await.expect("expected a leader");
    let lagging = [1, 2, 3].iter().copied().find(|id| *id != leader).expect("expected a follower");
    let online: std::collections::BTreeSet<u64> = [1u64, 2, 3].iter().copied().filter(|id| *id != lagging).collect();

    tracing::info!("--- partitioning node {}", lagging);
    router.isolate_node(lagging).await;

    router.client_request_many(leader, "foo", 30).await;
    want += 30;

    router.wait_for_log(&online, want, Some(Duration::from_secs(5)), "writes on majority").await?;

    // The leader compacts once the snapshot threshold is crossed.
    let leader_metrics = router
        .wait_for_metrics(
            &leader,
            |x| x.snapshot.index >= 10,
            Some(Duration::from_secs(5)),
            "leader takes a snapshot",
        )
        .await?;
    let snapshot = leader_metrics.snapshot;

    tracing::info!("--- reconnecting node {}", lagging);
    router.restore_node(lagging).await;

    // The follower is restored from the snapshot, then catches the tail of the log.
    router
        .wait_for_metrics(
            &lagging,
            |x| x.last_applied >= snapshot.index,
            Some(Duration::from_secs(5)),
            "follower applied through the snapshot",
        )
        .await?;
    router.wait_for_log(&btreeset![lagging], want, Some(Duration::from_secs(5)), "follower caught up").await?;

    // Replication to the restored follower is back in pipeline mode.
    router
        .wait_for_metrics(
            &leader,
            |x| {
                x.leader_metrics
                    .as_ref()
                    .and_then(|lm| lm.replication.get(&lagging))
                    .map(|r| r.mode == ProgressMode::Pipeline && r.matched.index >= snapshot.index)
                    .unwrap_or(false)
            },
            Some(Duration::from_secs(5)),
            "follower back in pipeline mode",
        )
        .await?;

    let storage = router.get_storage_handle(&lagging).await?;
    let snap = storage.get_current_snapshot().await?.expect("follower should hold the installed snapshot");
    assert!(
        snap.meta.last_log_id.index >= snapshot.index,
        "installed snapshot {} is older than the leader's {}",
        snap.meta.last_log_id,
        snapshot
    );

    Ok(())
}
