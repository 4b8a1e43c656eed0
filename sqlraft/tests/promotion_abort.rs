use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use maplit::btreeset;

use fixtures::RaftRouter;
use sqlraft::error::ChangeMembershipError;
use sqlraft::membership::Role;
use sqlraft::Config;

mod fixtures;

/// Promotion aborted by a slow follower.
///
/// What does this test do?
///
/// - brings a single-voter cluster online and adds a second server as a spare.
/// - partitions the spare, then asks for its promotion to voter.
/// - asserts that the promotion is abandoned with a no-connection error, that the server keeps
///   its spare role, and that no configuration-change entry was appended.
///
/// RUST_LOG=sqlraft,memstore,promotion_abort=trace cargo test -p sqlraft --test promotion_abort
#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn promotion_abort() -> Result<()> {
    fixtures::init_tracing();

    let config = Arc::new(
        Config::build("test".into())
            .max_catch_up_rounds(3)
            .max_catch_up_round_duration(500)
            .validate()
            .expect("failed to build Raft config"),
    );
    let router = Arc::new(RaftRouter::new(config.clone()));

    let mut want = router.new_cluster(btreeset![1]).await?;

    tracing::info!("--- adding server 2 as a spare");
    router.new_raft_node(2).await;
    router.add_server(1, 2).await?;
    want += 1;
    router.wait_for_log(&btreeset![1], want, Some(Duration::from_secs(5)), "add-server change").await?;

    // Let the spare catch up before cutting it off, so the promotion has to make progress
    // through fresh rounds rather than finishing instantly.
    router.wait_for_log(&btreeset![2], want, Some(Duration::from_secs(5)), "spare caught up").await?;

    tracing::info!("--- partitioning the spare");
    router.isolate_node(2).await;

    // Stuff some entries in so the promotee is genuinely behind.
    router.client_request_many(1, "foo", 5).await;
    want += 5;

    tracing::info!("--- promoting the partitioned spare");
    let res = router.assign(1, 2, Role::Voter).await;
    match res {
        Err(ChangeMembershipError::NoConnection(2)) => {}
        other => panic!("expected NoConnection(2), got {:?}", other),
    }

    // The role is unchanged and no configuration-change entry was appended.
    let metrics = router.wait_for_metrics(&1, |_| true, Some(Duration::from_secs(1)), "leader metrics").await?;
    let server = metrics.membership_config.get(2).expect("server 2 should still be configured");
    assert_eq!(server.role, Role::Spare);
    assert_eq!(metrics.last_log_index, want, "no change entry should have been appended");

    Ok(())
}
