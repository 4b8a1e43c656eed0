use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use maplit::btreeset;

use fixtures::RaftRouter;
use sqlraft::core::State;
use sqlraft::Config;

mod fixtures;

/// Single-voter self-election.
///
/// What does this test do?
///
/// - brings one node online with a single-voter configuration.
/// - asserts that it elects itself without outside help and commits its initial entry.
/// - asserts that `current_leader` resolves to the node's own id and address.
///
/// RUST_LOG=sqlraft,memstore,singleton=trace cargo test -p sqlraft --test singleton
#[tokio::test(flavor = "multi_thread", worker_threads = 3)]
async fn singleton() -> Result<()> {
    fixtures::init_tracing();

    let config = Arc::new(Config::build("test".into()).validate().expect("failed to build Raft config"));
    let router = Arc::new(RaftRouter::new(config.clone()));

    router.new_cluster(btreeset![1]).await?;

    router
        .wait_for_metrics(&1, |x| x.state == State::Leader, Some(Duration::from_secs(1)), "n1.state -> Leader")
        .await?;

    // The initial configuration entry is committed without any peer traffic.
    let metrics = router
        .wait_for_metrics(
            &1,
            |x| x.last_applied == 1 && x.last_log_index == 1,
            Some(Duration::from_secs(1)),
            "initial entry commits",
        )
        .await?;
    assert_eq!(metrics.current_term, 1, "expected term 1, got {}", metrics.current_term);

    let leader = router.current_leader(1).await;
    assert_eq!(leader, Some((1, "1".to_string())));

    // Writes commit and apply as soon as they are appended.
    router.client_request_many(1, "client", 3).await;
    router
        .wait_for_metrics(&1, |x| x.last_applied == 4, Some(Duration::from_secs(1)), "writes applied")
        .await?;

    Ok(())
}
