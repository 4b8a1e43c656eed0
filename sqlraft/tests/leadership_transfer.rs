use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use maplit::btreeset;

use fixtures::RaftRouter;
use sqlraft::core::State;
use sqlraft::Config;

mod fixtures;

/// Leadership transfer to a chosen voter.
///
/// What does this test do?
///
/// - brings 3 voters online and finds the leader.
/// - transfers leadership to one of the followers.
/// - asserts that the target wins an election in a higher term and the old leader follows.
///
/// RUST_LOG=sqlraft,memstore,leadership_transfer=trace cargo test -p sqlraft --test leadership_transfer
#[tokio::test(flavor = "multi_thread", worker_threads = 5)]
async fn leadership_transfer() -> Result<()> {
    fixtures::init_tracing();

    let config = Arc::new(Config::build("test".into()).validate().expect("failed to build Raft config"));
    let router = Arc::new(RaftRouter::new(config.clone()));

    let want = router.new_cluster(btreeset![1, 2, 3]).await?;
    router.wait_for_log(&btreeset![1, 2, 3], want, Some(Duration::from_secs(5)), "cluster ready").await?;

    let old_leader = router.leader().await.expect("expected a leader");
    let target = [1, 2, 3].iter().copied().find(|id| *id != old_leader).expect("expected a follower");
    let old_term = router
        .wait_for_metrics(&old_leader, |_| true, Some(Duration::from_secs(1)), "leader metrics")
        .await?
        .current_term;

    tracing::info!("--- transferring leadership from {} to {}", old_leader, target);
    router.transfer_leadership(old_leader, target).await?;

    router
        .wait_for_metrics(
            &target,
            |x| x.state == State::Leader && x.current_term > old_term,
            Some(Duration::from_secs(5)),
            "target becomes leader in a higher term",
        )
        .await?;
    router
        .wait_for_metrics(
            &old_leader,
            |x| x.state == State::Follower && x.current_leader == Some(target),
            Some(Duration::from_secs(5)),
            "old leader follows the target",
        )
        .await?;

    Ok(())
}
