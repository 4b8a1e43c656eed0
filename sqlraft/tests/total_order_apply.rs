use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use maplit::btreeset;

use fixtures::RaftRouter;
use sqlraft::Config;
use sqlraft::RaftStorageDebug;

mod fixtures;

/// Cluster total_order_apply test.
///
/// What does this test do?
///
/// - brings 2 nodes online: one voter and one spare.
/// - writes a stream of logs to the leader while watching the spare's state machine.
/// - asserts that the applied index never moves backwards on the replica.
///
/// RUST_LOG=sqlraft,memstore,total_order_apply=trace cargo test -p sqlraft --test total_order_apply
#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn total_order_apply() -> Result<()> {
    fixtures::init_tracing();

    let config = Arc::new(Config::build("test".into()).validate().expect("failed to build Raft config"));
    let router = Arc::new(RaftRouter::new(config.clone()));

    let mut want = router.new_cluster(btreeset![1]).await?;

    tracing::info!("--- add one spare");
    router.new_raft_node(2).await;
    router.add_server(1, 2).await?;
    want += 1;

    let sto = router.get_storage_handle(&2).await?;

    let (tx, rx) = tokio::sync::watch::channel(false);

    let watcher = tokio::spawn(async move {
        let mut prev = 0;
        loop {
            if *rx.borrow() {
                break;
            }

            let last = {
                let sm = sto.get_state_machine().await;
                sm.last_applied_log
            };

            if last < prev {
                panic!("out of order apply: {} after {}", last, prev);
            }
            prev = last;

            tokio::task::yield_now().await;
        }
    });

    let n = 2000;
    router.client_request_many(1, "foo", n).await;
    want += n as u64;

    router
        .wait_for_metrics(
            &2,
            |x| x.last_applied >= want,
            Some(Duration::from_secs(10)),
            &format!("n2.last_applied -> {}", want),
        )
        .await?;

    tx.send(true)?;
    watcher.await?;

    Ok(())
}
