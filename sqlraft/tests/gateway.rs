//! Gateway tests: request dispatch against the toy engine, handle registries, the context
//! ring bound and the error taxonomy.

use std::sync::Arc;

use memstore::engine::MemEngine;
use memstore::engine::MemVfs;
use pretty_assertions::assert_eq;
use sqlraft::async_trait::async_trait;
use sqlraft::server::gateway::Gateway;
use sqlraft::server::gateway::MAX_REQUESTS;
use sqlraft::server::schema::Request;
use sqlraft::server::schema::Response;
use sqlraft::server::sql::Cluster;
use sqlraft::server::sql::ClusterError;
use sqlraft::server::sql::SqlValue;
use sqlraft::server::Error;
use sqlraft::NodeId;

/// A cluster stub answering fixed values.
struct StaticCluster {
    leader: Option<(NodeId, String)>,
    servers: Result<Vec<String>, ()>,
}

#[async_trait]
impl Cluster for StaticCluster {
    async fn leader(&self) -> Option<(NodeId, String)> {
        self.leader.clone()
    }

    async fn servers(&self) -> Result<Vec<String>, ClusterError> {
        match &self.servers {
            Ok(addresses) => Ok(addresses.clone()),
            Err(()) => Err(ClusterError::NotLeader(None)),
        }
    }
}

fn test_gateway() -> Gateway<MemEngine, StaticCluster> {
    let vfs = Arc::new(MemVfs::new());
    let engine = Arc::new(MemEngine::new(vfs));
    let cluster = Arc::new(StaticCluster {
        leader: Some((1, "1".to_string())),
        servers: Ok(vec!["1".to_string(), "2".to_string()]),
    });
    Gateway::new(engine, cluster, 15_000)
}

/// Dispatch a request and decode the response out of its context slot.
async fn roundtrip(gateway: &mut Gateway<MemEngine, StaticCluster>, request: Request) -> Result<Response, Error> {
    let slot = gateway.handle(request).await?;
    let message = gateway.response(slot).expect("response buffer");
    message.send_start()?;
    message.rewind();
    let response = Response::decode(message)?;
    gateway.finish(slot);
    Ok(response)
}

#[tokio::test]
async fn leader_and_client_and_heartbeat() {
    let mut gateway = test_gateway();

    let response = roundtrip(&mut gateway, Request::Leader).await.unwrap();
    assert_eq!(response, Response::Server { address: "1".to_string() });

    let response = roundtrip(&mut gateway, Request::Client { id: 9 }).await.unwrap();
    assert_eq!(response, Response::Welcome { heartbeat_timeout: 15_000 });
    assert_eq!(gateway.client_id(), 9);

    let response = roundtrip(&mut gateway, Request::Heartbeat { timestamp: 1 }).await.unwrap();
    assert_eq!(
        response,
        Response::Servers {
            addresses: vec!["1".to_string(), "2".to_string()],
        }
    );
}

#[tokio::test]
async fn heartbeat_on_a_non_leader_is_busy() {
    let vfs = Arc::new(MemVfs::new());
    let engine = Arc::new(MemEngine::new(vfs));
    let cluster = Arc::new(StaticCluster {
        leader: None,
        servers: Err(()),
    });
    let mut gateway = Gateway::new(engine, cluster, 15_000);

    let err = gateway.handle(Request::Heartbeat { timestamp: 1 }).await.unwrap_err();
    assert!(matches!(err, Error::Busy(_)), "expected busy, got {:?}", err);
}

#[tokio::test]
async fn open_prepare_exec_query_finalize() {
    let mut gateway = test_gateway();

    let response = roundtrip(
        &mut gateway,
        Request::Open {
            name: "test.db".to_string(),
            flags: 0,
            vfs: "test".to_string(),
        },
    )
    .await
    .unwrap();
    assert_eq!(response, Response::Db { id: 0 });

    let response = roundtrip(
        &mut gateway,
        Request::ExecSql {
            db_id: 0,
            sql: "CREATE TABLE test (n)".to_string(),
            params: vec![],
        },
    )
    .await
    .unwrap();
    assert_eq!(
        response,
        Response::Result {
            last_insert_id: 0,
            rows_affected: 0,
        }
    );

    let response = roundtrip(
        &mut gateway,
        Request::Prepare {
            db_id: 0,
            sql: "INSERT INTO test VALUES (?)".to_string(),
        },
    )
    .await
    .unwrap();
    assert_eq!(response, Response::Stmt { db_id: 0, id: 0 });

    let response = roundtrip(
        &mut gateway,
        Request::Exec {
            db_id: 0,
            stmt_id: 0,
            params: vec![SqlValue::Integer(123)],
        },
    )
    .await
    .unwrap();
    assert_eq!(
        response,
        Response::Result {
            last_insert_id: 1,
            rows_affected: 1,
        }
    );

    let response = roundtrip(
        &mut gateway,
        Request::QuerySql {
            db_id: 0,
            sql: "SELECT n FROM test".to_string(),
            params: vec![],
        },
    )
    .await
    .unwrap();
    assert_eq!(
        response,
        Response::Rows {
            columns: vec!["n".to_string()],
            rows: vec![vec![SqlValue::Integer(123)]],
        }
    );

    let response = roundtrip(&mut gateway, Request::Finalize { db_id: 0, stmt_id: 0 }).await.unwrap();
    assert_eq!(response, Response::Empty);

    // The statement is gone after finalize.
    let err = gateway
        .handle(Request::Exec {
            db_id: 0,
            stmt_id: 0,
            params: vec![],
        })
        .await
        .unwrap_err();
    assert!(matches!(err, Error::NotFound(_)), "expected not-found, got {:?}", err);
}

#[tokio::test]
async fn unknown_handles_are_not_found() {
    let mut gateway = test_gateway();

    let err = gateway
        .handle(Request::Prepare {
            db_id: 7,
            sql: "SELECT 1".to_string(),
        })
        .await
        .unwrap_err();
    assert!(matches!(err, Error::NotFound(_)));
}

#[tokio::test]
async fn engine_errors_carry_their_codes() {
    let mut gateway = test_gateway();
    roundtrip(
        &mut gateway,
        Request::Open {
            name: "test.db".to_string(),
            flags: 0,
            vfs: "test".to_string(),
        },
    )
    .await
    .unwrap();

    let err = gateway
        .handle(Request::Prepare {
            db_id: 0,
            sql: "DROP TABLE test".to_string(),
        })
        .await
        .unwrap_err();
    match err {
        Error::Engine { code, message, .. } => {
            assert_eq!(code, 1);
            assert!(message.contains("syntax error"), "unexpected message: {}", message);
        }
        other => panic!("expected an engine error, got {:?}", other),
    }
}

#[tokio::test]
async fn the_context_ring_is_bounded() {
    let mut gateway = test_gateway();

    let mut slots = Vec::new();
    for _ in 0..MAX_REQUESTS {
        slots.push(gateway.handle(Request::Leader).await.unwrap());
    }

    // One request too many is a protocol violation.
    let err = gateway.handle(Request::Leader).await.unwrap_err();
    assert!(matches!(err, Error::Protocol(_)), "expected protocol error, got {:?}", err);
    assert!(err.is_fatal());

    // Finishing a slot frees it for the next request.
    gateway.finish(slots[0]);
    let slot = gateway.handle(Request::Leader).await.unwrap();
    assert_eq!(slot, slots[0]);
}

#[tokio::test]
async fn inserts_emit_wal_frames_into_the_page_store() {
    let vfs = Arc::new(MemVfs::new());
    let engine = Arc::new(MemEngine::new(vfs.clone()));
    let cluster = Arc::new(StaticCluster {
        leader: Some((1, "1".to_string())),
        servers: Ok(vec![]),
    });
    let mut gateway = Gateway::new(engine, cluster, 15_000);

    roundtrip(
        &mut gateway,
        Request::Open {
            name: "test.db".to_string(),
            flags: 0,
            vfs: "test".to_string(),
        },
    )
    .await
    .unwrap();
    roundtrip(
        &mut gateway,
        Request::ExecSql {
            db_id: 0,
            sql: "CREATE TABLE test (n)".to_string(),
            params: vec![],
        },
    )
    .await
    .unwrap();
    roundtrip(
        &mut gateway,
        Request::ExecSql {
            db_id: 0,
            sql: "INSERT INTO test VALUES (123)".to_string(),
            params: vec![],
        },
    )
    .await
    .unwrap();

    // The committed write surfaced as a WAL frame in the page store.
    assert_eq!(vfs.page_count("test.db"), 1);
    assert_eq!(vfs.page("test.db", 1).unwrap(), b"123".to_vec());
}
