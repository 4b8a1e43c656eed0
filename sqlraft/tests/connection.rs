//! Connection FSM tests over an in-memory duplex stream: handshake validation, framed
//! request/response exchange, failure synthesis and the heartbeat cutoff.

use std::sync::Arc;
use std::time::Duration;

use memstore::engine::MemEngine;
use memstore::engine::MemVfs;
use pretty_assertions::assert_eq;
use sqlraft::async_trait::async_trait;
use sqlraft::server::connection::Connection;
use sqlraft::server::gateway::Gateway;
use sqlraft::server::message::Message;
use sqlraft::server::message::HEADER_LEN;
use sqlraft::server::schema::Request;
use sqlraft::server::schema::Response;
use sqlraft::server::sql::Cluster;
use sqlraft::server::sql::ClusterError;
use sqlraft::server::sql::SqlValue;
use sqlraft::server::PROTOCOL_VERSION;
use sqlraft::NodeId;
use tokio::io::AsyncReadExt;
use tokio::io::AsyncWriteExt;
use tokio::io::DuplexStream;

struct StaticCluster;

#[async_trait]
impl Cluster for StaticCluster {
    async fn leader(&self) -> Option<(NodeId, String)> {
        Some((1, "1".to_string()))
    }

    async fn servers(&self) -> Result<Vec<String>, ClusterError> {
        Ok(vec!["1".to_string()])
    }
}

/// Spawn a connection task over a duplex pipe, returning the client end.
fn spawn_connection(heartbeat_timeout: Duration) -> DuplexStream {
    let (client, server) = tokio::io::duplex(1 << 16);
    let vfs = Arc::new(MemVfs::new());
    let engine = Arc::new(MemEngine::new(vfs));
    let cluster = Arc::new(StaticCluster);
    let gateway = Gateway::new(engine, cluster, heartbeat_timeout.as_millis() as u64);
    let conn = Connection::new(server, gateway, PROTOCOL_VERSION, heartbeat_timeout);
    tokio::spawn(conn.run());
    client
}

async fn handshake(client: &mut DuplexStream) {
    client.write_all(&PROTOCOL_VERSION.to_le_bytes()).await.unwrap();
}

async fn send_request(client: &mut DuplexStream, request: &Request) {
    let mut m = Message::new();
    request.encode(&mut m).unwrap();
    let header = m.send_start().unwrap();
    client.write_all(&header).await.unwrap();
    client.write_all(m.body()).await.unwrap();
}

async fn recv_response(client: &mut DuplexStream) -> Response {
    let mut header = [0u8; HEADER_LEN];
    client.read_exact(&mut header).await.unwrap();
    let mut m = Message::new();
    m.header_recv(&header).unwrap();
    client.read_exact(m.body_recv_start()).await.unwrap();
    Response::decode(&mut m).unwrap()
}

#[tokio::test]
async fn handshake_and_request_response() {
    let mut client = spawn_connection(Duration::from_secs(15));
    handshake(&mut client).await;

    send_request(&mut client, &Request::Leader).await;
    let response = recv_response(&mut client).await;
    assert_eq!(response, Response::Server { address: "1".to_string() });

    send_request(&mut client, &Request::Client { id: 5 }).await;
    let response = recv_response(&mut client).await;
    assert_eq!(response, Response::Welcome { heartbeat_timeout: 15_000 });
}

#[tokio::test]
async fn a_bad_protocol_version_closes_the_socket_without_reply() {
    let mut client = spawn_connection(Duration::from_secs(15));
    client.write_all(&0xdead_beefu64.to_le_bytes()).await.unwrap();

    // The server closes without sending anything.
    let mut buf = [0u8; 1];
    let n = client.read(&mut buf).await.unwrap();
    assert_eq!(n, 0, "expected EOF, got a byte");
}

#[tokio::test]
async fn full_sql_exchange() {
    let mut client = spawn_connection(Duration::from_secs(15));
    handshake(&mut client).await;

    send_request(
        &mut client,
        &Request::Open {
            name: "test.db".to_string(),
            flags: 0,
            vfs: "test".to_string(),
        },
    )
    .await;
    assert_eq!(recv_response(&mut client).await, Response::Db { id: 0 });

    send_request(
        &mut client,
        &Request::ExecSql {
            db_id: 0,
            sql: "CREATE TABLE test (n)".to_string(),
            params: vec![],
        },
    )
    .await;
    assert_eq!(
        recv_response(&mut client).await,
        Response::Result {
            last_insert_id: 0,
            rows_affected: 0,
        }
    );

    send_request(
        &mut client,
        &Request::ExecSql {
            db_id: 0,
            sql: "INSERT INTO test VALUES (?)".to_string(),
            params: vec![SqlValue::Integer(123)],
        },
    )
    .await;
    assert_eq!(
        recv_response(&mut client).await,
        Response::Result {
            last_insert_id: 1,
            rows_affected: 1,
        }
    );

    send_request(
        &mut client,
        &Request::QuerySql {
            db_id: 0,
            sql: "SELECT n FROM test".to_string(),
            params: vec![],
        },
    )
    .await;
    let response = recv_response(&mut client).await;
    assert_eq!(
        response,
        Response::Rows {
            columns: vec!["n".to_string()],
            rows: vec![vec![SqlValue::Integer(123)]],
        }
    );
}

#[tokio::test]
async fn request_errors_become_failure_responses() {
    let mut client = spawn_connection(Duration::from_secs(15));
    handshake(&mut client).await;

    // Unknown database handle: the request fails, the connection survives.
    send_request(
        &mut client,
        &Request::Prepare {
            db_id: 42,
            sql: "SELECT 1".to_string(),
        },
    )
    .await;
    match recv_response(&mut client).await {
        Response::Failure { code, description } => {
            assert_eq!(code, 4);
            assert!(description.contains("no db with id 42"), "got: {}", description);
        }
        other => panic!("expected a failure response, got {:?}", other),
    }

    // The connection is still serviceable.
    send_request(&mut client, &Request::Leader).await;
    assert_eq!(recv_response(&mut client).await, Response::Server { address: "1".to_string() });
}

#[tokio::test]
async fn an_empty_body_aborts_the_connection() {
    let mut client = spawn_connection(Duration::from_secs(15));
    handshake(&mut client).await;

    // A header declaring zero body words is a framing violation.
    let header = [0u8; HEADER_LEN];
    client.write_all(&header).await.unwrap();

    let mut buf = [0u8; 1];
    let n = client.read(&mut buf).await.unwrap();
    assert_eq!(n, 0, "expected the connection to be aborted");
}

#[tokio::test]
async fn a_quiet_client_is_cut_off_by_the_heartbeat_timeout() {
    let mut client = spawn_connection(Duration::from_millis(100));
    handshake(&mut client).await;

    // Send nothing and wait; the server aborts once the heartbeat window closes.
    let mut buf = [0u8; 1];
    let read = tokio::time::timeout(Duration::from_secs(2), client.read(&mut buf)).await;
    match read {
        Ok(Ok(0)) => {}
        other => panic!("expected EOF from heartbeat abort, got {:?}", other),
    }
}
