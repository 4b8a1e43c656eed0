//! Request and response schema tests: every schema is a bijection between its typed form and
//! its wire form.

use pretty_assertions::assert_eq;
use sqlraft::server::message::Message;
use sqlraft::server::schema::request_type;
use sqlraft::server::schema::Request;
use sqlraft::server::schema::Response;
use sqlraft::server::sql::SqlValue;
use sqlraft::server::Error;

/// Serialize a request and decode it back through a second message object, as the server's
/// receive path would.
fn transport_request(request: &Request) -> Request {
    let mut m = Message::new();
    request.encode(&mut m).expect("encode");
    let header = m.send_start().expect("send_start");
    let body = m.body().to_vec();

    let mut received = Message::new();
    received.header_recv(&header).expect("header_recv");
    received.body_recv_start().copy_from_slice(&body);
    let decoded = Request::decode(&mut received).expect("decode");
    assert_eq!(received.remaining(), 0, "decoder did not consume the whole body");
    decoded
}

fn transport_response(response: &Response) -> Response {
    let mut m = Message::new();
    response.encode(&mut m).expect("encode");
    let header = m.send_start().expect("send_start");
    let body = m.body().to_vec();

    let mut received = Message::new();
    received.header_recv(&header).expect("header_recv");
    received.body_recv_start().copy_from_slice(&body);
    let decoded = Response::decode(&mut received).expect("decode");
    assert_eq!(received.remaining(), 0, "decoder did not consume the whole body");
    decoded
}

#[test]
fn open_request_round_trip() {
    let request = Request::Open {
        name: "test.db".to_string(),
        flags: 0,
        vfs: "test".to_string(),
    };
    let decoded = transport_request(&request);
    assert_eq!(decoded, request);
    assert_eq!(request.type_code(), request_type::OPEN);
}

#[test]
fn request_round_trips() {
    let requests = vec![
        Request::Leader,
        Request::Client { id: 123 },
        Request::Heartbeat { timestamp: 666 },
        Request::Prepare {
            db_id: 0,
            sql: "SELECT n FROM test".to_string(),
        },
        Request::Exec {
            db_id: 1,
            stmt_id: 2,
            params: vec![
                SqlValue::Integer(-5),
                SqlValue::Float(0.25),
                SqlValue::Text("hello".to_string()),
                SqlValue::Blob(vec![1, 2, 3]),
                SqlValue::Null,
            ],
        },
        Request::Query {
            db_id: 1,
            stmt_id: 0,
            params: vec![],
        },
        Request::Finalize { db_id: 3, stmt_id: 9 },
        Request::ExecSql {
            db_id: 0,
            sql: "INSERT INTO test VALUES(?)".to_string(),
            params: vec![SqlValue::Integer(123)],
        },
        Request::QuerySql {
            db_id: 0,
            sql: "SELECT n FROM test".to_string(),
            params: vec![],
        },
    ];
    for request in requests {
        let decoded = transport_request(&request);
        assert_eq!(decoded, request);
    }
}

#[test]
fn response_round_trips() {
    let responses = vec![
        Response::Failure {
            code: 1,
            description: "unknown protocol version".to_string(),
        },
        Response::Server {
            address: "127.0.0.1:9001".to_string(),
        },
        Response::Welcome {
            heartbeat_timeout: 15_000,
        },
        Response::Servers {
            addresses: vec!["1".to_string(), "2".to_string(), "3".to_string()],
        },
        Response::Db { id: 0 },
        Response::Stmt { db_id: 0, id: 4 },
        Response::Result {
            last_insert_id: 10,
            rows_affected: 1,
        },
        Response::Empty,
    ];
    for response in responses {
        let decoded = transport_response(&response);
        assert_eq!(decoded, response);
    }
}

#[test]
fn rows_response_round_trip() {
    let response = Response::Rows {
        columns: vec!["n".to_string(), "name".to_string(), "weight".to_string()],
        rows: vec![
            vec![
                SqlValue::Integer(123),
                SqlValue::Text("first".to_string()),
                SqlValue::Float(1.5),
            ],
            vec![SqlValue::Integer(-7), SqlValue::Null, SqlValue::Blob(vec![0xde, 0xad])],
        ],
    };
    let decoded = transport_response(&response);
    assert_eq!(decoded, response);
}

#[test]
fn rows_with_many_columns_pack_tags_across_words() {
    // 17 columns of 4-bit tags span more than one header word per row.
    let columns: Vec<String> = (0..17).map(|i| format!("c{}", i)).collect();
    let row: Vec<SqlValue> = (0..17).map(SqlValue::Integer).collect();
    let response = Response::Rows {
        columns,
        rows: vec![row],
    };
    let decoded = transport_response(&response);
    assert_eq!(decoded, response);
}

#[test]
fn unknown_request_type_is_a_protocol_error() {
    let mut m = Message::new();
    m.header_put(77, 0);
    m.put_u64(0).unwrap();
    let header = m.send_start().unwrap();
    let body = m.body().to_vec();

    let mut received = Message::new();
    received.header_recv(&header).unwrap();
    received.body_recv_start().copy_from_slice(&body);
    assert!(matches!(Request::decode(&mut received), Err(Error::Protocol(_))));
}

#[test]
fn unknown_value_tag_is_a_parse_error() {
    // Hand-build an exec request whose parameter tuple carries an invalid type tag.
    let mut m = Message::new();
    m.header_put(request_type::EXEC, 0);
    m.put_u32(0).unwrap();
    m.put_u32(0).unwrap();
    m.put_u8(1).unwrap(); // one parameter
    m.put_u8(9).unwrap(); // bogus type tag
    m.pad_word().unwrap();
    m.put_u64(0).unwrap();
    let header = m.send_start().unwrap();
    let body = m.body().to_vec();

    let mut received = Message::new();
    received.header_recv(&header).unwrap();
    received.body_recv_start().copy_from_slice(&body);
    assert!(matches!(Request::decode(&mut received), Err(Error::Parse(_))));
}
