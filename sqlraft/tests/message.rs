//! Wire framing tests: header validation, field codecs, buffer switchover and the framing
//! boundary behaviors.

use pretty_assertions::assert_eq;
use sqlraft::server::message::Message;
use sqlraft::server::message::BUF_LEN;
use sqlraft::server::message::HEADER_LEN;
use sqlraft::server::message::MAX_BODY_LEN;
use sqlraft::server::message::WORD_SIZE;
use sqlraft::server::Error;

/// Serialize a message and feed it back through the receive path of a second message object.
fn transport(source: &mut Message) -> Message {
    let header = source.send_start().expect("send_start");
    let body = source.body().to_vec();

    let mut target = Message::new();
    target.header_recv(&header).expect("header_recv");
    let buf = target.body_recv_start();
    assert_eq!(buf.len(), body.len());
    buf.copy_from_slice(&body);
    target
}

#[test]
fn round_trip_fixed_width_fields() {
    let mut m = Message::new();
    m.header_put(42, 1);
    m.put_u8(7).unwrap();
    m.put_u32(123_456).unwrap();
    m.put_u64(u64::MAX).unwrap();
    m.put_i64(-12_345).unwrap();
    m.put_f64(3.1415).unwrap();

    let mut out = transport(&mut m);
    assert_eq!(out.mtype(), 42);
    assert_eq!(out.flags(), 1);
    assert_eq!(out.get_u8().unwrap(), 7);
    assert_eq!(out.get_u32().unwrap(), 123_456);
    assert_eq!(out.get_u64().unwrap(), u64::MAX);
    assert_eq!(out.get_i64().unwrap(), -12_345);
    assert_eq!(out.get_f64().unwrap(), 3.1415);
    assert_eq!(out.remaining(), 0);
}

#[test]
fn round_trip_text_and_lists() {
    let mut m = Message::new();
    m.header_put(3, 0);
    m.put_text("test.db").unwrap();
    m.put_u64(0).unwrap();
    m.put_text("test").unwrap();
    m.put_text_list(&["one".to_string(), "two".to_string(), "three".to_string()]).unwrap();

    let mut out = transport(&mut m);
    assert_eq!(out.get_text().unwrap(), "test.db");
    assert_eq!(out.get_u64().unwrap(), 0);
    assert_eq!(out.get_text().unwrap(), "test");
    assert_eq!(out.get_text_list().unwrap(), vec!["one", "two", "three"]);
    assert_eq!(out.remaining(), 0);
}

#[test]
fn reading_past_the_body_is_an_error() {
    let mut m = Message::new();
    m.header_put(1, 0);
    m.put_u64(99).unwrap();

    let mut out = transport(&mut m);
    assert_eq!(out.get_u64().unwrap(), 99);
    assert_eq!(out.remaining(), 0);
    assert!(matches!(out.get_u64(), Err(Error::Eom)));
    assert!(matches!(out.get_u8(), Err(Error::Eom)));
}

#[test]
fn empty_body_is_a_protocol_error() {
    let mut m = Message::new();
    let header = [0u8; HEADER_LEN];
    let err = m.header_recv(&header).unwrap_err();
    match err {
        Error::Protocol(msg) => assert_eq!(msg, "empty message body"),
        other => panic!("expected a protocol error, got {:?}", other),
    }
}

#[test]
fn oversized_body_is_a_protocol_error() {
    let mut m = Message::new();
    let words = (MAX_BODY_LEN / WORD_SIZE + 1) as u32;
    let mut header = [0u8; HEADER_LEN];
    header[..4].copy_from_slice(&words.to_le_bytes());
    let err = m.header_recv(&header).unwrap_err();
    match err {
        Error::Protocol(msg) => assert_eq!(msg, "message body too large"),
        other => panic!("expected a protocol error, got {:?}", other),
    }

    // A word count in the gigaword range is never valid.
    let mut header = [0u8; HEADER_LEN];
    header[..4].copy_from_slice(&(1u32 << 30).to_le_bytes());
    assert!(m.header_recv(&header).is_err());
}

#[test]
fn unterminated_text_is_a_parse_error() {
    let mut m = Message::new();
    let mut header = [0u8; HEADER_LEN];
    header[..4].copy_from_slice(&1u32.to_le_bytes());
    m.header_recv(&header).unwrap();
    let buf = m.body_recv_start();
    buf.copy_from_slice(b"abcdefgh"); // no NUL anywhere in the body

    let err = m.get_text().unwrap_err();
    match err {
        Error::Parse(msg) => assert_eq!(msg, "no string found"),
        other => panic!("expected a parse error, got {:?}", other),
    }
}

#[test]
fn body_is_padded_to_word_boundary() {
    let mut m = Message::new();
    m.header_put(0, 0);
    m.put_u8(1).unwrap();
    let header = m.send_start().unwrap();

    // One byte of payload still yields a full word on the wire, zero padded.
    assert_eq!(u32::from_le_bytes([header[0], header[1], header[2], header[3]]), 1);
    assert_eq!(m.body(), &[1, 0, 0, 0, 0, 0, 0, 0]);
}

#[test]
fn large_bodies_switch_to_the_heap_buffer() {
    let mut m = Message::new();
    m.header_put(7, 0);
    let big = "x".repeat(BUF_LEN * 2);
    m.put_text(&big).unwrap();

    let mut out = transport(&mut m);
    assert!(out.words() as usize * WORD_SIZE > BUF_LEN);
    assert_eq!(out.get_text().unwrap(), big);
    assert_eq!(out.remaining(), 0);
}

#[test]
fn encoding_past_the_cap_fails() {
    let mut m = Message::new();
    m.header_put(7, 0);
    let big = "x".repeat(MAX_BODY_LEN);
    assert!(matches!(m.put_text(&big), Err(Error::Protocol(_))));
}

#[test]
fn reset_discards_state() {
    let mut m = Message::new();
    m.header_put(9, 0);
    m.put_text(&"y".repeat(BUF_LEN * 2)).unwrap();
    m.reset();
    assert_eq!(m.words(), 0);
    assert_eq!(m.remaining(), 0);

    // The object is reusable after reset.
    m.header_put(1, 0);
    m.put_u64(5).unwrap();
    let mut out = transport(&mut m);
    assert_eq!(out.get_u64().unwrap(), 5);
}
