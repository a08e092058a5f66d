use super::*;

use crate::framing::{read_message, write_message};

async fn round_trip(message: serde_json::Value) -> serde_json::Value {
    let mut sink = std::io::Cursor::new(Vec::new());
    write_message(&mut sink, &message).await.expect("write");
    let buffer = sink.into_inner();
    let mut reader = buffer.as_slice();
    read_message(&mut reader).await.expect("read")
}

#[tokio::test]
async fn framed_messages_round_trip() {
    let request = json!({
        "jsonrpc": "2.0",
        "id": 7,
        "method": "textDocument/definition",
        "params": { "textDocument": { "uri": "file:///tmp/μ.rs" }, "position": { "line": 3, "character": 14 } },
    });
    assert_eq!(round_trip(request.clone()).await, request);

    let notification = json!({
        "jsonrpc": "2.0",
        "method": "initialized",
        "params": {},
    });
    assert_eq!(round_trip(notification.clone()).await, notification);
}

#[tokio::test]
async fn content_length_counts_bytes_not_chars() {
    let message = json!({ "jsonrpc": "2.0", "method": "window/logMessage", "params": { "message": "héllo ünïcode" } });
    let mut sink = std::io::Cursor::new(Vec::new());
    write_message(&mut sink, &message).await.expect("write");
    let buffer = sink.into_inner();

    let header_end = buffer.windows(4).position(|w| w == b"\r\n\r\n").expect("header break");
    let header = std::str::from_utf8(&buffer[..header_end]).expect("ascii header");
    let declared: usize = header
        .trim_start_matches("Content-Length:")
        .trim()
        .parse()
        .expect("length value");
    assert_eq!(declared, buffer.len() - header_end - 4);
}

#[tokio::test]
async fn unknown_headers_are_ignored() {
    let body = br#"{"jsonrpc":"2.0","method":"x"}"#;
    let mut framed = Vec::new();
    framed.extend_from_slice(b"Content-Type: application/vscode-jsonrpc; charset=utf-8\r\n");
    framed.extend_from_slice(format!("Content-Length: {}\r\n\r\n", body.len()).as_bytes());
    framed.extend_from_slice(body);

    let mut reader = framed.as_slice();
    let message = read_message(&mut reader).await.expect("read");
    assert_eq!(message, json!({ "jsonrpc": "2.0", "method": "x" }));
}

#[tokio::test]
async fn empty_stream_reads_as_eof() {
    let mut reader: &[u8] = &[];
    assert!(matches!(read_message(&mut reader).await, Err(Error::Eof)));
}

#[tokio::test]
async fn missing_content_length_is_a_protocol_error() {
    let mut reader: &[u8] = b"Content-Type: application/json\r\n\r\n{}";
    assert!(matches!(read_message(&mut reader).await, Err(Error::Protocol(_))));
}

#[tokio::test]
async fn truncated_body_is_a_protocol_error() {
    let mut reader: &[u8] = b"Content-Length: 50\r\n\r\n{\"jsonrpc\":\"2.0\"}";
    assert!(matches!(read_message(&mut reader).await, Err(Error::Protocol(_))));
}

#[tokio::test]
async fn oversized_content_length_is_rejected_before_allocation() {
    let mut reader: &[u8] = b"Content-Length: 999999999999\r\n\r\n";
    assert!(matches!(read_message(&mut reader).await, Err(Error::Protocol(_))));
}

#[tokio::test]
async fn malformed_json_body_is_a_protocol_error() {
    let mut reader: &[u8] = b"Content-Length: 4\r\n\r\nnope";
    assert!(matches!(read_message(&mut reader).await, Err(Error::Protocol(_))));
}

#[tokio::test]
async fn truncated_header_block_is_a_protocol_error() {
    let mut reader: &[u8] = b"Content-Length: 10\r\n";
    assert!(matches!(read_message(&mut reader).await, Err(Error::Protocol(_))));
}
