use std::time::Duration;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::time::timeout;

pub async fn bind() -> (TcpListener, String) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let url = format!("http://{}", listener.local_addr().unwrap());
    (listener, url)
}

/// reads one full request (head plus `content-length` body) off the socket
pub async fn read_request(stream: &mut TcpStream) -> String {
    let mut request = Vec::new();
    let mut buffer = [0; 1024];

    let head_end = loop {
        let read = stream.read(&mut buffer).await.unwrap();
        assert!(read > 0, "connection closed before a full request head");
        request.extend_from_slice(&buffer[..read]);

        if let Some(index) = find(&request, b"\r\n\r\n") {
            break index + 4;
        }
    };

    let head = String::from_utf8_lossy(&request[..head_end]).into_owned();
    let total = head_end + content_length(&head);

    while request.len() < total {
        let read = stream.read(&mut buffer).await.unwrap();
        assert!(read > 0, "connection closed before a full request body");
        request.extend_from_slice(&buffer[..read]);
    }

    String::from_utf8_lossy(&request[..total]).into_owned()
}

pub async fn write_response(stream: &mut TcpStream, status: &str, content_type: &str, body: &str) {
    let response = format!(
        "HTTP/1.1 {status}\r\ncontent-type: {content_type}\r\ncontent-length: {}\r\nconnection: close\r\n\r\n{body}",
        body.len()
    );
    write_raw(stream, response.as_bytes()).await;
}

/// response head for a stream delimited by connection close
pub async fn write_event_stream_head(stream: &mut TcpStream) {
    write_raw(
        stream,
        b"HTTP/1.1 200 OK\r\ncontent-type: text/event-stream\r\nconnection: close\r\n\r\n",
    )
    .await;
}

/// response head for a `transfer-encoding: chunked` stream, so closing the
/// socket early registers as a truncated body instead of a clean end
pub async fn write_chunked_event_stream_head(stream: &mut TcpStream) {
    write_raw(
        stream,
        b"HTTP/1.1 200 OK\r\ncontent-type: text/event-stream\r\ntransfer-encoding: chunked\r\nconnection: close\r\n\r\n",
    )
    .await;
}

pub async fn write_event(stream: &mut TcpStream, event: &str) {
    write_raw(stream, format!("data: {event}\n\n").as_bytes()).await;
}

pub async fn write_chunk(stream: &mut TcpStream, data: &str) {
    write_raw(stream, format!("{:x}\r\n{data}\r\n", data.len()).as_bytes()).await;
}

pub async fn write_raw(stream: &mut TcpStream, bytes: &[u8]) {
    stream.write_all(bytes).await.unwrap();
    stream.flush().await.unwrap();
}

/// asserts the peer tore the connection down instead of leaving it open
pub async fn expect_disconnect(stream: &mut TcpStream) {
    let mut buffer = [0; 64];

    match timeout(Duration::from_secs(5), stream.read(&mut buffer)).await {
        Ok(Ok(0) | Err(_)) => {}
        Ok(Ok(read)) => panic!("expected a closed connection, read {read} more bytes"),
        Err(_) => panic!("peer left the connection open"),
    }
}

pub fn content_length(head: &str) -> usize {
    head.lines()
        .find_map(|line| {
            let (name, value) = line.split_once(':')?;
            if name.eq_ignore_ascii_case("content-length") {
                value.trim().parse().ok()
            } else {
                None
            }
        })
        .unwrap_or(0)
}

fn find(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    haystack.windows(needle.len()).position(|window| window == needle)
}
