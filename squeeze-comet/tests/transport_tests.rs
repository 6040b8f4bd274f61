//! Transports against real sockets: a hand-rolled chunked HTTP server for the
//! streaming transport and mockito for the request transport.

use std::time::Duration;

use serde_json::json;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;

use squeeze_comet::{
    Delivery, Endpoint, ExchangeTimeouts, Inbound, Message, MessageId, RequestTransport,
    StreamingTransport, Transport, TransportError, TransportKind, TransportLink,
};

/// Mock server that answers the first request on a connection with a chunked
/// response whose body is split at awkward places.
struct ChunkedMockServer {
    listener: TcpListener,
}

impl ChunkedMockServer {
    async fn new() -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        Self { listener }
    }

    fn url(&self) -> String {
        format!("http://{}/cometd", self.listener.local_addr().unwrap())
    }

    /// Accept one connection, read one request, reply with `chunks`, then
    /// close the socket once `close` resolves.
    fn serve(self, chunks: Vec<String>, close: tokio::sync::oneshot::Receiver<()>) -> tokio::sync::oneshot::Receiver<String> {
        let (request_tx, request_rx) = tokio::sync::oneshot::channel();
        tokio::spawn(async move {
            let (mut stream, _) = self.listener.accept().await.unwrap();
            let request = read_request(&mut stream).await;
            let _ = request_tx.send(request);

            stream
                .write_all(b"HTTP/1.1 200 OK\r\nContent-Type: application/json\r\nTransfer-Encoding: chunked\r\n\r\n")
                .await
                .unwrap();
            for chunk in chunks {
                let frame = format!("{:x}\r\n{}\r\n", chunk.len(), chunk);
                stream.write_all(frame.as_bytes()).await.unwrap();
                stream.flush().await.unwrap();
                tokio::time::sleep(Duration::from_millis(10)).await;
            }

            let _ = close.await;
        });
        request_rx
    }
}

async fn read_request(stream: &mut TcpStream) -> String {
    let mut buffer = Vec::new();
    let mut chunk = [0u8; 1024];
    loop {
        let n = stream.read(&mut chunk).await.unwrap();
        buffer.extend_from_slice(&chunk[..n]);
        let text = String::from_utf8_lossy(&buffer).to_string();
        if let Some((head, body)) = text.split_once("\r\n\r\n") {
            let length = head
                .lines()
                .find_map(|line| line.strip_prefix("Content-Length: "))
                .and_then(|value| value.trim().parse::<usize>().ok())
                .unwrap_or(0);
            if body.len() >= length {
                return text;
            }
        }
        if n == 0 {
            return text;
        }
    }
}

fn link(kind: TransportKind) -> (TransportLink, mpsc::UnboundedReceiver<Inbound>) {
    let (tx, rx) = mpsc::unbounded_channel();
    (TransportLink::new(7, kind, tx), rx)
}

fn timeouts() -> ExchangeTimeouts {
    ExchangeTimeouts::new(Duration::from_secs(10), None)
}

#[tokio::test]
async fn test_streaming_handshake_over_split_chunks() {
    let server = ChunkedMockServer::new().await;
    let endpoint = Endpoint::new(&server.url(), "slim").unwrap();
    let (close_tx, close_rx) = tokio::sync::oneshot::channel();
    let request_rx = server.serve(
        vec![
            r#"[{"channel":"/meta/handshake","#.to_string(),
            r#""id":"1","successful":true,"clientId":"abc"}]"#.to_string(),
        ],
        close_rx,
    );

    let (link, mut rx) = link(TransportKind::Streaming);
    let mut transport = StreamingTransport::new(endpoint, link);
    let handshake = Message::handshake(MessageId::from(1), &["streaming"]);
    let immediate = transport.send(vec![handshake], &timeouts()).await.unwrap();
    assert!(immediate.is_empty());
    assert!(transport.is_open());

    let request = request_rx.await.unwrap();
    assert!(request.starts_with("POST /cometd HTTP/1.1\r\n"));
    assert!(request.contains(r#""channel":"/meta/handshake""#));

    let batch = match rx.recv().await.unwrap() {
        Inbound::Received {
            generation, batch, ..
        } => {
            assert_eq!(generation, 7);
            batch
        }
        other => panic!("expected received batch, got {:?}", other),
    };
    match transport.on_received(batch).as_slice() {
        [Delivery::Reply { reply, .. }] => {
            assert!(reply.is_successful());
            assert_eq!(reply.client_id.as_deref(), Some("abc"));
        }
        other => panic!("expected handshake reply, got {:?}", other),
    }
    assert_eq!(transport.pending(), 0);

    // Closing the socket fails whatever is still outstanding
    let connect = Message::connect(MessageId::from(2), "abc", "streaming");
    transport.send(vec![connect], &timeouts()).await.unwrap();
    assert_eq!(transport.pending(), 1);
    close_tx.send(()).unwrap();

    match rx.recv().await.unwrap() {
        Inbound::Failed { error, .. } => {
            assert_eq!(error, TransportError::Closed);
            let failed = transport.on_failed(error, Vec::new());
            assert_eq!(failed.len(), 1);
            assert!(!transport.is_open());
        }
        other => panic!("expected failure, got {:?}", other),
    }
}

#[tokio::test]
async fn test_streaming_drops_second_connect() {
    let server = ChunkedMockServer::new().await;
    let endpoint = Endpoint::new(&server.url(), "slim").unwrap();
    let (_close_tx, close_rx) = tokio::sync::oneshot::channel();
    let _request_rx = server.serve(Vec::new(), close_rx);

    let (link, _rx) = link(TransportKind::Streaming);
    let mut transport = StreamingTransport::new(endpoint, link);
    let first = Message::connect(MessageId::from(1), "abc", "streaming");
    let second = Message::connect(MessageId::from(2), "abc", "streaming");

    transport.send(vec![first], &timeouts()).await.unwrap();
    let dropped = transport.send(vec![second], &timeouts()).await.unwrap();
    assert!(dropped.is_empty());
    assert_eq!(transport.pending(), 1);
}

#[tokio::test]
async fn test_streaming_connect_refused_fails_batch() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let url = format!("http://{}/cometd", listener.local_addr().unwrap());
    drop(listener);

    let endpoint = Endpoint::new(&url, "slim").unwrap();
    let (link, _rx) = link(TransportKind::Streaming);
    let mut transport = StreamingTransport::new(endpoint, link);

    let handshake = Message::handshake(MessageId::from(1), &["streaming"]);
    let failed = transport.send(vec![handshake], &timeouts()).await.unwrap();
    match failed.as_slice() {
        [Delivery::Reply { reply, .. }] => {
            assert!(matches!(reply.failure, Some(TransportError::Connect(_))));
        }
        other => panic!("expected failure reply, got {:?}", other),
    }
    assert_eq!(transport.pending(), 0);
}

#[tokio::test]
async fn test_request_transport_posts_to_meta_path() {
    let mut server = mockito::Server::new_async().await;
    let mock = server
        .mock("POST", "/cometd/handshake")
        .match_header("content-type", "application/json;charset=UTF-8")
        .with_status(200)
        .with_body(r#"[{"channel":"/meta/handshake","id":1,"successful":true,"clientId":"abc"}]"#)
        .create_async()
        .await;

    let endpoint = Endpoint::new(&format!("{}/cometd", server.url()), "slim").unwrap();
    let (link, mut rx) = link(TransportKind::Request);
    let client = reqwest::Client::new();
    let mut transport = RequestTransport::new(endpoint, client, link);

    let handshake = Message::handshake(MessageId::from(1), &["long-polling"]);
    transport.send(vec![handshake], &timeouts()).await.unwrap();

    let batch = match rx.recv().await.unwrap() {
        Inbound::Received { batch, .. } => batch,
        other => panic!("expected received batch, got {:?}", other),
    };
    let deliveries = transport.on_received(batch);
    assert!(matches!(
        deliveries.as_slice(),
        [Delivery::Reply { reply, .. }] if reply.client_id.as_deref() == Some("abc")
    ));
    mock.assert_async().await;
}

#[tokio::test]
async fn test_request_transport_empty_body_is_no_content() {
    let mut server = mockito::Server::new_async().await;
    let _mock = server
        .mock("POST", "/cometd")
        .with_status(200)
        .with_body("")
        .create_async()
        .await;

    let endpoint = Endpoint::new(&format!("{}/cometd", server.url()), "slim").unwrap();
    let (link, mut rx) = link(TransportKind::Request);
    let mut transport = RequestTransport::new(endpoint, reqwest::Client::new(), link);

    let publish = Message::publish(MessageId::from(3), "abc", "/slim/request", json!({}));
    transport.send(vec![publish], &timeouts()).await.unwrap();

    match rx.recv().await.unwrap() {
        Inbound::Failed { error, batch, .. } => {
            assert_eq!(error, TransportError::NoContent);
            let failed = transport.on_failed(error, batch);
            assert_eq!(failed.len(), 1);
        }
        other => panic!("expected failure, got {:?}", other),
    }
    assert_eq!(transport.pending(), 0);
}

#[tokio::test]
async fn test_request_transport_non_200_status() {
    let mut server = mockito::Server::new_async().await;
    let _mock = server
        .mock("POST", "/cometd")
        .with_status(503)
        .create_async()
        .await;

    let endpoint = Endpoint::new(&format!("{}/cometd", server.url()), "slim").unwrap();
    let (link, mut rx) = link(TransportKind::Request);
    let mut transport = RequestTransport::new(endpoint, reqwest::Client::new(), link);

    let publish = Message::publish(MessageId::from(4), "abc", "/slim/request", json!({}));
    transport.send(vec![publish], &timeouts()).await.unwrap();

    assert!(matches!(
        rx.recv().await,
        Some(Inbound::Failed {
            error: TransportError::Status(503),
            ..
        })
    ));
}
