//! End-to-end client behaviour against a scripted Bayeux server.
//!
//! The scripted transports record what the worker sends and keep the
//! session's [`TransportLink`] so a test can answer as the server would.
//! Player commands and status queries go to a mockito JSON-RPC endpoint.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use serde_json::{json, Value};

use squeeze_comet::message::messages_from_value;
use squeeze_comet::{
    Delivery, Endpoint, ExchangeRegistry, ExchangeTimeouts, Message, MessageClass, MessageId,
    Transport, TransportError, TransportFactory, TransportKind, TransportLink,
};
use squeeze_sdk::{
    ClientConfig, ClientEvent, CometClient, ConnectionState, PlayerCommand, ServerConfig,
    SessionConfig, ShutdownHandler, StaticConfig, TransportBuilder,
};

const WAIT: Duration = Duration::from_secs(5);

#[derive(Default)]
struct Script {
    sent: Mutex<Vec<Message>>,
    links: Mutex<Vec<TransportLink>>,
    endpoints: Mutex<Vec<Endpoint>>,
}

impl Script {
    fn sent(&self) -> Vec<Message> {
        self.sent.lock().unwrap().clone()
    }

    fn builds(&self) -> Vec<Endpoint> {
        self.endpoints.lock().unwrap().clone()
    }

    /// Deliver `value` as if the server had sent it on the newest connection.
    fn reply(&self, value: Value) {
        let batch = messages_from_value(value).unwrap();
        let links = self.links.lock().unwrap();
        links.last().expect("no transport created").received(batch);
    }

    /// Answer `message` successfully.
    fn acknowledge(&self, message: &Message) {
        self.reply(json!([{
            "channel": message.channel(),
            "id": message.id.as_ref().unwrap().as_str(),
            "successful": true
        }]));
    }

    /// Give the worker time to act on anything already queued.
    fn settle(&self) {
        std::thread::sleep(Duration::from_millis(200));
    }

    fn wait_for_sent(&self, what: &str, matches: impl Fn(&Message) -> bool) -> Message {
        let deadline = Instant::now() + WAIT;
        loop {
            if let Some(message) = self.sent().into_iter().find(|m| matches(m)) {
                return message;
            }
            assert!(Instant::now() < deadline, "timed out waiting for {}", what);
            std::thread::sleep(Duration::from_millis(10));
        }
    }
}

struct ScriptedTransport {
    registry: ExchangeRegistry,
    script: Arc<Script>,
}

#[async_trait]
impl Transport for ScriptedTransport {
    fn kind(&self) -> TransportKind {
        TransportKind::Request
    }

    async fn send(
        &mut self,
        batch: Vec<Message>,
        timeouts: &ExchangeTimeouts,
    ) -> squeeze_comet::Result<Vec<Delivery>> {
        for message in batch {
            self.registry.register(message.clone(), timeouts.for_message(&message))?;
            self.script.sent.lock().unwrap().push(message);
        }
        Ok(Vec::new())
    }

    fn on_received(&mut self, batch: Vec<Message>) -> Vec<Delivery> {
        batch
            .into_iter()
            .filter_map(|message| self.registry.correlate(message))
            .collect()
    }

    fn on_failed(&mut self, error: TransportError, batch: Vec<Message>) -> Vec<Delivery> {
        batch
            .iter()
            .filter_map(|m| m.id.as_ref())
            .filter_map(|id| self.registry.fail(id, &error))
            .collect()
    }

    fn on_expired(&mut self, id: &MessageId) -> Vec<Delivery> {
        self.registry.expire(id).into_iter().collect()
    }

    fn abort(&mut self) -> Vec<Delivery> {
        self.registry.fail_all(&TransportError::Aborted)
    }

    fn pending(&self) -> usize {
        self.registry.len()
    }
}

struct ScriptedFactory {
    script: Arc<Script>,
}

impl TransportFactory for ScriptedFactory {
    fn create(&self, kind: TransportKind, link: TransportLink) -> Option<Box<dyn Transport>> {
        if kind == TransportKind::Streaming {
            return None;
        }
        self.script.links.lock().unwrap().push(link.clone());
        Some(Box::new(ScriptedTransport {
            registry: ExchangeRegistry::new(link),
            script: Arc::clone(&self.script),
        }))
    }
}

struct ScriptedTransports {
    script: Arc<Script>,
}

impl TransportBuilder for ScriptedTransports {
    fn build(&self, endpoint: Endpoint, _streaming: bool) -> Box<dyn TransportFactory> {
        self.script.endpoints.lock().unwrap().push(endpoint);
        Box::new(ScriptedFactory {
            script: Arc::clone(&self.script),
        })
    }
}

#[derive(Default)]
struct RecordingShutdown {
    requested: AtomicBool,
}

impl ShutdownHandler for RecordingShutdown {
    fn surfaces_active(&self) -> bool {
        false
    }

    fn request_shutdown(&self) {
        self.requested.store(true, Ordering::SeqCst);
    }
}

fn client_config() -> ClientConfig {
    ClientConfig::new()
        .with_worker_threads(2)
        .with_session(SessionConfig::default().with_app_namespace("app").with_streaming(false))
}

fn server_for(server: &mockito::Server) -> ServerConfig {
    let address = server.host_with_port();
    let (host, port) = address.rsplit_once(':').unwrap();
    ServerConfig::new(host).with_port(port.parse().unwrap())
}

/// Opt-in log output, e.g. `RUST_LOG=squeeze_sdk=debug cargo test`.
fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

fn scripted_client(provider: Arc<StaticConfig>, config: ClientConfig) -> (CometClient, Arc<Script>) {
    init_tracing();
    let script = Arc::new(Script::default());
    let client = CometClient::builder(provider)
        .with_config(config)
        .with_transports(Arc::new(ScriptedTransports {
            script: Arc::clone(&script),
        }))
        .build()
        .unwrap();
    (client, script)
}

/// Connect and complete the handshake as client `abc`.
fn establish(client: &CometClient, script: &Script) {
    client.connect().unwrap();
    let handshake = script.wait_for_sent("handshake", |m| m.class() == MessageClass::Handshake);
    script.reply(json!([{
        "channel": "/meta/handshake",
        "id": handshake.id.unwrap().as_str(),
        "successful": true,
        "clientId": "abc"
    }]));
    script.wait_for_sent("broadcast subscribe", |m| {
        m.subscription.as_deref() == Some("/abc/app/playerstatus/*")
    });
}

fn wait_for_event(client: &CometClient, what: &str, matches: impl Fn(&ClientEvent) -> bool) -> ClientEvent {
    let events = client.iter();
    let deadline = Instant::now() + WAIT;
    while Instant::now() < deadline {
        if let Some(event) = events.recv_timeout(Duration::from_millis(50)) {
            if matches(&event) {
                return event;
            }
        }
    }
    panic!("timed out waiting for {}", what);
}

fn is_subscribe_for(message: &Message, player: &str) -> bool {
    message.channel.as_deref() == Some("/app/subscribe")
        && message.data.as_ref().and_then(|d| d.get("response")).and_then(Value::as_str)
            == Some(format!("/abc/app/playerstatus/{}", player).as_str())
}

fn is_unsubscribe_for(message: &Message, player: &str) -> bool {
    message.channel.as_deref() == Some("/app/unsubscribe")
        && message.data.as_ref().and_then(|d| d.get("unsubscribe")).and_then(Value::as_str)
            == Some(format!("/abc/app/playerstatus/{}", player).as_str())
}

#[test]
fn test_status_push_end_to_end() {
    let mut server = mockito::Server::new();
    let status_query = server
        .mock("POST", "/jsonrpc.js")
        .match_body(mockito::Matcher::PartialJson(json!({
            "params": ["p1", ["status", "-", "1", "tags:acdlJKNx"]]
        })))
        .with_status(200)
        .with_header("content-type", "application/json")
        .with_body(r#"{"id":1,"method":"slim.request","result":{"mode":"stop","playlist_loop":[]}}"#)
        .create();

    let provider = Arc::new(StaticConfig::new(server_for(&server)));
    let (client, script) = scripted_client(provider, client_config());

    establish(&client, &script);
    wait_for_event(&client, "connected", |e| {
        *e == ClientEvent::ConnectionState(ConnectionState::ConnectionCompleted)
    });
    assert_eq!(client.connection_state(), ConnectionState::ConnectionCompleted);

    client.set_player("p1").unwrap();
    let subscribe = script.wait_for_sent("player subscribe", |m| is_subscribe_for(m, "p1"));
    assert_eq!(subscribe.data.as_ref().unwrap()["request"][0], json!("p1"));

    script.reply(json!([{
        "channel": "/app/subscribe",
        "id": subscribe.id.unwrap().as_str(),
        "successful": true
    }]));

    // The one-shot status query after subscribing gives the first snapshot
    let initial = wait_for_event(&client, "initial status", |e| matches!(e, ClientEvent::Status(_)));
    if let ClientEvent::Status(status) = initial {
        assert_eq!(status.id, "p1");
        assert!(!status.is_playing);
    }
    status_query.assert();

    script.reply(json!([{
        "channel": "/abc/app/playerstatus/p1",
        "data": {
            "mode": "play",
            "time": 30.2,
            "playlist_loop": [{"title": "So What", "duration": 180.5}]
        }
    }]));

    let pushed = wait_for_event(&client, "pushed status", |e| {
        matches!(e, ClientEvent::Status(status) if status.is_playing)
    });
    let ClientEvent::Status(status) = pushed else {
        unreachable!()
    };
    assert_eq!(status.id, "p1");
    assert_eq!(status.position_ms, 30_200);
    assert_eq!(status.duration_ms, 180_500);
    assert_eq!(status.title, "So What");
}

fn count_sent(script: &Script, matches: impl Fn(&Message) -> bool) -> usize {
    script.sent().iter().filter(|m| matches(m)).count()
}

#[test]
fn test_quick_player_switch() {
    let provider = Arc::new(StaticConfig::new(ServerConfig::new("127.0.0.1").with_port(9)));
    let (client, script) = scripted_client(provider, client_config());
    establish(&client, &script);

    client.set_player("A").unwrap();
    client.set_player("B").unwrap();
    let subscribe_a = script.wait_for_sent("subscribe A", |m| is_subscribe_for(m, "A"));

    // Nothing overtakes the subscribe while it is unanswered
    script.settle();
    assert_eq!(count_sent(&script, |m| is_unsubscribe_for(m, "A")), 0);
    assert_eq!(count_sent(&script, |m| is_subscribe_for(m, "B")), 0);

    script.acknowledge(&subscribe_a);
    let unsubscribe_a = script.wait_for_sent("unsubscribe A", |m| is_unsubscribe_for(m, "A"));
    script.settle();
    assert_eq!(count_sent(&script, |m| is_subscribe_for(m, "B")), 0);

    script.acknowledge(&unsubscribe_a);
    script.wait_for_sent("subscribe B", |m| is_subscribe_for(m, "B"));

    assert_eq!(count_sent(&script, |m| is_subscribe_for(m, "A")), 1);
    assert_eq!(count_sent(&script, |m| is_unsubscribe_for(m, "A")), 1);
    assert_eq!(count_sent(&script, |m| is_subscribe_for(m, "B")), 1);
}

#[test]
fn test_switching_back_cancels_queued_changes() {
    let mut server = mockito::Server::new();
    let status_query = server
        .mock("POST", "/jsonrpc.js")
        .match_body(mockito::Matcher::PartialJson(json!({
            "params": ["A", ["status", "-", "1", "tags:acdlJKNx"]]
        })))
        .with_status(200)
        .with_header("content-type", "application/json")
        .with_body(r#"{"id":1,"method":"slim.request","result":{"mode":"pause"}}"#)
        .create();

    let provider = Arc::new(StaticConfig::new(server_for(&server)));
    let (client, script) = scripted_client(provider, client_config());
    establish(&client, &script);

    client.set_player("A").unwrap();
    client.set_player("B").unwrap();
    client.set_player("A").unwrap();
    let subscribe_a = script.wait_for_sent("subscribe A", |m| is_subscribe_for(m, "A"));
    script.settle();
    script.acknowledge(&subscribe_a);

    wait_for_event(&client, "status of A", |e| {
        matches!(e, ClientEvent::Status(status) if status.id == "A")
    });
    status_query.assert();

    script.settle();
    assert_eq!(count_sent(&script, |m| is_subscribe_for(m, "A")), 1);
    assert_eq!(count_sent(&script, |m| is_unsubscribe_for(m, "A")), 0);
    assert_eq!(count_sent(&script, |m| is_subscribe_for(m, "B")), 0);
}

#[test]
fn test_same_player_is_not_resubscribed() {
    let provider = Arc::new(StaticConfig::new(ServerConfig::new("127.0.0.1").with_port(9)));
    let (client, script) = scripted_client(provider, client_config());
    establish(&client, &script);

    client.set_player("A").unwrap();
    client.set_player("A").unwrap();
    let subscribe_a = script.wait_for_sent("subscribe A", |m| is_subscribe_for(m, "A"));
    script.acknowledge(&subscribe_a);

    client.set_player("B").unwrap();
    let unsubscribe_a = script.wait_for_sent("unsubscribe A", |m| is_unsubscribe_for(m, "A"));
    script.acknowledge(&unsubscribe_a);
    script.wait_for_sent("subscribe B", |m| is_subscribe_for(m, "B"));

    assert_eq!(count_sent(&script, |m| is_subscribe_for(m, "A")), 1);
    assert_eq!(count_sent(&script, |m| is_unsubscribe_for(m, "A")), 1);
}

#[test]
fn test_fatal_handshake_requests_shutdown() {
    let script = Arc::new(Script::default());
    let shutdown = Arc::new(RecordingShutdown::default());
    let config = client_config().with_session(
        SessionConfig::default()
            .with_app_namespace("app")
            .with_streaming(false)
            .with_max_handshake_failures(1),
    );
    let client = CometClient::builder(Arc::new(StaticConfig::new(ServerConfig::new("127.0.0.1"))))
        .with_config(config)
        .with_shutdown_handler(shutdown.clone())
        .with_transports(Arc::new(ScriptedTransports {
            script: Arc::clone(&script),
        }))
        .build()
        .unwrap();

    client.connect().unwrap();
    let handshake = script.wait_for_sent("handshake", |m| m.class() == MessageClass::Handshake);
    script.reply(json!([{
        "channel": "/meta/handshake",
        "id": handshake.id.unwrap().as_str(),
        "successful": false,
        "error": "403::denied"
    }]));

    wait_for_event(&client, "connection failed", |e| {
        *e == ClientEvent::ConnectionState(ConnectionState::ConnectionFailed)
    });
    let deadline = Instant::now() + WAIT;
    while !shutdown.requested.load(Ordering::SeqCst) {
        assert!(Instant::now() < deadline, "shutdown was never requested");
        std::thread::sleep(Duration::from_millis(10));
    }
}

#[test]
fn test_reconnect_if_changed() {
    let provider = Arc::new(StaticConfig::new(ServerConfig::new("10.0.0.1")));
    let (client, script) = scripted_client(Arc::clone(&provider), client_config());

    client.connect().unwrap();
    script.wait_for_sent("handshake", |m| m.class() == MessageClass::Handshake);

    // Nothing changed, so nothing happens
    client.reconnect_if_changed().unwrap();

    provider.replace(ServerConfig::new("10.0.0.2"));
    client.reconnect_if_changed().unwrap();

    let deadline = Instant::now() + WAIT;
    while script.builds().len() < 2 {
        assert!(Instant::now() < deadline, "client never reconnected");
        std::thread::sleep(Duration::from_millis(10));
    }
    let hosts: Vec<String> = script.builds().iter().map(|e| e.host().to_string()).collect();
    assert_eq!(hosts, vec!["10.0.0.1", "10.0.0.2"]);
}

#[test]
fn test_publish_command_result() {
    let mut server = mockito::Server::new();
    let play = server
        .mock("POST", "/jsonrpc.js")
        .match_body(mockito::Matcher::PartialJson(json!({
            "method": "slim.request",
            "params": ["p1", ["play"]]
        })))
        .with_status(200)
        .with_header("content-type", "application/json")
        .with_body(r#"{"id":1,"method":"slim.request","params":["p1",["play"]],"result":{}}"#)
        .create();

    let provider = Arc::new(StaticConfig::new(server_for(&server)));
    let (client, _script) = scripted_client(provider, client_config());

    client.publish(PlayerCommand::Play, "p1").unwrap();
    let event = wait_for_event(&client, "command result", |e| {
        matches!(e, ClientEvent::CommandResult { .. })
    });
    assert_eq!(
        event,
        ClientEvent::CommandResult {
            player: "p1".to_string(),
            command: PlayerCommand::Play,
            result: Ok(json!({})),
        }
    );
    play.assert();
}

#[test]
fn test_manual_disconnect() {
    let provider = Arc::new(StaticConfig::new(ServerConfig::new("127.0.0.1").with_port(9)));
    let (client, script) = scripted_client(provider, client_config());
    establish(&client, &script);

    client.disconnect().unwrap();
    script.wait_for_sent("disconnect", |m| m.class() == MessageClass::Disconnect);
    wait_for_event(&client, "manual disconnect", |e| {
        *e == ClientEvent::ConnectionState(ConnectionState::ManualDisconnect)
    });
}

#[test]
fn test_unusable_server_fails_connection() {
    let provider = Arc::new(StaticConfig::new(ServerConfig::new("bad host")));
    let (client, script) = scripted_client(provider, client_config());

    client.connect().unwrap();
    wait_for_event(&client, "connection failed", |e| {
        *e == ClientEvent::ConnectionState(ConnectionState::ConnectionFailed)
    });
    assert!(script.builds().is_empty());
}
