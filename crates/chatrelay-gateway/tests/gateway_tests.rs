//! End-to-end tests: real gateway on a loopback port, WebSocket clients,
//! and a mocked identity provider.

use chatrelay_core::{ConnectionLimits, GatewayConfig, Notice, TransportConfig};
use chatrelay_gateway::auth::{AuthGate, TokenVerifier};
use chatrelay_gateway::hub::Hub;
use chatrelay_gateway::identity::HttpIdentityProvider;
use chatrelay_gateway::{serve, GatewayState};
use futures::{SinkExt, StreamExt};
use jsonwebtoken::{Algorithm, EncodingKey, Header};
use serde_json::{json, Value};
use std::collections::VecDeque;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream};
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use wiremock::matchers::{header, method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

const PUBLIC_KEY: &[u8] = include_bytes!("fixtures/rsa_public.pem");
const PRIVATE_KEY: &[u8] = include_bytes!("fixtures/rsa_private.pem");
const FOREIGN_KEY: &[u8] = include_bytes!("fixtures/rsa_other_private.pem");

// ===========================================================================
// Harness
// ===========================================================================

fn sign(private: &[u8], sub: &str) -> String {
    let key = EncodingKey::from_rsa_pem(private).unwrap();
    jsonwebtoken::encode(&Header::new(Algorithm::RS256), &json!({ "sub": sub }), &key).unwrap()
}

async fn identity_provider(accounts: &[(&str, &str)]) -> MockServer {
    let server = MockServer::start().await;
    for (subject, nickname) in accounts {
        Mock::given(method("GET"))
            .and(path(format!("/accounts/{subject}")))
            .and(header("authorization", format!("Bearer {}", sign(PRIVATE_KEY, subject)).as_str()))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "id": subject,
                "nickname": nickname,
            })))
            .mount(&server)
            .await;
    }
    server
}

async fn start_gateway(idp: &MockServer, limits: ConnectionLimits) -> SocketAddr {
    let config = GatewayConfig {
        limits,
        ..GatewayConfig::default()
    };
    start_gateway_with(idp, config).await
}

async fn start_gateway_with(idp: &MockServer, config: GatewayConfig) -> SocketAddr {
    let verifier = TokenVerifier::from_pem(PUBLIC_KEY).unwrap();
    let provider = HttpIdentityProvider::new(idp.uri(), Duration::from_secs(2)).unwrap();
    let state = Arc::new(GatewayState::new(
        Hub::spawn(),
        AuthGate::new(verifier, Arc::new(provider)),
        &config,
    ));
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(serve(listener, state));
    addr
}

async fn live_connections(health_url: &str) -> u64 {
    let body: Value = reqwest::get(health_url).await.unwrap().json().await.unwrap();
    body["connections"].as_u64().unwrap()
}

struct Client {
    ws: WebSocketStream<MaybeTlsStream<TcpStream>>,
    pending: VecDeque<Value>,
}

impl Client {
    async fn connect(addr: SocketAddr) -> Self {
        let (ws, _) = connect_async(format!("ws://{addr}/chat"))
            .await
            .expect("WebSocket connect failed");
        Self {
            ws,
            pending: VecDeque::new(),
        }
    }

    async fn send(&mut self, value: Value) {
        self.ws.send(Message::Text(value.to_string())).await.unwrap();
    }

    /// Next JSON document; coalesced frames are split on newlines.
    async fn recv(&mut self) -> Value {
        loop {
            if let Some(value) = self.pending.pop_front() {
                return value;
            }
            let next = tokio::time::timeout(Duration::from_secs(3), self.ws.next())
                .await
                .expect("timed out waiting for a frame");
            match next {
                Some(Ok(Message::Text(text))) => {
                    for line in text.split('\n') {
                        self.pending.push_back(serde_json::from_str(line).unwrap());
                    }
                }
                Some(Ok(Message::Ping(_))) | Some(Ok(Message::Pong(_))) => {}
                other => panic!("expected a text frame, got {other:?}"),
            }
        }
    }

    async fn expect_notice(&mut self, notice: Notice) {
        let expected: Value = serde_json::from_str(notice.as_str()).unwrap();
        assert_eq!(self.recv().await, expected);
    }

    /// Keeps reading (and so answering pings) for `period`; fails on any text.
    async fn expect_silence(&mut self, period: Duration) {
        assert!(self.pending.is_empty(), "unexpected {:?}", self.pending);
        let deadline = tokio::time::Instant::now() + period;
        loop {
            match tokio::time::timeout_at(deadline, self.ws.next()).await {
                Err(_) => return,
                Ok(Some(Ok(Message::Ping(_)))) | Ok(Some(Ok(Message::Pong(_)))) => {}
                Ok(other) => panic!("expected silence, got {other:?}"),
            }
        }
    }

    /// True if the server closes the connection within `within`.
    async fn closed_within(&mut self, within: Duration) -> bool {
        let deadline = tokio::time::Instant::now() + within;
        loop {
            match tokio::time::timeout_at(deadline, self.ws.next()).await {
                Err(_) => return false,
                Ok(None) | Ok(Some(Err(_))) | Ok(Some(Ok(Message::Close(_)))) => return true,
                Ok(Some(Ok(_))) => {}
            }
        }
    }

    async fn login(&mut self, subject: &str) {
        self.send(json!({ "action": "login", "token": sign(PRIVATE_KEY, subject) }))
            .await;
        self.expect_notice(Notice::TokenValid).await;
        self.expect_notice(Notice::Connected).await;
    }
}

// ===========================================================================
// Login and broadcast
// ===========================================================================

#[tokio::test]
async fn bad_login_then_good_login_then_broadcast() {
    let idp = identity_provider(&[("user-1", "alice"), ("user-2", "bob")]).await;
    let addr = start_gateway(&idp, ConnectionLimits::default()).await;

    let mut alice = Client::connect(addr).await;
    let mut bob = Client::connect(addr).await;
    bob.login("user-2").await;

    alice
        .send(json!({ "action": "login", "token": sign(FOREIGN_KEY, "user-1") }))
        .await;
    alice.expect_notice(Notice::TokenInvalid).await;

    alice.login("user-1").await;

    let before = chrono::Utc::now().timestamp();
    alice
        .send(json!({
            "action": "message",
            "message": "hi",
            "channel": "general",
            "nickname": "mallory",
            "timestamp": 42
        }))
        .await;

    for client in [&mut alice, &mut bob] {
        let got = client.recv().await;
        assert_eq!(got["action"], "message");
        assert_eq!(got["message"], "hi");
        assert_eq!(got["channel"], "general");
        assert_eq!(got["nickname"], "alice");
        let ts = got["timestamp"].as_i64().unwrap();
        assert!(ts >= before && ts <= chrono::Utc::now().timestamp());
        assert!(got.get("token").is_none());
    }
}

#[tokio::test]
async fn unauthenticated_message_is_not_relayed() {
    let idp = identity_provider(&[("user-2", "bob")]).await;
    let addr = start_gateway(&idp, ConnectionLimits::default()).await;

    let mut bob = Client::connect(addr).await;
    bob.login("user-2").await;

    let mut carol = Client::connect(addr).await;
    carol
        .send(json!({ "action": "message", "message": "sneaky", "channel": "general" }))
        .await;
    carol.expect_notice(Notice::AuthRequired).await;
    bob.expect_silence(Duration::from_millis(300)).await;

    // Connection is still usable.
    carol.send(json!({ "action": "message" })).await;
    carol.expect_notice(Notice::AuthRequired).await;
}

#[tokio::test]
async fn failed_lookup_leaves_connection_unauthenticated() {
    let idp = MockServer::start().await;
    Mock::given(method("GET"))
        .respond_with(ResponseTemplate::new(403))
        .mount(&idp)
        .await;
    let addr = start_gateway(&idp, ConnectionLimits::default()).await;

    let mut client = Client::connect(addr).await;
    client
        .send(json!({ "action": "login", "token": sign(PRIVATE_KEY, "user-1") }))
        .await;
    client.expect_notice(Notice::TokenValid).await;
    client.expect_notice(Notice::LoginUnsuccessful).await;

    client.send(json!({ "action": "message", "message": "hi" })).await;
    client.expect_notice(Notice::AuthRequired).await;
}

#[tokio::test]
async fn authenticated_client_must_choose_valid_action() {
    let idp = identity_provider(&[("user-1", "alice")]).await;
    let addr = start_gateway(&idp, ConnectionLimits::default()).await;

    let mut alice = Client::connect(addr).await;
    alice.login("user-1").await;
    alice
        .send(json!({ "action": "login", "token": sign(PRIVATE_KEY, "user-1") }))
        .await;
    alice.expect_notice(Notice::InvalidAction).await;
    alice.ws.send(Message::Text("garbage".into())).await.unwrap();
    alice.expect_notice(Notice::InvalidAction).await;
}

#[tokio::test]
async fn messages_from_one_sender_arrive_in_order() {
    let idp = identity_provider(&[("user-1", "alice"), ("user-2", "bob")]).await;
    let addr = start_gateway(&idp, ConnectionLimits::default()).await;

    let mut alice = Client::connect(addr).await;
    let mut bob = Client::connect(addr).await;
    alice.login("user-1").await;
    bob.login("user-2").await;

    for i in 0..20 {
        alice
            .send(json!({ "action": "message", "message": format!("m{i}"), "channel": "c" }))
            .await;
    }
    for i in 0..20 {
        assert_eq!(bob.recv().await["message"], format!("m{i}"));
    }
}

#[tokio::test]
async fn stalled_client_is_dropped_while_others_keep_receiving() {
    let idp = identity_provider(&[("user-1", "alice"), ("user-2", "bob")]).await;
    let config = GatewayConfig {
        limits: ConnectionLimits {
            queue_capacity: 2,
            max_message_size: 64 * 1024,
            write_wait: Duration::from_millis(500),
            ..ConnectionLimits::default()
        },
        transport: TransportConfig {
            max_frame_size: 64 * 1024,
            ..TransportConfig::default()
        },
        ..GatewayConfig::default()
    };
    let addr = start_gateway_with(&idp, config).await;
    let health = format!("http://{addr}/health");

    let mut alice = Client::connect(addr).await;
    let mut bob = Client::connect(addr).await;
    alice.login("user-1").await;
    bob.login("user-2").await;

    // Bob stops reading. Once the socket buffers fill, his queue overflows.
    let filler = "x".repeat(32 * 1024);
    let mut sent = 0;
    let mut remaining = 2;
    while sent < 2000 && remaining == 2 {
        let text = format!("{sent}:{filler}");
        alice.send(json!({ "action": "message", "message": text })).await;
        assert_eq!(alice.recv().await["message"], text);
        sent += 1;
        if sent % 16 == 0 {
            remaining = live_connections(&health).await;
        }
    }
    assert_eq!(remaining, 1, "bob still registered after {sent} messages");

    alice.send(json!({ "action": "message", "message": "still here" })).await;
    assert_eq!(alice.recv().await["message"], "still here");

    assert!(bob.closed_within(Duration::from_secs(10)).await);
}

// ===========================================================================
// Transport limits and liveness
// ===========================================================================

#[tokio::test]
async fn oversized_frame_closes_connection() {
    let idp = identity_provider(&[]).await;
    let addr = start_gateway(&idp, ConnectionLimits::default()).await;

    let mut client = Client::connect(addr).await;
    let huge = "x".repeat(4096);
    client
        .send(json!({ "action": "message", "message": huge }))
        .await;
    assert!(client.closed_within(Duration::from_secs(3)).await);
}

#[tokio::test]
async fn responsive_client_survives_silent_client_is_closed() {
    let idp = identity_provider(&[]).await;
    let limits = ConnectionLimits::default().with_pong_wait(Duration::from_secs(1));
    let addr = start_gateway(&idp, limits).await;

    let mut responsive = Client::connect(addr).await;
    let mut silent = Client::connect(addr).await;

    responsive.expect_silence(Duration::from_millis(2500)).await;
    responsive.send(json!({ "action": "message" })).await;
    responsive.expect_notice(Notice::AuthRequired).await;

    // `silent` never polled its socket, so its pongs never went out.
    assert!(silent.closed_within(Duration::from_secs(2)).await);
}

#[tokio::test]
async fn health_reports_live_connections() {
    let idp = identity_provider(&[]).await;
    let addr = start_gateway(&idp, ConnectionLimits::default()).await;
    let url = format!("http://{addr}/health");

    let _a = Client::connect(addr).await;
    let b = Client::connect(addr).await;

    let mut count = 0;
    for _ in 0..20 {
        let body: Value = reqwest::get(&url).await.unwrap().json().await.unwrap();
        assert_eq!(body["status"], "healthy");
        count = body["connections"].as_u64().unwrap();
        if count == 2 {
            break;
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
    assert_eq!(count, 2);

    drop(b);
    for _ in 0..40 {
        let body: Value = reqwest::get(&url).await.unwrap().json().await.unwrap();
        count = body["connections"].as_u64().unwrap();
        if count == 1 {
            break;
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
    assert_eq!(count, 1);
}
