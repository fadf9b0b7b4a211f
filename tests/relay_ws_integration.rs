//! Integration tests for the relay WebSocket.
//!
//! Each test spins up the Axum app on a random port, connects via
//! tokio-tungstenite, and plays the relay's side of a call.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use serde_json::{Value, json};
use tokio::net::TcpListener;
use tokio::time::timeout;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream, connect_async};

use tradie_desk::config::{NurtureConfig, SessionConfig, UrgencyPolicy};
use tradie_desk::error::{LlmError, TransportError};
use tradie_desk::leads::model::Tenant;
use tradie_desk::leads::{CommandHandler, LeadExtractor, NotificationDispatcher};
use tradie_desk::llm::{CompletionRequest, CompletionResponse, LlmProvider, TokenStream};
use tradie_desk::nurture::{NurtureEngine, Templates};
use tradie_desk::prompts::EXTRACTION_PROMPT;
use tradie_desk::routes::{AppState, RelaySettings, app_routes};
use tradie_desk::session::SessionController;
use tradie_desk::sms::SmsResponder;
use tradie_desk::store::{Database, LibSqlBackend};
use tradie_desk::transport::{RelayDocument, Transport};

/// Maximum time any test is allowed to run before we consider it hung.
const TEST_TIMEOUT: Duration = Duration::from_secs(5);

const OPERATOR: &str = "+14165550199";
const CALLER: &str = "+14165551234";
const OUR_NUMBER: &str = "+15550001111";

type Ws = WebSocketStream<MaybeTlsStream<tokio::net::TcpStream>>;

/// Stub LLM: every reply streams the same deltas, extraction returns a
/// fully captured lead.
struct StubLlm {
    deltas: Vec<String>,
}

#[async_trait]
impl LlmProvider for StubLlm {
    fn model_name(&self) -> &str {
        "stub"
    }

    async fn complete(&self, request: CompletionRequest) -> Result<CompletionResponse, LlmError> {
        let content = if request.system_prompt() == Some(EXTRACTION_PROMPT) {
            r#"{"name": "John Smith", "address": "45 George Street, Parramatta", "phone": "0412345678", "problem": "burst pipe flooding kitchen"}"#.to_string()
        } else {
            self.deltas.concat()
        };
        Ok(CompletionResponse { content })
    }

    async fn complete_stream(&self, _request: CompletionRequest) -> Result<TokenStream, LlmError> {
        let deltas: Vec<Result<String, LlmError>> = self.deltas.iter().cloned().map(Ok).collect();
        Ok(Box::pin(futures::stream::iter(deltas)))
    }
}

/// Transport stub that records outbound messages.
#[derive(Default)]
struct StubTransport {
    sent: Mutex<Vec<(String, String)>>,
}

impl StubTransport {
    fn bodies_to(&self, to: &str) -> Vec<String> {
        self.sent
            .lock()
            .unwrap()
            .iter()
            .filter(|(t, _)| t == to)
            .map(|(_, b)| b.clone())
            .collect()
    }
}

#[async_trait]
impl Transport for StubTransport {
    async fn send_message(&self, to: &str, _from: &str, body: &str) -> Result<String, TransportError> {
        let mut sent = self.sent.lock().unwrap();
        sent.push((to.to_string(), body.to_string()));
        Ok(format!("SM{}", sent.len()))
    }

    async fn originate_call(
        &self,
        _to: &str,
        _from: &str,
        _relay: &RelayDocument,
    ) -> Result<String, TransportError> {
        Ok("CA1".to_string())
    }
}

fn tenant() -> Tenant {
    Tenant {
        id: "mikes".to_string(),
        business_name: "Mike's Emergency Plumbing".to_string(),
        owner_name: "Mike".to_string(),
        owner_phone: OPERATOR.to_string(),
        transport_address: OUR_NUMBER.to_string(),
        region: "Ontario".to_string(),
        active: true,
    }
}

/// Start the app on a random port, return (port, transport).
async fn start_server(deltas: &[&str]) -> (u16, Arc<StubTransport>) {
    let db: Arc<dyn Database> = Arc::new(LibSqlBackend::new_memory().await.unwrap());
    db.upsert_tenant(&tenant()).await.unwrap();

    let llm: Arc<dyn LlmProvider> = Arc::new(StubLlm {
        deltas: deltas.iter().map(|s| s.to_string()).collect(),
    });
    let transport = Arc::new(StubTransport::default());
    let extractor = Arc::new(LeadExtractor::new(
        llm.clone(),
        UrgencyPolicy::default(),
        Duration::from_secs(2),
    ));
    let dispatcher = Arc::new(NotificationDispatcher::new(db.clone(), transport.clone()));
    let nurture = Arc::new(NurtureEngine::new(
        db.clone(),
        transport.clone(),
        NurtureConfig::default(),
        Templates::new("Ontario", "http://localhost/trial", "http://localhost/pay"),
        OUR_NUMBER,
    ));
    let sessions = Arc::new(
        SessionController::new(
            db.clone(),
            llm.clone(),
            extractor.clone(),
            dispatcher.clone(),
            SessionConfig::default(),
            tenant(),
        )
        .with_observer(nurture.clone()),
    );
    let sms = Arc::new(SmsResponder::new(
        db.clone(),
        llm,
        extractor,
        dispatcher,
        CommandHandler::new(db.clone(), transport.clone()),
        SessionConfig::default(),
        tenant(),
    ));

    let app = app_routes(AppState {
        db,
        sessions,
        sms,
        nurture,
        default_tenant: tenant(),
        relay: RelaySettings {
            url: "ws://localhost/ws".to_string(),
            language: "en-US".to_string(),
            hints: Vec::new(),
        },
    });

    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();

    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });

    // Give the server a moment to start accepting connections.
    tokio::time::sleep(Duration::from_millis(50)).await;

    (port, transport)
}

async fn connect(port: u16) -> Ws {
    let (ws, _resp) = connect_async(format!("ws://127.0.0.1:{port}/ws"))
        .await
        .expect("WS connect failed");
    ws
}

async fn send(ws: &mut Ws, value: Value) {
    ws.send(Message::Text(value.to_string().into())).await.unwrap();
}

async fn setup(ws: &mut Ws) {
    send(
        ws,
        json!({"type": "setup", "callSid": "CA-int-1", "from": CALLER, "to": OUR_NUMBER}),
    )
    .await;
}

/// Parse a WS text frame into a serde_json::Value.
fn parse_ws_json(msg: &Message) -> Value {
    match msg {
        Message::Text(txt) => serde_json::from_str(txt).expect("invalid JSON from server"),
        other => panic!("expected Text frame, got {:?}", other),
    }
}

/// Read frames until the agent's turn is over.
async fn read_turn(ws: &mut Ws) -> Vec<Value> {
    let mut frames = Vec::new();
    loop {
        let msg = ws.next().await.unwrap().unwrap();
        let json = parse_ws_json(&msg);
        let done = json["type"] == "end" || json["last"] == true;
        frames.push(json);
        if done {
            return frames;
        }
    }
}

async fn wait_for_alerts(transport: &StubTransport, count: usize) -> Vec<String> {
    for _ in 0..100 {
        let alerts = transport.bodies_to(OPERATOR);
        if alerts.len() >= count {
            return alerts;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    transport.bodies_to(OPERATOR)
}

// ── Relay Tests ──────────────────────────────────────────────────────

#[tokio::test]
async fn prompt_streams_chunks_then_last() {
    timeout(TEST_TIMEOUT, async {
        let (port, _transport) = start_server(&["Oh no.", " Let me get", " your details."]).await;
        let mut ws = connect(port).await;
        setup(&mut ws).await;
        send(&mut ws, json!({"type": "prompt", "voicePrompt": "burst pipe"})).await;

        let frames = read_turn(&mut ws).await;
        assert_eq!(frames[0], json!({"type": "text", "token": "Oh no.", "last": false}));
        assert_eq!(
            frames[1],
            json!({"type": "text", "token": " Let me get your details.", "last": false})
        );
        assert_eq!(frames[2], json!({"type": "text", "token": "", "last": true}));
    })
    .await
    .expect("test timed out");
}

#[tokio::test]
async fn hangup_notifies_operator_once() {
    timeout(TEST_TIMEOUT, async {
        let (port, transport) = start_server(&["Got it."]).await;
        let mut ws = connect(port).await;
        setup(&mut ws).await;
        for said in [
            "John Smith",
            "45 George Street, Parramatta",
            "0412345678",
            "burst pipe flooding kitchen",
        ] {
            send(&mut ws, json!({"type": "prompt", "voicePrompt": said})).await;
            read_turn(&mut ws).await;
        }
        send(&mut ws, json!({"type": "end"})).await;
        ws.close(None).await.ok();

        let alerts = wait_for_alerts(&transport, 1).await;
        assert_eq!(alerts.len(), 1);
        assert!(alerts[0].starts_with("URGENT LEAD via voice"));
        assert!(alerts[0].contains("Name: John Smith"));

        // Reconnecting with the same call id must not alert again.
        let mut ws = connect(port).await;
        setup(&mut ws).await;
        send(&mut ws, json!({"type": "prompt", "voicePrompt": "hello again"})).await;
        read_turn(&mut ws).await;
        ws.close(None).await.ok();

        tokio::time::sleep(Duration::from_millis(200)).await;
        assert_eq!(transport.bodies_to(OPERATOR).len(), 1);
    })
    .await
    .expect("test timed out");
}

#[tokio::test]
async fn goodbye_reply_hangs_up() {
    timeout(TEST_TIMEOUT, async {
        let (port, _transport) = start_server(&[
            "Perfect, Mike will call you soon. ",
            "Thanks for calling Mike's Emergency Plumbing, have a great day!",
        ])
        .await;
        let mut ws = connect(port).await;
        setup(&mut ws).await;
        send(&mut ws, json!({"type": "prompt", "voicePrompt": "that's everything"})).await;

        let frames = read_turn(&mut ws).await;
        assert_eq!(frames.last().unwrap()["last"], true);
        let msg = ws.next().await.unwrap().unwrap();
        assert_eq!(parse_ws_json(&msg), json!({"type": "end"}));
    })
    .await
    .expect("test timed out");
}

#[tokio::test]
async fn malformed_frames_do_not_end_session() {
    timeout(TEST_TIMEOUT, async {
        let (port, _transport) = start_server(&["Sure thing."]).await;
        let mut ws = connect(port).await;
        ws.send(Message::Text("not json".into())).await.unwrap();
        setup(&mut ws).await;
        send(&mut ws, json!({"type": "interrupt", "utteranceUntilInterrupt": "hi"})).await;
        send(&mut ws, json!({"type": "prompt", "voicePrompt": "are you there?"})).await;

        let frames = read_turn(&mut ws).await;
        assert_eq!(frames[0]["token"], "Sure thing.");
    })
    .await
    .expect("test timed out");
}
