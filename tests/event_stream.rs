use pretty_assertions::assert_eq;
use serde_json::json;
use tokio::sync::mpsc;
use wiremock::matchers::{body_partial_json, header, method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

use pilot::config::{Config, UserProfile};
use pilot::events::{CompletePayload, ServerEvent};
use pilot::session::{ChatSession, SessionContext, StreamPhase};
use pilot::sse::{SseClient, StreamRequest};

const STREAM_PATH: &str = "/api/v1/chat/survey/stream";

async fn collect(mut rx: mpsc::Receiver<ServerEvent>) -> Vec<ServerEvent> {
    let mut events = Vec::new();
    while let Some(event) = rx.recv().await {
        events.push(event);
    }
    events
}

fn sse_body(frames: &[serde_json::Value]) -> String {
    frames.iter().map(|frame| format!("data: {}\n\n", frame)).collect()
}

#[tokio::test]
async fn streams_chunks_and_completion() {
    let server = MockServer::start().await;
    let body = sse_body(&[
        json!({"type": "chunk", "content": "Hi", "done": false}),
        json!({"type": "chunk", "content": " there!", "done": false}),
        json!({"type": "complete", "content": {"question_id": "q1", "completed": true}, "done": true}),
    ]);
    Mock::given(method("POST"))
        .and(path(STREAM_PATH))
        .and(header("accept", "text/event-stream"))
        .and(body_partial_json(json!({"message": "Hello"})))
        .respond_with(
            ResponseTemplate::new(200)
                .insert_header("content-type", "text/event-stream")
                .set_body_string(body),
        )
        .expect(1)
        .mount(&server)
        .await;

    let mut client = SseClient::new(format!("{}{}", server.uri(), STREAM_PATH)).unwrap();
    let request = StreamRequest {
        message: "Hello".into(),
        conversation_history: vec![],
    };
    let events = collect(client.stream(request, 3)).await;

    assert_eq!(
        events,
        vec![
            ServerEvent::Chunk { message_id: 3, content: "Hi".into() },
            ServerEvent::Chunk { message_id: 3, content: " there!".into() },
            ServerEvent::Complete {
                message_id: 3,
                content: CompletePayload { question_id: Some("q1".into()), completed: true },
            },
        ]
    );
}

#[tokio::test]
async fn http_failure_becomes_error_event() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path(STREAM_PATH))
        .respond_with(ResponseTemplate::new(500).set_body_string("boom"))
        .mount(&server)
        .await;

    let mut client = SseClient::new(format!("{}{}", server.uri(), STREAM_PATH)).unwrap();
    let request = StreamRequest {
        message: "Hello".into(),
        conversation_history: vec![],
    };
    let events = collect(client.stream(request, 5)).await;

    assert_eq!(
        events,
        vec![ServerEvent::Error {
            message_id: Some(5),
            content: "HTTP error! status: 500, message: boom".into(),
        }]
    );
}

#[tokio::test]
async fn session_folds_streamed_reply() {
    let server = MockServer::start().await;
    let body = sse_body(&[
        json!({"type": "chunk", "content": "Revenue is "}),
        json!({"type": "chunk", "content": "up."}),
        json!({"type": "complete", "content": {"question_id": "fin-1", "completed": false}}),
    ]);
    Mock::given(method("POST"))
        .and(path(STREAM_PATH))
        .respond_with(ResponseTemplate::new(200).set_body_string(body))
        .mount(&server)
        .await;

    let config = Config {
        http_base_url: server.uri(),
        ..Config::default()
    };
    let (mut session, _events) = ChatSession::new(&config, SessionContext::new(UserProfile::default()));
    let mut client = SseClient::new(config.stream_url()).unwrap();

    let turn = session.begin_turn("How is revenue?").unwrap();
    let request = StreamRequest::from(&turn);
    assert_eq!(request.conversation_history.len(), 1);

    for event in collect(client.stream(request, turn.ids.reply_id)).await {
        session.handle_event(event);
    }

    let reply = session.messages().get(turn.ids.reply_id).unwrap();
    assert_eq!(reply.text, "Revenue is up.");
    assert_eq!(session.phase(turn.ids.reply_id), Some(StreamPhase::Completed));
    assert!(!reply.metadata.unwrap().completed);
}

#[tokio::test]
async fn new_stream_cancels_the_previous_one() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path(STREAM_PATH))
        .and(body_partial_json(json!({"message": "slow"})))
        .respond_with(
            ResponseTemplate::new(200)
                .set_body_string(sse_body(&[json!({"type": "chunk", "content": "late"})]))
                .set_delay(std::time::Duration::from_secs(30)),
        )
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .and(path(STREAM_PATH))
        .and(body_partial_json(json!({"message": "fast"})))
        .respond_with(
            ResponseTemplate::new(200).set_body_string(sse_body(&[json!({"type": "chunk", "content": "now"})])),
        )
        .mount(&server)
        .await;

    let mut client = SseClient::new(format!("{}{}", server.uri(), STREAM_PATH)).unwrap();
    let slow = client.stream(
        StreamRequest { message: "slow".into(), conversation_history: vec![] },
        1,
    );
    let fast = client.stream(
        StreamRequest { message: "fast".into(), conversation_history: vec![] },
        2,
    );

    assert!(collect(slow).await.is_empty());
    assert_eq!(
        collect(fast).await,
        vec![ServerEvent::Chunk { message_id: 2, content: "now".into() }]
    );
}
