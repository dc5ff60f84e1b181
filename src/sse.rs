//! One-shot HTTP transport: POST the question, read the reply as a
//! server-sent event stream.

use futures::StreamExt;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::Duration;
use tracing::{debug, warn};

use crate::error::ChatError;
use crate::events::{CompletePayload, ServerEvent};
use crate::message::HistoryEntry;
use crate::session::PendingTurn;

const PARSE_FAILURE: &str = "Failed to parse server response";

/// Body of the streaming request
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StreamRequest {
    pub message: String,
    pub conversation_history: Vec<HistoryEntry>,
}

impl From<&PendingTurn> for StreamRequest {
    fn from(turn: &PendingTurn) -> Self {
        Self {
            message: turn.text.clone(),
            conversation_history: turn.history.clone(),
        }
    }
}

/// Client for the event-stream endpoint.
///
/// At most one request is outstanding; starting another aborts the first.
pub struct SseClient {
    client: reqwest::Client,
    url: String,
    in_flight: Option<JoinHandle<()>>,
}

impl SseClient {
    pub fn new(url: impl Into<String>) -> Result<Self, ChatError> {
        let client = reqwest::Client::builder()
            .connect_timeout(Duration::from_secs(10))
            .build()?;

        Ok(Self {
            client,
            url: url.into(),
            in_flight: None,
        })
    }

    /// Start streaming a reply. Every event is stamped with `reply_id`.
    pub fn stream(&mut self, request: StreamRequest, reply_id: u64) -> mpsc::Receiver<ServerEvent> {
        self.cancel();

        let (tx, rx) = mpsc::channel(1000);
        let client = self.client.clone();
        let url = self.url.clone();

        self.in_flight = Some(tokio::spawn(async move {
            if let Err(err) = Self::stream_reply(client, url, request, reply_id, tx.clone()).await {
                warn!(error = %err, "event stream failed");
                let _ = tx
                    .send(ServerEvent::Error {
                        message_id: Some(reply_id),
                        content: err.to_string(),
                    })
                    .await;
            }
        }));

        rx
    }

    /// Abort the outstanding request, if any.
    ///
    /// Events already queued on its receiver are still delivered.
    pub fn cancel(&mut self) {
        if let Some(task) = self.in_flight.take() {
            if !task.is_finished() {
                debug!("aborting outstanding event stream");
            }
            task.abort();
        }
    }

    async fn stream_reply(
        client: reqwest::Client,
        url: String,
        request: StreamRequest,
        reply_id: u64,
        tx: mpsc::Sender<ServerEvent>,
    ) -> Result<(), ChatError> {
        let response = client
            .post(&url)
            .header("Content-Type", "application/json")
            .header("Accept", "text/event-stream")
            .json(&request)
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            let error_text = response.text().await.unwrap_or_default();
            return Err(ChatError::BackendError(format!(
                "HTTP error! status: {}, message: {}",
                status.as_u16(),
                error_text
            )));
        }

        let mut stream = response.bytes_stream();
        let mut decoder = SseDecoder::default();

        while let Some(chunk) = stream.next().await {
            let chunk = chunk?;
            for payload in decoder.push(&chunk) {
                if let Some(event) = decode_frame(&payload, reply_id) {
                    if tx.send(event).await.is_err() {
                        return Ok(());
                    }
                }
            }
        }

        if decoder.has_remainder() {
            warn!("unprocessed event-stream content at end of response");
        }
        Ok(())
    }
}

impl Drop for SseClient {
    fn drop(&mut self) {
        self.cancel();
    }
}

/// Splits a byte stream into the `data:` payloads of blank-line delimited events
#[derive(Debug, Default)]
pub struct SseDecoder {
    buffer: Vec<u8>,
}

impl SseDecoder {
    pub fn push(&mut self, bytes: &[u8]) -> Vec<String> {
        self.buffer.extend(bytes.iter().copied().filter(|b| *b != b'\r'));

        let mut payloads = Vec::new();
        while let Some(end) = self.buffer.windows(2).position(|w| w == b"\n\n") {
            let block: Vec<u8> = self.buffer.drain(..end + 2).collect();
            let block = String::from_utf8_lossy(&block[..end]);

            let data: Vec<&str> = block
                .lines()
                .filter_map(|line| line.strip_prefix("data:"))
                .map(str::trim)
                .collect();
            if !data.is_empty() {
                payloads.push(data.join("\n"));
            }
        }
        payloads
    }

    pub fn has_remainder(&self) -> bool {
        self.buffer.iter().any(|b| !b.is_ascii_whitespace())
    }
}

#[derive(Deserialize)]
struct StreamFrame {
    #[serde(rename = "type")]
    kind: String,
    #[serde(default)]
    content: serde_json::Value,
}

/// Turn one `data:` payload into an event for `reply_id`.
///
/// Unparseable payloads become an error event; unknown tags are skipped.
pub fn decode_frame(payload: &str, reply_id: u64) -> Option<ServerEvent> {
    let parse_failure = || ServerEvent::Error {
        message_id: Some(reply_id),
        content: PARSE_FAILURE.to_string(),
    };

    let frame: StreamFrame = match serde_json::from_str(payload) {
        Ok(frame) => frame,
        Err(err) => {
            warn!(error = %err, "event-stream parse error");
            return Some(parse_failure());
        }
    };

    match frame.kind.as_str() {
        "chunk" => match frame.content {
            serde_json::Value::String(content) => Some(ServerEvent::Chunk {
                message_id: reply_id,
                content,
            }),
            _ => Some(parse_failure()),
        },
        "complete" => match serde_json::from_value::<CompletePayload>(frame.content) {
            Ok(content) => Some(ServerEvent::Complete {
                message_id: reply_id,
                content,
            }),
            Err(err) => {
                warn!(error = %err, "bad completion payload");
                Some(parse_failure())
            }
        },
        "error" => {
            let content = match frame.content {
                serde_json::Value::String(text) => text,
                other => other.to_string(),
            };
            Some(ServerEvent::Error {
                message_id: Some(reply_id),
                content,
            })
        }
        other => {
            debug!(kind = other, "ignoring event-stream frame");
            None
        }
    }
}
