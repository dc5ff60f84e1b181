//! Line-oriented terminal chat loop.

use std::collections::HashMap;
use std::io::Write;

use anyhow::{Context, Result};
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::mpsc;

use crate::config::Config;
use crate::connection::{ConnectionHandle, ConnectionManager, ConnectionSettings};
use crate::events::{ServerEvent, SessionEvent};
use crate::message::{Message, Role};
use crate::session::{ChatSession, SessionContext};
use crate::sse::{SseClient, StreamRequest};
use crate::ui::commands::{SlashCommand, get_help_text, parse_slash_command};

/// How questions reach the backend
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, clap::ValueEnum)]
pub enum Transport {
    /// Persistent socket with heartbeat and reconnect
    #[default]
    Ws,
    /// One HTTP event stream per question
    Sse,
}

enum Backend {
    Socket {
        connection: ConnectionHandle,
        inbound: mpsc::UnboundedReceiver<ServerEvent>,
    },
    Http {
        client: SseClient,
        replies: Option<mpsc::Receiver<ServerEvent>>,
    },
}

impl Backend {
    fn connect(config: &Config, transport: Transport) -> Result<Self> {
        match transport {
            Transport::Ws => {
                let (connection, inbound) = ConnectionManager::spawn(ConnectionSettings::from(config));
                Ok(Backend::Socket { connection, inbound })
            }
            Transport::Sse => {
                let client = SseClient::new(config.stream_url()).context("Failed to create HTTP client")?;
                Ok(Backend::Http { client, replies: None })
            }
        }
    }

    async fn submit(&mut self, session: &mut ChatSession, text: &str) {
        match self {
            Backend::Socket { connection, .. } => {
                // Failures are already attached to the message and notified.
                let _ = session.submit(connection, text).await;
            }
            Backend::Http { client, replies } => {
                if let Some(turn) = session.begin_turn(text) {
                    *replies = Some(client.stream(StreamRequest::from(&turn), turn.ids.reply_id));
                }
            }
        }
    }

    async fn next_event(&mut self) -> ServerEvent {
        match self {
            Backend::Socket { inbound, .. } => match inbound.recv().await {
                Some(event) => event,
                None => std::future::pending().await,
            },
            Backend::Http { replies, .. } => {
                let Some(rx) = replies.as_mut() else {
                    return std::future::pending().await;
                };
                match rx.recv().await {
                    Some(event) => event,
                    None => {
                        *replies = None;
                        std::future::pending().await
                    }
                }
            }
        }
    }

    fn status(&self) -> String {
        match self {
            Backend::Socket { connection, .. } => {
                format!("socket {}", connection.state().display_name())
            }
            Backend::Http { replies, .. } => {
                if replies.is_some() {
                    "http stream in progress".to_string()
                } else {
                    "http idle".to_string()
                }
            }
        }
    }

    fn close(&mut self) {
        match self {
            Backend::Socket { connection, .. } => connection.close(),
            Backend::Http { client, .. } => client.cancel(),
        }
    }
}

/// Run an interactive chat on stdin/stdout until `/bye`, EOF or Ctrl-C.
pub async fn run(config: Config, transport: Transport) -> Result<()> {
    let context = SessionContext::new(config.profile.clone());
    let (mut session, mut session_events) = ChatSession::new(&config, context);
    let mut backend = Backend::connect(&config, transport)?;
    let mut transcript = Transcript::default();

    if let Some(name) = session.context().profile().display_name() {
        println!("👤 Signed in as {}", name);
    }
    for message in session.messages().snapshot() {
        emit(&transcript.render(&message));
    }
    println!("\n(type /help for commands)");

    let mut lines = BufReader::new(tokio::io::stdin()).lines();

    loop {
        tokio::select! {
            line = lines.next_line() => {
                let Some(line) = line.context("Failed to read input")? else {
                    break;
                };
                if let Some(parsed) = parse_slash_command(&line) {
                    match parsed.command {
                        SlashCommand::Bye => break,
                        SlashCommand::Clear => {
                            session.clear();
                            transcript = Transcript::default();
                        }
                        SlashCommand::History => {
                            for message in session.messages().snapshot() {
                                println!("{}", format_message(&message));
                            }
                        }
                        SlashCommand::Status => println!("🔌 {}", backend.status()),
                        SlashCommand::Help => println!("{}", get_help_text()),
                    }
                    continue;
                }
                backend.submit(&mut session, &line).await;
            }
            event = backend.next_event() => session.handle_event(event),
            Some(event) = session_events.recv() => match event {
                SessionEvent::MessageUpdated(id) => {
                    if let Some(message) = session.messages().get(id) {
                        emit(&transcript.render(&message));
                    }
                }
                SessionEvent::TypingChanged(true) => eprintln!("💭 Thinking..."),
                SessionEvent::TypingChanged(false) => {}
                SessionEvent::Notification { title, body } => eprintln!("\n❌ {}: {}", title, body),
            },
            _ = tokio::signal::ctrl_c() => break,
        }
    }

    backend.close();
    println!("\n👋 Bye!");
    Ok(())
}

fn emit(text: &str) {
    if text.is_empty() {
        return;
    }
    let mut stdout = std::io::stdout();
    let _ = stdout.write_all(text.as_bytes());
    let _ = stdout.flush();
}

fn role_label(role: Role) -> &'static str {
    match role {
        Role::User => "🧑 You",
        Role::Assistant => "🤖 Assistant",
    }
}

/// Full rendering of one message, used by `/history`
pub fn format_message(message: &Message) -> String {
    let mut out = format!(
        "[{}] {}: {}",
        message.timestamp.format("%H:%M:%S"),
        role_label(message.role),
        message.text
    );
    for table in message.tables.iter().flatten() {
        out.push_str(&format!("\n  [table {}] {}", table.id, table.data));
    }
    if let Some(meta) = &message.metadata {
        if let Some(question_id) = &meta.question_id {
            out.push_str(&format!("\n  (question {}, completed: {})", question_id, meta.completed));
        }
    }
    out
}

#[derive(Debug, Default, Clone, Copy)]
struct Printed {
    text_len: usize,
    tables: usize,
    error: bool,
    finished: bool,
}

/// Tracks what has been written for each message so streamed text prints incrementally
#[derive(Debug, Default)]
pub struct Transcript {
    printed: HashMap<u64, Printed>,
}

impl Transcript {
    /// Text to write so the terminal reflects `message`. Empty when nothing changed.
    pub fn render(&mut self, message: &Message) -> String {
        let mut out = String::new();
        let seen = self.printed.get(&message.id).copied();

        if message.error {
            if !seen.is_some_and(|p| p.error) {
                out.push_str(&format!("\n⚠️  {}: {}\n", role_label(message.role), message.text));
            }
            self.printed.insert(
                message.id,
                Printed { text_len: message.text.len(), tables: message.table_count(), error: true, finished: true },
            );
            return out;
        }

        // The user's own lines are already on screen.
        if message.role == Role::User {
            self.printed.insert(message.id, Printed { text_len: message.text.len(), ..Printed::default() });
            return out;
        }

        let mut state = match seen {
            Some(state) if message.text.len() >= state.text_len && message.text.is_char_boundary(state.text_len) => {
                out.push_str(&message.text[state.text_len..]);
                state
            }
            _ => {
                out.push_str(&format!("\n{}: {}", role_label(message.role), message.text));
                Printed::default()
            }
        };
        state.text_len = message.text.len();

        if let Some(tables) = &message.tables {
            for table in tables.iter().skip(state.tables) {
                let pretty = serde_json::to_string_pretty(&table.data).unwrap_or_else(|_| table.data.to_string());
                out.push_str(&format!("\n📊 [table {}]\n{}\n", table.id, pretty));
            }
            state.tables = tables.len();
        }

        if message.metadata.is_some() && !state.finished {
            out.push('\n');
            state.finished = true;
        }

        self.printed.insert(message.id, state);
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::{MessageMetadata, TablePayload};
    use pretty_assertions::assert_eq;

    #[test]
    fn streamed_text_prints_only_new_suffix() {
        let mut transcript = Transcript::default();
        let mut message = Message::assistant(3, "Hi");
        assert_eq!(transcript.render(&message), "\n🤖 Assistant: Hi");

        message.push_text(" there!");
        assert_eq!(transcript.render(&message), " there!");
        assert_eq!(transcript.render(&message), "");

        message.metadata = Some(MessageMetadata { question_id: Some("q1".into()), completed: true });
        assert_eq!(transcript.render(&message), "\n");
    }

    #[test]
    fn user_messages_are_not_echoed() {
        let mut transcript = Transcript::default();
        assert_eq!(transcript.render(&Message::user(2, "Hello")), "");
    }

    #[test]
    fn errors_print_once() {
        let mut transcript = Transcript::default();
        let mut message = Message::user(2, "Hello");
        transcript.render(&message);
        message.mark_error("Not connected to the chat server");

        let out = transcript.render(&message);
        assert!(out.contains("Error: Not connected to the chat server"));
        assert_eq!(transcript.render(&message), "");
    }

    #[test]
    fn tables_print_as_they_arrive() {
        let mut transcript = Transcript::default();
        let mut message = Message::assistant(3, "Numbers:");
        transcript.render(&message);

        message.push_table(TablePayload { id: "t1".into(), data: serde_json::json!({"a": 1}) });
        let out = transcript.render(&message);
        assert!(out.contains("[table t1]"));
        assert!(out.contains("\"a\": 1"));
        assert_eq!(transcript.render(&message), "");
    }

    #[test]
    fn history_line_includes_metadata() {
        let mut message = Message::assistant(3, "Done");
        message.metadata = Some(MessageMetadata { question_id: Some("q9".into()), completed: false });
        let line = format_message(&message);
        assert!(line.contains("🤖 Assistant: Done"));
        assert!(line.contains("question q9, completed: false"));
    }
}
