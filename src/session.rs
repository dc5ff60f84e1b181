use std::collections::HashMap;
use std::time::Duration;

use tokio::sync::{mpsc, watch};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::accumulator::MessageAccumulator;
use crate::config::{Config, UserProfile};
use crate::connection::ConnectionHandle;
use crate::error::ChatError;
use crate::events::{ClientFrame, CompletePayload, ServerEvent, SessionEvent};
use crate::message::{HistoryEntry, IdAllocator, Message, MessageMetadata, TablePayload};

/// Per-session state that used to live in a global store
#[derive(Debug, Clone)]
pub struct SessionContext {
    session_id: Uuid,
    profile: UserProfile,
}

/// Partial profile change; `None` leaves a field untouched
#[derive(Debug, Clone, Default)]
pub struct ProfileUpdate {
    pub first_name: Option<String>,
    pub last_name: Option<String>,
    pub email: Option<String>,
    pub preferences: Option<String>,
}

impl ProfileUpdate {
    pub fn is_empty(&self) -> bool {
        self.first_name.is_none()
            && self.last_name.is_none()
            && self.email.is_none()
            && self.preferences.is_none()
    }

    pub fn apply(self, profile: &mut UserProfile) {
        if let Some(first_name) = self.first_name {
            profile.first_name = first_name;
        }
        if let Some(last_name) = self.last_name {
            profile.last_name = last_name;
        }
        if let Some(email) = self.email {
            profile.email = email;
        }
        if let Some(preferences) = self.preferences {
            profile.preferences = preferences;
        }
    }
}

impl SessionContext {
    pub fn new(profile: UserProfile) -> Self {
        Self {
            session_id: Uuid::new_v4(),
            profile,
        }
    }

    pub fn session_id(&self) -> Uuid {
        self.session_id
    }

    pub fn profile(&self) -> &UserProfile {
        &self.profile
    }

    pub fn update_profile(&mut self, update: ProfileUpdate) {
        update.apply(&mut self.profile);
    }

    pub fn reset_profile(&mut self) {
        self.profile = UserProfile::default();
    }
}

/// Where a reply stands, keyed by the id the server echoes back
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamPhase {
    AwaitingFirstChunk,
    Streaming,
    Completed,
}

/// Identifiers reserved for one user turn
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TurnIds {
    pub user_id: u64,
    pub reply_id: u64,
}

/// A turn whose user message is already visible but not yet sent
#[derive(Debug, Clone)]
pub struct PendingTurn {
    pub ids: TurnIds,
    pub text: String,
    pub history: Vec<HistoryEntry>,
}

impl PendingTurn {
    pub fn to_frame(&self) -> ClientFrame {
        ClientFrame::ChatMessage {
            message: self.text.clone(),
            message_id: self.ids.reply_id,
            conversation_history: self.history.clone(),
        }
    }
}

/// Chat session controller.
///
/// Turns user input into requests and folds the server's streamed events
/// into the message list. All mutation happens through `&mut self`, one
/// event at a time.
pub struct ChatSession {
    context: SessionContext,
    welcome: String,
    ids: IdAllocator,
    messages: MessageAccumulator,
    streams: HashMap<u64, StreamPhase>,
    typing: bool,
    connect_timeout: Duration,
    connect_poll: Duration,
    events: mpsc::UnboundedSender<SessionEvent>,
}

impl ChatSession {
    /// Create a session seeded with the welcome message.
    pub fn new(config: &Config, context: SessionContext) -> (Self, mpsc::UnboundedReceiver<SessionEvent>) {
        let (events, events_rx) = mpsc::unbounded_channel();
        let mut session = Self {
            context,
            welcome: config.welcome_message.clone(),
            ids: IdAllocator::new(),
            messages: MessageAccumulator::new(),
            streams: HashMap::new(),
            typing: false,
            connect_timeout: config.connect_timeout(),
            connect_poll: config.connect_poll(),
            events,
        };
        let welcome_id = session.ids.reserve();
        session.messages.reset(welcome_id, &session.welcome);
        info!(session_id = %session.context.session_id(), "chat session started");
        (session, events_rx)
    }

    pub fn context(&self) -> &SessionContext {
        &self.context
    }

    pub fn context_mut(&mut self) -> &mut SessionContext {
        &mut self.context
    }

    pub fn messages(&self) -> &MessageAccumulator {
        &self.messages
    }

    pub fn subscribe(&self) -> watch::Receiver<Vec<Message>> {
        self.messages.subscribe()
    }

    pub fn is_typing(&self) -> bool {
        self.typing
    }

    pub fn phase(&self, reply_id: u64) -> Option<StreamPhase> {
        self.streams.get(&reply_id).copied()
    }

    /// Reserve ids, snapshot history and optimistically show the user message.
    ///
    /// Returns `None` for blank input.
    pub fn begin_turn(&mut self, text: &str) -> Option<PendingTurn> {
        let text = text.trim();
        if text.is_empty() {
            return None;
        }

        let (user_id, reply_id) = self.ids.reserve_turn();
        let history = self
            .messages
            .snapshot()
            .iter()
            .map(Message::to_history_entry)
            .collect();

        self.messages.append(Message::user(user_id, text));
        self.streams.insert(reply_id, StreamPhase::AwaitingFirstChunk);
        self.notify(SessionEvent::MessageUpdated(user_id));
        self.set_typing(true);

        Some(PendingTurn {
            ids: TurnIds { user_id, reply_id },
            text: text.to_string(),
            history,
        })
    }

    /// Send `text` over the socket, connecting first if needed.
    ///
    /// Returns once the request is written; the reply arrives later through
    /// [`ChatSession::handle_event`].
    pub async fn submit(&mut self, connection: &ConnectionHandle, text: &str) -> Result<Option<TurnIds>, ChatError> {
        let Some(turn) = self.begin_turn(text) else {
            return Ok(None);
        };

        if !connection.is_connected() {
            info!("socket not open; connecting before send");
            connection.connect();
            if let Err(err) = connection
                .wait_until_connected(self.connect_timeout, self.connect_poll)
                .await
            {
                self.fail_turn(turn.ids, &err);
                return Err(err);
            }
        }

        if let Err(err) = connection.send(turn.to_frame()).await {
            self.fail_turn(turn.ids, &err);
            return Err(err);
        }

        debug!(user_id = turn.ids.user_id, reply_id = turn.ids.reply_id, "chat message sent");
        Ok(Some(turn.ids))
    }

    /// Mark a turn that never reached the server as failed.
    pub fn fail_turn(&mut self, ids: TurnIds, err: &ChatError) {
        warn!(user_id = ids.user_id, error = %err, "turn failed");
        self.streams.remove(&ids.reply_id);
        let reason = err.to_string();
        if self.messages.mutate(ids.user_id, |m| m.mark_error(&reason)) {
            self.notify(SessionEvent::MessageUpdated(ids.user_id));
        }
        self.set_typing(false);
        self.notify_error(reason);
    }

    /// Fold one inbound event into the conversation.
    pub fn handle_event(&mut self, event: ServerEvent) {
        match event {
            ServerEvent::Chunk { message_id, content } => self.on_chunk(message_id, &content),
            ServerEvent::Complete { message_id, content } => self.on_complete(message_id, content),
            ServerEvent::Table { message_id, content } => self.on_table(message_id, content),
            ServerEvent::Error { message_id, content } => self.on_error(message_id, content),
        }
    }

    /// Back to a single fresh welcome message.
    pub fn clear(&mut self) {
        let welcome_id = self.ids.reserve();
        self.messages.reset(welcome_id, &self.welcome);
        self.streams.clear();
        self.set_typing(false);
        self.notify(SessionEvent::MessageUpdated(welcome_id));
        info!("conversation cleared");
    }

    fn on_chunk(&mut self, message_id: u64, content: &str) {
        match self.streams.get(&message_id).copied() {
            Some(StreamPhase::Completed) => {
                warn!(message_id, "chunk after completion; dropping");
                return;
            }
            Some(StreamPhase::Streaming) => {
                self.messages.mutate(message_id, |m| m.push_text(content));
            }
            Some(StreamPhase::AwaitingFirstChunk) => self.start_reply(message_id, content),
            None if self.messages.contains(message_id) => {
                warn!(message_id, "chunk for a message that is not a reply; dropping");
                return;
            }
            None => {
                debug!(message_id, "chunk for an unrequested reply");
                self.start_reply(message_id, content);
            }
        }
        self.set_typing(false);
        self.notify(SessionEvent::MessageUpdated(message_id));
    }

    fn start_reply(&mut self, message_id: u64, content: &str) {
        if self.messages.contains(message_id) {
            self.messages.mutate(message_id, |m| m.push_text(content));
        } else {
            self.messages.append(Message::assistant(message_id, content));
        }
        self.streams.insert(message_id, StreamPhase::Streaming);
    }

    fn on_complete(&mut self, message_id: u64, content: CompletePayload) {
        let metadata = MessageMetadata {
            question_id: content.question_id,
            completed: content.completed,
        };
        let known = self.messages.mutate(message_id, |m| m.metadata = Some(metadata));
        if known {
            self.notify(SessionEvent::MessageUpdated(message_id));
        } else {
            debug!(message_id, "completion for unknown message");
        }
        if known || self.streams.contains_key(&message_id) {
            self.streams.insert(message_id, StreamPhase::Completed);
        }
        self.set_typing(false);
    }

    fn on_table(&mut self, message_id: u64, table: TablePayload) {
        if self.phase(message_id) == Some(StreamPhase::AwaitingFirstChunk) && !self.messages.contains(message_id) {
            self.start_reply(message_id, "");
        }
        let table_id = table.id.clone();
        if self.messages.mutate(message_id, |m| m.push_table(table)) {
            debug!(message_id, %table_id, "table attached");
            self.notify(SessionEvent::MessageUpdated(message_id));
        } else {
            warn!(message_id, %table_id, "table for unknown message; dropping");
        }
    }

    fn on_error(&mut self, message_id: Option<u64>, content: String) {
        error!(message_id = ?message_id, error = %content, "backend reported an error");
        if let Some(id) = message_id {
            if self.messages.mutate(id, |m| m.mark_error(&content)) {
                self.notify(SessionEvent::MessageUpdated(id));
            }
            if self.streams.contains_key(&id) {
                self.streams.insert(id, StreamPhase::Completed);
            }
        }
        self.set_typing(false);
        self.notify_error(ChatError::BackendError(content).to_string());
    }

    fn set_typing(&mut self, typing: bool) {
        if self.typing != typing {
            self.typing = typing;
            self.notify(SessionEvent::TypingChanged(typing));
        }
    }

    fn notify_error(&self, body: String) {
        self.notify(SessionEvent::Notification {
            title: "Error".to_string(),
            body,
        });
    }

    fn notify(&self, event: SessionEvent) {
        let _ = self.events.send(event);
    }
}
