//! Streaming chat client: a self-healing socket connection, a message
//! accumulator, and the session controller that ties them together.

pub mod accumulator;
pub mod config;
pub mod connection;
pub mod error;
pub mod events;
pub mod logging;
pub mod message;
pub mod session;
pub mod sse;
pub mod ui;

pub use accumulator::MessageAccumulator;
pub use config::{Config, UserProfile};
pub use connection::{ConnectionHandle, ConnectionManager, ConnectionSettings, ConnectionState};
pub use error::ChatError;
pub use events::{ClientFrame, ServerEvent, SessionEvent};
pub use message::{Message, MessageKind, Role};
pub use session::{ChatSession, ProfileUpdate, SessionContext, StreamPhase, TurnIds};
