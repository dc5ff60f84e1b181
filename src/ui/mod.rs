//! Terminal front end

pub mod commands;
pub mod repl;

pub use commands::{ParsedCommand, SlashCommand, get_help_text, parse_slash_command};
pub use repl::{Transcript, Transport};
