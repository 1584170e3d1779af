mod command_registry;
mod conversation;
mod intent_parser;

pub use command_registry::CHAT_HELP_COMMANDS;
pub use conversation::{Conversation, Role, Turn};
pub use intent_parser::{parse_intent, Intent};
