pub mod console;
pub mod telegram;

use tracing::error;

use crate::relay::conversation_state::UserId;
use crate::relay::{replies, RelayError};

/// Commands understood by every transport.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Command {
    Start,
    Help,
    Quit,
    Unknown,
}

impl Command {
    /// Parse a leading `/command`. Returns `None` for text that is not a
    /// command.
    pub fn parse(text: &str) -> Option<Self> {
        Self::parse_addressed(text, None)
    }

    /// Parse a command that may carry a Telegram `@botname` suffix. A suffix
    /// naming some other bot than `bot_username` yields `Unknown`.
    pub fn parse_addressed(text: &str, bot_username: Option<&str>) -> Option<Self> {
        let word = text.split_whitespace().next()?;
        let name = word.strip_prefix('/')?;
        let name = match name.split_once('@') {
            Some((name, addressee)) => {
                let for_us = bot_username.map_or(true, |bot| addressee.eq_ignore_ascii_case(bot));
                if !for_us {
                    return Some(Command::Unknown);
                }
                name
            }
            None => name,
        };

        Some(match name.to_ascii_lowercase().as_str() {
            "start" | "reset" | "clear" => Command::Start,
            "help" => Command::Help,
            "quit" | "exit" => Command::Quit,
            _ => Command::Unknown,
        })
    }
}

/// Turn the outcome of an exchange into the text sent back to the user.
pub fn render_reply(user_id: UserId, result: Result<String, RelayError>) -> String {
    match result {
        Ok(reply) => reply,
        Err(e) => {
            error!(user_id, "Exchange failed: {}", e);
            replies::for_error(&e).to_string()
        }
    }
}
