use std::collections::{HashMap, VecDeque};
use std::sync::{Mutex, MutexGuard, PoisonError};

/// Number of turns kept per user when nothing else is configured.
pub const DEFAULT_MAX_TURNS: usize = 10;

pub type UserId = i64;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    System,
    User,
    Assistant,
}

impl Role {
    pub fn as_str(&self) -> &'static str {
        match self {
            Role::System => "system",
            Role::User => "user",
            Role::Assistant => "assistant",
        }
    }
}

/// Raw image sent alongside a user question.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ImageAttachment {
    mime_type: String,
    bytes: Vec<u8>,
}

impl ImageAttachment {
    pub fn new(mime_type: impl Into<String>, bytes: Vec<u8>) -> Self {
        Self {
            mime_type: mime_type.into(),
            bytes,
        }
    }

    /// Guess the MIME type from a file name, falling back to JPEG which is
    /// what Telegram re-encodes photos to.
    pub fn from_file_name(file_name: &str, bytes: Vec<u8>) -> Self {
        let extension = file_name
            .rsplit_once('.')
            .map(|(_, ext)| ext.to_ascii_lowercase())
            .unwrap_or_default();
        let mime_type = match extension.as_str() {
            "png" => "image/png",
            "gif" => "image/gif",
            "webp" => "image/webp",
            _ => "image/jpeg",
        };
        Self::new(mime_type, bytes)
    }

    pub fn mime_type(&self) -> &str {
        &self.mime_type
    }

    pub fn bytes(&self) -> &[u8] {
        &self.bytes
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TurnContent {
    Text(String),
    Image { text: String, image: ImageAttachment },
}

impl TurnContent {
    /// The textual part of the content; for images this is the caption.
    pub fn text(&self) -> &str {
        match self {
            TurnContent::Text(text) => text,
            TurnContent::Image { text, .. } => text,
        }
    }
}

/// One role-tagged message of a conversation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Turn {
    role: Role,
    content: TurnContent,
}

impl Turn {
    pub fn new(role: Role, content: TurnContent) -> Self {
        Self { role, content }
    }

    pub fn system(text: impl Into<String>) -> Self {
        Self::new(Role::System, TurnContent::Text(text.into()))
    }

    pub fn user(text: impl Into<String>) -> Self {
        Self::new(Role::User, TurnContent::Text(text.into()))
    }

    pub fn assistant(text: impl Into<String>) -> Self {
        Self::new(Role::Assistant, TurnContent::Text(text.into()))
    }

    pub fn role(&self) -> Role {
        self.role
    }

    pub fn content(&self) -> &TurnContent {
        &self.content
    }
}

/// Bounded per-user conversation memory.
///
/// Only text turns are stored, so image bytes never outlive the request
/// they arrived with. The system prompt is never stored either; it is added
/// back when the prompt is assembled.
pub struct ConversationStore {
    histories: Mutex<HashMap<UserId, VecDeque<Turn>>>,
    max_turns: usize,
}

impl ConversationStore {
    pub fn new(max_turns: usize) -> Self {
        Self {
            histories: Mutex::new(HashMap::new()),
            max_turns,
        }
    }

    pub fn max_turns(&self) -> usize {
        self.max_turns
    }

    pub fn get(&self, user_id: UserId) -> Vec<Turn> {
        self.lock()
            .get(&user_id)
            .map(|history| history.iter().cloned().collect())
            .unwrap_or_default()
    }

    /// Append a text turn, evicting the oldest turns past the limit.
    /// System turns are never stored and are ignored here.
    pub fn append(&self, user_id: UserId, role: Role, content: &str) {
        let turn = match role {
            Role::User => Turn::user(content),
            Role::Assistant => Turn::assistant(content),
            Role::System => return,
        };

        let mut histories = self.lock();
        let history = histories.entry(user_id).or_default();
        history.push_back(turn);

        while history.len() > self.max_turns {
            history.pop_front();
        }
    }

    pub fn clear(&self, user_id: UserId) {
        self.lock().remove(&user_id);
    }

    pub fn len(&self, user_id: UserId) -> usize {
        self.lock().get(&user_id).map_or(0, VecDeque::len)
    }

    pub fn user_count(&self) -> usize {
        self.lock().len()
    }

    // Every critical section leaves the map consistent, so poisoning is ignored.
    fn lock(&self) -> MutexGuard<'_, HashMap<UserId, VecDeque<Turn>>> {
        self.histories.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl Default for ConversationStore {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_TURNS)
    }
}
