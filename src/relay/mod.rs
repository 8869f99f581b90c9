pub mod conversation_state;
pub mod prompt;
pub mod replies;

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use thiserror::Error;
use tokio::sync::OwnedMutexGuard;
use tracing::{debug, info};

use crate::completion_client::{CompletionGateway, GatewayError};
use conversation_state::{ConversationStore, ImageAttachment, Role, TurnContent, UserId};
use prompt::{build_messages, image_caption};

#[derive(Debug, Error)]
pub enum RelayError {
    #[error(transparent)]
    Gateway(#[from] GatewayError),

    #[error("failed to fetch image: {0}")]
    MediaFetch(String),
}

/// Drives one exchange per incoming message: read history, assemble the
/// prompt, ask the completion API, and remember the exchange on success.
pub struct ChatRelay {
    store: Arc<ConversationStore>,
    gateway: Arc<dyn CompletionGateway>,
    system_prompt: String,
    locks: UserLocks,
}

impl ChatRelay {
    pub fn new(
        store: Arc<ConversationStore>,
        gateway: Arc<dyn CompletionGateway>,
        system_prompt: impl Into<String>,
    ) -> Self {
        Self {
            store,
            gateway,
            system_prompt: system_prompt.into(),
            locks: UserLocks::default(),
        }
    }

    pub fn store(&self) -> &ConversationStore {
        &self.store
    }

    /// Forget everything the user said so far and return the greeting.
    ///
    /// Takes the same per-user lock as an exchange, so a reset sent while an
    /// answer is still pending runs after that answer has been recorded. A
    /// hung completion call therefore delays the reset until the client
    /// times out (see `OPENAI_TIMEOUT_SECS`).
    pub async fn reset(&self, user_id: UserId) -> String {
        {
            let _guard = self.locks.acquire(user_id).await;
            self.store.clear(user_id);
        }
        self.locks.release_if_idle(user_id);
        info!(user_id, users = self.store.user_count(), "Conversation reset");
        replies::GREETING.to_string()
    }

    pub async fn handle_text(&self, user_id: UserId, text: &str) -> Result<String, RelayError> {
        self.exchange(user_id, TurnContent::Text(text.to_string())).await
    }

    /// Ask about an image. Only the caption (or the default question) is
    /// remembered; the image itself is sent once and dropped.
    pub async fn handle_image(
        &self,
        user_id: UserId,
        image: ImageAttachment,
        caption: Option<&str>,
    ) -> Result<String, RelayError> {
        let text = image_caption(caption);
        self.exchange(user_id, TurnContent::Image { text, image }).await
    }

    async fn exchange(&self, user_id: UserId, content: TurnContent) -> Result<String, RelayError> {
        let result = {
            let _guard = self.locks.acquire(user_id).await;
            self.exchange_locked(user_id, content).await
        };
        self.locks.release_if_idle(user_id);
        result
    }

    async fn exchange_locked(&self, user_id: UserId, content: TurnContent) -> Result<String, RelayError> {
        let history = self.store.get(user_id);
        let user_text = content.text().to_string();
        let messages = build_messages(&self.system_prompt, &history, content);
        debug!(user_id, history = history.len(), "Assembled prompt");

        let reply = self.gateway.complete(&messages).await?;

        self.store.append(user_id, Role::User, &user_text);
        self.store.append(user_id, Role::Assistant, &reply);
        info!(
            user_id,
            history = self.store.len(user_id),
            reply_chars = reply.chars().count(),
            "Exchange completed"
        );

        Ok(reply)
    }
}

/// One async mutex per user, so exchanges of the same user run one at a time
/// while different users proceed in parallel.
#[derive(Default)]
struct UserLocks {
    locks: Mutex<HashMap<UserId, Arc<tokio::sync::Mutex<()>>>>,
}

impl UserLocks {
    async fn acquire(&self, user_id: UserId) -> OwnedMutexGuard<()> {
        let lock = {
            let mut locks = self.map();
            Arc::clone(locks.entry(user_id).or_default())
        };
        lock.lock_owned().await
    }

    /// Drop the user's lock once nobody holds or waits on it. Clones are only
    /// taken under the map lock, so a count of one cannot race with `acquire`.
    fn release_if_idle(&self, user_id: UserId) {
        let mut locks = self.map();
        if locks.get(&user_id).is_some_and(|lock| Arc::strong_count(lock) == 1) {
            locks.remove(&user_id);
        }
    }

    #[cfg(test)]
    fn tracked(&self) -> usize {
        self.map().len()
    }

    fn map(&self) -> MutexGuard<'_, HashMap<UserId, Arc<tokio::sync::Mutex<()>>>> {
        self.locks.lock().unwrap_or_else(PoisonError::into_inner)
    }
}
