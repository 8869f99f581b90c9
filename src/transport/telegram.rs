//! Telegram Bot API transport.
//!
//! Long-polls `getUpdates` and hands every message to the relay in its own
//! task, so a slow completion for one user never holds up the others.

use std::sync::Arc;
use std::time::Duration;

use eyre::{Result, bail, eyre};
use serde::Deserialize;
use serde::de::DeserializeOwned;
use serde_json::{json, Value};
use tracing::{debug, error, info, warn};

use super::{Command, render_reply};
use crate::relay::conversation_state::{ImageAttachment, UserId};
use crate::relay::{replies, ChatRelay, RelayError};

const API_BASE: &str = "https://api.telegram.org";

/// Telegram rejects messages longer than this many characters.
pub const MAX_MESSAGE_CHARS: usize = 4096;

const POLL_TIMEOUT_SECS: u64 = 30;
const POLL_RETRY_DELAY: Duration = Duration::from_secs(5);

#[derive(Debug, Deserialize)]
struct ApiResponse<T> {
    ok: bool,
    result: Option<T>,
    description: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct Update {
    pub update_id: i64,
    pub message: Option<Message>,
}

#[derive(Debug, Deserialize)]
pub struct Message {
    pub chat: Chat,
    pub from: Option<User>,
    pub text: Option<String>,
    pub caption: Option<String>,
    pub photo: Option<Vec<PhotoSize>>,
}

#[derive(Debug, Deserialize)]
pub struct Chat {
    pub id: i64,
}

#[derive(Debug, Deserialize)]
pub struct User {
    pub id: i64,
    pub username: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct PhotoSize {
    pub file_id: String,
    pub width: u32,
    pub height: u32,
}

#[derive(Debug, Deserialize)]
struct File {
    file_path: Option<String>,
}

/// What a message asks the bot to do.
#[derive(Debug, PartialEq, Eq)]
pub enum Incoming {
    Command(Command),
    Text(String),
    Photo {
        file_id: String,
        caption: Option<String>,
    },
}

impl Message {
    /// The sender's id, or the chat id for anonymous channel posts.
    pub fn user_id(&self) -> UserId {
        self.from.as_ref().map_or(self.chat.id, |user| user.id)
    }

    /// Classify the message. Stickers, voice notes, documents and the like
    /// yield `None` and are ignored. `bot_username` decides whether a
    /// `/command@name` is addressed to this bot.
    pub fn incoming(&self, bot_username: Option<&str>) -> Option<Incoming> {
        if let Some(photos) = &self.photo {
            let largest = photos
                .iter()
                .max_by_key(|photo| u64::from(photo.width) * u64::from(photo.height))?;
            return Some(Incoming::Photo {
                file_id: largest.file_id.clone(),
                caption: self.caption.clone(),
            });
        }

        let text = self.text.as_deref()?;
        match Command::parse_addressed(text, bot_username) {
            Some(command) => Some(Incoming::Command(command)),
            None if text.trim().is_empty() => None,
            None => Some(Incoming::Text(text.to_string())),
        }
    }
}

/// Thin client for the handful of Bot API methods the relay needs.
pub struct TelegramApi {
    token: String,
    base_url: String,
    client: reqwest::Client,
}

impl TelegramApi {
    pub fn new(token: impl Into<String>) -> Result<Self> {
        Self::with_base_url(token, API_BASE)
    }

    /// Talk to a Bot API server other than api.telegram.org, such as a
    /// self-hosted `telegram-bot-api`.
    pub fn with_base_url(token: impl Into<String>, base_url: impl Into<String>) -> Result<Self> {
        // Must outlast the long-poll timeout.
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(POLL_TIMEOUT_SECS + 15))
            .build()?;

        Ok(Self {
            token: token.into(),
            base_url: base_url.into().trim_end_matches('/').to_string(),
            client,
        })
    }

    fn api_url(&self, method: &str) -> String {
        format!("{}/bot{}/{}", self.base_url, self.token, method)
    }

    fn file_url(&self, file_path: &str) -> String {
        format!("{}/file/bot{}/{}", self.base_url, self.token, file_path)
    }

    async fn call<T: DeserializeOwned>(&self, method: &str, body: Value) -> Result<T> {
        let response: ApiResponse<T> = self
            .client
            .post(self.api_url(method))
            .json(&body)
            .send()
            .await?
            .json()
            .await?;

        if !response.ok {
            bail!(
                "Telegram {} failed: {}",
                method,
                response.description.unwrap_or_else(|| "no description".to_string())
            );
        }

        response
            .result
            .ok_or_else(|| eyre!("Telegram {} returned no result", method))
    }

    pub async fn get_me(&self) -> Result<User> {
        self.call("getMe", json!({})).await
    }

    pub async fn get_updates(&self, offset: i64) -> Result<Vec<Update>> {
        self.call(
            "getUpdates",
            json!({
                "offset": offset,
                "timeout": POLL_TIMEOUT_SECS,
                "allowed_updates": ["message"],
            }),
        )
        .await
    }

    pub async fn send_message(&self, chat_id: i64, text: &str) -> Result<()> {
        for chunk in split_message(text, MAX_MESSAGE_CHARS) {
            let _: Value = self
                .call("sendMessage", json!({ "chat_id": chat_id, "text": chunk }))
                .await?;
        }
        Ok(())
    }

    pub async fn send_typing(&self, chat_id: i64) -> Result<()> {
        let _: Value = self
            .call("sendChatAction", json!({ "chat_id": chat_id, "action": "typing" }))
            .await?;
        Ok(())
    }

    /// Download a file by its `file_id`: resolve the path with `getFile`,
    /// then fetch the bytes.
    pub async fn download_file(&self, file_id: &str) -> Result<Vec<u8>> {
        let file: File = self.call("getFile", json!({ "file_id": file_id })).await?;
        let file_path = file
            .file_path
            .ok_or_else(|| eyre!("Missing file_path in getFile response"))?;

        let response = self.client.get(self.file_url(&file_path)).send().await?;
        if !response.status().is_success() {
            bail!("Failed to download file from Telegram: {}", response.status());
        }

        Ok(response.bytes().await?.to_vec())
    }
}

/// Poll Telegram until Ctrl-C, answering every message through `relay`.
pub async fn run(api: Arc<TelegramApi>, relay: Arc<ChatRelay>) -> Result<()> {
    let me = api.get_me().await?;
    info!(
        "Bot authenticated: @{} (ID: {})",
        me.username.as_deref().unwrap_or("unknown"),
        me.id
    );
    let bot_username: Option<Arc<str>> = me.username.map(Arc::from);

    let mut offset: i64 = 0;
    info!("Listening for Telegram messages...");

    loop {
        let updates = tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                info!("Shutting down");
                return Ok(());
            }
            updates = api.get_updates(offset) => updates,
        };

        let updates = match updates {
            Ok(updates) => updates,
            Err(e) => {
                warn!("Telegram poll error: {}", e);
                tokio::time::sleep(POLL_RETRY_DELAY).await;
                continue;
            }
        };

        for update in updates {
            offset = offset.max(update.update_id + 1);

            let Some(message) = update.message else {
                continue;
            };

            let api = Arc::clone(&api);
            let relay = Arc::clone(&relay);
            let bot_username = bot_username.clone();
            tokio::spawn(async move {
                handle_message(&api, &relay, message, bot_username.as_deref()).await;
            });
        }
    }
}

async fn handle_message(
    api: &TelegramApi,
    relay: &ChatRelay,
    message: Message,
    bot_username: Option<&str>,
) {
    let chat_id = message.chat.id;
    let user_id = message.user_id();

    let Some(incoming) = message.incoming(bot_username) else {
        debug!(user_id, "Ignoring unsupported message");
        return;
    };

    let reply = match incoming {
        Incoming::Command(Command::Start) => relay.reset(user_id).await,
        Incoming::Command(Command::Help) => replies::HELP_TEXT.to_string(),
        Incoming::Command(_) => {
            debug!(user_id, "Ignoring unknown command");
            return;
        }
        Incoming::Text(text) => {
            info!(user_id, message_type = "text", "Message received");
            notify_typing(api, chat_id).await;
            render_reply(user_id, relay.handle_text(user_id, &text).await)
        }
        Incoming::Photo { file_id, caption } => {
            info!(user_id, message_type = "photo", "Message received");
            notify_typing(api, chat_id).await;
            let result = match api.download_file(&file_id).await {
                Ok(bytes) => {
                    let image = ImageAttachment::new("image/jpeg", bytes);
                    relay.handle_image(user_id, image, caption.as_deref()).await
                }
                Err(e) => Err(RelayError::MediaFetch(e.to_string())),
            };
            render_reply(user_id, result)
        }
    };

    if let Err(e) = api.send_message(chat_id, &reply).await {
        error!(user_id, "Failed to send reply: {}", e);
    }
}

async fn notify_typing(api: &TelegramApi, chat_id: i64) {
    if let Err(e) = api.send_typing(chat_id).await {
        debug!("Failed to send typing action: {}", e);
    }
}

/// Split a reply into chunks of at most `max_chars` characters, preferring
/// paragraph, line, sentence and word boundaries.
pub fn split_message(message: &str, max_chars: usize) -> Vec<String> {
    let mut chunks = Vec::new();
    let mut remaining = message.trim();

    while !remaining.is_empty() {
        let limit = match remaining.char_indices().nth(max_chars) {
            Some((index, _)) => index,
            None => {
                chunks.push(remaining.to_string());
                break;
            }
        };

        let window = &remaining[..limit];
        let split_at = window
            .rfind("\n\n")
            .or_else(|| window.rfind('\n'))
            .or_else(|| window.rfind(". ").map(|index| index + 1))
            .or_else(|| window.rfind(' '))
            .filter(|&index| index > 0)
            .unwrap_or(limit);

        chunks.push(window[..split_at].trim_end().to_string());
        remaining = remaining[split_at..].trim_start();
    }

    chunks
}

#[cfg(test)]
mod tests {
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    use super::*;
    use crate::relay::conversation_state::{ConversationStore, Role, Turn};
    use crate::relay::testing::ScriptedGateway;

    const TOKEN: &str = "123:abc";

    fn message(value: Value) -> Message {
        serde_json::from_value(value).unwrap()
    }

    #[test]
    fn text_message_is_classified() {
        let update: Update = serde_json::from_value(json!({
            "update_id": 10,
            "message": {
                "message_id": 1,
                "date": 1700000000,
                "chat": { "id": 555, "type": "private" },
                "from": { "id": 42, "is_bot": false, "first_name": "Ann" },
                "text": "2+2=?"
            }
        }))
        .unwrap();

        let message = update.message.unwrap();
        assert_eq!(message.user_id(), 42);
        assert_eq!(message.incoming(None), Some(Incoming::Text("2+2=?".into())));
    }

    #[test]
    fn command_for_another_bot_is_not_ours() {
        let message = message(json!({
            "chat": { "id": -100 },
            "from": { "id": 1 },
            "text": "/start@OtherBot"
        }));

        assert_eq!(
            message.incoming(Some("StepTutorBot")),
            Some(Incoming::Command(Command::Unknown))
        );
    }

    #[test]
    fn start_command_with_bot_name() {
        let message = message(json!({
            "chat": { "id": 1 },
            "from": { "id": 1 },
            "text": "/start@StepTutorBot"
        }));

        assert_eq!(message.incoming(None), Some(Incoming::Command(Command::Start)));
    }

    #[test]
    fn largest_photo_is_picked() {
        let message = message(json!({
            "chat": { "id": 1 },
            "from": { "id": 7 },
            "caption": "Задача 2",
            "photo": [
                { "file_id": "small", "file_unique_id": "a", "width": 90, "height": 60 },
                { "file_id": "large", "file_unique_id": "c", "width": 1280, "height": 853 },
                { "file_id": "medium", "file_unique_id": "b", "width": 320, "height": 213 }
            ]
        }));

        assert_eq!(
            message.incoming(None),
            Some(Incoming::Photo {
                file_id: "large".into(),
                caption: Some("Задача 2".into()),
            })
        );
    }

    #[test]
    fn unsupported_messages_are_ignored() {
        let sticker = message(json!({
            "chat": { "id": 1 },
            "from": { "id": 1 },
            "sticker": { "file_id": "s" }
        }));
        let empty_photo = message(json!({
            "chat": { "id": 1 },
            "photo": []
        }));

        assert_eq!(sticker.incoming(None), None);
        assert_eq!(empty_photo.incoming(None), None);
        assert_eq!(empty_photo.user_id(), 1);
    }

    #[test]
    fn short_messages_are_not_split() {
        assert_eq!(split_message("Шаг 1. Готово.", 4096), vec!["Шаг 1. Готово."]);
        assert!(split_message("   ", 4096).is_empty());
    }

    #[test]
    fn long_messages_split_on_boundaries() {
        let paragraph = "Шаг: сложим числа. ".repeat(30);
        let text = format!("{}\n\n{}", paragraph.trim(), paragraph.trim());

        let chunks = split_message(&text, 700);

        assert!(chunks.len() >= 2);
        for chunk in &chunks {
            assert!(chunk.chars().count() <= 700);
            assert!(!chunk.is_empty());
        }
        assert_eq!(chunks[0], paragraph.trim());
    }

    #[test]
    fn unbroken_text_splits_at_the_limit() {
        let text = "я".repeat(10);

        let chunks = split_message(&text, 4);

        assert_eq!(chunks, vec!["яяяя", "яяяя", "яя"]);
    }

    fn api_for(server: &MockServer) -> TelegramApi {
        TelegramApi::with_base_url(TOKEN, format!("{}/", server.uri())).unwrap()
    }

    async fn mount_ok(server: &MockServer, api_method: &str, result: Value) {
        Mock::given(method("POST"))
            .and(path(format!("/bot{TOKEN}/{api_method}")))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({ "ok": true, "result": result })))
            .mount(server)
            .await;
    }

    async fn sent_texts(server: &MockServer) -> Vec<String> {
        server
            .received_requests()
            .await
            .unwrap_or_default()
            .iter()
            .filter(|request| request.url.path().ends_with("/sendMessage"))
            .map(|request| {
                let body: Value = request.body_json().unwrap();
                body["text"].as_str().unwrap_or_default().to_string()
            })
            .collect()
    }

    fn relay_with(gateway: Arc<ScriptedGateway>) -> ChatRelay {
        ChatRelay::new(Arc::new(ConversationStore::default()), gateway, "persona")
    }

    #[tokio::test]
    async fn api_errors_carry_the_description() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path(format!("/bot{TOKEN}/getMe")))
            .respond_with(ResponseTemplate::new(401).set_body_json(json!({
                "ok": false,
                "error_code": 401,
                "description": "Unauthorized"
            })))
            .mount(&server)
            .await;

        let err = api_for(&server).get_me().await.unwrap_err();

        assert!(err.to_string().contains("Unauthorized"));
    }

    #[tokio::test]
    async fn get_me_reads_the_bot_user() {
        let server = MockServer::start().await;
        mount_ok(&server, "getMe", json!({ "id": 99, "is_bot": true, "username": "StepTutorBot" })).await;

        let me = api_for(&server).get_me().await.unwrap();

        assert_eq!(me.id, 99);
        assert_eq!(me.username.as_deref(), Some("StepTutorBot"));
    }

    #[tokio::test]
    async fn download_resolves_path_then_fetches_bytes() {
        let server = MockServer::start().await;
        mount_ok(&server, "getFile", json!({ "file_id": "large", "file_path": "photos/file_1.jpg" })).await;
        Mock::given(method("GET"))
            .and(path(format!("/file/bot{TOKEN}/photos/file_1.jpg")))
            .respond_with(ResponseTemplate::new(200).set_body_bytes(vec![0xff, 0xd8, 0xff]))
            .mount(&server)
            .await;

        let bytes = api_for(&server).download_file("large").await.unwrap();

        assert_eq!(bytes, vec![0xff, 0xd8, 0xff]);
    }

    #[tokio::test]
    async fn failed_file_download_is_an_error() {
        let server = MockServer::start().await;
        mount_ok(&server, "getFile", json!({ "file_id": "large", "file_path": "photos/gone.jpg" })).await;
        Mock::given(method("GET"))
            .and(path(format!("/file/bot{TOKEN}/photos/gone.jpg")))
            .respond_with(ResponseTemplate::new(404))
            .mount(&server)
            .await;

        let err = api_for(&server).download_file("large").await.unwrap_err();

        assert!(err.to_string().contains("404"));
    }

    #[tokio::test]
    async fn photo_fetch_failure_replies_with_media_error() {
        let server = MockServer::start().await;
        mount_ok(&server, "sendChatAction", json!(true)).await;
        mount_ok(&server, "sendMessage", json!({ "message_id": 2 })).await;
        Mock::given(method("POST"))
            .and(path(format!("/bot{TOKEN}/getFile")))
            .respond_with(ResponseTemplate::new(400).set_body_json(json!({
                "ok": false,
                "description": "Bad Request: invalid file_id"
            })))
            .mount(&server)
            .await;
        let gateway = Arc::new(ScriptedGateway::default());
        let relay = relay_with(Arc::clone(&gateway));
        relay.store().append(7, Role::User, "earlier");
        let photo = message(json!({
            "chat": { "id": 555 },
            "from": { "id": 7 },
            "photo": [{ "file_id": "broken", "width": 10, "height": 10 }]
        }));

        handle_message(&api_for(&server), &relay, photo, Some("StepTutorBot")).await;

        assert_eq!(sent_texts(&server).await, vec![replies::MEDIA_ERROR.to_string()]);
        assert!(gateway.calls().is_empty());
        assert_eq!(relay.store().get(7), vec![Turn::user("earlier")]);
    }

    #[tokio::test]
    async fn text_message_is_answered() {
        let server = MockServer::start().await;
        mount_ok(&server, "sendChatAction", json!(true)).await;
        mount_ok(&server, "sendMessage", json!({ "message_id": 2 })).await;
        let relay = relay_with(Arc::new(ScriptedGateway::default()));
        let text = message(json!({
            "chat": { "id": 555 },
            "from": { "id": 7 },
            "text": "2+2=?"
        }));

        handle_message(&api_for(&server), &relay, text, Some("StepTutorBot")).await;

        assert_eq!(sent_texts(&server).await, vec!["answer to 2+2=?".to_string()]);
        assert_eq!(relay.store().len(7), 2);
    }

    #[tokio::test]
    async fn start_for_another_bot_keeps_history() {
        let server = MockServer::start().await;
        mount_ok(&server, "sendMessage", json!({ "message_id": 2 })).await;
        let relay = relay_with(Arc::new(ScriptedGateway::default()));
        relay.store().append(7, Role::User, "earlier");
        let start = message(json!({
            "chat": { "id": -100 },
            "from": { "id": 7 },
            "text": "/start@OtherBot"
        }));

        handle_message(&api_for(&server), &relay, start, Some("StepTutorBot")).await;

        assert!(sent_texts(&server).await.is_empty());
        assert_eq!(relay.store().len(7), 1);
    }
}
