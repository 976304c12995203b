//! Telegram Bot API adapter.
//!
//! Implements the core's `ChatTransport` over plain HTTP and runs the
//! `getUpdates` long-poll loop that translates inbound updates into core
//! [`Event`]s on the shared channel. All per-user state lives in the core;
//! this module is stateless apart from the poll offset.

use anyhow::{Context, Result, anyhow};
use async_trait::async_trait;
use listening_core::event::{
    ChatId, Event, MediaRef, MessageId, UserId, UserProfile,
};
use listening_core::transport::{ChatTransport, EditOutcome, Keyboard};
use serde::Deserialize;
use serde::de::DeserializeOwned;
use serde_json::{Value, json};
use std::time::Duration;
use tokio::sync::mpsc;

use crate::config::POLL_TIMEOUT_SECS;

#[derive(Debug, thiserror::Error)]
pub enum TelegramError {
    /// The API answered `ok: false`.
    #[error("telegram api error: {0}")]
    Api(String),
    #[error(transparent)]
    Http(#[from] reqwest::Error),
}

#[derive(Debug, Deserialize)]
struct ApiResponse<T> {
    ok: bool,
    result: Option<T>,
    description: Option<String>,
}

#[derive(Debug, Deserialize)]
struct SentMessage {
    message_id: i64,
}

#[derive(Debug, Deserialize)]
struct FileInfo {
    file_path: Option<String>,
}

/// Thin client for the Bot API. Cheap to clone; the poller, the state
/// machine, and the transcriber each hold their own copy.
#[derive(Debug, Clone)]
pub struct TelegramApi {
    http: reqwest::Client,
    base: String,
    file_base: String,
}

impl TelegramApi {
    pub fn new(http: reqwest::Client, token: &str) -> Self {
        Self {
            http,
            base: format!("https://api.telegram.org/bot{token}"),
            file_base: format!("https://api.telegram.org/file/bot{token}"),
        }
    }

    async fn call<T: DeserializeOwned>(
        &self,
        method: &str,
        body: &Value,
    ) -> Result<T, TelegramError> {
        let response: ApiResponse<T> = self
            .http
            .post(format!("{}/{method}", self.base))
            .json(body)
            .send()
            .await?
            .json()
            .await?;
        if response.ok {
            response.result.ok_or_else(|| {
                TelegramError::Api(format!("{method}: ok response without a result"))
            })
        } else {
            Err(TelegramError::Api(
                response
                    .description
                    .unwrap_or_else(|| format!("{method}: unspecified error")),
            ))
        }
    }

    async fn get_updates(&self, offset: i64) -> Result<Vec<Update>, TelegramError> {
        self.call(
            "getUpdates",
            &json!({
                "offset": offset,
                "timeout": POLL_TIMEOUT_SECS,
                "allowed_updates": ["message", "callback_query"],
            }),
        )
        .await
    }

    /// Fetches the raw bytes of an uploaded voice clip, for transcription.
    pub async fn download_voice(&self, media: &MediaRef) -> Result<Vec<u8>> {
        let info: FileInfo = self
            .call("getFile", &json!({ "file_id": media.0 }))
            .await
            .context("getFile failed")?;
        let path = info.file_path.context("getFile returned no file path")?;
        let bytes = self
            .http
            .get(format!("{}/{path}", self.file_base))
            .send()
            .await?
            .error_for_status()?
            .bytes()
            .await?;
        Ok(bytes.to_vec())
    }
}

fn reply_markup(keyboard: &Keyboard) -> Value {
    let rows: Vec<Vec<Value>> = keyboard
        .rows
        .iter()
        .map(|row| {
            row.iter()
                .map(|b| json!({ "text": b.label, "callback_data": b.payload }))
                .collect()
        })
        .collect();
    json!({ "inline_keyboard": rows })
}

#[async_trait]
impl ChatTransport for TelegramApi {
    async fn send_text(
        &self,
        chat: ChatId,
        text: &str,
        keyboard: Option<Keyboard>,
    ) -> Result<MessageId> {
        let mut body = json!({ "chat_id": chat.0, "text": text });
        if let Some(keyboard) = &keyboard {
            body["reply_markup"] = reply_markup(keyboard);
        }
        let sent: SentMessage = self.call("sendMessage", &body).await?;
        Ok(MessageId(sent.message_id))
    }

    async fn edit_text(
        &self,
        chat: ChatId,
        message: MessageId,
        text: &str,
        keyboard: Option<Keyboard>,
    ) -> Result<EditOutcome> {
        let mut body = json!({
            "chat_id": chat.0,
            "message_id": message.0,
            "text": text,
        });
        if let Some(keyboard) = &keyboard {
            body["reply_markup"] = reply_markup(keyboard);
        }
        match self.call::<SentMessage>("editMessageText", &body).await {
            Ok(_) => Ok(EditOutcome::Edited),
            // Editing to identical content is a normal outcome for the
            // elapsed-time display, not a failure.
            Err(TelegramError::Api(description))
                if description.contains("message is not modified") =>
            {
                Ok(EditOutcome::NotModified)
            }
            Err(error) => Err(error.into()),
        }
    }

    async fn delete_message(&self, chat: ChatId, message: MessageId) -> Result<()> {
        let _: bool = self
            .call(
                "deleteMessage",
                &json!({ "chat_id": chat.0, "message_id": message.0 }),
            )
            .await?;
        Ok(())
    }

    async fn send_voice(&self, chat: ChatId, media: &MediaRef) -> Result<()> {
        let _: SentMessage = self
            .call("sendVoice", &json!({ "chat_id": chat.0, "voice": media.0 }))
            .await?;
        Ok(())
    }

    async fn answer_callback(&self, callback_id: &str) -> Result<()> {
        let _: bool = self
            .call(
                "answerCallbackQuery",
                &json!({ "callback_query_id": callback_id }),
            )
            .await?;
        Ok(())
    }
}

// --- Inbound updates ---

#[derive(Debug, Deserialize)]
pub struct Update {
    update_id: i64,
    message: Option<IncomingMessage>,
    callback_query: Option<CallbackQuery>,
}

#[derive(Debug, Deserialize)]
struct IncomingMessage {
    message_id: i64,
    from: Option<Sender>,
    chat: ChatInfo,
    text: Option<String>,
    caption: Option<String>,
    voice: Option<VoiceAttachment>,
    photo: Option<Vec<PhotoSize>>,
}

#[derive(Debug, Deserialize)]
struct Sender {
    id: i64,
    username: Option<String>,
    first_name: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ChatInfo {
    id: i64,
}

#[derive(Debug, Deserialize)]
struct VoiceAttachment {
    file_id: String,
    duration: u32,
}

#[derive(Debug, Deserialize)]
struct PhotoSize {
    file_id: String,
    file_size: Option<i64>,
}

#[derive(Debug, Deserialize)]
struct CallbackQuery {
    id: String,
    from: Sender,
    data: Option<String>,
    message: Option<CallbackMessage>,
}

#[derive(Debug, Deserialize)]
struct CallbackMessage {
    message_id: i64,
    chat: ChatInfo,
}

/// Translates one update into a core event, or `None` for update kinds the
/// bot does not handle (joined channels, edits, stickers, ...).
fn map_update(update: Update) -> Option<Event> {
    if let Some(query) = update.callback_query {
        let message = query.message?;
        return Some(Event::ButtonPress {
            user: UserId(query.from.id),
            chat: ChatId(message.chat.id),
            payload: query.data?,
            message: MessageId(message.message_id),
            callback_id: query.id,
        });
    }

    let message = update.message?;
    let from = message.from?;
    let user = UserId(from.id);
    let chat = ChatId(message.chat.id);

    if let Some(voice) = message.voice {
        return Some(Event::Voice {
            user,
            chat,
            media: MediaRef(voice.file_id),
            duration_seconds: voice.duration,
            message: MessageId(message.message_id),
        });
    }
    if let Some(photo) = message.photo {
        // Telegram sends every thumbnail size; keep the largest.
        let media = photo
            .into_iter()
            .max_by_key(|p| p.file_size.unwrap_or(0))
            .map(|p| MediaRef(p.file_id))?;
        return Some(Event::Photo {
            user,
            chat,
            media,
            caption: message.caption,
        });
    }
    let text = message.text?;
    if let Some(command) = text.strip_prefix('/') {
        let name = command
            .split_whitespace()
            .next()?
            .split('@')
            .next()?
            .to_string();
        return Some(Event::Command {
            name,
            user,
            chat,
            profile: UserProfile {
                username: from.username,
                first_name: from.first_name,
            },
        });
    }
    Some(Event::Text { user, chat, text })
}

/// Long-poll loop feeding the shared event channel. Poll failures back off
/// and retry; the loop only stops when the dispatcher side goes away.
pub struct UpdatePoller {
    api: TelegramApi,
    events: mpsc::Sender<Event>,
}

impl UpdatePoller {
    pub fn new(api: TelegramApi, events: mpsc::Sender<Event>) -> Self {
        Self { api, events }
    }

    pub async fn run(self) -> Result<()> {
        let mut offset = 0i64;
        loop {
            match self.api.get_updates(offset).await {
                Ok(updates) => {
                    for update in updates {
                        offset = offset.max(update.update_id + 1);
                        let Some(event) = map_update(update) else {
                            continue;
                        };
                        if self.events.send(event).await.is_err() {
                            return Err(anyhow!("event channel closed, stopping poller"));
                        }
                    }
                }
                Err(error) => {
                    tracing::warn!(%error, "getUpdates failed, backing off");
                    tokio::time::sleep(Duration::from_secs(2)).await;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn update(body: serde_json::Value) -> Update {
        serde_json::from_value(body).unwrap()
    }

    #[test]
    fn command_with_bot_mention_is_stripped() {
        let event = map_update(update(json!({
            "update_id": 1,
            "message": {
                "message_id": 10,
                "from": {"id": 7, "username": "ada", "first_name": "Ada"},
                "chat": {"id": 7},
                "text": "/listen@deep_listening_bot"
            }
        })))
        .unwrap();
        match event {
            Event::Command { name, user, profile, .. } => {
                assert_eq!(name, "listen");
                assert_eq!(user, UserId(7));
                assert_eq!(profile.username.as_deref(), Some("ada"));
            }
            other => panic!("expected a command, got {other:?}"),
        }
    }

    #[test]
    fn voice_message_keeps_duration_and_message_id() {
        let event = map_update(update(json!({
            "update_id": 2,
            "message": {
                "message_id": 11,
                "from": {"id": 7},
                "chat": {"id": 7},
                "voice": {"file_id": "AwACAgIAAxkBAaIK", "duration": 42}
            }
        })))
        .unwrap();
        match event {
            Event::Voice { media, duration_seconds, message, .. } => {
                assert_eq!(media.0, "AwACAgIAAxkBAaIK");
                assert_eq!(duration_seconds, 42);
                assert_eq!(message, MessageId(11));
            }
            other => panic!("expected a voice event, got {other:?}"),
        }
    }

    #[test]
    fn largest_photo_size_wins() {
        let event = map_update(update(json!({
            "update_id": 3,
            "message": {
                "message_id": 12,
                "from": {"id": 7},
                "chat": {"id": 7},
                "photo": [
                    {"file_id": "small", "file_size": 1000},
                    {"file_id": "large", "file_size": 90000},
                    {"file_id": "medium", "file_size": 20000}
                ],
                "caption": "the street below"
            }
        })))
        .unwrap();
        match event {
            Event::Photo { media, caption, .. } => {
                assert_eq!(media.0, "large");
                assert_eq!(caption.as_deref(), Some("the street below"));
            }
            other => panic!("expected a photo event, got {other:?}"),
        }
    }

    #[test]
    fn callback_query_maps_to_button_press() {
        let event = map_update(update(json!({
            "update_id": 4,
            "callback_query": {
                "id": "cb-77",
                "from": {"id": 7},
                "data": "start_practice",
                "message": {"message_id": 13, "chat": {"id": 7}}
            }
        })))
        .unwrap();
        match event {
            Event::ButtonPress { payload, message, callback_id, .. } => {
                assert_eq!(payload, "start_practice");
                assert_eq!(message, MessageId(13));
                assert_eq!(callback_id, "cb-77");
            }
            other => panic!("expected a button press, got {other:?}"),
        }
    }

    #[test]
    fn plain_text_maps_to_text_event() {
        let event = map_update(update(json!({
            "update_id": 5,
            "message": {
                "message_id": 14,
                "from": {"id": 7},
                "chat": {"id": 7},
                "text": "birds and traffic"
            }
        })))
        .unwrap();
        assert!(matches!(event, Event::Text { text, .. } if text == "birds and traffic"));
    }

    #[test]
    fn keyboard_serializes_to_inline_markup() {
        let keyboard = Keyboard::default().row(vec![
            listening_core::transport::Button::new("▶️ play", "play:abc"),
        ]);
        assert_eq!(
            reply_markup(&keyboard),
            json!({"inline_keyboard": [[{"text": "▶️ play", "callback_data": "play:abc"}]]})
        );
    }
}
