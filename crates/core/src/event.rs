//! The single event vocabulary of the bot.
//!
//! Inbound chat traffic and timer fires are both expressed as [`Event`]s and
//! flow through one `tokio::sync::mpsc` channel, so every mutation of per-user
//! runtime state happens inside the dispatcher loop. The transport adapter
//! produces the inbound variants; the timer service produces `Tick` and
//! `ListeningDeadline`.

use serde::{Deserialize, Serialize};

/// Numeric user identity handed out by the chat transport.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct UserId(pub i64);

/// Chat the conversation happens in (for direct chats this equals the user id).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ChatId(pub i64);

/// Reference to a message we may later edit or delete in place.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct MessageId(pub i64);

/// Opaque reference to a playable media object (a transport file id).
///
/// These can be far longer than a callback payload allows, which is why the
/// library flow never embeds them in buttons directly (see `library`).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MediaRef(pub String);

/// Profile details attached to a command, used for the idempotent user upsert.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct UserProfile {
    pub username: Option<String>,
    pub first_name: Option<String>,
}

/// Everything the dispatcher can be asked to handle.
#[derive(Debug, Clone)]
pub enum Event {
    /// A slash command, name without the leading `/`.
    Command {
        name: String,
        user: UserId,
        chat: ChatId,
        profile: UserProfile,
    },
    Text {
        user: UserId,
        chat: ChatId,
        text: String,
    },
    Voice {
        user: UserId,
        chat: ChatId,
        media: MediaRef,
        duration_seconds: u32,
        message: MessageId,
    },
    Photo {
        user: UserId,
        chat: ChatId,
        media: MediaRef,
        caption: Option<String>,
    },
    ButtonPress {
        user: UserId,
        chat: ChatId,
        payload: String,
        message: MessageId,
        callback_id: String,
    },
    /// Repeating timer fire for the visible elapsed-time display.
    Tick { user: UserId, chat: ChatId },
    /// One-shot fire of the optional fixed practice duration.
    ListeningDeadline { user: UserId, chat: ChatId },
}

/// Hard ceiling the reference transport imposes on callback payloads.
pub const MAX_PAYLOAD_BYTES: usize = 64;

/// Structured form of a button callback payload.
///
/// Page indices are small and ride in the payload directly; media references
/// are not, and go through the token cache instead.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CallbackPayload {
    StartPractice,
    ShowStats,
    HowItWorks,
    LibraryPage(u32),
    Play(String),
}

impl CallbackPayload {
    pub fn encode(&self) -> String {
        let encoded = match self {
            CallbackPayload::StartPractice => "start_practice".to_string(),
            CallbackPayload::ShowStats => "show_stats".to_string(),
            CallbackPayload::HowItWorks => "how_it_works".to_string(),
            CallbackPayload::LibraryPage(page) => format!("library:{page}"),
            CallbackPayload::Play(token) => format!("play:{token}"),
        };
        // Enforced unconditionally: every payload form is statically short
        // (tokens have a fixed length, pages are u32), so tripping this is a
        // construction bug, not an input condition.
        assert!(
            encoded.len() <= MAX_PAYLOAD_BYTES,
            "callback payload exceeds transport ceiling: {encoded}"
        );
        encoded
    }

    pub fn parse(raw: &str) -> Option<Self> {
        match raw {
            "start_practice" => Some(CallbackPayload::StartPractice),
            "show_stats" => Some(CallbackPayload::ShowStats),
            "how_it_works" => Some(CallbackPayload::HowItWorks),
            _ => {
                if let Some(page) = raw.strip_prefix("library:") {
                    page.parse().ok().map(CallbackPayload::LibraryPage)
                } else {
                    raw.strip_prefix("play:")
                        .map(|token| CallbackPayload::Play(token.to_string()))
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn payload_round_trips() {
        let payloads = [
            CallbackPayload::StartPractice,
            CallbackPayload::ShowStats,
            CallbackPayload::HowItWorks,
            CallbackPayload::LibraryPage(3),
            CallbackPayload::Play("a1B2c3D4e5F6g7H8".to_string()),
        ];
        for payload in payloads {
            assert_eq!(CallbackPayload::parse(&payload.encode()), Some(payload));
        }
    }

    #[test]
    fn payloads_stay_under_transport_ceiling() {
        let longest = CallbackPayload::Play("x".repeat(crate::library::TOKEN_LEN)).encode();
        assert!(longest.len() <= MAX_PAYLOAD_BYTES);
        assert!(CallbackPayload::LibraryPage(u32::MAX).encode().len() <= MAX_PAYLOAD_BYTES);
    }

    #[test]
    fn garbage_payload_is_rejected() {
        assert_eq!(CallbackPayload::parse("library:not-a-number"), None);
        assert_eq!(CallbackPayload::parse(""), None);
        assert_eq!(CallbackPayload::parse("replay"), None);
    }
}
