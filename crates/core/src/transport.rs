//! Outbound side of the chat transport, as seen by the state machine.
//!
//! The concrete implementation (Telegram in the shipped service) lives in the
//! service crate; the core only needs these few operations. In unit tests the
//! trait is replaced by a `mockall` mock so every transition can assert
//! exactly which messages went out.

use crate::event::{ChatId, MediaRef, MessageId};
use anyhow::Result;
use async_trait::async_trait;
#[cfg(test)]
use mockall::automock;

/// One inline button: a visible label plus an encoded callback payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Button {
    pub label: String,
    pub payload: String,
}

impl Button {
    pub fn new(label: impl Into<String>, payload: impl Into<String>) -> Self {
        Self {
            label: label.into(),
            payload: payload.into(),
        }
    }
}

/// Rows of inline buttons attached to a message.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Keyboard {
    pub rows: Vec<Vec<Button>>,
}

impl Keyboard {
    pub fn row(mut self, buttons: Vec<Button>) -> Self {
        self.rows.push(buttons);
        self
    }
}

/// Result of an in-place edit. "Not modified" is a normal outcome for the
/// elapsed-time display (two ticks inside the same second render identically)
/// and must not be treated as a fault.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EditOutcome {
    Edited,
    NotModified,
}

#[async_trait]
#[cfg_attr(test, automock)]
pub trait ChatTransport {
    async fn send_text(
        &self,
        chat: ChatId,
        text: &str,
        keyboard: Option<Keyboard>,
    ) -> Result<MessageId>;

    async fn edit_text(
        &self,
        chat: ChatId,
        message: MessageId,
        text: &str,
        keyboard: Option<Keyboard>,
    ) -> Result<EditOutcome>;

    async fn delete_message(&self, chat: ChatId, message: MessageId) -> Result<()>;

    /// Replays a previously recorded clip by its media reference.
    async fn send_voice(&self, chat: ChatId, media: &MediaRef) -> Result<()>;

    /// Acknowledges a button press so the client stops its spinner.
    async fn answer_callback(&self, callback_id: &str) -> Result<()>;
}
