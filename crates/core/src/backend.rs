//! Persistence collaborator: the backend data store owns all durable records.
//!
//! The core never caches session rows; it writes through this trait and
//! forgets. `SessionPatch` doubles as the sparse PATCH body the PostgREST
//! adapter sends, which is why the field names here match the store's columns.

use crate::event::{MediaRef, UserId, UserProfile};
use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
#[cfg(test)]
use mockall::automock;
use serde::{Deserialize, Serialize};

/// Identifier of a persisted practice session, minted by the store.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionId(pub String);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SessionStatus {
    Started,
    Completed,
}

/// Which recording a stored audio row describes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AudioKind {
    /// The ambient sound captured during the listening window itself.
    Environment,
    /// The spoken answer to "what did you hear".
    Reflection,
}

impl AudioKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            AudioKind::Environment => "environment",
            AudioKind::Reflection => "reflection",
        }
    }
}

/// Sparse update applied to a session row. Unset fields are left untouched.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct SessionPatch {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub environment_audio_file_id: Option<MediaRef>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub session_duration_seconds: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub environment_audio_message_id: Option<i64>,
    /// Canonical answer text: verbatim text, voice transcript, or photo
    /// caption, whichever arrived.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub what_heard_text: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reflection_audio_file_id: Option<MediaRef>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reflection_transcription: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub photo_file_id: Option<MediaRef>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub status: Option<SessionStatus>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
}

/// One row of the user's practice history, as the library and stats flows
/// need it.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct SessionSummary {
    pub id: SessionId,
    pub started_at: DateTime<Utc>,
    pub status: SessionStatus,
    pub what_heard_text: Option<String>,
    pub session_duration_seconds: Option<u32>,
    pub environment_audio_file_id: Option<MediaRef>,
}

#[async_trait]
#[cfg_attr(test, automock)]
pub trait BackendStore {
    /// Idempotent registration; called on every `/start`.
    async fn upsert_user(&self, user: UserId, profile: &UserProfile) -> Result<()>;

    /// Opens a new session with `status = started`; the returned id is the
    /// handle every later write uses.
    async fn create_session(&self, user: UserId) -> Result<SessionId>;

    async fn patch_session(&self, session: &SessionId, patch: SessionPatch) -> Result<()>;

    /// Most recent sessions first; `page` is zero-based.
    async fn list_sessions(
        &self,
        user: UserId,
        page: u32,
        page_size: usize,
    ) -> Result<Vec<SessionSummary>>;

    async fn record_audio(
        &self,
        session: &SessionId,
        media: &MediaRef,
        kind: AudioKind,
        duration_seconds: Option<u32>,
    ) -> Result<()>;

    /// Looks up a stored audio row for sessions whose summary predates the
    /// media columns.
    async fn find_audio(&self, session: &SessionId, kind: AudioKind) -> Result<Option<MediaRef>>;
}
