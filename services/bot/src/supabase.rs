//! Supabase (PostgREST) adapter for the backend store.
//!
//! Three tables: `listening_users` (registered users, upserted on /start),
//! `listening_sessions` (one row per practice), and `audio_files` (metadata
//! per stored clip). The core's `SessionPatch` serializes directly into the
//! sparse PATCH body.

use anyhow::{Context, Result, bail};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use listening_core::backend::{
    AudioKind, BackendStore, SessionId, SessionPatch, SessionStatus, SessionSummary,
};
use listening_core::event::{MediaRef, UserId, UserProfile};
use reqwest::RequestBuilder;
use serde::Deserialize;
use serde_json::{Value, json};

#[derive(Debug, Clone)]
pub struct SupabaseStore {
    http: reqwest::Client,
    base: String,
    anon_key: String,
}

impl SupabaseStore {
    pub fn new(http: reqwest::Client, base_url: String, anon_key: String) -> Self {
        Self {
            http,
            base: base_url,
            anon_key,
        }
    }

    fn table(&self, name: &str) -> String {
        format!("{}/rest/v1/{name}", self.base)
    }

    fn authorized(&self, request: RequestBuilder) -> RequestBuilder {
        request
            .header("apikey", &self.anon_key)
            .bearer_auth(&self.anon_key)
    }

    async fn expect_success(request: RequestBuilder, what: &str) -> Result<reqwest::Response> {
        let response = request.send().await.with_context(|| format!("{what}: request failed"))?;
        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            bail!("{what}: status {status}: {body}");
        }
        Ok(response)
    }
}

/// PostgREST returns numeric or uuid primary keys depending on the schema;
/// both are carried as the session id's string form.
fn id_from_value(value: &Value) -> String {
    match value.as_str() {
        Some(s) => s.to_string(),
        None => value.to_string(),
    }
}

#[derive(Debug, Deserialize)]
struct CreatedRow {
    id: Value,
}

#[derive(Debug, Deserialize)]
struct SessionRow {
    id: Value,
    started_at: DateTime<Utc>,
    status: SessionStatus,
    what_heard_text: Option<String>,
    session_duration_seconds: Option<u32>,
    environment_audio_file_id: Option<String>,
}

impl From<SessionRow> for SessionSummary {
    fn from(row: SessionRow) -> Self {
        SessionSummary {
            id: SessionId(id_from_value(&row.id)),
            started_at: row.started_at,
            status: row.status,
            what_heard_text: row.what_heard_text,
            session_duration_seconds: row.session_duration_seconds,
            environment_audio_file_id: row.environment_audio_file_id.map(MediaRef),
        }
    }
}

#[derive(Debug, Deserialize)]
struct AudioRow {
    telegram_file_id: String,
}

#[async_trait]
impl BackendStore for SupabaseStore {
    async fn upsert_user(&self, user: UserId, profile: &UserProfile) -> Result<()> {
        let body = json!({
            "telegram_user_id": user.0,
            "username": profile.username,
            "first_name": profile.first_name,
        });
        let request = self
            .authorized(self.http.post(self.table("listening_users")))
            .header("Prefer", "resolution=merge-duplicates")
            .json(&body);
        Self::expect_success(request, "upsert user").await?;
        Ok(())
    }

    async fn create_session(&self, user: UserId) -> Result<SessionId> {
        let body = json!({
            "user_id": user.0,
            "status": "started",
            "started_at": Utc::now(),
        });
        let request = self
            .authorized(self.http.post(self.table("listening_sessions")))
            .header("Prefer", "return=representation")
            .json(&body);
        let rows: Vec<CreatedRow> = Self::expect_success(request, "create session")
            .await?
            .json()
            .await
            .context("create session: invalid response body")?;
        let row = rows.first().context("create session: empty response")?;
        Ok(SessionId(id_from_value(&row.id)))
    }

    async fn patch_session(&self, session: &SessionId, patch: SessionPatch) -> Result<()> {
        let url = format!("{}?id=eq.{}", self.table("listening_sessions"), session.0);
        let request = self.authorized(self.http.patch(url)).json(&patch);
        Self::expect_success(request, "patch session").await?;
        Ok(())
    }

    async fn list_sessions(
        &self,
        user: UserId,
        page: u32,
        page_size: usize,
    ) -> Result<Vec<SessionSummary>> {
        let url = format!(
            "{}?user_id=eq.{}&select=id,started_at,status,what_heard_text,\
             session_duration_seconds,environment_audio_file_id\
             &order=started_at.desc&limit={}&offset={}",
            self.table("listening_sessions"),
            user.0,
            page_size,
            page as usize * page_size,
        );
        let rows: Vec<SessionRow> = Self::expect_success(self.authorized(self.http.get(url)), "list sessions")
            .await?
            .json()
            .await
            .context("list sessions: invalid response body")?;
        Ok(rows.into_iter().map(SessionSummary::from).collect())
    }

    async fn record_audio(
        &self,
        session: &SessionId,
        media: &MediaRef,
        kind: AudioKind,
        duration_seconds: Option<u32>,
    ) -> Result<()> {
        let body = json!({
            "session_id": session.0,
            "file_type": kind.as_str(),
            "telegram_file_id": media.0,
            "duration_seconds": duration_seconds,
            "created_at": Utc::now(),
        });
        let request = self
            .authorized(self.http.post(self.table("audio_files")))
            .json(&body);
        Self::expect_success(request, "record audio metadata").await?;
        Ok(())
    }

    async fn find_audio(&self, session: &SessionId, kind: AudioKind) -> Result<Option<MediaRef>> {
        let url = format!(
            "{}?session_id=eq.{}&file_type=eq.{}&select=telegram_file_id&limit=1",
            self.table("audio_files"),
            session.0,
            kind.as_str(),
        );
        let rows: Vec<AudioRow> = Self::expect_success(self.authorized(self.http.get(url)), "find audio")
            .await?
            .json()
            .await
            .context("find audio: invalid response body")?;
        Ok(rows.into_iter().next().map(|row| MediaRef(row.telegram_file_id)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ids_survive_both_uuid_and_numeric_schemas() {
        assert_eq!(
            id_from_value(&json!("3f2b6c2e-9a41-4a5e-8a8e-0c1d2e3f4a5b")),
            "3f2b6c2e-9a41-4a5e-8a8e-0c1d2e3f4a5b"
        );
        assert_eq!(id_from_value(&json!(1042)), "1042");
    }

    #[test]
    fn session_row_maps_into_a_summary() {
        let row: SessionRow = serde_json::from_value(json!({
            "id": 7,
            "started_at": "2026-08-20T09:00:00Z",
            "status": "completed",
            "what_heard_text": "rain on the window",
            "session_duration_seconds": 120,
            "environment_audio_file_id": "AwACAgIAAxkBAaIK"
        }))
        .unwrap();
        let summary = SessionSummary::from(row);
        assert_eq!(summary.id, SessionId("7".to_string()));
        assert_eq!(summary.status, SessionStatus::Completed);
        assert_eq!(
            summary.environment_audio_file_id,
            Some(MediaRef("AwACAgIAAxkBAaIK".to_string()))
        );
    }
}
