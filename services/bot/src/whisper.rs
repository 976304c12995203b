//! Voice transcription via the OpenAI audio API.
//!
//! The clip is fetched from the chat transport first (file ids are not
//! downloadable by third parties), then posted as multipart form data. Any
//! failure here is non-fatal: the state machine stores a placeholder
//! transcript and the practice completes regardless.

use anyhow::{Context, Result};
use async_trait::async_trait;
use listening_core::event::MediaRef;
use listening_core::transcribe::Transcriber;
use reqwest::multipart::{Form, Part};
use serde::Deserialize;

use crate::telegram::TelegramApi;

const TRANSCRIPTION_URL: &str = "https://api.openai.com/v1/audio/transcriptions";
const MODEL: &str = "whisper-1";

#[derive(Debug, Deserialize)]
struct TranscriptionOut {
    text: String,
}

pub struct WhisperTranscriber {
    http: reqwest::Client,
    telegram: TelegramApi,
    api_key: Option<String>,
}

impl WhisperTranscriber {
    pub fn new(http: reqwest::Client, telegram: TelegramApi, api_key: Option<String>) -> Self {
        Self {
            http,
            telegram,
            api_key,
        }
    }
}

#[async_trait]
impl Transcriber for WhisperTranscriber {
    async fn transcribe(&self, media: &MediaRef) -> Result<String> {
        let api_key = self
            .api_key
            .as_ref()
            .context("transcription disabled: OPENAI_API_KEY is not set")?;

        let audio = self
            .telegram
            .download_voice(media)
            .await
            .context("could not download the voice clip")?;

        let part = Part::bytes(audio)
            .file_name("voice.ogg")
            .mime_str("audio/ogg")?;
        let form = Form::new().text("model", MODEL).part("file", part);

        let out: TranscriptionOut = self
            .http
            .post(TRANSCRIPTION_URL)
            .bearer_auth(api_key)
            .multipart(form)
            .send()
            .await?
            .error_for_status()?
            .json()
            .await
            .context("invalid transcription response")?;
        Ok(out.text)
    }
}
