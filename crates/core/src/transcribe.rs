//! Speech-to-text collaborator.

use crate::event::MediaRef;
use anyhow::Result;
use async_trait::async_trait;
#[cfg(test)]
use mockall::automock;

/// Turns a recorded voice clip into text.
///
/// Failure is expected and cheap: the caller substitutes a placeholder
/// transcript and completes the practice anyway.
#[async_trait]
#[cfg_attr(test, automock)]
pub trait Transcriber {
    async fn transcribe(&self, media: &MediaRef) -> Result<String>;
}
