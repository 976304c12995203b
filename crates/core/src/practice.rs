//! The practice state machine: phase transitions, timer lifecycle, and
//! routing of ambiguous input.
//!
//! Every inbound event lands in [`PracticeFlow::handle_event`]. The flow
//! consults the [`SessionStore`] for the user's current phase, applies the
//! transition, and talks to the collaborators. Phase is derived solely from
//! the in-memory runtime state, never from the persisted session's status, so
//! routing stays correct even when a backend write races a read elsewhere.

use crate::backend::{AudioKind, BackendStore, SessionPatch, SessionStatus};
use crate::event::{
    CallbackPayload, ChatId, Event, MediaRef, MessageId, UserId, UserProfile,
};
use crate::library::{LibraryTokenCache, keywords, page_nav};
use crate::session::{Phase, SessionRuntimeState, SessionStore};
use crate::timer::{TimerKey, TimerService};
use crate::transcribe::Transcriber;
use crate::transport::{Button, ChatTransport, Keyboard};
use anyhow::{Context, Result};
use chrono::Utc;
use std::time::Duration;
use tokio::time::Instant;

const WELCOME: &str = "\
🎧 Welcome to the Deep Listening Bot!\n\n\
I'll help you build a practice of mindful listening.\n\n\
Ready to start right now?";

const INSTRUCTIONS: &str = "\
🎧 Let's begin a deep listening practice!\n\n\
📍 Find a comfortable spot\n\
📱 Press and hold the voice record button\n\
👂 Relax, take three deep breaths, close your eyes\n\
⏰ Listen to the sounds around you for as long as you like";

const REFLECTION_PROMPT: &str = "\
🤔 What did you hear?\n\n\
Describe the sounds you noticed during the practice:\n\n\
📝 Write it as text\n\
🎙️ Or record a voice message\n\
📷 Attach a photo if you like";

const THANKS_TEXT: &str = "📝 Thank you for sharing!";
const THANKS_VOICE: &str = "🎙️ Thank you for sharing!";
const THANKS_PHOTO: &str = "📸 Thank you for sharing!";

const START_PROMPT: &str =
    "Hi! Start a practice with /listen or press 🎧 What do you hear now?";
const OUT_OF_PHASE: &str =
    "Start a practice first with /listen or press 🎧 What do you hear now?";
const TRY_AGAIN: &str = "Something went wrong. Please try again.";
const LINK_EXPIRED: &str =
    "That replay link has expired. Open /library again for a fresh list.";
const LIBRARY_EMPTY: &str =
    "🎧 No recordings yet. Finish a practice with a voice clip and it will show up here.";
const LIBRARY_HEADER: &str = "🎧 Your recordings";

const HOW_IT_WORKS: &str = "\
ℹ️ How the Deep Listening Bot works:\n\n\
🎧 Practice listening — find a comfortable spot and listen to the sounds around you\n\
🤔 Share the experience — tell me what you heard, in text or voice\n\
🔄 A continuous cycle — after every answer I invite you to a new practice\n\
📊 Track your progress — check the stats of your practices";

/// Canonical text stored when a voice answer could not be transcribed.
const TRANSCRIPT_PLACEHOLDER: &str = "[voice message, transcription unavailable]";
/// Canonical text stored for a photo answer without a caption.
const CAPTION_PLACEHOLDER: &str = "[photo without caption]";

/// How many recent sessions the stats view scans.
const STATS_SCAN_LIMIT: usize = 200;

/// Tunables of the flow. Defaults follow the reference behavior: a visible
/// tick every 15 seconds, five library rows per page, a one second pause
/// before the reflection prompt, and a fully user-controlled duration.
#[derive(Debug, Clone)]
pub struct FlowSettings {
    pub tick_interval: Duration,
    pub page_size: usize,
    pub completion_pause: Duration,
    /// Legacy fixed-duration alternative: when set, the listening phase is
    /// ended for the user once the limit elapses.
    pub practice_time_limit: Option<Duration>,
}

impl Default for FlowSettings {
    fn default() -> Self {
        Self {
            tick_interval: Duration::from_secs(15),
            page_size: 5,
            completion_pause: Duration::from_secs(1),
            practice_time_limit: None,
        }
    }
}

/// Internal start request. Both the `/listen` command and the
/// `start_practice` button construct one of these, so the two entry points
/// share a single code path.
#[derive(Debug, Clone, Copy)]
pub struct StartRequest {
    pub user: UserId,
    pub chat: ChatId,
}

/// The per-user practice state machine and its collaborators.
pub struct PracticeFlow<B, T, X> {
    sessions: SessionStore,
    library: LibraryTokenCache,
    timers: TimerService,
    backend: B,
    transport: T,
    transcriber: X,
    settings: FlowSettings,
}

impl<B, T, X> PracticeFlow<B, T, X>
where
    B: BackendStore,
    T: ChatTransport,
    X: Transcriber,
{
    pub fn new(backend: B, transport: T, transcriber: X, timers: TimerService) -> Self {
        Self::with_settings(backend, transport, transcriber, timers, FlowSettings::default())
    }

    pub fn with_settings(
        backend: B,
        transport: T,
        transcriber: X,
        timers: TimerService,
        settings: FlowSettings,
    ) -> Self {
        Self {
            sessions: SessionStore::new(),
            library: LibraryTokenCache::default(),
            timers,
            backend,
            transport,
            transcriber,
            settings,
        }
    }

    /// Entry point for the dispatcher. A handler error is logged and dropped;
    /// one user's failure never takes the process down.
    pub async fn handle_event(&self, event: Event) {
        let outcome = match event {
            Event::Command { name, user, chat, profile } => {
                self.on_command(&name, user, chat, &profile).await
            }
            Event::Text { user, chat, text } => self.on_text(user, chat, &text).await,
            Event::Voice { user, chat, media, duration_seconds, message } => {
                self.on_voice(user, chat, media, duration_seconds, message).await
            }
            Event::Photo { user, chat, media, caption } => {
                self.on_photo(user, chat, media, caption).await
            }
            Event::ButtonPress { user, chat, payload, message, callback_id } => {
                self.on_button(user, chat, &payload, message, &callback_id).await
            }
            Event::Tick { user, chat } => self.on_tick(user, chat).await,
            Event::ListeningDeadline { user, chat } => self.on_deadline(user, chat).await,
        };
        if let Err(error) = outcome {
            tracing::error!(%error, "event handler failed");
        }
    }

    async fn on_command(
        &self,
        name: &str,
        user: UserId,
        chat: ChatId,
        profile: &UserProfile,
    ) -> Result<()> {
        match name {
            "start" => self.welcome(user, chat, profile).await,
            "listen" => self.start_practice(StartRequest { user, chat }).await,
            "stats" => {
                match self.stats_text(user).await {
                    Ok(text) => {
                        self.transport.send_text(chat, &text, Some(main_menu())).await?;
                    }
                    Err(error) => {
                        tracing::error!(%error, "could not compute practice stats");
                        self.transport.send_text(chat, TRY_AGAIN, None).await?;
                    }
                }
                Ok(())
            }
            "library" => self.show_library(user, chat, 0, None).await,
            _ => {
                self.transport.send_text(chat, START_PROMPT, None).await?;
                Ok(())
            }
        }
    }

    async fn welcome(&self, user: UserId, chat: ChatId, profile: &UserProfile) -> Result<()> {
        // Registration is an idempotent upsert; a failed write should not
        // block the greeting.
        if let Err(error) = self.backend.upsert_user(user, profile).await {
            tracing::warn!(%error, ?user, "user upsert failed");
        }
        self.transport.send_text(chat, WELCOME, Some(main_menu())).await?;
        Ok(())
    }

    /// Idle → ListeningInProgress. A practice already in flight is superseded:
    /// its timers are cancelled before anything new is scheduled.
    async fn start_practice(&self, req: StartRequest) -> Result<()> {
        if let Some(mut old) = self.sessions.take(req.user) {
            tracing::info!(user = ?req.user, "superseding practice in flight");
            old.cancel_timers();
        }

        let session_id = match self.backend.create_session(req.user).await {
            Ok(id) => id,
            Err(error) => {
                tracing::error!(%error, "could not create practice session");
                self.transport.send_text(req.chat, TRY_AGAIN, None).await?;
                return Ok(());
            }
        };

        let instruction_message = match self.transport.send_text(req.chat, INSTRUCTIONS, None).await
        {
            Ok(message) => Some(message),
            Err(error) => {
                tracing::warn!(%error, "could not send practice instructions");
                None
            }
        };

        let timer_message = self
            .transport
            .send_text(req.chat, &timer_running_text(Duration::ZERO), None)
            .await
            .context("could not send the timer message")?;

        let tick_timer = self.timers.schedule_repeating(
            TimerKey::Tick(req.user),
            self.settings.tick_interval,
            self.settings.tick_interval,
            Event::Tick { user: req.user, chat: req.chat },
        )?;
        let deadline_timer = match self.settings.practice_time_limit {
            Some(limit) => Some(self.timers.schedule_once(
                TimerKey::Deadline(req.user),
                limit,
                Event::ListeningDeadline { user: req.user, chat: req.chat },
            )?),
            None => None,
        };

        self.sessions.put(
            req.user,
            SessionRuntimeState {
                phase: Phase::ListeningInProgress,
                session_id,
                chat: req.chat,
                timer_started_at: Instant::now(),
                timer_message,
                instruction_message,
                tick_timer: Some(tick_timer),
                deadline_timer,
            },
        );
        Ok(())
    }

    /// Repeating timer fire. A tick for a practice that has moved on is a
    /// no-op: its timer was cancelled along with the old runtime state, this
    /// fire was merely already in flight.
    async fn on_tick(&self, user: UserId, chat: ChatId) -> Result<()> {
        let display = self
            .sessions
            .with(user, |state| {
                (state.phase, state.timer_started_at, state.timer_message)
            })
            .filter(|(phase, _, _)| *phase == Phase::ListeningInProgress);

        let Some((_, started_at, timer_message)) = display else {
            tracing::debug!(?user, "stale tick, no listening phase to display");
            return Ok(());
        };

        let text = timer_running_text(started_at.elapsed());
        // Edit failures are swallowed: ticking continues and the next fire
        // gets another chance.
        if let Err(error) = self.transport.edit_text(chat, timer_message, &text, None).await {
            tracing::debug!(%error, "timer display edit failed");
        }
        Ok(())
    }

    async fn on_voice(
        &self,
        user: UserId,
        chat: ChatId,
        media: MediaRef,
        duration_seconds: u32,
        message: MessageId,
    ) -> Result<()> {
        match self.sessions.phase(user) {
            Phase::ListeningInProgress => {
                self.finish_listening(user, chat, Some((media, duration_seconds, message)))
                    .await
            }
            Phase::AwaitingAnswer => {
                self.accept_voice_answer(user, chat, media, duration_seconds).await
            }
            Phase::Idle => {
                self.transport.send_text(chat, OUT_OF_PHASE, None).await?;
                Ok(())
            }
        }
    }

    async fn on_text(&self, user: UserId, chat: ChatId, text: &str) -> Result<()> {
        match self.sessions.phase(user) {
            Phase::AwaitingAnswer => {
                let patch = SessionPatch {
                    what_heard_text: Some(text.to_string()),
                    ..completion_patch()
                };
                self.accept_answer(user, chat, patch, THANKS_TEXT).await
            }
            Phase::ListeningInProgress => {
                self.transport.send_text(chat, OUT_OF_PHASE, None).await?;
                Ok(())
            }
            Phase::Idle => {
                self.transport.send_text(chat, START_PROMPT, None).await?;
                Ok(())
            }
        }
    }

    async fn on_photo(
        &self,
        user: UserId,
        chat: ChatId,
        media: MediaRef,
        caption: Option<String>,
    ) -> Result<()> {
        match self.sessions.phase(user) {
            Phase::AwaitingAnswer => {
                let caption = caption
                    .filter(|c| !c.trim().is_empty())
                    .unwrap_or_else(|| CAPTION_PLACEHOLDER.to_string());
                let patch = SessionPatch {
                    photo_file_id: Some(media),
                    what_heard_text: Some(caption),
                    ..completion_patch()
                };
                self.accept_answer(user, chat, patch, THANKS_PHOTO).await
            }
            Phase::ListeningInProgress => {
                self.transport.send_text(chat, OUT_OF_PHASE, None).await?;
                Ok(())
            }
            Phase::Idle => {
                self.transport.send_text(chat, START_PROMPT, None).await?;
                Ok(())
            }
        }
    }

    async fn on_button(
        &self,
        user: UserId,
        chat: ChatId,
        payload: &str,
        message: MessageId,
        callback_id: &str,
    ) -> Result<()> {
        if let Err(error) = self.transport.answer_callback(callback_id).await {
            tracing::debug!(%error, "callback acknowledgement failed");
        }
        match CallbackPayload::parse(payload) {
            Some(CallbackPayload::StartPractice) => {
                self.start_practice(StartRequest { user, chat }).await
            }
            Some(CallbackPayload::ShowStats) => {
                match self.stats_text(user).await {
                    Ok(text) => {
                        self.edit_or_log(chat, message, &text, Some(main_menu())).await;
                    }
                    Err(error) => {
                        tracing::error!(%error, "could not compute practice stats");
                        self.transport.send_text(chat, TRY_AGAIN, None).await?;
                    }
                }
                Ok(())
            }
            Some(CallbackPayload::HowItWorks) => {
                self.edit_or_log(chat, message, HOW_IT_WORKS, Some(main_menu())).await;
                Ok(())
            }
            Some(CallbackPayload::LibraryPage(page)) => {
                self.show_library(user, chat, page, Some(message)).await
            }
            Some(CallbackPayload::Play(token)) => self.play(user, chat, &token).await,
            None => {
                tracing::warn!(payload, "unrecognized callback payload");
                Ok(())
            }
        }
    }

    /// One-shot fire of the configured fixed practice duration. Ends the
    /// listening phase without environment audio; a no-op in any other phase.
    async fn on_deadline(&self, user: UserId, chat: ChatId) -> Result<()> {
        if self.sessions.phase(user) == Phase::ListeningInProgress {
            self.finish_listening(user, chat, None).await
        } else {
            Ok(())
        }
    }

    /// ListeningInProgress → AwaitingAnswer. `environment` carries the clip
    /// that ended the listening window, or `None` on the fixed-duration path.
    ///
    /// Order matters: persist first (a failure leaves the phase unchanged so
    /// the user can resend), then cancel the timer before the completion edit
    /// so no late tick races it.
    async fn finish_listening(
        &self,
        user: UserId,
        chat: ChatId,
        environment: Option<(MediaRef, u32, MessageId)>,
    ) -> Result<()> {
        if let Some((media, duration_seconds, message)) = &environment {
            let session_id = self.sessions.with(user, |state| state.session_id.clone());
            let Some(session_id) = session_id else {
                return Ok(());
            };
            let patch = SessionPatch {
                environment_audio_file_id: Some(media.clone()),
                session_duration_seconds: Some(*duration_seconds),
                environment_audio_message_id: Some(message.0),
                ..SessionPatch::default()
            };
            if let Err(error) = self.backend.patch_session(&session_id, patch).await {
                tracing::error!(%error, "could not persist environment audio");
                self.transport.send_text(chat, TRY_AGAIN, None).await?;
                return Ok(());
            }
            if let Err(error) = self
                .backend
                .record_audio(&session_id, media, AudioKind::Environment, Some(*duration_seconds))
                .await
            {
                tracing::warn!(%error, "could not record environment audio metadata");
            }
        }

        let Some(mut state) = self.sessions.take(user) else {
            return Ok(());
        };
        state.cancel_timers();

        let elapsed = state.timer_started_at.elapsed();
        let done = timer_done_text(elapsed, environment.is_some());
        if let Err(error) = self.transport.edit_text(chat, state.timer_message, &done, None).await {
            tracing::warn!(%error, "could not finalize the timer display");
        }
        if let Some(instruction) = state.instruction_message.take() {
            if let Err(error) = self.transport.delete_message(chat, instruction).await {
                tracing::debug!(%error, "could not retract instruction message");
            }
        }

        // A short pause before the question, purely for pacing.
        tokio::time::sleep(self.settings.completion_pause).await;
        if let Err(error) = self.transport.send_text(chat, REFLECTION_PROMPT, None).await {
            tracing::error!(%error, "could not send the reflection prompt");
        }

        state.phase = Phase::AwaitingAnswer;
        self.sessions.put(user, state);
        Ok(())
    }

    async fn accept_voice_answer(
        &self,
        user: UserId,
        chat: ChatId,
        media: MediaRef,
        duration_seconds: u32,
    ) -> Result<()> {
        // Clear the phase before any suspension point so a second
        // near-simultaneous answer routes as out-of-phase instead of
        // double-recording.
        let Some(state) = self.sessions.take(user) else {
            self.transport.send_text(chat, OUT_OF_PHASE, None).await?;
            return Ok(());
        };

        let transcript = match self.transcriber.transcribe(&media).await {
            Ok(text) => text,
            Err(error) => {
                tracing::warn!(%error, "transcription failed, storing placeholder");
                TRANSCRIPT_PLACEHOLDER.to_string()
            }
        };

        let patch = SessionPatch {
            reflection_audio_file_id: Some(media.clone()),
            reflection_transcription: Some(transcript.clone()),
            what_heard_text: Some(transcript),
            ..completion_patch()
        };
        if let Err(error) = self.backend.patch_session(&state.session_id, patch).await {
            // Accepted data-quality gap: the session may stay `started`.
            tracing::error!(%error, "could not mark the session completed");
        }
        if let Err(error) = self
            .backend
            .record_audio(&state.session_id, &media, AudioKind::Reflection, Some(duration_seconds))
            .await
        {
            tracing::warn!(%error, "could not record reflection audio metadata");
        }

        self.transport.send_text(chat, THANKS_VOICE, Some(main_menu())).await?;
        Ok(())
    }

    /// AwaitingAnswer → Idle for the text and photo variants.
    async fn accept_answer(
        &self,
        user: UserId,
        chat: ChatId,
        patch: SessionPatch,
        thanks: &str,
    ) -> Result<()> {
        let Some(state) = self.sessions.take(user) else {
            self.transport.send_text(chat, OUT_OF_PHASE, None).await?;
            return Ok(());
        };
        if let Err(error) = self.backend.patch_session(&state.session_id, patch).await {
            tracing::error!(%error, "could not mark the session completed");
        }
        self.transport.send_text(chat, thanks, Some(main_menu())).await?;
        Ok(())
    }

    async fn stats_text(&self, user: UserId) -> Result<String> {
        let sessions = self
            .backend
            .list_sessions(user, 0, STATS_SCAN_LIMIT)
            .await
            .context("could not load practice history")?;
        let total = sessions.len();
        let completed = sessions
            .iter()
            .filter(|s| s.status == SessionStatus::Completed)
            .count();
        let last = sessions
            .first()
            .map(|s| s.started_at.format("%Y-%m-%d").to_string())
            .unwrap_or_else(|| "none yet".to_string());
        Ok(format!(
            "📊 Your practice stats:\n\n\
             🎧 Total practices: {total}\n\
             ✅ Completed: {completed}\n\
             📅 Last practice: {last}\n\n\
             🔥 Keep practicing every day!"
        ))
    }

    /// Renders one page of the recordings library. Each playable entry gets a
    /// fresh token; the media reference itself never enters a button payload.
    async fn show_library(
        &self,
        user: UserId,
        chat: ChatId,
        page: u32,
        edit: Option<MessageId>,
    ) -> Result<()> {
        let entries = match self
            .backend
            .list_sessions(user, page, self.settings.page_size)
            .await
        {
            Ok(entries) => entries,
            Err(error) => {
                tracing::error!(%error, "could not load the recordings library");
                self.transport.send_text(chat, TRY_AGAIN, None).await?;
                return Ok(());
            }
        };

        if entries.is_empty() && page == 0 {
            self.transport.send_text(chat, LIBRARY_EMPTY, Some(main_menu())).await?;
            return Ok(());
        }

        let mut lines = vec![LIBRARY_HEADER.to_string(), String::new()];
        let mut keyboard = Keyboard::default();
        for summary in &entries {
            let date = summary.started_at.format("%Y-%m-%d").to_string();
            let label = summary
                .what_heard_text
                .as_deref()
                .map(|text| keywords(text, 3))
                .filter(|kw| !kw.is_empty())
                .map(|kw| format!("• {date} — {kw}"))
                .unwrap_or_else(|| format!("• {date}"));
            lines.push(label);

            let media = match &summary.environment_audio_file_id {
                Some(media) => Some(media.clone()),
                // Older rows predate the media column; fall back to the
                // audio metadata table.
                None => self
                    .backend
                    .find_audio(&summary.id, AudioKind::Environment)
                    .await
                    .unwrap_or_else(|error| {
                        tracing::warn!(%error, "audio metadata lookup failed");
                        None
                    }),
            };
            if let Some(media) = media {
                let token = self.library.issue(media, user);
                keyboard.rows.push(vec![Button::new(
                    format!("▶️ {date}"),
                    CallbackPayload::Play(token).encode(),
                )]);
            }
        }

        let nav = page_nav(page, entries.len(), self.settings.page_size);
        let mut nav_row = Vec::new();
        if let Some(prev) = nav.prev {
            nav_row.push(Button::new("⬅️ Newer", CallbackPayload::LibraryPage(prev).encode()));
        }
        if let Some(next) = nav.next {
            nav_row.push(Button::new("Older ➡️", CallbackPayload::LibraryPage(next).encode()));
        }
        if !nav_row.is_empty() {
            keyboard.rows.push(nav_row);
        }

        let text = lines.join("\n");
        match edit {
            Some(message) => self.edit_or_log(chat, message, &text, Some(keyboard)).await,
            None => {
                self.transport.send_text(chat, &text, Some(keyboard)).await?;
            }
        }
        Ok(())
    }

    async fn play(&self, user: UserId, chat: ChatId, token: &str) -> Result<()> {
        match self.library.resolve(token) {
            Some((media, owner)) if owner == user => {
                if let Err(error) = self.transport.send_voice(chat, &media).await {
                    tracing::error!(%error, "could not replay the recording");
                    self.transport.send_text(chat, TRY_AGAIN, None).await?;
                }
                Ok(())
            }
            // Unknown token (restart cleared the cache) or someone else's
            // button: same degraded answer either way.
            _ => {
                self.transport.send_text(chat, LINK_EXPIRED, None).await?;
                Ok(())
            }
        }
    }

    async fn edit_or_log(
        &self,
        chat: ChatId,
        message: MessageId,
        text: &str,
        keyboard: Option<Keyboard>,
    ) {
        if let Err(error) = self.transport.edit_text(chat, message, text, keyboard).await {
            tracing::warn!(%error, "message edit failed");
        }
    }
}

fn completion_patch() -> SessionPatch {
    SessionPatch {
        status: Some(SessionStatus::Completed),
        completed_at: Some(Utc::now()),
        ..SessionPatch::default()
    }
}

/// The three-control action set shown with the welcome, stats, and
/// thank-you messages.
fn main_menu() -> Keyboard {
    Keyboard::default()
        .row(vec![Button::new(
            "🎧 What do you hear now?",
            CallbackPayload::StartPractice.encode(),
        )])
        .row(vec![Button::new("📊 My stats", CallbackPayload::ShowStats.encode())])
        .row(vec![Button::new(
            "ℹ️ How it works",
            CallbackPayload::HowItWorks.encode(),
        )])
}

/// `MM:SS` display of an elapsed duration.
pub fn format_elapsed(elapsed: Duration) -> String {
    let total = elapsed.as_secs();
    format!("{:02}:{:02}", total / 60, total % 60)
}

fn timer_running_text(elapsed: Duration) -> String {
    format!(
        "🎧 Practice in progress...\n\n\
         👂 Listen to the sounds around you...\n\
         ⏰ Elapsed: {}",
        format_elapsed(elapsed)
    )
}

fn timer_done_text(elapsed: Duration, audio_received: bool) -> String {
    let mut text = format!(
        "✅ Practice complete!\n\n👂 You listened for {}",
        format_elapsed(elapsed)
    );
    if audio_received {
        text.push_str("\n🎙️ Audio received!");
    }
    text
}
