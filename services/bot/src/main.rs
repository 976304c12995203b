use anyhow::{Context, Result};
use clap::Parser;
use listening_core::practice::{FlowSettings, PracticeFlow};
use listening_core::timer::TimerService;
use listening_service::config::{Config, EVENT_QUEUE_CAPACITY, HTTP_TIMEOUT_SECS};
use listening_service::supabase::SupabaseStore;
use listening_service::telegram::{TelegramApi, UpdatePoller};
use listening_service::whisper::WhisperTranscriber;
use std::time::Duration;
use tracing_subscriber::fmt::time::ChronoLocal;

#[derive(Parser)]
#[command(about = "Deep listening practice bot")]
struct Cli {
    /// Seconds between visible timer updates
    #[arg(long, default_value_t = 15)]
    tick_interval_secs: u64,

    /// Library rows per page
    #[arg(long, default_value_t = 5)]
    page_size: usize,

    /// End the listening phase automatically after this many seconds
    /// (default: the user controls the duration)
    #[arg(long)]
    practice_time_limit_secs: Option<u64>,
}

#[tokio::main]
async fn main() -> Result<()> {
    // --- 1. Load Configuration ---
    let config = Config::from_env().context("failed to load application configuration")?;

    // --- 2. Initialize Logging ---
    tracing_subscriber::fmt()
        .with_max_level(config.log_level)
        .with_timer(ChronoLocal::rfc_3339())
        .init();

    tracing::info!("configuration loaded, starting the deep listening bot");

    // --- 3. Parse Command-Line Arguments ---
    let args = Cli::parse();
    let settings = FlowSettings {
        tick_interval: Duration::from_secs(args.tick_interval_secs),
        page_size: args.page_size,
        practice_time_limit: args.practice_time_limit_secs.map(Duration::from_secs),
        ..FlowSettings::default()
    };

    // --- 4. Collaborator Adapters ---
    let http = reqwest::Client::builder()
        .timeout(Duration::from_secs(HTTP_TIMEOUT_SECS))
        .build()
        .context("failed to build the HTTP client")?;
    let telegram = TelegramApi::new(http.clone(), &config.telegram_bot_token);
    let backend = SupabaseStore::new(
        http.clone(),
        config.supabase_url.clone(),
        config.supabase_anon_key.clone(),
    );
    let transcriber = WhisperTranscriber::new(http, telegram.clone(), config.openai_api_key.clone());

    // --- 5. Event Pipeline ---
    // Inbound chat updates and timer fires share one channel; the dispatcher
    // below is the single place runtime state gets mutated.
    let (events_tx, mut events_rx) = tokio::sync::mpsc::channel(EVENT_QUEUE_CAPACITY);
    let timers = TimerService::new(events_tx.clone());
    let flow = PracticeFlow::with_settings(backend, telegram.clone(), transcriber, timers, settings);

    let poller = tokio::spawn(UpdatePoller::new(telegram, events_tx).run());

    // --- 6. Dispatch ---
    while let Some(event) = events_rx.recv().await {
        flow.handle_event(event).await;
    }

    poller.await.context("update poller task panicked")??;
    Ok(())
}
