use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use axum::{routing::get, Router};
use bot::{Bot, TelegramGate, TelegramNotifier};
use config::Settings;
use dispatcher::Dispatcher;
use dotenv::dotenv;
use fetcher::HttpTokenFetcher;
use grammers_client::{Client, Config, InitParams};
use grammers_mtsender::{FixedReconnect, ReconnectionPolicy};
use grammers_session::Session;
use log::info;
use scheduler::{ScheduleRunner, SchedulerConfig};
use simplelog::TermLogger;
use store::Storage;
use upload::{GithubUploader, UploadDestination};

mod aggregator;
mod artifacts;
mod bot;
mod command;
mod config;
mod credential;
mod dispatcher;
mod error;
mod fetcher;
mod models;
mod pipeline;
mod progress;
mod scheduler;
mod store;
mod upload;

async fn health_check() -> &'static str {
    "OK"
}

#[tokio::main]
async fn main() -> Result<()> {
    // Load .env file
    dotenv().ok();

    let settings = Settings::from_env()?;

    TermLogger::init(
        settings.log_level,
        simplelog::ConfigBuilder::new()
            .set_time_format_rfc3339()
            .build(),
        simplelog::TerminalMode::Mixed,
        simplelog::ColorChoice::Auto,
    )
    .expect("error initializing termlogger");

    let http = reqwest::Client::builder()
        .connect_timeout(Duration::from_secs(10))
        .user_agent(concat!(env!("CARGO_PKG_NAME"), "/", env!("CARGO_PKG_VERSION")))
        .build()?;

    let storage = Arc::new(Storage::new(&settings.data_dir));
    let fetcher = Arc::new(HttpTokenFetcher::new(
        http.clone(),
        settings.token_api_url.clone(),
        settings.token_api_key.clone(),
    ));
    let dispatcher = Arc::new(Dispatcher::new(fetcher, settings.max_concurrent_requests)?);
    let uploader: Arc<dyn UploadDestination> = Arc::new(GithubUploader::new(http));
    info!(
        "Token API: {} ({} concurrent requests), data dir: {}",
        settings.token_api_url,
        dispatcher.limit(),
        settings.data_dir.display()
    );

    // Fill in the configuration and connect to Telegram
    static RECONNECTION_POLICY: &dyn ReconnectionPolicy = &FixedReconnect {
        attempts: 3,
        delay: Duration::from_secs(5),
    };
    let config = Config {
        api_id: settings.api_id,
        api_hash: settings.api_hash.clone(),
        session: Session::load_file_or_create("session.bin")?,
        params: InitParams {
            reconnection_policy: RECONNECTION_POLICY,
            ..Default::default()
        },
    };
    let client = Client::connect(config).await?;

    // Authorize as a bot if needed
    if !client.is_authorized().await? {
        info!("Not authorized, signing in");
        client.bot_sign_in(&settings.bot_token).await?;
    }

    // Save the session to a file
    client.session().save_to_file("session.bin")?;

    let channel = match &settings.required_channel {
        Some(name) => {
            let chat = client
                .resolve_username(name)
                .await?
                .with_context(|| format!("REQUIRED_CHANNEL @{} could not be resolved", name))?;
            info!("Membership of @{} is required", name);
            Some(chat.pack())
        }
        None => None,
    };

    let gate = Arc::new(TelegramGate::new(client.clone(), storage.clone(), channel));
    let notifier = Arc::new(TelegramNotifier::new(client.clone(), storage.clone()));

    let runner = Arc::new(ScheduleRunner::new(
        storage.clone(),
        dispatcher.clone(),
        gate.clone(),
        notifier.clone(),
        uploader.clone(),
        SchedulerConfig {
            tick: settings.scheduler_tick,
            startup_delay: settings.scheduler_startup_delay,
            max_file_size: settings.max_file_size,
        },
    ));

    let port = settings.port;
    let bot = Bot::new(client, settings, storage, dispatcher, uploader, gate, notifier).await?;

    // Create the HTTP server
    let app = Router::new().route("/", get(health_check));
    let addr = SocketAddr::from(([0, 0, 0, 0], port));

    // Run the bot, the scheduler and the HTTP server concurrently
    tokio::select! {
        _ = bot.run() => {},
        _ = runner.run() => {},
        _ = axum::serve(tokio::net::TcpListener::bind(addr).await?, app) => {},
    }

    Ok(())
}
