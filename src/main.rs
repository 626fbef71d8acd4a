use std::sync::Arc;
use tracing::{error, info};

mod bus;
mod chat;
mod config;
mod entity;
mod error;
mod interface;
mod manager;
mod orchestrator;
mod provider;
mod store;
mod tasks;

use entity::{ChatbotData, ChatbotProfile, GenerationParams};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load .env file
    if let Err(e) = dotenvy::dotenv() {
        info!("No .env file found or failed to load: {}", e);
    }

    // Initialize logging with default filter if RUST_LOG is not set
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()),
        )
        .with_writer(std::io::stderr)
        .init();

    info!("Chorus starting...");

    let bus = Arc::new(bus::EventBus::new());

    let data_dir = config::data_dir();
    let db_path = data_dir.join("chorus.db");
    info!("Initializing store at {}", db_path.display());
    let store = store::Store::new(&db_path).await?;
    store.init().await?;

    // Stored settings first, environment on top
    let app_config = store.load_config().await?.unwrap_or_default().with_env();
    store.save_config(&app_config).await?;

    let registry = Arc::new(manager::OrchestratorRegistry::new(&app_config, bus.clone())?);

    let mut chatbots = store.load_chatbots().await?;
    if chatbots.is_empty() {
        info!("No chatbots stored, creating a default one");
        chatbots.push(ChatbotData::new(
            ChatbotProfile::new("Assistant", "You are a helpful assistant."),
            GenerationParams::default(),
        ));
    }
    for data in chatbots {
        registry.create(data).await;
    }
    info!("Loaded {} chatbots", registry.ids().len());

    let console = interface::console::ConsoleInterface::new(
        bus.clone(),
        registry.clone(),
        Arc::new(store.clone()),
        app_config.user.name.clone(),
    );

    tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            info!("Received Ctrl+C, shutting down...");
        }
        res = console.run() => {
            if let Err(e) = res {
                error!("Console stopped with error: {}", e);
            }
        }
    }

    registry.stop_all().await;
    store.save_chatbots(&registry.snapshot().await).await?;
    info!("Saved chatbots, bye");

    Ok(())
}
