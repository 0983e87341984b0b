use mowertrack_ingestor::auth::{check_credentials, OAuthTokenProvider, TokenProvider};
use mowertrack_ingestor::config::Config;
use mowertrack_ingestor::connection::ConnectionManager;
use mowertrack_ingestor::db::EventStore;
use mowertrack_ingestor::ingest::Ingestor;
use mowertrack_ingestor::messages::MessageCatalog;
use mowertrack_ingestor::snapshot::FleetClient;
use mowertrack_ingestor::state::MowerStates;
use mowertrack_ingestor::{metrics, pipeline, rest};
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let config = match Config::from_env() {
        Ok(config) => config,
        Err(e) => {
            error!("{}", e);
            std::process::exit(1);
        }
    };

    info!("Starting mower telemetry ingestor");
    info!("Stream: {}", config.stream_url);
    info!("HTTP server: {}", config.http_addr);
    info!("Database: {}", config.database_url);

    metrics::init_metrics();

    let store = match EventStore::connect(&config.database_url).await {
        Ok(store) => store,
        Err(e) => {
            error!("Failed to open database: {}", e);
            std::process::exit(1);
        }
    };

    let catalog = match &config.messages_file {
        Some(path) => MessageCatalog::load(path).unwrap_or_else(|e| {
            warn!("Message descriptions unavailable: {}", e);
            MessageCatalog::empty()
        }),
        None => MessageCatalog::empty(),
    };

    let http = reqwest::Client::new();
    let tokens: Arc<dyn TokenProvider> = Arc::new(OAuthTokenProvider::new(
        http.clone(),
        config.auth_url.clone(),
        config.api_key.clone(),
        config.api_secret.clone(),
    ));

    if let Err(e) = check_credentials(tokens.as_ref()).await {
        error!("Credentials rejected: {}", e);
        std::process::exit(1);
    }

    let states = Arc::new(MowerStates::new());
    let fleet = FleetClient::new(http, config.mower_api_url.clone(), config.api_key.clone());
    match fleet.fetch_snapshot(tokens.as_ref()).await {
        Ok(snapshot) => states.seed(&snapshot),
        Err(e) if e.is_credential_rejection() => {
            error!("Fleet API rejected credentials: {}", e);
            std::process::exit(1);
        }
        Err(e) => warn!("Starting without fleet snapshot: {}", e),
    }

    let ingestor = Arc::new(Ingestor::new(store.clone(), Arc::clone(&states)));

    info!("Channel capacity: {}", config.channel_capacity);
    let (tx, rx) = mpsc::channel(config.channel_capacity);

    let consumer_ingestor = Arc::clone(&ingestor);
    let consumer_handle = tokio::spawn(async move {
        pipeline::run_consumer(rx, consumer_ingestor).await;
    });

    let connection = ConnectionManager::new(config.stream(), Arc::clone(&tokens), tx);
    connection.start();

    let app = rest::create_router(Arc::clone(&ingestor), Arc::new(catalog));

    let listener = tokio::net::TcpListener::bind(&config.http_addr)
        .await
        .unwrap_or_else(|e| {
            error!("Failed to bind to {}: {}", config.http_addr, e);
            std::process::exit(1);
        });

    info!("HTTP server listening on {}", config.http_addr);

    let server_handle = tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap_or_else(|e| {
            error!("HTTP server error: {}", e);
        });
    });

    tokio::select! {
        _ = server_handle => {
            error!("HTTP server terminated");
        }
        _ = tokio::signal::ctrl_c() => {
            info!("Received shutdown signal");
        }
    }

    info!("Shutting down");
    connection.stop().await;
    drop(connection);
    if let Err(e) = consumer_handle.await {
        warn!("Consumer task ended abnormally: {}", e);
    }
    store.close().await;
}
