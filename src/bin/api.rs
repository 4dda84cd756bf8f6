use finance_report_dispatcher::{
    api::{start_server, ApiState},
    config::{AppConfig, UserConfigStore},
    ledger::{LedgerClient, LedgerGateway},
    notify::{Notifier, WebhookDispatcher},
};
use std::sync::Arc;
use tracing::info;

/// API-only entry point: serves ingestion and webhook endpoints without
/// the report scheduler, for deployments that split the two.
#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Initialize tracing
    tracing_subscriber::fmt()
        .with_max_level(tracing::Level::INFO)
        .init();

    // Load environment variables
    dotenv::dotenv().ok();

    let config = AppConfig::from_env()?;

    info!("Finance Report Dispatcher - API server");
    info!("Port: {}", config.port);

    let store = Arc::new(UserConfigStore::new(config.users_dir.clone()));
    let ledger: Arc<dyn LedgerGateway> = Arc::new(LedgerClient::new(config.ledger_api_url.clone()));
    let notifier: Arc<dyn Notifier> = Arc::new(WebhookDispatcher::new());

    let state = ApiState {
        store,
        ledger,
        notifier,
    };
    start_server(state, &config.host, config.port).await?;

    Ok(())
}
