use finance_report_dispatcher::{
    api::{start_server, ApiState},
    config::{AppConfig, UserConfigStore},
    ledger::{LedgerClient, LedgerGateway},
    notify::{Notifier, WebhookDispatcher},
    report::ReportService,
    scheduler::{SchedulerEngine, SchedulerSettings},
    workflow::{ReportGenerator, WorkflowClient},
};
use std::sync::Arc;
use tracing::info;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Initialize tracing
    tracing_subscriber::fmt()
        .with_max_level(tracing::Level::INFO)
        .init();

    // Load environment variables
    dotenv::dotenv().ok();

    let config = AppConfig::from_env()?;

    info!("Finance Report Dispatcher starting");
    info!("Users dir: {}", config.users_dir.display());
    info!("Ledger API: {}", config.ledger_api_url);

    // Create components
    let store = Arc::new(UserConfigStore::new(config.users_dir.clone()));
    let ledger: Arc<dyn LedgerGateway> = Arc::new(LedgerClient::new(config.ledger_api_url.clone()));
    let generator: Arc<dyn ReportGenerator> =
        Arc::new(WorkflowClient::new(config.workflow_api_url.clone()));
    let notifier: Arc<dyn Notifier> = Arc::new(WebhookDispatcher::new());

    let service = Arc::new(ReportService::new(Arc::clone(&ledger), generator));
    let engine = Arc::new(SchedulerEngine::new(
        Arc::clone(&store),
        service,
        Arc::clone(&notifier),
        SchedulerSettings::from(&config),
    ));

    // Scheduler ticks in the background for as long as the server runs
    tokio::spawn(engine.run());

    let state = ApiState {
        store,
        ledger,
        notifier,
    };
    start_server(state, &config.host, config.port).await?;

    Ok(())
}
