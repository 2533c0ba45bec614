use std::process::ExitCode;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};
use trellis_bus::InMemoryBus;
use trellis_orchestrator::{Orchestrator, OrchestratorConfig};

/// Exit codes: 0 normal shutdown, 1 fatal init error, 2 config error.
const EXIT_INIT_ERROR: u8 = 1;
const EXIT_CONFIG_ERROR: u8 = 2;

#[tokio::main]
async fn main() -> ExitCode {
    dotenv::dotenv().ok();

    let config = match OrchestratorConfig::load() {
        Ok(config) => config,
        Err(err) => {
            eprintln!("Configuration error: {}", err);
            return ExitCode::from(EXIT_CONFIG_ERROR);
        }
    };
    if let Err(err) = config.validate() {
        eprintln!("Configuration error: {}", err);
        return ExitCode::from(EXIT_CONFIG_ERROR);
    }

    init_tracing(&config);

    let bus = Arc::new(InMemoryBus::new());
    let orchestrator = match Orchestrator::new(config, bus) {
        Ok(orchestrator) => Arc::new(orchestrator),
        Err(err) => {
            error!("Initialization failed: {}", err);
            return ExitCode::from(EXIT_INIT_ERROR);
        }
    };

    let shutdown = CancellationToken::new();
    let signal_token = shutdown.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("Interrupt received, shutting down");
            signal_token.cancel();
        }
    });

    match orchestrator.run(shutdown).await {
        Ok(()) => {
            info!("Orchestrator stopped");
            ExitCode::SUCCESS
        }
        Err(err) => {
            error!("Orchestrator failed: {}", err);
            ExitCode::from(EXIT_INIT_ERROR)
        }
    }
}

fn init_tracing(config: &OrchestratorConfig) {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| format!("trellis={}", config.logging.level).into());

    let registry = tracing_subscriber::registry().with(filter);
    if config.logging.format == "json" {
        registry
            .with(tracing_subscriber::fmt::layer().json())
            .init();
    } else {
        registry.with(tracing_subscriber::fmt::layer()).init();
    }
}
