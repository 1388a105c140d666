use std::sync::Arc;

use axum::Router;
use config::Config;
use envconfig::Envconfig;
use eyre::{Result, WrapErr};
use tracing::info;
use tracing_subscriber::EnvFilter;

use sorting_common::allocator::Allocator;
use sorting_common::ledger::Ledger;
use sorting_common::memory::MemoryLedger;
use sorting_common::metrics::setup_metrics_routes;
use sorting_common::pgledger::PgLedger;

mod api;
mod config;
mod handlers;

async fn listen(app: Router, bind: String) -> Result<()> {
    let listener = tokio::net::TcpListener::bind(&bind).await?;
    info!("listening on {}", bind);

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    Ok(())
}

async fn shutdown_signal() {
    if let Err(err) = tokio::signal::ctrl_c().await {
        tracing::error!("failed to listen for shutdown signal: {}", err);
        std::future::pending::<()>().await;
    }
    info!("shutting down");
}

async fn build_ledger(config: &Config) -> Result<Arc<dyn Ledger + Send + Sync>> {
    if config.in_memory_ledger {
        info!("using in-memory ledger, sorting results will not survive a restart");
        return Ok(Arc::new(MemoryLedger::new()));
    }

    let ledger = PgLedger::new(
        &config.database_url,
        config.max_pg_connections,
        config.statement_timeout.0,
    )
    .await
    .wrap_err("failed to connect to sorting ledger")?;

    Ok(Arc::new(ledger))
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let config = Config::init_from_env()
        .map_err(|e| eyre::eyre!("failed to load configuration from env: {:?}", e))?;

    let ledger = build_ledger(&config).await?;
    let allocator = Allocator::new(ledger, config.roster(), config.retry_policy.policy());

    let state = handlers::AppState::new(
        Arc::new(allocator),
        config.max_name_length,
        config.history_limit,
    );
    let app = handlers::add_routes(
        Router::new(),
        state,
        config.max_body_size,
        config.concurrency_limit,
    );
    let app = if config.export_prometheus {
        setup_metrics_routes(app).wrap_err("failed to install prometheus recorder")?
    } else {
        app
    };

    if let Err(e) = listen(app, config.bind()).await {
        tracing::error!("failed to start sorting-api http server, {}", e);
        return Err(e);
    }

    Ok(())
}
