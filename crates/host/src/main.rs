//! Saga host entry point.
//!
//! Reads line-delimited JSON messages from stdin and drives the order saga
//! until EOF, SIGINT or SIGTERM.

use std::sync::Arc;

use host::Host;
use host::config::Config;
use host::order::{InMemoryInventoryService, InMemoryPaymentService, OrderBook, OrderSaga};
use pipeline::CancellationToken;
use tokio::io::BufReader;
use tokio::signal;

/// Card number the demo payment gateway always declines.
const DECLINED_TEST_CARD: &str = "4000000000000002";

/// Waits for a shutdown signal (SIGINT or SIGTERM).
async fn shutdown_signal() {
    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("failed to install SIGINT handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => {
            tracing::info!("received SIGINT, starting graceful shutdown");
        }
        () = terminate => {
            tracing::info!("received SIGTERM, starting graceful shutdown");
        }
    }
}

#[tokio::main]
async fn main() -> host::error::Result<()> {
    // 1. Configuration and telemetry
    let config = Config::from_env()?;
    host::telemetry::init(&config)?;

    // 2. State store (rejects backends without point lookups)
    let store = state_store::open_store(&config.state_store, &config.store_settings()).await?;

    // 3. Order saga collaborators
    let inventory = InMemoryInventoryService::new()
        .with_stock("SKU-WIDGET", 100)
        .with_stock("SKU-GADGET", 10);
    let payments = InMemoryPaymentService::new().decline_card(DECLINED_TEST_CARD);
    let orders = OrderBook::new();
    let saga = OrderSaga::new(Arc::new(inventory), Arc::new(payments), orders.clone());

    // 4. Orchestrator, pipelines and inbound adapter
    let host = Host::build(&config, store, saga, orders)?;
    tracing::info!(
        backend = %config.state_store,
        sagas = ?host.orchestrator.saga_types(),
        "saga host started"
    );

    // 5. Process stdin until EOF or a shutdown signal
    let cancel = CancellationToken::new();
    let watcher = {
        let cancel = cancel.clone();
        tokio::spawn(async move {
            shutdown_signal().await;
            cancel.cancel();
        })
    };

    let summary = host
        .adapter
        .run(BufReader::new(tokio::io::stdin()), &cancel)
        .await?;
    watcher.abort();

    tracing::info!(
        processed = summary.processed,
        failed = summary.failed,
        "saga host shut down gracefully"
    );
    Ok(())
}
