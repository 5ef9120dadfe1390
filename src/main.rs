//! Delivery Tracker
//!
//! ```text
//! ┌──────────┐    ┌──────────┐    ┌──────────────┐    ┌──────────────┐
//! │  Intake  │───▶│ Postgres │◀──▶│    Poller    │───▶│ Notification │
//! │ (stdin)  │    │ (sqlx)   │    │ (batch loop) │    │   channel    │
//! └──────────┘    └──────────┘    └──────┬───────┘    └──────────────┘
//!                                        │
//!                                        ▼
//!                                 Status source (HTTP)
//! ```

use anyhow::Context;
use std::sync::Arc;
use tokio::sync::{mpsc, watch};
use tracing::{error, info, warn};

use delivery_tracker::config::AppConfig;
use delivery_tracker::db::Database;
use delivery_tracker::intake::{forward_json_lines, run_intake};
use delivery_tracker::logging::init_logging;
use delivery_tracker::poller::{ChannelPublisher, HttpStatusSource, Poller, PollerSettings};
use delivery_tracker::store::{MessageStateStore, StateService};

const NOTIFICATION_CHANNEL_CAPACITY: usize = 1024;

fn get_env() -> String {
    let args: Vec<String> = std::env::args().collect();
    for i in 0..args.len() {
        if (args[i] == "--env" || args[i] == "-e") && i + 1 < args.len() {
            return args[i + 1].clone();
        }
    }
    "dev".to_string()
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let env = get_env();
    let config =
        AppConfig::load(&env).with_context(|| format!("Failed to load config for env {}", env))?;
    let _log_guard = init_logging(&config);

    info!(
        env = %env,
        git_hash = env!("GIT_HASH"),
        "Starting delivery tracker"
    );

    let db = Database::connect(&config.database)
        .await
        .context("Failed to connect to PostgreSQL")?;
    db.migrate().await.context("Failed to apply migrations")?;
    db.health_check().await.context("Database health check failed")?;

    let store = Arc::new(StateService::from_database(
        &db,
        config.poller.polling_query(),
    ));
    match store.state_counts().await {
        Ok(counts) => info!(
            total = counts.total(),
            by_lifecycle = ?counts.by_lifecycle,
            "Tracked messages"
        ),
        Err(e) => warn!(error = %e, "Failed to load state counts"),
    }

    // Registrations arrive on the intake channel; stdin is one optional producer
    let (intake_tx, intake_rx) = mpsc::channel(config.intake.channel_capacity);
    let intake_store = store.clone();
    let intake = tokio::spawn(async move { run_intake(intake_store.as_ref(), intake_rx).await });
    if config.intake.stdin {
        // Plain thread: a blocking stdin read cannot hold up runtime shutdown
        std::thread::Builder::new()
            .name("stdin-intake".to_string())
            .spawn(move || match forward_json_lines(std::io::stdin().lock(), &intake_tx) {
                Ok(forwarded) => info!(forwarded, "Stdin intake finished"),
                Err(e) => error!(error = %e, "Stdin intake failed"),
            })
            .context("Failed to start stdin intake")?;
        info!("Reading message registrations from stdin");
    } else {
        drop(intake_tx);
        info!("Stdin intake disabled, registrations are written by an external producer");
    }

    let source = Arc::new(
        HttpStatusSource::new(&config.status_source).context("Failed to build status source")?,
    );

    // Downstream delivery of notifications is owned by the consumer of this channel
    let (publisher, mut outbound) = ChannelPublisher::channel(NOTIFICATION_CHANNEL_CAPACITY);
    let forwarder = tokio::spawn(async move {
        while let Some(notification) = outbound.recv().await {
            info!(
                key = %notification.key,
                payload = %String::from_utf8_lossy(&notification.payload),
                "Status notification"
            );
        }
    });

    let poller = Poller::new(
        store,
        source,
        Arc::new(publisher),
        PollerSettings::from_config(&config.poller),
    );

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let poller_handle = tokio::spawn(async move { poller.run(shutdown_rx).await });

    tokio::signal::ctrl_c()
        .await
        .context("Failed to listen for shutdown signal")?;
    info!("Shutdown requested, waiting for the in-flight cycle to drain");

    if shutdown_tx.send(true).is_err() {
        warn!("Poller already stopped");
    }
    poller_handle.await.context("Poller task failed")?;
    forwarder.await.context("Notification forwarder failed")?;
    // Unprocessed registrations are redelivered by the producer; create is idempotent
    intake.abort();

    info!("Delivery tracker stopped");
    Ok(())
}
