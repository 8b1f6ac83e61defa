use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use keel_durable::engine::StartWorkflowOptions;
use keel_durable::persistence::{
    InMemoryWorkflowEventStore, PostgresWorkflowEventStore, WorkflowEventStore,
};
use keel_durable::{Worker, WorkflowClient};
use keel_worker::config::WorkerSettings;
use keel_worker::greeting::{self, GreetingWorkflow};
use keel_worker::health::{self, HealthState};
use keel_worker::telemetry::{init_telemetry, TelemetryConfig};
use sqlx::postgres::{PgConnectOptions, PgPoolOptions, PgSslMode};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();

    // Configure via environment variables:
    // - RUST_LOG or LOG_LEVEL: log filter (default: "info,keel_durable=debug,keel_worker=debug")
    init_telemetry(TelemetryConfig::from_env());

    tracing::info!("keel-worker starting...");

    let settings = WorkerSettings::from_env().context("Invalid worker configuration")?;
    let store = connect_store(&settings).await?;

    let worker = Arc::new(
        Worker::new(
            store,
            greeting::workflows()?,
            greeting::activities()?,
            settings.worker_config(),
        )
        .context("Failed to create worker")?,
    );

    tracing::info!(
        worker_id = %settings.worker_id,
        task_queue = %settings.task_queue,
        max_concurrent_activities = settings.max_concurrent_activities,
        max_concurrent_workflow_tasks = settings.max_concurrent_workflow_tasks,
        "Starting worker"
    );
    worker.start().await.context("Failed to start worker")?;

    let shutdown = CancellationToken::new();
    let health_state = {
        let worker = worker.clone();
        HealthState::new(&settings.worker_id, &settings.task_queue, move || {
            worker.status()
        })
    };
    let health_server = tokio::spawn(health::serve(
        settings.health_addr,
        health_state,
        shutdown.clone(),
    ));

    if let Some(name) = settings.demo_name.clone() {
        let client = WorkflowClient::new(worker.executor().clone());
        let task_queue = settings.task_queue.clone();
        tokio::spawn(async move {
            let workflow_id = format!("greet-{}", Uuid::now_v7());
            let started = client
                .start::<GreetingWorkflow>(&workflow_id, &name, StartWorkflowOptions::new(task_queue))
                .await;
            if let Err(e) = started {
                tracing::error!(error = %e, "Failed to start demo workflow");
                return;
            }
            match client
                .result::<GreetingWorkflow>(&workflow_id, Duration::from_secs(60))
                .await
            {
                Ok(greeting) => tracing::info!(%workflow_id, %greeting, "Demo workflow completed"),
                Err(e) => tracing::error!(%workflow_id, error = %e, "Demo workflow failed"),
            }
        });
    }

    tokio::signal::ctrl_c()
        .await
        .context("Failed to listen for shutdown signal")?;
    tracing::info!("Received shutdown signal");

    shutdown.cancel();
    if let Err(e) = worker.shutdown().await {
        tracing::error!(error = %e, "Worker did not shut down cleanly");
    }
    match health_server.await {
        Ok(Err(e)) => tracing::error!(error = %e, "Health server error"),
        Err(e) => tracing::error!(error = %e, "Health server task failed"),
        Ok(Ok(())) => {}
    }

    tracing::info!("Worker shutdown complete");
    Ok(())
}

/// Postgres when DATABASE_URL is set, otherwise a process-local store
async fn connect_store(settings: &WorkerSettings) -> Result<Arc<dyn WorkflowEventStore>> {
    let Some(database_url) = &settings.database_url else {
        tracing::warn!("DATABASE_URL not set, using in-memory store (state is lost on exit)");
        return Ok(Arc::new(InMemoryWorkflowEventStore::new()));
    };

    let mut options =
        PgConnectOptions::from_str(database_url).context("Invalid DATABASE_URL")?;
    if let Some(identity) = &settings.client_identity {
        options = options
            .ssl_mode(PgSslMode::Require)
            .ssl_client_cert_from_pem(identity.cert_pem.as_bytes())
            .ssl_client_key_from_pem(identity.key_pem.as_bytes());
        tracing::info!("Using TLS client certificate for database connection");
    }

    let pool = PgPoolOptions::new()
        .max_connections(settings.database_max_connections)
        .connect_with(options)
        .await
        .context("Failed to connect to database")?;
    tracing::info!("Connected to database");

    let store = PostgresWorkflowEventStore::new(pool);
    store.migrate().await.context("Failed to apply migrations")?;
    Ok(Arc::new(store))
}
