use anyhow::Result;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use weft_storage::{Database, EncryptionService};
use weft_worker::{Worker, WorkerConfig};

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "weft_worker=info,weft_core=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    tracing::info!("weft-worker starting...");

    let config = WorkerConfig::from_env()?;
    let encryption = EncryptionService::from_env()?;

    let db = Database::from_url(&config.database_url).await?;
    db.migrate().await?;
    tracing::info!("database connection established");

    let worker = Worker::new(db, encryption, config);
    let shutdown = worker.shutdown_handle();

    tokio::spawn(async move {
        tokio::signal::ctrl_c().await.ok();
        tracing::info!("shutdown signal received");
        shutdown.send(true).ok();
    });

    worker.run().await
}
