use explorer::actors::graph_projector::{GraphProjector, GraphProjectorActor, GraphProjectorArguments};
use explorer::actors::outbox_publisher::{
    OutboxPublisher, OutboxPublisherActor, OutboxPublisherArguments, TracingEventSink,
};
use explorer::actors::{EventStoreActor, EventStoreArguments};
use explorer::config::Config;
use explorer::db;
use explorer::graph_store::GraphStore;
use ractor::Actor;
use std::sync::Arc;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let (config, env_file) = Config::load()?;
    match &env_file {
        Some(path) => tracing::info!(path = %path.display(), "Loaded environment from .env"),
        None => tracing::info!("No .env file found; using process environment only"),
    }

    tracing::info!(database_url = %config.database_url, "Starting explorer workers");
    let pool = db::connect(&config.database_url).await?;

    let (event_store, event_store_handle) =
        Actor::spawn(None, EventStoreActor, EventStoreArguments::Pool(pool.clone())).await?;
    tracing::info!("EventStoreActor started");

    let (publisher, publisher_handle) = Actor::spawn(
        Some("outbox.publisher".to_string()),
        OutboxPublisherActor,
        OutboxPublisherArguments {
            publisher: OutboxPublisher::new(
                event_store.clone(),
                Arc::new(TracingEventSink),
                config.outbox_batch_size,
            ),
            poll_interval_ms: config.outbox_poll_ms,
        },
    )
    .await?;
    tracing::info!(
        poll_ms = config.outbox_poll_ms,
        batch_size = config.outbox_batch_size,
        "OutboxPublisherActor started"
    );

    let (projector, projector_handle) = Actor::spawn(
        Some("graph.projector".to_string()),
        GraphProjectorActor,
        GraphProjectorArguments {
            projector: GraphProjector::new(
                event_store.clone(),
                GraphStore::new(pool.clone()),
                config.projector_max_runs_per_tick,
                config.projector_events_per_run,
            ),
            poll_interval_ms: config.projector_poll_ms,
        },
    )
    .await?;
    tracing::info!(
        poll_ms = config.projector_poll_ms,
        max_runs_per_tick = config.projector_max_runs_per_tick,
        events_per_run = config.projector_events_per_run,
        "GraphProjectorActor started"
    );

    tokio::signal::ctrl_c().await?;
    tracing::info!("Shutdown requested");

    publisher.stop(None);
    projector.stop(None);
    let _ = publisher_handle.await;
    let _ = projector_handle.await;

    event_store.stop(None);
    let _ = event_store_handle.await;
    pool.close().await;

    tracing::info!("Explorer stopped");
    Ok(())
}
