//! OutboxPublisherActor - drains unpublished outbox rows on a fixed interval.
//!
//! Delivery is at-least-once: an entry is stamped only after its sink
//! accepted it, and a failed entry stays pending for the next tick without
//! holding back the rest of the batch.

use async_trait::async_trait;
use ractor::{Actor, ActorProcessingErr, ActorRef, RpcReplyPort};
use std::sync::Arc;
use std::time::Duration;

use crate::actors::event_store::{self, EventStoreError, EventStoreMsg};
use shared_types::DomainEvent;

#[derive(Debug, thiserror::Error)]
pub enum PublisherError {
    #[error("EventStore RPC error: {0}")]
    Rpc(String),

    #[error("EventStore error: {0}")]
    EventStore(#[from] EventStoreError),

    #[error("Delivery failed: {0}")]
    Delivery(String),
}

/// Downstream consumer of published events. Must tolerate duplicates.
#[async_trait]
pub trait EventSink: Send + Sync {
    async fn deliver(&self, event: &DomainEvent) -> Result<(), PublisherError>;
}

/// Sink that records every delivery in the log.
#[derive(Debug, Default)]
pub struct TracingEventSink;

#[async_trait]
impl EventSink for TracingEventSink {
    async fn deliver(&self, event: &DomainEvent) -> Result<(), PublisherError> {
        tracing::info!(
            event_id = %event.event_id,
            run_id = %event.run_id,
            seq = event.sequence,
            kind = %event.kind,
            "Event published"
        );
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PublishReport {
    pub attempted: usize,
    pub published: usize,
    pub failed: usize,
}

#[derive(Clone)]
pub struct OutboxPublisher {
    event_store: ActorRef<EventStoreMsg>,
    sink: Arc<dyn EventSink>,
    batch_size: i64,
}

impl OutboxPublisher {
    pub fn new(event_store: ActorRef<EventStoreMsg>, sink: Arc<dyn EventSink>, batch_size: i64) -> Self {
        Self {
            event_store,
            sink,
            batch_size: batch_size.max(1),
        }
    }

    pub async fn publish_batch(&self) -> Result<PublishReport, PublisherError> {
        let pending = event_store::list_unpublished(&self.event_store, self.batch_size)
            .await
            .map_err(|e| PublisherError::Rpc(e.to_string()))??;

        let mut report = PublishReport {
            attempted: pending.len(),
            ..PublishReport::default()
        };

        for delivery in pending {
            let event = &delivery.event;
            if let Err(err) = self.sink.deliver(event).await {
                report.failed += 1;
                tracing::warn!(
                    run_id = %event.run_id,
                    seq = event.sequence,
                    error = %err,
                    "Outbox delivery failed, will retry"
                );
                continue;
            }

            match event_store::mark_published(&self.event_store, event.run_id.clone(), event.sequence).await {
                Ok(Ok(_)) => report.published += 1,
                Ok(Err(err)) => {
                    report.failed += 1;
                    tracing::warn!(run_id = %event.run_id, seq = event.sequence, error = %err, "Failed to stamp outbox entry");
                }
                Err(err) => {
                    report.failed += 1;
                    tracing::warn!(run_id = %event.run_id, seq = event.sequence, error = %err, "EventStore unavailable while stamping outbox entry");
                }
            }
        }

        if report.attempted > 0 {
            tracing::debug!(
                attempted = report.attempted,
                published = report.published,
                failed = report.failed,
                "Outbox tick"
            );
        }
        Ok(report)
    }
}

// ============================================================================
// Actor
// ============================================================================

#[derive(Debug, Default)]
pub struct OutboxPublisherActor;

pub struct OutboxPublisherArguments {
    pub publisher: OutboxPublisher,
    /// Tick period; 0 disables the background ticker.
    pub poll_interval_ms: u64,
}

pub struct OutboxPublisherState {
    publisher: OutboxPublisher,
}

#[derive(Debug)]
pub enum OutboxPublisherMsg {
    /// Internal trigger from the ticker.
    ScanNow,
    RunOnce {
        reply: RpcReplyPort<Result<PublishReport, PublisherError>>,
    },
}

#[async_trait]
impl Actor for OutboxPublisherActor {
    type Msg = OutboxPublisherMsg;
    type State = OutboxPublisherState;
    type Arguments = OutboxPublisherArguments;

    async fn pre_start(
        &self,
        myself: ActorRef<Self::Msg>,
        args: Self::Arguments,
    ) -> Result<Self::State, ActorProcessingErr> {
        tracing::info!(
            actor_id = %myself.get_id(),
            poll_interval_ms = args.poll_interval_ms,
            "OutboxPublisherActor starting"
        );

        if args.poll_interval_ms > 0 {
            let interval = Duration::from_millis(args.poll_interval_ms);
            let tick_ref = myself.clone();
            tokio::spawn(async move {
                let mut ticker = tokio::time::interval(interval);
                loop {
                    ticker.tick().await;
                    if tick_ref.cast(OutboxPublisherMsg::ScanNow).is_err() {
                        break;
                    }
                }
            });
        }

        Ok(OutboxPublisherState {
            publisher: args.publisher,
        })
    }

    async fn handle(
        &self,
        _myself: ActorRef<Self::Msg>,
        message: Self::Msg,
        state: &mut Self::State,
    ) -> Result<(), ActorProcessingErr> {
        match message {
            OutboxPublisherMsg::ScanNow => {
                if let Err(err) = state.publisher.publish_batch().await {
                    tracing::warn!(error = %err, "Outbox tick failed");
                }
            }
            OutboxPublisherMsg::RunOnce { reply } => {
                let _ = reply.send(state.publisher.publish_batch().await);
            }
        }
        Ok(())
    }
}

pub async fn run_once(
    publisher: &ActorRef<OutboxPublisherMsg>,
) -> Result<Result<PublishReport, PublisherError>, ractor::RactorErr<OutboxPublisherMsg>> {
    ractor::call!(publisher, |reply| OutboxPublisherMsg::RunOnce { reply })
}
