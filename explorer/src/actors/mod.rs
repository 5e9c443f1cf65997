pub mod event_store;
pub mod graph_projector;
pub mod outbox_publisher;

pub use event_store::{EventStoreActor, EventStoreArguments, EventStoreMsg};
pub use graph_projector::{GraphProjector, GraphProjectorActor, GraphProjectorArguments, GraphProjectorMsg};
pub use outbox_publisher::{
    EventSink, OutboxPublisher, OutboxPublisherActor, OutboxPublisherArguments, OutboxPublisherMsg,
    TracingEventSink,
};
