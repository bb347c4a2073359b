//! Message bus: inbound tasks and outgoing batches.
//!
//! - `MessagePublisher` trait: what the orchestrator needs to dispatch a batch
//! - `amqp`: RabbitMQ consumer and publisher
//! - `mock`: recording publisher for tests

use crate::models::OutgoingBatch;
use async_trait::async_trait;

pub mod amqp;
pub mod mock;

pub use amqp::{AmqpBus, AmqpPublisher};
pub use mock::MockPublisher;

pub type Result<T> = std::result::Result<T, BusError>;

#[derive(Debug, thiserror::Error)]
pub enum BusError {
    #[error("Connection failed: {0}")]
    Connection(String),

    #[error("Publish failed: {0}")]
    Publish(String),

    #[error("Consume failed: {0}")]
    Consume(String),

    #[error("Serialization failed: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// Sends outgoing batches to a named route.
#[async_trait]
pub trait MessagePublisher: Send + Sync {
    async fn publish(&self, route: &str, batch: &OutgoingBatch) -> Result<()>;
}
