//! AMQP (RabbitMQ) task consumer and batch publisher.
//!
//! Tasks are consumed one at a time (prefetch 1) and acknowledged only after
//! the orchestrator has finished with them. Batches go to the default
//! exchange with the outbound queue name as routing key.

use std::sync::Arc;

use async_trait::async_trait;
use futures::StreamExt;
use lapin::{
    options::{
        BasicAckOptions, BasicConsumeOptions, BasicPublishOptions, BasicQosOptions,
        BasicRejectOptions, ConfirmSelectOptions, QueueDeclareOptions,
    },
    publisher_confirm::Confirmation,
    types::FieldTable,
    BasicProperties, Channel, Connection, ConnectionProperties,
};
use secrecy::ExposeSecret;
use tracing::{debug, error, info, warn};

use super::{BusError, MessagePublisher, Result};
use crate::config::RabbitMqConfig;
use crate::models::{OutgoingBatch, Task};
use crate::reconcile::{TaskOrchestrator, TaskOutcome};

/// Only one unacknowledged task in flight.
const PREFETCH_COUNT: u16 = 1;

const CONSUMER_TAG: &str = "reconciler-service";

/// Declare a durable queue on `channel`.
async fn declare_durable_queue(channel: &Channel, queue: &str) -> Result<()> {
    channel
        .queue_declare(
            queue,
            QueueDeclareOptions {
                durable: true,
                ..Default::default()
            },
            FieldTable::default(),
        )
        .await
        .map_err(|e| BusError::Connection(format!("Failed to declare queue {}: {}", queue, e)))?;
    Ok(())
}

/// Connected RabbitMQ bus: one channel for consuming, one for publishing.
pub struct AmqpBus {
    connection: Connection,
    consume_channel: Channel,
    publish_channel: Channel,
    task_queue: String,
}

impl AmqpBus {
    pub async fn connect(config: &RabbitMqConfig) -> Result<Self> {
        let connection = Connection::connect(
            config.amqp_url().expose_secret(),
            ConnectionProperties::default(),
        )
        .await
        .map_err(|e| BusError::Connection(format!("Failed to connect: {}", e)))?;

        let consume_channel = connection
            .create_channel()
            .await
            .map_err(|e| BusError::Connection(format!("Failed to create channel: {}", e)))?;

        consume_channel
            .basic_qos(PREFETCH_COUNT, BasicQosOptions::default())
            .await
            .map_err(|e| BusError::Connection(format!("Failed to set prefetch: {}", e)))?;

        let publish_channel = connection
            .create_channel()
            .await
            .map_err(|e| BusError::Connection(format!("Failed to create channel: {}", e)))?;

        publish_channel
            .confirm_select(ConfirmSelectOptions::default())
            .await
            .map_err(|e| BusError::Connection(format!("Failed to enable publisher confirms: {}", e)))?;

        declare_durable_queue(&consume_channel, &config.task_queue).await?;
        declare_durable_queue(&publish_channel, &config.outbound_queue).await?;

        info!(
            addr = %config.display_addr(),
            task_queue = %config.task_queue,
            outbound_queue = %config.outbound_queue,
            "Connected to RabbitMQ"
        );

        Ok(Self {
            connection,
            consume_channel,
            publish_channel,
            task_queue: config.task_queue.clone(),
        })
    }

    pub fn publisher(&self) -> AmqpPublisher {
        AmqpPublisher {
            channel: self.publish_channel.clone(),
        }
    }

    pub fn is_connected(&self) -> bool {
        self.connection.status().connected()
    }

    /// Consume tasks sequentially until the delivery stream fails or ends.
    pub async fn consume(&self, orchestrator: Arc<TaskOrchestrator>) -> Result<()> {
        let mut consumer = self
            .consume_channel
            .basic_consume(
                &self.task_queue,
                CONSUMER_TAG,
                BasicConsumeOptions::default(),
                FieldTable::default(),
            )
            .await
            .map_err(|e| BusError::Consume(format!("Failed to start consumer: {}", e)))?;

        info!(queue = %self.task_queue, "Consumer started, processing tasks");

        while let Some(delivery) = consumer.next().await {
            match delivery {
                Ok(delivery) => Self::process_delivery(delivery, &orchestrator).await,
                Err(e) => {
                    error!(error = %e, "Consumer delivery error");
                    return Err(BusError::Consume(e.to_string()));
                }
            }
        }

        warn!(queue = %self.task_queue, "Consumer stream ended");
        Err(BusError::Consume("consumer stream ended".to_string()))
    }

    /// Handle one delivery and acknowledge it.
    async fn process_delivery(delivery: lapin::message::Delivery, orchestrator: &TaskOrchestrator) {
        let task: Task = match serde_json::from_slice(&delivery.data) {
            Ok(task) => task,
            Err(e) => {
                error!(error = %e, "Error decoding task message, rejecting");
                if let Err(e) = delivery
                    .reject(BasicRejectOptions { requeue: false })
                    .await
                {
                    error!(error = %e, "Failed to reject message");
                }
                return;
            }
        };

        debug!(action = %task.action, account_id = %task.account_id, "Received task");

        match orchestrator.handle_task(task).await {
            TaskOutcome::Aborted(reason) => info!(reason = %reason, "Task handled with abort"),
            outcome => debug!(outcome = outcome.label(), "Task handled"),
        }

        if let Err(e) = delivery.ack(BasicAckOptions::default()).await {
            error!(error = %e, "Failed to ack message");
        }
    }
}

/// Only a broker ack counts as delivered.
fn check_confirmation(confirmation: Confirmation) -> Result<()> {
    match confirmation {
        Confirmation::Ack(_) => Ok(()),
        Confirmation::Nack(_) => Err(BusError::Publish("Broker rejected batch".to_string())),
        Confirmation::NotRequested => Err(BusError::Publish(
            "Publisher confirms not enabled on channel".to_string(),
        )),
    }
}

/// Publishes outgoing batches as persistent JSON messages.
#[derive(Clone)]
pub struct AmqpPublisher {
    channel: Channel,
}

#[async_trait]
impl MessagePublisher for AmqpPublisher {
    async fn publish(&self, route: &str, batch: &OutgoingBatch) -> Result<()> {
        let payload = serde_json::to_vec(batch)?;

        let properties = BasicProperties::default()
            .with_content_type("application/json".into())
            .with_delivery_mode(2); // persistent

        let confirm = self
            .channel
            .basic_publish(
                "",
                route,
                BasicPublishOptions::default(),
                &payload,
                properties,
            )
            .await
            .map_err(|e| BusError::Publish(format!("Failed to publish: {}", e)))?;

        let confirmation = confirm
            .await
            .map_err(|e| BusError::Publish(format!("Publish confirmation failed: {}", e)))?;
        check_confirmation(confirmation)?;

        debug!(route = %route, bytes = payload.len(), "Published batch");
        Ok(())
    }
}
