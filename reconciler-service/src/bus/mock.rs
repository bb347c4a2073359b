//! Recording publisher for testing.

use std::collections::HashSet;

use async_trait::async_trait;
use tokio::sync::RwLock;

use super::{BusError, MessagePublisher, Result};
use crate::models::OutgoingBatch;

#[derive(Default)]
pub struct MockPublisher {
    published: RwLock<Vec<(String, OutgoingBatch)>>,
    attempts: RwLock<usize>,
    fail_attempts: RwLock<HashSet<usize>>,
    hang: RwLock<bool>,
}

impl MockPublisher {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fail the given publish attempts, counted from 1.
    pub async fn fail_on_attempts(&self, attempts: impl IntoIterator<Item = usize>) {
        self.fail_attempts.write().await.extend(attempts);
    }

    /// Never complete a publish call.
    pub async fn set_hang(&self, hang: bool) {
        *self.hang.write().await = hang;
    }

    pub async fn attempt_count(&self) -> usize {
        *self.attempts.read().await
    }

    pub async fn published_count(&self) -> usize {
        self.published.read().await.len()
    }

    pub async fn published(&self) -> Vec<(String, OutgoingBatch)> {
        self.published.read().await.clone()
    }
}

#[async_trait]
impl MessagePublisher for MockPublisher {
    async fn publish(&self, route: &str, batch: &OutgoingBatch) -> Result<()> {
        let attempt = {
            let mut attempts = self.attempts.write().await;
            *attempts += 1;
            *attempts
        };

        if *self.hang.read().await {
            futures::future::pending::<()>().await;
        }

        if self.fail_attempts.read().await.contains(&attempt) {
            return Err(BusError::Publish(format!(
                "Mock publish failure on attempt {}",
                attempt
            )));
        }

        self.published
            .write()
            .await
            .push((route.to_string(), batch.clone()));
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_records_and_fails_selected_attempts() {
        let publisher = MockPublisher::new();
        publisher.fail_on_attempts([2]).await;
        let batch = OutgoingBatch::create_transactions("1", "budget", vec![]);

        assert!(publisher.publish("ynab_tasks", &batch).await.is_ok());
        assert!(publisher.publish("ynab_tasks", &batch).await.is_err());
        assert!(publisher.publish("ynab_tasks", &batch).await.is_ok());

        assert_eq!(publisher.attempt_count().await, 3);
        assert_eq!(publisher.published_count().await, 2);
        assert_eq!(publisher.published().await[0].0, "ynab_tasks");
    }
}
