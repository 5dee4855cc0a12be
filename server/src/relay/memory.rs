//! In-process relay bus backend for single-process mode and tests.

use async_trait::async_trait;
use dashmap::DashMap;
use tokio::sync::mpsc;

use super::{BusError, RelayBus};

/// Topic -> subscriber senders. Closed subscribers are pruned on
/// publish, so an unsubscribed topic naturally stops receiving.
#[derive(Debug, Default)]
pub struct MemoryBus {
    topics: DashMap<String, Vec<mpsc::UnboundedSender<Vec<u8>>>>,
}

impl MemoryBus {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl RelayBus for MemoryBus {
    async fn publish(&self, topic: &str, payload: &[u8]) -> Result<(), BusError> {
        if let Some(mut subscribers) = self.topics.get_mut(topic) {
            subscribers.retain(|tx| tx.send(payload.to_vec()).is_ok());
        }
        // No subscriber is not an error: at-most-once, best-effort.
        Ok(())
    }

    async fn subscribe(
        &self,
        topic: &str,
    ) -> Result<mpsc::UnboundedReceiver<Vec<u8>>, BusError> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.topics.entry(topic.to_string()).or_default().push(tx);
        Ok(rx)
    }
}
