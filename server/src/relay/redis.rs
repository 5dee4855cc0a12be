//! Redis pub/sub relay bus.
//!
//! Publishes over a shared multiplexed connection; each subscription
//! holds its own pub/sub connection drained by a background task. A
//! gateway subscribes to exactly one topic, so that is one extra
//! connection per process.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures_util::StreamExt;
use redis::aio::MultiplexedConnection;
use tokio::sync::{mpsc, Mutex};
use tokio::time::timeout;

use super::{BusError, RelayBus};

pub struct RedisBus {
    client: redis::Client,
    conn: Arc<Mutex<MultiplexedConnection>>,
    op_timeout: Duration,
}

impl RedisBus {
    pub async fn connect(url: &str, op_timeout: Duration) -> Result<Self, BusError> {
        let client = redis::Client::open(url).map_err(|_| BusError::Unavailable)?;
        let conn = client
            .get_multiplexed_async_connection()
            .await
            .map_err(|_| BusError::Unavailable)?;
        Ok(Self {
            client,
            conn: Arc::new(Mutex::new(conn)),
            op_timeout,
        })
    }
}

#[async_trait]
impl RelayBus for RedisBus {
    async fn publish(&self, topic: &str, payload: &[u8]) -> Result<(), BusError> {
        let conn = self.conn.clone();
        let topic = topic.to_string();
        let payload = payload.to_vec();
        timeout(self.op_timeout, async move {
            let mut conn = conn.lock().await;
            redis::cmd("PUBLISH")
                .arg(topic)
                .arg(payload)
                .query_async::<i64>(&mut *conn)
                .await
                .map(|_| ())
                .map_err(|_| BusError::Unavailable)
        })
        .await
        .map_err(|_| BusError::Timeout)?
    }

    async fn subscribe(
        &self,
        topic: &str,
    ) -> Result<mpsc::UnboundedReceiver<Vec<u8>>, BusError> {
        let mut pubsub = self
            .client
            .get_async_pubsub()
            .await
            .map_err(|_| BusError::Unavailable)?;
        pubsub
            .subscribe(topic)
            .await
            .map_err(|_| BusError::Unavailable)?;

        let (tx, rx) = mpsc::unbounded_channel();
        let topic = topic.to_string();
        tokio::spawn(async move {
            let mut stream = pubsub.into_on_message();
            while let Some(msg) = stream.next().await {
                let payload: Vec<u8> = match msg.get_payload() {
                    Ok(payload) => payload,
                    Err(_) => continue,
                };
                if tx.send(payload).is_err() {
                    // Receiver gone: the process is shutting down.
                    break;
                }
            }
            tracing::warn!(topic = %topic, "relay bus subscription stream ended");
        });
        Ok(rx)
    }
}
