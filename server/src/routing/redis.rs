//! Redis-backed routing store.
//!
//! SETEX/GET/DEL over a shared multiplexed connection. Every command is
//! wrapped in the configured operation timeout so a slow or unreachable
//! Redis degrades to dropped messages, never to a blocked connection
//! loop.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use redis::aio::MultiplexedConnection;
use tokio::sync::Mutex;
use tokio::time::timeout;

use super::{RoutingStore, StoreError};

pub struct RedisStore {
    conn: Arc<Mutex<MultiplexedConnection>>,
    op_timeout: Duration,
}

impl RedisStore {
    /// Connect and verify the server responds to PING.
    pub async fn connect(url: &str, op_timeout: Duration) -> Result<Self, StoreError> {
        let client = redis::Client::open(url).map_err(|_| StoreError::Unavailable)?;
        let mut conn = client
            .get_multiplexed_async_connection()
            .await
            .map_err(|_| StoreError::Unavailable)?;
        let _: String = redis::cmd("PING")
            .query_async(&mut conn)
            .await
            .map_err(|_| StoreError::Unavailable)?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
            op_timeout,
        })
    }
}

#[async_trait]
impl RoutingStore for RedisStore {
    async fn get(&self, key: &str) -> Result<Option<String>, StoreError> {
        let conn = self.conn.clone();
        timeout(self.op_timeout, async move {
            let mut conn = conn.lock().await;
            redis::cmd("GET")
                .arg(key)
                .query_async::<Option<String>>(&mut *conn)
                .await
                .map_err(|_| StoreError::Unavailable)
        })
        .await
        .map_err(|_| StoreError::Timeout)?
    }

    async fn set(&self, key: &str, value: &str, ttl_seconds: u64) -> Result<(), StoreError> {
        let conn = self.conn.clone();
        let ttl = ttl_seconds.max(1);
        timeout(self.op_timeout, async move {
            let mut conn = conn.lock().await;
            redis::cmd("SETEX")
                .arg(key)
                .arg(ttl)
                .arg(value)
                .query_async::<()>(&mut *conn)
                .await
                .map_err(|_| StoreError::Unavailable)
        })
        .await
        .map_err(|_| StoreError::Timeout)?
    }

    async fn delete(&self, key: &str) -> Result<(), StoreError> {
        let conn = self.conn.clone();
        timeout(self.op_timeout, async move {
            let mut conn = conn.lock().await;
            redis::cmd("DEL")
                .arg(key)
                .query_async::<()>(&mut *conn)
                .await
                .map_err(|_| StoreError::Unavailable)
        })
        .await
        .map_err(|_| StoreError::Timeout)?
    }
}
