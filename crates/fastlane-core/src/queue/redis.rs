//! Redis-backed queue: a sorted set scored by visibility timestamp

use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use once_cell::sync::Lazy;
use redis::aio::ConnectionManager;
use redis::{AsyncCommands, Client, Script};

use crate::queue::{Delivery, Queue};
use crate::{Error, Result};

/// Atomically claim the earliest due member: bump its score to
/// now + visibility so concurrent poppers cannot hand it out twice.
static POP_SCRIPT: Lazy<Script> = Lazy::new(|| {
    Script::new(
        r#"
        local due = redis.call('ZRANGEBYSCORE', KEYS[1], '-inf', ARGV[1], 'LIMIT', 0, 1)
        if #due == 0 then
            return false
        end
        redis.call('ZADD', KEYS[1], ARGV[2], due[1])
        return due[1]
        "#,
    )
});

/// Open a shared connection to the queue backend
pub async fn connect(url: &str) -> Result<ConnectionManager> {
    let client = Client::open(url).map_err(|e| Error::queue(format!("{}: {}", url, e)))?;
    ConnectionManager::new(client)
        .await
        .map_err(|e| Error::queue(format!("{}: {}", url, e)))
}

/// One stream, keyed `{namespace}:queue:{name}`
#[derive(Clone)]
pub struct RedisQueue {
    manager: ConnectionManager,
    name: String,
    key: String,
}

impl RedisQueue {
    /// Bind a stream to an open connection
    pub fn new(manager: ConnectionManager, namespace: &str, name: impl Into<String>) -> Self {
        let name = name.into();
        let key = format!("{}:queue:{}", namespace, name);
        Self { manager, name, key }
    }
}

#[async_trait]
impl Queue for RedisQueue {
    fn name(&self) -> &str {
        &self.name
    }

    async fn push(&self, payload: &str, delay: Duration) -> Result<()> {
        let visible_at = Utc::now().timestamp_millis() + delay.as_millis() as i64;
        let mut conn = self.manager.clone();
        let _: i64 = conn.zadd(&self.key, payload, visible_at).await?;
        Ok(())
    }

    async fn pop(&self, visibility: Duration) -> Result<Option<Delivery>> {
        let now = Utc::now().timestamp_millis();
        let invisible_until = now + visibility.as_millis() as i64;

        let mut conn = self.manager.clone();
        let member: Option<String> = POP_SCRIPT
            .key(&self.key)
            .arg(now)
            .arg(invisible_until)
            .invoke_async(&mut conn)
            .await?;

        Ok(member.map(|receipt| Delivery { receipt }))
    }

    async fn ack(&self, delivery: &Delivery) -> Result<()> {
        let mut conn = self.manager.clone();
        let _: i64 = conn.zrem(&self.key, &delivery.receipt).await?;
        Ok(())
    }

    async fn release(&self, delivery: &Delivery) -> Result<()> {
        let now = Utc::now().timestamp_millis();
        let mut conn = self.manager.clone();
        // XX: only reschedule a member that still exists (not acked)
        let script = Script::new(
            r#"
            return redis.call('ZADD', KEYS[1], 'XX', 'CH', ARGV[1], ARGV[2])
            "#,
        );
        let _: i64 = script.key(&self.key).arg(now).arg(&delivery.receipt).invoke_async(&mut conn).await?;
        Ok(())
    }

    async fn len(&self) -> Result<usize> {
        let mut conn = self.manager.clone();
        let count: i64 = conn.zcard(&self.key).await?;
        Ok(count as usize)
    }
}
