//! Idempotency-Key bookkeeping for job starts: (owner, key) -> job id.
//! Redis when configured, a process-local map otherwise or when Redis is
//! unreachable.

use parking_lot::Mutex;
use redis::AsyncCommands;
use std::collections::HashMap;
use std::time::Duration;
use tokio::time::Instant;
use tracing::warn;
use uuid::Uuid;

pub struct IdempotencyCache {
    redis: Option<redis::Client>,
    ttl: Duration,
    local: Mutex<HashMap<(String, String), (Uuid, Instant)>>,
}

impl IdempotencyCache {
    pub fn new(redis_url: Option<&str>, ttl: Duration) -> eyre::Result<Self> {
        let redis = redis_url.map(redis::Client::open).transpose()?;
        Ok(Self {
            redis,
            ttl,
            local: Mutex::new(HashMap::new()),
        })
    }

    pub fn in_memory(ttl: Duration) -> Self {
        Self {
            redis: None,
            ttl,
            local: Mutex::new(HashMap::new()),
        }
    }

    pub async fn lookup(&self, owner: &str, key: &str) -> Option<Uuid> {
        if let Some(client) = &self.redis {
            match redis_get(client, &redis_key(owner, key)).await {
                Ok(found) => return found,
                Err(err) => {
                    warn!(target = "fleet.api", error = %err, "idempotency_redis_get_failed");
                }
            }
        }
        let mut local = self.local.lock();
        let entry = (owner.to_string(), key.to_string());
        match local.get(&entry) {
            Some((id, stored)) if stored.elapsed() < self.ttl => Some(*id),
            Some(_) => {
                local.remove(&entry);
                None
            }
            None => None,
        }
    }

    pub async fn remember(&self, owner: &str, key: &str, id: Uuid) {
        if let Some(client) = &self.redis {
            match redis_set(client, &redis_key(owner, key), id, self.ttl).await {
                Ok(()) => return,
                Err(err) => {
                    warn!(target = "fleet.api", error = %err, "idempotency_redis_set_failed");
                }
            }
        }
        self.local
            .lock()
            .insert((owner.to_string(), key.to_string()), (id, Instant::now()));
    }
}

fn redis_key(owner: &str, key: &str) -> String {
    format!("fleet:idem:{owner}:{key}")
}

async fn redis_get(client: &redis::Client, key: &str) -> redis::RedisResult<Option<Uuid>> {
    let mut conn = client.get_multiplexed_async_connection().await?;
    let stored: Option<String> = conn.get(key).await?;
    Ok(stored.and_then(|value| Uuid::parse_str(&value).ok()))
}

async fn redis_set(
    client: &redis::Client,
    key: &str,
    id: Uuid,
    ttl: Duration,
) -> redis::RedisResult<()> {
    let mut conn = client.get_multiplexed_async_connection().await?;
    conn.set_ex(key, id.to_string(), ttl.as_secs().max(1)).await
}
