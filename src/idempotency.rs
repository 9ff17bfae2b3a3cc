use std::{
    collections::HashMap,
    sync::Arc,
    time::{Duration, Instant},
};
use tokio::sync::Mutex;
use tracing::warn;

const PRUNE_THRESHOLD: usize = 4096;

/// Remembers inbound message ids so provider redeliveries are dropped before
/// they reach the conversation engine.
#[derive(Clone)]
pub struct MessageDeduper {
    redis: Option<redis::Client>,
    ttl: Duration,
    seen: Arc<Mutex<HashMap<String, Instant>>>,
}

impl MessageDeduper {
    pub fn new(redis: Option<redis::Client>, ttl: Duration) -> Self {
        Self {
            redis,
            ttl,
            seen: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    /// True the first time `message_id` is seen within the window.
    pub async fn first_delivery(&self, message_id: &str) -> bool {
        if let Some(client) = &self.redis {
            match redis_claim(client, message_id, self.ttl).await {
                Ok(claimed) => return claimed,
                Err(err) => {
                    warn!(target = "closet.api", error = %err, "dedupe_redis_unavailable");
                }
            }
        }
        self.memory_claim(message_id).await
    }

    /// Forgets a claimed id, e.g. when the message could not be queued.
    pub async fn release(&self, message_id: &str) {
        if let Some(client) = &self.redis
            && let Err(err) = redis_release(client, message_id).await
        {
            warn!(target = "closet.api", error = %err, "dedupe_release_failed");
        }
        self.seen.lock().await.remove(message_id);
    }

    async fn memory_claim(&self, message_id: &str) -> bool {
        let mut seen = self.seen.lock().await;
        let now = Instant::now();
        if seen.len() > PRUNE_THRESHOLD {
            seen.retain(|_, at| now.duration_since(*at) < self.ttl);
        }
        match seen.get(message_id) {
            Some(at) if now.duration_since(*at) < self.ttl => false,
            _ => {
                seen.insert(message_id.to_string(), now);
                true
            }
        }
    }
}

async fn redis_claim(
    client: &redis::Client,
    message_id: &str,
    ttl: Duration,
) -> Result<bool, redis::RedisError> {
    let mut conn = client.get_multiplexed_async_connection().await?;
    let reply: Option<String> = redis::cmd("SET")
        .arg(format!("closet:seen:{message_id}"))
        .arg(1)
        .arg("NX")
        .arg("EX")
        .arg(ttl.as_secs().max(1))
        .query_async(&mut conn)
        .await?;
    Ok(reply.is_some())
}

async fn redis_release(client: &redis::Client, message_id: &str) -> Result<(), redis::RedisError> {
    let mut conn = client.get_multiplexed_async_connection().await?;
    let _: i64 = redis::cmd("DEL")
        .arg(format!("closet:seen:{message_id}"))
        .query_async(&mut conn)
        .await?;
    Ok(())
}
