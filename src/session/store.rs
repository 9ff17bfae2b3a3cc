use crate::session::ConversationSession;
use async_trait::async_trait;
use redis::AsyncCommands;
use std::{collections::HashMap, sync::Arc, time::Duration};
use thiserror::Error;
use tokio::sync::Mutex;

#[derive(Debug, Error)]
pub enum SessionStoreError {
    #[error("session backend unavailable: {0}")]
    Backend(String),
    #[error("session payload is corrupt: {0}")]
    Corrupt(String),
}

/// Durable conversation state keyed by identity (phone number, or
/// `flow:<token>` for structured-form submissions). Writers replace the whole
/// session; callers serialize per key through [`super::IdentityLocks`].
#[async_trait]
pub trait SessionStore: Send + Sync {
    async fn get(&self, key: &str) -> Result<Option<ConversationSession>, SessionStoreError>;
    async fn put(&self, key: &str, session: &ConversationSession)
    -> Result<(), SessionStoreError>;
    async fn delete(&self, key: &str) -> Result<(), SessionStoreError>;
}

#[derive(Clone, Default)]
pub struct MemorySessionStore {
    sessions: Arc<Mutex<HashMap<String, ConversationSession>>>,
}

impl MemorySessionStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl SessionStore for MemorySessionStore {
    async fn get(&self, key: &str) -> Result<Option<ConversationSession>, SessionStoreError> {
        Ok(self.sessions.lock().await.get(key).cloned())
    }

    async fn put(
        &self,
        key: &str,
        session: &ConversationSession,
    ) -> Result<(), SessionStoreError> {
        self.sessions
            .lock()
            .await
            .insert(key.to_string(), session.clone());
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<(), SessionStoreError> {
        self.sessions.lock().await.remove(key);
        Ok(())
    }
}

/// Redis-backed store: one JSON value per key, expiring with the session window.
#[derive(Clone)]
pub struct RedisSessionStore {
    client: redis::Client,
    ttl: Duration,
    prefix: String,
}

impl RedisSessionStore {
    pub fn new(client: redis::Client, ttl: Duration) -> Self {
        Self {
            client,
            ttl,
            prefix: "closet:session:".to_string(),
        }
    }

    fn key(&self, key: &str) -> String {
        format!("{}{key}", self.prefix)
    }

    async fn connection(&self) -> Result<redis::aio::MultiplexedConnection, SessionStoreError> {
        self.client
            .get_multiplexed_async_connection()
            .await
            .map_err(|err| SessionStoreError::Backend(err.to_string()))
    }
}

#[async_trait]
impl SessionStore for RedisSessionStore {
    async fn get(&self, key: &str) -> Result<Option<ConversationSession>, SessionStoreError> {
        let mut conn = self.connection().await?;
        let raw: Option<String> = conn
            .get(self.key(key))
            .await
            .map_err(|err| SessionStoreError::Backend(err.to_string()))?;
        raw.map(|value| {
            serde_json::from_str(&value).map_err(|err| SessionStoreError::Corrupt(err.to_string()))
        })
        .transpose()
    }

    async fn put(
        &self,
        key: &str,
        session: &ConversationSession,
    ) -> Result<(), SessionStoreError> {
        let json = serde_json::to_string(session)
            .map_err(|err| SessionStoreError::Corrupt(err.to_string()))?;
        let mut conn = self.connection().await?;
        let _: () = conn
            .set_ex(self.key(key), json, self.ttl.as_secs().max(1))
            .await
            .map_err(|err| SessionStoreError::Backend(err.to_string()))?;
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<(), SessionStoreError> {
        let mut conn = self.connection().await?;
        let _: () = conn
            .del(self.key(key))
            .await
            .map_err(|err| SessionStoreError::Backend(err.to_string()))?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::ConversationState;

    #[tokio::test]
    async fn memory_store_upserts_and_deletes() {
        let store = MemorySessionStore::new();
        let mut session = ConversationSession::new("15550100000");
        store.put("15550100000", &session).await.unwrap();

        session.state = ConversationState::AwaitingIdentity;
        store.put("15550100000", &session).await.unwrap();
        let loaded = store.get("15550100000").await.unwrap().unwrap();
        assert_eq!(loaded.state, ConversationState::AwaitingIdentity);

        store.delete("15550100000").await.unwrap();
        assert!(store.get("15550100000").await.unwrap().is_none());
    }

    #[test]
    fn redis_keys_are_prefixed() {
        let client = redis::Client::open("redis://127.0.0.1/").unwrap();
        let store = RedisSessionStore::new(client, Duration::from_secs(60));
        assert_eq!(store.key("15550100000"), "closet:session:15550100000");
    }
}
