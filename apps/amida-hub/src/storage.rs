use anyhow::Result;
use async_trait::async_trait;
use redis::aio::ConnectionManager;
use redis::{AsyncCommands, Client};
use std::sync::Arc;
use tokio::sync::Mutex;

use amida_core::SessionState;

pub type SharedStore = Arc<dyn StateStore>;

/// Durable persistence for the shared ladder. The store holds a copy with no
/// independent mutation path; the hub treats every call as fallible and keeps
/// serving from memory when the store is unreachable.
#[async_trait]
pub trait StateStore: Send + Sync {
    async fn load(&self) -> Result<Option<SessionState>>;
    async fn save(&self, snapshot: &SessionState) -> Result<()>;
}

const STATE_KEY: &str = "amida:session";

/// Redis-backed store. One key, JSON value, overwritten on every flush.
#[derive(Clone)]
pub struct RedisStore {
    redis: ConnectionManager,
}

impl RedisStore {
    pub async fn connect(redis_url: &str) -> Result<Self> {
        let client = Client::open(redis_url)?;
        let redis = ConnectionManager::new(client).await?;
        Ok(Self { redis })
    }
}

#[async_trait]
impl StateStore for RedisStore {
    async fn load(&self) -> Result<Option<SessionState>> {
        let mut conn = self.redis.clone();
        let value: Option<String> = conn.get(STATE_KEY).await?;
        match value {
            Some(json) => Ok(Some(serde_json::from_str(&json)?)),
            None => Ok(None),
        }
    }

    async fn save(&self, snapshot: &SessionState) -> Result<()> {
        let mut conn = self.redis.clone();
        let value = serde_json::to_string(snapshot)?;
        conn.set::<_, _, ()>(STATE_KEY, value).await?;
        Ok(())
    }
}

/// In-memory store for tests and redis-less local runs.
#[derive(Default)]
pub struct MemoryStore {
    state: Mutex<Option<SessionState>>,
}

#[async_trait]
impl StateStore for MemoryStore {
    async fn load(&self) -> Result<Option<SessionState>> {
        Ok(self.state.lock().await.clone())
    }

    async fn save(&self, snapshot: &SessionState) -> Result<()> {
        *self.state.lock().await = Some(snapshot.clone());
        Ok(())
    }
}
