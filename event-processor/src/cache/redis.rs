use std::time::Duration;

use async_trait::async_trait;
use redis::aio::MultiplexedConnection;
use redis::AsyncCommands;
use tracing::info;

use crate::cache::{CacheError, ListCache};

const CONNECTION_TIMEOUT: Duration = Duration::from_secs(5);
const RESPONSE_TIMEOUT: Duration = Duration::from_secs(2);

#[derive(Clone)]
pub struct RedisListCache {
    connection: MultiplexedConnection,
}

impl RedisListCache {
    /// Opens a multiplexed connection and pings it, so a bad URL fails at startup.
    pub async fn connect(url: &str) -> Result<Self, CacheError> {
        let client = redis::Client::open(url)?;
        let config = redis::AsyncConnectionConfig::new()
            .set_connection_timeout(CONNECTION_TIMEOUT)
            .set_response_timeout(RESPONSE_TIMEOUT);
        let mut connection = client
            .get_multiplexed_async_connection_with_config(&config)
            .await?;

        redis::cmd("PING")
            .query_async::<String>(&mut connection)
            .await?;
        info!("Recent activity cache connected");

        Ok(Self { connection })
    }
}

#[async_trait]
impl ListCache for RedisListCache {
    async fn push(&self, key: &str, value: String) -> Result<(), CacheError> {
        let mut conn = self.connection.clone();
        conn.lpush::<_, _, ()>(key, value).await?;
        Ok(())
    }

    async fn trim(&self, key: &str, start: isize, stop: isize) -> Result<(), CacheError> {
        let mut conn = self.connection.clone();
        conn.ltrim::<_, ()>(key, start, stop).await?;
        Ok(())
    }

    async fn expire(&self, key: &str, ttl: Duration) -> Result<(), CacheError> {
        let mut conn = self.connection.clone();
        conn.expire::<_, ()>(key, ttl.as_secs() as i64).await?;
        Ok(())
    }

    async fn range(
        &self,
        key: &str,
        start: isize,
        stop: isize,
    ) -> Result<Vec<String>, CacheError> {
        let mut conn = self.connection.clone();
        Ok(conn.lrange(key, start, stop).await?)
    }

    async fn record(
        &self,
        key: &str,
        value: String,
        max_entries: usize,
        ttl: Duration,
    ) -> Result<(), CacheError> {
        let mut pipe = redis::pipe();
        pipe.atomic()
            .lpush(key, value)
            .ignore()
            .ltrim(key, 0, max_entries as isize - 1)
            .ignore()
            .expire(key, ttl.as_secs() as i64)
            .ignore();

        let mut conn = self.connection.clone();
        pipe.query_async::<()>(&mut conn).await?;
        Ok(())
    }
}
