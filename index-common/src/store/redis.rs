use std::collections::HashMap;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use redis::aio::MultiplexedConnection;
use redis::AsyncCommands;
use tokio::sync::Mutex;
use tokio::time::timeout;
use tracing::{debug, warn};

use super::{Store, StoreError, StoreResult};

const DEFAULT_OP_TIMEOUT: Duration = Duration::from_millis(2000);
const DEFAULT_AVAILABILITY_TTL: Duration = Duration::from_secs(5);

/// Extra slack on top of a blocking pop's own timeout before we give up on
/// the round-trip itself.
const BLOCK_POP_MARGIN: Duration = Duration::from_secs(2);

/// `Store` implementation over a Redis server.
///
/// The connection is established lazily and cached, so the process can start
/// (and serve its fallback path) while Redis is down. A failed `ping` drops
/// the cached connection; the next operation reconnects.
pub struct RedisStore {
    client: redis::Client,
    connection: Mutex<Option<MultiplexedConnection>>,
    availability: Mutex<Option<(Instant, bool)>>,
    availability_ttl: Duration,
    op_timeout: Duration,
}

impl RedisStore {
    pub fn new(url: &str) -> StoreResult<Self> {
        let client = redis::Client::open(url).map_err(StoreError::from)?;

        Ok(Self {
            client,
            connection: Mutex::new(None),
            availability: Mutex::new(None),
            availability_ttl: DEFAULT_AVAILABILITY_TTL,
            op_timeout: DEFAULT_OP_TIMEOUT,
        })
    }

    async fn connection(&self) -> StoreResult<MultiplexedConnection> {
        let mut guard = self.connection.lock().await;
        if let Some(connection) = guard.as_ref() {
            return Ok(connection.clone());
        }

        let connection = timeout(
            self.op_timeout,
            self.client.get_multiplexed_async_connection(),
        )
        .await??;
        debug!("connected to redis");
        *guard = Some(connection.clone());
        Ok(connection)
    }

    async fn drop_connection(&self) {
        let mut guard = self.connection.lock().await;
        *guard = None;
    }
}

#[async_trait]
impl Store for RedisStore {
    async fn hash_set(&self, key: &str, fields: HashMap<String, String>) -> StoreResult<()> {
        let mut conn = self.connection().await?;
        let items: Vec<(String, String)> = fields.into_iter().collect();
        timeout(self.op_timeout, conn.hset_multiple::<_, _, _, ()>(key, &items)).await??;
        Ok(())
    }

    async fn hash_get_all(&self, key: &str) -> StoreResult<HashMap<String, String>> {
        let mut conn = self.connection().await?;
        let fields: HashMap<String, String> =
            timeout(self.op_timeout, conn.hgetall(key)).await??;

        // an empty hash and a missing key are the same thing to redis
        if fields.is_empty() {
            return Err(StoreError::NotFound);
        }

        Ok(fields)
    }

    async fn hash_incr_by(&self, key: &str, field: &str, delta: i64) -> StoreResult<i64> {
        let mut conn = self.connection().await?;
        let value: i64 = timeout(self.op_timeout, conn.hincr(key, field, delta)).await??;
        Ok(value)
    }

    async fn list_push_right(&self, key: &str, value: &str) -> StoreResult<()> {
        let mut conn = self.connection().await?;
        timeout(self.op_timeout, conn.rpush::<_, _, ()>(key, value)).await??;
        Ok(())
    }

    async fn list_block_pop_left(
        &self,
        key: &str,
        block_timeout: Duration,
    ) -> StoreResult<Option<String>> {
        let mut conn = self.connection().await?;
        let popped: Option<(String, String)> = timeout(
            block_timeout + BLOCK_POP_MARGIN,
            conn.blpop(key, block_timeout.as_secs_f64()),
        )
        .await??;
        Ok(popped.map(|(_, value)| value))
    }

    async fn list_len(&self, key: &str) -> StoreResult<u64> {
        let mut conn = self.connection().await?;
        let len: u64 = timeout(self.op_timeout, conn.llen(key)).await??;
        Ok(len)
    }

    async fn set_string(&self, key: &str, value: &str, ttl: Option<Duration>) -> StoreResult<()> {
        let mut conn = self.connection().await?;
        match ttl {
            Some(ttl) => {
                timeout(self.op_timeout, conn.set_ex::<_, _, ()>(key, value, ttl.as_secs()))
                    .await??
            }
            None => timeout(self.op_timeout, conn.set::<_, _, ()>(key, value)).await??,
        }
        Ok(())
    }

    async fn get_string(&self, key: &str) -> StoreResult<String> {
        let mut conn = self.connection().await?;
        let value: Option<String> = timeout(self.op_timeout, conn.get(key)).await??;

        match value {
            Some(value) => Ok(value),
            None => Err(StoreError::NotFound),
        }
    }

    async fn expire(&self, key: &str, ttl: Duration) -> StoreResult<()> {
        let mut conn = self.connection().await?;
        timeout(self.op_timeout, conn.expire::<_, ()>(key, ttl.as_secs() as i64)).await??;
        Ok(())
    }

    async fn delete(&self, key: &str) -> StoreResult<()> {
        let mut conn = self.connection().await?;
        timeout(self.op_timeout, conn.del::<_, ()>(key)).await??;
        Ok(())
    }

    async fn scan(&self, pattern: &str) -> StoreResult<Vec<String>> {
        let mut conn = self.connection().await?;
        let mut keys = Vec::new();
        let mut cursor: u64 = 0;

        loop {
            let (next, batch): (u64, Vec<String>) = timeout(
                self.op_timeout,
                redis::cmd("SCAN")
                    .arg(cursor)
                    .arg("MATCH")
                    .arg(pattern)
                    .arg("COUNT")
                    .arg(100)
                    .query_async(&mut conn),
            )
            .await??;

            keys.extend(batch);
            if next == 0 {
                break;
            }
            cursor = next;
        }

        Ok(keys)
    }

    async fn ping(&self) -> StoreResult<()> {
        let mut conn = self.connection().await?;
        let result: Result<String, _> =
            timeout(self.op_timeout, redis::cmd("PING").query_async(&mut conn)).await?;

        match result {
            Ok(_) => Ok(()),
            Err(err) => {
                // a broken multiplexed connection never heals itself
                self.drop_connection().await;
                Err(err.into())
            }
        }
    }

    async fn is_available(&self) -> bool {
        {
            let cached = self.availability.lock().await;
            if let Some((checked_at, available)) = *cached {
                if checked_at.elapsed() < self.availability_ttl {
                    return available;
                }
            }
        }

        let available = match self.ping().await {
            Ok(()) => true,
            Err(err) => {
                warn!("redis unavailable: {}", err);
                false
            }
        };

        let mut cached = self.availability.lock().await;
        *cached = Some((Instant::now(), available));
        available
    }
}
