use async_trait::async_trait;
use redis::aio::ConnectionManager;
use redis::{Client, RedisError, Script};
use tracing::debug;

use crate::distributed::{Admission, StoreError, WindowStore};

/// Sliding-window check-and-record, executed atomically by the server.
///
/// KEYS[1] sorted set of `"{ms}-{seq}"` members scored by ms,
/// KEYS[2] per-key sequence counter. ARGV[1] limit, ARGV[2] window in ms.
/// Time comes from the server so every client shares one clock.
const ACQUIRE_SCRIPT: &str = r#"
local window_key = KEYS[1]
local seq_key = KEYS[2]
local limit = tonumber(ARGV[1])
local window = tonumber(ARGV[2])
local time = redis.call('TIME')
local now = tonumber(time[1]) * 1000 + math.floor(tonumber(time[2]) / 1000)

redis.call('ZREMRANGEBYSCORE', window_key, '-inf', now - window)
local count = redis.call('ZCARD', window_key)
if count < limit then
  local seq = redis.call('INCR', seq_key)
  redis.call('ZADD', window_key, now, string.format('%d-%d', now, seq))
  redis.call('PEXPIRE', window_key, window)
  redis.call('PEXPIRE', seq_key, window)
  return {1, 0}
end

local retry = window
local oldest = redis.call('ZRANGE', window_key, 0, 0, 'WITHSCORES')
if oldest[2] then
  retry = tonumber(oldest[2]) + window - now
end
if retry < 1 then
  retry = 1
end
return {0, retry}
"#;

/// [`WindowStore`] backed by Redis.
///
/// Both keys of a bucket share a hash tag, so they land in the same cluster
/// slot and the script stays single-slot.
///
/// Requires Redis 5 or later. The script reads `TIME` before writing, which
/// older servers refuse unless effects replication is switched on; 5.0 made
/// it the default.
#[derive(Clone)]
pub struct RedisWindowStore {
    connection: ConnectionManager,
    script: Script,
    prefix: String,
}

impl RedisWindowStore {
    pub async fn connect(url: &str) -> Result<Self, RedisError> {
        let client = Client::open(url)?;
        let connection = ConnectionManager::new(client).await?;
        Ok(Self {
            connection,
            script: Script::new(ACQUIRE_SCRIPT),
            prefix: "magsag:rl".to_owned(),
        })
    }

    pub fn with_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.prefix = prefix.into();
        self
    }

    fn keys(&self, key: &str) -> (String, String) {
        let window_key = format!("{}:{{{}}}", self.prefix, key);
        let seq_key = format!("{window_key}:seq");
        (window_key, seq_key)
    }
}

fn classify(error: RedisError) -> StoreError {
    if error.is_io_error()
        || error.is_connection_refusal()
        || error.is_connection_dropped()
        || error.is_timeout()
    {
        StoreError::Unavailable(error.to_string())
    } else {
        StoreError::Backend(Box::new(error))
    }
}

#[async_trait]
impl WindowStore for RedisWindowStore {
    async fn try_acquire(
        &self,
        key: &str,
        limit: u32,
        window_ms: u64,
    ) -> Result<Admission, StoreError> {
        let (window_key, seq_key) = self.keys(key);
        let mut connection = self.connection.clone();
        let (granted, retry_after_ms): (i64, i64) = self
            .script
            .key(&window_key)
            .key(&seq_key)
            .arg(limit)
            .arg(window_ms)
            .invoke_async(&mut connection)
            .await
            .map_err(classify)?;
        debug!(window_key = %window_key, granted, retry_after_ms, "redis window script ran");

        Ok(if granted == 1 {
            Admission {
                granted: true,
                retry_after_ms: None,
            }
        } else {
            Admission {
                granted: false,
                retry_after_ms: Some(retry_after_ms.max(1) as u64),
            }
        })
    }
}
