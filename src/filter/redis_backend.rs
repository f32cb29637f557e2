// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Shared bloom filters stored as Redis bitmaps.
//!
//! Each filter is two keys:
//! - `<name>`: the bitmap (`SETBIT`/`GETBIT`/`BITCOUNT`)
//! - `<name>:config`: a hash with `size`, `hashes`, `expected`, `fpp`
//!
//! Every mutating or probing operation is a Lua script, so the parameter
//! check and the bit operations happen in one atomic round trip. A process
//! holding stale parameters (another process rebuilt the filter with a new
//! size) gets `ConfigMismatch` rather than probing the wrong offsets.
//!
//! Rebuild locks are plain string keys taken with `SET NX PX` and released
//! only by the owner that took them.

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use redis::aio::ConnectionManager;
use redis::{AsyncCommands, Client, Script};
use tracing::debug;

use super::backend::FilterBackend;
use super::bloom::BloomParams;
use super::FilterError;
use crate::resilience::retry::{retry, RetryConfig};

const MISSING: i64 = -1;
const MISMATCH: i64 = -2;

// KEYS: bitmap, config. ARGV: size, hashes, expected, fpp
const INIT_LUA: &str = r"
if redis.call('EXISTS', KEYS[2]) == 1 then
  return 0
end
redis.call('HSET', KEYS[2], 'size', ARGV[1], 'hashes', ARGV[2], 'expected', ARGV[3], 'fpp', ARGV[4])
redis.call('SETBIT', KEYS[1], tonumber(ARGV[1]) - 1, 0)
return 1
";

// KEYS: bitmap, config. ARGV: size, hashes, offsets (hashes per element)
const ADD_LUA: &str = r"
local cfg = redis.call('HMGET', KEYS[2], 'size', 'hashes')
if not cfg[1] then return -1 end
if cfg[1] ~= ARGV[1] or cfg[2] ~= ARGV[2] then return -2 end
local k = tonumber(ARGV[2])
local added = 0
local i = 3
while i <= #ARGV do
  local fresh = 0
  for j = 0, k - 1 do
    if redis.call('SETBIT', KEYS[1], ARGV[i + j], 1) == 0 then fresh = 1 end
  end
  added = added + fresh
  i = i + k
end
return added
";

// KEYS: bitmap, config. ARGV: size, hashes, offsets
const CONTAINS_LUA: &str = r"
local cfg = redis.call('HMGET', KEYS[2], 'size', 'hashes')
if not cfg[1] then return -1 end
if cfg[1] ~= ARGV[1] or cfg[2] ~= ARGV[2] then return -2 end
for i = 3, #ARGV do
  if redis.call('GETBIT', KEYS[1], ARGV[i]) == 0 then return 0 end
end
return 1
";

// KEYS: from bitmap, from config, to bitmap, to config
const REPLACE_LUA: &str = r"
if redis.call('EXISTS', KEYS[2]) == 0 then return -1 end
if redis.call('EXISTS', KEYS[1]) == 1 then
  redis.call('RENAME', KEYS[1], KEYS[3])
else
  redis.call('DEL', KEYS[3])
end
redis.call('RENAME', KEYS[2], KEYS[4])
return 1
";

// KEYS: lock. ARGV: owner
const UNLOCK_LUA: &str = r"
if redis.call('GET', KEYS[1]) == ARGV[1] then
  return redis.call('DEL', KEYS[1])
end
return 0
";

fn config_key(name: &str) -> String {
    format!("{}:config", name)
}

pub struct RedisFilterBackend {
    connection: ConnectionManager,
    init: Script,
    add: Script,
    contains: Script,
    replace: Script,
    unlock: Script,
}

impl RedisFilterBackend {
    /// Reuse an existing connection (e.g. the distributed tier's).
    #[must_use]
    pub fn new(connection: ConnectionManager) -> Self {
        Self {
            connection,
            init: Script::new(INIT_LUA),
            add: Script::new(ADD_LUA),
            contains: Script::new(CONTAINS_LUA),
            replace: Script::new(REPLACE_LUA),
            unlock: Script::new(UNLOCK_LUA),
        }
    }

    /// Open a dedicated connection, retrying with backoff during startup.
    pub async fn connect(connection_string: &str) -> Result<Self, FilterError> {
        let client = Client::open(connection_string)?;
        let connection = retry("redis_filter_connect", &RetryConfig::startup(), || async {
            ConnectionManager::new(client.clone()).await
        })
        .await?;
        Ok(Self::new(connection))
    }

    fn check_status(name: &str, status: i64) -> Result<i64, FilterError> {
        match status {
            MISSING => Err(FilterError::NotFound(name.to_string())),
            MISMATCH => Err(FilterError::ConfigMismatch { name: name.to_string() }),
            n => Ok(n),
        }
    }

    fn parse_params(fields: &HashMap<String, String>) -> Option<BloomParams> {
        Some(BloomParams {
            size_bits: fields.get("size")?.parse().ok()?,
            hashes: fields.get("hashes")?.parse().ok()?,
            expected: fields.get("expected")?.parse().ok()?,
            fpp: fields.get("fpp")?.parse().ok()?,
        })
    }

    async fn run_offsets(
        &self,
        script: &Script,
        name: &str,
        params: &BloomParams,
        offsets: Vec<u64>,
    ) -> Result<i64, FilterError> {
        let mut invocation = script.prepare_invoke();
        invocation
            .key(name)
            .key(config_key(name))
            .arg(params.size_bits)
            .arg(params.hashes);
        for offset in offsets {
            invocation.arg(offset);
        }
        let mut conn = self.connection.clone();
        let status: i64 = invocation.invoke_async(&mut conn).await?;
        Self::check_status(name, status)
    }
}

#[async_trait]
impl FilterBackend for RedisFilterBackend {
    async fn try_init(&self, name: &str, params: &BloomParams) -> Result<bool, FilterError> {
        let mut conn = self.connection.clone();
        let created: i64 = self
            .init
            .key(name)
            .key(config_key(name))
            .arg(params.size_bits)
            .arg(params.hashes)
            .arg(params.expected)
            .arg(params.fpp)
            .invoke_async(&mut conn)
            .await?;
        debug!(filter = %name, created = created == 1, "Redis filter init");
        Ok(created == 1)
    }

    async fn params(&self, name: &str) -> Result<Option<BloomParams>, FilterError> {
        let mut conn = self.connection.clone();
        let fields: HashMap<String, String> = conn.hgetall(config_key(name)).await?;
        if fields.is_empty() {
            return Ok(None);
        }
        Self::parse_params(&fields)
            .map(Some)
            .ok_or_else(|| FilterError::Backend(format!("corrupt filter config for '{}'", name)))
    }

    async fn add(&self, name: &str, params: &BloomParams, element: &str) -> Result<bool, FilterError> {
        let added = self
            .run_offsets(&self.add, name, params, params.positions(element))
            .await?;
        Ok(added > 0)
    }

    async fn add_batch(
        &self,
        name: &str,
        params: &BloomParams,
        elements: &[String],
    ) -> Result<u64, FilterError> {
        if elements.is_empty() {
            return Ok(0);
        }
        let offsets = elements.iter().flat_map(|e| params.positions(e)).collect();
        let added = self.run_offsets(&self.add, name, params, offsets).await?;
        Ok(added as u64)
    }

    async fn contains(&self, name: &str, params: &BloomParams, element: &str) -> Result<bool, FilterError> {
        let found = self
            .run_offsets(&self.contains, name, params, params.positions(element))
            .await?;
        Ok(found == 1)
    }

    async fn bits_set(&self, name: &str) -> Result<u64, FilterError> {
        let mut conn = self.connection.clone();
        let bits: u64 = redis::cmd("BITCOUNT").arg(name).query_async(&mut conn).await?;
        Ok(bits)
    }

    async fn delete(&self, name: &str) -> Result<(), FilterError> {
        let mut conn = self.connection.clone();
        let _: () = conn.del(vec![name.to_string(), config_key(name)]).await?;
        Ok(())
    }

    async fn replace(&self, from: &str, to: &str) -> Result<(), FilterError> {
        let mut conn = self.connection.clone();
        let status: i64 = self
            .replace
            .key(from)
            .key(config_key(from))
            .key(to)
            .key(config_key(to))
            .invoke_async(&mut conn)
            .await?;
        Self::check_status(from, status).map(|_| ())
    }

    async fn try_lock(&self, lock: &str, owner: &str, ttl: Duration) -> Result<bool, FilterError> {
        let mut conn = self.connection.clone();
        let acquired: Option<String> = redis::cmd("SET")
            .arg(lock)
            .arg(owner)
            .arg("NX")
            .arg("PX")
            .arg(ttl.as_millis().max(1) as u64)
            .query_async(&mut conn)
            .await?;
        Ok(acquired.is_some())
    }

    async fn unlock(&self, lock: &str, owner: &str) -> Result<(), FilterError> {
        let mut conn = self.connection.clone();
        let released: i64 = self.unlock.key(lock).arg(owner).invoke_async(&mut conn).await?;
        debug!(lock = %lock, released = released == 1, "Redis filter lock release");
        Ok(())
    }

    async fn ping(&self) -> Result<(), FilterError> {
        let mut conn = self.connection.clone();
        let _: String = redis::cmd("PING").query_async(&mut conn).await?;
        Ok(())
    }
}
