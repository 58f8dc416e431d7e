//! `Dragonfly` (Redis-compatible) [`StateStore`] backend.
//!
//! # Key Patterns
//!
//! | Pattern | Type | Description |
//! |---------|------|-------------|
//! | `blob:{key}` | Hash | `payload` bytes and integer `version` |
//! | `counter:{id}` | Integer | Atomic counter |
//! | `ledger:{id}` | Hash | member -> accumulated total |
//! | `marker:{key}` | String | Write-once marker payload |
//! | `lease:{role}` | String (PX) | Owner id, expires with the lease |
//!
//! Version bumps, compare-and-set writes, owner-checked lease updates and
//! the two cross-key operations (hit plus credit, marker plus credits) run
//! as Lua scripts so they are atomic on the server.

use std::collections::{BTreeMap, HashMap};
use std::time::Duration;

use async_trait::async_trait;
use fred::prelude::*;
use fred::types::{SetOptions, Value};
use worldsync_types::{LeaseHolder, OwnerId, VersionedBlob};

use crate::error::DbError;
use crate::store::{CounterHit, LedgerCredit, StateStore};

const SAVE_SCRIPT: &str = r"
local v = redis.call('HINCRBY', KEYS[1], 'version', 1)
redis.call('HSET', KEYS[1], 'payload', ARGV[1])
return v
";

const SAVE_IF_VERSION_SCRIPT: &str = r"
local current = tonumber(redis.call('HGET', KEYS[1], 'version') or '0')
if current ~= tonumber(ARGV[1]) then
  return -1
end
local v = redis.call('HINCRBY', KEYS[1], 'version', 1)
redis.call('HSET', KEYS[1], 'payload', ARGV[2])
return v
";

const RECORD_HIT_SCRIPT: &str = r"
local after = redis.call('DECRBY', KEYS[1], ARGV[2])
local before = after + tonumber(ARGV[2])
if before > 0 then
  redis.call('HINCRBY', KEYS[2], ARGV[1], ARGV[2])
end
return {before, after}
";

/// `KEYS[1]` is the marker and `KEYS[i]` the ledger of credit `i - 1`.
/// `ARGV[1]` is the payload, followed by member and delta per credit.
const MARKER_WITH_CREDITS_SCRIPT: &str = r"
if not redis.call('SET', KEYS[1], ARGV[1], 'NX') then
  return 0
end
for i = 2, #KEYS do
  redis.call('HINCRBY', KEYS[i], ARGV[i * 2 - 2], ARGV[i * 2 - 1])
end
return 1
";

const ACQUIRE_LEASE_SCRIPT: &str = r"
local holder = redis.call('GET', KEYS[1])
if holder and holder ~= ARGV[1] then
  return 0
end
redis.call('SET', KEYS[1], ARGV[1], 'PX', ARGV[2])
return 1
";

const RENEW_LEASE_SCRIPT: &str = r"
if redis.call('GET', KEYS[1]) == ARGV[1] then
  redis.call('PEXPIRE', KEYS[1], ARGV[2])
  return 1
end
return 0
";

const RELEASE_LEASE_SCRIPT: &str = r"
if redis.call('GET', KEYS[1]) == ARGV[1] then
  redis.call('DEL', KEYS[1])
  return 1
end
return 0
";

/// [`StateStore`] over a `Dragonfly` instance.
#[derive(Clone)]
pub struct DragonflyStore {
    client: Client,
}

impl DragonflyStore {
    /// Connect to `url` (`redis://host:port[/db]`).
    ///
    /// # Errors
    ///
    /// Returns [`DbError::Config`] for a malformed URL, or
    /// [`DbError::Dragonfly`] if the connection fails.
    pub async fn connect(url: &str) -> Result<Self, DbError> {
        let config = Config::from_url(url)
            .map_err(|e| DbError::Config(format!("Invalid Dragonfly URL: {e}")))?;

        let client = Builder::from_config(config).build()?;
        client.init().await?;

        tracing::info!("Dragonfly store connected");
        Ok(Self { client })
    }

    fn ttl_ms(ttl: Duration) -> Result<i64, DbError> {
        i64::try_from(ttl.as_millis())
            .map_err(|e| DbError::Config(format!("lease ttl {ttl:?} is too large: {e}")))
    }

    fn bytes(payload: &[u8]) -> Value {
        Value::Bytes(payload.to_vec().into())
    }
}

fn blob_key(key: &str) -> String {
    format!("blob:{key}")
}

fn counter_key(id: &str) -> String {
    format!("counter:{id}")
}

fn ledger_key(id: &str) -> String {
    format!("ledger:{id}")
}

fn marker_key(key: &str) -> String {
    format!("marker:{key}")
}

fn lease_key(role: &str) -> String {
    format!("lease:{role}")
}

#[async_trait]
impl StateStore for DragonflyStore {
    async fn get_version(&self, key: &str) -> Result<i64, DbError> {
        let version: Option<i64> = self.client.hget(blob_key(key), "version").await?;
        Ok(version.unwrap_or(0))
    }

    async fn load(&self, key: &str) -> Result<Option<VersionedBlob>, DbError> {
        let fields: Vec<Value> = self
            .client
            .hmget(blob_key(key), vec!["payload", "version"])
            .await?;
        let payload = fields.first().and_then(Value::as_bytes);
        let version = fields.get(1).and_then(Value::as_i64);
        match (payload, version) {
            (Some(payload), Some(version)) => Ok(Some(VersionedBlob {
                key: key.to_owned(),
                payload: payload.to_vec(),
                version,
            })),
            (None, None) => Ok(None),
            _ => Err(DbError::Corrupt {
                key: blob_key(key),
                reason: "hash is missing payload or version".to_owned(),
            }),
        }
    }

    async fn save(&self, key: &str, payload: &[u8]) -> Result<i64, DbError> {
        let version: i64 = self
            .client
            .eval(SAVE_SCRIPT, vec![blob_key(key)], vec![Self::bytes(payload)])
            .await?;
        Ok(version)
    }

    async fn save_if_version(
        &self,
        key: &str,
        expected_version: i64,
        payload: &[u8],
    ) -> Result<Option<i64>, DbError> {
        let version: i64 = self
            .client
            .eval(
                SAVE_IF_VERSION_SCRIPT,
                vec![blob_key(key)],
                vec![Value::Integer(expected_version), Self::bytes(payload)],
            )
            .await?;
        Ok((version >= 0).then_some(version))
    }

    async fn atomic_add(&self, counter_id: &str, delta: i64) -> Result<i64, DbError> {
        let value: i64 = self.client.incr_by(counter_key(counter_id), delta).await?;
        Ok(value)
    }

    async fn read_counter(&self, counter_id: &str) -> Result<Option<i64>, DbError> {
        let value: Option<i64> = self.client.get(counter_key(counter_id)).await?;
        Ok(value)
    }

    async fn ledger_add(
        &self,
        ledger_id: &str,
        member: &str,
        delta: i64,
    ) -> Result<i64, DbError> {
        let total: i64 = self
            .client
            .hincrby(ledger_key(ledger_id), member, delta)
            .await?;
        Ok(total)
    }

    async fn ledger_totals(&self, ledger_id: &str) -> Result<BTreeMap<String, i64>, DbError> {
        let totals: HashMap<String, i64> = self.client.hgetall(ledger_key(ledger_id)).await?;
        Ok(totals.into_iter().collect())
    }

    async fn put_if_absent(&self, key: &str, payload: &[u8]) -> Result<bool, DbError> {
        let reply: Value = self
            .client
            .set(
                marker_key(key),
                Self::bytes(payload),
                None,
                Some(SetOptions::NX),
                false,
            )
            .await?;
        Ok(!reply.is_null())
    }

    async fn record_hit(
        &self,
        counter_id: &str,
        ledger_id: &str,
        member: &str,
        amount: i64,
    ) -> Result<CounterHit, DbError> {
        let reply: Vec<i64> = self
            .client
            .eval(
                RECORD_HIT_SCRIPT,
                vec![counter_key(counter_id), ledger_key(ledger_id)],
                vec![Value::from(member), Value::Integer(amount)],
            )
            .await?;
        match reply.as_slice() {
            [before, after] => Ok(CounterHit {
                before: *before,
                after: *after,
            }),
            _ => Err(DbError::Corrupt {
                key: counter_key(counter_id),
                reason: format!("hit script returned {} values", reply.len()),
            }),
        }
    }

    async fn put_if_absent_with_credits(
        &self,
        key: &str,
        payload: &[u8],
        credits: &[LedgerCredit],
    ) -> Result<bool, DbError> {
        let mut keys = Vec::with_capacity(credits.len().saturating_add(1));
        let mut args = Vec::with_capacity(credits.len().saturating_mul(2).saturating_add(1));
        keys.push(marker_key(key));
        args.push(Self::bytes(payload));
        for c in credits {
            keys.push(ledger_key(&c.ledger_id));
            args.push(Value::from(c.member.as_str()));
            args.push(Value::Integer(c.delta));
        }
        let written: i64 = self
            .client
            .eval(MARKER_WITH_CREDITS_SCRIPT, keys, args)
            .await?;
        Ok(written == 1)
    }

    async fn load_marker(&self, key: &str) -> Result<Option<Vec<u8>>, DbError> {
        let value: Value = self.client.get(marker_key(key)).await?;
        Ok(value.as_bytes().map(<[u8]>::to_vec))
    }

    async fn acquire_lease(
        &self,
        role: &str,
        owner: &OwnerId,
        ttl: Duration,
    ) -> Result<bool, DbError> {
        let acquired: i64 = self
            .client
            .eval(
                ACQUIRE_LEASE_SCRIPT,
                vec![lease_key(role)],
                vec![owner.as_str().to_owned(), Self::ttl_ms(ttl)?.to_string()],
            )
            .await?;
        Ok(acquired == 1)
    }

    async fn renew_lease(
        &self,
        role: &str,
        owner: &OwnerId,
        ttl: Duration,
    ) -> Result<bool, DbError> {
        let renewed: i64 = self
            .client
            .eval(
                RENEW_LEASE_SCRIPT,
                vec![lease_key(role)],
                vec![owner.as_str().to_owned(), Self::ttl_ms(ttl)?.to_string()],
            )
            .await?;
        Ok(renewed == 1)
    }

    async fn release_lease(&self, role: &str, owner: &OwnerId) -> Result<bool, DbError> {
        let released: i64 = self
            .client
            .eval(
                RELEASE_LEASE_SCRIPT,
                vec![lease_key(role)],
                vec![owner.as_str().to_owned()],
            )
            .await?;
        Ok(released == 1)
    }

    async fn lease_holder(&self, role: &str) -> Result<Option<LeaseHolder>, DbError> {
        let key = lease_key(role);
        let owner: Option<String> = self.client.get(key.as_str()).await?;
        let Some(owner) = owner else {
            return Ok(None);
        };
        let remaining_ms: i64 = self.client.pttl(key.as_str()).await?;
        // -2: key vanished between the two reads.
        if remaining_ms == -2 {
            return Ok(None);
        }
        let expires_in = Duration::from_millis(u64::try_from(remaining_ms).unwrap_or(0));
        Ok(Some(LeaseHolder {
            owner_id: OwnerId::new(owner),
            expires_in,
        }))
    }
}
