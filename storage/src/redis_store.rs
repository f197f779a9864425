//! Redis-backed [`crate::Storage`]. Atomic groups are issued either as a
//! single `MULTI`/`EXEC` pipeline or, where a read-modify-write needs to be
//! race-free against other pool processes, a Lua script (`EVAL`), matching
//! the compare-and-delete requirement on the payout lock (spec §4.2).

use async_trait::async_trait;
use redis::aio::ConnectionManager;
use redis::{AsyncCommands, FromRedisValue};
use tos_pool_core::{Address, Block, BlockStatus, Miner, MinerError, Payment, Share};
use tracing::{debug, info};

use crate::{keys, Storage, StorageError};

/// Shared prelude for every miner-mutation script below: load the miner
/// blob or fall back to a freshly-created one (mirrors `load_miner`'s
/// fallback), leaving the decoded table in the Lua local `miner`. `ARGV[1]`
/// is always the JSON-encoded default record for this address.
const MINER_SCRIPT_PRELUDE: &str = r#"
    local miner
    local raw = redis.call("GET", KEYS[1])
    if raw then
        miner = cjson.decode(raw)
    else
        miner = cjson.decode(ARGV[1])
    end
"#;

impl From<redis::RedisError> for StorageError {
    fn from(e: redis::RedisError) -> Self {
        StorageError::Backend(e.to_string())
    }
}

pub struct RedisStorage {
    conn: ConnectionManager,
    /// TTL applied to each address's hashrate zset (spec §4.2).
    hashrate_window_secs: u64,
}

impl RedisStorage {
    pub async fn connect(url: &str, hashrate_window_secs: u64) -> Result<Self, StorageError> {
        let client = redis::Client::open(url).map_err(StorageError::from)?;
        let conn = client.get_connection_manager().await.map_err(StorageError::from)?;
        info!(url, "connected to redis");
        Ok(RedisStorage { conn, hashrate_window_secs })
    }

    async fn load_miner(&self, address: &Address) -> Result<Miner, StorageError> {
        let mut conn = self.conn.clone();
        let raw: Option<String> = conn.get(keys::miner(address.as_str())).await?;
        match raw {
            Some(json) => Ok(serde_json::from_str(&json)?),
            None => Ok(Miner::new(address.clone())),
        }
    }

    /// Runs a Lua script built from [`MINER_SCRIPT_PRELUDE`] plus `body`
    /// against `address`'s miner key, so the read-modify-write is atomic
    /// server-side and can't race another process's concurrent mutation of
    /// the same miner (spec §4.2). `body` is Lua source operating on the
    /// local `miner` table; `extra_argv` is appended starting at `ARGV[2]`.
    async fn run_miner_script<T: FromRedisValue>(
        &self,
        address: &Address,
        body: &str,
        extra_argv: &[String],
    ) -> Result<T, StorageError> {
        let source = format!("{MINER_SCRIPT_PRELUDE}\n{body}");
        let default_json = serde_json::to_string(&Miner::new(address.clone()))?;
        let script = redis::Script::new(&source);
        let mut invocation = script.key(keys::miner(address.as_str())).arg(default_json);
        for a in extra_argv {
            invocation = invocation.arg(a);
        }
        let mut conn = self.conn.clone();
        Ok(invocation.invoke_async(&mut conn).await?)
    }

    async fn load_block(&self, hash: &str) -> Result<Option<Block>, StorageError> {
        let mut conn = self.conn.clone();
        let raw: Option<String> = conn.get(keys::block(hash)).await?;
        Ok(raw.map(|j| serde_json::from_str(&j)).transpose()?)
    }

    async fn save_block(&self, block: &Block) -> Result<(), StorageError> {
        let mut conn = self.conn.clone();
        let json = serde_json::to_string(block)?;
        let _: () = conn.set(keys::block(&block.hash), json).await?;
        Ok(())
    }

    async fn list_set(&self, set_key: &str) -> Result<Vec<Block>, StorageError> {
        let mut conn = self.conn.clone();
        let hashes: Vec<String> = conn.zrange(set_key, 0, -1).await?;
        let mut out = Vec::with_capacity(hashes.len());
        for h in hashes {
            if let Some(b) = self.load_block(&h).await? {
                out.push(b);
            }
        }
        Ok(out)
    }
}

#[async_trait]
impl Storage for RedisStorage {
    async fn write_share(&self, share: &Share) -> Result<(), StorageError> {
        let address = share.address.as_str();
        let member = format!(
            "{}:{}:{}:{}",
            share.difficulty, address, share.worker, share.nonce
        );

        let mut conn = self.conn.clone();
        let mut pipe = redis::pipe();
        pipe.atomic()
            .zadd(keys::hashrate_set(address), &member, share.timestamp)
            .ignore()
            .expire(keys::hashrate_set(address), self.hashrate_window_secs as i64)
            .ignore();
        let _: () = pipe.query_async(&mut conn).await?;

        const SET_LAST_SHARE_AT: &str = r#"
            miner.last_share_at = tonumber(ARGV[2])
            redis.call("SET", KEYS[1], cjson.encode(miner))
            return redis.status_reply("OK")
        "#;
        let _: () = self
            .run_miner_script(&share.address, SET_LAST_SHARE_AT, &[share.timestamp.to_string()])
            .await?;
        self.record_worker_last_seen(&share.address, &share.worker, share.timestamp)
            .await?;

        let round_key = format!("{}:{address}", keys::round_shares());
        let _: f64 = conn.incr_by_float(round_key, share.difficulty).await?;
        debug!(address, difficulty = share.difficulty, "share recorded");
        Ok(())
    }

    async fn write_block(
        &self,
        height: u64,
        hash: &str,
        finder_address: &Address,
        finder_worker: &str,
        declared_reward: u64,
        now: u64,
    ) -> Result<Block, StorageError> {
        let mut conn = self.conn.clone();
        let pattern = format!("{}:*", keys::round_shares());
        let round_keys: Vec<String> = conn.keys(&pattern).await?;

        let mut round_shares = std::collections::HashMap::new();
        let mut total = 0.0;
        for key in &round_keys {
            let value: f64 = conn.get(key).await?;
            if let Some(addr_str) = key.rsplit(':').next() {
                if let Ok(addr) = Address::parse(addr_str) {
                    round_shares.insert(addr, value);
                    total += value;
                }
            }
        }
        if !round_keys.is_empty() {
            let _: () = conn.del(round_keys).await?;
        }

        let block = Block {
            height,
            hash: hash.to_string(),
            finder_address: finder_address.clone(),
            finder_worker: finder_worker.to_string(),
            declared_reward,
            round_shares,
            round_shares_total: total,
            status: BlockStatus::Candidate,
            confirmations: 0,
            discovered_at: now,
            immature_credited: false,
        };
        self.save_block(&block).await?;

        let mut pipe = redis::pipe();
        pipe.atomic()
            .zadd(keys::candidates(), hash, height)
            .ignore()
            .incr(keys::blocks_found_total(), 1)
            .ignore();
        let _: () = pipe.query_async(&mut conn).await?;

        const INCR_BLOCKS_FOUND: &str = r#"
            miner.blocks_found = (tonumber(miner.blocks_found) or 0) + 1
            redis.call("SET", KEYS[1], cjson.encode(miner))
            return redis.status_reply("OK")
        "#;
        let _: () = self.run_miner_script(finder_address, INCR_BLOCKS_FOUND, &[]).await?;

        Ok(block)
    }

    async fn get_block(&self, hash: &str) -> Result<Option<Block>, StorageError> {
        self.load_block(hash).await
    }

    async fn list_candidates(&self) -> Result<Vec<Block>, StorageError> {
        self.list_set(keys::candidates()).await
    }

    async fn list_immature(&self) -> Result<Vec<Block>, StorageError> {
        self.list_set(keys::immature()).await
    }

    async fn move_block_to_immature(
        &self,
        hash: &str,
        reward_splits: &[(Address, u64)],
    ) -> Result<(), StorageError> {
        let mut block = match self.load_block(hash).await? {
            Some(b) => b,
            None => return Err(StorageError::NotFound(hash.to_string())),
        };
        if block.status != BlockStatus::Candidate {
            return Ok(());
        }
        block.status = BlockStatus::Immature;
        block.immature_credited = true;
        self.save_block(&block).await?;

        const CREDIT_IMMATURE: &str = r#"
            miner.immature = (tonumber(miner.immature) or 0) + tonumber(ARGV[2])
            redis.call("SET", KEYS[1], cjson.encode(miner))
            return redis.status_reply("OK")
        "#;
        for (addr, amount) in reward_splits {
            let _: () = self.run_miner_script(addr, CREDIT_IMMATURE, &[amount.to_string()]).await?;
        }

        let mut conn = self.conn.clone();
        let mut pipe = redis::pipe();
        pipe.atomic()
            .zrem(keys::candidates(), hash)
            .ignore()
            .zadd(keys::immature(), hash, block.height)
            .ignore();
        let _: () = pipe.query_async(&mut conn).await?;
        Ok(())
    }

    async fn move_block_to_matured(
        &self,
        hash: &str,
        reward_splits: &[(Address, u64)],
    ) -> Result<(), StorageError> {
        let mut block = match self.load_block(hash).await? {
            Some(b) => b,
            None => return Err(StorageError::NotFound(hash.to_string())),
        };
        if block.status != BlockStatus::Immature {
            return Ok(());
        }
        block.status = BlockStatus::Matured;
        self.save_block(&block).await?;

        const MATURE: &str = r#"
            local amount = tonumber(ARGV[2])
            local immature = (tonumber(miner.immature) or 0) - amount
            if immature < 0 then immature = 0 end
            miner.immature = immature
            miner.balance = (tonumber(miner.balance) or 0) + amount
            redis.call("SET", KEYS[1], cjson.encode(miner))
            return redis.status_reply("OK")
        "#;
        for (addr, amount) in reward_splits {
            let _: () = self.run_miner_script(addr, MATURE, &[amount.to_string()]).await?;
        }

        let mut conn = self.conn.clone();
        let mut pipe = redis::pipe();
        pipe.atomic()
            .zrem(keys::immature(), hash)
            .ignore()
            .zadd(keys::matured(), hash, block.height)
            .ignore();
        let _: () = pipe.query_async(&mut conn).await?;
        Ok(())
    }

    async fn move_block_to_orphan(
        &self,
        hash: &str,
        reward_splits: &[(Address, u64)],
    ) -> Result<(), StorageError> {
        let mut block = match self.load_block(hash).await? {
            Some(b) => b,
            None => return Err(StorageError::NotFound(hash.to_string())),
        };
        let was_credited = block.immature_credited;
        let prior_status = block.status;
        block.status = BlockStatus::Orphan;
        self.save_block(&block).await?;

        const REVERSE_IMMATURE: &str = r#"
            local amount = tonumber(ARGV[2])
            local immature = (tonumber(miner.immature) or 0) - amount
            if immature < 0 then immature = 0 end
            miner.immature = immature
            redis.call("SET", KEYS[1], cjson.encode(miner))
            return redis.status_reply("OK")
        "#;
        if was_credited {
            for (addr, amount) in reward_splits {
                let _: () = self.run_miner_script(addr, REVERSE_IMMATURE, &[amount.to_string()]).await?;
            }
        }

        let mut conn = self.conn.clone();
        let source_set = match prior_status {
            BlockStatus::Immature => keys::immature(),
            _ => keys::candidates(),
        };
        let mut pipe = redis::pipe();
        pipe.atomic()
            .zrem(source_set, hash)
            .ignore()
            .zadd(keys::orphans(), hash, block.height)
            .ignore();
        let _: () = pipe.query_async(&mut conn).await?;
        Ok(())
    }

    async fn get_miner(&self, address: &Address) -> Result<Miner, StorageError> {
        self.load_miner(address).await
    }

    async fn miners_above_threshold(&self, threshold: u64) -> Result<Vec<Miner>, StorageError> {
        let mut conn = self.conn.clone();
        let pattern = "pool:miner:*";
        let miner_keys: Vec<String> = conn.keys(pattern).await?;
        let mut out = Vec::new();
        for key in miner_keys {
            let raw: Option<String> = conn.get(&key).await?;
            if let Some(json) = raw {
                let miner: Miner = serde_json::from_str(&json)?;
                if miner.balance >= threshold {
                    out.push(miner);
                }
            }
        }
        Ok(out)
    }

    async fn record_worker_last_seen(&self, address: &Address, worker: &str, now: u64) -> Result<(), StorageError> {
        let mut conn = self.conn.clone();
        let _: () = conn.set(keys::worker_last_seen(address.as_str(), worker), now).await?;
        Ok(())
    }

    async fn reserve_payout(&self, payment: &Payment) -> Result<(), StorageError> {
        const RESERVE: &str = r#"
            local amount = tonumber(ARGV[2])
            local balance = tonumber(miner.balance) or 0
            if balance < amount then
                return {0, balance}
            end
            miner.balance = balance - amount
            miner.pending = (tonumber(miner.pending) or 0) + amount
            redis.call("SET", KEYS[1], cjson.encode(miner))
            return {1, miner.balance}
        "#;
        let (ok, have): (i64, i64) = self
            .run_miner_script(&payment.address, RESERVE, &[payment.amount.to_string()])
            .await?;
        if ok == 0 {
            return Err(StorageError::Backend(
                MinerError::InsufficientBalance { have: have as u64, need: payment.amount }.to_string(),
            ));
        }

        let mut conn = self.conn.clone();
        let json = serde_json::to_string(payment)?;
        let mut pipe = redis::pipe();
        pipe.atomic()
            .set(keys::payment(&payment.id), &json)
            .ignore()
            .sadd(keys::pending_payments(), &payment.id)
            .ignore();
        let _: () = pipe.query_async(&mut conn).await?;
        Ok(())
    }

    async fn confirm_payout(&self, payment_id: &str, tx_hash: &str) -> Result<(), StorageError> {
        let mut conn = self.conn.clone();
        let raw: Option<String> = conn.get(keys::payment(payment_id)).await?;
        let mut payment: Payment = match raw {
            Some(j) => serde_json::from_str(&j)?,
            None => return Err(StorageError::NotFound(payment_id.to_string())),
        };
        payment.mark_confirmed(tx_hash.to_string());

        const CONFIRM: &str = r#"
            local amount = tonumber(ARGV[2])
            local pending = (tonumber(miner.pending) or 0) - amount
            if pending < 0 then pending = 0 end
            miner.pending = pending
            miner.total_paid = (tonumber(miner.total_paid) or 0) + amount
            redis.call("SET", KEYS[1], cjson.encode(miner))
            return redis.status_reply("OK")
        "#;
        let _: () = self
            .run_miner_script(&payment.address, CONFIRM, &[payment.amount.to_string()])
            .await?;

        let json = serde_json::to_string(&payment)?;
        let mut pipe = redis::pipe();
        pipe.atomic()
            .set(keys::payment(payment_id), &json)
            .ignore()
            .srem(keys::pending_payments(), payment_id)
            .ignore();
        let _: () = pipe.query_async(&mut conn).await?;
        self.record_payment_history(&payment).await?;
        Ok(())
    }

    async fn fail_payout(&self, payment_id: &str) -> Result<(), StorageError> {
        let mut conn = self.conn.clone();
        let raw: Option<String> = conn.get(keys::payment(payment_id)).await?;
        let payment: Payment = match raw {
            Some(j) => serde_json::from_str(&j)?,
            None => return Err(StorageError::NotFound(payment_id.to_string())),
        };

        const RELEASE: &str = r#"
            local amount = tonumber(ARGV[2])
            local pending = (tonumber(miner.pending) or 0) - amount
            if pending < 0 then pending = 0 end
            miner.pending = pending
            miner.balance = (tonumber(miner.balance) or 0) + amount
            redis.call("SET", KEYS[1], cjson.encode(miner))
            return redis.status_reply("OK")
        "#;
        let _: () = self
            .run_miner_script(&payment.address, RELEASE, &[payment.amount.to_string()])
            .await?;

        let mut pipe = redis::pipe();
        pipe.atomic()
            .del(keys::payment(payment_id))
            .ignore()
            .srem(keys::pending_payments(), payment_id)
            .ignore();
        let _: () = pipe.query_async(&mut conn).await?;
        Ok(())
    }

    async fn list_pending_payments(&self) -> Result<Vec<Payment>, StorageError> {
        let mut conn = self.conn.clone();
        let ids: Vec<String> = conn.smembers(keys::pending_payments()).await?;
        let mut out = Vec::with_capacity(ids.len());
        for id in ids {
            let raw: Option<String> = conn.get(keys::payment(&id)).await?;
            if let Some(json) = raw {
                out.push(serde_json::from_str(&json)?);
            }
        }
        Ok(out)
    }

    async fn record_payment_history(&self, payment: &Payment) -> Result<(), StorageError> {
        let mut conn = self.conn.clone();
        let json = serde_json::to_string(payment)?;
        let _: () = conn.lpush(keys::payment_history(), json).await?;
        Ok(())
    }

    async fn list_payment_history(&self, limit: usize) -> Result<Vec<Payment>, StorageError> {
        let mut conn = self.conn.clone();
        let raw: Vec<String> = conn
            .lrange(keys::payment_history(), 0, limit.saturating_sub(1) as isize)
            .await?;
        raw.iter().map(|j| serde_json::from_str(j).map_err(StorageError::from)).collect()
    }

    async fn acquire_payout_lock(&self, lock_id: &str, ttl_secs: u64) -> Result<bool, StorageError> {
        let mut conn = self.conn.clone();
        let acquired: bool = redis::cmd("SET")
            .arg(keys::payout_lock())
            .arg(lock_id)
            .arg("NX")
            .arg("EX")
            .arg(ttl_secs)
            .query_async::<_, Option<String>>(&mut conn)
            .await?
            .is_some();
        Ok(acquired)
    }

    async fn release_payout_lock(&self, lock_id: &str) -> Result<(), StorageError> {
        const UNLOCK_SCRIPT: &str = r#"
            if redis.call("get", KEYS[1]) == ARGV[1] then
                return redis.call("del", KEYS[1])
            else
                return 0
            end
        "#;
        let mut conn = self.conn.clone();
        let deleted: i64 = redis::Script::new(UNLOCK_SCRIPT)
            .key(keys::payout_lock())
            .arg(lock_id)
            .invoke_async(&mut conn)
            .await?;
        if deleted == 0 {
            return Err(StorageError::LockNotHeld);
        }
        Ok(())
    }

    async fn hashrate(&self, address: &Address, window_secs: u64, now: u64) -> Result<f64, StorageError> {
        let mut conn = self.conn.clone();
        let cutoff = now.saturating_sub(window_secs);
        let members: Vec<String> = conn
            .zrangebyscore(keys::hashrate_set(address.as_str()), cutoff, now)
            .await?;
        let sum: f64 = members
            .iter()
            .filter_map(|m| m.split(':').next())
            .filter_map(|d| d.parse::<f64>().ok())
            .sum();
        Ok(sum / window_secs as f64)
    }

    async fn purge_hashrate(&self, older_than_secs: u64, now: u64) -> Result<u64, StorageError> {
        let mut conn = self.conn.clone();
        let pattern = "pool:hashrate:*";
        let set_keys: Vec<String> = conn.keys(pattern).await?;
        let cutoff = now.saturating_sub(older_than_secs);
        let mut purged = 0u64;
        for key in set_keys {
            let removed: u64 = conn.zrembyscore(&key, 0, cutoff as isize).await?;
            purged += removed;
        }
        Ok(purged)
    }

    async fn is_blacklisted(&self, address: &Address) -> Result<bool, StorageError> {
        let mut conn = self.conn.clone();
        Ok(conn.sismember(keys::blacklist(), address.as_str()).await?)
    }

    async fn blacklist(&self, address: &Address) -> Result<(), StorageError> {
        let mut conn = self.conn.clone();
        let _: () = conn.sadd(keys::blacklist(), address.as_str()).await?;
        Ok(())
    }

    async fn unblacklist(&self, address: &Address) -> Result<(), StorageError> {
        let mut conn = self.conn.clone();
        let _: () = conn.srem(keys::blacklist(), address.as_str()).await?;
        Ok(())
    }

    async fn is_whitelisted(&self, address: &Address) -> Result<bool, StorageError> {
        let mut conn = self.conn.clone();
        Ok(conn.sismember(keys::whitelist(), address.as_str()).await?)
    }

    async fn whitelist(&self, address: &Address) -> Result<(), StorageError> {
        let mut conn = self.conn.clone();
        let _: () = conn.sadd(keys::whitelist(), address.as_str()).await?;
        Ok(())
    }

    async fn unwhitelist(&self, address: &Address) -> Result<(), StorageError> {
        let mut conn = self.conn.clone();
        let _: () = conn.srem(keys::whitelist(), address.as_str()).await?;
        Ok(())
    }
}
