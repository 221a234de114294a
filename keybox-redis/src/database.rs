//! Store implementation over one multiplexed Redis connection.

use std::collections::HashSet;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use bytes::Bytes;
use chrono::DateTime;
use keybox_backend::metrics::{self, Timer};
use keybox_backend::{
    BatchWrite, DeleteStatus, FaultKind, ScoredMember, Store, StoreResult, StoredEntry,
};
use redis::aio::MultiplexedConnection;
use redis::{Cmd, FromRedisValue, Pipeline};
use tracing::{trace, warn};

use crate::connector::with_timeout;
use crate::error::Error;

const SCAN_COUNT: usize = 500;

const FIELD_DATA: &str = "d";
const FIELD_SLIDING: &str = "sld";
const FIELD_ABSOLUTE: &str = "abs";

/// Handle to one logical Redis database.
///
/// Cache entries are stored as hashes with the payload in `d`, the sliding
/// window in `sld` (milliseconds) and the absolute expiry in `abs` (epoch
/// milliseconds). The key TTL is always the entry's effective TTL.
#[derive(Clone)]
pub struct RedisDatabase {
    connection: MultiplexedConnection,
    command_timeout: Duration,
    name: String,
}

impl std::fmt::Debug for RedisDatabase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RedisDatabase")
            .field("name", &self.name)
            .field("command_timeout", &self.command_timeout)
            .finish_non_exhaustive()
    }
}

impl RedisDatabase {
    pub(crate) fn new(
        connection: MultiplexedConnection,
        command_timeout: Duration,
        name: String,
    ) -> Self {
        Self {
            connection,
            command_timeout,
            name,
        }
    }

    async fn query<T: FromRedisValue>(&self, command: &'static str, cmd: &Cmd) -> Result<T, Error> {
        let mut con = self.connection.clone();
        let timer = Timer::new();
        let result = with_timeout(command, self.command_timeout, cmd.query_async::<T>(&mut con)).await;
        self.observe(command, &timer, result.as_ref().err());
        result
    }

    async fn query_pipe<T: FromRedisValue>(
        &self,
        command: &'static str,
        pipe: &Pipeline,
    ) -> Result<T, Error> {
        let mut con = self.connection.clone();
        let timer = Timer::new();
        let result =
            with_timeout(command, self.command_timeout, pipe.query_async::<T>(&mut con)).await;
        self.observe(command, &timer, result.as_ref().err());
        result
    }

    fn observe(&self, command: &'static str, timer: &Timer, error: Option<&Error>) {
        metrics::record_command(&self.name, command, timer.elapsed());
        if let Some(error) = error {
            metrics::record_command_error(&self.name, error.fault_kind());
            trace!(store = %self.name, command, %error, "Redis command failed");
        }
    }

    fn push_entry(pipe: &mut Pipeline, key: &str, entry: &StoredEntry, ttl: Option<Duration>) {
        pipe.cmd("DEL").arg(key).ignore();

        let mut hset = redis::cmd("HSET");
        hset.arg(key).arg(FIELD_DATA).arg(entry.payload.as_ref());
        if let Some(sliding) = entry.sliding {
            hset.arg(FIELD_SLIDING).arg(millis(sliding));
        }
        if let Some(absolute) = entry.absolute {
            hset.arg(FIELD_ABSOLUTE).arg(absolute.timestamp_millis());
        }
        pipe.add_command(hset).ignore();

        if let Some(ttl) = ttl {
            pipe.cmd("PEXPIRE").arg(key).arg(millis(ttl).max(1)).ignore();
        }
    }
}

#[async_trait]
impl Store for RedisDatabase {
    async fn ping(&self) -> StoreResult<Duration> {
        let started = Instant::now();
        let _: String = self.query("PING", &redis::cmd("PING")).await?;
        Ok(started.elapsed())
    }

    async fn read(&self, key: &str) -> StoreResult<Option<StoredEntry>> {
        let mut cmd = redis::cmd("HMGET");
        cmd.arg(key)
            .arg(FIELD_DATA)
            .arg(FIELD_SLIDING)
            .arg(FIELD_ABSOLUTE);
        let (data, sliding, absolute): (Option<Vec<u8>>, Option<u64>, Option<i64>) =
            self.query("HMGET", &cmd).await?;

        let Some(data) = data else {
            return Ok(None);
        };
        Ok(Some(
            StoredEntry::new(Bytes::from(data))
                .with_sliding(sliding.map(Duration::from_millis))
                .with_absolute(absolute.and_then(DateTime::from_timestamp_millis)),
        ))
    }

    async fn write(&self, key: &str, entry: StoredEntry, ttl: Option<Duration>) -> StoreResult<()> {
        let mut pipe = redis::pipe();
        pipe.atomic();
        Self::push_entry(&mut pipe, key, &entry, ttl);
        self.query_pipe::<()>("HSET", &pipe).await?;
        Ok(())
    }

    async fn write_batch(&self, writes: Vec<BatchWrite>) -> StoreResult<Vec<bool>> {
        if writes.is_empty() {
            return Ok(Vec::new());
        }
        let mut pipe = redis::pipe();
        for write in &writes {
            Self::push_entry(&mut pipe, &write.key, &write.entry, write.ttl);
        }
        match self.query_pipe::<()>("PIPELINE", &pipe).await {
            Ok(()) => Ok(vec![true; writes.len()]),
            Err(error) if error.fault_kind() == FaultKind::Transient => Err(error.into()),
            Err(error) => {
                // A single bad item poisons the pipeline reply; replay one by one.
                warn!(store = %self.name, %error, "Batch write failed, retrying items individually");
                let mut outcome = Vec::with_capacity(writes.len());
                for write in writes {
                    let written = self.write(&write.key, write.entry, write.ttl).await;
                    outcome.push(written.is_ok());
                }
                Ok(outcome)
            }
        }
    }

    async fn remove(&self, key: &str) -> StoreResult<DeleteStatus> {
        let deleted: u32 = self.query("DEL", redis::cmd("DEL").arg(key)).await?;
        if deleted > 0 {
            Ok(DeleteStatus::Deleted(deleted))
        } else {
            Ok(DeleteStatus::Missing)
        }
    }

    async fn remove_batch(&self, keys: &[String]) -> StoreResult<u64> {
        if keys.is_empty() {
            return Ok(0);
        }
        let mut pipe = redis::pipe();
        for key in keys {
            pipe.cmd("DEL").arg(key);
        }
        let deleted: Vec<u64> = self.query_pipe("PIPELINE", &pipe).await?;
        Ok(deleted.into_iter().sum())
    }

    async fn exists(&self, key: &str) -> StoreResult<bool> {
        let count: u64 = self.query("EXISTS", redis::cmd("EXISTS").arg(key)).await?;
        Ok(count > 0)
    }

    async fn ttl(&self, key: &str) -> StoreResult<Option<Duration>> {
        // PTTL: -2 missing key, -1 no expiry.
        let pttl: i64 = self.query("PTTL", redis::cmd("PTTL").arg(key)).await?;
        Ok(u64::try_from(pttl).ok().map(Duration::from_millis))
    }

    async fn expire(&self, key: &str, ttl: Duration) -> StoreResult<bool> {
        let armed: i64 = self
            .query("PEXPIRE", redis::cmd("PEXPIRE").arg(key).arg(millis(ttl).max(1)))
            .await?;
        Ok(armed == 1)
    }

    async fn scan(&self, pattern: &str) -> StoreResult<Vec<String>> {
        let mut cursor: u64 = 0;
        let mut seen = HashSet::new();
        let mut keys = Vec::new();
        loop {
            let mut cmd = redis::cmd("SCAN");
            cmd.arg(cursor)
                .arg("MATCH")
                .arg(pattern)
                .arg("COUNT")
                .arg(SCAN_COUNT);
            let (next, batch): (u64, Vec<String>) = self.query("SCAN", &cmd).await?;
            // SCAN may return a key more than once.
            for key in batch {
                if seen.insert(key.clone()) {
                    keys.push(key);
                }
            }
            if next == 0 {
                break;
            }
            cursor = next;
        }
        trace!(store = %self.name, pattern, found = keys.len(), "Scan complete");
        Ok(keys)
    }

    async fn set_add(&self, key: &str, member: &str, ttl: Duration) -> StoreResult<()> {
        let mut pipe = redis::pipe();
        pipe.cmd("SADD").arg(key).arg(member).ignore();
        pipe.cmd("PEXPIRE").arg(key).arg(millis(ttl).max(1)).ignore();
        self.query_pipe::<()>("SADD", &pipe).await?;
        Ok(())
    }

    async fn set_members(&self, key: &str) -> StoreResult<Vec<String>> {
        Ok(self.query("SMEMBERS", redis::cmd("SMEMBERS").arg(key)).await?)
    }

    async fn set_remove(&self, key: &str, member: &str) -> StoreResult<bool> {
        let removed: u64 = self
            .query("SREM", redis::cmd("SREM").arg(key).arg(member))
            .await?;
        Ok(removed > 0)
    }

    async fn sorted_add(
        &self,
        key: &str,
        member: &str,
        score: f64,
        ttl: Duration,
    ) -> StoreResult<()> {
        let mut pipe = redis::pipe();
        pipe.cmd("ZADD").arg(key).arg(score).arg(member).ignore();
        pipe.cmd("PEXPIRE").arg(key).arg(millis(ttl).max(1)).ignore();
        self.query_pipe::<()>("ZADD", &pipe).await?;
        Ok(())
    }

    async fn sorted_range(&self, key: &str) -> StoreResult<Vec<ScoredMember>> {
        let mut cmd = redis::cmd("ZRANGE");
        cmd.arg(key).arg(0).arg(-1).arg("WITHSCORES");
        let members: Vec<(String, f64)> = self.query("ZRANGE", &cmd).await?;
        Ok(members
            .into_iter()
            .map(|(member, score)| ScoredMember { member, score })
            .collect())
    }

    async fn sorted_remove_range_by_score(
        &self,
        key: &str,
        min: f64,
        max: f64,
    ) -> StoreResult<u64> {
        let mut cmd = redis::cmd("ZREMRANGEBYSCORE");
        cmd.arg(key).arg(score_bound(min)).arg(score_bound(max));
        Ok(self.query("ZREMRANGEBYSCORE", &cmd).await?)
    }

    async fn publish(&self, channel: &str, message: &[u8]) -> StoreResult<u64> {
        Ok(self
            .query("PUBLISH", redis::cmd("PUBLISH").arg(channel).arg(message))
            .await?)
    }
}

/// Redis rejects expiries whose absolute time overflows a signed 64-bit
/// millisecond clock.
const MAX_EXPIRE_MILLIS: u64 = 1 << 62;

fn millis(duration: Duration) -> u64 {
    u64::try_from(duration.as_millis())
        .unwrap_or(u64::MAX)
        .min(MAX_EXPIRE_MILLIS)
}

fn score_bound(score: f64) -> String {
    if score == f64::NEG_INFINITY {
        "-inf".to_owned()
    } else if score == f64::INFINITY {
        "+inf".to_owned()
    } else {
        score.to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn infinite_bounds_use_redis_syntax() {
        assert_eq!(score_bound(f64::NEG_INFINITY), "-inf");
        assert_eq!(score_bound(f64::INFINITY), "+inf");
        assert_eq!(score_bound(1500.0), "1500");
    }

    #[test]
    fn oversized_durations_saturate() {
        assert_eq!(millis(Duration::from_secs(2)), 2000);
        assert_eq!(millis(Duration::MAX), MAX_EXPIRE_MILLIS);
    }
}
