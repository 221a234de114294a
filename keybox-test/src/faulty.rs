//! Fault-injecting connector.
//!
//! [`FaultyConnector`] forwards to a [`MemoryConnector`] and fails connects
//! or commands on demand. Switches and counters are shared by every clone
//! and every handle the connector hands out, so a test can flip a switch
//! while a service holds cached handles.

use std::sync::Arc;
use std::sync::atomic::{AtomicU8, AtomicU32, AtomicU64, AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use dashmap::DashSet;
use keybox_backend::{
    BatchWrite, Connector, DeleteStatus, ScoredMember, Store, StoreError, StoreResult,
    StoredEntry,
};
use keybox_memory::{MemoryConnector, MemoryServer, MemoryStore, MemorySubscriber};

/// Fault returned by a switched-on injection point.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Fault {
    #[default]
    None,
    Transient,
    Fatal,
}

impl Fault {
    fn from_u8(value: u8) -> Self {
        match value {
            1 => Fault::Transient,
            2 => Fault::Fatal,
            _ => Fault::None,
        }
    }

    fn as_u8(self) -> u8 {
        match self {
            Fault::None => 0,
            Fault::Transient => 1,
            Fault::Fatal => 2,
        }
    }

    fn into_error(self, what: &str) -> Option<StoreError> {
        match self {
            Fault::None => None,
            Fault::Transient => Some(StoreError::transient(format!("injected {what} fault"))),
            Fault::Fatal => Some(StoreError::fatal(format!("injected {what} fault"))),
        }
    }
}

#[derive(Debug, Default)]
pub struct FaultCounters {
    pub connects: AtomicUsize,
    pub commands: AtomicUsize,
    pub failed_commands: AtomicUsize,
}

impl FaultCounters {
    pub fn connects(&self) -> usize {
        self.connects.load(Ordering::SeqCst)
    }

    pub fn commands(&self) -> usize {
        self.commands.load(Ordering::SeqCst)
    }

    pub fn failed_commands(&self) -> usize {
        self.failed_commands.load(Ordering::SeqCst)
    }

    pub fn reset(&self) {
        self.connects.store(0, Ordering::SeqCst);
        self.commands.store(0, Ordering::SeqCst);
        self.failed_commands.store(0, Ordering::SeqCst);
    }
}

#[derive(Debug, Default)]
struct Switches {
    connect: AtomicU8,
    command: AtomicU8,
    transient_budget: AtomicU32,
    connect_delay_ms: AtomicU64,
    rejected_keys: DashSet<String>,
}

impl Switches {
    fn command_fault(&self, counters: &FaultCounters, keys: &[&str]) -> StoreResult<()> {
        counters.commands.fetch_add(1, Ordering::SeqCst);
        let budget = self
            .transient_budget
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1));
        let error = if budget.is_ok() {
            Fault::Transient.into_error("command")
        } else if let Some(key) = keys.iter().find(|key| self.rejected_keys.contains(**key)) {
            Some(StoreError::fatal(format!("injected fault for key {key}")))
        } else {
            Fault::from_u8(self.command.load(Ordering::SeqCst)).into_error("command")
        };
        match error {
            Some(error) => {
                counters.failed_commands.fetch_add(1, Ordering::SeqCst);
                Err(error)
            }
            None => Ok(()),
        }
    }
}

/// Connector whose connects and commands fail on demand.
#[derive(Debug, Clone, Default)]
pub struct FaultyConnector {
    inner: MemoryConnector,
    switches: Arc<Switches>,
    counters: Arc<FaultCounters>,
}

impl FaultyConnector {
    pub fn new(inner: MemoryConnector) -> Self {
        Self {
            inner,
            switches: Arc::default(),
            counters: Arc::default(),
        }
    }

    /// The wrapped connector, for inspecting data behind the faults.
    pub fn inner(&self) -> &MemoryConnector {
        &self.inner
    }

    pub fn counters(&self) -> &FaultCounters {
        &self.counters
    }

    /// Fail every connect with `fault`.
    pub fn fail_connects(&self, fault: Fault) {
        self.switches.connect.store(fault.as_u8(), Ordering::SeqCst);
    }

    /// Fail every command with `fault`.
    pub fn fail_commands(&self, fault: Fault) {
        self.switches.command.store(fault.as_u8(), Ordering::SeqCst);
    }

    /// Fail the next `count` commands with a transient fault.
    pub fn fail_next_commands(&self, count: u32) {
        self.switches.transient_budget.store(count, Ordering::SeqCst);
    }

    /// Delay every connect, to widen races on first use.
    pub fn delay_connects(&self, delay: Duration) {
        let millis = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX);
        self.switches.connect_delay_ms.store(millis, Ordering::SeqCst);
    }

    /// Fail every command touching `key` with a fatal fault. Batches report
    /// the key as not written.
    pub fn reject_key(&self, key: impl Into<String>) {
        self.switches.rejected_keys.insert(key.into());
    }

    /// Turns every switch off.
    pub fn heal(&self) {
        self.fail_connects(Fault::None);
        self.fail_commands(Fault::None);
        self.fail_next_commands(0);
        self.delay_connects(Duration::ZERO);
        self.switches.rejected_keys.clear();
    }
}

#[async_trait]
impl Connector for FaultyConnector {
    type Database = FaultyStore;
    type Server = MemoryServer;
    type Subscriber = MemorySubscriber;

    async fn connect(&self, db: i64) -> StoreResult<Self::Database> {
        self.counters.connects.fetch_add(1, Ordering::SeqCst);
        let delay = self.switches.connect_delay_ms.load(Ordering::SeqCst);
        if delay > 0 {
            tokio::time::sleep(Duration::from_millis(delay)).await;
        }
        let fault = Fault::from_u8(self.switches.connect.load(Ordering::SeqCst));
        if let Some(error) = fault.into_error("connect") {
            return Err(error);
        }
        Ok(FaultyStore {
            inner: self.inner.connect(db).await?,
            switches: Arc::clone(&self.switches),
            counters: Arc::clone(&self.counters),
        })
    }

    async fn server(&self) -> StoreResult<Self::Server> {
        self.inner.server().await
    }

    async fn subscriber(&self) -> StoreResult<Self::Subscriber> {
        self.inner.subscriber().await
    }

    fn name(&self) -> &str {
        "faulty"
    }
}

/// Database handle of a [`FaultyConnector`].
#[derive(Debug, Clone)]
pub struct FaultyStore {
    inner: MemoryStore,
    switches: Arc<Switches>,
    counters: Arc<FaultCounters>,
}

impl FaultyStore {
    fn check(&self, keys: &[&str]) -> StoreResult<()> {
        self.switches.command_fault(&self.counters, keys)
    }
}

#[async_trait]
impl Store for FaultyStore {
    async fn ping(&self) -> StoreResult<Duration> {
        self.check(&[])?;
        self.inner.ping().await
    }

    async fn read(&self, key: &str) -> StoreResult<Option<StoredEntry>> {
        self.check(&[key])?;
        self.inner.read(key).await
    }

    async fn write(&self, key: &str, entry: StoredEntry, ttl: Option<Duration>) -> StoreResult<()> {
        self.check(&[key])?;
        self.inner.write(key, entry, ttl).await
    }

    async fn write_batch(&self, writes: Vec<BatchWrite>) -> StoreResult<Vec<bool>> {
        self.check(&[])?;
        let (accepted, rejected): (Vec<_>, Vec<_>) = writes
            .into_iter()
            .enumerate()
            .partition(|(_, write)| !self.switches.rejected_keys.contains(&write.key));

        let (positions, accepted): (Vec<usize>, Vec<BatchWrite>) = accepted.into_iter().unzip();
        let written = self.inner.write_batch(accepted).await?;
        let mut flags = vec![false; positions.len() + rejected.len()];
        for (position, ok) in positions.into_iter().zip(written) {
            flags[position] = ok;
        }
        Ok(flags)
    }

    async fn remove(&self, key: &str) -> StoreResult<DeleteStatus> {
        self.check(&[key])?;
        self.inner.remove(key).await
    }

    async fn remove_batch(&self, keys: &[String]) -> StoreResult<u64> {
        self.check(&[])?;
        self.inner.remove_batch(keys).await
    }

    async fn exists(&self, key: &str) -> StoreResult<bool> {
        self.check(&[key])?;
        self.inner.exists(key).await
    }

    async fn ttl(&self, key: &str) -> StoreResult<Option<Duration>> {
        self.check(&[key])?;
        self.inner.ttl(key).await
    }

    async fn expire(&self, key: &str, ttl: Duration) -> StoreResult<bool> {
        self.check(&[key])?;
        self.inner.expire(key, ttl).await
    }

    async fn scan(&self, pattern: &str) -> StoreResult<Vec<String>> {
        self.check(&[])?;
        self.inner.scan(pattern).await
    }

    async fn set_add(&self, key: &str, member: &str, ttl: Duration) -> StoreResult<()> {
        self.check(&[key])?;
        self.inner.set_add(key, member, ttl).await
    }

    async fn set_members(&self, key: &str) -> StoreResult<Vec<String>> {
        self.check(&[key])?;
        self.inner.set_members(key).await
    }

    async fn set_remove(&self, key: &str, member: &str) -> StoreResult<bool> {
        self.check(&[key])?;
        self.inner.set_remove(key, member).await
    }

    async fn sorted_add(
        &self,
        key: &str,
        member: &str,
        score: f64,
        ttl: Duration,
    ) -> StoreResult<()> {
        self.check(&[key])?;
        self.inner.sorted_add(key, member, score, ttl).await
    }

    async fn sorted_range(&self, key: &str) -> StoreResult<Vec<ScoredMember>> {
        self.check(&[key])?;
        self.inner.sorted_range(key).await
    }

    async fn sorted_remove_range_by_score(
        &self,
        key: &str,
        min: f64,
        max: f64,
    ) -> StoreResult<u64> {
        self.check(&[key])?;
        self.inner.sorted_remove_range_by_score(key, min, max).await
    }

    async fn publish(&self, channel: &str, message: &[u8]) -> StoreResult<u64> {
        self.check(&[])?;
        self.inner.publish(channel, message).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;

    #[tokio::test]
    async fn transient_budget_is_consumed() {
        let connector = FaultyConnector::default();
        let store = connector.connect(0).await.unwrap();
        connector.fail_next_commands(2);

        assert!(store.exists("k").await.unwrap_err().is_transient());
        assert!(store.exists("k").await.unwrap_err().is_transient());
        assert!(!store.exists("k").await.unwrap());
        assert_eq!(connector.counters().commands(), 3);
        assert_eq!(connector.counters().failed_commands(), 2);
    }

    #[tokio::test]
    async fn rejected_keys_fail_in_batches_only_for_themselves() {
        let connector = FaultyConnector::default();
        let store = connector.connect(0).await.unwrap();
        connector.reject_key("b");

        let writes = ["a", "b", "c"]
            .into_iter()
            .map(|key| BatchWrite {
                key: key.to_string(),
                entry: StoredEntry::new(Bytes::from_static(b"\0v")),
                ttl: None,
            })
            .collect();
        assert_eq!(store.write_batch(writes).await.unwrap(), [true, false, true]);
        assert!(store.read("b").await.is_err());

        connector.heal();
        assert_eq!(store.read("b").await.unwrap(), None);
    }

    #[tokio::test]
    async fn connect_faults_are_returned() {
        let connector = FaultyConnector::default();
        connector.fail_connects(Fault::Fatal);
        let error = connector.connect(0).await.unwrap_err();
        assert!(!error.is_transient());
        assert_eq!(connector.counters().connects(), 1);
    }
}
