use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;

use kcvlock::locking::codec::{self, LOCK_COL_END, LOCK_COL_START, LOCK_VALUE};
use kcvlock::locking::{CooldownCache, LockCleanerService};
use kcvlock::storage::{
    Consistency, Entry, InMemoryStore, InMemoryStoreManager, InMemoryTransaction, KeySliceQuery,
};
use kcvlock::{
    Column, ConsistentKeyLocker, Key, KeyColumnValueStore, LockConfig, LockCoordinate,
    ManualTimestamps, OwnerId, Resolution, StoreError, StoreManager, StoreTransaction, Timestamp,
    TransactionConfig,
};

pub const LOCK_WAIT: Duration = Duration::from_millis(10);
pub const LOCK_EXPIRE: Duration = Duration::from_millis(1_000);

/// Scripted response for the next store call. Calls past the end of a script
/// behave like `Ok`.
#[allow(dead_code)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Step {
    Ok,
    /// Completes the call, then advances the clock by this many ticks.
    Delay(u64),
    Temporary,
    Permanent,
}

#[allow(dead_code)]
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Mutation {
    pub key: Key,
    pub additions: Vec<Entry>,
    pub deletions: Vec<Column>,
    pub commit_time: Option<Timestamp>,
    pub consistency: Consistency,
}

/// In-memory store that plays back scripted failures and records every mutation.
#[derive(Debug)]
pub struct ScriptedStore {
    inner: Arc<InMemoryStore>,
    clock: Arc<ManualTimestamps>,
    mutate_script: Mutex<VecDeque<Step>>,
    slice_script: Mutex<VecDeque<Step>>,
    mutations: Mutex<Vec<Mutation>>,
    slices: AtomicUsize,
}

#[allow(dead_code)]
impl ScriptedStore {
    pub fn new(inner: Arc<InMemoryStore>, clock: Arc<ManualTimestamps>) -> Self {
        Self {
            inner,
            clock,
            mutate_script: Mutex::new(VecDeque::new()),
            slice_script: Mutex::new(VecDeque::new()),
            mutations: Mutex::new(Vec::new()),
            slices: AtomicUsize::new(0),
        }
    }

    pub fn standalone(name: &str, clock: Arc<ManualTimestamps>) -> Arc<Self> {
        Arc::new(Self::new(Arc::new(InMemoryStore::new(name)), clock))
    }

    pub fn script_mutations(&self, steps: impl IntoIterator<Item = Step>) {
        self.mutate_script.lock().unwrap().extend(steps);
    }

    pub fn script_slices(&self, steps: impl IntoIterator<Item = Step>) {
        self.slice_script.lock().unwrap().extend(steps);
    }

    pub fn mutations(&self) -> Vec<Mutation> {
        self.mutations.lock().unwrap().clone()
    }

    pub fn mutation_count(&self) -> usize {
        self.mutations.lock().unwrap().len()
    }

    pub fn slice_count(&self) -> usize {
        self.slices.load(Ordering::SeqCst)
    }

    /// Writes straight into the backing store, bypassing scripts and records.
    pub async fn seed(&self, key: &[u8], column: Vec<u8>, value: Vec<u8>, at: Timestamp) {
        let txn = InMemoryTransaction::new(TransactionConfig::default().with_commit_time(at));
        self.inner
            .mutate(key, vec![Entry::new(column, value)], Vec::new(), &txn)
            .await
            .unwrap();
    }

    /// Writes a claim on `coordinate` as if `owner` had written it at `at`.
    pub async fn seed_claim(&self, coordinate: &LockCoordinate, at: Timestamp, owner: &str) {
        let key = codec::lock_key(coordinate).unwrap();
        let column = codec::lock_column(at, &OwnerId::new(owner));
        self.seed(&key, column, LOCK_VALUE.to_vec(), at).await;
    }

    /// Decoded claims currently stored on `coordinate`, in store order.
    pub async fn claims(&self, coordinate: &LockCoordinate) -> Vec<(Timestamp, String)> {
        let key = codec::lock_key(coordinate).unwrap();
        let query = KeySliceQuery::new(key, LOCK_COL_START, LOCK_COL_END);
        let txn = InMemoryTransaction::new(TransactionConfig::default());
        self.inner
            .get_slice(&query, &txn)
            .await
            .unwrap()
            .into_iter()
            .map(|entry| {
                let claim = codec::decode_lock_column(&entry.column).unwrap();
                (claim.timestamp, String::from_utf8(claim.rid).unwrap())
            })
            .collect()
    }

    pub async fn value(&self, key: &[u8], column: &[u8]) -> Option<Vec<u8>> {
        let mut end = column.to_vec();
        end.push(0);
        let query = KeySliceQuery::new(key.to_vec(), column.to_vec(), end);
        let txn = InMemoryTransaction::new(TransactionConfig::default());
        self.inner
            .get_slice(&query, &txn)
            .await
            .unwrap()
            .into_iter()
            .next()
            .map(|entry| entry.value)
    }

    fn next_step(script: &Mutex<VecDeque<Step>>) -> Step {
        script.lock().unwrap().pop_front().unwrap_or(Step::Ok)
    }
}

#[async_trait]
impl KeyColumnValueStore for ScriptedStore {
    fn name(&self) -> &str {
        self.inner.name()
    }

    async fn get_slice(
        &self,
        query: &KeySliceQuery,
        txn: &dyn StoreTransaction,
    ) -> Result<Vec<Entry>, StoreError> {
        self.slices.fetch_add(1, Ordering::SeqCst);
        match Self::next_step(&self.slice_script) {
            Step::Temporary => Err(StoreError::temporary("scripted slice timeout")),
            Step::Permanent => Err(StoreError::permanent("scripted slice failure")),
            Step::Ok => self.inner.get_slice(query, txn).await,
            Step::Delay(ticks) => {
                let entries = self.inner.get_slice(query, txn).await;
                self.clock.advance(ticks);
                entries
            }
        }
    }

    async fn mutate(
        &self,
        key: &[u8],
        additions: Vec<Entry>,
        deletions: Vec<Column>,
        txn: &dyn StoreTransaction,
    ) -> Result<(), StoreError> {
        self.mutations.lock().unwrap().push(Mutation {
            key: key.to_vec(),
            additions: additions.clone(),
            deletions: deletions.clone(),
            commit_time: txn.config().commit_time,
            consistency: txn.config().consistency,
        });
        match Self::next_step(&self.mutate_script) {
            Step::Temporary => Err(StoreError::temporary("scripted write timeout")),
            Step::Permanent => Err(StoreError::permanent("scripted write failure")),
            Step::Ok => self.inner.mutate(key, additions, deletions, txn).await,
            Step::Delay(ticks) => {
                let result = self.inner.mutate(key, additions, deletions, txn).await;
                self.clock.advance(ticks);
                result
            }
        }
    }
}

/// Store manager handing out [`ScriptedStore`]s over one shared in-memory backend.
#[allow(dead_code)]
#[derive(Debug)]
pub struct ScriptedManager {
    inner: InMemoryStoreManager,
    clock: Arc<ManualTimestamps>,
    stores: Mutex<HashMap<String, Arc<ScriptedStore>>>,
}

#[allow(dead_code)]
impl ScriptedManager {
    pub fn new(clock: Arc<ManualTimestamps>) -> Arc<Self> {
        Arc::new(Self {
            inner: InMemoryStoreManager::new(),
            clock,
            stores: Mutex::new(HashMap::new()),
        })
    }

    pub async fn scripted(&self, name: &str) -> Arc<ScriptedStore> {
        let backing = self.inner.store(name).await;
        let mut stores = self.stores.lock().unwrap();
        stores
            .entry(name.to_owned())
            .or_insert_with(|| Arc::new(ScriptedStore::new(backing, self.clock.clone())))
            .clone()
    }
}

#[async_trait]
impl StoreManager for ScriptedManager {
    async fn open_store(&self, name: &str) -> Result<Arc<dyn KeyColumnValueStore>, StoreError> {
        let store: Arc<dyn KeyColumnValueStore> = self.scripted(name).await;
        Ok(store)
    }

    async fn begin_transaction(
        &self,
        config: TransactionConfig,
    ) -> Result<Box<dyn StoreTransaction>, StoreError> {
        self.inner.begin_transaction(config).await
    }
}

/// Cleaner that only records requests, deduplicated by a real cooldown cache.
#[allow(dead_code)]
#[derive(Debug)]
pub struct RecordingCleaner {
    cooldown: CooldownCache,
    calls: AtomicUsize,
    admitted: Mutex<Vec<(LockCoordinate, Timestamp)>>,
}

#[allow(dead_code)]
impl RecordingCleaner {
    pub fn new(clock: Arc<ManualTimestamps>, cooldown: Duration) -> Arc<Self> {
        Arc::new(Self {
            cooldown: CooldownCache::new(cooldown, clock),
            calls: AtomicUsize::new(0),
            admitted: Mutex::new(Vec::new()),
        })
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    pub fn admitted(&self) -> Vec<(LockCoordinate, Timestamp)> {
        self.admitted.lock().unwrap().clone()
    }
}

impl LockCleanerService for RecordingCleaner {
    fn clean(&self, coordinate: &LockCoordinate, cutoff: Timestamp, _txn: &dyn StoreTransaction) {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if self.cooldown.try_insert(coordinate) {
            self.admitted
                .lock()
                .unwrap()
                .push((coordinate.clone(), cutoff));
        }
    }
}

#[allow(dead_code)]
pub fn clock(start: Timestamp) -> Arc<ManualTimestamps> {
    Arc::new(ManualTimestamps::new(start, Resolution::Milli))
}

#[allow(dead_code)]
pub fn coordinate() -> LockCoordinate {
    LockCoordinate::new(b"row".to_vec(), b"col".to_vec())
}

#[allow(dead_code)]
pub fn lock_config(owner: &str) -> LockConfig {
    LockConfig::new(owner)
        .with_lock_wait(LOCK_WAIT)
        .with_lock_expire(LOCK_EXPIRE)
        .with_retry_count(3)
        .with_resolution(Resolution::Milli)
}

/// Locker for `owner` over `store`, with millisecond ticks and no cleaner.
#[allow(dead_code)]
pub fn locker(
    store: Arc<ScriptedStore>,
    manager: Arc<dyn StoreManager>,
    clock: Arc<ManualTimestamps>,
    owner: &str,
) -> ConsistentKeyLocker {
    ConsistentKeyLocker::builder(store, manager)
        .owner(OwnerId::new(owner))
        .times(clock)
        .lock_wait(LOCK_WAIT)
        .lock_expire(LOCK_EXPIRE)
        .lock_retry_count(3)
        .build()
}

#[allow(dead_code)]
pub async fn begin(manager: &Arc<dyn StoreManager>) -> Box<dyn StoreTransaction> {
    manager
        .begin_transaction(TransactionConfig::default())
        .await
        .unwrap()
}
