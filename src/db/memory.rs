//! In-memory stores for exercising the metrics core without databases.

use std::{
    collections::{BTreeMap, BTreeSet, HashMap, HashSet},
    sync::{
        atomic::{AtomicUsize, Ordering},
        Mutex,
    },
};

use anyhow::anyhow;
use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, Utc};
use serde_json::{Map, Value};

use crate::db::{
    models::{Category, CoinUpdate, DailyMarketCap, RawSnapshot, RunSummary, UpdateTarget},
    store::{CategoryRegistry, ChunkOutcome, CoinRegistry, RunSummaryStore, SnapshotStore},
};

#[derive(Debug, Clone, Default)]
pub(crate) struct CoinDoc {
    pub categories: Vec<String>,
    pub change: Map<String, Value>,
    pub category_ranks: Option<Value>,
}

/// Implements every store trait over plain collections, with hooks to make
/// individual operations fail.
#[derive(Default)]
pub(crate) struct MemoryStore {
    snapshots: Mutex<BTreeMap<(String, DateTime<Utc>), RawSnapshot>>,
    coins: Mutex<BTreeMap<String, CoinDoc>>,
    categories: Mutex<BTreeMap<String, Category>>,
    summaries: Mutex<HashMap<String, RunSummary>>,
    summary_log: Mutex<Vec<RunSummary>>,
    checkpoints: Mutex<HashMap<String, DateTime<Utc>>>,
    failing_coins: Mutex<HashSet<String>>,
    failing_fetch_coins: Mutex<HashSet<String>>,
    failing_chunk_calls: Mutex<HashSet<usize>>,
    apply_calls: AtomicUsize,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_snapshots(snapshots: Vec<RawSnapshot>) -> Self {
        let store = Self::new();
        store.insert_snapshots(&snapshots);
        store
    }

    fn insert_snapshots(&self, snapshots: &[RawSnapshot]) {
        let mut stored = self.snapshots.lock().unwrap();
        for s in snapshots {
            stored.insert((s.coin_id.clone(), s.timestamp), s.clone());
        }
    }

    pub fn add_coin(&self, coin_id: &str, categories: &[&str]) {
        self.coins.lock().unwrap().entry(coin_id.to_string()).or_default().categories =
            categories.iter().map(|c| c.to_string()).collect();
    }

    pub fn coin(&self, coin_id: &str) -> Option<CoinDoc> {
        self.coins.lock().unwrap().get(coin_id).cloned()
    }

    pub fn coin_count(&self) -> usize {
        self.coins.lock().unwrap().len()
    }

    /// Every operation for `coin_id` fails inside an otherwise healthy chunk.
    pub fn fail_coin(&self, coin_id: &str) {
        self.failing_coins.lock().unwrap().insert(coin_id.to_string());
    }

    /// Snapshot queries whose allow-list contains `coin_id` fail.
    pub fn fail_fetch_for(&self, coin_id: &str) {
        self.failing_fetch_coins.lock().unwrap().insert(coin_id.to_string());
    }

    /// The `n`-th call to `apply_updates` (0-based) fails as a whole.
    pub fn fail_chunk_call(&self, n: usize) {
        self.failing_chunk_calls.lock().unwrap().insert(n);
    }

    pub fn apply_calls(&self) -> usize {
        self.apply_calls.load(Ordering::SeqCst)
    }

    /// Every summary written, in order.
    pub fn summary_log(&self) -> Vec<RunSummary> {
        self.summary_log.lock().unwrap().clone()
    }

    pub fn checkpoint(&self, job_name: &str) -> Option<DateTime<Utc>> {
        self.checkpoints.lock().unwrap().get(job_name).copied()
    }
}

#[async_trait]
impl SnapshotStore for MemoryStore {
    async fn snapshots_since(
        &self,
        since: DateTime<Utc>,
        coin_ids: Option<&[String]>,
    ) -> anyhow::Result<Vec<RawSnapshot>> {
        if let Some(ids) = coin_ids {
            let failing = self.failing_fetch_coins.lock().unwrap();
            if let Some(id) = ids.iter().find(|id| failing.contains(*id)) {
                return Err(anyhow!("simulated timeout fetching {}", id));
            }
        }

        let allowed: Option<HashSet<&String>> = coin_ids.map(|ids| ids.iter().collect());
        Ok(self
            .snapshots
            .lock()
            .unwrap()
            .values()
            .filter(|s| s.timestamp >= since)
            .filter(|s| allowed.as_ref().map_or(true, |a| a.contains(&s.coin_id)))
            .cloned()
            .collect())
    }

    async fn coin_ids_since(&self, since: DateTime<Utc>) -> anyhow::Result<Vec<String>> {
        let ids: BTreeSet<String> = self
            .snapshots
            .lock()
            .unwrap()
            .values()
            .filter(|s| s.timestamp >= since)
            .map(|s| s.coin_id.clone())
            .collect();
        Ok(ids.into_iter().collect())
    }

    async fn snapshot_dates_since(&self, since: DateTime<Utc>) -> anyhow::Result<Vec<NaiveDate>> {
        let dates: BTreeSet<NaiveDate> = self
            .snapshots
            .lock()
            .unwrap()
            .values()
            .filter(|s| s.timestamp >= since)
            .map(|s| s.timestamp.date_naive())
            .collect();
        Ok(dates.into_iter().collect())
    }

    async fn daily_market_caps(&self, dates: &[NaiveDate]) -> anyhow::Result<Vec<DailyMarketCap>> {
        let wanted: HashSet<&NaiveDate> = dates.iter().collect();
        // Keys iterate by (coin, timestamp), so the last insert per day wins
        let mut last: BTreeMap<(NaiveDate, String), Option<f64>> = BTreeMap::new();
        for s in self.snapshots.lock().unwrap().values() {
            let date = s.timestamp.date_naive();
            if wanted.contains(&date) {
                last.insert((date, s.coin_id.clone()), s.market_cap);
            }
        }

        Ok(last
            .into_iter()
            .map(|((date, coin_id), market_cap)| DailyMarketCap {
                coin_id,
                date,
                market_cap,
            })
            .collect())
    }

    async fn upsert_snapshots(&self, snapshots: &[RawSnapshot]) -> anyhow::Result<()> {
        self.insert_snapshots(snapshots);
        Ok(())
    }
}

#[async_trait]
impl CoinRegistry for MemoryStore {
    async fn apply_updates(&self, updates: &[CoinUpdate]) -> anyhow::Result<ChunkOutcome> {
        let call = self.apply_calls.fetch_add(1, Ordering::SeqCst);
        if self.failing_chunk_calls.lock().unwrap().contains(&call) {
            return Err(anyhow!("simulated connection reset on chunk {}", call));
        }

        let failing = self.failing_coins.lock().unwrap().clone();
        let mut coins = self.coins.lock().unwrap();
        let mut outcome = ChunkOutcome::default();

        for update in updates {
            if failing.contains(&update.coin_id) {
                outcome
                    .failed
                    .push((update.coin_id.clone(), "simulated write failure".to_string()));
                continue;
            }

            let doc = coins.entry(update.coin_id.clone()).or_default();
            let changed = match update.target {
                UpdateTarget::StatsChange => {
                    if doc.change != update.fields {
                        doc.change = update.fields.clone();
                        true
                    } else {
                        false
                    }
                },
                UpdateTarget::CategoryRanks => {
                    let ranks = update.fields_json();
                    if doc.category_ranks.as_ref() != Some(&ranks) {
                        doc.category_ranks = Some(ranks);
                        true
                    } else {
                        false
                    }
                },
            };

            if changed {
                outcome.modified += 1;
            }
        }

        Ok(outcome)
    }
}

#[async_trait]
impl CategoryRegistry for MemoryStore {
    async fn rebuild_categories(&self) -> anyhow::Result<usize> {
        let mut members: BTreeMap<String, Vec<String>> = BTreeMap::new();
        for (coin_id, doc) in self.coins.lock().unwrap().iter() {
            for category in doc.categories.iter().filter(|c| !c.is_empty()) {
                members.entry(category.clone()).or_default().push(coin_id.clone());
            }
        }

        let mut categories = self.categories.lock().unwrap();
        let written = members.len();
        for (name, coins) in members {
            let mut category = Category::new(name.clone(), coins);
            category.updated_at = Some(Utc::now());
            categories.insert(name, category);
        }
        Ok(written)
    }

    async fn list_categories(&self) -> anyhow::Result<Vec<Category>> {
        Ok(self.categories.lock().unwrap().values().cloned().collect())
    }
}

#[async_trait]
impl RunSummaryStore for MemoryStore {
    async fn upsert_run_summary(&self, summary: &RunSummary) -> anyhow::Result<()> {
        self.summaries
            .lock()
            .unwrap()
            .insert(summary.metric_type.clone(), summary.clone());
        self.summary_log.lock().unwrap().push(summary.clone());
        Ok(())
    }

    async fn get_run_summary(&self, metric_type: &str) -> anyhow::Result<Option<RunSummary>> {
        Ok(self.summaries.lock().unwrap().get(metric_type).cloned())
    }

    async fn set_cron_checkpoint(&self, job_name: &str, last_run_at: DateTime<Utc>) -> anyhow::Result<()> {
        self.checkpoints
            .lock()
            .unwrap()
            .insert(job_name.to_string(), last_run_at);
        Ok(())
    }
}
