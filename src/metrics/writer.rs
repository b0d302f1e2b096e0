//! Chunked, unordered writes of computed changes to the coin registry.

use log::{debug, error, warn};
use rustc_hash::FxHashMap;

use crate::{
    db::{
        models::{CoinUpdate, UpdateTarget},
        store::CoinRegistry,
    },
    metrics::calculator::ChangeRecord,
};

/// One `stats.change` upsert per coin, carrying every period computed for it
/// this run. Coins come out in order of their first record.
pub fn change_updates(records: &[ChangeRecord]) -> Vec<CoinUpdate> {
    let mut position: FxHashMap<&str, usize> = FxHashMap::default();
    let mut updates: Vec<CoinUpdate> = Vec::new();

    for record in records {
        let idx = *position.entry(record.coin_id.as_str()).or_insert_with(|| {
            updates.push(CoinUpdate::new(&record.coin_id, UpdateTarget::StatsChange));
            updates.len() - 1
        });

        let fields = &mut updates[idx].fields;
        fields.insert(record.performance_field(), record.price_change_pct.into());
        if let Some(rank) = record.rank_change {
            fields.insert(record.rank_field(), rank.into());
        }
    }

    updates
}

/// Totals of one [`BatchedWriter::write`] call.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct WriteReport {
    pub attempted: usize,
    pub round_trips: usize,
    /// Documents the registry confirmed as created or changed
    pub modified: u64,
    pub failed_ops: usize,
    pub failed_chunks: usize,
}

pub struct BatchedWriter<'a> {
    registry: &'a dyn CoinRegistry,
    chunk_size: usize,
}

impl<'a> BatchedWriter<'a> {
    pub fn new(registry: &'a dyn CoinRegistry, chunk_size: usize) -> Self {
        Self {
            registry,
            chunk_size: chunk_size.max(1),
        }
    }

    /// Apply `updates` in chunks of `chunk_size`, one round trip each.
    ///
    /// A chunk that fails as a whole is logged and skipped; the modified count
    /// only includes chunks the registry answered.
    pub async fn write(&self, updates: &[CoinUpdate]) -> WriteReport {
        let mut report = WriteReport {
            attempted: updates.len(),
            ..Default::default()
        };

        for (idx, chunk) in updates.chunks(self.chunk_size).enumerate() {
            report.round_trips += 1;

            match self.registry.apply_updates(chunk).await {
                Ok(outcome) => {
                    if let Some((coin_id, reason)) = outcome.failed.first() {
                        warn!(
                            "Write chunk {} had {} failed operations (first: {}: {})",
                            idx,
                            outcome.failed.len(),
                            coin_id,
                            reason
                        );
                    }
                    report.modified += outcome.modified;
                    report.failed_ops += outcome.failed.len();
                },
                Err(e) => {
                    error!(
                        "Write chunk {} ({} operations) failed: {:#}",
                        idx,
                        chunk.len(),
                        e
                    );
                    report.failed_chunks += 1;
                },
            }
        }

        debug!(
            "Wrote {} updates in {} round trips ({} modified)",
            report.attempted, report.round_trips, report.modified
        );
        report
    }
}
