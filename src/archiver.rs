//! The archival loop.
//!
//! [`ArchKeeper`] continuously drains queued query ids from the key-value
//! store, fetches their payloads and persists them into the archive table.
//! The table is partitioned and grows by millions of rows, so the loop also
//! deduplicates in flight (via the Bloom-filter [`Deduplicator`]); it is not
//! expected to catch 100% of duplicates — the cleanup job re-checks old
//! records — but recent duplicates must be suppressed to keep the database
//! reasonably sized.
//!
//! For every processed entry the keeper fans out:
//!
//! - history-typed entries (payload attached) to the history indexer stream,
//! - archived records annotated with corpus and corpus size to the stats
//!   stream.
//!
//! Each tick's work runs in its own task; an atomic busy guard prevents
//! re-entrancy when a tick outlasts the interval.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use anyhow::{Context, Result};
use chrono::Local;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;

use crate::archstore::ConcArchiveStore;
use crate::config::{ArchiverConfig, RedisConfig};
use crate::dedup::Deduplicator;
use crate::kvstore::{QueueRecord, RedisAdapter};
use crate::models::{CorpusBoundRecord, HistoryRecord, QueryArchRec};
use crate::reporting::{OpStats, Reporting};

/// Key-value key caching the per-year archive size histogram.
const YEAR_STATS_CACHE_KEY: &str = "camus_years_stats";

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct CountPerYear {
    pub year: i32,
    pub count: i64,
}

/// Cached archive size histogram.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct YearsStats {
    pub years: Vec<CountPerYear>,
    pub last_update: Option<chrono::NaiveDateTime>,
}

pub struct ArchKeeper {
    redis: Arc<RedisAdapter>,
    db: Arc<dyn ConcArchiveStore>,
    dedup: Arc<Deduplicator>,
    reporting: Arc<dyn Reporting>,
    conf: ArchiverConfig,
    queue_key: String,
    failed_queue_key: String,
    stats: Mutex<OpStats>,
    busy: AtomicBool,
    history_tx: Mutex<Option<mpsc::Sender<HistoryRecord>>>,
    stats_tx: Mutex<Option<mpsc::Sender<CorpusBoundRecord>>>,
    corp_sizes: Mutex<HashMap<String, i64>>,
}

impl ArchKeeper {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        redis: Arc<RedisAdapter>,
        db: Arc<dyn ConcArchiveStore>,
        dedup: Arc<Deduplicator>,
        history_tx: mpsc::Sender<HistoryRecord>,
        stats_tx: mpsc::Sender<CorpusBoundRecord>,
        reporting: Arc<dyn Reporting>,
        conf: &ArchiverConfig,
        redis_conf: &RedisConfig,
    ) -> Self {
        Self {
            redis,
            db,
            dedup,
            reporting,
            conf: conf.clone(),
            queue_key: redis_conf.queue_key.clone(),
            failed_queue_key: redis_conf.failed_queue_key.clone(),
            stats: Mutex::new(OpStats::default()),
            busy: AtomicBool::new(false),
            history_tx: Mutex::new(Some(history_tx)),
            stats_tx: Mutex::new(Some(stats_tx)),
            corp_sizes: Mutex::new(HashMap::new()),
        }
    }

    /// Starts the periodic archival loop.
    pub fn start(self: &Arc<Self>, mut shutdown: watch::Receiver<bool>) -> JoinHandle<()> {
        let keeper = self.clone();
        tokio::spawn(async move {
            let period = keeper.conf.check_interval();
            let mut ticker = tokio::time::interval_at(tokio::time::Instant::now() + period, period);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            loop {
                tokio::select! {
                    _ = shutdown.changed() => {
                        tracing::info!("about to close ArchKeeper");
                        return;
                    }
                    _ = ticker.tick() => {
                        if keeper.busy.swap(true, Ordering::AcqRel) {
                            tracing::warn!("previous archiver check still running, skipping tick");
                            continue;
                        }
                        let keeper = keeper.clone();
                        tokio::spawn(async move {
                            if let Err(err) = keeper.perform_check().await {
                                tracing::error!(error = %err, "archiver check failed");
                            }
                            keeper.busy.store(false, Ordering::Release);
                        });
                    }
                }
            }
        })
    }

    /// Stops the keeper: closes both fan-out streams and flushes the
    /// deduplicator state to disk.
    pub fn stop(&self) -> Result<()> {
        tracing::warn!("stopping ArchKeeper");
        self.history_tx.lock().take();
        self.stats_tx.lock().take();
        self.dedup
            .store_to_disk()
            .context("failed to stop ArchKeeper properly")?;
        Ok(())
    }

    /// Running totals across all ticks.
    pub fn get_stats(&self) -> OpStats {
        *self.stats.lock()
    }

    pub async fn load_records_by_id(&self, conc_id: &str) -> Result<Vec<QueryArchRec>> {
        self.db.load_records_by_id(conc_id).await
    }

    /// Clears deduplicator state and re-seeds it per configuration.
    pub async fn reset(&self) -> Result<()> {
        self.dedup.reset().await
    }

    /// Persists current deduplicator state without stopping.
    pub fn store_to_disk(&self) -> Result<()> {
        self.dedup.store_to_disk()
    }

    async fn perform_check(&self) -> Result<()> {
        let raw_items = self
            .redis
            .next_queue_chunk(&self.queue_key, self.conf.check_interval_chunk)
            .await
            .context("failed to fetch next queued chunk")?;
        tracing::debug!(items_to_process = raw_items.len(), "doing regular check");
        let mut curr_stats = OpStats::default();
        for raw in &raw_items {
            curr_stats.num_fetched += 1;
            let item = match QueueRecord::decode(raw) {
                Ok(item) => item,
                Err(err) => {
                    tracing::error!(error = %err, entry = %raw, "failed to decode queue entry");
                    if let Err(err) = self.redis.add_error_raw(&self.failed_queue_key, raw).await {
                        tracing::error!(error = %err, "failed to insert error key");
                    }
                    curr_stats.num_errors += 1;
                    continue;
                }
            };
            if !item.is_archive() && !item.is_history() {
                tracing::warn!(
                    entry_type = %item.entry_type,
                    record_id = %item.key,
                    "ignoring queue entry of unknown type"
                );
                continue;
            }
            let mut rec = match self.redis.get_conc_record(item.key_code()).await {
                Ok(rec) => rec,
                Err(err) => {
                    tracing::error!(
                        error = %err,
                        record_id = %item.key,
                        "failed to get record from Redis, skipping"
                    );
                    if let Err(err) = self
                        .redis
                        .add_error(&self.failed_queue_key, &item, None)
                        .await
                    {
                        tracing::error!(error = %err, "failed to insert error key");
                    }
                    curr_stats.num_errors += 1;
                    continue;
                }
            };
            rec.created = Local::now().naive_local();

            if item.is_history() {
                let mut hrec = item.as_history_record();
                hrec.rec = Some(rec);
                let tx = self.history_tx.lock().clone();
                if let Some(tx) = tx {
                    if tx.send(hrec).await.is_err() {
                        tracing::warn!("history stream consumer is gone");
                    }
                }
                continue;
            }

            if item.explicit {
                self.handle_explicit_req(&rec, &item, &mut curr_stats).await;
            } else {
                self.handle_implicit_req(&rec, &item, &mut curr_stats).await;
            }
            self.emit_corpus_stats(&rec).await;
        }
        tracing::info!(
            num_inserted = curr_stats.num_inserted,
            num_merged = curr_stats.num_merged,
            num_errors = curr_stats.num_errors,
            num_fetched = curr_stats.num_fetched,
            "regular archiving report"
        );
        self.reporting.write_operations_status(curr_stats).await;
        self.stats.lock().update_by(curr_stats);
        Ok(())
    }

    /// Implicit requests are background best-effort dedup-and-store.
    async fn handle_implicit_req(
        &self,
        rec: &QueryArchRec,
        item: &QueueRecord,
        curr_stats: &mut OpStats,
    ) {
        match self.dedup.test_and_solve(rec).await {
            Err(err) => {
                tracing::error!(
                    error = %err,
                    record_id = %item.key,
                    "failed to insert record, skipping"
                );
                if let Err(err) = self
                    .redis
                    .add_error(&self.failed_queue_key, item, Some(rec))
                    .await
                {
                    tracing::error!(error = %err, "failed to insert error key");
                }
                curr_stats.num_errors += 1;
            }
            Ok(Some(_merged)) => {
                tracing::warn!(record_id = %item.key, "record already archived, data merged");
                curr_stats.num_merged += 1;
            }
            Ok(None) => {
                if let Err(err) = self.db.insert_record(rec).await {
                    tracing::error!(
                        error = %err,
                        record_id = %item.key,
                        "failed to insert record, skipping"
                    );
                    if let Err(err) = self
                        .redis
                        .add_error(&self.failed_queue_key, item, Some(rec))
                        .await
                    {
                        tracing::error!(error = %err, "failed to insert error key");
                    }
                    curr_stats.num_errors += 1;
                    return;
                }
                self.dedup.add(&rec.id);
                curr_stats.num_inserted += 1;
            }
        }
    }

    /// Explicit requests are authoritative user intent to pin; no merging.
    async fn handle_explicit_req(
        &self,
        rec: &QueryArchRec,
        item: &QueueRecord,
        curr_stats: &mut OpStats,
    ) {
        let exists = match self.db.contains_record(&rec.id).await {
            Ok(exists) => exists,
            Err(err) => {
                curr_stats.num_errors += 1;
                tracing::error!(
                    error = %err,
                    record_id = %item.key,
                    "failed to test record existence, skipping"
                );
                if let Err(err) = self
                    .redis
                    .add_error(&self.failed_queue_key, item, Some(rec))
                    .await
                {
                    tracing::error!(error = %err, "failed to insert error key");
                }
                return;
            }
        };
        if !exists {
            match self.db.insert_record(rec).await {
                Ok(()) => {
                    curr_stats.num_inserted += 1;
                }
                Err(err) => {
                    curr_stats.num_errors += 1;
                    tracing::error!(
                        error = %err,
                        record_id = %item.key,
                        "failed to insert record, skipping"
                    );
                    if let Err(err) = self
                        .redis
                        .add_error(&self.failed_queue_key, item, Some(rec))
                        .await
                    {
                        tracing::error!(error = %err, "failed to insert error key");
                    }
                }
            }
            // marked as seen even after a failed insert; a replay from the
            // failure queue must take the full dedup path
            self.dedup.add(&rec.id);
        }
    }

    /// Annotates a freshly archived record with its primary corpus and the
    /// corpus size, and pushes it to the stats stream.
    async fn emit_corpus_stats(&self, rec: &QueryArchRec) {
        let data = match rec.fetch_data() {
            Ok(data) => data,
            Err(err) => {
                tracing::warn!(error = %err, record_id = %rec.id, "cannot attribute record to a corpus");
                return;
            }
        };
        let corpora = data.corpora();
        let Some(corpname) = corpora.first() else {
            return;
        };
        let corpus_size = match self.corpus_size(corpname).await {
            Ok(size) => size,
            Err(err) => {
                tracing::warn!(error = %err, corpname = %corpname, "failed to determine corpus size");
                0
            }
        };
        let tx = self.stats_tx.lock().clone();
        if let Some(tx) = tx {
            let msg = CorpusBoundRecord {
                rec: rec.clone(),
                corpname: corpname.clone(),
                corpus_size,
            };
            if tx.send(msg).await.is_err() {
                tracing::warn!("stats stream consumer is gone");
            }
        }
    }

    /// Corpus sizes change rarely and the corpus set is bounded, so the
    /// cache never evicts.
    async fn corpus_size(&self, corpname: &str) -> Result<i64> {
        if let Some(size) = self.corp_sizes.lock().get(corpname) {
            return Ok(*size);
        }
        let size = self.db.get_corpus_size(corpname).await?;
        self.corp_sizes.lock().insert(corpname.to_owned(), size);
        Ok(size)
    }

    /// Cached per-year archive sizes. Without `force_reload`, the unbounded
    /// aggregation query only runs at night; outside that window the cached
    /// value (possibly empty) is served.
    pub async fn years_stats(&self, force_reload: bool) -> Result<YearsStats> {
        let cached = if force_reload {
            String::new()
        } else {
            self.redis
                .get(YEAR_STATS_CACHE_KEY)
                .await
                .context("failed to get cached years stats")?
        };
        if !cached.is_empty() {
            return serde_json::from_str(&cached).context("failed to unmarshal years stats from cache");
        }
        let data = match self.db.get_arch_sizes_by_years(force_reload).await {
            Ok(data) => data,
            Err(err) if matches!(
                err.downcast_ref::<crate::error::ArchiveError>(),
                Some(crate::error::ArchiveError::TooDemandingQuery)
            ) =>
            {
                return Ok(YearsStats::default());
            }
            Err(err) => return Err(err.context("failed to load years stats from db")),
        };
        let ans = YearsStats {
            years: data
                .into_iter()
                .map(|(year, count)| CountPerYear { year, count })
                .collect(),
            last_update: Some(Local::now().naive_local()),
        };
        let json_data =
            serde_json::to_string(&ans).context("failed to marshal recent years stats data")?;
        self.redis
            .set(YEAR_STATS_CACHE_KEY, &json_data)
            .await
            .context("failed to store recent years stats to cache")?;
        Ok(ans)
    }
}
