//! Per-user history retention.
//!
//! Users keep at most `query_history_num_preserve` unnamed history entries;
//! named (user-saved) entries are retained indefinitely. Enforcement runs in
//! two phases to spread load:
//!
//! 1. **Mark** — periodically flag the oldest unnamed entries beyond the
//!    per-user cap (`pending_deletion_from = NOW()`). Marking is one ranked
//!    UPDATE over the whole table.
//! 2. **Delete** — more frequently, remove a bounded batch of the
//!    oldest-marked entries from both the relational table and the fulltext
//!    index, inside one transaction. If the fulltext delete fails the
//!    relational delete is rolled back, preserving index/table parity.
//!
//! An ad-hoc chunked mode (CLI `gc-query-history`) processes users off a
//! sorted-set cursor in the key-value store, so repeated invocations work
//! through the whole user base incrementally.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use tokio::sync::watch;
use tokio::task::JoinHandle;

use crate::histstore::QueryHistoryStore;
use crate::indexer::Indexer;
use crate::kvstore::RedisAdapter;
use crate::reporting::{QueryHistoryDelStats, Reporting};

/// Sorted set holding user ids still awaiting ad-hoc garbage collection.
const GC_USERS_PROC_SET_KEY: &str = "camus_users_qh_gc";

/// Back-off before re-arming the delete timer after a failed delete phase.
const TIME_WAIT_AFTER_DEL_ERRORS: Duration = Duration::from_secs(5 * 60);

pub struct GarbageCollector {
    db: Arc<dyn QueryHistoryStore>,
    rdb: Arc<RedisAdapter>,
    indexer: Arc<Indexer>,
    status_writer: Arc<dyn Reporting>,
    check_interval: Duration,
    mark_interval: Duration,
    num_preserve: usize,
    max_num_delete: usize,
}

impl GarbageCollector {
    pub fn new(
        db: Arc<dyn QueryHistoryStore>,
        rdb: Arc<RedisAdapter>,
        indexer: Arc<Indexer>,
        status_writer: Arc<dyn Reporting>,
        conf: &crate::config::IndexerConfig,
    ) -> Self {
        Self {
            db,
            rdb,
            indexer,
            status_writer,
            check_interval: conf.cleanup_interval(),
            mark_interval: conf.mark_pending_interval(),
            num_preserve: conf.query_history_num_preserve,
            max_num_delete: conf.query_history_max_num_delete_at_once,
        }
    }

    pub fn start(self: &Arc<Self>, mut shutdown: watch::Receiver<bool>) -> JoinHandle<()> {
        tracing::info!(
            rm_check_interval = ?self.check_interval,
            mark_interval = ?self.mark_interval,
            "starting history garbage collector task"
        );
        let gc = self.clone();
        tokio::spawn(async move {
            let mut mark_ticker = tokio::time::interval_at(
                tokio::time::Instant::now() + gc.mark_interval,
                gc.mark_interval,
            );
            mark_ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            let delete_timer = tokio::time::sleep(gc.check_interval);
            tokio::pin!(delete_timer);
            loop {
                tokio::select! {
                    _ = shutdown.changed() => {
                        tracing::info!("about to close history garbage collector");
                        return;
                    }
                    _ = mark_ticker.tick() => {
                        gc.create_pending_records().await;
                    }
                    () = &mut delete_timer => {
                        let delay = gc.run_delete_phase().await;
                        delete_timer.as_mut().reset(tokio::time::Instant::now() + delay);
                    }
                }
            }
        })
    }

    /// Mark phase: flag the next set of over-cap unnamed entries.
    async fn create_pending_records(&self) {
        match self.db.mark_old_records(self.num_preserve).await {
            Ok(num_marked) => {
                tracing::info!(
                    num_marked,
                    "marked next set of query history records for deletion"
                );
            }
            Err(err) => {
                tracing::error!(
                    error = %err,
                    "failed to mark query history records for deletion (will try again)"
                );
            }
        }
    }

    /// Delete phase wrapper: runs the transactional deletion, publishes
    /// stats, and returns the delay until the next phase (longer after
    /// errors).
    async fn run_delete_phase(&self) -> Duration {
        let mut num_err = 0usize;
        let index_size = self.indexer.count() as i64;
        let table_size = match self.db.table_size().await {
            Ok(size) => size,
            Err(err) => {
                num_err += 1;
                tracing::error!(error = %err, "failed to obtain query history table size");
                0
            }
        };

        let mut del_stats = self.process_deletion_pending_records().await;
        del_stats.num_errors += num_err;
        if del_stats.num_errors == 0 {
            del_stats.index_size = index_size;
            del_stats.sql_table_size = table_size;
        }
        self.status_writer
            .write_query_history_deletion_status(del_stats)
            .await;

        if del_stats.num_errors == 0 {
            self.check_interval
        } else {
            tracing::error!(
                "errors in deleting of pending records - going to wait {:.1} minutes then continue",
                TIME_WAIT_AFTER_DEL_ERRORS.as_secs_f64() / 60.0
            );
            TIME_WAIT_AFTER_DEL_ERRORS + self.check_interval
        }
    }

    /// Removes up to `max_num_delete` oldest-marked entries from both
    /// stores within one transaction. Any failure rolls the whole batch
    /// back.
    async fn process_deletion_pending_records(&self) -> QueryHistoryDelStats {
        tracing::debug!("retrieving next query history data with pending deletion");
        let mut tx = match self.db.begin().await {
            Ok(tx) => tx,
            Err(err) => {
                tracing::error!(error = %err, "failed to retrieve next query history data with pending deletion");
                return QueryHistoryDelStats {
                    num_errors: 1,
                    ..Default::default()
                };
            }
        };
        let recs = match self
            .db
            .get_pending_deletion_records(&mut tx, self.max_num_delete)
            .await
        {
            Ok(recs) => recs,
            Err(err) => {
                tracing::error!(error = %err, "failed to retrieve next query history data with pending deletion");
                rollback(tx).await;
                return QueryHistoryDelStats {
                    num_errors: 1,
                    ..Default::default()
                };
            }
        };
        tracing::debug!(
            max_limit = self.max_num_delete,
            num_records = recs.len(),
            "searched query history records for deletion"
        );
        for rec in &recs {
            if let Err(err) = self
                .db
                .remove_record(&mut tx, rec.created, rec.user_id, &rec.query_id)
                .await
            {
                tracing::error!(
                    error = %err,
                    created = rec.created,
                    user_id = rec.user_id,
                    query_id = %rec.query_id,
                    "failed to remove query history item"
                );
                rollback(tx).await;
                return QueryHistoryDelStats {
                    num_errors: 1,
                    ..Default::default()
                };
            }
            if let Err(err) = self.indexer.delete(&rec.index_id()).await {
                tracing::error!(
                    error = %err,
                    created = rec.created,
                    user_id = rec.user_id,
                    query_id = %rec.query_id,
                    "failed to delete item from fulltext index"
                );
                rollback(tx).await;
                return QueryHistoryDelStats {
                    num_errors: 1,
                    ..Default::default()
                };
            }
        }
        if let Err(err) = tx.commit().await {
            tracing::error!(
                error = %err,
                "failed to commit transaction in process_deletion_pending_records"
            );
            return QueryHistoryDelStats {
                num_errors: 1,
                ..Default::default()
            };
        }
        QueryHistoryDelStats {
            num_deleted: recs.len(),
            ..Default::default()
        }
    }

    /// Ad-hoc chunked garbage collection driven by a per-user sorted-set
    /// cursor. Each invocation pops and processes up to `chunk_size`
    /// users; interruption leaves the remaining users in the cursor for
    /// the next invocation.
    pub async fn run_ad_hoc(
        &self,
        chunk_size: usize,
        shutdown: watch::Receiver<bool>,
    ) -> Result<()> {
        let cache_exists = self
            .rdb
            .exists(GC_USERS_PROC_SET_KEY)
            .await
            .context("failed to garbage collect query history")?;
        if !cache_exists {
            tracing::info!("processed user IDs not found - will create a new set");
            let users = self
                .db
                .get_all_users_with_some_records()
                .await
                .context("failed to garbage collect query history")?;
            for uid in &users {
                self.rdb.uint_zadd(GC_USERS_PROC_SET_KEY, *uid).await?;
            }
            tracing::info!(number_of_users = users.len(), "added users to process");
        }
        tracing::info!(chunk_size, "processing next chunk of users");
        for _ in 0..chunk_size {
            if *shutdown.borrow() {
                tracing::info!("interrupted by user");
                return Ok(());
            }
            let next_user_id = self
                .rdb
                .uint_zrem_lowest(GC_USERS_PROC_SET_KEY)
                .await
                .context("failed to garbage collect query history")?;
            let Some(next_user_id) = next_user_id else {
                // the set will be refilled on the next invocation
                break;
            };

            let rm_from_index = match self
                .db
                .get_user_garbage_records(next_user_id, self.num_preserve)
                .await
            {
                Ok(recs) => recs,
                Err(err) => {
                    tracing::error!(
                        error = %err,
                        user_id = next_user_id,
                        "failed to garbage-collect queries for a user"
                    );
                    continue;
                }
            };
            for v in &rm_from_index {
                if let Err(err) = self.indexer.delete(&v.index_id()).await {
                    tracing::error!(
                        error = %err,
                        user_id = next_user_id,
                        fulltext_id = %v.index_id(),
                        "failed to garbage-collect queries for a user"
                    );
                    continue;
                }
            }

            match self
                .db
                .garbage_collect_records(next_user_id, self.num_preserve)
                .await
            {
                Ok(num_removed) => {
                    tracing::info!(
                        user_id = next_user_id,
                        num_removed,
                        "garbage-collected queries for user"
                    );
                }
                Err(err) => {
                    tracing::error!(
                        error = %err,
                        user_id = next_user_id,
                        "failed to garbage-collect queries for a user"
                    );
                    continue;
                }
            }
        }
        let remaining_users = self
            .rdb
            .zcard(GC_USERS_PROC_SET_KEY)
            .await
            .context("failed to determine remaining num. of users to process")?;
        tracing::info!(remaining_users, chunk_size, "chunk processed");
        Ok(())
    }
}

async fn rollback(tx: sqlx::Transaction<'static, sqlx::MySql>) {
    if let Err(err) = tx.rollback().await {
        tracing::error!(error = %err, "failed to rollback transaction");
    }
}
