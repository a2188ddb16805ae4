//! Initial bulk seeding of the query history index.
//!
//! Walks all users with history, loads each user's visible entries (named
//! plus most-recent-N) and indexes them. A sorted-set cursor in the
//! key-value store tracks the users still to process, so the import can be
//! run in chunks and survives interruption. Once every user was processed,
//! the cursor key is replaced with the literal string
//! `finished-<timestamp>`; a subsequent run refuses to start until the key
//! is removed manually.

use std::sync::Arc;

use anyhow::{bail, Context, Result};
use chrono::Local;
use tokio::sync::watch;

use crate::archstore::ConcArchiveStore;
use crate::error::is_not_found;
use crate::histstore::QueryHistoryStore;
use crate::indexer::Indexer;
use crate::kvstore::RedisAdapter;
use crate::models::HistoryRecord;

/// Sorted set holding user ids still awaiting the initial import (or the
/// `finished-<timestamp>` marker string once done).
const USERS_PROC_SET_KEY: &str = "camus_users_qh_init";

pub struct DataInitializer {
    conc_arch_db: Arc<dyn ConcArchiveStore>,
    query_hist_db: Arc<dyn QueryHistoryStore>,
    rdb: Arc<RedisAdapter>,
    indexer: Arc<Indexer>,
    num_preserve: usize,
}

impl DataInitializer {
    pub fn new(
        conc_arch_db: Arc<dyn ConcArchiveStore>,
        query_hist_db: Arc<dyn QueryHistoryStore>,
        rdb: Arc<RedisAdapter>,
        indexer: Arc<Indexer>,
        num_preserve: usize,
    ) -> Self {
        Self {
            conc_arch_db,
            query_hist_db,
            rdb,
            indexer,
            num_preserve,
        }
    }

    /// Indexes one history entry, resolving the payload from the key-value
    /// store first with a relational fallback (recently produced queries
    /// may not be archived yet; old ones may have expired from Redis).
    async fn process_query(&self, mut hrec: HistoryRecord) -> Result<()> {
        match self.rdb.get_conc_record(&hrec.query_id).await {
            Ok(rec) => hrec.rec = Some(rec),
            Err(err) if is_not_found(&err) => {
                let recs = self
                    .conc_arch_db
                    .load_records_by_id(&hrec.query_id)
                    .await
                    .with_context(|| {
                        format!("failed to load query {} from MySQL", hrec.query_id)
                    })?;
                match recs.into_iter().next() {
                    Some(rec) => hrec.rec = Some(rec),
                    None => bail!(
                        "record {} is gone (both Redis and MySQL) - skipping",
                        hrec.query_id
                    ),
                }
            }
            Err(err) => {
                return Err(err.context(format!("failed to process query {}", hrec.query_id)));
            }
        }
        let ok = self
            .indexer
            .index_record(&hrec)
            .await
            .with_context(|| format!("failed to index query {}", hrec.query_id))?;
        if !ok {
            bail!("record {} is not indexable - skipped", hrec.query_id);
        }
        Ok(())
    }

    /// Runs one chunk of the import. Returns an error when a previous
    /// completed import is detected (the cursor key must be deleted
    /// manually to re-run).
    pub async fn run(&self, chunk_size: usize, shutdown: watch::Receiver<bool>) -> Result<()> {
        // check for status of a possible previous run first
        let key_type = self
            .rdb
            .key_type(USERS_PROC_SET_KEY)
            .await
            .context("failed to init query history")?;
        if key_type == "string" {
            bail!(
                "it appears that a previous import was performed - to override, \
                 you must remove the key {} from Redis",
                USERS_PROC_SET_KEY
            );
        }

        let cache_exists = self
            .rdb
            .exists(USERS_PROC_SET_KEY)
            .await
            .context("failed to init query history")?;
        if !cache_exists {
            tracing::info!("processed user IDs not found - will create a new set");
            let users = self
                .query_hist_db
                .get_all_users_with_some_records()
                .await
                .context("failed to init query history")?;
            for uid in &users {
                self.rdb.uint_zadd(USERS_PROC_SET_KEY, *uid).await?;
            }
            tracing::info!(number_of_users = users.len(), "added users to process");
        }

        let mut finished_all_chunks = false;
        tracing::info!(chunk_size, "processing next chunk of users");
        'users: for _ in 0..chunk_size {
            let next_user_id = self
                .rdb
                .uint_zrem_lowest(USERS_PROC_SET_KEY)
                .await
                .context("failed to init query history")?;
            let Some(next_user_id) = next_user_id else {
                finished_all_chunks = true;
                break;
            };
            let q_ids = self
                .query_hist_db
                .get_user_records(next_user_id, self.num_preserve)
                .await
                .context("failed to init query history")?;
            tracing::info!(
                user_id = next_user_id,
                num_records = q_ids.len(),
                "processing next user"
            );
            for hrec in q_ids {
                let query_id = hrec.query_id.clone();
                if let Err(err) = self.process_query(hrec).await {
                    tracing::error!(
                        error = %err,
                        user_id = next_user_id,
                        query_id = %query_id,
                        "failed to process record, skipping"
                    );
                }
                if *shutdown.borrow() {
                    tracing::info!("interrupted by user");
                    return Ok(());
                }
            }
            if *shutdown.borrow() {
                tracing::info!("interrupted by user");
                break 'users;
            }
        }

        let remaining_users = self
            .rdb
            .zcard(USERS_PROC_SET_KEY)
            .await
            .context("failed to determine remaining num. of users to process")?;
        tracing::info!(remaining_users, chunk_size, "chunk processed");
        if finished_all_chunks {
            let rec = format!("finished-{}", Local::now().format("%Y-%m-%dT%H:%M:%S"));
            tracing::info!("no more items - writing '{}' to Redis and ending", rec);
            self.rdb
                .set(USERS_PROC_SET_KEY, &rec)
                .await
                .context("failed to write 'finished' record to Redis")?;
        }
        Ok(())
    }
}
