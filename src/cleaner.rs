//! Periodic archive cleanup.
//!
//! The cleaner walks forward through archive rows in creation order,
//! repairing silent duplicates the in-flight deduplication missed and
//! deleting rows that were never accessed and are older than the
//! configured age floor. Its position is a single persisted cursor (a
//! string-encoded timestamp in the key-value store), so a restarted
//! service resumes where the previous one stopped; re-processing is safe
//! because merging is idempotent and deleting an absent row is a no-op.
//!
//! At night the batch size is increased (the database has spare capacity
//! then). Overlapping ticks are skipped via a running guard.

use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use anyhow::{Context, Result};
use chrono::{Local, NaiveDateTime};
use tokio::sync::watch;
use tokio::task::JoinHandle;

use crate::archstore::ConcArchiveStore;
use crate::config::CleanerConfig;
use crate::kvstore::RedisAdapter;
use crate::models::{time_is_at_night, validate_query_instances};
use crate::reporting::{CleanupStats, Reporting};

const DT_FORMAT: &str = "%Y-%m-%dT%H:%M:%S";

pub struct Cleaner {
    db: Arc<dyn ConcArchiveStore>,
    redis: Arc<RedisAdapter>,
    reporting: Arc<dyn Reporting>,
    conf: CleanerConfig,
    cleanup_running: AtomicBool,
}

/// Parses the persisted cursor; an empty value means "start from epoch".
fn parse_cursor(raw: &str) -> Result<NaiveDateTime> {
    if raw.is_empty() {
        return Ok(chrono::DateTime::from_timestamp(0, 0)
            .expect("epoch is representable")
            .naive_utc());
    }
    NaiveDateTime::parse_from_str(raw, DT_FORMAT)
        .with_context(|| format!("failed to parse last check date `{}`", raw))
}

fn format_cursor(t: NaiveDateTime) -> String {
    t.format(DT_FORMAT).to_string()
}

impl Cleaner {
    pub fn new(
        db: Arc<dyn ConcArchiveStore>,
        redis: Arc<RedisAdapter>,
        reporting: Arc<dyn Reporting>,
        conf: &CleanerConfig,
    ) -> Self {
        Self {
            db,
            redis,
            reporting,
            conf: conf.clone(),
            cleanup_running: AtomicBool::new(false),
        }
    }

    /// Batch size for a tick starting at `t`.
    fn batch_size_at(&self, t: NaiveDateTime) -> usize {
        if time_is_at_night(t) {
            self.conf.num_process_items_per_tick_night
        } else {
            self.conf.num_process_items_per_tick
        }
    }

    pub fn start(self: &Arc<Self>, mut shutdown: watch::Receiver<bool>) -> JoinHandle<()> {
        let cleaner = self.clone();
        tokio::spawn(async move {
            let period = cleaner.conf.check_interval();
            let mut ticker = tokio::time::interval_at(tokio::time::Instant::now() + period, period);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            loop {
                tokio::select! {
                    _ = shutdown.changed() => {
                        tracing::info!("about to close Cleaner");
                        return;
                    }
                    _ = ticker.tick() => {
                        if cleaner.cleanup_running.swap(true, Ordering::AcqRel) {
                            tracing::warn!("cannot run next cleanup - the previous not finished yet");
                            continue;
                        }
                        let cleaner = cleaner.clone();
                        tokio::spawn(async move {
                            if let Err(err) = cleaner.perform_cleanup().await {
                                tracing::error!(error = %err, "failed to perform cleanup");
                            }
                            cleaner.cleanup_running.store(false, Ordering::Release);
                        });
                    }
                }
            }
        })
    }

    pub fn stop(&self) {
        tracing::warn!("stopping Cleaner");
    }

    async fn perform_cleanup(&self) -> Result<()> {
        let t0 = std::time::Instant::now();
        let now = Local::now().naive_local();
        let birth_limit = now - self.conf.min_age_unvisited();
        let mut stats = CleanupStats::default();

        let last_date_raw = self.redis.get(&self.conf.status_key).await.with_context(|| {
            format!(
                "failed to fetch last check date from Redis (key {})",
                self.conf.status_key
            )
        })?;
        let last_date = parse_cursor(&last_date_raw)?;
        let batch_size = self.batch_size_at(now);
        tracing::info!(
            last_check = %last_date,
            items_to_load = batch_size,
            "performing archive cleanup"
        );
        let items = self
            .db
            .load_records_from_date(last_date, batch_size)
            .await
            .context("failed to load requested items for cleanup from database")?;
        if items.is_empty() {
            // nothing new since the cursor; keep the position
            tracing::debug!("no items to clean up");
            return Ok(());
        }

        let mut visited_ids: HashSet<String> = HashSet::new();
        for item in &items {
            if !visited_ids.insert(item.id.clone()) {
                continue;
            }
            stats.num_fetched += 1;
            let variants = match self.db.load_records_by_id(&item.id).await {
                Ok(variants) if !variants.is_empty() => variants,
                Ok(_) => continue, // removed by a concurrent writer
                Err(err) => {
                    tracing::warn!(
                        error = %err,
                        record_id = %item.id,
                        "failed to load variants, setting err flag and skipping"
                    );
                    self.flag_record_error(&item.id).await;
                    stats.num_errors += 1;
                    continue;
                }
            };

            if let Err(err) = validate_query_instances(&variants) {
                tracing::warn!(
                    error = %err,
                    record_id = %item.id,
                    "archive record variants failed to validate, setting err flag and skipping"
                );
                self.flag_record_error(&item.id).await;
                stats.num_errors += 1;
                continue;
            }

            let survivor = if variants.len() > 1 {
                match self.db.merge_in_place(&variants[1..], &variants[0]).await {
                    Ok(merged) => {
                        stats.num_merged += 1;
                        merged
                    }
                    Err(err) => {
                        tracing::warn!(
                            error = %err,
                            record_id = %item.id,
                            "failed to deduplicate items in database, setting err flag and skipping"
                        );
                        self.flag_record_error(&item.id).await;
                        stats.num_errors += 1;
                        continue;
                    }
                }
            } else {
                variants.into_iter().next().expect("non-empty variants")
            };

            if survivor.num_access == 0 && survivor.created < birth_limit {
                tracing::debug!(
                    record_id = %survivor.id,
                    limit_birth = %birth_limit,
                    "record will be removed due to no access and high age"
                );
                if let Err(err) = self.db.remove_records_by_id(&survivor.id).await {
                    tracing::warn!(
                        error = %err,
                        record_id = %survivor.id,
                        "failed to remove record, setting err flag and skipping"
                    );
                    self.flag_record_error(&survivor.id).await;
                    stats.num_errors += 1;
                    continue;
                }
                stats.num_deleted += 1;
            }
        }

        let cursor = format_cursor(items[items.len() - 1].created);
        if let Err(err) = self.redis.set(&self.conf.status_key, &cursor).await {
            tracing::error!(error = %err, "failed to persist cleanup cursor");
        }
        tracing::info!(
            num_fetched = stats.num_fetched,
            num_merged = stats.num_merged,
            num_deleted = stats.num_deleted,
            num_errors = stats.num_errors,
            proc_time = t0.elapsed().as_secs_f64(),
            "cleanup done"
        );
        self.reporting.write_cleanup_status(stats).await;
        Ok(())
    }

    async fn flag_record_error(&self, id: &str) {
        if let Err(err) = self.db.update_record_status(id, -1).await {
            tracing::error!(error = %err, record_id = %id, "failed to set error status");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::NaiveDate;

    #[test]
    fn empty_cursor_starts_from_epoch() {
        let epoch = parse_cursor("").unwrap();
        assert_eq!(epoch.and_utc().timestamp(), 0);
    }

    #[test]
    fn cursor_roundtrips() {
        let t = NaiveDate::from_ymd_opt(2024, 3, 15)
            .unwrap()
            .and_hms_opt(13, 37, 42)
            .unwrap();
        assert_eq!(format_cursor(t), "2024-03-15T13:37:42");
        assert_eq!(parse_cursor("2024-03-15T13:37:42").unwrap(), t);
    }

    #[test]
    fn garbage_cursor_is_an_error() {
        assert!(parse_cursor("2024-03-15 13:37").is_err());
    }
}
