//! Query history store.
//!
//! [`QueryHistoryStore`] hides the `kontext_query_history` table behind the
//! operations the history GC, the bulk importer and the indexer use. The
//! delete path is transactional: [`QueryHistoryStore::begin`] hands out the
//! transaction that [`QueryHistoryStore::remove_record`] and
//! [`QueryHistoryStore::get_pending_deletion_records`] run inside, so a
//! failed fulltext delete can roll the relational delete back.

use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use chrono::Local;
use sqlx::{MySql, MySqlPool, Row, Transaction};
use std::sync::Arc;

use crate::models::HistoryRecord;

/// Same single-shot load bound as the archive store.
const MAX_RECENT_RECORDS: usize = 1000;

const RECENT_LOOKBACK_DAYS: i64 = 180;

/// Operations against the per-user query history.
#[async_trait]
pub trait QueryHistoryStore: Send + Sync {
    /// Opens a transaction for the delete phase.
    async fn begin(&self) -> Result<Transaction<'static, MySql>>;

    /// All user ids with at least one history row.
    async fn get_all_users_with_some_records(&self) -> Result<Vec<i64>>;

    /// A user's visible history: all named entries united with the
    /// `num_items` most recent ones, newest first.
    async fn get_user_records(&self, user_id: i64, num_items: usize)
        -> Result<Vec<HistoryRecord>>;

    /// Flags the oldest unnamed entries beyond the per-user cap with
    /// `pending_deletion_from = NOW()`. Returns the number of rows marked.
    async fn mark_old_records(&self, num_preserve: usize) -> Result<i64>;

    /// A user's entries beyond their `num_preserve` most recent ones.
    async fn get_user_garbage_records(
        &self,
        user_id: i64,
        num_preserve: usize,
    ) -> Result<Vec<HistoryRecord>>;

    /// Deletes everything beyond the user's `num_preserve` most recent
    /// entries. Returns the number of rows removed.
    async fn garbage_collect_records(&self, user_id: i64, num_preserve: usize) -> Result<i64>;

    /// Deletes one history row inside `tx`, but only while it is still
    /// unnamed — the name guard prevents racing a user who saved the entry
    /// after it was marked. Zero affected rows is an error.
    async fn remove_record(
        &self,
        tx: &mut Transaction<'static, MySql>,
        created: i64,
        user_id: i64,
        query_id: &str,
    ) -> Result<()>;

    /// Up to `max_items` rows marked for deletion, oldest marks first,
    /// read inside `tx`.
    async fn get_pending_deletion_records(
        &self,
        tx: &mut Transaction<'static, MySql>,
        max_items: usize,
    ) -> Result<Vec<HistoryRecord>>;

    /// The `num` most recently created history rows across all users.
    async fn load_recent_n_records(&self, num: usize) -> Result<Vec<HistoryRecord>>;

    /// Total number of history rows.
    async fn table_size(&self) -> Result<i64>;
}

/// MySQL-backed history store.
pub struct MySqlQueryHistory {
    pool: MySqlPool,
}

impl MySqlQueryHistory {
    pub fn new(pool: MySqlPool) -> Self {
        Self { pool }
    }
}

fn row_to_hrec(row: &sqlx::mysql::MySqlRow) -> Result<HistoryRecord> {
    Ok(HistoryRecord {
        user_id: row.try_get("user_id")?,
        query_id: row.try_get("query_id")?,
        created: row.try_get("created")?,
        name: row.try_get("name")?,
        rec: None,
    })
}

#[async_trait]
impl QueryHistoryStore for MySqlQueryHistory {
    async fn begin(&self) -> Result<Transaction<'static, MySql>> {
        self.pool
            .begin()
            .await
            .context("failed to open history transaction")
    }

    async fn get_all_users_with_some_records(&self) -> Result<Vec<i64>> {
        let rows = sqlx::query_scalar(
            "SELECT DISTINCT user_id FROM kontext_query_history ORDER BY user_id",
        )
        .fetch_all(&self.pool)
        .await
        .context("failed to get users with history")?;
        Ok(rows)
    }

    async fn get_user_records(
        &self,
        user_id: i64,
        num_items: usize,
    ) -> Result<Vec<HistoryRecord>> {
        let rows = sqlx::query(
            "SELECT user_id, query_id, created, name FROM ( \
               SELECT user_id, query_id, created, name FROM kontext_query_history \
                 WHERE user_id = ? AND name IS NOT NULL \
               UNION \
               SELECT user_id, query_id, created, name FROM kontext_query_history \
                 WHERE user_id = ? ORDER BY created DESC LIMIT ? \
             ) AS combined \
             ORDER BY created DESC LIMIT ?",
        )
        .bind(user_id)
        .bind(user_id)
        .bind(num_items as i64)
        .bind(num_items as i64)
        .fetch_all(&self.pool)
        .await
        .context("failed to get user query history")?;
        rows.iter().map(row_to_hrec).collect()
    }

    async fn mark_old_records(&self, num_preserve: usize) -> Result<i64> {
        let res = sqlx::query(
            "UPDATE kontext_query_history AS qh JOIN ( \
               SELECT user_id, created, query_id FROM ( \
                 SELECT user_id, created, query_id, \
                 ROW_NUMBER() OVER (PARTITION BY user_id ORDER BY created DESC) AS row_num \
                 FROM kontext_query_history \
                 WHERE name IS NULL \
               ) AS tmp \
               WHERE row_num > ? \
               ORDER BY created \
             ) AS du \
             ON qh.user_id = du.user_id AND qh.created = du.created AND qh.query_id = du.query_id \
             SET qh.pending_deletion_from = NOW()",
        )
        .bind(num_preserve as i64)
        .execute(&self.pool)
        .await
        .context("failed to mark old query history records")?;
        Ok(res.rows_affected() as i64)
    }

    async fn get_user_garbage_records(
        &self,
        user_id: i64,
        num_preserve: usize,
    ) -> Result<Vec<HistoryRecord>> {
        let rows = sqlx::query(
            "SELECT user_id, query_id, created, name FROM kontext_query_history \
             WHERE user_id = ? AND created NOT IN \
             (SELECT created FROM \
               ( \
                 SELECT created FROM kontext_query_history \
                 WHERE user_id = ? ORDER BY created DESC LIMIT ? \
               ) preserve \
             )",
        )
        .bind(user_id)
        .bind(user_id)
        .bind(num_preserve as i64)
        .fetch_all(&self.pool)
        .await
        .context("failed to get user garbage history")?;
        rows.iter().map(row_to_hrec).collect()
    }

    async fn garbage_collect_records(&self, user_id: i64, num_preserve: usize) -> Result<i64> {
        let res = sqlx::query(
            "DELETE FROM kontext_query_history \
             WHERE user_id = ? AND created NOT IN \
             (SELECT created FROM \
               ( \
                 SELECT created FROM kontext_query_history \
                 WHERE user_id = ? ORDER BY created DESC LIMIT ? \
               ) preserve \
             )",
        )
        .bind(user_id)
        .bind(user_id)
        .bind(num_preserve as i64)
        .execute(&self.pool)
        .await
        .context("failed to garbage collect user query history")?;
        Ok(res.rows_affected() as i64)
    }

    async fn remove_record(
        &self,
        tx: &mut Transaction<'static, MySql>,
        created: i64,
        user_id: i64,
        query_id: &str,
    ) -> Result<()> {
        let res = sqlx::query(
            "DELETE FROM kontext_query_history \
             WHERE created = ? AND user_id = ? AND query_id = ? AND name IS NULL",
        )
        .bind(created)
        .bind(user_id)
        .bind(query_id)
        .execute(&mut **tx)
        .await
        .context("failed to delete query history item")?;
        if res.rows_affected() == 0 {
            bail!("failed to delete query history item: no match within non-archived items");
        }
        Ok(())
    }

    async fn get_pending_deletion_records(
        &self,
        tx: &mut Transaction<'static, MySql>,
        max_items: usize,
    ) -> Result<Vec<HistoryRecord>> {
        let rows = sqlx::query(
            "SELECT user_id, query_id, created, name FROM kontext_query_history \
             WHERE pending_deletion_from IS NOT NULL \
             ORDER BY pending_deletion_from \
             LIMIT ?",
        )
        .bind(max_items as i64)
        .fetch_all(&mut **tx)
        .await
        .context("failed to get pending deletion history")?;
        rows.iter().map(row_to_hrec).collect()
    }

    async fn load_recent_n_records(&self, num: usize) -> Result<Vec<HistoryRecord>> {
        if num > MAX_RECENT_RECORDS {
            bail!("cannot load more than {} records at a time", MAX_RECENT_RECORDS);
        }
        let helper_limit = (Local::now().naive_local()
            - chrono::Duration::days(RECENT_LOOKBACK_DAYS))
        .and_utc()
        .timestamp();
        let rows = sqlx::query(
            "SELECT user_id, query_id, created, name FROM kontext_query_history \
             WHERE created >= ? \
             ORDER BY created DESC LIMIT ?",
        )
        .bind(helper_limit)
        .bind(num as i64)
        .fetch_all(&self.pool)
        .await
        .context("failed to get user query history")?;
        rows.iter().map(row_to_hrec).collect()
    }

    async fn table_size(&self) -> Result<i64> {
        sqlx::query_scalar("SELECT COUNT(*) FROM kontext_query_history")
            .fetch_one(&self.pool)
            .await
            .context("failed to obtain query history table size")
    }
}

/// Dry-run decorator: reads pass through, every mutation becomes a log
/// line and reports zero effect.
pub struct QueryHistoryDryRun {
    inner: Arc<dyn QueryHistoryStore>,
}

impl QueryHistoryDryRun {
    pub fn new(inner: Arc<dyn QueryHistoryStore>) -> Self {
        Self { inner }
    }
}

#[async_trait]
impl QueryHistoryStore for QueryHistoryDryRun {
    async fn begin(&self) -> Result<Transaction<'static, MySql>> {
        self.inner.begin().await
    }

    async fn get_all_users_with_some_records(&self) -> Result<Vec<i64>> {
        self.inner.get_all_users_with_some_records().await
    }

    async fn get_user_records(
        &self,
        user_id: i64,
        num_items: usize,
    ) -> Result<Vec<HistoryRecord>> {
        self.inner.get_user_records(user_id, num_items).await
    }

    async fn mark_old_records(&self, num_preserve: usize) -> Result<i64> {
        tracing::info!("DRY-RUN>>> mark_old_records({})", num_preserve);
        Ok(0)
    }

    async fn get_user_garbage_records(
        &self,
        user_id: i64,
        num_preserve: usize,
    ) -> Result<Vec<HistoryRecord>> {
        self.inner
            .get_user_garbage_records(user_id, num_preserve)
            .await
    }

    async fn garbage_collect_records(&self, user_id: i64, num_preserve: usize) -> Result<i64> {
        tracing::info!(
            "DRY-RUN>>> garbage_collect_records({}, {})",
            user_id,
            num_preserve
        );
        Ok(0)
    }

    async fn remove_record(
        &self,
        _tx: &mut Transaction<'static, MySql>,
        created: i64,
        user_id: i64,
        query_id: &str,
    ) -> Result<()> {
        tracing::info!(
            "DRY-RUN>>> remove_record({}, {}, {})",
            created,
            user_id,
            query_id
        );
        Ok(())
    }

    async fn get_pending_deletion_records(
        &self,
        tx: &mut Transaction<'static, MySql>,
        max_items: usize,
    ) -> Result<Vec<HistoryRecord>> {
        self.inner.get_pending_deletion_records(tx, max_items).await
    }

    async fn load_recent_n_records(&self, num: usize) -> Result<Vec<HistoryRecord>> {
        self.inner.load_recent_n_records(num).await
    }

    async fn table_size(&self) -> Result<i64> {
        self.inner.table_size().await
    }
}
