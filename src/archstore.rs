//! Concordance archive store.
//!
//! [`ConcArchiveStore`] is the narrow contract the archiver, cleaner,
//! deduplicator and indexer use to talk to the relational archive
//! (`kontext_conc_persistence` and the corpus metadata tables). The MySQL
//! implementation keeps each operation a single statement except
//! [`ConcArchiveStore::merge_in_place`], which brackets its
//! remove-then-insert in one transaction.
//!
//! A [`ConcArchiveDryRun`] decorator turns every mutation into a log line
//! for the `--dry-run` CLI mode.

use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use chrono::{Local, NaiveDateTime};
use sqlx::{MySqlPool, Row};
use std::sync::Arc;

use crate::error::ArchiveError;
use crate::models::{merge_records, time_is_at_night, QueryArchRec, SubcorpusProps};

/// Upper bound for single-shot recent-record loads; the table is partitioned
/// by creation time and holds millions of rows.
const MAX_RECENT_RECORDS: usize = 1000;

/// Lookback hint for recent-record queries, letting the query planner skip
/// old partitions.
const RECENT_LOOKBACK_DAYS: i64 = 180;

/// Operations against the concordance archive.
#[async_trait]
pub trait ConcArchiveStore: Send + Sync {
    /// Loads the `num` most recently created rows (newest first), bounded
    /// by an internal cap and a lookback hint.
    async fn load_recent_n_records(&self, num: usize) -> Result<Vec<QueryArchRec>>;

    /// Loads up to `max_items` rows with `created >= from_date`, oldest
    /// first.
    async fn load_records_from_date(
        &self,
        from_date: NaiveDateTime,
        max_items: usize,
    ) -> Result<Vec<QueryArchRec>>;

    async fn contains_record(&self, conc_id: &str) -> Result<bool>;

    /// Loads all rows with the given id (duplicates included).
    async fn load_records_by_id(&self, conc_id: &str) -> Result<Vec<QueryArchRec>>;

    async fn insert_record(&self, rec: &QueryArchRec) -> Result<()>;

    /// Sets the `permanent` flag of all rows with the id; updating a
    /// missing id is an error.
    async fn update_record_status(&self, id: &str, status: i32) -> Result<()>;

    async fn remove_records_by_id(&self, conc_id: &str) -> Result<()>;

    /// Collapses `curr` plus `rec` into a single merged row: all rows with
    /// the id are removed and the merged row inserted, atomically.
    async fn merge_in_place(
        &self,
        curr: &[QueryArchRec],
        rec: &QueryArchRec,
    ) -> Result<QueryArchRec>;

    /// Returns `(year, count)` pairs over the whole archive. Without
    /// `force_load` the query is refused outside night hours with the
    /// [`ArchiveError::TooDemandingQuery`] sentinel.
    async fn get_arch_sizes_by_years(&self, force_load: bool) -> Result<Vec<(i32, i64)>>;

    /// Resolves a subcorpus id to its user-defined name and text-type
    /// restrictions. An empty id resolves to empty props without error.
    async fn get_subcorpus_props(&self, subc_id: &str) -> Result<SubcorpusProps>;

    /// Total token size of a corpus; 0 for unknown corpora.
    async fn get_corpus_size(&self, corpname: &str) -> Result<i64>;

    /// Token size of a subcorpus; 0 for unknown ids.
    async fn get_subcorpus_size(&self, subc_id: &str) -> Result<i64>;
}

/// MySQL-backed archive store.
pub struct MySqlConcArchive {
    pool: MySqlPool,
}

impl MySqlConcArchive {
    pub fn new(pool: MySqlPool) -> Self {
        Self { pool }
    }
}

fn row_to_rec(row: &sqlx::mysql::MySqlRow) -> Result<QueryArchRec> {
    Ok(QueryArchRec {
        id: row.try_get("id")?,
        data: row.try_get("data")?,
        created: row.try_get("created")?,
        num_access: row.try_get("num_access")?,
        last_access: row.try_get("last_access")?,
        permanent: row.try_get("permanent")?,
    })
}

#[async_trait]
impl ConcArchiveStore for MySqlConcArchive {
    async fn load_recent_n_records(&self, num: usize) -> Result<Vec<QueryArchRec>> {
        if num > MAX_RECENT_RECORDS {
            bail!("cannot load more than {} records at a time", MAX_RECENT_RECORDS);
        }
        let helper_limit =
            Local::now().naive_local() - chrono::Duration::days(RECENT_LOOKBACK_DAYS);
        let rows = sqlx::query(
            "SELECT id, data, created, num_access, last_access, permanent \
             FROM kontext_conc_persistence \
             WHERE created >= ? \
             ORDER BY created DESC LIMIT ?",
        )
        .bind(helper_limit)
        .bind(num as i64)
        .fetch_all(&self.pool)
        .await
        .context("failed to load recent records")?;
        rows.iter().map(row_to_rec).collect()
    }

    async fn load_records_from_date(
        &self,
        from_date: NaiveDateTime,
        max_items: usize,
    ) -> Result<Vec<QueryArchRec>> {
        let rows = sqlx::query(
            "SELECT id, data, created, num_access, last_access, permanent \
             FROM kontext_conc_persistence \
             WHERE created >= ? \
             ORDER BY created LIMIT ?",
        )
        .bind(from_date)
        .bind(max_items as i64)
        .fetch_all(&self.pool)
        .await
        .context("failed to load records")?;
        rows.iter().map(row_to_rec).collect()
    }

    async fn contains_record(&self, conc_id: &str) -> Result<bool> {
        let count: i64 = sqlx::query_scalar(
            "SELECT COUNT(*) FROM kontext_conc_persistence WHERE id = ? LIMIT 1",
        )
        .bind(conc_id)
        .fetch_one(&self.pool)
        .await
        .with_context(|| format!("failed to test existence of record {}", conc_id))?;
        Ok(count > 0)
    }

    async fn load_records_by_id(&self, conc_id: &str) -> Result<Vec<QueryArchRec>> {
        let rows = sqlx::query(
            "SELECT id, data, created, num_access, last_access, permanent \
             FROM kontext_conc_persistence WHERE id = ?",
        )
        .bind(conc_id)
        .fetch_all(&self.pool)
        .await
        .with_context(|| format!("failed to get records with id {}", conc_id))?;
        rows.iter().map(row_to_rec).collect()
    }

    async fn insert_record(&self, rec: &QueryArchRec) -> Result<()> {
        sqlx::query(
            "INSERT INTO kontext_conc_persistence \
             (id, data, created, num_access, last_access, permanent) \
             VALUES (?, ?, ?, ?, ?, ?)",
        )
        .bind(&rec.id)
        .bind(&rec.data)
        .bind(rec.created)
        .bind(rec.num_access)
        .bind(rec.last_access)
        .bind(rec.permanent)
        .execute(&self.pool)
        .await
        .context("failed to insert archive record")?;
        Ok(())
    }

    async fn update_record_status(&self, id: &str, status: i32) -> Result<()> {
        let res = sqlx::query("UPDATE kontext_conc_persistence SET permanent = ? WHERE id = ?")
            .bind(status)
            .bind(id)
            .execute(&self.pool)
            .await
            .with_context(|| format!("failed to update status of {}", id))?;
        if res.rows_affected() == 0 {
            bail!("cannot update record status, id {} not in archive", id);
        }
        Ok(())
    }

    async fn remove_records_by_id(&self, conc_id: &str) -> Result<()> {
        sqlx::query("DELETE FROM kontext_conc_persistence WHERE id = ?")
            .bind(conc_id)
            .execute(&self.pool)
            .await
            .with_context(|| format!("failed to remove records with id {}", conc_id))?;
        Ok(())
    }

    async fn merge_in_place(
        &self,
        curr: &[QueryArchRec],
        rec: &QueryArchRec,
    ) -> Result<QueryArchRec> {
        let merged = merge_records(curr, rec);
        let mut tx = self
            .pool
            .begin()
            .await
            .context("failed to open merge transaction")?;
        sqlx::query("DELETE FROM kontext_conc_persistence WHERE id = ?")
            .bind(&rec.id)
            .execute(&mut *tx)
            .await
            .with_context(|| format!("failed to finish deduplication for {}", rec.id))?;
        sqlx::query(
            "INSERT INTO kontext_conc_persistence \
             (id, data, created, num_access, last_access, permanent) \
             VALUES (?, ?, ?, ?, ?, ?)",
        )
        .bind(&merged.id)
        .bind(&merged.data)
        .bind(merged.created)
        .bind(merged.num_access)
        .bind(merged.last_access)
        .bind(merged.permanent)
        .execute(&mut *tx)
        .await
        .with_context(|| format!("failed to store merged record {}", rec.id))?;
        tx.commit()
            .await
            .with_context(|| format!("failed to commit merge of {}", rec.id))?;
        Ok(merged)
    }

    async fn get_arch_sizes_by_years(&self, force_load: bool) -> Result<Vec<(i32, i64)>> {
        if !force_load && !time_is_at_night(Local::now().naive_local()) {
            return Err(ArchiveError::TooDemandingQuery.into());
        }
        let rows = sqlx::query(
            "SELECT COUNT(*) AS cnt, YEAR(created) AS yc \
             FROM kontext_conc_persistence \
             GROUP BY YEAR(created) ORDER BY yc",
        )
        .fetch_all(&self.pool)
        .await
        .context("failed to fetch arch. sizes")?;
        let mut ans = Vec::with_capacity(rows.len());
        for row in &rows {
            let count: i64 = row.try_get("cnt")?;
            let year: i32 = row.try_get("yc")?;
            ans.push((year, count));
        }
        Ok(ans)
    }

    async fn get_subcorpus_props(&self, subc_id: &str) -> Result<SubcorpusProps> {
        if subc_id.is_empty() {
            return Ok(SubcorpusProps::default());
        }
        let row = sqlx::query("SELECT name, text_types FROM kontext_subcorpus WHERE id = ?")
            .bind(subc_id)
            .fetch_optional(&self.pool)
            .await
            .context("failed to get subcorpus props")?;
        let Some(row) = row else {
            return Ok(SubcorpusProps::default());
        };
        let name: String = row.try_get("name")?;
        let text_types_raw: Option<String> = row.try_get("text_types")?;
        let text_types = match text_types_raw {
            Some(raw) if !raw.is_empty() => {
                serde_json::from_str(&raw).context("failed to get subcorpus props")?
            }
            _ => Default::default(),
        };
        Ok(SubcorpusProps { name, text_types })
    }

    async fn get_corpus_size(&self, corpname: &str) -> Result<i64> {
        let size: Option<i64> = sqlx::query_scalar("SELECT size FROM corpora WHERE name = ?")
            .bind(corpname)
            .fetch_optional(&self.pool)
            .await
            .with_context(|| format!("failed to get size of corpus {}", corpname))?;
        Ok(size.unwrap_or(0))
    }

    async fn get_subcorpus_size(&self, subc_id: &str) -> Result<i64> {
        if subc_id.is_empty() {
            return Ok(0);
        }
        let size: Option<i64> = sqlx::query_scalar("SELECT size FROM kontext_subcorpus WHERE id = ?")
            .bind(subc_id)
            .fetch_optional(&self.pool)
            .await
            .with_context(|| format!("failed to get size of subcorpus {}", subc_id))?;
        Ok(size.unwrap_or(0))
    }
}

/// Dry-run decorator: reads pass through, every mutation becomes a log
/// line and reports zero effect.
pub struct ConcArchiveDryRun {
    inner: Arc<dyn ConcArchiveStore>,
}

impl ConcArchiveDryRun {
    pub fn new(inner: Arc<dyn ConcArchiveStore>) -> Self {
        Self { inner }
    }
}

#[async_trait]
impl ConcArchiveStore for ConcArchiveDryRun {
    async fn load_recent_n_records(&self, num: usize) -> Result<Vec<QueryArchRec>> {
        self.inner.load_recent_n_records(num).await
    }

    async fn load_records_from_date(
        &self,
        from_date: NaiveDateTime,
        max_items: usize,
    ) -> Result<Vec<QueryArchRec>> {
        self.inner.load_records_from_date(from_date, max_items).await
    }

    async fn contains_record(&self, conc_id: &str) -> Result<bool> {
        self.inner.contains_record(conc_id).await
    }

    async fn load_records_by_id(&self, conc_id: &str) -> Result<Vec<QueryArchRec>> {
        self.inner.load_records_by_id(conc_id).await
    }

    async fn insert_record(&self, rec: &QueryArchRec) -> Result<()> {
        tracing::info!("DRY-RUN>>> insert_record(QueryArchRec{{id: {}}})", rec.id);
        Ok(())
    }

    async fn update_record_status(&self, id: &str, status: i32) -> Result<()> {
        tracing::info!("DRY-RUN>>> update_record_status({}, {})", id, status);
        Ok(())
    }

    async fn remove_records_by_id(&self, conc_id: &str) -> Result<()> {
        tracing::info!("DRY-RUN>>> remove_records_by_id({})", conc_id);
        Ok(())
    }

    async fn merge_in_place(
        &self,
        curr: &[QueryArchRec],
        rec: &QueryArchRec,
    ) -> Result<QueryArchRec> {
        tracing::info!("DRY-RUN>>> merge_in_place(..., QueryArchRec{{id: {}}})", rec.id);
        Ok(merge_records(curr, rec))
    }

    async fn get_arch_sizes_by_years(&self, force_load: bool) -> Result<Vec<(i32, i64)>> {
        self.inner.get_arch_sizes_by_years(force_load).await
    }

    async fn get_subcorpus_props(&self, subc_id: &str) -> Result<SubcorpusProps> {
        self.inner.get_subcorpus_props(subc_id).await
    }

    async fn get_corpus_size(&self, corpname: &str) -> Result<i64> {
        self.inner.get_corpus_size(corpname).await
    }

    async fn get_subcorpus_size(&self, subc_id: &str) -> Result<i64> {
        self.inner.get_subcorpus_size(subc_id).await
    }
}
