//! Probabilistic deduplication of archive inserts.
//!
//! The [`Deduplicator`] keeps a Bloom filter of recently archived ids. A
//! negative membership test proves the id was never archived by this
//! process, so the archiver can insert without a database roundtrip; a
//! positive test triggers a full read and, when rows exist, a consistency
//! repair merging all same-id variants into one row.
//!
//! The filter is process-local, guarded by a read/write lock, serialized to
//! a configured file on clean shutdown and reloaded on startup. After a
//! [`Deduplicator::reset`] it can be re-seeded from the most recent archive
//! rows to cover the moments just after a restart.

use anyhow::{Context, Result};
use bloomfilter::Bloom;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::sync::Arc;

use crate::archstore::ConcArchiveStore;
use crate::config::ArchiverConfig;
use crate::models::QueryArchRec;

/// Filter capacity. Sized for the expected volume of recently produced
/// query ids between two cleaner passes.
const BLOOM_FILTER_NUM_ITEMS: usize = 1_000_000;

/// Accepted false-positive rate. A false positive only costs one extra
/// archive read.
const BLOOM_FILTER_PROB_COLLISION: f64 = 0.01;

/// Serializable snapshot of the filter (bitmap plus derivation parameters).
#[derive(Serialize, Deserialize)]
struct FilterSnapshot {
    bitmap: Vec<u8>,
    bitmap_bits: u64,
    k_num: u32,
    sip_keys: [(u64, u64); 2],
}

pub struct Deduplicator {
    known_ids: RwLock<Bloom<String>>,
    conc_db: Arc<dyn ConcArchiveStore>,
    conf: ArchiverConfig,
}

impl Deduplicator {
    /// Creates the deduplicator, loading previously persisted filter state
    /// when the configured state file exists.
    pub fn new(conc_db: Arc<dyn ConcArchiveStore>, conf: &ArchiverConfig) -> Result<Self> {
        let filter = Bloom::new_for_fp_rate(BLOOM_FILTER_NUM_ITEMS, BLOOM_FILTER_PROB_COLLISION);
        let dd = Self {
            known_ids: RwLock::new(filter),
            conc_db,
            conf: conf.clone(),
        };
        if Path::new(&conf.dd_state_file_path).is_file() {
            dd.load_from_disk()
                .context("failed to init deduplicator")?;
            tracing::info!(
                file = %conf.dd_state_file_path,
                "loaded previously stored dedup. state"
            );
        }
        Ok(dd)
    }

    /// Writes the current filter state to the configured file.
    pub fn store_to_disk(&self) -> Result<()> {
        let snapshot = {
            let filter = self.known_ids.read();
            FilterSnapshot {
                bitmap: filter.bitmap(),
                bitmap_bits: filter.number_of_bits(),
                k_num: filter.number_of_hash_functions(),
                sip_keys: filter.sip_keys(),
            }
        };
        let encoded = bincode::serde::encode_to_vec(&snapshot, bincode::config::standard())
            .context("failed to store deduplicator state to disk")?;
        std::fs::write(&self.conf.dd_state_file_path, encoded)
            .context("failed to store deduplicator state to disk")?;
        Ok(())
    }

    pub fn load_from_disk(&self) -> Result<()> {
        let raw = std::fs::read(&self.conf.dd_state_file_path)
            .context("failed to load deduplicator state from disk")?;
        let (snapshot, _): (FilterSnapshot, usize) =
            bincode::serde::decode_from_slice(&raw, bincode::config::standard())
                .context("failed to load deduplicator state from disk")?;
        let filter = Bloom::from_existing(
            &snapshot.bitmap,
            snapshot.bitmap_bits,
            snapshot.k_num,
            snapshot.sip_keys,
        );
        *self.known_ids.write() = filter;
        Ok(())
    }

    pub fn add(&self, conc_id: &str) {
        self.known_ids.write().set(&conc_id.to_owned());
    }

    pub fn test_record(&self, conc_id: &str) -> bool {
        self.known_ids.read().check(&conc_id.to_owned())
    }

    /// Clears the filter and, when configured, re-seeds it with the most
    /// recently created archive ids.
    pub async fn reset(&self) -> Result<()> {
        tracing::warn!("performing deduplicator reset");
        self.known_ids.write().clear();
        if self.conf.preload_last_n_items > 0 {
            self.preload_last_n_items().await?;
        }
        Ok(())
    }

    pub async fn preload_last_n_items(&self) -> Result<()> {
        let items = self
            .conc_db
            .load_recent_n_records(self.conf.preload_last_n_items)
            .await
            .context("deduplicator failed to preload last N items")?;
        {
            let mut filter = self.known_ids.write();
            for item in &items {
                filter.set(&item.id);
            }
        }
        tracing::debug!(
            num_items = self.conf.preload_last_n_items,
            "preloaded items for better deduplication"
        );
        Ok(())
    }

    /// Tests whether the record was recently archived and repairs the
    /// archive if so.
    ///
    /// Returns `None` when the record is certainly new (or the positive was
    /// a filter false positive), `Some(merged)` when same-id rows existed
    /// and were collapsed into one merged row. The merged row's payload is
    /// the canonical one: the payload shared by the largest group of
    /// existing variants; rows carrying any other payload are logged as
    /// consistency errors and collapsed regardless.
    pub async fn test_and_solve(&self, new_rec: &QueryArchRec) -> Result<Option<QueryArchRec>> {
        if !self.test_record(&new_rec.id) {
            return Ok(None);
        }
        let recs = self
            .conc_db
            .load_records_by_id(&new_rec.id)
            .await
            .with_context(|| format!("failed to deduplicate id {}", new_rec.id))?;
        if recs.is_empty() {
            tracing::warn!(conc_id = %new_rec.id, "possible Bloom filter false positive");
            return Ok(None);
        }
        tracing::debug!(
            conc_id = %new_rec.id,
            num_variants = recs.len(),
            "found archived record"
        );
        let mut query_test: std::collections::HashMap<&str, Vec<&QueryArchRec>> =
            std::collections::HashMap::new();
        for rec in &recs {
            query_test.entry(rec.data.as_str()).or_default().push(rec);
        }
        let (best_rec_key, _) = query_test
            .iter()
            .max_by_key(|(_, v)| v.len())
            .map(|(k, v)| (*k, v.len()))
            .expect("non-empty variant map");
        if query_test.len() > 1 {
            for (k, v) in &query_test {
                if *k == best_rec_key {
                    continue;
                }
                tracing::error!(
                    conc_id = %new_rec.id,
                    query = %v[0].data,
                    "conc. persistence consistency error"
                );
            }
        }
        let canonical: Vec<QueryArchRec> = query_test
            .remove(best_rec_key)
            .expect("canonical group present")
            .into_iter()
            .cloned()
            .collect();
        let mut adjusted = new_rec.clone();
        adjusted.data = canonical[0].data.clone();
        let merged = self.conc_db.merge_in_place(&canonical, &adjusted).await?;
        Ok(Some(merged))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::SubcorpusProps;
    use async_trait::async_trait;
    use chrono::NaiveDateTime;
    use parking_lot::Mutex;
    use tempfile::TempDir;

    /// In-memory archive used to exercise the deduplicator without MySQL.
    #[derive(Default)]
    struct MemArchive {
        rows: Mutex<Vec<QueryArchRec>>,
    }

    #[async_trait]
    impl ConcArchiveStore for MemArchive {
        async fn load_recent_n_records(&self, num: usize) -> Result<Vec<QueryArchRec>> {
            let mut rows = self.rows.lock().clone();
            rows.sort_by(|a, b| b.created.cmp(&a.created));
            rows.truncate(num);
            Ok(rows)
        }

        async fn load_records_from_date(
            &self,
            from_date: NaiveDateTime,
            max_items: usize,
        ) -> Result<Vec<QueryArchRec>> {
            let mut rows: Vec<_> = self
                .rows
                .lock()
                .iter()
                .filter(|r| r.created >= from_date)
                .cloned()
                .collect();
            rows.sort_by(|a, b| a.created.cmp(&b.created));
            rows.truncate(max_items);
            Ok(rows)
        }

        async fn contains_record(&self, conc_id: &str) -> Result<bool> {
            Ok(self.rows.lock().iter().any(|r| r.id == conc_id))
        }

        async fn load_records_by_id(&self, conc_id: &str) -> Result<Vec<QueryArchRec>> {
            Ok(self
                .rows
                .lock()
                .iter()
                .filter(|r| r.id == conc_id)
                .cloned()
                .collect())
        }

        async fn insert_record(&self, rec: &QueryArchRec) -> Result<()> {
            self.rows.lock().push(rec.clone());
            Ok(())
        }

        async fn update_record_status(&self, id: &str, status: i32) -> Result<()> {
            for r in self.rows.lock().iter_mut().filter(|r| r.id == id) {
                r.permanent = status;
            }
            Ok(())
        }

        async fn remove_records_by_id(&self, conc_id: &str) -> Result<()> {
            self.rows.lock().retain(|r| r.id != conc_id);
            Ok(())
        }

        async fn merge_in_place(
            &self,
            curr: &[QueryArchRec],
            rec: &QueryArchRec,
        ) -> Result<QueryArchRec> {
            let merged = crate::models::merge_records(curr, rec);
            self.remove_records_by_id(&rec.id).await?;
            self.insert_record(&merged).await?;
            Ok(merged)
        }

        async fn get_arch_sizes_by_years(&self, _force_load: bool) -> Result<Vec<(i32, i64)>> {
            Ok(vec![])
        }

        async fn get_subcorpus_props(&self, _subc_id: &str) -> Result<SubcorpusProps> {
            Ok(SubcorpusProps::default())
        }

        async fn get_corpus_size(&self, _corpname: &str) -> Result<i64> {
            Ok(0)
        }

        async fn get_subcorpus_size(&self, _subc_id: &str) -> Result<i64> {
            Ok(0)
        }
    }

    fn test_conf(state_dir: &TempDir) -> ArchiverConfig {
        ArchiverConfig {
            dd_state_file_path: state_dir
                .path()
                .join("dd_state.bin")
                .to_string_lossy()
                .into_owned(),
            check_interval_secs: 61,
            check_interval_chunk: 100,
            preload_last_n_items: 10,
        }
    }

    fn rec(id: &str, data: &str) -> QueryArchRec {
        let now = chrono::Local::now().naive_local();
        QueryArchRec {
            id: id.to_owned(),
            data: data.to_owned(),
            created: now,
            num_access: 0,
            last_access: now,
            permanent: 0,
        }
    }

    #[test]
    fn add_then_test_is_positive() {
        let tmp = TempDir::new().unwrap();
        let dd = Deduplicator::new(Arc::new(MemArchive::default()), &test_conf(&tmp)).unwrap();
        assert!(!dd.test_record("ABC123"));
        dd.add("ABC123");
        assert!(dd.test_record("ABC123"));
    }

    #[test]
    fn state_survives_store_and_reload() {
        let tmp = TempDir::new().unwrap();
        let conf = test_conf(&tmp);
        {
            let dd = Deduplicator::new(Arc::new(MemArchive::default()), &conf).unwrap();
            dd.add("ABC123");
            dd.add("DEF456");
            dd.store_to_disk().unwrap();
        }
        let dd2 = Deduplicator::new(Arc::new(MemArchive::default()), &conf).unwrap();
        assert!(dd2.test_record("ABC123"));
        assert!(dd2.test_record("DEF456"));
    }

    #[tokio::test]
    async fn reset_clears_and_preloads_recent_ids() {
        let tmp = TempDir::new().unwrap();
        let archive = Arc::new(MemArchive::default());
        archive.insert_record(&rec("RECENT1", "{}")).await.unwrap();
        archive.insert_record(&rec("RECENT2", "{}")).await.unwrap();
        let dd = Deduplicator::new(archive, &test_conf(&tmp)).unwrap();
        dd.add("STALE");
        dd.reset().await.unwrap();
        assert!(dd.test_record("RECENT1"));
        assert!(dd.test_record("RECENT2"));
    }

    #[tokio::test]
    async fn negative_membership_short_circuits() {
        let tmp = TempDir::new().unwrap();
        let dd = Deduplicator::new(Arc::new(MemArchive::default()), &test_conf(&tmp)).unwrap();
        let ans = dd.test_and_solve(&rec("NEW1", "{}")).await.unwrap();
        assert!(ans.is_none());
    }

    #[tokio::test]
    async fn false_positive_is_treated_as_negative() {
        let tmp = TempDir::new().unwrap();
        let dd = Deduplicator::new(Arc::new(MemArchive::default()), &test_conf(&tmp)).unwrap();
        // filter knows the id but the archive holds no rows
        dd.add("GHOST1");
        let ans = dd.test_and_solve(&rec("GHOST1", "{}")).await.unwrap();
        assert!(ans.is_none());
    }

    #[tokio::test]
    async fn matching_rows_are_collapsed_into_one() {
        let tmp = TempDir::new().unwrap();
        let archive = Arc::new(MemArchive::default());
        archive.insert_record(&rec("DUP1", "{\"q\": []}")).await.unwrap();
        archive.insert_record(&rec("DUP1", "{\"q\": []}")).await.unwrap();
        let dd = Deduplicator::new(archive.clone(), &test_conf(&tmp)).unwrap();
        dd.add("DUP1");

        let merged = dd
            .test_and_solve(&rec("DUP1", "{\"q\": []}"))
            .await
            .unwrap()
            .expect("match");
        assert_eq!(merged.num_access, 1);
        let remaining = archive.load_records_by_id("DUP1").await.unwrap();
        assert_eq!(remaining.len(), 1);
    }

    #[tokio::test]
    async fn canonical_payload_wins_over_minority_variant() {
        let tmp = TempDir::new().unwrap();
        let archive = Arc::new(MemArchive::default());
        archive.insert_record(&rec("MIX1", "{\"v\": 1}")).await.unwrap();
        archive.insert_record(&rec("MIX1", "{\"v\": 1}")).await.unwrap();
        archive.insert_record(&rec("MIX1", "{\"v\": 2}")).await.unwrap();
        let dd = Deduplicator::new(archive.clone(), &test_conf(&tmp)).unwrap();
        dd.add("MIX1");

        let merged = dd
            .test_and_solve(&rec("MIX1", "{\"v\": 9}"))
            .await
            .unwrap()
            .expect("match");
        assert_eq!(merged.data, "{\"v\": 1}");
        let remaining = archive.load_records_by_id("MIX1").await.unwrap();
        assert_eq!(remaining.len(), 1);
        assert_eq!(remaining[0].data, "{\"v\": 1}");
    }
}
