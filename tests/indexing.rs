//! End-to-end test of the record→document→index pipeline: a history entry
//! with a stored concordance payload is transformed, indexed, found by a
//! user-scoped search and removed again. Runs against a temp-dir index
//! without any external services.

use std::collections::HashMap;
use std::sync::Arc;

use anyhow::Result;
use async_trait::async_trait;
use chrono::NaiveDateTime;
use parking_lot::Mutex;
use tempfile::TempDir;

use conarc::archstore::ConcArchiveStore;
use conarc::config::IndexerConfig;
use conarc::error::ArchiveError;
use conarc::indexer::{FieldPredicate, Indexer, Requirement};
use conarc::models::{HistoryRecord, QueryArchRec, SubcorpusProps};
use conarc::transform::ConcRecordSource;

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
        let merged = conarc::models::merge_records(curr, rec);
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

struct MemConcSource {
    recs: Mutex<HashMap<String, String>>,
}

#[async_trait]
impl ConcRecordSource for MemConcSource {
    async fn get_conc_record(&self, id: &str) -> Result<QueryArchRec> {
        let data = self
            .recs
            .lock()
            .get(id)
            .cloned()
            .ok_or(ArchiveError::RecordNotFound)?;
        let now = chrono::Local::now().naive_local();
        Ok(QueryArchRec {
            id: id.to_owned(),
            data,
            created: now,
            num_access: 0,
            last_access: now,
            permanent: 0,
        })
    }
}

fn indexer_conf(dir: &TempDir) -> IndexerConfig {
    IndexerConfig {
        index_dir_path: dir.path().join("ft").to_string_lossy().into_owned(),
        query_history_num_preserve: 100,
        query_history_cleanup_interval: "30s".to_owned(),
        query_history_mark_pending_interval: "12h".to_owned(),
        query_history_max_num_delete_at_once: 20,
    }
}

const CONC_PAYLOAD: &str = r#"{
    "id": "ABC123",
    "user_id": 7,
    "corpora": ["corpC"],
    "usesubcorp": "",
    "lastop_form": {
        "form_type": "query",
        "curr_queries": {"corpC": "[lemma=\"x\"]"},
        "curr_query_types": {"corpC": "advanced"},
        "selected_text_types": {}
    }
}"#;

fn history_entry(name: Option<&str>) -> HistoryRecord {
    HistoryRecord {
        query_id: "ABC123".to_owned(),
        user_id: 7,
        created: 1700000000,
        name: name.map(str::to_owned),
        rec: None,
    }
}

#[tokio::test]
async fn history_entry_is_indexed_and_searchable() {
    let tmp = TempDir::new().unwrap();
    let arch = Arc::new(MemArchive::default());
    let src = Arc::new(MemConcSource {
        recs: Mutex::new(HashMap::from([(
            "ABC123".to_owned(),
            CONC_PAYLOAD.to_owned(),
        )])),
    });
    let indexer = Indexer::open(&indexer_conf(&tmp), arch, src)
        .await
        .unwrap();

    let hrec = history_entry(Some("my saved query"));
    assert!(indexer.index_record(&hrec).await.unwrap());
    assert_eq!(indexer.count(), 1);

    // the index key follows <user_id>/<created>/<query_id>
    let hits = indexer.search("+user_id:7 lemma", 10, &[], &[]).await.unwrap();
    assert_eq!(hits.len(), 1);
    assert_eq!(
        hits[0].fields["index_id"][0].as_str().unwrap(),
        "7/1700000000/ABC123"
    );
    assert_eq!(hits[0].fields["doc_type"][0].as_str().unwrap(), "conc");

    // another user's scope stays empty
    let hits = indexer.search("+user_id:9 lemma", 10, &[], &[]).await.unwrap();
    assert!(hits.is_empty());
}

#[tokio::test]
async fn reindexing_the_same_entry_is_an_upsert() {
    let tmp = TempDir::new().unwrap();
    let arch = Arc::new(MemArchive::default());
    let src = Arc::new(MemConcSource {
        recs: Mutex::new(HashMap::from([(
            "ABC123".to_owned(),
            CONC_PAYLOAD.to_owned(),
        )])),
    });
    let indexer = Indexer::open(&indexer_conf(&tmp), arch, src)
        .await
        .unwrap();

    indexer.index_record(&history_entry(None)).await.unwrap();
    indexer.index_record(&history_entry(None)).await.unwrap();
    assert_eq!(indexer.count(), 1);
}

#[tokio::test]
async fn payload_falls_back_to_the_archive_when_expired_from_redis() {
    let tmp = TempDir::new().unwrap();
    let arch = Arc::new(MemArchive::default());
    let now = chrono::Local::now().naive_local();
    arch.insert_record(&QueryArchRec {
        id: "ABC123".to_owned(),
        data: CONC_PAYLOAD.to_owned(),
        created: now,
        num_access: 0,
        last_access: now,
        permanent: 0,
    })
    .await
    .unwrap();
    let src = Arc::new(MemConcSource {
        recs: Mutex::new(HashMap::new()),
    });
    let indexer = Indexer::open(&indexer_conf(&tmp), arch, src)
        .await
        .unwrap();

    assert!(indexer.index_record(&history_entry(None)).await.unwrap());
    assert_eq!(indexer.count(), 1);
}

#[tokio::test]
async fn deleting_by_index_id_removes_the_document() {
    let tmp = TempDir::new().unwrap();
    let arch = Arc::new(MemArchive::default());
    let src = Arc::new(MemConcSource {
        recs: Mutex::new(HashMap::from([(
            "ABC123".to_owned(),
            CONC_PAYLOAD.to_owned(),
        )])),
    });
    let indexer = Indexer::open(&indexer_conf(&tmp), arch, src)
        .await
        .unwrap();

    let hrec = history_entry(None);
    indexer.index_record(&hrec).await.unwrap();
    indexer.delete(&hrec.index_id()).await.unwrap();
    assert_eq!(indexer.count(), 0);
}

#[tokio::test]
async fn structured_search_filters_by_supertype() {
    let tmp = TempDir::new().unwrap();
    let arch = Arc::new(MemArchive::default());
    let wlist_payload = r#"{
        "id": "WL1",
        "user_id": 7,
        "corpora": ["corpC"],
        "form": {"form_type": "wlist", "wlpat": ".*ice", "wlattr": "word"}
    }"#;
    let src = Arc::new(MemConcSource {
        recs: Mutex::new(HashMap::from([
            ("ABC123".to_owned(), CONC_PAYLOAD.to_owned()),
            ("WL1".to_owned(), wlist_payload.to_owned()),
        ])),
    });
    let indexer = Indexer::open(&indexer_conf(&tmp), arch, src)
        .await
        .unwrap();

    indexer.index_record(&history_entry(None)).await.unwrap();
    indexer
        .index_record(&HistoryRecord {
            query_id: "WL1".to_owned(),
            user_id: 7,
            created: 1700000100,
            name: None,
            rec: None,
        })
        .await
        .unwrap();
    assert_eq!(indexer.count(), 2);

    let hits = indexer
        .search_predicates(
            &[
                FieldPredicate {
                    field: "user_id".to_owned(),
                    value: "7".to_owned(),
                    requirement: Requirement::Must,
                    is_wildcard: false,
                },
                FieldPredicate {
                    field: "query_supertype".to_owned(),
                    value: "wlist".to_owned(),
                    requirement: Requirement::Must,
                    is_wildcard: false,
                },
            ],
            10,
            &[],
            &[],
        )
        .await
        .unwrap();
    assert_eq!(hits.len(), 1);
    assert_eq!(hits[0].fields["id"][0].as_str().unwrap(), "WL1");
}

#[tokio::test]
async fn non_indexable_records_are_skipped_quietly() {
    let tmp = TempDir::new().unwrap();
    let arch = Arc::new(MemArchive::default());
    let shuffle_payload = r#"{
        "id": "SH1", "user_id": 7, "corpora": ["corpC"],
        "lastop_form": {"form_type": "shuffle"}
    }"#;
    let src = Arc::new(MemConcSource {
        recs: Mutex::new(HashMap::from([(
            "SH1".to_owned(),
            shuffle_payload.to_owned(),
        )])),
    });
    let indexer = Indexer::open(&indexer_conf(&tmp), arch, src)
        .await
        .unwrap();

    let indexed = indexer
        .index_record(&HistoryRecord {
            query_id: "SH1".to_owned(),
            user_id: 7,
            created: 1700000000,
            name: None,
            rec: None,
        })
        .await
        .unwrap();
    assert!(!indexed);
    assert_eq!(indexer.count(), 0);
}
