//! Core data models shared across the archival and indexing pipelines.
//!
//! The data lifecycle is:
//!
//! ```text
//! queue entry → QueryArchRec (payload from Redis) → archive row (MySQL)
//!                          ↓
//!               HistoryRecord → mid document → fulltext index
//! ```
//!
//! # Type relationships
//!
//! - A **[`QueryArchRec`]** is the raw archive row: an opaque JSON payload
//!   plus id and access metadata. It exists both as the Redis value of a
//!   freshly produced query and as a row of the archive table.
//! - A **[`HistoryRecord`]** tags a query as belonging to one user's
//!   history; its [`HistoryRecord::index_id`] is the fulltext document key.
//! - A **[`CorpusBoundRecord`]** is the stats-stream message emitted by the
//!   archiver after a successful archival.

use std::collections::HashMap;

use anyhow::{Context, Result};
use chrono::{Local, NaiveDateTime, Timelike};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Category of a user query. Decides which form decoder and which fulltext
/// document mapping apply to a payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum QuerySupertype {
    /// Concordance query.
    Conc,
    /// Word list query.
    Wlist,
    /// Keywords query.
    Kwords,
    /// Paradigmatic query.
    Pquery,
}

impl QuerySupertype {
    /// Maps a payload's `form_type` discriminator to a supertype.
    /// Unknown form types (e.g. intermediate shuffle/filter operations)
    /// yield `None` — such records are not indexable.
    pub fn from_form_type(ft: &str) -> Option<Self> {
        match ft {
            "query" => Some(Self::Conc),
            "wlist" => Some(Self::Wlist),
            "kwords" => Some(Self::Kwords),
            "pquery" => Some(Self::Pquery),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Conc => "conc",
            Self::Wlist => "wlist",
            Self::Kwords => "kwords",
            Self::Pquery => "pquery",
        }
    }
}

impl std::fmt::Display for QuerySupertype {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A single user-written query with its input mode (`advanced` queries are
/// CQL and go through property extraction; `simple` queries carry a
/// pre-parsed structure inside the form).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RawQuery {
    pub value: String,
    #[serde(rename = "type")]
    pub query_type: String,
}

/// Raw archive record as stored in Redis and in the archive table.
///
/// `data` is an opaque JSON payload to the archival loop; the indexer decodes
/// it via [`GeneralPayload`] and the typed form records in `transform`.
///
/// `permanent` values: 0 = ordinary, 1 = user-pinned, −1 = error-tagged.
#[derive(Debug, Clone, PartialEq)]
pub struct QueryArchRec {
    pub id: String,
    pub data: String,
    pub created: NaiveDateTime,
    pub num_access: i64,
    pub last_access: NaiveDateTime,
    pub permanent: i32,
}

impl QueryArchRec {
    /// Parses the raw JSON payload into the most general representation,
    /// able to answer common questions (corpora, subcorpus, q) no matter
    /// which query supertype produced the record.
    pub fn fetch_data(&self) -> Result<GeneralPayload> {
        let value: serde_json::Value =
            serde_json::from_str(&self.data).context("failed to fetch archive record data")?;
        Ok(GeneralPayload(value))
    }
}

/// Untyped view over an archive payload.
///
/// All accessors are lenient: a missing or wrongly typed attribute yields an
/// empty value rather than an error, because payloads from older workbench
/// versions may lack attributes newer ones carry.
#[derive(Debug, Clone)]
pub struct GeneralPayload(pub serde_json::Value);

impl GeneralPayload {
    pub fn corpora(&self) -> Vec<String> {
        self.0
            .get("corpora")
            .and_then(|v| v.as_array())
            .map(|items| {
                items
                    .iter()
                    .filter_map(|it| it.as_str().map(str::to_owned))
                    .collect()
            })
            .unwrap_or_default()
    }

    pub fn subcorpus(&self) -> String {
        self.0
            .get("usesubcorp")
            .and_then(|v| v.as_str())
            .unwrap_or_default()
            .to_owned()
    }

    /// The normalized query operation chain (`q` attribute).
    pub fn q(&self) -> Vec<String> {
        self.0
            .get("q")
            .and_then(|v| v.as_array())
            .map(|items| {
                items
                    .iter()
                    .filter_map(|it| it.as_str().map(str::to_owned))
                    .collect()
            })
            .unwrap_or_default()
    }

    pub fn prev_id(&self) -> String {
        self.0
            .get("prev_id")
            .and_then(|v| v.as_str())
            .unwrap_or_default()
            .to_owned()
    }

    /// The workbench marks operations it expects to run long with
    /// `lastop_form.treat_as_slow_query`.
    pub fn is_flagged_as_slow(&self) -> bool {
        self.0
            .get("lastop_form")
            .and_then(|f| f.get("treat_as_slow_query"))
            .and_then(|v| v.as_bool())
            .unwrap_or(false)
    }

    pub fn remove_slow_flag(&mut self) {
        if let Some(form) = self
            .0
            .get_mut("lastop_form")
            .and_then(|f| f.as_object_mut())
        {
            form.remove("treat_as_slow_query");
        }
    }
}

/// Per-user history tag referring to an archived query.
///
/// `name` being set means the user saved the entry; named entries are never
/// garbage-collected. `rec` carries the resolved payload when the record
/// travels through the indexing stream.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HistoryRecord {
    pub query_id: String,
    pub user_id: i64,
    pub created: i64,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(skip)]
    pub rec: Option<QueryArchRec>,
}

impl HistoryRecord {
    /// The fulltext index document key: `<user_id>/<created>/<query_id>`.
    pub fn index_id(&self) -> String {
        format!("{}/{}/{}", self.user_id, self.created, self.query_id)
    }
}

/// Stats-stream message: an archived record annotated with its primary
/// corpus and that corpus' total size.
#[derive(Debug, Clone)]
pub struct CorpusBoundRecord {
    pub rec: QueryArchRec,
    pub corpname: String,
    pub corpus_size: i64,
}

/// Resolved subcorpus properties: the user-defined name plus the text-type
/// restrictions which augment a query's own structural attributes.
#[derive(Debug, Clone, Default)]
pub struct SubcorpusProps {
    pub name: String,
    pub text_types: HashMap<String, Vec<String>>,
}

/// Local hours 22..=23 and 0..=5 permit heavier cleaner batches and the
/// unbounded year-stats query.
pub fn time_is_at_night(t: NaiveDateTime) -> bool {
    let hour = t.hour();
    hour >= 22 || hour <= 5
}

/// Collapses a set of same-id archive rows plus a new incoming record into
/// a single merged row:
///
/// - `num_access` = incoming + 1 + Σ existing
/// - `created` = earliest known non-zero creation time
/// - `last_access` = latest of all access times and now
/// - `permanent` = max over all inputs
/// - `data` = the incoming record's payload (callers substitute the
///   canonical payload before merging)
pub fn merge_records(existing: &[QueryArchRec], new_rec: &QueryArchRec) -> QueryArchRec {
    let mut ans = new_rec.clone();
    ans.num_access += 1;
    ans.last_access = Local::now().naive_local();
    for rec in existing {
        ans.num_access += rec.num_access;
        if rec.created < ans.created && rec.created.and_utc().timestamp() != 0 {
            ans.created = rec.created;
        }
        if rec.last_access > ans.last_access {
            ans.last_access = rec.last_access;
        }
        if rec.permanent > ans.permanent {
            ans.permanent = rec.permanent;
        }
    }
    ans
}

/// Checks that all same-id variants encode the same query.
///
/// Variants are keyed by their normalized query tokens (the payload's `q`
/// chain joined by spaces); a variant whose payload cannot be parsed still
/// counts as a distinct variant (keyed by a random value). More than one
/// distinct key means the archive holds inconsistent data for the id.
pub fn validate_query_instances(variants: &[QueryArchRec]) -> Result<()> {
    if variants.len() < 2 {
        return Ok(());
    }
    let mut query_variants: HashMap<String, usize> = HashMap::new();
    for vr in variants {
        let key = match vr.fetch_data() {
            Ok(data) => data.q().join(" "),
            Err(_) => Uuid::new_v4().to_string(),
        };
        *query_variants.entry(key).or_insert(0) += 1;
    }
    if query_variants.len() > 1 {
        anyhow::bail!(
            "inconsistent variants of query between instances (id {}) - found {} variants",
            variants[0].id,
            query_variants.len()
        );
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::NaiveDate;

    fn dt(y: i32, m: u32, d: u32, h: u32) -> NaiveDateTime {
        NaiveDate::from_ymd_opt(y, m, d)
            .unwrap()
            .and_hms_opt(h, 0, 0)
            .unwrap()
    }

    fn rec(id: &str, data: &str, created: NaiveDateTime, num_access: i64) -> QueryArchRec {
        QueryArchRec {
            id: id.to_owned(),
            data: data.to_owned(),
            created,
            num_access,
            last_access: created,
            permanent: 0,
        }
    }

    #[test]
    fn merge_sums_access_counts_and_keeps_earliest_created() {
        let existing = vec![
            rec("q1", "{}", dt(2023, 5, 1, 10), 3),
            rec("q1", "{}", dt(2023, 4, 1, 10), 2),
        ];
        let new_rec = rec("q1", "{}", dt(2024, 1, 1, 10), 0);
        let merged = merge_records(&existing, &new_rec);
        assert_eq!(merged.num_access, 0 + 1 + 3 + 2);
        assert_eq!(merged.created, dt(2023, 4, 1, 10));
        assert!(merged.last_access >= dt(2024, 1, 1, 10));
    }

    #[test]
    fn merge_takes_max_permanent() {
        let mut pinned = rec("q1", "{}", dt(2023, 5, 1, 10), 0);
        pinned.permanent = 1;
        let new_rec = rec("q1", "{}", dt(2024, 1, 1, 10), 0);
        let merged = merge_records(&[pinned], &new_rec);
        assert_eq!(merged.permanent, 1);
    }

    #[test]
    fn duplicate_implicit_archival_yields_two_accesses() {
        // ingesting the same id twice: first insert has num_access = 0,
        // the merge of the second ingest must end at 2
        let first = rec("abc", "{}", dt(2024, 1, 1, 10), 0);
        let second = rec("abc", "{}", dt(2024, 1, 2, 10), 0);
        let merged = merge_records(std::slice::from_ref(&first), &second);
        assert_eq!(merged.num_access, 2);
        assert_eq!(merged.created, dt(2024, 1, 1, 10));
    }

    #[test]
    fn validate_accepts_consistent_variants() {
        let variants = vec![
            rec("q1", r#"{"q": ["aword,[lemma=\"x\"]"]}"#, dt(2024, 1, 1, 0), 0),
            rec("q1", r#"{"q": ["aword,[lemma=\"x\"]"]}"#, dt(2024, 1, 2, 0), 1),
        ];
        assert!(validate_query_instances(&variants).is_ok());
    }

    #[test]
    fn validate_rejects_diverging_variants() {
        let variants = vec![
            rec("q1", r#"{"q": ["aword,[lemma=\"x\"]"]}"#, dt(2024, 1, 1, 0), 0),
            rec("q1", r#"{"q": ["aword,[lemma=\"y\"]"]}"#, dt(2024, 1, 2, 0), 1),
        ];
        assert!(validate_query_instances(&variants).is_err());
    }

    #[test]
    fn single_variant_is_always_consistent() {
        let variants = vec![rec("q1", "not json at all", dt(2024, 1, 1, 0), 0)];
        assert!(validate_query_instances(&variants).is_ok());
    }

    #[test]
    fn night_window_covers_late_and_early_hours() {
        assert!(time_is_at_night(dt(2024, 1, 1, 22)));
        assert!(time_is_at_night(dt(2024, 1, 1, 23)));
        assert!(time_is_at_night(dt(2024, 1, 1, 0)));
        assert!(time_is_at_night(dt(2024, 1, 1, 5)));
        assert!(!time_is_at_night(dt(2024, 1, 1, 6)));
        assert!(!time_is_at_night(dt(2024, 1, 1, 21)));
    }

    #[test]
    fn payload_accessors_are_lenient() {
        let payload = GeneralPayload(serde_json::json!({
            "corpora": ["syn2020", "intercorp_en"],
            "usesubcorp": "abc123",
            "q": ["q[lemma=\"voda\"]"],
            "lastop_form": {"treat_as_slow_query": true}
        }));
        assert_eq!(payload.corpora(), vec!["syn2020", "intercorp_en"]);
        assert_eq!(payload.subcorpus(), "abc123");
        assert_eq!(payload.q(), vec!["q[lemma=\"voda\"]"]);
        assert_eq!(payload.prev_id(), "");
        assert!(payload.is_flagged_as_slow());

        let empty = GeneralPayload(serde_json::json!({}));
        assert!(empty.corpora().is_empty());
        assert_eq!(empty.subcorpus(), "");
        assert!(!empty.is_flagged_as_slow());
    }

    #[test]
    fn remove_slow_flag_strips_the_marker() {
        let mut payload = GeneralPayload(serde_json::json!({
            "lastop_form": {"form_type": "query", "treat_as_slow_query": true}
        }));
        payload.remove_slow_flag();
        assert!(!payload.is_flagged_as_slow());
        // the rest of the form survives
        assert_eq!(
            payload.0["lastop_form"]["form_type"].as_str(),
            Some("query")
        );
    }

    #[test]
    fn index_id_joins_user_created_and_query() {
        let h = HistoryRecord {
            query_id: "AbC123xyz".to_owned(),
            user_id: 7,
            created: 1700000000,
            name: None,
            rec: None,
        };
        assert_eq!(h.index_id(), "7/1700000000/AbC123xyz");
    }
}
