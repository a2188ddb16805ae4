//! Fulltext index over user query history.
//!
//! Built on Tantivy with a single flat schema covering all four query
//! supertypes (the `doc_type` field discriminates). Two custom analyzers
//! are registered:
//!
//! | Analyzer | Tokenization | Used for |
//! |---|---|---|
//! | `conarc_label` | splits on whitespace and stop characters, lowercases | corpora, subcorpus, structures, attribute names |
//! | `conarc_query` | splits on whitespace, lowercases | raw queries, attribute values, filter words |
//!
//! Writes are upserts keyed by the document's index id
//! (`<user_id>/<created>/<query_id>`); indexing the same history record
//! twice yields one document. The underlying engine is concurrency-safe for
//! concurrent reads and writes; the writer handle is serialized behind a
//! mutex.

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use tantivy::collector::TopDocs;
use tantivy::query::{BooleanQuery, Occur, Query, QueryParser, RegexQuery, TermQuery};
use tantivy::schema::{
    DateOptions, Field, IndexRecordOption, Schema, TextFieldIndexing, TextOptions, Value, INDEXED,
    STORED, STRING,
};
use tantivy::tokenizer::{LowerCaser, RegexTokenizer, TextAnalyzer, WhitespaceTokenizer};
use tantivy::{Document, Index, IndexReader, IndexWriter, ReloadPolicy, TantivyDocument, Term};
use tokio::sync::{mpsc, watch, Mutex};
use tokio::task::JoinHandle;

use crate::archstore::ConcArchiveStore;
use crate::config::IndexerConfig;
use crate::docs::{IndexableDoc, MidDoc};
use crate::error::{is_not_found, is_not_indexable, ArchiveError};
use crate::kvstore::RedisAdapter;
use crate::models::HistoryRecord;
use crate::transform::{rec_to_mid_doc, ConcRecordSource};

/// Heap for the Tantivy index writer.
const WRITER_HEAP_BYTES: usize = 50_000_000;

/// Opening an existing index blocks on its lock file; a stale lock from a
/// dead instance must surface as a startup failure, not a hang.
const OPEN_TIMEOUT: Duration = Duration::from_secs(10);

/// Characters the label analyzer treats as token breaks (besides
/// whitespace). Label-like values (text types, corpus names) should be
/// searchable without their punctuation.
const LABEL_STOP_CHARS: &str = ":;,#?!.%$@()*[]\"'~/|+=-_^&<>";

const LABEL_ANALYZER: &str = "conarc_label";
const QUERY_ANALYZER: &str = "conarc_query";

/// Resolved handles of all schema fields.
#[derive(Clone, Copy)]
struct Fields {
    index_id: Field,
    id: Field,
    doc_type: Field,
    name: Field,
    query_supertype: Field,
    created: Field,
    user_id: Field,
    corpora: Field,
    subcorpus: Field,
    raw_query: Field,
    structures: Field,
    struct_attr_names: Field,
    struct_attr_values: Field,
    pos_attr_names: Field,
    pos_attr_values: Field,
    pfilter_words: Field,
    nfilter_words: Field,
}

fn build_schema() -> Schema {
    let mut builder = Schema::builder();
    let label = || {
        TextOptions::default()
            .set_indexing_options(
                TextFieldIndexing::default()
                    .set_tokenizer(LABEL_ANALYZER)
                    .set_index_option(IndexRecordOption::WithFreqsAndPositions),
            )
            .set_stored()
    };
    let query = || {
        TextOptions::default()
            .set_indexing_options(
                TextFieldIndexing::default()
                    .set_tokenizer(QUERY_ANALYZER)
                    .set_index_option(IndexRecordOption::WithFreqsAndPositions),
            )
            .set_stored()
    };
    builder.add_text_field("index_id", STRING | STORED);
    builder.add_text_field("id", STRING | STORED);
    builder.add_text_field("doc_type", STRING | STORED);
    builder.add_text_field("name", label());
    builder.add_text_field("query_supertype", STRING | STORED);
    builder.add_date_field("created", DateOptions::from(INDEXED).set_stored().set_fast());
    builder.add_text_field("user_id", STRING | STORED);
    builder.add_text_field("corpora", label());
    builder.add_text_field("subcorpus", label());
    builder.add_text_field("raw_query", query());
    builder.add_text_field("structures", label());
    builder.add_text_field("struct_attr_names", label());
    builder.add_text_field("struct_attr_values", label());
    builder.add_text_field("pos_attr_names", label());
    builder.add_text_field("pos_attr_values", query());
    builder.add_text_field("pfilter_words", query());
    builder.add_text_field("nfilter_words", query());
    builder.build()
}

fn resolve_fields(schema: &Schema) -> Result<Fields> {
    let f = |name: &str| -> Result<Field> {
        schema
            .get_field(name)
            .with_context(|| format!("missing schema field {}", name))
    };
    Ok(Fields {
        index_id: f("index_id")?,
        id: f("id")?,
        doc_type: f("doc_type")?,
        name: f("name")?,
        query_supertype: f("query_supertype")?,
        created: f("created")?,
        user_id: f("user_id")?,
        corpora: f("corpora")?,
        subcorpus: f("subcorpus")?,
        raw_query: f("raw_query")?,
        structures: f("structures")?,
        struct_attr_names: f("struct_attr_names")?,
        struct_attr_values: f("struct_attr_values")?,
        pos_attr_names: f("pos_attr_names")?,
        pos_attr_values: f("pos_attr_values")?,
        pfilter_words: f("pfilter_words")?,
        nfilter_words: f("nfilter_words")?,
    })
}

fn register_tokenizers(index: &Index) -> Result<()> {
    let label_pattern = format!(
        "[^\\s{}]+",
        LABEL_STOP_CHARS
            .chars()
            .map(|c| if c == '<' || c == '>' {
                c.to_string()
            } else {
                format!("\\{}", c)
            })
            .collect::<String>()
    );
    let label_tokenizer =
        RegexTokenizer::new(&label_pattern).context("failed to build label tokenizer")?;
    index.tokenizers().register(
        LABEL_ANALYZER,
        TextAnalyzer::builder(label_tokenizer)
            .filter(LowerCaser)
            .build(),
    );
    index.tokenizers().register(
        QUERY_ANALYZER,
        TextAnalyzer::builder(WhitespaceTokenizer::default())
            .filter(LowerCaser)
            .build(),
    );
    Ok(())
}

/// How a predicate participates in the boolean query.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Requirement {
    #[serde(rename = "must")]
    Must,
    #[serde(rename = "must-not")]
    MustNot,
    #[serde(rename = "should")]
    Should,
}

/// One field constraint of a structured search. A wildcard predicate
/// matches the value anywhere inside the field (the value is wrapped in
/// stars before submission to the engine).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FieldPredicate {
    pub field: String,
    pub value: String,
    pub requirement: Requirement,
    #[serde(default)]
    pub is_wildcard: bool,
}

/// One search hit: the engine score plus the requested stored fields.
#[derive(Debug, Serialize)]
pub struct SearchHit {
    pub score: f32,
    pub fields: serde_json::Value,
}

/// The fulltext indexer: schema, analyzers, reader/writer pair and the
/// record→document pipeline.
pub struct Indexer {
    index: Index,
    reader: IndexReader,
    writer: Mutex<IndexWriter>,
    fields: Fields,
    schema: Schema,
    arch_db: Arc<dyn ConcArchiveStore>,
    conc_src: Arc<dyn ConcRecordSource>,
}

impl Indexer {
    /// Opens the on-disk index, creating it with the schema above when
    /// missing. Blocking work (directory open, lock acquisition) runs under
    /// [`OPEN_TIMEOUT`]; a timeout indicates a stale writer lock from a
    /// previous instance and aborts startup.
    pub async fn open(
        conf: &IndexerConfig,
        arch_db: Arc<dyn ConcArchiveStore>,
        conc_src: Arc<dyn ConcRecordSource>,
    ) -> Result<Self> {
        let dir = conf.index_dir_path.clone();
        let opened = tokio::time::timeout(
            OPEN_TIMEOUT,
            tokio::task::spawn_blocking(move || open_or_create_index(&dir)),
        )
        .await;
        let (index, created) = match opened {
            Err(_) => return Err(ArchiveError::IndexOpenTimeout.into()),
            Ok(join) => join.context("index open task failed")??,
        };
        if created {
            tracing::info!(dir = %conf.index_dir_path, "created new fulltext index");
        }
        register_tokenizers(&index)?;
        let schema = index.schema();
        let fields = resolve_fields(&schema)?;
        let writer = index
            .writer(WRITER_HEAP_BYTES)
            .context("failed to open index writer")?;
        let reader = index
            .reader_builder()
            .reload_policy(ReloadPolicy::OnCommitWithDelay)
            .try_into()
            .context("failed to open index reader")?;
        Ok(Self {
            index,
            reader,
            writer: Mutex::new(writer),
            fields,
            schema,
            arch_db,
            conc_src,
        })
    }

    /// Number of documents currently in the index.
    pub fn count(&self) -> u64 {
        self.reader.searcher().num_docs()
    }

    /// Transforms a history record into its typed mid document.
    pub async fn rec_to_doc(&self, hrec: &HistoryRecord) -> Result<MidDoc> {
        rec_to_mid_doc(hrec, self.arch_db.as_ref(), self.conc_src.as_ref()).await
    }

    /// Indexes one history record: resolves the payload when it is not
    /// attached yet (key-value store first, archive fallback), transforms
    /// it and upserts the document. Returns `false` when the record is not
    /// indexable (skipped, not an error).
    pub async fn index_record(&self, hrec: &HistoryRecord) -> Result<bool> {
        let mut hrec = hrec.clone();
        if hrec.rec.is_none() {
            match self.conc_src.get_conc_record(&hrec.query_id).await {
                Ok(rec) => hrec.rec = Some(rec),
                Err(err) if is_not_found(&err) => {
                    let recs = self.arch_db.load_records_by_id(&hrec.query_id).await?;
                    match recs.into_iter().next() {
                        Some(rec) => hrec.rec = Some(rec),
                        None => return Err(err),
                    }
                }
                Err(err) => return Err(err),
            }
        }
        let doc = match self.rec_to_doc(&hrec).await {
            Ok(doc) => doc,
            Err(err) if is_not_indexable(&err) => return Ok(false),
            Err(err) => return Err(err),
        };
        self.index_doc(&doc.as_indexable()).await?;
        Ok(true)
    }

    /// Upserts one flattened document under its index id.
    pub async fn index_doc(&self, doc: &IndexableDoc) -> Result<()> {
        let f = self.fields;
        let mut tdoc = TantivyDocument::default();
        tdoc.add_text(f.index_id, &doc.index_id);
        tdoc.add_text(f.id, &doc.id);
        tdoc.add_text(f.doc_type, doc.doc_type);
        tdoc.add_text(f.name, &doc.name);
        tdoc.add_text(f.query_supertype, &doc.query_supertype);
        tdoc.add_date(
            f.created,
            tantivy::DateTime::from_timestamp_secs(doc.created.and_utc().timestamp()),
        );
        tdoc.add_text(f.user_id, &doc.user_id);
        tdoc.add_text(f.corpora, &doc.corpora);
        tdoc.add_text(f.subcorpus, &doc.subcorpus);
        tdoc.add_text(f.raw_query, &doc.raw_query);
        tdoc.add_text(f.structures, &doc.structures);
        tdoc.add_text(f.struct_attr_names, &doc.struct_attr_names);
        tdoc.add_text(f.struct_attr_values, &doc.struct_attr_values);
        tdoc.add_text(f.pos_attr_names, &doc.pos_attr_names);
        tdoc.add_text(f.pos_attr_values, &doc.pos_attr_values);
        tdoc.add_text(f.pfilter_words, &doc.pfilter_words);
        tdoc.add_text(f.nfilter_words, &doc.nfilter_words);

        let mut writer = self.writer.lock().await;
        writer.delete_term(Term::from_field_text(f.index_id, &doc.index_id));
        writer
            .add_document(tdoc)
            .context("failed to add document to index")?;
        writer.commit().context("failed to commit index write")?;
        drop(writer);
        self.reader.reload().context("failed to reload reader")?;
        Ok(())
    }

    /// Removes the document with the given index id; removing a missing
    /// document is a no-op.
    pub async fn delete(&self, index_id: &str) -> Result<()> {
        let mut writer = self.writer.lock().await;
        writer.delete_term(Term::from_field_text(self.fields.index_id, index_id));
        writer.commit().context("failed to commit index delete")?;
        drop(writer);
        self.reader.reload().context("failed to reload reader")?;
        Ok(())
    }

    /// Re-indexes a history record from its stored payload (upsert).
    pub async fn update(&self, hrec: &HistoryRecord) -> Result<()> {
        let mut hrec = hrec.clone();
        hrec.rec = None;
        self.index_record(&hrec).await?;
        Ok(())
    }

    /// Indexes the `num` most recently archived records, attributing each
    /// to its payload's user. Returns the number of records indexed.
    pub async fn index_recent_records(&self, num: usize) -> Result<usize> {
        let recs = self.arch_db.load_recent_n_records(num).await?;
        let mut num_proc = 0;
        for rec in recs {
            let user_id = rec
                .fetch_data()
                .ok()
                .and_then(|d| d.0.get("user_id").and_then(|v| v.as_i64()))
                .unwrap_or(0);
            let hrec = HistoryRecord {
                query_id: rec.id.clone(),
                user_id,
                created: rec.created.and_utc().timestamp(),
                name: None,
                rec: Some(rec),
            };
            match self.index_record(&hrec).await {
                Ok(true) => num_proc += 1,
                Ok(false) => {}
                Err(err) => {
                    tracing::error!(
                        error = %err,
                        query_id = %hrec.query_id,
                        "invalid record"
                    );
                }
            }
        }
        Ok(num_proc)
    }

    /// Searches with the engine's native query-string syntax (`+`/`-`
    /// operators, `field:term` prefixes).
    pub async fn search(
        &self,
        q: &str,
        limit: usize,
        order: &[String],
        fields: &[String],
    ) -> Result<Vec<SearchHit>> {
        let f = self.fields;
        let parser = QueryParser::for_index(
            &self.index,
            vec![
                f.name,
                f.corpora,
                f.subcorpus,
                f.raw_query,
                f.structures,
                f.struct_attr_names,
                f.struct_attr_values,
                f.pos_attr_names,
                f.pos_attr_values,
                f.pfilter_words,
                f.nfilter_words,
            ],
        );
        let query = parser
            .parse_query(q)
            .with_context(|| format!("failed to parse query `{}`", q))?;
        self.run_query(&query, limit, order, fields)
    }

    /// Searches with a structured predicate list.
    pub async fn search_predicates(
        &self,
        predicates: &[FieldPredicate],
        limit: usize,
        order: &[String],
        fields: &[String],
    ) -> Result<Vec<SearchHit>> {
        let mut clauses: Vec<(Occur, Box<dyn Query>)> = Vec::with_capacity(predicates.len());
        for pred in predicates {
            let field = self
                .schema
                .get_field(&pred.field)
                .with_context(|| format!("unknown search field `{}`", pred.field))?;
            let value = self.normalize_term(field, &pred.value);
            let query: Box<dyn Query> = if pred.is_wildcard {
                let pattern = format!(".*{}.*", escape_regex(&value));
                Box::new(
                    RegexQuery::from_pattern(&pattern, field)
                        .with_context(|| format!("invalid wildcard value `{}`", pred.value))?,
                )
            } else {
                Box::new(TermQuery::new(
                    Term::from_field_text(field, &value),
                    IndexRecordOption::Basic,
                ))
            };
            let occur = match pred.requirement {
                Requirement::Must => Occur::Must,
                Requirement::MustNot => Occur::MustNot,
                Requirement::Should => Occur::Should,
            };
            clauses.push((occur, query));
        }
        let query = BooleanQuery::new(clauses);
        self.run_query(&query, limit, order, fields)
    }

    /// Raw (`STRING`) fields keep their exact terms; analyzed fields are
    /// lowercased, matching what the analyzers wrote into the index.
    fn normalize_term(&self, field: Field, value: &str) -> String {
        let entry = self.schema.get_field_entry(field);
        let is_raw = matches!(
            entry.field_type(),
            tantivy::schema::FieldType::Str(opts)
                if opts.get_indexing_options().map(|o| o.tokenizer()) == Some("raw")
        );
        if is_raw {
            value.to_owned()
        } else {
            value.to_lowercase()
        }
    }

    fn run_query(
        &self,
        query: &dyn Query,
        limit: usize,
        order: &[String],
        fields: &[String],
    ) -> Result<Vec<SearchHit>> {
        let searcher = self.reader.searcher();
        let top_docs = searcher
            .search(query, &TopDocs::with_limit(limit.max(1)))
            .context("search failed")?;
        let mut hits: Vec<(f32, i64, TantivyDocument)> = Vec::with_capacity(top_docs.len());
        for (score, addr) in top_docs {
            let doc: TantivyDocument = searcher.doc(addr).context("failed to load hit")?;
            let created = doc
                .get_first(self.fields.created)
                .and_then(|v| v.as_datetime())
                .map(|dt| dt.into_timestamp_secs())
                .unwrap_or(0);
            hits.push((score, created, doc));
        }
        sort_hits(&mut hits, order);
        let ans = hits
            .into_iter()
            .map(|(score, _, doc)| {
                let named = doc.to_named_doc(&self.schema);
                let mut value = serde_json::to_value(&named).unwrap_or_default();
                if !fields.is_empty() {
                    if let serde_json::Value::Object(map) = &mut value {
                        map.retain(|k, _| fields.iter().any(|f| f == k));
                    }
                }
                SearchHit {
                    score,
                    fields: value,
                }
            })
            .collect();
        Ok(ans)
    }
}

/// Applies the requested sort order to a score-ranked result window.
/// Supported keys are `score` and `created`, each with an optional `-`
/// prefix for descending; the default is `[-score, -created]`. Unknown
/// keys are ignored with a warning.
fn sort_hits(hits: &mut [(f32, i64, TantivyDocument)], order: &[String]) {
    let default_order = ["-score".to_owned(), "-created".to_owned()];
    let order: Vec<&String> = if order.is_empty() {
        default_order.iter().collect()
    } else {
        order.iter().collect()
    };
    hits.sort_by(|a, b| {
        for key in &order {
            let (field, desc) = match key.strip_prefix('-') {
                Some(rest) => (rest, true),
                None => (key.as_str(), false),
            };
            let ord = match field {
                "score" => a.0.partial_cmp(&b.0).unwrap_or(std::cmp::Ordering::Equal),
                "created" => a.1.cmp(&b.1),
                other => {
                    tracing::warn!(field = other, "unsupported sort field, ignoring");
                    std::cmp::Ordering::Equal
                }
            };
            let ord = if desc { ord.reverse() } else { ord };
            if ord != std::cmp::Ordering::Equal {
                return ord;
            }
        }
        std::cmp::Ordering::Equal
    });
}

fn escape_regex(value: &str) -> String {
    let mut ans = String::with_capacity(value.len());
    for ch in value.chars() {
        if "\\.+*?()|[]{}^$#&-~".contains(ch) {
            ans.push('\\');
        }
        ans.push(ch);
    }
    ans
}

/// Returns `(index, created_new)`.
fn open_or_create_index(dir: &str) -> Result<(Index, bool)> {
    let path = Path::new(dir);
    if path.join("meta.json").is_file() {
        let index = Index::open_in_dir(path).context("failed to open index")?;
        return Ok((index, false));
    }
    std::fs::create_dir_all(path).context("failed to create index dir")?;
    let index = Index::create_in_dir(path, build_schema()).context("failed to create new index")?;
    Ok((index, true))
}

/// Long-lived consumer binding the indexer to its two inputs: the
/// archiver's history fan-out stream and the key-value store's document
/// removal channel.
pub struct IndexerService {
    indexer: Arc<Indexer>,
    redis: Arc<RedisAdapter>,
    rm_chan_name: String,
}

impl IndexerService {
    pub fn new(indexer: Arc<Indexer>, redis: Arc<RedisAdapter>, rm_chan_name: &str) -> Self {
        Self {
            indexer,
            redis,
            rm_chan_name: rm_chan_name.to_owned(),
        }
    }

    pub fn indexer(&self) -> Arc<Indexer> {
        self.indexer.clone()
    }

    /// Spawns the consumer loop. It ends when shutdown is signalled or the
    /// history stream closes (the archiver dropping its sender on stop).
    pub async fn start(
        &self,
        mut recs_to_index: mpsc::Receiver<HistoryRecord>,
        mut shutdown: watch::Receiver<bool>,
    ) -> Result<JoinHandle<()>> {
        tracing::info!(
            rm_chan = %self.rm_chan_name,
            redis = %self.redis.describe(),
            "starting indexer service task"
        );
        let mut rm_chan = self.redis.channel_subscribe(&self.rm_chan_name).await?;
        let indexer = self.indexer.clone();
        let handle = tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = shutdown.changed() => {
                        tracing::info!("about to close fulltext indexer service");
                        return;
                    }
                    rec = recs_to_index.recv() => {
                        let Some(hrec) = rec else {
                            tracing::info!("history stream closed, stopping indexer service");
                            return;
                        };
                        match indexer.index_record(&hrec).await {
                            Ok(true) => {
                                tracing::debug!(id = %hrec.index_id(), "indexed history record");
                            }
                            Ok(false) => {
                                tracing::debug!(
                                    id = %hrec.index_id(),
                                    "record not indexable, skipped"
                                );
                            }
                            Err(err) => {
                                tracing::error!(
                                    error = %err,
                                    id = %hrec.index_id(),
                                    "failed to index history record"
                                );
                            }
                        }
                    }
                    msg = rm_chan.recv() => {
                        let Some(payload) = msg else {
                            tracing::warn!("remove channel closed");
                            return;
                        };
                        let item: HistoryRecord = match serde_json::from_str(&payload) {
                            Ok(item) => item,
                            Err(err) => {
                                tracing::error!(
                                    error = %err,
                                    orig_message = %payload,
                                    "failed to unmarshal next fulltext remove item"
                                );
                                continue;
                            }
                        };
                        tracing::debug!(
                            id = %item.index_id(),
                            query_id = %item.query_id,
                            "about to remove item from fulltext index"
                        );
                        if let Err(err) = indexer.delete(&item.index_id()).await {
                            tracing::error!(
                                error = %err,
                                id = %item.index_id(),
                                query_id = %item.query_id,
                                "failed to remove item from fulltext index"
                            );
                        }
                    }
                }
            }
        });
        Ok(handle)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ArchiveError;
    use crate::models::{QueryArchRec, SubcorpusProps};
    use async_trait::async_trait;
    use chrono::NaiveDateTime;
    use tempfile::TempDir;

    struct NoArch;

    #[async_trait]
    impl ConcArchiveStore for NoArch {
        async fn load_recent_n_records(&self, _num: usize) -> Result<Vec<QueryArchRec>> {
            Ok(vec![])
        }
        async fn load_records_from_date(
            &self,
            _from_date: NaiveDateTime,
            _max_items: usize,
        ) -> Result<Vec<QueryArchRec>> {
            Ok(vec![])
        }
        async fn contains_record(&self, _conc_id: &str) -> Result<bool> {
            Ok(false)
        }
        async fn load_records_by_id(&self, _conc_id: &str) -> Result<Vec<QueryArchRec>> {
            Ok(vec![])
        }
        async fn insert_record(&self, _rec: &QueryArchRec) -> Result<()> {
            Ok(())
        }
        async fn update_record_status(&self, _id: &str, _status: i32) -> Result<()> {
            Ok(())
        }
        async fn remove_records_by_id(&self, _conc_id: &str) -> Result<()> {
            Ok(())
        }
        async fn merge_in_place(
            &self,
            curr: &[QueryArchRec],
            rec: &QueryArchRec,
        ) -> Result<QueryArchRec> {
            Ok(crate::models::merge_records(curr, rec))
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

    struct NoConcSource;

    #[async_trait]
    impl ConcRecordSource for NoConcSource {
        async fn get_conc_record(&self, _id: &str) -> Result<QueryArchRec> {
            Err(ArchiveError::RecordNotFound.into())
        }
    }

    fn test_conf(dir: &TempDir) -> IndexerConfig {
        IndexerConfig {
            index_dir_path: dir.path().join("ft").to_string_lossy().into_owned(),
            query_history_num_preserve: 100,
            query_history_cleanup_interval: "30s".to_owned(),
            query_history_mark_pending_interval: "12h".to_owned(),
            query_history_max_num_delete_at_once: 20,
        }
    }

    async fn open_test_indexer(dir: &TempDir) -> Indexer {
        Indexer::open(&test_conf(dir), Arc::new(NoArch), Arc::new(NoConcSource))
            .await
            .unwrap()
    }

    fn sample_doc(index_id: &str, raw_query: &str, user_id: &str) -> IndexableDoc {
        IndexableDoc {
            doc_type: "conc",
            id: index_id.rsplit('/').next().unwrap().to_owned(),
            index_id: index_id.to_owned(),
            name: String::new(),
            query_supertype: "conc".to_owned(),
            created: chrono::DateTime::from_timestamp(1700000000, 0)
                .unwrap()
                .naive_utc(),
            user_id: user_id.to_owned(),
            corpora: "corpC".to_owned(),
            subcorpus: String::new(),
            raw_query: raw_query.to_owned(),
            structures: String::new(),
            struct_attr_names: String::new(),
            struct_attr_values: String::new(),
            pos_attr_names: "lemma".to_owned(),
            pos_attr_values: "x".to_owned(),
            pfilter_words: String::new(),
            nfilter_words: String::new(),
        }
    }

    #[tokio::test]
    async fn index_and_search_by_query_content() {
        let tmp = TempDir::new().unwrap();
        let idx = open_test_indexer(&tmp).await;
        idx.index_doc(&sample_doc("7/1700000000/ABC123", "[lemma=\"x\"]", "7"))
            .await
            .unwrap();
        // "lemma" matches via the extracted positional attribute names
        let hits = idx.search("+user_id:7 lemma", 10, &[], &[]).await.unwrap();
        assert_eq!(hits.len(), 1);
        // a different user sees nothing
        let hits = idx.search("+user_id:8 lemma", 10, &[], &[]).await.unwrap();
        assert!(hits.is_empty());
    }

    #[tokio::test]
    async fn same_key_overwrites() {
        let tmp = TempDir::new().unwrap();
        let idx = open_test_indexer(&tmp).await;
        idx.index_doc(&sample_doc("7/1700000000/ABC123", "[lemma=\"x\"]", "7"))
            .await
            .unwrap();
        idx.index_doc(&sample_doc("7/1700000000/ABC123", "[lemma=\"y\"]", "7"))
            .await
            .unwrap();
        assert_eq!(idx.count(), 1);
    }

    #[tokio::test]
    async fn delete_removes_the_document() {
        let tmp = TempDir::new().unwrap();
        let idx = open_test_indexer(&tmp).await;
        idx.index_doc(&sample_doc("7/1700000000/ABC123", "[lemma=\"x\"]", "7"))
            .await
            .unwrap();
        assert_eq!(idx.count(), 1);
        idx.delete("7/1700000000/ABC123").await.unwrap();
        assert_eq!(idx.count(), 0);
        // deleting a missing key is a no-op
        idx.delete("7/1700000000/ABC123").await.unwrap();
    }

    #[tokio::test]
    async fn predicate_search_supports_wildcards_and_musts() {
        let tmp = TempDir::new().unwrap();
        let idx = open_test_indexer(&tmp).await;
        idx.index_doc(&sample_doc("7/1700000000/AAA", "[lemma=\"waterfall\"]", "7"))
            .await
            .unwrap();
        idx.index_doc(&sample_doc("7/1700000001/BBB", "[lemma=\"fire\"]", "7"))
            .await
            .unwrap();
        let hits = idx
            .search_predicates(
                &[
                    FieldPredicate {
                        field: "user_id".to_owned(),
                        value: "7".to_owned(),
                        requirement: Requirement::Must,
                        is_wildcard: false,
                    },
                    FieldPredicate {
                        field: "raw_query".to_owned(),
                        value: "waterf".to_owned(),
                        requirement: Requirement::Must,
                        is_wildcard: true,
                    },
                ],
                10,
                &[],
                &[],
            )
            .await
            .unwrap();
        assert_eq!(hits.len(), 1);
    }

    #[tokio::test]
    async fn default_order_is_created_descending_within_equal_scores() {
        let tmp = TempDir::new().unwrap();
        let idx = open_test_indexer(&tmp).await;
        let mut older = sample_doc("7/1600000000/OLD", "[lemma=\"x\"]", "7");
        older.created = chrono::DateTime::from_timestamp(1600000000, 0)
            .unwrap()
            .naive_utc();
        idx.index_doc(&older).await.unwrap();
        idx.index_doc(&sample_doc("7/1700000000/NEW", "[lemma=\"x\"]", "7"))
            .await
            .unwrap();
        let hits = idx
            .search_predicates(
                &[FieldPredicate {
                    field: "user_id".to_owned(),
                    value: "7".to_owned(),
                    requirement: Requirement::Must,
                    is_wildcard: false,
                }],
                10,
                &[],
                &[],
            )
            .await
            .unwrap();
        assert_eq!(hits.len(), 2);
        let first_id = hits[0].fields["index_id"][0].as_str().unwrap();
        assert_eq!(first_id, "7/1700000000/NEW");
    }

    #[tokio::test]
    async fn field_projection_limits_output() {
        let tmp = TempDir::new().unwrap();
        let idx = open_test_indexer(&tmp).await;
        idx.index_doc(&sample_doc("7/1700000000/ABC123", "[lemma=\"x\"]", "7"))
            .await
            .unwrap();
        let hits = idx
            .search(
                "lemma",
                10,
                &[],
                &["index_id".to_owned(), "user_id".to_owned()],
            )
            .await
            .unwrap();
        let obj = hits[0].fields.as_object().unwrap();
        assert!(obj.contains_key("index_id"));
        assert!(obj.contains_key("user_id"));
        assert!(!obj.contains_key("raw_query"));
    }

    #[tokio::test]
    async fn index_survives_reopen() {
        let tmp = TempDir::new().unwrap();
        let conf = test_conf(&tmp);
        {
            let idx = Indexer::open(&conf, Arc::new(NoArch), Arc::new(NoConcSource))
                .await
                .unwrap();
            idx.index_doc(&sample_doc("7/1700000000/ABC123", "[lemma=\"x\"]", "7"))
                .await
                .unwrap();
        }
        let idx = Indexer::open(&conf, Arc::new(NoArch), Arc::new(NoConcSource))
            .await
            .unwrap();
        assert_eq!(idx.count(), 1);
    }
}
