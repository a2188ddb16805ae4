//! Intermediate and indexable document types.
//!
//! Query payloads are first decoded into *mid* documents — typed
//! representations with attributes arranged the way an ideal fulltext
//! engine would want them (lists, maps, typed timestamps). Right before the
//! index write, a mid document is flattened into an [`IndexableDoc`]: all
//! list and map attributes joined into whitespace-separated strings, the
//! user id stringified, and a per-supertype document type tag selecting the
//! field mapping.
//!
//! ```text
//! payload JSON → MidConc / MidWordlist / MidKwords / MidPQuery → IndexableDoc
//! ```

use std::collections::BTreeMap;

use chrono::NaiveDateTime;
use serde::Serialize;

use crate::models::{QuerySupertype, RawQuery};

/// A concordance query prepared for fulltext indexing.
#[derive(Debug, Clone, Serialize)]
pub struct MidConc {
    pub id: String,
    pub name: Option<String>,
    pub query_supertype: QuerySupertype,
    pub created: NaiveDateTime,
    pub user_id: i64,
    /// All searched corpora; length > 1 means the search ran on aligned
    /// parallel corpora.
    pub corpora: Vec<String>,
    pub subcorpus: String,
    /// The original queries as written by the user (multiple entries =
    /// aligned corpora).
    pub raw_queries: Vec<RawQuery>,
    /// All structures involved in the query.
    pub structures: Vec<String>,
    /// Structural attributes and their values used in the query. Whether a
    /// chunk was `attr=val` or `attr!=val` does not matter; we only want to
    /// know which values associate with which attributes.
    pub struct_attrs: BTreeMap<String, Vec<String>>,
    /// Positional attributes and their values used in the query.
    pub pos_attrs: BTreeMap<String, Vec<String>>,
}

impl MidConc {
    pub fn add_struct_attr(&mut self, name: &str, value: &str) {
        self.struct_attrs
            .entry(name.to_owned())
            .or_default()
            .push(value.to_owned());
    }

    pub fn add_pos_attr(&mut self, name: &str, value: &str) {
        self.pos_attrs
            .entry(name.to_owned())
            .or_default()
            .push(value.to_owned());
    }

    pub fn add_structure(&mut self, name: &str) {
        self.structures.push(name.to_owned());
    }

    pub fn raw_queries_as_string(&self) -> String {
        let mut ans = String::new();
        for rq in &self.raw_queries {
            ans.push(' ');
            ans.push_str(&rq.value);
        }
        ans
    }

    /// Tests indexability of the query at position `idx` (for possible
    /// aligned-corpora queries; single-corpus queries only have idx 0).
    pub fn is_valid_cql_query(&self, idx: usize) -> bool {
        self.raw_queries
            .get(idx)
            .map(|rq| rq.query_type == "advanced")
            .unwrap_or(false)
    }
}

/// A word list query prepared for fulltext indexing. Word lists always run
/// on a single corpus.
#[derive(Debug, Clone, Serialize)]
pub struct MidWordlist {
    pub id: String,
    pub name: Option<String>,
    pub query_supertype: QuerySupertype,
    pub created: NaiveDateTime,
    pub user_id: i64,
    pub corpora: Vec<String>,
    pub subcorpus: String,
    pub raw_query: String,
    pub pos_attr_names: Vec<String>,
    pub pfilter_words: Vec<String>,
    pub nfilter_words: Vec<String>,
}

/// A keywords query prepared for fulltext indexing. Keywords compare a
/// primary corpus against a reference corpus, so both `corpora` and
/// `subcorpora` can hold up to two entries.
#[derive(Debug, Clone, Serialize)]
pub struct MidKwords {
    pub id: String,
    pub name: Option<String>,
    pub query_supertype: QuerySupertype,
    pub created: NaiveDateTime,
    pub user_id: i64,
    pub corpora: Vec<String>,
    pub subcorpora: Vec<String>,
    pub raw_query: String,
    pub pos_attr_names: Vec<String>,
}

/// A paradigmatic query prepared for fulltext indexing. Its searchable
/// properties are the union of the properties of all concordances it
/// references.
#[derive(Debug, Clone, Serialize)]
pub struct MidPQuery {
    pub id: String,
    pub name: Option<String>,
    pub query_supertype: QuerySupertype,
    pub created: NaiveDateTime,
    pub user_id: i64,
    pub corpora: Vec<String>,
    pub subcorpus: String,
    pub raw_queries: Vec<RawQuery>,
    pub structures: Vec<String>,
    pub struct_attrs: BTreeMap<String, Vec<String>>,
    pub pos_attrs: BTreeMap<String, Vec<String>>,
}

/// Union over the typed mid documents.
#[derive(Debug, Clone, Serialize)]
#[serde(untagged)]
pub enum MidDoc {
    Conc(MidConc),
    Wlist(MidWordlist),
    Kwords(MidKwords),
    Pquery(MidPQuery),
}

impl MidDoc {
    pub fn id(&self) -> &str {
        match self {
            Self::Conc(d) => &d.id,
            Self::Wlist(d) => &d.id,
            Self::Kwords(d) => &d.id,
            Self::Pquery(d) => &d.id,
        }
    }

    pub fn query_supertype(&self) -> QuerySupertype {
        match self {
            Self::Conc(d) => d.query_supertype,
            Self::Wlist(d) => d.query_supertype,
            Self::Kwords(d) => d.query_supertype,
            Self::Pquery(d) => d.query_supertype,
        }
    }

    /// Flattens the document into its fulltext projection.
    pub fn as_indexable(&self) -> IndexableDoc {
        match self {
            Self::Conc(d) => {
                let (san, sav) = join_attr_map(&d.struct_attrs);
                let (pan, pav) = join_attr_map(&d.pos_attrs);
                IndexableDoc {
                    doc_type: d.query_supertype.as_str(),
                    id: d.id.clone(),
                    index_id: mk_index_id(d.user_id, d.created, &d.id),
                    name: d.name.clone().unwrap_or_default(),
                    query_supertype: d.query_supertype.to_string(),
                    created: d.created,
                    user_id: d.user_id.to_string(),
                    corpora: d.corpora.join(" "),
                    subcorpus: d.subcorpus.clone(),
                    raw_query: d.raw_queries_as_string(),
                    structures: d.structures.join(" "),
                    struct_attr_names: san,
                    struct_attr_values: sav,
                    pos_attr_names: pan,
                    pos_attr_values: pav,
                    pfilter_words: String::new(),
                    nfilter_words: String::new(),
                }
            }
            Self::Wlist(d) => IndexableDoc {
                doc_type: d.query_supertype.as_str(),
                id: d.id.clone(),
                index_id: mk_index_id(d.user_id, d.created, &d.id),
                name: d.name.clone().unwrap_or_default(),
                query_supertype: d.query_supertype.to_string(),
                created: d.created,
                user_id: d.user_id.to_string(),
                corpora: d.corpora.join(" "),
                subcorpus: d.subcorpus.clone(),
                raw_query: d.raw_query.clone(),
                structures: String::new(),
                struct_attr_names: String::new(),
                struct_attr_values: String::new(),
                pos_attr_names: d.pos_attr_names.join(" "),
                pos_attr_values: String::new(),
                pfilter_words: d.pfilter_words.join(" "),
                nfilter_words: d.nfilter_words.join(" "),
            },
            Self::Kwords(d) => IndexableDoc {
                doc_type: d.query_supertype.as_str(),
                id: d.id.clone(),
                index_id: mk_index_id(d.user_id, d.created, &d.id),
                name: d.name.clone().unwrap_or_default(),
                query_supertype: d.query_supertype.to_string(),
                created: d.created,
                user_id: d.user_id.to_string(),
                corpora: d.corpora.join(" "),
                subcorpus: d.subcorpora.join(" "),
                raw_query: d.raw_query.clone(),
                structures: String::new(),
                struct_attr_names: String::new(),
                struct_attr_values: String::new(),
                pos_attr_names: d.pos_attr_names.join(" "),
                pos_attr_values: String::new(),
                pfilter_words: String::new(),
                nfilter_words: String::new(),
            },
            Self::Pquery(d) => {
                let (san, sav) = join_attr_map(&d.struct_attrs);
                let (pan, pav) = join_attr_map(&d.pos_attrs);
                let raw_query = d
                    .raw_queries
                    .iter()
                    .map(|rq| rq.value.as_str())
                    .collect::<Vec<_>>()
                    .join(" ");
                IndexableDoc {
                    doc_type: d.query_supertype.as_str(),
                    id: d.id.clone(),
                    index_id: mk_index_id(d.user_id, d.created, &d.id),
                    name: d.name.clone().unwrap_or_default(),
                    query_supertype: d.query_supertype.to_string(),
                    created: d.created,
                    user_id: d.user_id.to_string(),
                    corpora: d.corpora.join(" "),
                    subcorpus: d.subcorpus.clone(),
                    raw_query,
                    structures: d.structures.join(" "),
                    struct_attr_names: san,
                    struct_attr_values: sav,
                    pos_attr_names: pan,
                    pos_attr_values: pav,
                    pfilter_words: String::new(),
                    nfilter_words: String::new(),
                }
            }
        }
    }
}

fn mk_index_id(user_id: i64, created: NaiveDateTime, id: &str) -> String {
    format!("{}/{}/{}", user_id, created.and_utc().timestamp(), id)
}

fn join_attr_map(attrs: &BTreeMap<String, Vec<String>>) -> (String, String) {
    let names = attrs.keys().cloned().collect::<Vec<_>>().join(" ");
    let values = attrs
        .values()
        .flat_map(|vs| vs.iter().map(String::as_str))
        .collect::<Vec<_>>()
        .join(" ");
    (names, values)
}

/// Flat per-supertype projection written to the fulltext engine.
///
/// The engine works best with flat string attributes, so all structured
/// attributes arrive pre-joined. `doc_type` selects the field mapping.
#[derive(Debug, Clone, Serialize)]
pub struct IndexableDoc {
    pub doc_type: &'static str,
    pub id: String,
    /// The index key: `<user_id>/<created>/<query_id>`.
    pub index_id: String,
    pub name: String,
    pub query_supertype: String,
    pub created: NaiveDateTime,
    pub user_id: String,
    pub corpora: String,
    pub subcorpus: String,
    pub raw_query: String,
    pub structures: String,
    pub struct_attr_names: String,
    pub struct_attr_values: String,
    pub pos_attr_names: String,
    pub pos_attr_values: String,
    pub pfilter_words: String,
    pub nfilter_words: String,
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::DateTime;

    fn sample_conc() -> MidConc {
        let mut doc = MidConc {
            id: "ABC123".to_owned(),
            name: Some("my saved query".to_owned()),
            query_supertype: QuerySupertype::Conc,
            created: DateTime::from_timestamp(1700000000, 0).unwrap().naive_utc(),
            user_id: 7,
            corpora: vec!["corpC".to_owned(), "corpD".to_owned()],
            subcorpus: "fiction only".to_owned(),
            raw_queries: vec![
                RawQuery {
                    value: "[lemma=\"x\"]".to_owned(),
                    query_type: "advanced".to_owned(),
                },
                RawQuery {
                    value: "voda".to_owned(),
                    query_type: "simple".to_owned(),
                },
            ],
            structures: vec!["doc".to_owned()],
            struct_attrs: BTreeMap::new(),
            pos_attrs: BTreeMap::new(),
        };
        doc.add_struct_attr("doc.txtype", "fiction");
        doc.add_struct_attr("doc.txtype", "poetry");
        doc.add_pos_attr("lemma", "x");
        doc
    }

    #[test]
    fn conc_flattens_lists_and_maps() {
        let flat = MidDoc::Conc(sample_conc()).as_indexable();
        assert_eq!(flat.doc_type, "conc");
        assert_eq!(flat.index_id, "7/1700000000/ABC123");
        assert_eq!(flat.user_id, "7");
        assert_eq!(flat.corpora, "corpC corpD");
        assert_eq!(flat.raw_query, " [lemma=\"x\"] voda");
        assert_eq!(flat.struct_attr_names, "doc.txtype");
        assert_eq!(flat.struct_attr_values, "fiction poetry");
        assert_eq!(flat.pos_attr_names, "lemma");
        assert_eq!(flat.pos_attr_values, "x");
    }

    #[test]
    fn cql_validity_depends_on_query_type() {
        let doc = sample_conc();
        assert!(doc.is_valid_cql_query(0));
        assert!(!doc.is_valid_cql_query(1));
        assert!(!doc.is_valid_cql_query(2));
    }

    #[test]
    fn wlist_projection_carries_filter_words() {
        let doc = MidDoc::Wlist(MidWordlist {
            id: "WL1".to_owned(),
            name: None,
            query_supertype: QuerySupertype::Wlist,
            created: DateTime::from_timestamp(1700000000, 0).unwrap().naive_utc(),
            user_id: 3,
            corpora: vec!["corpC".to_owned()],
            subcorpus: String::new(),
            raw_query: ".*ice".to_owned(),
            pos_attr_names: vec!["word".to_owned()],
            pfilter_words: vec!["led".to_owned(), "mraz".to_owned()],
            nfilter_words: vec!["pivo".to_owned()],
        });
        let flat = doc.as_indexable();
        assert_eq!(flat.doc_type, "wlist");
        assert_eq!(flat.pfilter_words, "led mraz");
        assert_eq!(flat.nfilter_words, "pivo");
        assert_eq!(flat.pos_attr_names, "word");
    }

    #[test]
    fn kwords_projection_joins_both_corpus_slots() {
        let doc = MidDoc::Kwords(MidKwords {
            id: "KW1".to_owned(),
            name: None,
            query_supertype: QuerySupertype::Kwords,
            created: DateTime::from_timestamp(1700000000, 0).unwrap().naive_utc(),
            user_id: 3,
            corpora: vec!["corpC".to_owned(), "corpRef".to_owned()],
            subcorpora: vec!["subA".to_owned(), "subB".to_owned()],
            raw_query: ".*".to_owned(),
            pos_attr_names: vec!["lemma".to_owned()],
        });
        let flat = doc.as_indexable();
        assert_eq!(flat.doc_type, "kwords");
        assert_eq!(flat.corpora, "corpC corpRef");
        assert_eq!(flat.subcorpus, "subA subB");
    }
}
