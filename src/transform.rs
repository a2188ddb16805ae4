//! Record→document transformation.
//!
//! Archive payloads arrive as loosely structured JSON discriminated by a
//! `form_type` attribute which lives either in `lastop_form` (concordances)
//! or in `form` (the other supertypes). The transformer first decodes the
//! common attribute set ([`UnspecifiedQueryRecord`]), resolves the
//! supertype, and then applies the per-supertype form decoder to build a
//! typed mid document.
//!
//! Records whose supertype is unknown (e.g. intermediate shuffle or filter
//! operations) surface as [`ArchiveError::NotIndexable`] — a distinguished,
//! non-fatal condition callers skip over.

use std::collections::BTreeMap;

use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::DateTime;
use serde::Deserialize;

use crate::archstore::ConcArchiveStore;
use crate::cqlprops::{extract_query_props, extract_simple_query_props};
use crate::docs::{MidConc, MidDoc, MidKwords, MidPQuery, MidWordlist};
use crate::error::ArchiveError;
use crate::kvstore::RedisAdapter;
use crate::models::{HistoryRecord, QueryArchRec, QuerySupertype, RawQuery};

/// Source of concordance records by id; the paradigmatic-query decoder uses
/// it to fetch the concordances the query references. In case a record is
/// missing the implementation returns [`ArchiveError::RecordNotFound`].
#[async_trait]
pub trait ConcRecordSource: Send + Sync {
    async fn get_conc_record(&self, id: &str) -> Result<QueryArchRec>;
}

#[async_trait]
impl ConcRecordSource for RedisAdapter {
    async fn get_conc_record(&self, id: &str) -> Result<QueryArchRec> {
        RedisAdapter::get_conc_record(self, id).await
    }
}

/// Any query record as saved by the workbench, without its concrete form.
/// All stored queries share this attribute set; the differences start with
/// the `lastop_form` / `form` objects for which separate types exist, one
/// per supertype.
#[derive(Debug, Default, Deserialize)]
pub struct UnspecifiedQueryRecord {
    #[serde(default)]
    pub id: String,
    #[serde(default)]
    pub user_id: i64,
    #[serde(default)]
    pub corpora: Vec<String>,
    #[serde(default, rename = "usesubcorp")]
    pub subcorpus_id: String,
    #[serde(default)]
    pub lastop_form: Option<serde_json::Value>,
    #[serde(default)]
    pub form: Option<serde_json::Value>,
}

impl UnspecifiedQueryRecord {
    /// Resolves the query supertype from `lastop_form.form_type`, falling
    /// back to `form.form_type`. A missing discriminator or an unsupported
    /// form type means the record is not indexable.
    pub fn supertype(&self) -> Result<QuerySupertype> {
        let ft = self
            .lastop_form
            .as_ref()
            .and_then(|f| f.get("form_type"))
            .or_else(|| self.form.as_ref().and_then(|f| f.get("form_type")))
            .and_then(|v| v.as_str());
        let Some(ft) = ft else {
            return Err(ArchiveError::NotIndexable.into());
        };
        QuerySupertype::from_form_type(ft).ok_or_else(|| ArchiveError::NotIndexable.into())
    }
}

/// Concordance form as embedded in a payload's `lastop_form`.
#[derive(Debug, Default, Deserialize)]
pub struct ConcFormRecord {
    #[serde(default)]
    pub lastop_form: ConcLastopForm,
}

#[derive(Debug, Default, Deserialize)]
pub struct ConcLastopForm {
    #[serde(default)]
    pub curr_queries: BTreeMap<String, String>,
    #[serde(default)]
    pub curr_query_types: BTreeMap<String, String>,
    #[serde(default)]
    pub selected_text_types: BTreeMap<String, Vec<String>>,
    /// Pre-parsed simple-query structure (nested lists).
    #[serde(default)]
    pub curr_parsed_queries: Option<serde_json::Value>,
    #[serde(default)]
    pub default_attr: Option<String>,
}

impl ConcFormRecord {
    /// The attribute a bare quoted token constrains.
    pub fn default_attr(&self) -> &str {
        self.lastop_form
            .default_attr
            .as_deref()
            .filter(|v| !v.is_empty())
            .unwrap_or("word")
    }
}

/// Word list form (`form` attribute of the payload).
#[derive(Debug, Default, Deserialize)]
pub struct WlistFormRecord {
    #[serde(default)]
    pub form: WlistForm,
}

#[derive(Debug, Default, Deserialize)]
pub struct WlistForm {
    #[serde(default, rename = "wlpat")]
    pub wl_pattern: String,
    #[serde(default, rename = "wlattr")]
    pub wl_attr: String,
    #[serde(default)]
    pub pfilter_words: Vec<String>,
    #[serde(default)]
    pub nfilter_words: Vec<String>,
}

/// Keywords form (`form` attribute of the payload).
#[derive(Debug, Default, Deserialize)]
pub struct KwordsFormRecord {
    #[serde(default)]
    pub form: KwordsForm,
}

#[derive(Debug, Default, Deserialize)]
pub struct KwordsForm {
    #[serde(default, rename = "wlpat")]
    pub wl_pattern: String,
    #[serde(default, rename = "wlattr")]
    pub wl_attr: String,
    #[serde(default)]
    pub ref_corpname: String,
    #[serde(default)]
    pub ref_usesubcorp: String,
}

/// Paradigmatic query form (`form` attribute of the payload).
#[derive(Debug, Default, Deserialize)]
pub struct PQueryFormRecord {
    #[serde(default)]
    pub form: PQueryForm,
}

#[derive(Debug, Default, Deserialize)]
pub struct PQueryForm {
    #[serde(default)]
    pub conc_ids: Vec<String>,
}

/// Converts a history record (with its payload attached) into a typed mid
/// document ready for index projection.
pub async fn rec_to_mid_doc(
    hrec: &HistoryRecord,
    arch: &dyn ConcArchiveStore,
    conc_src: &dyn ConcRecordSource,
) -> Result<MidDoc> {
    let rec = hrec
        .rec
        .as_ref()
        .ok_or(ArchiveError::RecordStructure)
        .context("history record without payload")?;
    let urec: UnspecifiedQueryRecord =
        serde_json::from_str(&rec.data).context("failed to convert rec. to doc.")?;
    let stype = urec.supertype()?;
    match stype {
        QuerySupertype::Conc => Ok(MidDoc::Conc(
            import_conc(&urec, stype, hrec, arch).await?,
        )),
        QuerySupertype::Wlist => Ok(MidDoc::Wlist(
            import_wlist(&urec, stype, hrec, arch).await?,
        )),
        QuerySupertype::Kwords => Ok(MidDoc::Kwords(
            import_kwords(&urec, stype, hrec, arch).await?,
        )),
        QuerySupertype::Pquery => Ok(MidDoc::Pquery(
            import_pquery(&urec, stype, hrec, arch, conc_src).await?,
        )),
    }
}

async fn import_conc(
    urec: &UnspecifiedQueryRecord,
    stype: QuerySupertype,
    hrec: &HistoryRecord,
    arch: &dyn ConcArchiveStore,
) -> Result<MidConc> {
    let rec = hrec.rec.as_ref().expect("payload checked by caller");
    let form: ConcFormRecord =
        serde_json::from_str(&rec.data).context("failed to decode conc form")?;
    let subc_props = arch
        .get_subcorpus_props(&urec.subcorpus_id)
        .await
        .context("failed to convert rec. to doc.")?;

    let mut raw_queries = Vec::with_capacity(form.lastop_form.curr_queries.len());
    // aligned-corpora queries follow the payload's corpus order
    for corp in &urec.corpora {
        if let Some(query) = form.lastop_form.curr_queries.get(corp) {
            raw_queries.push(RawQuery {
                value: query.clone(),
                query_type: form
                    .lastop_form
                    .curr_query_types
                    .get(corp)
                    .cloned()
                    .unwrap_or_default(),
            });
        }
    }
    for (corp, query) in &form.lastop_form.curr_queries {
        if !urec.corpora.contains(corp) {
            raw_queries.push(RawQuery {
                value: query.clone(),
                query_type: form
                    .lastop_form
                    .curr_query_types
                    .get(corp)
                    .cloned()
                    .unwrap_or_default(),
            });
        }
    }

    let mut ans = MidConc {
        id: urec.id.clone(),
        name: hrec.name.clone(),
        query_supertype: stype,
        created: DateTime::from_timestamp(hrec.created, 0)
            .map(|dt| dt.naive_utc())
            .unwrap_or_default(),
        user_id: hrec.user_id,
        corpora: urec.corpora.clone(),
        subcorpus: subc_props.name.clone(),
        raw_queries,
        structures: Vec::new(),
        struct_attrs: BTreeMap::new(),
        pos_attrs: BTreeMap::new(),
    };

    if let Err(err) = extract_query_props(&mut ans, form.default_attr()) {
        let queries: Vec<&str> = ans.raw_queries.iter().map(|rq| rq.value.as_str()).collect();
        tracing::warn!(
            error = %err,
            ?queries,
            "indexing record with unparseable CQL query"
        );
    }
    if let Some(parsed) = &form.lastop_form.curr_parsed_queries {
        extract_simple_query_props(parsed, &mut ans);
    }

    // text types from the form merged with the resolved subcorpus definition
    let mut tt: BTreeMap<String, Vec<String>> = subc_props
        .text_types
        .iter()
        .map(|(k, v)| (k.clone(), v.clone()))
        .collect();
    for (attr, items) in &form.lastop_form.selected_text_types {
        tt.entry(attr.clone()).or_default().extend(items.clone());
    }
    for (attr, items) in tt {
        for value in &items {
            ans.add_struct_attr(&attr, value);
        }
        if let Some((structure, _)) = attr.split_once('.') {
            ans.add_structure(structure);
        }
    }

    Ok(ans)
}

async fn import_wlist(
    urec: &UnspecifiedQueryRecord,
    stype: QuerySupertype,
    hrec: &HistoryRecord,
    arch: &dyn ConcArchiveStore,
) -> Result<MidWordlist> {
    let rec = hrec.rec.as_ref().expect("payload checked by caller");
    let form: WlistFormRecord =
        serde_json::from_str(&rec.data).context("failed to decode wlist form")?;
    let subc_props = arch
        .get_subcorpus_props(&urec.subcorpus_id)
        .await
        .context("failed to convert rec. to doc.")?;
    Ok(MidWordlist {
        id: urec.id.clone(),
        name: hrec.name.clone(),
        query_supertype: stype,
        created: DateTime::from_timestamp(hrec.created, 0)
            .map(|dt| dt.naive_utc())
            .unwrap_or_default(),
        user_id: hrec.user_id,
        corpora: urec.corpora.clone(),
        subcorpus: subc_props.name,
        raw_query: form.form.wl_pattern,
        pos_attr_names: vec![form.form.wl_attr],
        pfilter_words: form.form.pfilter_words,
        nfilter_words: form.form.nfilter_words,
    })
}

async fn import_kwords(
    urec: &UnspecifiedQueryRecord,
    stype: QuerySupertype,
    hrec: &HistoryRecord,
    arch: &dyn ConcArchiveStore,
) -> Result<MidKwords> {
    let rec = hrec.rec.as_ref().expect("payload checked by caller");
    let form: KwordsFormRecord =
        serde_json::from_str(&rec.data).context("failed to decode kwords form")?;

    let mut subcorpora = Vec::with_capacity(2);
    let subc_props1 = arch
        .get_subcorpus_props(&urec.subcorpus_id)
        .await
        .context("failed to convert rec. to doc.")?;
    if !subc_props1.name.is_empty() {
        subcorpora.push(subc_props1.name);
    }
    let subc_props2 = arch
        .get_subcorpus_props(&form.form.ref_usesubcorp)
        .await
        .context("failed to convert rec. to doc.")?;
    if !subc_props2.name.is_empty() {
        subcorpora.push(subc_props2.name);
    }
    let mut corpora = urec.corpora.clone();
    if !form.form.ref_corpname.is_empty() {
        corpora.push(form.form.ref_corpname.clone());
    }

    Ok(MidKwords {
        id: urec.id.clone(),
        name: hrec.name.clone(),
        query_supertype: stype,
        created: DateTime::from_timestamp(hrec.created, 0)
            .map(|dt| dt.naive_utc())
            .unwrap_or_default(),
        user_id: hrec.user_id,
        corpora,
        subcorpora,
        raw_query: form.form.wl_pattern,
        pos_attr_names: vec![form.form.wl_attr],
    })
}

async fn import_pquery(
    urec: &UnspecifiedQueryRecord,
    stype: QuerySupertype,
    hrec: &HistoryRecord,
    arch: &dyn ConcArchiveStore,
    conc_src: &dyn ConcRecordSource,
) -> Result<MidPQuery> {
    let rec = hrec.rec.as_ref().expect("payload checked by caller");
    let form: PQueryFormRecord =
        serde_json::from_str(&rec.data).context("failed to decode pquery form")?;
    let subc_props = arch
        .get_subcorpus_props(&urec.subcorpus_id)
        .await
        .context("failed to convert rec. to doc.")?;

    let mut merged_structures = Vec::new();
    let mut merged_struct_attrs: BTreeMap<String, Vec<String>> = BTreeMap::new();
    let mut merged_pos_attrs: BTreeMap<String, Vec<String>> = BTreeMap::new();
    let mut merged_raw_queries = Vec::with_capacity(form.form.conc_ids.len());

    for (i, conc_id) in form.form.conc_ids.iter().enumerate() {
        let data = conc_src
            .get_conc_record(conc_id)
            .await
            .with_context(|| format!("failed to fetch pquery concordance #{}", i))?;
        let crec: UnspecifiedQueryRecord = serde_json::from_str(&data.data)
            .with_context(|| format!("failed to process pquery conc #{}", i))?;
        let cqstype = crec
            .supertype()
            .with_context(|| format!("failed to process pquery conc #{}", i))?;
        if cqstype != QuerySupertype::Conc {
            anyhow::bail!("failed to process pquery conc #{}: not a conc. record", i);
        }
        let h = HistoryRecord {
            query_id: hrec.query_id.clone(),
            user_id: hrec.user_id,
            created: hrec.created,
            name: hrec.name.clone(),
            rec: Some(data),
        };
        let conc = import_conc(&crec, cqstype, &h, arch)
            .await
            .with_context(|| format!("failed to process pquery conc #{}", i))?;
        merged_raw_queries.extend(conc.raw_queries);
        for (name, values) in conc.pos_attrs {
            merged_pos_attrs.entry(name).or_default().extend(values);
        }
        for (name, values) in conc.struct_attrs {
            merged_struct_attrs.entry(name).or_default().extend(values);
        }
        merged_structures.extend(conc.structures);
    }

    Ok(MidPQuery {
        id: urec.id.clone(),
        name: hrec.name.clone(),
        query_supertype: stype,
        created: DateTime::from_timestamp(hrec.created, 0)
            .map(|dt| dt.naive_utc())
            .unwrap_or_default(),
        user_id: hrec.user_id,
        corpora: urec.corpora.clone(),
        subcorpus: subc_props.name,
        raw_queries: merged_raw_queries,
        structures: merged_structures,
        struct_attrs: merged_struct_attrs,
        pos_attrs: merged_pos_attrs,
    })
}
