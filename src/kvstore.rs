//! Key-value store adapter.
//!
//! Wraps the Redis client behind the narrow operation set the services use:
//! plain get/set/exists, the atomic queue drain, the failure queue, sorted-set
//! user cursors, pub/sub subscriptions surfaced as channels, and the
//! workbench-compatible concordance cache lookup.
//!
//! # Queue encoding
//!
//! The workbench pushes either a bare record id or a JSON object:
//!
//! ```json
//! {"type": "archive", "key": "concordance:AbC...", "explicit": false}
//! {"type": "history", "key": "AbC...", "user_id": 7, "created": 1700000000, "name": null}
//! ```
//!
//! Bare strings are legacy entries and decode as implicit archive requests.

use anyhow::{Context, Result};
use futures::StreamExt;
use redis::AsyncCommands;
use serde::{Deserialize, Serialize};
use sha1::{Digest, Sha1};
use tokio::sync::mpsc;

use crate::config::RedisConfig;
use crate::error::ArchiveError;
use crate::models::{HistoryRecord, QueryArchRec};

/// Kind tag of a queue entry.
pub const QR_TYPE_ARCHIVE: &str = "archive";
pub const QR_TYPE_HISTORY: &str = "history";

/// A single decoded entry of the archive queue.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueueRecord {
    #[serde(rename = "type", default)]
    pub entry_type: String,

    pub key: String,

    // query persistence data
    #[serde(default)]
    pub explicit: bool,

    // query history data
    #[serde(default)]
    pub user_id: i64,
    #[serde(default)]
    pub created: i64,
    #[serde(default)]
    pub name: Option<String>,
}

impl QueueRecord {
    /// Decodes a raw queue entry. Entries carrying a `"key"` attribute are
    /// JSON; anything else is a legacy bare id (implicit archive request).
    pub fn decode(raw: &str) -> Result<Self> {
        if raw.contains("\"key\"") {
            serde_json::from_str(raw)
                .with_context(|| format!("failed to decode queue item `{}`", raw))
        } else {
            Ok(Self {
                entry_type: String::new(),
                key: raw.to_owned(),
                explicit: false,
                user_id: 0,
                created: 0,
                name: None,
            })
        }
    }

    /// Legacy untagged entries count as archive requests.
    pub fn is_archive(&self) -> bool {
        self.entry_type == QR_TYPE_ARCHIVE || self.entry_type.is_empty()
    }

    pub fn is_history(&self) -> bool {
        self.entry_type == QR_TYPE_HISTORY
    }

    /// The record id with the storage key prefix stripped.
    pub fn key_code(&self) -> &str {
        self.key
            .strip_prefix("concordance:")
            .unwrap_or(self.key.as_str())
    }

    /// View of a history-typed entry as a history record (payload attached
    /// later by the archiver).
    pub fn as_history_record(&self) -> HistoryRecord {
        HistoryRecord {
            query_id: self.key_code().to_owned(),
            user_id: self.user_id,
            created: self.created,
            name: self.name.clone(),
            rec: None,
        }
    }
}

/// Raw concordance cache record (unparsed payload).
#[derive(Debug, Clone)]
pub struct ConcCacheRec {
    pub id: String,
    pub data: String,
}

/// Adapter hiding the Redis client behind the operations the services need.
///
/// The multiplexed connection is cheap to clone; each call operates on its
/// own clone so `&self` methods can run concurrently.
#[derive(Clone)]
pub struct RedisAdapter {
    client: redis::Client,
    conn: redis::aio::MultiplexedConnection,
    conf: RedisConfig,
}

impl RedisAdapter {
    pub async fn new(conf: &RedisConfig) -> Result<Self> {
        let url = if conf.password.is_empty() {
            format!("redis://{}:{}/{}", conf.host, conf.port, conf.db)
        } else {
            format!(
                "redis://:{}@{}:{}/{}",
                conf.password, conf.host, conf.port, conf.db
            )
        };
        let client = redis::Client::open(url).context("failed to configure Redis client")?;
        let conn = client
            .get_multiplexed_async_connection()
            .await
            .context("failed to connect to Redis")?;
        Ok(Self {
            client,
            conn,
            conf: conf.clone(),
        })
    }

    pub fn describe(&self) -> String {
        format!(
            "RedisAdapter, address {}:{}, db {}",
            self.conf.host, self.conf.port, self.conf.db
        )
    }

    /// Returns the Redis type of a key (`string`, `zset`, `none`, ...).
    pub async fn key_type(&self, k: &str) -> Result<String> {
        let mut conn = self.conn.clone();
        let t: String = redis::cmd("TYPE")
            .arg(k)
            .query_async(&mut conn)
            .await
            .with_context(|| format!("failed to determine type of {}", k))?;
        Ok(t)
    }

    /// Returns the value under `k`, or an empty string when the key is
    /// missing.
    pub async fn get(&self, k: &str) -> Result<String> {
        let mut conn = self.conn.clone();
        let v: Option<String> = conn
            .get(k)
            .await
            .with_context(|| format!("failed to get Redis entry {}", k))?;
        Ok(v.unwrap_or_default())
    }

    pub async fn set(&self, k: &str, v: &str) -> Result<()> {
        let mut conn = self.conn.clone();
        conn.set::<_, _, ()>(k, v)
            .await
            .with_context(|| format!("failed to set Redis item {}", k))?;
        Ok(())
    }

    pub async fn exists(&self, key: &str) -> Result<bool> {
        let mut conn = self.conn.clone();
        let n: i64 = conn
            .exists(key)
            .await
            .with_context(|| format!("failed to test key {}", key))?;
        Ok(n > 0)
    }

    pub async fn publish(&self, chname: &str, value: &str) -> Result<()> {
        let mut conn = self.conn.clone();
        conn.publish::<_, _, ()>(chname, value)
            .await
            .with_context(|| format!("failed to publish to channel {}", chname))?;
        Ok(())
    }

    /// Subscribes to a pub/sub channel and surfaces incoming message
    /// payloads through an in-process channel. The feeding task runs until
    /// the receiver is dropped or the connection dies.
    pub async fn channel_subscribe(&self, name: &str) -> Result<mpsc::Receiver<String>> {
        let mut pubsub = self
            .client
            .get_async_pubsub()
            .await
            .context("failed to open pub/sub connection")?;
        pubsub
            .subscribe(name)
            .await
            .with_context(|| format!("failed to subscribe to channel {}", name))?;
        let (tx, rx) = mpsc::channel(64);
        tokio::spawn(async move {
            let mut stream = pubsub.on_message();
            while let Some(msg) = stream.next().await {
                let payload: String = match msg.get_payload() {
                    Ok(p) => p,
                    Err(err) => {
                        tracing::error!(error = %err, "failed to read pub/sub payload");
                        continue;
                    }
                };
                if tx.send(payload).await.is_err() {
                    break;
                }
            }
        });
        Ok(rx)
    }

    /// Adds a non-negative user id to a sorted-set cursor (scored by
    /// itself, so the lowest id pops first).
    pub async fn uint_zadd(&self, key: &str, v: i64) -> Result<()> {
        anyhow::ensure!(v >= 0, "uint_zadd - cannot add numbers < 0");
        let mut conn = self.conn.clone();
        conn.zadd::<_, _, _, ()>(key, v, v as f64)
            .await
            .with_context(|| format!("failed to zadd to {}", key))?;
        Ok(())
    }

    pub async fn zcard(&self, key: &str) -> Result<i64> {
        let mut conn = self.conn.clone();
        let n: i64 = conn
            .zcard(key)
            .await
            .with_context(|| format!("failed to get cardinality of {}", key))?;
        Ok(n)
    }

    /// Removes and returns the element with the lowest score from a sorted
    /// set; `None` when the set is empty (not an error).
    pub async fn uint_zrem_lowest(&self, key: &str) -> Result<Option<i64>> {
        let mut conn = self.conn.clone();
        let lowest: Vec<String> = conn
            .zrange(key, 0, 0)
            .await
            .with_context(|| format!("failed to read lowest member of {}", key))?;
        let Some(member) = lowest.first() else {
            return Ok(None);
        };
        let value: i64 = member
            .parse()
            .with_context(|| format!("zset member `{}` is not an integer", member))?;
        conn.zrem::<_, _, ()>(key, value)
            .await
            .with_context(|| format!("failed to remove member from {}", key))?;
        Ok(Some(value))
    }

    /// Atomically drains up to `n` entries from the tail of the queue list.
    ///
    /// `LRANGE key -n -1` and `LTRIM key 0 -n-1` run inside one pipelined
    /// MULTI block, so producers prepending to the head concurrently are
    /// never lost. The returned entries are raw and tail-first (oldest
    /// first); an empty queue yields an empty vec and no trim takes effect
    /// (trimming to `0..-n-1` keeps the whole, empty list).
    pub async fn next_queue_chunk(&self, queue_key: &str, n: usize) -> Result<Vec<String>> {
        let mut conn = self.conn.clone();
        let n = n as isize;
        let (mut items, _): (Vec<String>, ()) = redis::pipe()
            .atomic()
            .lrange(queue_key, -n, -1)
            .ltrim(queue_key, 0, -n - 1)
            .query_async(&mut conn)
            .await
            .context("failed to get items from queue")?;
        items.reverse();
        Ok(items)
    }

    /// Parks a failed queue entry: the entry itself goes to the failure
    /// list, and when the payload was already fetched it is kept alongside
    /// in a hash under the same key.
    pub async fn add_error(
        &self,
        err_queue: &str,
        item: &QueueRecord,
        rec: Option<&QueryArchRec>,
    ) -> Result<()> {
        let item_json = serde_json::to_string(item)
            .with_context(|| format!("failed to add error record {}", item.key))?;
        self.add_error_raw(err_queue, &item_json).await?;
        if let Some(rec) = rec {
            let mut conn = self.conn.clone();
            conn.hset::<_, _, _, ()>(err_queue, &item.key, &rec.data)
                .await
                .with_context(|| format!("failed to insert error record {}", item.key))?;
        }
        Ok(())
    }

    /// Parks a raw (possibly undecodable) queue entry in the failure list.
    pub async fn add_error_raw(&self, err_queue: &str, raw: &str) -> Result<()> {
        let mut conn = self.conn.clone();
        conn.lpush::<_, _, ()>(err_queue, raw)
            .await
            .with_context(|| format!("failed to insert error key `{}`", raw))?;
        Ok(())
    }

    fn mk_key(id: &str) -> String {
        format!("concordance:{}", id)
    }

    /// Returns the concordance/wlist/pquery/kwords record with the given id.
    /// A missing record surfaces as [`ArchiveError::RecordNotFound`].
    pub async fn get_conc_record(&self, id: &str) -> Result<QueryArchRec> {
        let mut conn = self.conn.clone();
        let data: Option<String> = conn
            .get(Self::mk_key(id))
            .await
            .context("failed to get concordance record")?;
        let Some(data) = data else {
            return Err(ArchiveError::RecordNotFound.into());
        };
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

    /// Looks up the raw concordance-cache record for an archived query.
    pub async fn get_conc_cache_raw_record(&self, id: &str) -> Result<ConcCacheRec> {
        let conc_record = self.get_conc_record(id).await?;
        let data = conc_record
            .fetch_data()
            .context("failed to fetch concordance record data")?;
        let corpora = data.corpora();
        let corpus_id = corpora.first().map(String::as_str).unwrap_or_default();
        let field = mk_conc_cache_field(corpus_id, &data.subcorpus(), &data.q(), 0);
        let mut conn = self.conn.clone();
        let cached: Option<String> = conn
            .hget(mk_conc_cache_key(corpus_id), &field)
            .await
            .context("failed to get conc_cache record")?;
        match cached {
            Some(data) => Ok(ConcCacheRec { id: field, data }),
            None => Err(ArchiveError::RecordNotFound.into()),
        }
    }
}

pub fn mk_conc_cache_key(corpus_id: &str) -> String {
    format!("conc_cache:{}", corpus_id.to_lowercase())
}

/// Derives the concordance-cache hash field for a query.
///
/// This must stay byte-identical to the workbench's own derivation
/// (`sha1(join(q, "#") + corp_key + cutoff)` where `corp_key` is the
/// lowercased corpus, optionally suffixed with `/subcorpus`), otherwise
/// cache lookups silently miss.
pub fn mk_conc_cache_field(corpus_id: &str, subcorpus_id: &str, q: &[String], cutoff: i64) -> String {
    let corpus_lw = corpus_id.to_lowercase();
    let corp_key = if subcorpus_id.is_empty() {
        corpus_lw
    } else {
        format!("{}/{}", corpus_lw, subcorpus_id)
    };
    let hash_input = format!("{}{}{}", q.join("#"), corp_key, cutoff);
    let mut hasher = Sha1::new();
    hasher.update(hash_input.as_bytes());
    format!("{:x}", hasher.finalize())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn plain_string_decodes_as_implicit_archive() {
        let rec = QueueRecord::decode("AbCdEf123456").unwrap();
        assert!(rec.is_archive());
        assert!(!rec.is_history());
        assert!(!rec.explicit);
        assert_eq!(rec.key_code(), "AbCdEf123456");
    }

    #[test]
    fn json_archive_entry_decodes() {
        let rec =
            QueueRecord::decode(r#"{"type": "archive", "key": "concordance:XyZ", "explicit": true}"#)
                .unwrap();
        assert!(rec.is_archive());
        assert!(rec.explicit);
        assert_eq!(rec.key_code(), "XyZ");
    }

    #[test]
    fn json_history_entry_decodes() {
        let rec = QueueRecord::decode(
            r#"{"type": "history", "key": "ABC123", "user_id": 7, "created": 1700000000, "name": "my saved query"}"#,
        )
        .unwrap();
        assert!(rec.is_history());
        let h = rec.as_history_record();
        assert_eq!(h.user_id, 7);
        assert_eq!(h.created, 1700000000);
        assert_eq!(h.name.as_deref(), Some("my saved query"));
        assert_eq!(h.index_id(), "7/1700000000/ABC123");
    }

    #[test]
    fn malformed_json_entry_fails_to_decode() {
        assert!(QueueRecord::decode(r#"{"key": "#).is_err());
    }

    #[test]
    fn unknown_type_is_preserved_for_caller_filtering() {
        let rec = QueueRecord::decode(r#"{"type": "frobnicate", "key": "ABC"}"#).unwrap();
        assert!(!rec.is_archive());
        assert!(!rec.is_history());
    }

    #[test]
    fn conc_cache_key_is_lowercased() {
        assert_eq!(mk_conc_cache_key("SYN2020"), "conc_cache:syn2020");
    }

    #[test]
    fn conc_cache_field_matches_workbench_derivation() {
        // sha1('q[lemma="voda"]' + 'syn2020' + '0')
        let field = mk_conc_cache_field("syn2020", "", &["q[lemma=\"voda\"]".to_owned()], 0);
        assert_eq!(field, "cc95ab6053a1cd150c002f103c070345b5cf154c");
    }

    #[test]
    fn conc_cache_field_joins_queries_and_subcorpus() {
        // sha1('q[lemma="voda"]#q[tag="N.*"]' + 'syn2020/xyz' + '5')
        let field = mk_conc_cache_field(
            "SYN2020",
            "xyz",
            &["q[lemma=\"voda\"]".to_owned(), "q[tag=\"N.*\"]".to_owned()],
            5,
        );
        assert_eq!(field, "c708ce4e3824b5fee8129e45fa6580f5b5bdd089");
    }
}
