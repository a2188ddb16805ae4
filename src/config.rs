//! Application configuration.
//!
//! Loaded from a single JSON file; one struct per section. An instance is
//! only ready after [`Config::validate_and_defaults`] ran: the validation
//! pass tunes tick intervals to primes, fills derived defaults and rejects
//! values the services cannot run with.

use anyhow::{bail, Context, Result};
use serde::Deserialize;
use std::path::Path;
use std::time::Duration;

use crate::util::nearest_prime;

/// Default number of recent archive ids preloaded into the deduplicator.
const DFLT_PRELOAD_LAST_N_ITEMS: usize = 500;

/// Night batches default to this multiple of the daytime batch size.
const DFLT_NIGHT_ITEMS_INCREASE: usize = 2;

const DFLT_STATUS_KEY: &str = "camus_cleanup_status";
const MIN_ALLOWED_CHECK_INTERVAL: u64 = 10;
const MIN_AGE_DAYS_UNVISITED_LIMIT: i64 = 30;

#[derive(Debug, Deserialize, Clone)]
pub struct Config {
    #[serde(default = "default_listen_address")]
    pub listen_address: String,
    #[serde(default = "default_listen_port")]
    pub listen_port: u16,
    #[serde(default)]
    pub logging: LoggingConfig,
    pub mysql: MySqlConfig,
    pub redis: RedisConfig,
    pub archiver: ArchiverConfig,
    pub cleaner: CleanerConfig,
    pub indexer: IndexerConfig,
    #[serde(default)]
    pub time_zone: Option<String>,
}

fn default_listen_address() -> String {
    "127.0.0.1".to_owned()
}

fn default_listen_port() -> u16 {
    8787
}

#[derive(Debug, Deserialize, Clone, Default)]
pub struct LoggingConfig {
    /// Log file path; empty means stderr.
    #[serde(default)]
    pub path: String,
    /// Log level filter (`error`, `warn`, `info`, `debug`, `trace`).
    #[serde(default)]
    pub level: String,
}

#[derive(Debug, Deserialize, Clone)]
pub struct MySqlConfig {
    pub host: String,
    #[serde(default = "default_mysql_port")]
    pub port: u16,
    pub name: String,
    pub user: String,
    pub password: String,
    #[serde(default = "default_pool_size")]
    pub pool_size: u32,
}

fn default_mysql_port() -> u16 {
    3306
}

fn default_pool_size() -> u32 {
    5
}

#[derive(Debug, Deserialize, Clone)]
pub struct RedisConfig {
    pub host: String,
    #[serde(default = "default_redis_port")]
    pub port: u16,
    /// Logical database index. Required non-zero: the workbench keeps its
    /// own data in db 0 and a misconfigured instance would drain the wrong
    /// queue.
    pub db: i64,
    #[serde(default)]
    pub password: String,
    /// List the workbench pushes fresh query ids to.
    pub queue_key: String,
    /// List where entries failing to archive are parked.
    pub failed_queue_key: String,
    /// Pub/sub channel carrying fulltext document removal requests.
    pub doc_remove_channel: String,
}

fn default_redis_port() -> u16 {
    6379
}

#[derive(Debug, Deserialize, Clone)]
pub struct ArchiverConfig {
    /// Path to the persisted Bloom filter state.
    pub dd_state_file_path: String,
    /// Archive tick in seconds; tuned to the nearest prime.
    pub check_interval_secs: u64,
    /// Max queue entries drained per tick.
    pub check_interval_chunk: usize,
    /// Deduplicator warm-up set size.
    #[serde(default)]
    pub preload_last_n_items: usize,
}

impl ArchiverConfig {
    pub fn check_interval(&self) -> Duration {
        Duration::from_secs(self.check_interval_secs)
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct CleanerConfig {
    /// Cleanup tick in seconds; tuned to a prime distinct from the
    /// archiver's interval.
    pub check_interval_secs: u64,
    /// Daytime batch size (1..=5000).
    pub num_process_items_per_tick: usize,
    /// Night batch size; defaults to twice the daytime value.
    #[serde(default)]
    pub num_process_items_per_tick_night: usize,
    /// Key-value key holding the sweep cursor.
    #[serde(default)]
    pub status_key: String,
    /// Rows with no access older than this many days are deleted.
    pub min_age_days_unvisited: i64,
}

impl CleanerConfig {
    pub fn check_interval(&self) -> Duration {
        Duration::from_secs(self.check_interval_secs)
    }

    pub fn min_age_unvisited(&self) -> chrono::Duration {
        chrono::Duration::days(self.min_age_days_unvisited)
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct IndexerConfig {
    /// Directory where the fulltext index lives.
    pub index_dir_path: String,
    /// Per-user cap of unnamed history entries.
    pub query_history_num_preserve: usize,
    /// Delete-phase interval, duration string (`30s`, `5m`, `1h30m`).
    pub query_history_cleanup_interval: String,
    /// Mark-phase interval, duration string. Typically much longer than the
    /// cleanup interval: mark once a day, then delete chunk by chunk.
    pub query_history_mark_pending_interval: String,
    /// Delete batch cap per cleanup tick.
    pub query_history_max_num_delete_at_once: usize,
}

impl IndexerConfig {
    pub fn cleanup_interval(&self) -> Duration {
        parse_duration(&self.query_history_cleanup_interval).expect("validated config")
    }

    pub fn mark_pending_interval(&self) -> Duration {
        parse_duration(&self.query_history_mark_pending_interval).expect("validated config")
    }
}

/// Parses duration strings of the `1h30m15s` family.
pub fn parse_duration(s: &str) -> Result<Duration> {
    let s = s.trim();
    if s.is_empty() {
        bail!("empty duration");
    }
    let mut total = Duration::ZERO;
    let mut num = String::new();
    for ch in s.chars() {
        if ch.is_ascii_digit() {
            num.push(ch);
            continue;
        }
        let value: u64 = num
            .parse()
            .with_context(|| format!("invalid duration `{}`", s))?;
        num.clear();
        let unit = match ch {
            'h' => 3600,
            'm' => 60,
            's' => 1,
            _ => bail!("invalid duration unit `{}` in `{}`", ch, s),
        };
        total += Duration::from_secs(value * unit);
    }
    if !num.is_empty() {
        // a bare number is taken as seconds
        let value: u64 = num
            .parse()
            .with_context(|| format!("invalid duration `{}`", s))?;
        total += Duration::from_secs(value);
    }
    if total.is_zero() {
        bail!("duration `{}` must be > 0", s);
    }
    Ok(total)
}

/// Load configuration from a JSON file.
pub fn load_config(path: &Path) -> Result<Config> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read config file {}", path.display()))?;
    let config: Config = serde_json::from_str(&content)
        .with_context(|| format!("failed to parse config file {}", path.display()))?;
    Ok(config)
}

impl Config {
    /// Validates the configuration and fills derived defaults.
    ///
    /// The archiver and cleaner intervals are both moved to the nearest
    /// prime; if they end up equal, the cleaner's interval is bumped one
    /// prime step so the two sweeps cannot tick in lockstep over the same
    /// archive rows.
    pub fn validate_and_defaults(&mut self) -> Result<()> {
        if self.redis.db == 0 {
            bail!("redis.db must be specified and non-zero");
        }
        if self.redis.queue_key.is_empty() {
            bail!("missing redis.queue_key");
        }
        if self.redis.failed_queue_key.is_empty() {
            bail!("missing redis.failed_queue_key");
        }
        if self.redis.doc_remove_channel.is_empty() {
            bail!("missing redis.doc_remove_channel");
        }

        // archiver
        if self.archiver.dd_state_file_path.is_empty() {
            bail!("missing path to deduplicator state file (archiver.dd_state_file_path)");
        }
        let tuned = nearest_prime(self.archiver.check_interval_secs)?;
        if tuned != self.archiver.check_interval_secs {
            tracing::warn!(
                old_value = self.archiver.check_interval_secs,
                new_value = tuned,
                "tuned archiver.check_interval_secs so it cannot be easily overlapped by other timers"
            );
            self.archiver.check_interval_secs = tuned;
        }
        if self.archiver.check_interval_chunk == 0 {
            bail!("archiver.check_interval_chunk must be > 0");
        }
        if self.archiver.preload_last_n_items == 0 {
            self.archiver.preload_last_n_items = DFLT_PRELOAD_LAST_N_ITEMS;
            tracing::warn!(
                value = self.archiver.preload_last_n_items,
                "archiver.preload_last_n_items not set, using default"
            );
        }

        // cleaner
        if self.cleaner.check_interval_secs < MIN_ALLOWED_CHECK_INTERVAL {
            bail!(
                "invalid value {} for cleaner.check_interval_secs (must be >= {})",
                self.cleaner.check_interval_secs,
                MIN_ALLOWED_CHECK_INTERVAL
            );
        }
        let mut tuned = nearest_prime(self.cleaner.check_interval_secs)?;
        if tuned == self.archiver.check_interval_secs {
            tuned = nearest_prime(tuned + 1)?;
        }
        if tuned != self.cleaner.check_interval_secs {
            tracing::warn!(
                old_value = self.cleaner.check_interval_secs,
                new_value = tuned,
                "tuned cleaner.check_interval_secs so it does not overlap with the archiver interval"
            );
            self.cleaner.check_interval_secs = tuned;
        }
        if self.cleaner.num_process_items_per_tick < 1
            || self.cleaner.num_process_items_per_tick > 5000
        {
            bail!("invalid value for cleaner.num_process_items_per_tick (must be between 1 and 5000)");
        }
        if self.cleaner.num_process_items_per_tick_night == 0 {
            self.cleaner.num_process_items_per_tick_night =
                self.cleaner.num_process_items_per_tick * DFLT_NIGHT_ITEMS_INCREASE;
            tracing::warn!(
                value = self.cleaner.num_process_items_per_tick_night,
                "cleaner.num_process_items_per_tick_night not defined - using calculated default"
            );
        }
        if self.cleaner.status_key.is_empty() {
            self.cleaner.status_key = DFLT_STATUS_KEY.to_owned();
            tracing::warn!(
                value = DFLT_STATUS_KEY,
                "cleaner.status_key missing, using default"
            );
        }
        if self.cleaner.min_age_days_unvisited < MIN_AGE_DAYS_UNVISITED_LIMIT {
            bail!(
                "cleaner.min_age_days_unvisited invalid (must be >= {})",
                MIN_AGE_DAYS_UNVISITED_LIMIT
            );
        }

        // indexer
        if self.indexer.index_dir_path.is_empty() {
            bail!("missing path to index dir (indexer.index_dir_path)");
        }
        if self.indexer.query_history_num_preserve == 0 {
            bail!("indexer.query_history_num_preserve not specified (recommended > 100)");
        }
        parse_duration(&self.indexer.query_history_cleanup_interval)
            .context("failed to validate indexer.query_history_cleanup_interval")?;
        parse_duration(&self.indexer.query_history_mark_pending_interval)
            .context("failed to validate indexer.query_history_mark_pending_interval")?;
        if self.indexer.query_history_max_num_delete_at_once == 0 {
            bail!("indexer.query_history_max_num_delete_at_once must be > 0");
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_config() -> Config {
        serde_json::from_value(serde_json::json!({
            "mysql": {
                "host": "localhost", "name": "kontext", "user": "camus", "password": "s"
            },
            "redis": {
                "host": "localhost", "db": 1,
                "queue_key": "conc_archive_queue",
                "failed_queue_key": "conc_archive_failed",
                "doc_remove_channel": "doc_remove"
            },
            "archiver": {
                "dd_state_file_path": "/tmp/dd.bin",
                "check_interval_secs": 60,
                "check_interval_chunk": 100
            },
            "cleaner": {
                "check_interval_secs": 60,
                "num_process_items_per_tick": 50,
                "min_age_days_unvisited": 365
            },
            "indexer": {
                "index_dir_path": "/tmp/ftindex",
                "query_history_num_preserve": 100,
                "query_history_cleanup_interval": "30s",
                "query_history_mark_pending_interval": "12h",
                "query_history_max_num_delete_at_once": 20
            }
        }))
        .unwrap()
    }

    #[test]
    fn intervals_are_tuned_to_distinct_primes() {
        let mut conf = sample_config();
        conf.validate_and_defaults().unwrap();
        assert_eq!(conf.archiver.check_interval_secs, 61);
        // equal request is bumped one prime step past the archiver's value
        assert_eq!(conf.cleaner.check_interval_secs, 67);
    }

    #[test]
    fn night_batch_defaults_to_twice_daytime() {
        let mut conf = sample_config();
        conf.validate_and_defaults().unwrap();
        assert_eq!(conf.cleaner.num_process_items_per_tick_night, 100);
        assert_eq!(conf.cleaner.status_key, "camus_cleanup_status");
        assert_eq!(conf.archiver.preload_last_n_items, 500);
    }

    #[test]
    fn zero_redis_db_is_rejected() {
        let mut conf = sample_config();
        conf.redis.db = 0;
        assert!(conf.validate_and_defaults().is_err());
    }

    #[test]
    fn too_young_deletion_age_is_rejected() {
        let mut conf = sample_config();
        conf.cleaner.min_age_days_unvisited = 10;
        assert!(conf.validate_and_defaults().is_err());
    }

    #[test]
    fn duration_strings_parse() {
        assert_eq!(parse_duration("30s").unwrap(), Duration::from_secs(30));
        assert_eq!(parse_duration("5m").unwrap(), Duration::from_secs(300));
        assert_eq!(
            parse_duration("1h30m15s").unwrap(),
            Duration::from_secs(5415)
        );
        assert_eq!(parse_duration("90").unwrap(), Duration::from_secs(90));
        assert!(parse_duration("").is_err());
        assert!(parse_duration("5x").is_err());
        assert!(parse_duration("0s").is_err());
    }
}
