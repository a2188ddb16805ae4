//! # Concordance Archive Manager
//!
//! The archival and query-history layer behind an interactive
//! corpus-linguistics workbench. The workbench persists user query
//! operations (concordances, word lists, keyword queries, paradigmatic
//! queries) into Redis; this crate durably archives them into MySQL with
//! deduplication, maintains a fulltext index of user-addressable query
//! history, periodically prunes the archive, trims per-user history and
//! publishes operational statistics.
//!
//! ## Services
//!
//! | Service | Responsibility |
//! |---------|----------------|
//! | [`archiver::ArchKeeper`] | Drains the archive queue, inserts into the archive, deduplicates in flight, fans out to the index and stats streams |
//! | [`cleaner::Cleaner`] | Sweeps old archive rows: merges variants, deletes unvisited aged rows |
//! | [`indexer::IndexerService`] | Consumes the history stream and the document-removal channel, maintains the fulltext index |
//! | [`histgc::GarbageCollector`] | Two-phase per-user history trimming (mark, then bounded delete) |
//! | [`reporting::StatusReporter`] | Consumes the stats stream and forwards to the reporting sink |
//!
//! Cross-service communication is exclusively via typed channels; a single
//! shutdown signal is propagated to every service and each stops within a
//! bounded time.

pub mod archiver;
pub mod archstore;
pub mod cleaner;
pub mod config;
pub mod cqlprops;
pub mod db;
pub mod dedup;
pub mod docs;
pub mod error;
pub mod histgc;
pub mod histinit;
pub mod histstore;
pub mod indexer;
pub mod kvstore;
pub mod models;
pub mod reporting;
pub mod server;
pub mod transform;
pub mod util;
