//! Operational statistics and the reporting contract.
//!
//! The concrete reporting backend (a TimescaleDB writer in production) is an
//! external collaborator; the services only depend on the [`Reporting`]
//! trait. Two implementations ship with the crate: [`DummyWriter`] (used
//! when no reporting backend is configured) and [`LogWriter`] which emits
//! every status record as a structured log line.
//!
//! The [`StatusReporter`] service drains the archiver's stats fan-out
//! stream and forwards per-corpus usage events to the sink.

use async_trait::async_trait;
use serde::Serialize;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;

use crate::models::CorpusBoundRecord;

/// Counters of one archiver run (or the running totals across runs).
#[derive(Debug, Clone, Copy, Default, Serialize)]
pub struct OpStats {
    pub num_errors: usize,
    pub num_merged: usize,
    pub num_inserted: usize,
    pub num_fetched: usize,
}

impl OpStats {
    pub fn update_by(&mut self, other: OpStats) {
        self.num_errors += other.num_errors;
        self.num_merged += other.num_merged;
        self.num_inserted += other.num_inserted;
        self.num_fetched += other.num_fetched;
    }
}

/// Counters of one cleaner sweep.
#[derive(Debug, Clone, Copy, Default, Serialize)]
pub struct CleanupStats {
    pub num_fetched: usize,
    pub num_merged: usize,
    pub num_deleted: usize,
    pub num_errors: usize,
}

/// Result of one history GC delete phase, combined with the current sizes
/// of both stores so index/table growth can be charted over time.
#[derive(Debug, Clone, Copy, Default, Serialize)]
pub struct QueryHistoryDelStats {
    pub num_deleted: usize,
    pub num_errors: usize,
    pub index_size: i64,
    pub sql_table_size: i64,
}

/// One archived query attributed to its corpus, as consumed from the
/// archiver's stats stream.
#[derive(Debug, Clone, Serialize)]
pub struct CorpusUsage {
    pub corpname: String,
    pub corpus_size: i64,
    pub flagged_as_slow: bool,
}

/// Sink for operational status records.
#[async_trait]
pub trait Reporting: Send + Sync {
    async fn write_operations_status(&self, stats: OpStats);
    async fn write_cleanup_status(&self, stats: CleanupStats);
    async fn write_query_history_deletion_status(&self, stats: QueryHistoryDelStats);
    async fn write_corpus_usage(&self, usage: CorpusUsage);
}

/// No-op sink used when reporting is not configured.
pub struct DummyWriter;

#[async_trait]
impl Reporting for DummyWriter {
    async fn write_operations_status(&self, _stats: OpStats) {}
    async fn write_cleanup_status(&self, _stats: CleanupStats) {}
    async fn write_query_history_deletion_status(&self, _stats: QueryHistoryDelStats) {}
    async fn write_corpus_usage(&self, _usage: CorpusUsage) {}
}

/// Sink emitting every status record as a structured log line.
pub struct LogWriter;

#[async_trait]
impl Reporting for LogWriter {
    async fn write_operations_status(&self, stats: OpStats) {
        tracing::info!(
            num_inserted = stats.num_inserted,
            num_merged = stats.num_merged,
            num_errors = stats.num_errors,
            num_fetched = stats.num_fetched,
            "archiver operations status"
        );
    }

    async fn write_cleanup_status(&self, stats: CleanupStats) {
        tracing::info!(
            num_fetched = stats.num_fetched,
            num_merged = stats.num_merged,
            num_deleted = stats.num_deleted,
            num_errors = stats.num_errors,
            "cleanup status"
        );
    }

    async fn write_query_history_deletion_status(&self, stats: QueryHistoryDelStats) {
        tracing::info!(
            num_deleted = stats.num_deleted,
            num_errors = stats.num_errors,
            index_size = stats.index_size,
            sql_table_size = stats.sql_table_size,
            "query history deletion status"
        );
    }

    async fn write_corpus_usage(&self, usage: CorpusUsage) {
        tracing::info!(
            corpname = %usage.corpname,
            corpus_size = usage.corpus_size,
            flagged_as_slow = usage.flagged_as_slow,
            "corpus usage"
        );
    }
}

/// Consumer of the archiver's stats fan-out stream.
pub struct StatusReporter {
    reporting: std::sync::Arc<dyn Reporting>,
}

impl StatusReporter {
    pub fn new(reporting: std::sync::Arc<dyn Reporting>) -> Self {
        Self { reporting }
    }

    /// Drains the stats stream until it closes or shutdown is signalled.
    pub fn start(
        &self,
        mut stats_stream: mpsc::Receiver<CorpusBoundRecord>,
        mut shutdown: watch::Receiver<bool>,
    ) -> JoinHandle<()> {
        let reporting = self.reporting.clone();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = shutdown.changed() => {
                        tracing::info!("about to close StatusReporter");
                        return;
                    }
                    msg = stats_stream.recv() => {
                        let Some(item) = msg else {
                            tracing::info!("stats stream closed, stopping StatusReporter");
                            return;
                        };
                        let flagged = item
                            .rec
                            .fetch_data()
                            .map(|d| d.is_flagged_as_slow())
                            .unwrap_or(false);
                        reporting
                            .write_corpus_usage(CorpusUsage {
                                corpname: item.corpname,
                                corpus_size: item.corpus_size,
                                flagged_as_slow: flagged,
                            })
                            .await;
                    }
                }
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn op_stats_accumulate() {
        let mut total = OpStats::default();
        total.update_by(OpStats {
            num_errors: 1,
            num_merged: 2,
            num_inserted: 3,
            num_fetched: 6,
        });
        total.update_by(OpStats {
            num_errors: 0,
            num_merged: 1,
            num_inserted: 4,
            num_fetched: 5,
        });
        assert_eq!(total.num_errors, 1);
        assert_eq!(total.num_merged, 3);
        assert_eq!(total.num_inserted, 7);
        assert_eq!(total.num_fetched, 11);
    }
}
