use bytes::Bytes;
use futures::StreamExt;
use std::collections::VecDeque;
use std::fmt;
use std::sync::Arc;
use std::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error};

use crate::config::ClientConfig;
use crate::database::retry::{backoff_or_fail, Retryer};
use crate::database::transport::{DataTransport, ResponseStream};
use crate::database::wire::{ReadRowsRequest, ReadRowsResponse, RequestStatsView, RowFilter, Target};
use crate::errors::TableError;
use crate::filter::Filter;
use crate::metrics;
use crate::reader::ChunkReader;
use crate::rowset::{RowRange, RowSet};
use crate::types::{FullReadStats, Row};

type StatsCallback = Box<dyn FnMut(&FullReadStats) + Send>;

/// Options for a single read call.
#[derive(Default)]
pub struct ReadOptions {
    limit: Option<u64>,
    filter: Option<RowFilter>,
    reversed: bool,
    stats: Option<StatsCallback>,
}

impl ReadOptions {
    pub fn new() -> Self {
        Self::default()
    }

    /// Stop after `limit` rows in total, across retries.
    pub fn limit(mut self, limit: u64) -> Self {
        self.limit = Some(limit);
        self
    }

    pub fn filter(mut self, filter: impl Filter) -> Self {
        self.filter = Some(filter.to_predicate());
        self
    }

    /// Deliver rows in descending key order.
    pub fn reverse(mut self) -> Self {
        self.reversed = true;
        self
    }

    /// Request full read statistics and hand each report to `callback`.
    pub fn full_read_stats(mut self, callback: impl FnMut(&FullReadStats) + Send + 'static) -> Self {
        self.stats = Some(Box::new(callback));
        self
    }
}

impl fmt::Debug for ReadOptions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ReadOptions")
            .field("limit", &self.limit)
            .field("filter", &self.filter)
            .field("reversed", &self.reversed)
            .field("full_read_stats", &self.stats.is_some())
            .finish()
    }
}

enum Pending {
    Row(Row),
    /// The server scanned up to here without returning anything more.
    Scanned(Bytes),
}

/// One open `ReadRows` stream.
struct Attempt {
    stream: ResponseStream<ReadRowsResponse>,
    reader: ChunkReader,
    pending: VecDeque<Pending>,
    cancel: CancellationToken,
}

impl Drop for Attempt {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

/// A pull cursor over the rows of a scan.
///
/// Failed streams are reopened transparently, narrowed to the rows that
/// were not delivered yet. Dropping the scanner cancels any open stream;
/// call [`RowScanner::stop`] to also drain it.
pub struct RowScanner {
    transport: Arc<dyn DataTransport>,
    target: Target,
    app_profile_id: String,
    drain_limit: usize,
    retryer: Retryer,

    rows: Option<RowSet>,
    limit: Option<u64>,
    filter: Option<RowFilter>,
    reversed: bool,
    stats: Option<StatsCallback>,

    prev_row_key: Bytes,
    num_rows_read: u64,
    attempt: Option<Attempt>,
    cancel: CancellationToken,
    started: Instant,
    done: bool,
}

impl RowScanner {
    pub(crate) fn new(
        transport: Arc<dyn DataTransport>,
        config: &ClientConfig,
        target: Target,
        rows: Option<RowSet>,
        opts: ReadOptions,
    ) -> Self {
        Self {
            transport,
            target,
            app_profile_id: config.app_profile.clone(),
            drain_limit: config.drain_limit,
            retryer: Retryer::new(&config.retry),
            rows,
            limit: opts.limit,
            filter: opts.filter,
            reversed: opts.reversed,
            stats: opts.stats,
            prev_row_key: Bytes::new(),
            num_rows_read: 0,
            attempt: None,
            cancel: CancellationToken::new(),
            started: Instant::now(),
            done: false,
        }
    }

    /// Rows delivered so far.
    pub fn rows_read(&self) -> u64 {
        self.num_rows_read
    }

    /// The next row, or `None` once the scan is complete.
    pub async fn next(&mut self) -> Result<Option<Row>, TableError> {
        loop {
            if self.done {
                return Ok(None);
            }

            let Some(attempt) = self.attempt.as_mut() else {
                if !self.start_attempt().await? {
                    self.finish(true);
                }
                continue;
            };

            if let Some(event) = attempt.pending.pop_front() {
                match event {
                    Pending::Row(row) => {
                        self.prev_row_key = row.key().clone();
                        self.num_rows_read += 1;
                        return Ok(Some(row));
                    }
                    Pending::Scanned(key) => {
                        self.prev_row_key = key;
                        continue;
                    }
                }
            }

            match attempt.stream.next().await {
                Some(Ok(response)) => {
                    if let (Some(stats), Some(callback)) = (&response.request_stats, self.stats.as_mut()) {
                        callback(&FullReadStats::from_proto(stats));
                    }
                    if let Err(err) = Self::absorb(attempt, response) {
                        error!("Aborting scan of {}: {}", self.target.name(), err);
                        self.attempt = None;
                        self.finish(false);
                        return Err(err);
                    }
                }
                Some(Err(status)) => {
                    self.attempt = None;
                    self.narrow();
                    if let Err(err) = backoff_or_fail(&mut self.retryer, "read_rows", status).await {
                        self.finish(false);
                        return Err(err);
                    }
                }
                None => {
                    let closed = attempt.reader.close();
                    self.attempt = None;
                    if let Err(err) = closed {
                        self.finish(false);
                        return Err(err);
                    }
                    self.finish(true);
                }
            }
        }
    }

    /// End the scan early: cancel the open stream and drain a bounded number
    /// of in-flight messages. Never fails.
    pub async fn stop(&mut self) {
        if let Some(mut attempt) = self.attempt.take() {
            attempt.cancel.cancel();
            let mut drained = 0;
            while drained < self.drain_limit {
                match attempt.stream.next().await {
                    Some(Ok(_)) => drained += 1,
                    _ => break,
                }
            }
            debug!("Stopped scan of {} after draining {} messages", self.target.name(), drained);
        }
        self.finish(true);
    }

    /// Open a new stream for the rows still to read. Returns `false` when
    /// there is nothing left to ask for.
    async fn start_attempt(&mut self) -> Result<bool, TableError> {
        loop {
            let mut rows_limit = 0;
            if let Some(limit) = self.limit {
                let remaining = limit.saturating_sub(self.num_rows_read);
                if remaining == 0 {
                    return Ok(false);
                }
                rows_limit = i64::try_from(remaining).unwrap_or(i64::MAX);
            }
            if let Some(rows) = &self.rows {
                if !rows.is_valid() {
                    debug!("Row set for {} is empty, skipping read", self.target.name());
                    return Ok(false);
                }
            }

            let request = ReadRowsRequest {
                target: self.target.clone(),
                app_profile_id: self.app_profile_id.clone(),
                rows: self.rows.as_ref().map(RowSet::to_proto),
                filter: self.filter.clone(),
                rows_limit,
                reversed: self.reversed,
                request_stats_view: if self.stats.is_some() {
                    RequestStatsView::Full
                } else {
                    RequestStatsView::None
                },
            };
            debug!(
                "ReadRows on {} (attempt {}, rows_limit {})",
                self.target.name(),
                self.retryer.attempts() + 1,
                rows_limit
            );

            let cancel = self.cancel.child_token();
            match self.transport.read_rows(request, cancel.clone()).await {
                Ok(stream) => {
                    self.attempt = Some(Attempt {
                        stream,
                        reader: if self.reversed {
                            ChunkReader::reversed()
                        } else {
                            ChunkReader::new()
                        },
                        pending: VecDeque::new(),
                        cancel,
                    });
                    return Ok(true);
                }
                Err(status) => {
                    if let Err(err) = backoff_or_fail(&mut self.retryer, "read_rows", status).await {
                        self.finish(false);
                        return Err(err);
                    }
                }
            }
        }
    }

    fn absorb(attempt: &mut Attempt, response: ReadRowsResponse) -> Result<(), TableError> {
        for chunk in &response.chunks {
            if let Some(row) = attempt.reader.process(chunk)? {
                attempt.pending.push_back(Pending::Row(row));
            }
        }
        if let Some(key) = response.last_scanned_row_key {
            attempt.pending.push_back(Pending::Scanned(key));
        }
        Ok(())
    }

    /// Drop everything up to and including the last delivered or scanned key.
    fn narrow(&mut self) {
        let rows = self
            .rows
            .take()
            .unwrap_or_else(|| RowSet::Range(RowRange::infinite("")));
        self.rows = Some(if self.reversed {
            rows.retain_rows_before(&self.prev_row_key)
        } else {
            rows.retain_rows_after(&self.prev_row_key)
        });
    }

    fn finish(&mut self, success: bool) {
        if self.done {
            return;
        }
        self.done = true;
        metrics::record_operation("read_rows", success, self.started.elapsed().as_secs_f64());
    }
}

impl Drop for RowScanner {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

impl fmt::Debug for RowScanner {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RowScanner")
            .field("target", &self.target)
            .field("rows", &self.rows)
            .field("prev_row_key", &self.prev_row_key)
            .field("num_rows_read", &self.num_rows_read)
            .field("done", &self.done)
            .finish()
    }
}
