// tablekit/src/database/wire.rs
//
// Wire-level messages exchanged with the table service.
// Field semantics mirror the service's RPC definitions; the transport is
// responsible for encoding them.
//

use bytes::Bytes;
use std::time::Duration;

/// The resource a request is addressed to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Target {
    Table(String),
    AuthorizedView(String),
    MaterializedView(String),
}

impl Target {
    pub fn name(&self) -> &str {
        match self {
            Target::Table(name) | Target::AuthorizedView(name) | Target::MaterializedView(name) => {
                name
            }
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum KeyBound {
    Open(Bytes),
    Closed(Bytes),
}

/// A range of row keys. A missing bound is unbounded.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct RowRangeProto {
    pub start_key: Option<KeyBound>,
    pub end_key: Option<KeyBound>,
}

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct RowSetProto {
    pub row_keys: Vec<Bytes>,
    pub row_ranges: Vec<RowRangeProto>,
}

/// A serialized row filter predicate. Opaque to the client.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RowFilter {
    pub predicate: Bytes,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum RequestStatsView {
    #[default]
    None,
    Full,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReadRowsRequest {
    pub target: Target,
    pub app_profile_id: String,
    pub rows: Option<RowSetProto>,
    pub filter: Option<RowFilter>,
    /// Zero means no limit.
    pub rows_limit: i64,
    pub reversed: bool,
    pub request_stats_view: RequestStatsView,
}

/// One incremental piece of a row.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct CellChunk {
    /// Empty means "same row as the previous chunk".
    pub row_key: Bytes,
    pub family_name: Option<String>,
    pub qualifier: Option<Bytes>,
    pub timestamp_micros: i64,
    pub labels: Vec<String>,
    pub value: Bytes,
    /// Non-zero when more chunks of this cell's value follow.
    pub value_size: i32,
    pub reset_row: bool,
    pub commit_row: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct IterationStats {
    pub rows_seen_count: i64,
    pub rows_returned_count: i64,
    pub cells_seen_count: i64,
    pub cells_returned_count: i64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct LatencyStats {
    pub frontend_server_latency: Duration,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct FullReadStatsView {
    pub read_iteration_stats: Option<IterationStats>,
    pub request_latency_stats: Option<LatencyStats>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct RequestStats {
    pub full_read_stats_view: Option<FullReadStatsView>,
}

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct ReadRowsResponse {
    pub chunks: Vec<CellChunk>,
    /// Rows up to and including this key were scanned server-side, even if
    /// none of them were returned.
    pub last_scanned_row_key: Option<Bytes>,
    pub request_stats: Option<RequestStats>,
}

/// Half-open `[start, end)` timestamp interval. An end of zero is infinity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct TimestampRange {
    pub start_timestamp_micros: i64,
    pub end_timestamp_micros: i64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MutationOp {
    SetCell {
        family_name: String,
        column_qualifier: Bytes,
        timestamp_micros: i64,
        value: Bytes,
    },
    DeleteFromColumn {
        family_name: String,
        column_qualifier: Bytes,
        time_range: Option<TimestampRange>,
    },
    DeleteFromFamily {
        family_name: String,
    },
    DeleteFromRow,
    AddToCell {
        family_name: String,
        column_qualifier: Bytes,
        timestamp_micros: i64,
        input: i64,
    },
    MergeToCell {
        family_name: String,
        column_qualifier: Bytes,
        timestamp_micros: i64,
        input: Bytes,
    },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MutateRowsEntry {
    pub row_key: Bytes,
    pub mutations: Vec<MutationOp>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MutateRowsRequest {
    pub target: Target,
    pub app_profile_id: String,
    pub entries: Vec<MutateRowsEntry>,
}

/// Outcome of the entry at `index` in the request that produced it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EntryStatus {
    pub index: usize,
    pub code: i32,
    pub message: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct MutateRowsResponse {
    pub entries: Vec<EntryStatus>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MutateRowRequest {
    pub target: Target,
    pub app_profile_id: String,
    pub row_key: Bytes,
    pub mutations: Vec<MutationOp>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CheckAndMutateRowRequest {
    pub target: Target,
    pub app_profile_id: String,
    pub row_key: Bytes,
    pub predicate_filter: Option<RowFilter>,
    pub true_mutations: Vec<MutationOp>,
    pub false_mutations: Vec<MutationOp>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct CheckAndMutateRowResponse {
    pub predicate_matched: bool,
}
