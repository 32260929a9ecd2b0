use bytes::{BufMut, Bytes, BytesMut};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::time::Duration;

use crate::database::wire::RequestStats;

/// Microseconds since 1 January 1970.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize)]
pub struct Timestamp(pub i64);

impl Timestamp {
    /// Ask the server to assign its own timestamp.
    pub const SERVER_TIME: Timestamp = Timestamp(-1);

    pub fn from_micros(micros: i64) -> Self {
        Timestamp(micros)
    }

    pub fn micros(self) -> i64 {
        self.0
    }

    pub fn from_datetime(dt: DateTime<Utc>) -> Self {
        Timestamp(dt.timestamp_micros())
    }

    /// The current client time.
    pub fn now() -> Self {
        Self::from_datetime(Utc::now())
    }

    /// Convert back to a calendar time. Returns `None` for out-of-range values.
    pub fn to_datetime(self) -> Option<DateTime<Utc>> {
        let secs = self.0.div_euclid(1_000_000);
        let nanos = (self.0.rem_euclid(1_000_000) * 1_000) as u32;
        DateTime::from_timestamp(secs, nanos)
    }

    /// Truncate to millisecond granularity, the only granularity the server
    /// accepts. `SERVER_TIME` is left untouched.
    pub fn truncate_to_milliseconds(self) -> Self {
        if self == Self::SERVER_TIME {
            return self;
        }
        Timestamp(self.0 - self.0 % 1000)
    }
}

/// A single cell as delivered by a read.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReadItem {
    pub row: Bytes,
    /// `family:qualifier`
    pub column: Bytes,
    pub timestamp: Timestamp,
    pub value: Bytes,
    pub labels: Vec<String>,
}

impl ReadItem {
    pub(crate) fn column_name(family: &str, qualifier: &[u8]) -> Bytes {
        let mut column = BytesMut::with_capacity(family.len() + 1 + qualifier.len());
        column.put_slice(family.as_bytes());
        column.put_u8(b':');
        column.put_slice(qualifier);
        column.freeze()
    }

    /// The qualifier part of `column`.
    pub fn qualifier(&self) -> &[u8] {
        match self.column.iter().position(|b| *b == b':') {
            Some(i) => &self.column[i + 1..],
            None => &self.column[..],
        }
    }
}

/// A fully materialized row: cells grouped by column family.
///
/// Cells within a family keep the order in which the server streamed them.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Row {
    key: Bytes,
    families: BTreeMap<String, Vec<ReadItem>>,
}

impl Row {
    pub fn new(key: Bytes) -> Self {
        Self {
            key,
            families: BTreeMap::new(),
        }
    }

    pub fn key(&self) -> &Bytes {
        &self.key
    }

    /// Cells of one family; empty when the family has no cells in this row.
    pub fn family(&self, name: &str) -> &[ReadItem] {
        self.families.get(name).map(Vec::as_slice).unwrap_or(&[])
    }

    pub fn families(&self) -> impl Iterator<Item = (&str, &[ReadItem])> {
        self.families.iter().map(|(name, items)| (name.as_str(), items.as_slice()))
    }

    pub fn cells(&self) -> impl Iterator<Item = &ReadItem> {
        self.families.values().flatten()
    }

    pub fn is_empty(&self) -> bool {
        self.families.is_empty()
    }

    pub(crate) fn push(&mut self, family: &str, item: ReadItem) {
        self.families.entry(family.to_string()).or_default().push(item);
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ReadIterationStats {
    pub cells_returned_count: i64,
    pub cells_seen_count: i64,
    pub rows_returned_count: i64,
    pub rows_seen_count: i64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct RequestLatencyStats {
    /// Latency measured by the frontend server handling the request.
    pub frontend_server_latency: Duration,
}

/// Everything the server reports about how a read was executed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct FullReadStats {
    pub read_iteration_stats: ReadIterationStats,
    pub request_latency_stats: RequestLatencyStats,
}

impl FullReadStats {
    /// Missing sections are reported as zeroes rather than failing the read.
    pub(crate) fn from_proto(stats: &RequestStats) -> Self {
        let Some(view) = &stats.full_read_stats_view else {
            return Self::default();
        };
        let iteration = view.read_iteration_stats.unwrap_or_default();
        let latency = view.request_latency_stats.unwrap_or_default();
        Self {
            read_iteration_stats: ReadIterationStats {
                cells_returned_count: iteration.cells_returned_count,
                cells_seen_count: iteration.cells_seen_count,
                rows_returned_count: iteration.rows_returned_count,
                rows_seen_count: iteration.rows_seen_count,
            },
            request_latency_stats: RequestLatencyStats {
                frontend_server_latency: latency.frontend_server_latency,
            },
        }
    }
}
