// tablekit/src/rowset.rs
//
// Row sets: which row keys a read covers, and how to shrink a set to the
// keys not yet delivered when a scan resumes.
//

use bytes::Bytes;
use std::fmt;

use crate::database::wire::{KeyBound, RowRangeProto, RowSetProto};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BoundType {
    Unbounded,
    Open,
    Closed,
}

/// A range of rows between a start and end key, each end open, closed or
/// unbounded. An empty key always means unbounded.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RowRange {
    start_bound: BoundType,
    start: Bytes,
    end_bound: BoundType,
    end: Bytes,
}

impl RowRange {
    fn create(
        start_bound: BoundType,
        start: impl AsRef<[u8]>,
        end_bound: BoundType,
        end: impl AsRef<[u8]>,
    ) -> Self {
        let start = Bytes::copy_from_slice(start.as_ref());
        let end = Bytes::copy_from_slice(end.as_ref());
        Self {
            start_bound: if start.is_empty() { BoundType::Unbounded } else { start_bound },
            start,
            end_bound: if end.is_empty() { BoundType::Unbounded } else { end_bound },
            end,
        }
    }

    /// `[begin, end)`
    pub fn new_range(begin: impl AsRef<[u8]>, end: impl AsRef<[u8]>) -> Self {
        Self::closed_open(begin, end)
    }

    /// `[start, end)`
    pub fn closed_open(start: impl AsRef<[u8]>, end: impl AsRef<[u8]>) -> Self {
        Self::create(BoundType::Closed, start, BoundType::Open, end)
    }

    /// `(start, end]`
    pub fn open_closed(start: impl AsRef<[u8]>, end: impl AsRef<[u8]>) -> Self {
        Self::create(BoundType::Open, start, BoundType::Closed, end)
    }

    /// `(start, end)`
    pub fn open(start: impl AsRef<[u8]>, end: impl AsRef<[u8]>) -> Self {
        Self::create(BoundType::Open, start, BoundType::Open, end)
    }

    /// `[start, end]`
    pub fn closed(start: impl AsRef<[u8]>, end: impl AsRef<[u8]>) -> Self {
        Self::create(BoundType::Closed, start, BoundType::Closed, end)
    }

    /// All keys starting with `prefix`.
    pub fn prefix(prefix: impl AsRef<[u8]>) -> Self {
        let end = prefix_successor(prefix.as_ref());
        Self::create(BoundType::Closed, prefix, BoundType::Open, end)
    }

    /// `[start, ∞)`
    pub fn infinite(start: impl AsRef<[u8]>) -> Self {
        Self::create(BoundType::Closed, start, BoundType::Unbounded, b"")
    }

    /// `(∞, end]`
    pub fn infinite_reverse(end: impl AsRef<[u8]>) -> Self {
        Self::create(BoundType::Unbounded, b"", BoundType::Closed, end)
    }

    pub fn start(&self) -> &Bytes {
        &self.start
    }

    pub fn end(&self) -> &Bytes {
        &self.end
    }

    pub fn start_bound(&self) -> BoundType {
        self.start_bound
    }

    pub fn end_bound(&self) -> BoundType {
        self.end_bound
    }

    pub fn unbounded(&self) -> bool {
        self.start_bound == BoundType::Unbounded || self.end_bound == BoundType::Unbounded
    }

    pub fn contains(&self, row: impl AsRef<[u8]>) -> bool {
        let row = row.as_ref();
        let after_start = match self.start_bound {
            BoundType::Open => self.start.as_ref() < row,
            BoundType::Closed => self.start.as_ref() <= row,
            BoundType::Unbounded => true,
        };
        let before_end = match self.end_bound {
            BoundType::Open => row < self.end.as_ref(),
            BoundType::Closed => row <= self.end.as_ref(),
            BoundType::Unbounded => true,
        };
        after_start && before_end
    }

    /// Whether the range can cover at least one row.
    pub fn is_valid(&self) -> bool {
        if self.unbounded() {
            return true;
        }
        // [a,a] is the only degenerate range that still covers a row.
        if self.start_bound == BoundType::Open || self.end_bound == BoundType::Open {
            return self.start < self.end;
        }
        self.start <= self.end
    }

    /// Drop `last_row_key` and everything below it.
    pub fn retain_rows_after(&self, last_row_key: &[u8]) -> RowRange {
        if last_row_key.is_empty() || last_row_key < self.start.as_ref() {
            return self.clone();
        }
        RowRange {
            start_bound: BoundType::Open,
            start: Bytes::copy_from_slice(last_row_key),
            end_bound: self.end_bound,
            end: self.end.clone(),
        }
    }

    /// Drop `last_row_key` and everything above it.
    pub fn retain_rows_before(&self, last_row_key: &[u8]) -> RowRange {
        if last_row_key.is_empty()
            || (self.end_bound != BoundType::Unbounded && self.end.as_ref() < last_row_key)
        {
            return self.clone();
        }
        RowRange {
            start_bound: self.start_bound,
            start: self.start.clone(),
            end_bound: BoundType::Open,
            end: Bytes::copy_from_slice(last_row_key),
        }
    }

    pub(crate) fn to_range_proto(&self) -> RowRangeProto {
        let start_key = match self.start_bound {
            BoundType::Open => Some(KeyBound::Open(self.start.clone())),
            BoundType::Closed => Some(KeyBound::Closed(self.start.clone())),
            BoundType::Unbounded => None,
        };
        let end_key = match self.end_bound {
            BoundType::Open => Some(KeyBound::Open(self.end.clone())),
            BoundType::Closed => Some(KeyBound::Closed(self.end.clone())),
            BoundType::Unbounded => None,
        };
        RowRangeProto { start_key, end_key }
    }
}

impl fmt::Display for RowRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.start_bound {
            BoundType::Open => write!(f, "(\"{}\"", self.start.escape_ascii())?,
            BoundType::Closed => write!(f, "[\"{}\"", self.start.escape_ascii())?,
            BoundType::Unbounded => f.write_str("(∞")?,
        }
        f.write_str(",")?;
        match self.end_bound {
            BoundType::Open => write!(f, "\"{}\")", self.end.escape_ascii()),
            BoundType::Closed => write!(f, "\"{}\"]", self.end.escape_ascii()),
            BoundType::Unbounded => f.write_str("∞)"),
        }
    }
}

/// The set of rows a read covers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RowSet {
    /// Explicit row keys. An empty list matches nothing.
    RowList(Vec<Bytes>),
    Range(RowRange),
    /// The union of the ranges.
    RangeList(Vec<RowRange>),
}

impl RowSet {
    pub fn single_row(row: impl AsRef<[u8]>) -> Self {
        RowSet::RowList(vec![Bytes::copy_from_slice(row.as_ref())])
    }

    pub fn row_list<I, K>(rows: I) -> Self
    where
        I: IntoIterator<Item = K>,
        K: AsRef<[u8]>,
    {
        RowSet::RowList(
            rows.into_iter()
                .map(|k| Bytes::copy_from_slice(k.as_ref()))
                .collect(),
        )
    }

    pub fn to_proto(&self) -> RowSetProto {
        match self {
            RowSet::RowList(keys) => RowSetProto {
                row_keys: keys.clone(),
                row_ranges: Vec::new(),
            },
            RowSet::Range(range) => RowSetProto {
                row_keys: Vec::new(),
                row_ranges: vec![range.to_range_proto()],
            },
            RowSet::RangeList(ranges) => RowSetProto {
                row_keys: Vec::new(),
                row_ranges: ranges.iter().map(RowRange::to_range_proto).collect(),
            },
        }
    }

    /// Whether the set can cover at least one row.
    pub fn is_valid(&self) -> bool {
        match self {
            RowSet::RowList(keys) => !keys.is_empty(),
            RowSet::Range(range) => range.is_valid(),
            RowSet::RangeList(ranges) => ranges.iter().any(RowRange::is_valid),
        }
    }

    /// A set without `last_row_key` or any key lexicographically below it.
    pub fn retain_rows_after(&self, last_row_key: &[u8]) -> RowSet {
        if last_row_key.is_empty() {
            return self.clone();
        }
        match self {
            RowSet::RowList(keys) => RowSet::RowList(
                keys.iter()
                    .filter(|key| key.as_ref() > last_row_key)
                    .cloned()
                    .collect(),
            ),
            RowSet::Range(range) => RowSet::Range(range.retain_rows_after(last_row_key)),
            RowSet::RangeList(ranges) => RowSet::RangeList(
                ranges
                    .iter()
                    .map(|range| range.retain_rows_after(last_row_key))
                    .filter(RowRange::is_valid)
                    .collect(),
            ),
        }
    }

    /// A set without `last_row_key` or any key lexicographically above it.
    pub fn retain_rows_before(&self, last_row_key: &[u8]) -> RowSet {
        if last_row_key.is_empty() {
            return self.clone();
        }
        match self {
            RowSet::RowList(keys) => RowSet::RowList(
                keys.iter()
                    .filter(|key| key.as_ref() < last_row_key)
                    .cloned()
                    .collect(),
            ),
            RowSet::Range(range) => RowSet::Range(range.retain_rows_before(last_row_key)),
            RowSet::RangeList(ranges) => RowSet::RangeList(
                ranges
                    .iter()
                    .map(|range| range.retain_rows_before(last_row_key))
                    .filter(RowRange::is_valid)
                    .collect(),
            ),
        }
    }
}

impl From<RowRange> for RowSet {
    fn from(range: RowRange) -> Self {
        RowSet::Range(range)
    }
}

impl From<Vec<RowRange>> for RowSet {
    fn from(ranges: Vec<RowRange>) -> Self {
        RowSet::RangeList(ranges)
    }
}

/// The lexicographically smallest key greater than every key starting with
/// `prefix`, or empty (unbounded) when no such key exists.
pub fn prefix_successor(prefix: &[u8]) -> Bytes {
    match prefix.iter().rposition(|b| *b != 0xff) {
        Some(n) => {
            let mut successor = prefix[..=n].to_vec();
            successor[n] += 1;
            Bytes::from(successor)
        }
        None => Bytes::new(),
    }
}
