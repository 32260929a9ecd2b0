use bytes::Bytes;

use crate::database::wire::{MutationOp, RowFilter, TimestampRange};
use crate::filter::Filter;
use crate::types::Timestamp;

/// A set of changes for a single row, applied atomically.
///
/// All timestamps are truncated to millisecond granularity except
/// `Timestamp::SERVER_TIME`.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Mutation {
    ops: Vec<MutationOp>,
    condition: Option<Condition>,
}

#[derive(Debug, Clone, PartialEq)]
pub(crate) struct Condition {
    pub predicate: RowFilter,
    pub if_true: Option<Box<Mutation>>,
    pub if_false: Option<Box<Mutation>>,
}

impl Mutation {
    pub fn new() -> Self {
        Self::default()
    }

    /// A mutation that applies `if_true` when `cond` matches any cell in the
    /// row and `if_false` otherwise. Conditional mutations cannot be applied
    /// in bulk.
    pub fn conditional(
        cond: impl Filter,
        if_true: Option<Mutation>,
        if_false: Option<Mutation>,
    ) -> Self {
        Self {
            ops: Vec::new(),
            condition: Some(Condition {
                predicate: cond.to_predicate(),
                if_true: if_true.map(Box::new),
                if_false: if_false.map(Box::new),
            }),
        }
    }

    /// Set a value in `family:column`. `Timestamp::SERVER_TIME` lets the
    /// server pick the timestamp, which makes the mutation non-idempotent.
    pub fn set(
        &mut self,
        family: &str,
        column: impl AsRef<[u8]>,
        ts: Timestamp,
        value: impl Into<Bytes>,
    ) -> &mut Self {
        self.ops.push(MutationOp::SetCell {
            family_name: family.to_string(),
            column_qualifier: Bytes::copy_from_slice(column.as_ref()),
            timestamp_micros: ts.truncate_to_milliseconds().micros(),
            value: value.into(),
        });
        self
    }

    pub fn delete_cells_in_column(&mut self, family: &str, column: impl AsRef<[u8]>) -> &mut Self {
        self.ops.push(MutationOp::DeleteFromColumn {
            family_name: family.to_string(),
            column_qualifier: Bytes::copy_from_slice(column.as_ref()),
            time_range: None,
        });
        self
    }

    /// Delete cells of `family:column` with timestamps in `[start, end)`.
    /// An `end` of zero is infinity.
    pub fn delete_timestamp_range(
        &mut self,
        family: &str,
        column: impl AsRef<[u8]>,
        start: Timestamp,
        end: Timestamp,
    ) -> &mut Self {
        self.ops.push(MutationOp::DeleteFromColumn {
            family_name: family.to_string(),
            column_qualifier: Bytes::copy_from_slice(column.as_ref()),
            time_range: Some(TimestampRange {
                start_timestamp_micros: start.truncate_to_milliseconds().micros(),
                end_timestamp_micros: end.truncate_to_milliseconds().micros(),
            }),
        });
        self
    }

    pub fn delete_cells_in_family(&mut self, family: &str) -> &mut Self {
        self.ops.push(MutationOp::DeleteFromFamily {
            family_name: family.to_string(),
        });
        self
    }

    pub fn delete_row(&mut self) -> &mut Self {
        self.ops.push(MutationOp::DeleteFromRow);
        self
    }

    /// Add to an int64 cell of an aggregate family.
    pub fn add_int_to_cell(
        &mut self,
        family: &str,
        column: impl AsRef<[u8]>,
        ts: Timestamp,
        value: i64,
    ) -> &mut Self {
        self.ops.push(MutationOp::AddToCell {
            family_name: family.to_string(),
            column_qualifier: Bytes::copy_from_slice(column.as_ref()),
            timestamp_micros: ts.truncate_to_milliseconds().micros(),
            input: value,
        });
        self
    }

    /// Merge bytes into an accumulator cell of an aggregate family.
    pub fn merge_bytes_to_cell(
        &mut self,
        family: &str,
        column: impl AsRef<[u8]>,
        ts: Timestamp,
        value: impl Into<Bytes>,
    ) -> &mut Self {
        self.ops.push(MutationOp::MergeToCell {
            family_name: family.to_string(),
            column_qualifier: Bytes::copy_from_slice(column.as_ref()),
            timestamp_micros: ts.truncate_to_milliseconds().micros(),
            input: value.into(),
        });
        self
    }

    pub fn ops(&self) -> &[MutationOp] {
        &self.ops
    }

    /// Number of unconditional ops; a conditional mutation has none.
    pub fn len(&self) -> usize {
        self.ops.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ops.is_empty()
    }

    pub fn is_conditional(&self) -> bool {
        self.condition.is_some()
    }

    pub(crate) fn condition(&self) -> Option<&Condition> {
        self.condition.as_ref()
    }
}

/// Whether every op can be replayed without changing its effect, i.e. none
/// of them asks the server to pick the timestamp.
pub fn mutations_are_retryable(ops: &[MutationOp]) -> bool {
    let server_time = Timestamp::SERVER_TIME.micros();
    ops.iter().all(|op| match op {
        MutationOp::SetCell { timestamp_micros, .. }
        | MutationOp::AddToCell { timestamp_micros, .. }
        | MutationOp::MergeToCell { timestamp_micros, .. } => *timestamp_micros != server_time,
        MutationOp::DeleteFromColumn { .. }
        | MutationOp::DeleteFromFamily { .. }
        | MutationOp::DeleteFromRow => true,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::filter::RawFilter;

    #[test]
    fn test_set_truncates_timestamp() {
        let mut m = Mutation::new();
        m.set("cf", "col", Timestamp(1_234_567), "v");
        match &m.ops()[0] {
            MutationOp::SetCell { timestamp_micros, .. } => assert_eq!(*timestamp_micros, 1_234_000),
            other => panic!("unexpected op {other:?}"),
        }
    }

    #[test]
    fn test_server_time_is_not_retryable() {
        let mut m = Mutation::new();
        m.set("cf", "a", Timestamp(1000), "v")
            .set("cf", "b", Timestamp::SERVER_TIME, "v");
        assert!(!mutations_are_retryable(m.ops()));

        let mut m = Mutation::new();
        m.add_int_to_cell("agg", "sum", Timestamp::SERVER_TIME, 1);
        assert!(!mutations_are_retryable(m.ops()));
    }

    #[test]
    fn test_explicit_timestamps_and_deletes_are_retryable() {
        let mut m = Mutation::new();
        m.set("cf", "a", Timestamp(5000), "v")
            .delete_cells_in_column("cf", "b")
            .delete_timestamp_range("cf", "c", Timestamp(1500), Timestamp(0))
            .delete_cells_in_family("old")
            .delete_row();
        assert_eq!(m.len(), 5);
        assert!(mutations_are_retryable(m.ops()));
    }

    #[test]
    fn test_delete_timestamp_range_truncates() {
        let mut m = Mutation::new();
        m.delete_timestamp_range("cf", "c", Timestamp(1500), Timestamp(2999));
        assert_eq!(
            m.ops()[0],
            MutationOp::DeleteFromColumn {
                family_name: "cf".into(),
                column_qualifier: Bytes::from_static(b"c"),
                time_range: Some(TimestampRange {
                    start_timestamp_micros: 1000,
                    end_timestamp_micros: 2000,
                }),
            }
        );
    }

    #[test]
    fn test_conditional_mutation() {
        let mut on_match = Mutation::new();
        on_match.delete_row();
        let m = Mutation::conditional(RawFilter(Bytes::from_static(b"pred")), Some(on_match), None);
        assert!(m.is_conditional());
        assert!(m.ops().is_empty());
        assert_eq!(m.len(), 0);
        assert!(m.is_empty());
        let cond = m.condition().unwrap();
        assert_eq!(cond.predicate.predicate, Bytes::from_static(b"pred"));
        assert!(cond.if_false.is_none());
    }
}
