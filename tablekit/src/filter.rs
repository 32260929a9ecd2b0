use bytes::Bytes;
use std::fmt;

use crate::database::wire::RowFilter;

/// A row filter. The engine only needs its serialized predicate; building
/// predicates is left to the filter implementation.
pub trait Filter: fmt::Debug + Send + Sync {
    fn to_predicate(&self) -> RowFilter;
}

/// A predicate that was serialized elsewhere.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawFilter(pub Bytes);

impl Filter for RawFilter {
    fn to_predicate(&self) -> RowFilter {
        RowFilter {
            predicate: self.0.clone(),
        }
    }
}

impl Filter for RowFilter {
    fn to_predicate(&self) -> RowFilter {
        self.clone()
    }
}
