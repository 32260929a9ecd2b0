use bytes::Bytes;
use futures::StreamExt;
use std::ops::Range;
use tracing::{debug, error};

use crate::config::ClientConfig;
use crate::database::retry::{backoff_or_fail, is_idempotent_retry_code, Retryer};
use crate::database::transport::DataTransport;
use crate::database::wire::{MutateRowsEntry, MutateRowsRequest, Target};
use crate::errors::{Code, Status, TableError};
use crate::mutation::{mutations_are_retryable, Mutation};

/// Status used to drive the retry policy when only some entries failed.
const PARTIAL_FAILURE_MSG: &str = "Synthetic error: partial failure of ApplyBulk";

/// One row of a bulk apply and what happened to it so far.
#[derive(Debug, Clone)]
pub(crate) struct EntryErr {
    pub entry: MutateRowsEntry,
    /// Status the server reported for this entry in its latest attempt.
    pub err: Option<TableError>,
    /// Failure of the latest attempt that included this entry, if it broke
    /// off before the entry's status arrived.
    pub top_level_err: Option<TableError>,
    /// Whether the server ever reported a status for this entry.
    pub reported: bool,
}

impl EntryErr {
    fn new(row_key: Bytes, mutation: &Mutation) -> Self {
        Self {
            entry: MutateRowsEntry {
                row_key,
                mutations: mutation.ops().to_vec(),
            },
            err: None,
            top_level_err: None,
            reported: false,
        }
    }

    fn should_retry(&self) -> bool {
        matches!(&self.err, Some(err) if is_idempotent_retry_code(err.code()))
            && mutations_are_retryable(&self.entry.mutations)
    }
}

/// Split `entries` into consecutive groups of at most `max_mutations` ops.
///
/// Entries are never split; an entry larger than the limit gets a group of
/// its own.
pub(crate) fn group_entries(entries: &[EntryErr], max_mutations: usize) -> Vec<Range<usize>> {
    let mut groups = Vec::new();
    let mut start = 0;
    let mut group_muts = 0;
    for (i, entry) in entries.iter().enumerate() {
        let entry_muts = entry.entry.mutations.len();
        if group_muts + entry_muts > max_mutations && i > start {
            groups.push(start..i);
            start = i;
            group_muts = 0;
        }
        group_muts += entry_muts;
    }
    if start < entries.len() {
        groups.push(start..entries.len());
    }
    groups
}

/// Runs one bulk apply against a target.
pub(crate) struct BulkWriter<'a> {
    pub transport: &'a dyn DataTransport,
    pub config: &'a ClientConfig,
    pub target: &'a Target,
}

impl BulkWriter<'_> {
    pub async fn apply<K: AsRef<[u8]>>(
        &self,
        row_keys: &[K],
        muts: &[Mutation],
    ) -> Result<Option<Vec<Option<TableError>>>, TableError> {
        if row_keys.len() != muts.len() {
            return Err(TableError::InvalidArgument(format!(
                "mismatched row keys and mutation array lengths: {}, {}",
                row_keys.len(),
                muts.len()
            )));
        }
        if muts.iter().any(Mutation::is_conditional) {
            return Err(TableError::InvalidArgument(
                "conditional mutations cannot be applied in bulk".to_string(),
            ));
        }

        let mut entries: Vec<EntryErr> = row_keys
            .iter()
            .zip(muts)
            .map(|(key, m)| EntryErr::new(Bytes::copy_from_slice(key.as_ref()), m))
            .collect();

        let groups = group_entries(&entries, self.config.max_mutations);
        let mut first_group_err = None;
        let mut num_failed = 0;
        for group in &groups {
            if let Err(err) = self.apply_group(&mut entries, group.clone()).await {
                error!(
                    "Bulk group of {} entries on {} failed: {}",
                    group.len(),
                    self.target.name(),
                    err
                );
                first_group_err.get_or_insert(err);
                num_failed += 1;
            }
        }

        if num_failed == groups.len() {
            return match first_group_err {
                Some(err) => Err(err),
                None => Ok(None),
            };
        }

        let errs: Vec<Option<TableError>> = entries
            .into_iter()
            .map(|entry| entry.err.or(entry.top_level_err))
            .collect();
        if errs.iter().all(Option::is_none) {
            return Ok(None);
        }
        Ok(Some(errs))
    }

    /// Apply one group, retrying the entries that failed retryably until the
    /// policy gives up.
    ///
    /// Fails only when the group never got a single per-entry status back;
    /// otherwise the outcome is left on the entries.
    async fn apply_group(&self, entries: &mut [EntryErr], group: Range<usize>) -> Result<(), TableError> {
        let mut retryer = Retryer::new(&self.config.retry);
        let mut attempt: Vec<usize> = group.clone().collect();
        loop {
            let result = match self.do_apply_bulk(entries, &attempt).await {
                Ok(()) => {
                    attempt.retain(|&i| entries[i].should_retry());
                    if attempt.is_empty() {
                        return Ok(());
                    }
                    debug!("Retrying {} failed entries on {}", attempt.len(), self.target.name());
                    let status = Status::new(Code::DeadlineExceeded, PARTIAL_FAILURE_MSG);
                    backoff_or_fail(&mut retryer, "mutate_rows", status).await
                }
                Err(TableError::Status(status)) => backoff_or_fail(&mut retryer, "mutate_rows", status).await,
                Err(err) => Err(err),
            };
            if let Err(err) = result {
                if entries[group.clone()].iter().any(|entry| entry.reported) {
                    return Ok(());
                }
                return Err(err);
            }
        }
    }

    /// A single MutateRows call for the entries at `indices`. Per-entry
    /// outcomes are written back to `entries`.
    async fn do_apply_bulk(&self, entries: &mut [EntryErr], indices: &[usize]) -> Result<(), TableError> {
        let mut reported = vec![false; indices.len()];
        let result = self.send(entries, indices, &mut reported).await;
        let top_level_err = result.as_ref().err().cloned();
        for (&i, &seen) in indices.iter().zip(&reported) {
            entries[i].top_level_err = if seen { None } else { top_level_err.clone() };
        }
        result
    }

    async fn send(
        &self,
        entries: &mut [EntryErr],
        indices: &[usize],
        reported: &mut [bool],
    ) -> Result<(), TableError> {
        let request = MutateRowsRequest {
            target: self.target.clone(),
            app_profile_id: self.config.app_profile.clone(),
            entries: indices.iter().map(|&i| entries[i].entry.clone()).collect(),
        };
        debug!("MutateRows on {} with {} entries", self.target.name(), indices.len());

        let mut stream = self.transport.mutate_rows(request).await?;
        while let Some(response) = stream.next().await {
            for status in response?.entries {
                let Some(&i) = indices.get(status.index) else {
                    return Err(TableError::Protocol(format!(
                        "entry index {} out of range for a request of {} entries",
                        status.index,
                        indices.len()
                    )));
                };
                reported[status.index] = true;
                entries[i].reported = true;
                let code = Code::from_i32(status.code);
                entries[i].err = if code == Code::Ok {
                    None
                } else {
                    Some(TableError::Status(Status::new(code, status.message)))
                };
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::Timestamp;

    fn entry_with(ops: usize) -> EntryErr {
        let mut m = Mutation::new();
        for i in 0..ops {
            m.set("cf", format!("c{i}"), Timestamp(1000), "v");
        }
        EntryErr::new(Bytes::from_static(b"row"), &m)
    }

    fn sizes(entries: &[EntryErr], groups: &[Range<usize>]) -> Vec<usize> {
        groups
            .iter()
            .map(|g| entries[g.clone()].iter().map(|e| e.entry.mutations.len()).sum())
            .collect()
    }

    #[test]
    fn test_group_entries_respects_limit() {
        let entries: Vec<_> = [2, 3, 1, 4, 2].into_iter().map(entry_with).collect();
        let groups = group_entries(&entries, 5);
        assert_eq!(groups, vec![0..2, 2..4, 4..5]);
        assert_eq!(sizes(&entries, &groups), vec![5, 5, 2]);
    }

    #[test]
    fn test_group_entries_covers_input_in_order() {
        let entries: Vec<_> = [1, 1, 1, 1, 1, 1, 1].into_iter().map(entry_with).collect();
        let groups = group_entries(&entries, 3);
        let flattened: Vec<usize> = groups.iter().cloned().flatten().collect();
        assert_eq!(flattened, (0..7).collect::<Vec<_>>());
        assert!(sizes(&entries, &groups).iter().all(|s| *s <= 3));
    }

    #[test]
    fn test_oversized_entry_gets_its_own_group() {
        let entries: Vec<_> = [1, 10, 1].into_iter().map(entry_with).collect();
        let groups = group_entries(&entries, 4);
        assert_eq!(groups, vec![0..1, 1..2, 2..3]);

        let entries = vec![entry_with(10)];
        assert_eq!(group_entries(&entries, 4), vec![0..1]);
    }

    #[test]
    fn test_group_entries_empty() {
        assert!(group_entries(&[], 10).is_empty());
    }

    #[test]
    fn test_should_retry_requires_retryable_code_and_idempotent_ops() {
        let mut entry = entry_with(1);
        assert!(!entry.should_retry());

        entry.err = Some(TableError::status(Code::Unavailable, "busy"));
        assert!(entry.should_retry());

        entry.err = Some(TableError::status(Code::FailedPrecondition, "no"));
        assert!(!entry.should_retry());

        let mut m = Mutation::new();
        m.set("cf", "c", Timestamp::SERVER_TIME, "v");
        let mut entry = EntryErr::new(Bytes::from_static(b"row"), &m);
        entry.err = Some(TableError::status(Code::Unavailable, "busy"));
        assert!(!entry.should_retry());
    }
}
