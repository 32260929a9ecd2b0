// tablekit/src/database/emulator.rs
//
// In-memory table service for tests and local development.
// Serves reads and writes from sorted in-memory tables and can inject
// failures into any call.
//

use async_trait::async_trait;
use bytes::{Bytes, BytesMut};
use futures::stream::{self, StreamExt};
use parking_lot::Mutex;
use std::collections::{BTreeMap, HashMap, VecDeque};
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::transport::{DataTransport, ResponseStream};
use super::wire::{
    CellChunk, CheckAndMutateRowRequest, CheckAndMutateRowResponse, EntryStatus, FullReadStatsView,
    IterationStats, KeyBound, LatencyStats, MutateRowRequest, MutateRowsRequest, MutateRowsResponse,
    MutationOp, ReadRowsRequest, ReadRowsResponse, RequestStats, RequestStatsView, RowRangeProto,
    RowSetProto, Target,
};
use crate::errors::{Code, Status};
use crate::types::Timestamp;

/// RPCs that can be told to fail.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Method {
    ReadRows,
    MutateRows,
    MutateRow,
    CheckAndMutateRow,
}

#[derive(Debug, Clone)]
pub struct EmulatorOptions {
    /// Rows per `ReadRows` response, and entry statuses per `MutateRows`
    /// response.
    pub rows_per_response: usize,
    /// Split cell values into chunks of at most this many bytes. Zero sends
    /// every value in one chunk.
    pub value_chunk_size: usize,
}

impl Default for EmulatorOptions {
    fn default() -> Self {
        Self {
            rows_per_response: 2,
            value_chunk_size: 0,
        }
    }
}

#[derive(Debug, Clone)]
struct StoredCell {
    timestamp_micros: i64,
    value: Bytes,
}

/// family -> qualifier -> cells, newest first
type StoredRow = BTreeMap<String, BTreeMap<Bytes, Vec<StoredCell>>>;
type StoredTable = BTreeMap<Bytes, StoredRow>;

#[derive(Debug)]
struct ReadFault {
    after_rows: usize,
    status: Status,
}

#[derive(Debug)]
struct EntryFault {
    status: Status,
    remaining: usize,
}

#[derive(Debug, Default)]
struct EmulatorState {
    tables: HashMap<String, StoredTable>,
    call_faults: HashMap<Method, VecDeque<Status>>,
    read_faults: VecDeque<ReadFault>,
    entry_faults: HashMap<Bytes, EntryFault>,
    calls: HashMap<Method, usize>,
    read_requests: Vec<ReadRowsRequest>,
    mutate_rows_requests: Vec<MutateRowsRequest>,
}

/// A [`DataTransport`] backed by in-memory tables.
///
/// Filters are not evaluated: reads return every cell and check-and-mutate
/// predicates match any row that has at least one cell.
#[derive(Debug)]
pub struct Emulator {
    options: EmulatorOptions,
    state: Mutex<EmulatorState>,
}

impl Default for Emulator {
    fn default() -> Self {
        Self::new(EmulatorOptions::default())
    }
}

impl Emulator {
    pub fn new(options: EmulatorOptions) -> Self {
        info!(
            "Emulator started ({} rows per response, value chunk size {})",
            options.rows_per_response, options.value_chunk_size
        );
        Self {
            options,
            state: Mutex::new(EmulatorState::default()),
        }
    }

    /// Create an empty table under its fully qualified name. Authorized
    /// views of it resolve to the same data.
    pub fn create_table(&self, name: &str) {
        self.state.lock().tables.entry(name.to_string()).or_default();
    }

    /// Write directly to a table, bypassing fault injection and views.
    pub fn apply_ops(&self, table: &str, row_key: impl AsRef<[u8]>, ops: &[MutationOp]) -> Result<(), Status> {
        let mut state = self.state.lock();
        let table = state
            .tables
            .get_mut(table)
            .ok_or_else(|| Status::new(Code::NotFound, format!("no such table {table:?}")))?;
        apply_to_row(table, Bytes::copy_from_slice(row_key.as_ref()), ops)
    }

    /// Fail the next call of `method` with `status` before it returns any data.
    pub fn fail_next(&self, method: Method, status: Status) {
        self.state
            .lock()
            .call_faults
            .entry(method)
            .or_default()
            .push_back(status);
    }

    /// Break the next row stream with `status` after `rows` complete rows.
    pub fn fail_read_after(&self, rows: usize, status: Status) {
        self.state.lock().read_faults.push_back(ReadFault {
            after_rows: rows,
            status,
        });
    }

    /// Report `status` for `row_key` in the next `times` bulk writes that
    /// include it, without applying its mutations.
    pub fn fail_entry(&self, row_key: impl AsRef<[u8]>, status: Status, times: usize) {
        self.state.lock().entry_faults.insert(
            Bytes::copy_from_slice(row_key.as_ref()),
            EntryFault {
                status,
                remaining: times,
            },
        );
    }

    /// How many times `method` was called, including failed calls.
    pub fn calls(&self, method: Method) -> usize {
        self.state.lock().calls.get(&method).copied().unwrap_or(0)
    }

    pub fn read_requests(&self) -> Vec<ReadRowsRequest> {
        self.state.lock().read_requests.clone()
    }

    pub fn mutate_rows_requests(&self) -> Vec<MutateRowsRequest> {
        self.state.lock().mutate_rows_requests.clone()
    }

    /// Count the call and pop an injected failure for it, if any.
    fn begin_call(state: &mut EmulatorState, method: Method) -> Result<(), Status> {
        *state.calls.entry(method).or_default() += 1;
        match state.call_faults.get_mut(&method).and_then(VecDeque::pop_front) {
            Some(status) => {
                debug!("Injecting {:?} failure: {}", method, status);
                Err(status)
            }
            None => Ok(()),
        }
    }

    fn encode_row(&self, key: &Bytes, row: &StoredRow) -> (Vec<CellChunk>, i64) {
        let mut chunks: Vec<CellChunk> = Vec::new();
        let mut cells = 0;
        for (family, columns) in row {
            for (qualifier, column) in columns {
                for cell in column {
                    cells += 1;
                    let pieces = split_value(&cell.value, self.options.value_chunk_size);
                    let last = pieces.len() - 1;
                    for (i, piece) in pieces.into_iter().enumerate() {
                        let mut chunk = CellChunk {
                            value: piece,
                            value_size: if i < last { cell.value.len() as i32 } else { 0 },
                            ..Default::default()
                        };
                        if i == 0 {
                            if chunks.is_empty() {
                                chunk.row_key = key.clone();
                            }
                            chunk.family_name = Some(family.clone());
                            chunk.qualifier = Some(qualifier.clone());
                            chunk.timestamp_micros = cell.timestamp_micros;
                        }
                        chunks.push(chunk);
                    }
                }
            }
        }
        if let Some(chunk) = chunks.last_mut() {
            chunk.commit_row = true;
        }
        (chunks, cells)
    }
}

#[async_trait]
impl DataTransport for Emulator {
    async fn read_rows(
        &self,
        request: ReadRowsRequest,
        cancel: CancellationToken,
    ) -> Result<ResponseStream<ReadRowsResponse>, Status> {
        let started = Instant::now();
        let mut state = self.state.lock();
        state.read_requests.push(request.clone());
        Self::begin_call(&mut state, Method::ReadRows)?;
        let fault = state.read_faults.pop_front();

        let table = state
            .tables
            .get(&table_key(&request.target))
            .ok_or_else(|| Status::new(Code::NotFound, format!("no such table {:?}", request.target.name())))?;
        if request.filter.is_some() {
            warn!("Emulator does not evaluate row filters, ignoring filter");
        }

        let matching = table
            .iter()
            .filter(|(key, _)| row_set_contains(request.rows.as_ref(), key));
        let selected: Vec<(&Bytes, &StoredRow)> = if request.reversed {
            matching.rev().collect()
        } else {
            matching.collect()
        };
        let limit = usize::try_from(request.rows_limit)
            .ok()
            .filter(|limit| *limit > 0)
            .unwrap_or(usize::MAX);

        let mut rows: Vec<Vec<CellChunk>> = Vec::new();
        let mut cells_returned = 0;
        for (key, row) in selected.into_iter().take(limit) {
            let (chunks, cells) = self.encode_row(key, row);
            cells_returned += cells;
            rows.push(chunks);
        }
        drop(state);

        let deliver = match &fault {
            Some(fault) => fault.after_rows.min(rows.len()),
            None => rows.len(),
        };
        let per_response = self.options.rows_per_response.max(1);
        let mut items: Vec<Result<ReadRowsResponse, Status>> = rows[..deliver]
            .chunks(per_response)
            .map(|batch| {
                Ok(ReadRowsResponse {
                    chunks: batch.concat(),
                    ..Default::default()
                })
            })
            .collect();

        match fault {
            Some(fault) => {
                debug!("Breaking row stream after {} rows: {}", deliver, fault.status);
                items.push(Err(fault.status));
            }
            None if request.request_stats_view == RequestStatsView::Full => {
                let stats = RequestStats {
                    full_read_stats_view: Some(FullReadStatsView {
                        read_iteration_stats: Some(IterationStats {
                            rows_seen_count: rows.len() as i64,
                            rows_returned_count: rows.len() as i64,
                            cells_seen_count: cells_returned,
                            cells_returned_count: cells_returned,
                        }),
                        request_latency_stats: Some(LatencyStats {
                            frontend_server_latency: started.elapsed().max(Duration::from_micros(1)),
                        }),
                    }),
                };
                items.push(Ok(ReadRowsResponse {
                    request_stats: Some(stats),
                    ..Default::default()
                }));
            }
            None => {}
        }

        debug!("ReadRows on {} streams {} rows", request.target.name(), deliver);
        let stream = stream::iter(items).take_until(async move { cancel.cancelled().await });
        Ok(stream.boxed())
    }

    async fn mutate_rows(
        &self,
        request: MutateRowsRequest,
    ) -> Result<ResponseStream<MutateRowsResponse>, Status> {
        let mut state = self.state.lock();
        state.mutate_rows_requests.push(request.clone());
        Self::begin_call(&mut state, Method::MutateRows)?;
        check_writable(&request.target)?;

        let EmulatorState {
            tables,
            entry_faults,
            ..
        } = &mut *state;
        let table = tables
            .get_mut(&table_key(&request.target))
            .ok_or_else(|| Status::new(Code::NotFound, format!("no such table {:?}", request.target.name())))?;

        let mut statuses = Vec::with_capacity(request.entries.len());
        for (index, entry) in request.entries.into_iter().enumerate() {
            let injected = match entry_faults.get_mut(&entry.row_key) {
                Some(fault) if fault.remaining > 0 => {
                    fault.remaining -= 1;
                    Some(fault.status.clone())
                }
                _ => None,
            };
            let outcome = match injected {
                Some(status) => Err(status),
                None => apply_to_row(table, entry.row_key, &entry.mutations),
            };
            statuses.push(match outcome {
                Ok(()) => EntryStatus {
                    index,
                    code: Code::Ok.as_i32(),
                    message: String::new(),
                },
                Err(status) => EntryStatus {
                    index,
                    code: status.code().as_i32(),
                    message: status.message().to_string(),
                },
            });
        }

        let per_response = self.options.rows_per_response.max(1);
        let responses: Vec<Result<MutateRowsResponse, Status>> = statuses
            .chunks(per_response)
            .map(|batch| {
                Ok(MutateRowsResponse {
                    entries: batch.to_vec(),
                })
            })
            .collect();
        Ok(stream::iter(responses).boxed())
    }

    async fn mutate_row(&self, request: MutateRowRequest) -> Result<(), Status> {
        let mut state = self.state.lock();
        Self::begin_call(&mut state, Method::MutateRow)?;
        check_writable(&request.target)?;
        let table = state
            .tables
            .get_mut(&table_key(&request.target))
            .ok_or_else(|| Status::new(Code::NotFound, format!("no such table {:?}", request.target.name())))?;
        apply_to_row(table, request.row_key, &request.mutations)
    }

    async fn check_and_mutate_row(
        &self,
        request: CheckAndMutateRowRequest,
    ) -> Result<CheckAndMutateRowResponse, Status> {
        let mut state = self.state.lock();
        Self::begin_call(&mut state, Method::CheckAndMutateRow)?;
        check_writable(&request.target)?;
        let table = state
            .tables
            .get_mut(&table_key(&request.target))
            .ok_or_else(|| Status::new(Code::NotFound, format!("no such table {:?}", request.target.name())))?;

        let predicate_matched = table.get(&request.row_key).is_some_and(|row| !row.is_empty());
        let mutations = if predicate_matched {
            &request.true_mutations
        } else {
            &request.false_mutations
        };
        apply_to_row(table, request.row_key.clone(), mutations)?;
        Ok(CheckAndMutateRowResponse { predicate_matched })
    }
}

/// The stored table a request addresses. Authorized views share their
/// table's data.
fn table_key(target: &Target) -> String {
    match target {
        Target::AuthorizedView(name) => match name.find("/authorizedViews/") {
            Some(i) => name[..i].to_string(),
            None => name.clone(),
        },
        Target::Table(name) | Target::MaterializedView(name) => name.clone(),
    }
}

fn check_writable(target: &Target) -> Result<(), Status> {
    if let Target::MaterializedView(name) = target {
        return Err(Status::new(
            Code::PermissionDenied,
            format!("materialized view {name} cannot be written"),
        ));
    }
    Ok(())
}

fn row_set_contains(rows: Option<&RowSetProto>, key: &Bytes) -> bool {
    match rows {
        None => true,
        Some(set) if set.row_keys.is_empty() && set.row_ranges.is_empty() => true,
        Some(set) => set.row_keys.contains(key) || set.row_ranges.iter().any(|r| range_contains(r, key)),
    }
}

fn range_contains(range: &RowRangeProto, key: &[u8]) -> bool {
    let after_start = match &range.start_key {
        None => true,
        Some(KeyBound::Closed(start)) => key >= &start[..],
        Some(KeyBound::Open(start)) => key > &start[..],
    };
    let before_end = match &range.end_key {
        None => true,
        Some(KeyBound::Closed(end)) => key <= &end[..],
        Some(KeyBound::Open(end)) => key < &end[..],
    };
    after_start && before_end
}

fn split_value(value: &Bytes, chunk_size: usize) -> Vec<Bytes> {
    if chunk_size == 0 || value.len() <= chunk_size {
        return vec![value.clone()];
    }
    (0..value.len())
        .step_by(chunk_size)
        .map(|start| value.slice(start..(start + chunk_size).min(value.len())))
        .collect()
}

/// Apply `ops` to one row atomically: either all of them take effect or none.
fn apply_to_row(table: &mut StoredTable, row_key: Bytes, ops: &[MutationOp]) -> Result<(), Status> {
    if row_key.is_empty() {
        return Err(Status::new(Code::InvalidArgument, "row key must not be empty"));
    }
    let mut row = table.get(&row_key).cloned().unwrap_or_default();
    let now = Timestamp::now().truncate_to_milliseconds().micros();
    let resolve = |ts: i64| if ts == Timestamp::SERVER_TIME.micros() { now } else { ts };

    for op in ops {
        match op {
            MutationOp::SetCell {
                family_name,
                column_qualifier,
                timestamp_micros,
                value,
            } => {
                let cells = column_mut(&mut row, family_name, column_qualifier);
                put_cell(cells, resolve(*timestamp_micros), value.clone());
            }
            MutationOp::DeleteFromColumn {
                family_name,
                column_qualifier,
                time_range,
            } => {
                if let Some(cells) = row
                    .get_mut(family_name)
                    .and_then(|columns| columns.get_mut(column_qualifier))
                {
                    match time_range {
                        None => cells.clear(),
                        Some(range) => cells.retain(|cell| {
                            let ts = cell.timestamp_micros;
                            let past_end = range.end_timestamp_micros != 0 && ts >= range.end_timestamp_micros;
                            ts < range.start_timestamp_micros || past_end
                        }),
                    }
                }
            }
            MutationOp::DeleteFromFamily { family_name } => {
                row.remove(family_name);
            }
            MutationOp::DeleteFromRow => row.clear(),
            MutationOp::AddToCell {
                family_name,
                column_qualifier,
                timestamp_micros,
                input,
            } => {
                let ts = resolve(*timestamp_micros);
                let cells = column_mut(&mut row, family_name, column_qualifier);
                let current = match cells.iter().find(|cell| cell.timestamp_micros == ts) {
                    Some(cell) => decode_counter(&cell.value)?,
                    None => 0,
                };
                let sum = current.wrapping_add(*input);
                put_cell(cells, ts, Bytes::copy_from_slice(&sum.to_be_bytes()));
            }
            MutationOp::MergeToCell {
                family_name,
                column_qualifier,
                timestamp_micros,
                input,
            } => {
                let ts = resolve(*timestamp_micros);
                let cells = column_mut(&mut row, family_name, column_qualifier);
                let mut merged = BytesMut::new();
                if let Some(cell) = cells.iter().find(|cell| cell.timestamp_micros == ts) {
                    merged.extend_from_slice(&cell.value);
                }
                merged.extend_from_slice(input);
                put_cell(cells, ts, merged.freeze());
            }
        }
    }

    for columns in row.values_mut() {
        columns.retain(|_, cells| !cells.is_empty());
    }
    row.retain(|_, columns| !columns.is_empty());
    if row.is_empty() {
        table.remove(&row_key);
    } else {
        table.insert(row_key, row);
    }
    Ok(())
}

fn column_mut<'a>(row: &'a mut StoredRow, family: &str, qualifier: &Bytes) -> &'a mut Vec<StoredCell> {
    row.entry(family.to_string())
        .or_default()
        .entry(qualifier.clone())
        .or_default()
}

/// Insert or replace the cell at `timestamp_micros`, keeping newest first.
fn put_cell(cells: &mut Vec<StoredCell>, timestamp_micros: i64, value: Bytes) {
    cells.retain(|cell| cell.timestamp_micros != timestamp_micros);
    let at = cells
        .iter()
        .position(|cell| cell.timestamp_micros < timestamp_micros)
        .unwrap_or(cells.len());
    cells.insert(
        at,
        StoredCell {
            timestamp_micros,
            value,
        },
    );
}

fn decode_counter(value: &[u8]) -> Result<i64, Status> {
    let bytes: [u8; 8] = value.try_into().map_err(|_| {
        Status::new(
            Code::FailedPrecondition,
            "add to cell on a value that is not a 64-bit integer",
        )
    })?;
    Ok(i64::from_be_bytes(bytes))
}
