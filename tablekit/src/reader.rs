use bytes::{Bytes, BytesMut};
use std::fmt;

use crate::database::wire::CellChunk;
use crate::errors::TableError;
use crate::types::{ReadItem, Row, Timestamp};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ReaderState {
    NewRow,
    RowInProgress,
    CellInProgress,
}

impl fmt::Display for ReaderState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ReaderState::NewRow => "NEW_ROW",
            ReaderState::RowInProgress => "ROW_IN_PROGRESS",
            ReaderState::CellInProgress => "CELL_IN_PROGRESS",
        };
        f.write_str(name)
    }
}

/// Assembles complete rows from the cell chunks of one read request.
///
/// A reader must not be shared between requests: it remembers the last
/// committed key to enforce row ordering.
#[derive(Debug)]
pub struct ChunkReader {
    state: ReaderState,
    reversed: bool,
    last_key: Bytes,

    row: Row,
    cur_key: Bytes,
    cur_family: String,
    cur_qualifier: Bytes,
    cur_ts: i64,
    cur_labels: Vec<String>,
    cur_value: Option<BytesMut>,
}

impl Default for ChunkReader {
    fn default() -> Self {
        Self::new()
    }
}

impl ChunkReader {
    /// A reader for rows arriving in ascending key order.
    pub fn new() -> Self {
        Self {
            state: ReaderState::NewRow,
            reversed: false,
            last_key: Bytes::new(),
            row: Row::default(),
            cur_key: Bytes::new(),
            cur_family: String::new(),
            cur_qualifier: Bytes::new(),
            cur_ts: 0,
            cur_labels: Vec::new(),
            cur_value: None,
        }
    }

    /// A reader for rows arriving in descending key order.
    pub fn reversed() -> Self {
        Self {
            reversed: true,
            ..Self::new()
        }
    }

    /// Feed one chunk. Returns the row it completes, if any.
    pub fn process(&mut self, chunk: &CellChunk) -> Result<Option<Row>, TableError> {
        match self.state {
            ReaderState::NewRow => {
                self.validate_new_row(chunk)?;
                self.row = Row::new(chunk.row_key.clone());
                self.cur_key = chunk.row_key.clone();
                self.cur_family = chunk.family_name.clone().unwrap_or_default();
                self.cur_qualifier = chunk.qualifier.clone().unwrap_or_default();
                self.cur_ts = chunk.timestamp_micros;
                Ok(self.handle_cell_value(chunk))
            }
            ReaderState::RowInProgress => {
                if chunk.reset_row {
                    self.validate_row_status(chunk)?;
                    self.reset_to_new_row();
                    return Ok(None);
                }
                self.validate_row_in_progress(chunk)?;
                if let Some(family) = &chunk.family_name {
                    self.cur_family = family.clone();
                }
                if let Some(qualifier) = &chunk.qualifier {
                    self.cur_qualifier = qualifier.clone();
                }
                self.cur_ts = chunk.timestamp_micros;
                Ok(self.handle_cell_value(chunk))
            }
            ReaderState::CellInProgress => {
                if chunk.reset_row {
                    self.validate_row_status(chunk)?;
                    self.reset_to_new_row();
                    return Ok(None);
                }
                self.validate_cell_in_progress(chunk)?;
                Ok(self.handle_cell_value(chunk))
            }
        }
    }

    /// Check that the stream ended on a row boundary.
    pub fn close(&self) -> Result<(), TableError> {
        if self.state != ReaderState::NewRow {
            return Err(TableError::Protocol(format!(
                "invalid state for end of stream {}",
                self.state
            )));
        }
        Ok(())
    }

    /// Key of the last row this reader committed; empty before the first.
    pub fn last_key(&self) -> &Bytes {
        &self.last_key
    }

    fn handle_cell_value(&mut self, chunk: &CellChunk) -> Option<Row> {
        if chunk.value_size > 0 {
            if self.cur_value.is_none() {
                self.cur_labels = chunk.labels.clone();
                self.cur_value = Some(BytesMut::with_capacity(chunk.value_size as usize));
            }
            if let Some(value) = self.cur_value.as_mut() {
                value.extend_from_slice(&chunk.value);
            }
            self.state = ReaderState::CellInProgress;
            return None;
        }

        let value = match self.cur_value.take() {
            Some(mut partial) => {
                partial.extend_from_slice(&chunk.value);
                partial.freeze()
            }
            None => {
                self.cur_labels = chunk.labels.clone();
                chunk.value.clone()
            }
        };
        self.finish_cell(value);

        if chunk.commit_row {
            return Some(self.commit_row());
        }
        self.state = ReaderState::RowInProgress;
        None
    }

    fn finish_cell(&mut self, value: Bytes) {
        let item = ReadItem {
            row: self.cur_key.clone(),
            column: ReadItem::column_name(&self.cur_family, &self.cur_qualifier),
            timestamp: Timestamp(self.cur_ts),
            value,
            labels: std::mem::take(&mut self.cur_labels),
        };
        self.row.push(&self.cur_family, item);
    }

    fn commit_row(&mut self) -> Row {
        let row = std::mem::take(&mut self.row);
        self.last_key = row.key().clone();
        self.reset_to_new_row();
        row
    }

    fn reset_to_new_row(&mut self) {
        self.row = Row::default();
        self.cur_key = Bytes::new();
        self.cur_family.clear();
        self.cur_qualifier = Bytes::new();
        self.cur_ts = 0;
        self.cur_labels.clear();
        self.cur_value = None;
        self.state = ReaderState::NewRow;
    }

    fn validate_new_row(&self, chunk: &CellChunk) -> Result<(), TableError> {
        if chunk.reset_row {
            return Err(violation(self.state, "reset_row not allowed between rows"));
        }
        if chunk.row_key.is_empty() || chunk.family_name.is_none() || chunk.qualifier.is_none() {
            return Err(violation(self.state, "missing key field for new row"));
        }
        if !self.last_key.is_empty() {
            let out_of_order = if self.reversed {
                self.last_key <= chunk.row_key
            } else {
                self.last_key >= chunk.row_key
            };
            if out_of_order {
                return Err(violation(
                    self.state,
                    format!(
                        "out of order row key: {:?} after {:?}",
                        chunk.row_key, self.last_key
                    ),
                ));
            }
        }
        Ok(())
    }

    fn validate_row_in_progress(&self, chunk: &CellChunk) -> Result<(), TableError> {
        self.validate_row_status(chunk)?;
        if !chunk.row_key.is_empty() && chunk.row_key != self.cur_key {
            return Err(violation(
                self.state,
                format!(
                    "received new row key {:?} during existing row {:?}",
                    chunk.row_key, self.cur_key
                ),
            ));
        }
        if let (Some(family), None) = (&chunk.family_name, &chunk.qualifier) {
            return Err(violation(
                self.state,
                format!("family name {family:?} specified without a qualifier"),
            ));
        }
        Ok(())
    }

    fn validate_cell_in_progress(&self, chunk: &CellChunk) -> Result<(), TableError> {
        self.validate_row_status(chunk)?;
        if self.cur_value.is_none() {
            return Err(violation(self.state, "no cached cell while a cell is in progress"));
        }
        if has_key_components(chunk) {
            return Err(violation(self.state, "cell key components found while a cell is in progress"));
        }
        Ok(())
    }

    fn validate_row_status(&self, chunk: &CellChunk) -> Result<(), TableError> {
        if chunk.reset_row
            && (has_key_components(chunk)
                || !chunk.value.is_empty()
                || chunk.value_size != 0
                || !chunk.labels.is_empty()
                || chunk.commit_row)
        {
            return Err(violation(self.state, "reset must not be specified with other fields"));
        }
        if chunk.commit_row && chunk.value_size > 0 {
            return Err(violation(self.state, "commit row found in between chunks in a cell"));
        }
        Ok(())
    }
}

fn has_key_components(chunk: &CellChunk) -> bool {
    !chunk.row_key.is_empty()
        || chunk.family_name.is_some()
        || chunk.qualifier.is_some()
        || chunk.timestamp_micros != 0
}

fn violation(state: ReaderState, msg: impl fmt::Display) -> TableError {
    TableError::Protocol(format!("{msg} (state {state})"))
}
