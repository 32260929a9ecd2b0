#![allow(dead_code)]

use async_trait::async_trait;
use bytes::Bytes;
use futures::stream::{self, StreamExt};
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

use tablekit::database::transport::{DataTransport, ResponseStream};
use tablekit::database::wire::{
    CellChunk, CheckAndMutateRowRequest, CheckAndMutateRowResponse, MutateRowRequest, MutateRowsRequest,
    MutateRowsResponse, ReadRowsRequest, ReadRowsResponse,
};
use tablekit::database::{Emulator, EmulatorOptions};
use tablekit::{Client, ClientConfig, Mutation, RetryConfig, Row, Status, Table, Timestamp};

pub const TABLE: &str = "projects/proj/instances/inst/tables/t";

/// Client settings with millisecond backoff so retries don't slow tests.
pub fn test_config() -> ClientConfig {
    ClientConfig {
        retry: RetryConfig {
            initial_backoff_ms: 1,
            max_backoff_ms: 5,
            ..RetryConfig::default()
        },
        ..ClientConfig::new("proj", "inst")
    }
}

/// An emulator with table `t` holding one cell per key, and a handle on it.
pub fn seeded_table(keys: &[&str], options: EmulatorOptions) -> (Arc<Emulator>, Table) {
    seeded_table_with(keys, options, test_config())
}

pub fn seeded_table_with(keys: &[&str], options: EmulatorOptions, config: ClientConfig) -> (Arc<Emulator>, Table) {
    let emulator = Arc::new(Emulator::new(options));
    emulator.create_table(TABLE);
    for key in keys {
        let mut m = Mutation::new();
        m.set("cf", "col", Timestamp(1_000), key.as_bytes().to_vec());
        emulator.apply_ops(TABLE, key, m.ops()).unwrap();
    }
    let client = Client::new(emulator.clone(), config).unwrap();
    (emulator, client.open("t"))
}

pub fn keys(rows: &[Row]) -> Vec<String> {
    rows.iter()
        .map(|row| String::from_utf8_lossy(row.key()).into_owned())
        .collect()
}

/// A complete single-cell row in one chunk.
pub fn row_chunk(key: &str) -> CellChunk {
    CellChunk {
        row_key: Bytes::copy_from_slice(key.as_bytes()),
        family_name: Some("cf".to_string()),
        qualifier: Some(Bytes::from_static(b"col")),
        timestamp_micros: 1_000,
        value: Bytes::copy_from_slice(key.as_bytes()),
        commit_row: true,
        ..Default::default()
    }
}

pub type Script<T> = Result<Vec<Result<T, Status>>, Status>;

/// A transport that replays canned responses, one script per call, and
/// records every request. Calls past the end of a script see an empty
/// stream or success.
#[derive(Default)]
pub struct ScriptedTransport {
    reads: Mutex<VecDeque<Script<ReadRowsResponse>>>,
    mutates: Mutex<VecDeque<Script<MutateRowsResponse>>>,
    pub read_requests: Mutex<Vec<ReadRowsRequest>>,
    pub mutate_requests: Mutex<Vec<MutateRowsRequest>>,
    pub read_tokens: Mutex<Vec<CancellationToken>>,
}

impl ScriptedTransport {
    pub fn push_read(&self, script: Script<ReadRowsResponse>) {
        self.reads.lock().push_back(script);
    }

    pub fn push_mutate(&self, script: Script<MutateRowsResponse>) {
        self.mutates.lock().push_back(script);
    }

    pub fn table(self: &Arc<Self>, config: ClientConfig) -> Table {
        Client::new(self.clone(), config).unwrap().open("t")
    }
}

#[async_trait]
impl DataTransport for ScriptedTransport {
    async fn read_rows(
        &self,
        request: ReadRowsRequest,
        cancel: CancellationToken,
    ) -> Result<ResponseStream<ReadRowsResponse>, Status> {
        self.read_requests.lock().push(request);
        self.read_tokens.lock().push(cancel);
        let script = self.reads.lock().pop_front().unwrap_or(Ok(Vec::new()));
        Ok(stream::iter(script?).boxed())
    }

    async fn mutate_rows(&self, request: MutateRowsRequest) -> Result<ResponseStream<MutateRowsResponse>, Status> {
        self.mutate_requests.lock().push(request);
        let script = self.mutates.lock().pop_front().unwrap_or(Ok(Vec::new()));
        Ok(stream::iter(script?).boxed())
    }

    async fn mutate_row(&self, _request: MutateRowRequest) -> Result<(), Status> {
        Ok(())
    }

    async fn check_and_mutate_row(
        &self,
        _request: CheckAndMutateRowRequest,
    ) -> Result<CheckAndMutateRowResponse, Status> {
        Ok(CheckAndMutateRowResponse::default())
    }
}
