// tablekit/src/lib.rs
//
// Client engine for a streaming wide-column table service:
// resumable row scans and partially-retried bulk mutations.
//

pub mod bulk;
pub mod config;
pub mod database;
pub mod errors;
pub mod filter;
pub mod metrics;
pub mod mutation;
pub mod reader;
pub mod rowset;
pub mod scan;
pub mod table;
pub mod types;

pub use config::{load_config, ClientConfig, RetryConfig};
pub use errors::{convert_to_status, Code, Status, TableError};
pub use filter::{Filter, RawFilter};
pub use mutation::{mutations_are_retryable, Mutation};
pub use reader::ChunkReader;
pub use rowset::{prefix_successor, BoundType, RowRange, RowSet};
pub use scan::{ReadOptions, RowScanner};
pub use table::{Client, Table};
pub use types::{FullReadStats, ReadItem, ReadIterationStats, RequestLatencyStats, Row, Timestamp};
