use bytes::Bytes;
use std::fmt;
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, info};

use crate::bulk::BulkWriter;
use crate::config::ClientConfig;
use crate::database::retry::{backoff_or_fail, Retryer};
use crate::database::transport::DataTransport;
use crate::database::wire::{CheckAndMutateRowRequest, MutateRowRequest, MutationOp, Target};
use crate::errors::TableError;
use crate::metrics;
use crate::mutation::{mutations_are_retryable, Mutation};
use crate::rowset::RowSet;
use crate::scan::{ReadOptions, RowScanner};
use crate::types::Row;

/// Entry point: a transport plus the instance it talks to.
#[derive(Clone)]
pub struct Client {
    transport: Arc<dyn DataTransport>,
    config: Arc<ClientConfig>,
}

impl Client {
    pub fn new(transport: Arc<dyn DataTransport>, config: ClientConfig) -> Result<Self, TableError> {
        config.validate()?;
        info!(
            "Created table client for {} (app profile {:?})",
            config.full_instance_name(),
            config.app_profile
        );
        Ok(Self {
            transport,
            config: Arc::new(config),
        })
    }

    pub fn config(&self) -> &ClientConfig {
        &self.config
    }

    pub fn open(&self, table: &str) -> Table {
        self.handle(Target::Table(self.config.full_table_name(table)))
    }

    /// A handle restricted to an authorized view of `table`.
    pub fn open_authorized_view(&self, table: &str, view: &str) -> Table {
        self.handle(Target::AuthorizedView(
            self.config.full_authorized_view_name(table, view),
        ))
    }

    /// A read-only handle on a materialized view.
    pub fn open_materialized_view(&self, view: &str) -> Table {
        self.handle(Target::MaterializedView(
            self.config.full_materialized_view_name(view),
        ))
    }

    fn handle(&self, target: Target) -> Table {
        Table {
            transport: Arc::clone(&self.transport),
            config: Arc::clone(&self.config),
            target,
        }
    }
}

impl fmt::Debug for Client {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Client").field("config", &self.config).finish()
    }
}

/// A handle on one table or view. Cheap to clone and share between tasks.
#[derive(Clone)]
pub struct Table {
    transport: Arc<dyn DataTransport>,
    config: Arc<ClientConfig>,
    target: Target,
}

impl Table {
    pub fn target(&self) -> &Target {
        &self.target
    }

    /// Start a scan over `rows`; `None` reads the whole table.
    pub fn scan(&self, rows: Option<RowSet>, opts: ReadOptions) -> RowScanner {
        RowScanner::new(
            Arc::clone(&self.transport),
            &self.config,
            self.target.clone(),
            rows,
            opts,
        )
    }

    /// Read rows and hand each to `f` in order until `f` returns `false` or
    /// the scan completes. Stopping early is not an error.
    pub async fn read_rows<F>(&self, rows: Option<RowSet>, mut f: F, opts: ReadOptions) -> Result<(), TableError>
    where
        F: FnMut(Row) -> bool,
    {
        let mut scanner = self.scan(rows, opts);
        while let Some(row) = scanner.next().await? {
            if !f(row) {
                scanner.stop().await;
                break;
            }
        }
        Ok(())
    }

    /// Read a single row. Returns `None` if it does not exist.
    pub async fn read_row(&self, row: impl AsRef<[u8]>, opts: ReadOptions) -> Result<Option<Row>, TableError> {
        let mut scanner = self.scan(Some(RowSet::single_row(row)), opts.limit(1));
        let found = scanner.next().await?;
        scanner.stop().await;
        Ok(found)
    }

    /// Apply `m` to a single row.
    ///
    /// For a conditional mutation returns whether the predicate matched;
    /// otherwise `None`. The call is retried only if every op it sends is
    /// idempotent.
    pub async fn apply(&self, row: impl AsRef<[u8]>, m: &Mutation) -> Result<Option<bool>, TableError> {
        let started = Instant::now();
        let result = self.apply_inner(Bytes::copy_from_slice(row.as_ref()), m).await;
        metrics::record_operation("apply", result.is_ok(), started.elapsed().as_secs_f64());
        result
    }

    async fn apply_inner(&self, row_key: Bytes, m: &Mutation) -> Result<Option<bool>, TableError> {
        self.check_writable()?;
        let mut retryer = Retryer::new(&self.config.retry);

        let Some(cond) = m.condition() else {
            let retryable = mutations_are_retryable(m.ops());
            let request = MutateRowRequest {
                target: self.target.clone(),
                app_profile_id: self.config.app_profile.clone(),
                row_key,
                mutations: m.ops().to_vec(),
            };
            loop {
                debug!("MutateRow on {}", self.target.name());
                match self.transport.mutate_row(request.clone()).await {
                    Ok(()) => return Ok(None),
                    Err(status) if retryable => backoff_or_fail(&mut retryer, "apply", status).await?,
                    Err(status) => return Err(status.into()),
                }
            }
        };

        let true_mutations = branch_ops(cond.if_true.as_deref())?;
        let false_mutations = branch_ops(cond.if_false.as_deref())?;
        let retryable = mutations_are_retryable(&true_mutations) && mutations_are_retryable(&false_mutations);
        let request = CheckAndMutateRowRequest {
            target: self.target.clone(),
            app_profile_id: self.config.app_profile.clone(),
            row_key,
            predicate_filter: Some(cond.predicate.clone()),
            true_mutations,
            false_mutations,
        };
        loop {
            debug!("CheckAndMutateRow on {}", self.target.name());
            match self.transport.check_and_mutate_row(request.clone()).await {
                Ok(response) => return Ok(Some(response.predicate_matched)),
                Err(status) if retryable => backoff_or_fail(&mut retryer, "apply", status).await?,
                Err(status) => return Err(status.into()),
            }
        }
    }

    /// Apply a batch of single-row mutations, `muts[i]` to `row_keys[i]`.
    ///
    /// Each row is atomic but the batch is not. Returns `Err` when nothing
    /// could be applied, `Ok(None)` when everything was, and otherwise one
    /// slot per input row holding that row's error, if any.
    pub async fn apply_bulk<K: AsRef<[u8]>>(
        &self,
        row_keys: &[K],
        muts: &[Mutation],
    ) -> Result<Option<Vec<Option<TableError>>>, TableError> {
        let started = Instant::now();
        let result = match self.check_writable() {
            Ok(()) => {
                BulkWriter {
                    transport: self.transport.as_ref(),
                    config: &self.config,
                    target: &self.target,
                }
                .apply(row_keys, muts)
                .await
            }
            Err(err) => Err(err),
        };
        metrics::record_operation("apply_bulk", result.is_ok(), started.elapsed().as_secs_f64());
        result
    }

    fn check_writable(&self) -> Result<(), TableError> {
        if let Target::MaterializedView(name) = &self.target {
            return Err(TableError::InvalidArgument(format!(
                "materialized view {name} is read-only"
            )));
        }
        Ok(())
    }
}

impl fmt::Debug for Table {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Table").field("target", &self.target).finish()
    }
}

fn branch_ops(branch: Option<&Mutation>) -> Result<Vec<MutationOp>, TableError> {
    match branch {
        Some(m) if m.is_conditional() => Err(TableError::InvalidArgument(
            "conditional mutations cannot be nested".to_string(),
        )),
        Some(m) => Ok(m.ops().to_vec()),
        None => Ok(Vec::new()),
    }
}
