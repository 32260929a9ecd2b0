use async_trait::async_trait;
use futures::stream::BoxStream;
use tokio_util::sync::CancellationToken;

use super::wire::{
    CheckAndMutateRowRequest, CheckAndMutateRowResponse, MutateRowRequest, MutateRowsRequest,
    MutateRowsResponse, ReadRowsRequest, ReadRowsResponse,
};
use crate::errors::Status;

/// A server stream. `None` is a clean end of stream.
pub type ResponseStream<T> = BoxStream<'static, Result<T, Status>>;

/// The RPC channel to the table service.
///
/// Implementations own connection management and encoding; every failure is
/// reported as a [`Status`].
#[async_trait]
pub trait DataTransport: Send + Sync {
    /// Open a row stream. Cancelling `cancel` must end the stream promptly,
    /// either with a clean end or a `Cancelled` status.
    async fn read_rows(
        &self,
        request: ReadRowsRequest,
        cancel: CancellationToken,
    ) -> Result<ResponseStream<ReadRowsResponse>, Status>;

    async fn mutate_rows(
        &self,
        request: MutateRowsRequest,
    ) -> Result<ResponseStream<MutateRowsResponse>, Status>;

    async fn mutate_row(&self, request: MutateRowRequest) -> Result<(), Status>;

    async fn check_and_mutate_row(
        &self,
        request: CheckAndMutateRowRequest,
    ) -> Result<CheckAndMutateRowResponse, Status>;
}
