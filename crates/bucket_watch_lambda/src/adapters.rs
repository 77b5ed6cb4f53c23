use std::future::Future;

pub mod aggregation_table;
pub mod cloudwatch_logs;
pub mod dynamodb;
pub mod invoke;
pub mod log_store;
pub mod object_store;
pub mod s3;

/// Runs an SDK future to completion from synchronous adapter code.
///
/// Must be called from within a multi-threaded tokio runtime.
pub(crate) fn block_on<F: Future>(future: F) -> F::Output {
    tokio::task::block_in_place(|| tokio::runtime::Handle::current().block_on(future))
}
