//! Shared bucket-watch domain primitives.
//!
//! This crate owns the wire contracts, the fan-out and queue models, size
//! aggregation math, the metric/alarm state machine, cleanup planning and
//! report rendering. It excludes AWS SDK and Lambda runtime concerns.

pub mod aggregation;
pub mod alarm;
pub mod cleanup;
pub mod contract;
pub mod fanout;
pub mod metric;
pub mod notification;
pub mod queue;
pub mod report;
pub mod storage_keys;
