//! AWS-oriented adapters and handlers for the bucket-watch pipeline.
//!
//! Handlers are plain functions over the adapter traits so they run the same
//! inside Lambda, inside `pipeline::LocalPipeline`, and in tests. AWS SDK
//! clients only appear in the adapter implementations and the `bin/` entry
//! points.

pub mod adapters;
pub mod config;
pub mod handlers;
pub mod pipeline;
pub mod telemetry;
