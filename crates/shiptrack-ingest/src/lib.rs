//! Shiptrack Ingest Library
#![deny(clippy::unwrap_used, clippy::expect_used)]
//!
//! Fetches shipment-tracking events for batches of tracking identifiers from a
//! partner API and turns them into per-shipment event records.
//!
//! # Pipeline
//!
//! - **Fetch stage**: each [`batch::Batch`] becomes one or more partner URLs
//!   ([`url::UrlBuilder`]), fetched with bounded retry
//!   ([`fetcher::ResilientFetcher`]); the raw response is persisted under
//!   `API_Batches`
//! - **Parse stage**: each persisted response is parsed
//!   ([`parser::ResponseParser`]) and one event group per tracking identifier
//!   is persisted under `API_Details`
//!
//! Both stages drain a [`queue::WorkQueue`] with a fixed
//! [`worker::WorkerPool`] and report progress through a
//! [`progress::ProgressSink`].
//!
//! # Example
//!
//! ```no_run
//! use shiptrack_ingest::batch::BatchSet;
//! use shiptrack_ingest::config::PipelineConfig;
//! use shiptrack_ingest::pipeline::TrackingPipeline;
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let config = PipelineConfig::builder("acme", "https://api.acme.test/track?ids={ids}")
//!         .workers(10)
//!         .build()?;
//!     let batches = BatchSet::chunked("nightly", ["1Z001", "1Z002", "1Z003"], 2)?;
//!
//!     let summary = TrackingPipeline::new(config)?.run(batches).await;
//!     println!("{} batches failed", summary.failed_batches());
//!     Ok(())
//! }
//! ```

pub mod batch;
pub mod config;
pub mod fetcher;
pub mod models;
pub mod parser;
pub mod pipeline;
pub mod progress;
pub mod queue;
pub mod store;
pub mod url;
pub mod worker;

pub use batch::{Batch, BatchName, BatchSet};
pub use config::{PipelineConfig, RetryPolicy};
pub use pipeline::{RunSummary, StageReport, TrackingPipeline};
