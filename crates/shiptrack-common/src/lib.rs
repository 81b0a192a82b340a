//! Shiptrack Common Library
#![deny(clippy::unwrap_used, clippy::expect_used)]
//!
//! Shared error taxonomy and logging setup for the Shiptrack workspace.
//!
//! # Overview
//!
//! - **Error Handling**: [`TrackError`] and [`FetchError`], the failure kinds a
//!   tracking run can surface, and the [`Result`] alias over them
//! - **Logging**: `tracing` subscriber initialisation driven by [`logging::LogConfig`]
//!
//! # Example
//!
//! ```no_run
//! use shiptrack_common::{Result, TrackError};
//!
//! fn require_ids(ids: &[String]) -> Result<()> {
//!     if ids.is_empty() {
//!         return Err(TrackError::InvalidBatch("no tracking identifiers".into()));
//!     }
//!     Ok(())
//! }
//! ```

pub mod error;
pub mod logging;

// Re-export commonly used types
pub use error::{FetchError, Result, TrackError};
