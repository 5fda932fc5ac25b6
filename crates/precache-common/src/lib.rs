//! # Precache Common
//!
//! Utilities shared by the precache crates.
//!
//! ## Features
//!
//! - Logging configuration and setup
//! - Retry with exponential backoff for remote callbacks

pub mod logging;
pub mod retry;

pub use logging::{init_logging, LogConfig, LogFormat};
pub use retry::{retry_with_backoff, retry_with_backoff_if, Backoff, RetryConfig};
