//! # kvmpilot Common
//!
//! Shared utilities for the kvmpilot components.
//!
//! ## Logging
//!
//! ```rust
//! use kvmpilot_common::init_logging;
//!
//! // Initialize with level; RUST_LOG takes precedence when set
//! init_logging("info").unwrap();
//! tracing::info!("ready");
//! ```

pub mod logging;

pub use logging::{init_logging, init_logging_json};
