//! Common utilities for devwatch
//!
//! This crate provides the plumbing shared between the watcher and the
//! ADB client: the workspace error type, logging setup, the
//! single-consumer task worker thread, and the interface identity hash.

pub mod error;
pub mod identity;
pub mod logging;
pub mod task;

pub use error::{Error, Result};
pub use identity::interface_identity;
pub use logging::setup_logging;
pub use task::{TaskHandle, TaskWorker};
