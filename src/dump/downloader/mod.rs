//! Module for downloading dump files over HTTP
//!
//! This module streams one dump file at a time into a temporary sibling of its
//! final path, retrying failed attempts from scratch and reporting progress.

mod http;
mod models;

// Re-export the public API
pub use http::{CHUNK_SIZE, Downloader};
pub use models::{Progress, TransferStatus};
