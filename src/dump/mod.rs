//! Download and verification of the latest Wikimedia dumps.
//!
//! The pieces are used leaf first:
//!
//! - [`listing`] finds the dump files advertised for a wiki
//! - [`downloader`] streams one file into a `.tmp` sibling, retrying failed attempts
//! - [`validate`] checks a finished transfer and promotes it to its final name
//! - [`ledger`] remembers what is still missing so the next run can target the gaps
//! - [`pipeline`] drives all of the above over the selected wikis
//!

use std::path::PathBuf;
use std::time::Duration;

use thiserror::Error;

pub mod downloader;
pub mod ledger;
pub mod listing;
pub mod pipeline;
pub mod validate;

pub use downloader::{Downloader, Progress};
pub use ledger::Ledger;
pub use listing::{DumpCandidate, DumpClass, ListingMode, ListingResolver};
pub use pipeline::Pipeline;
pub use validate::{ValidationStrategy, Validator};

#[derive(Error, Debug)]
pub enum DumpError {
    /// Listing page or checksum manifest unreachable, or answered with a non 2xx status
    #[error("Failed to fetch {url}: {reason}")]
    Fetch { url: String, reason: String },

    #[error("Response for {url} has no Content-Length")]
    SizeUnknown { url: String },

    #[error("Wrong download size: expected {expected} bytes, got {actual}")]
    SizeMismatch { expected: u64, actual: u64 },

    #[error("Download failed after {bytes_downloaded} bytes: {source}")]
    Stream {
        bytes_downloaded: u64,
        #[source]
        source: std::io::Error,
    },

    #[error("Wrong md5 for {filename}: expected {expected}, got {actual}")]
    ChecksumMismatch {
        filename: String,
        expected: String,
        actual: String,
    },

    /// The manifest has no usable entry for the file, downloading again will not help
    #[error("No single md5 entry for {filename} in manifest ({matches} matches)")]
    ManifestEntry { filename: String, matches: usize },

    #[error("bz2 corrupted: {path}: {source}")]
    StreamCorrupt {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Gave up on {url} after {attempts} attempts: {last}")]
    RetriesExhausted {
        url: String,
        attempts: u32,
        last: Box<DumpError>,
    },

    #[error("Download cancelled")]
    Cancelled,

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Request error: {0}")]
    Request(#[from] reqwest::Error),
}

impl DumpError {
    /// Whether another attempt at the same candidate can succeed within this run
    pub fn is_retryable(&self) -> bool {
        !matches!(
            self,
            DumpError::Cancelled | DumpError::ManifestEntry { .. } | DumpError::RetriesExhausted { .. }
        )
    }

    pub(crate) fn fetch(url: &str, reason: impl ToString) -> Self {
        DumpError::Fetch {
            url: url.to_string(),
            reason: reason.to_string(),
        }
    }
}

pub type Result<T> = std::result::Result<T, DumpError>;

/// Wikimedia asks clients to identify themselves
pub const USER_AGENT: &str = concat!(env!("CARGO_PKG_NAME"), "/", env!("CARGO_PKG_VERSION"));

/// Client for the small documents of the dumps server, following redirects on its own
pub fn http_client(timeout: Duration) -> Result<reqwest::Client> {
    Ok(reqwest::Client::builder()
        .user_agent(USER_AGENT)
        .connect_timeout(timeout)
        .build()?)
}

/// GET a small text document (listing page, backup index, md5 manifest)
pub async fn fetch_text(client: &reqwest::Client, url: &str, timeout: Duration) -> Result<String> {
    tracing::debug!(url, "Fetching");
    let response = client
        .get(url)
        .timeout(timeout)
        .send()
        .await
        .map_err(|e| DumpError::fetch(url, e))?;

    if !response.status().is_success() {
        return Err(DumpError::fetch(url, response.status()));
    }

    response.text().await.map_err(|e| DumpError::fetch(url, e))
}
