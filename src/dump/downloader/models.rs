//! Data structures for the download system
//!
//! Progress values are published by the downloader while a transfer runs and
//! consumed by whoever reports on it.

use std::fmt;

/// Status of a transfer
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum TransferStatus {
    /// Connection opened, nothing received yet
    #[default]
    Starting,
    /// Body is being streamed
    Downloading,
    /// Body fully received
    Completed,
    /// Transfer was interrupted by the operator
    Cancelled,
    /// Attempt failed with an error
    Failed(String),
}

impl fmt::Display for TransferStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Starting => write!(f, "Starting"),
            Self::Downloading => write!(f, "Downloading"),
            Self::Completed => write!(f, "Completed"),
            Self::Cancelled => write!(f, "Cancelled"),
            Self::Failed(err) => write!(f, "Failed: {}", err),
        }
    }
}

/// Represents the progress of a transfer
#[derive(Debug, Clone, Default)]
pub struct Progress {
    /// Declared size of the file, from Content-Length
    pub total_size: u64,
    /// Number of bytes received so far
    pub downloaded: u64,
    /// Attempt number, starting at 1
    pub attempt: u32,
    pub status: TransferStatus,
}

impl Progress {
    /// Percentage of the declared size received so far
    pub fn percentage(&self) -> f64 {
        if self.total_size == 0 {
            return 100.0;
        }
        (self.downloaded as f64 * 100.0) / self.total_size as f64
    }
}
