//! HTTP download implementation
//!
//! This module streams dump files from the dumps server, handling redirects,
//! retries, and progress tracking. Bodies always land in a `.tmp` sibling of
//! the final path; only the validator moves them to their final name.

use futures_util::TryStreamExt;
use reqwest::{
    Client, Response, Url,
    header::{self, HeaderMap, HeaderValue},
};
use std::{io, path::Path, time::Duration};
use tokio::{fs::File, io::AsyncReadExt, io::AsyncWriteExt, sync::mpsc};
use tokio_util::{io::StreamReader, sync::CancellationToken};
use tracing::{debug, error, info, instrument, trace, warn};

use super::models::{Progress, TransferStatus};
use crate::dump::{DumpCandidate, DumpError, Result, Validator};
use crate::util::sibling;

/// Bytes read from the connection per step
pub const CHUNK_SIZE: usize = 64 * 1024;

/// Longest wait between two attempts
const MAX_RETRY_DELAY: Duration = Duration::from_secs(60);

pub struct Downloader {
    client: Client,
    max_redirects: usize,
    max_retries: u32,
    retry_delay: Duration,
    timeout: Duration,
    cancel_token: CancellationToken,
}

/// Size announced by the server for the body of `headers`
fn declared_size(headers: &HeaderMap) -> Option<u64> {
    headers
        .get(header::CONTENT_LENGTH)
        .and_then(|cl| cl.to_str().ok())
        .and_then(|cl| cl.trim().parse::<u64>().ok())
}

impl Downloader {
    pub fn new(timeout: Duration) -> Result<Self> {
        let mut headers = HeaderMap::new();
        headers.insert(header::ACCEPT, HeaderValue::from_static("*/*"));

        // Redirects are followed by hand so the hop count stays bounded and logged
        let client = Client::builder()
            .redirect(reqwest::redirect::Policy::none())
            .user_agent(crate::dump::USER_AGENT)
            .default_headers(headers)
            .connect_timeout(timeout)
            .build()?;

        Ok(Self {
            client,
            max_redirects: 10,
            max_retries: 3,
            retry_delay: Duration::from_secs(2),
            timeout,
            cancel_token: CancellationToken::new(),
        })
    }

    /// Total number of attempts per file, at least one
    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = max_retries.max(1);
        self
    }

    /// Wait before the second attempt, doubled for every further one up to a minute
    pub fn with_retry_delay(mut self, retry_delay: Duration) -> Self {
        self.retry_delay = retry_delay;
        self
    }

    pub fn with_cancellation(mut self, cancel_token: CancellationToken) -> Self {
        self.cancel_token = cancel_token;
        self
    }

    /// Wait before `attempt`, starting at 2
    fn backoff(&self, attempt: u32) -> Duration {
        self.retry_delay
            .saturating_mul(2u32.saturating_pow(attempt.saturating_sub(2)))
            .min(MAX_RETRY_DELAY)
    }

    pub async fn get_with_redirects(&self, url: &str) -> Result<Response> {
        let mut current_url = url.to_string();
        let mut redirect_count = 0;

        loop {
            let response = tokio::time::timeout(self.timeout, self.client.get(&current_url).send())
                .await
                .map_err(|_| DumpError::fetch(&current_url, "timed out waiting for response"))??;

            // If not a redirect or we've hit the max, return this response
            if !response.status().is_redirection() || redirect_count >= self.max_redirects {
                return Ok(response);
            }

            let location = response
                .headers()
                .get(header::LOCATION)
                .ok_or_else(|| DumpError::fetch(&current_url, "redirect without Location header"))?
                .to_str()
                .map_err(|e| DumpError::fetch(&current_url, e))?;

            // Handle relative URLs
            let next = Url::parse(&current_url)
                .and_then(|base| base.join(location))
                .map_err(|e| DumpError::fetch(&current_url, e))?;

            trace!(from = %current_url, to = %next, "Following redirect");
            current_url = next.to_string();
            redirect_count += 1;
        }
    }

    /// Download `candidate` to `final_path`, validating every finished attempt.
    ///
    /// Each attempt starts over from an empty `.tmp` file. Attempts that fail to
    /// transfer or to validate are discarded; after `max_retries` of them the
    /// candidate is given up with [`DumpError::RetriesExhausted`].
    #[instrument(name = "download", skip(self, candidate, validator, progress_tx), fields(url = %candidate.url))]
    pub async fn download(
        &self,
        wiki_id: &str,
        candidate: &DumpCandidate,
        final_path: &Path,
        validator: &Validator,
        progress_tx: mpsc::Sender<Progress>,
    ) -> Result<u64> {
        let temp_path = sibling(final_path, "tmp");
        let mut last_error: Option<DumpError> = None;

        // Fails before any transfer when the file could never be validated
        validator.prepare(wiki_id, candidate.remote_filename()).await?;

        for attempt in 1..=self.max_retries {
            if attempt > 1 {
                let delay = self.backoff(attempt);
                info!(
                    attempt,
                    delay_secs = delay.as_secs_f32(),
                    "Waiting before retry"
                );
                tokio::select! {
                    _ = self.cancel_token.cancelled() => return Err(DumpError::Cancelled),
                    _ = tokio::time::sleep(delay) => {}
                }
            }

            remove_stale(&temp_path).await?;

            let result = match self
                .transfer(&candidate.url, &temp_path, attempt, &progress_tx)
                .await
            {
                Ok(size) => validator
                    .validate(&temp_path, wiki_id, candidate.remote_filename(), final_path)
                    .await
                    .map(|()| size),
                Err(e) => Err(e),
            };

            match result {
                Ok(size) => return Ok(size),
                Err(e) => {
                    discard(&temp_path).await;
                    let _ = progress_tx
                        .send(Progress {
                            attempt,
                            status: if matches!(e, DumpError::Cancelled) {
                                TransferStatus::Cancelled
                            } else {
                                TransferStatus::Failed(e.to_string())
                            },
                            ..Default::default()
                        })
                        .await;

                    if !e.is_retryable() {
                        error!(error = %e, attempt, "Download failed permanently");
                        return Err(e);
                    }

                    warn!(
                        error = %e,
                        attempt,
                        max_retries = self.max_retries,
                        "Download attempt failed"
                    );
                    last_error = Some(e);
                }
            }
        }

        Err(DumpError::RetriesExhausted {
            url: candidate.url.clone(),
            attempts: self.max_retries,
            last: Box::new(last_error.unwrap_or(DumpError::Cancelled)),
        })
    }

    /// One attempt: stream `url` into `temp_path` and check the received size
    pub async fn transfer(
        &self,
        url: &str,
        temp_path: &Path,
        attempt: u32,
        progress_tx: &mpsc::Sender<Progress>,
    ) -> Result<u64> {
        if self.cancel_token.is_cancelled() {
            info!("Download cancelled before starting");
            return Err(DumpError::Cancelled);
        }

        let response = tokio::select! {
            _ = self.cancel_token.cancelled() => {
                info!("Download cancelled while waiting for response");
                return Err(DumpError::Cancelled);
            }
            response = self.get_with_redirects(url) => response?,
        };
        trace!(status = %response.status(), "Got response");

        if !response.status().is_success() {
            return Err(DumpError::fetch(url, response.status()));
        }

        let total_size = declared_size(response.headers()).ok_or_else(|| DumpError::SizeUnknown {
            url: url.to_string(),
        })?;
        info!(
            bytes = total_size,
            size = %bytesize::ByteSize(total_size),
            path = ?temp_path,
            "Starting download"
        );

        let mut file = File::create(temp_path).await?;
        let mut reader = StreamReader::new(Box::pin(
            response.bytes_stream().map_err(io::Error::other),
        ));
        let mut buf = vec![0u8; CHUNK_SIZE];
        let mut downloaded: u64 = 0;

        let progress = |downloaded: u64, status: TransferStatus| Progress {
            total_size,
            downloaded,
            attempt,
            status,
        };
        let _ = progress_tx
            .send(progress(0, TransferStatus::Starting))
            .await;

        loop {
            let read = tokio::select! {
                _ = self.cancel_token.cancelled() => {
                    info!(downloaded, "Download cancelled during progress");
                    let _ = file.shutdown().await;
                    return Err(DumpError::Cancelled);
                }
                read = tokio::time::timeout(self.timeout, reader.read(&mut buf)) => read,
            };

            let n = match read {
                Ok(Ok(0)) => break,
                Ok(Ok(n)) => n,
                Ok(Err(source)) => {
                    return Err(DumpError::Stream {
                        bytes_downloaded: downloaded,
                        source,
                    });
                }
                Err(_) => {
                    return Err(DumpError::Stream {
                        bytes_downloaded: downloaded,
                        source: io::Error::new(io::ErrorKind::TimedOut, "read timed out"),
                    });
                }
            };

            file.write_all(&buf[..n]).await?;
            downloaded += n as u64;
            trace!(bytes = downloaded, chunk_size = n, "Received chunk");

            let _ = progress_tx
                .send(progress(downloaded, TransferStatus::Downloading))
                .await;
        }

        // Make sure the file is completely written
        file.flush().await?;
        file.sync_all().await?;
        drop(file);

        let actual = tokio::fs::metadata(temp_path).await?.len();
        if actual != total_size {
            return Err(DumpError::SizeMismatch {
                expected: total_size,
                actual,
            });
        }

        info!(bytes = actual, "Download size OK");
        let _ = progress_tx
            .send(progress(actual, TransferStatus::Completed))
            .await;

        Ok(actual)
    }
}

async fn remove_stale(temp_path: &Path) -> Result<()> {
    match tokio::fs::remove_file(temp_path).await {
        Ok(()) => {
            debug!(path = ?temp_path, "Removed stale temporary file");
            Ok(())
        }
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(e.into()),
    }
}

async fn discard(temp_path: &Path) {
    if let Err(e) = tokio::fs::remove_file(temp_path).await {
        if e.kind() != io::ErrorKind::NotFound {
            warn!(path = ?temp_path, error = %e, "Failed to remove temporary file");
        }
    }
}
