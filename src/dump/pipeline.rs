//! Drives listing, transfer and validation over every selected wiki.
//!
//! Wikis are handled one after the other and so are their dump files. A wiki
//! whose listing cannot be fetched, or a file that cannot be obtained, is
//! logged and left in the ledger; the batch always runs to the end unless it is
//! cancelled.

use std::path::PathBuf;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn};

use super::downloader::TransferStatus;
use super::{
    DumpCandidate, DumpError, Downloader, Ledger, ListingMode, ListingResolver, Progress, Result,
    Validator, http_client,
};
use crate::config::DownloadConfig;
use crate::wikis::{WikiSet, WikiTarget};

/// Counters of one run, per dump file except `listing_failed`
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RunSummary {
    pub transferred: usize,
    pub skipped: usize,
    pub failed: usize,
    pub listing_failed: usize,
}

pub struct Pipeline {
    resolver: ListingResolver,
    downloader: Downloader,
    validator: Validator,
    base_path: PathBuf,
    mode: ListingMode,
    force: bool,
    pause: Duration,
    missing_path: PathBuf,
    cancel_token: CancellationToken,
}

impl Pipeline {
    pub fn from_config(config: &DownloadConfig, cancel_token: CancellationToken) -> Result<Self> {
        let timeout = config.timeout();
        let client = http_client(timeout)?;

        Ok(Self {
            resolver: ListingResolver::new(
                client.clone(),
                &config.dumps_url,
                config.dump_class,
                timeout,
            ),
            downloader: Downloader::new(timeout)?
                .with_max_retries(config.maxretries)
                .with_cancellation(cancel_token.clone()),
            validator: Validator::new(
                config.strategy(),
                client,
                &config.dumps_url,
                &config.out,
                timeout,
            ),
            base_path: config.out.clone(),
            mode: config.mode,
            force: config.force,
            pause: config.pause(),
            missing_path: config.missing_path(),
            cancel_token,
        })
    }

    pub fn missing_path(&self) -> &std::path::Path {
        &self.missing_path
    }

    /// Run over `wikis` in id order and persist what is still missing
    #[instrument(skip_all, fields(wikis = wikis.len()))]
    pub async fn run(&self, wikis: &WikiSet) -> Result<(Ledger, RunSummary)> {
        let mut ledger = Ledger::new();
        let mut summary = RunSummary::default();

        // Unvisited wikis must survive a cancelled run
        for wiki in wikis.iter() {
            ledger.track(wiki);
        }

        'wikis: for wiki in wikis.iter() {
            if self.cancel_token.is_cancelled() {
                warn!("Cancelled, not starting further wikis");
                break;
            }

            let candidates = match self.resolver.resolve(&wiki.id, self.mode).await {
                Ok(candidates) => candidates,
                Err(e) => {
                    error!(error = %e, "Error on {} {}", wiki.display_name, wiki.id);
                    summary.listing_failed += 1;
                    continue;
                }
            };

            let wiki_dir = self.base_path.join(&wiki.id);
            if let Err(e) = tokio::fs::create_dir_all(&wiki_dir).await {
                error!(path = ?wiki_dir, error = %e, "Cannot create output directory");
                summary.listing_failed += 1;
                continue;
            }

            if candidates.is_empty() {
                warn!(wiki = %wiki.id, "No dump advertised in listing");
            }
            ledger.record_candidates(&wiki.id, &candidates);

            for candidate in &candidates {
                match self.fetch_candidate(wiki, candidate).await {
                    Ok(Fetched::Transferred) => {
                        ledger.mark_resolved(&wiki.id, &candidate.url);
                        summary.transferred += 1;
                    }
                    Ok(Fetched::AlreadyPresent) => {
                        ledger.mark_resolved(&wiki.id, &candidate.url);
                        summary.skipped += 1;
                        continue;
                    }
                    Err(DumpError::Cancelled) => {
                        warn!(url = %candidate.url, "Cancelled");
                        break 'wikis;
                    }
                    Err(e) => {
                        error!(wiki = %wiki.id, url = %candidate.url, error = %e, "Could not obtain dump");
                        summary.failed += 1;
                    }
                }

                if !self.pause.is_zero() {
                    tokio::select! {
                        _ = self.cancel_token.cancelled() => break 'wikis,
                        _ = tokio::time::sleep(self.pause) => {}
                    }
                }
            }
        }

        ledger.flush(&self.missing_path)?;
        info!(
            transferred = summary.transferred,
            skipped = summary.skipped,
            failed = summary.failed,
            listing_failed = summary.listing_failed,
            "Run finished"
        );
        Ok((ledger, summary))
    }

    #[instrument(skip_all, fields(wiki = %wiki.id, file = %candidate.filename))]
    async fn fetch_candidate(&self, wiki: &WikiTarget, candidate: &DumpCandidate) -> Result<Fetched> {
        let final_path = self.base_path.join(&wiki.id).join(&candidate.filename);

        if !self.force && tokio::fs::try_exists(&final_path).await? {
            info!(path = ?final_path, "Already downloaded");
            return Ok(Fetched::AlreadyPresent);
        }

        info!(
            wiki = %wiki.id,
            name = %wiki.display_name,
            url = %candidate.url,
            "Downloading"
        );
        let (progress_tx, logger) = spawn_progress_logger(candidate.filename.clone());
        let result = self
            .downloader
            .download(&wiki.id, candidate, &final_path, &self.validator, progress_tx)
            .await;
        if let Err(e) = logger.await {
            debug!(error = %e, "Progress logger ended abnormally");
        }

        result.map(|_| Fetched::Transferred)
    }
}

enum Fetched {
    Transferred,
    AlreadyPresent,
}

/// Log transfer progress whenever another tenth of the file has arrived
fn spawn_progress_logger(label: String) -> (mpsc::Sender<Progress>, JoinHandle<()>) {
    let (tx, mut rx) = mpsc::channel::<Progress>(64);
    let handle = tokio::spawn(async move {
        let mut last_decile = None;
        while let Some(progress) = rx.recv().await {
            match &progress.status {
                TransferStatus::Starting => last_decile = None,
                TransferStatus::Downloading => {
                    let decile = (progress.percentage() / 10.0).floor() as u64;
                    if last_decile != Some(decile) {
                        last_decile = Some(decile);
                        info!(
                            file = %label,
                            attempt = progress.attempt,
                            "{:.0}% of {}",
                            progress.percentage(),
                            bytesize::ByteSize(progress.total_size)
                        );
                    }
                }
                TransferStatus::Failed(reason) => {
                    debug!(file = %label, attempt = progress.attempt, %reason, "Attempt failed")
                }
                TransferStatus::Completed | TransferStatus::Cancelled => {}
            }
        }
    });
    (tx, handle)
}
