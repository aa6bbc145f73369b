//! Conversion of downloaded dumps to plain text.
//!
//! Each `{wiki}wiki-*.bz2` file under the input tree is decompressed and piped
//! into an external extractor (WikiExtractor by default), which writes a text
//! tree under `{output}/{wiki}/{file name without .bz2}`.

use std::collections::BTreeMap;
use std::fs::File;
use std::io::{self, BufReader, Read};
use std::path::{Path, PathBuf};
use std::process::{ExitStatus, Stdio};
use std::sync::LazyLock;

use bzip2::read::MultiBzDecoder;
use regex::Regex;
use thiserror::Error;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tokio::sync::mpsc;
use tracing::{debug, error, info, instrument, warn};

use crate::config::{ToTextConfig, sidecar_path};
use crate::dump::downloader::CHUNK_SIZE;
use crate::util::{recursive_move, sibling};
use crate::wikis::{ConfigError, WikiSet, WikiTarget};

static DUMP_FILE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^(?P<prefix>(?P<wiki>[a-z_]+)wiki-.+)\.bz2$").expect("static regex")
});

/// Decompressed chunks buffered between the decoder and the extractor
const PIPE_DEPTH: usize = 16;

#[derive(Error, Debug)]
pub enum ConvertError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error("Failed to start extractor {program}: {source}")]
    Spawn {
        program: String,
        #[source]
        source: io::Error,
    },

    #[error("Extractor failed: {status}")]
    Extractor { status: ExitStatus },

    #[error("Failed to decompress {path}: {source}")]
    Decompress {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("Failed to feed extractor: {0}")]
    Pipe(#[source] io::Error),

    #[error("IO error: {0}")]
    Io(#[from] io::Error),
}

pub type Result<T> = std::result::Result<T, ConvertError>;

/// A dump found in the input tree
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord)]
pub struct DumpFile {
    pub path: PathBuf,
    /// File name without `.bz2`, names the output directory
    pub prefix: String,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ConvertSummary {
    pub converted: usize,
    pub skipped: usize,
    pub failed: usize,
}

/// Dump files under `input`, grouped by wiki id and sorted.
///
/// With a `filter`, wikis it does not list are ignored.
pub fn collect_dumps(input: &Path, filter: Option<&WikiSet>) -> BTreeMap<String, Vec<DumpFile>> {
    let mut dumps: BTreeMap<String, Vec<DumpFile>> = BTreeMap::new();

    for entry in jwalk::WalkDir::new(input).sort(true).into_iter() {
        let entry = match entry {
            Ok(entry) => entry,
            Err(e) => {
                warn!(error = %e, "Skipping unreadable entry");
                continue;
            }
        };
        if !entry.file_type().is_file() {
            continue;
        }

        let name = entry.file_name().to_string_lossy().into_owned();
        let Some(captures) = DUMP_FILE.captures(&name) else {
            continue;
        };
        let wiki = &captures["wiki"];
        if filter.is_some_and(|wikis| !wikis.contains(wiki)) {
            continue;
        }

        dumps.entry(wiki.to_string()).or_default().push(DumpFile {
            path: entry.path(),
            prefix: captures["prefix"].to_string(),
        });
    }

    for files in dumps.values_mut() {
        files.sort();
    }
    dumps
}

/// Listed wikis without any dump in the input tree
pub fn missing_wikis<'a>(
    wikis: &'a WikiSet,
    dumps: &BTreeMap<String, Vec<DumpFile>>,
) -> Vec<&'a WikiTarget> {
    wikis
        .iter()
        .filter(|wiki| !dumps.contains_key(&wiki.id))
        .collect()
}

pub struct Converter {
    output: PathBuf,
    dry_run: bool,
    extractor: String,
    extractor_args: Vec<String>,
}

impl Converter {
    pub fn new(
        output: impl Into<PathBuf>,
        dry_run: bool,
        extractor: impl Into<String>,
        extractor_args: Vec<String>,
    ) -> Self {
        Self {
            output: output.into(),
            dry_run,
            extractor: extractor.into(),
            extractor_args,
        }
    }

    pub fn from_config(config: &ToTextConfig) -> Self {
        Self::new(
            &config.output,
            config.dryrun,
            &config.extractor,
            config.get_valid_extractor_args(),
        )
    }

    pub fn output_dir(&self, wiki: &str, dump: &DumpFile) -> PathBuf {
        self.output.join(wiki).join(&dump.prefix)
    }

    /// Convert every dump, wiki by wiki. A failed file is logged and skipped
    pub async fn convert(&self, dumps: &BTreeMap<String, Vec<DumpFile>>) -> ConvertSummary {
        let mut summary = ConvertSummary::default();

        for (wiki, files) in dumps {
            for dump in files {
                if self.dry_run {
                    info!(wiki = %wiki, file = ?dump.path, "Dry run");
                    continue;
                }

                match self.convert_file(wiki, dump).await {
                    Ok(true) => summary.converted += 1,
                    Ok(false) => summary.skipped += 1,
                    Err(e) => {
                        error!(wiki = %wiki, file = ?dump.path, error = %e, "Conversion failed");
                        summary.failed += 1;
                    }
                }
            }
        }

        summary
    }

    /// Returns whether the extractor ran
    #[instrument(skip(self, dump), fields(file = ?dump.path))]
    async fn convert_file(&self, wiki: &str, dump: &DumpFile) -> Result<bool> {
        let target = self.output_dir(wiki, dump);

        if target.exists() {
            if !is_outdated(&dump.path, &target)? {
                info!(path = ?target, "Skipping, up to date");
                return Ok(false);
            }
            info!(path = ?target, "Output outdated");
            tokio::fs::remove_dir_all(&target).await?;
        }

        let tmp = sibling(&target, "tmp");
        remove_dir_if_exists(&tmp).await?;
        if let Some(parent) = tmp.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }

        info!("Processing");
        match self.extract(&dump.path, &tmp).await {
            Ok(()) => {
                recursive_move(&tmp, &target).await?;
                info!(path = ?target, "Done");
                Ok(true)
            }
            Err(e) => {
                if let Err(remove_err) = remove_dir_if_exists(&tmp).await {
                    warn!(path = ?tmp, error = %remove_err, "Failed to remove partial output");
                }
                Err(e)
            }
        }
    }

    /// Decompress `source` into the extractor's stdin, writing its output to `out_dir`
    async fn extract(&self, source: &Path, out_dir: &Path) -> Result<()> {
        let mut child = Command::new(&self.extractor)
            .args(&self.extractor_args)
            .arg("-o")
            .arg(out_dir)
            .stdin(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|source| ConvertError::Spawn {
                program: self.extractor.clone(),
                source,
            })?;

        let mut stdin = child
            .stdin
            .take()
            .ok_or_else(|| ConvertError::Pipe(io::Error::other("extractor stdin unavailable")))?;

        let (tx, mut rx) = mpsc::channel::<Vec<u8>>(PIPE_DEPTH);

        let path = source.to_path_buf();
        let producer = tokio::task::spawn_blocking(move || -> io::Result<u64> {
            let file = File::open(&path)?;
            let mut decoder = MultiBzDecoder::new(BufReader::with_capacity(CHUNK_SIZE, file));
            let mut total = 0u64;
            loop {
                let mut buf = vec![0u8; CHUNK_SIZE];
                let n = decoder.read(&mut buf)?;
                if n == 0 {
                    break;
                }
                buf.truncate(n);
                total += n as u64;
                // Receiver gone means the writer already failed
                if tx.blocking_send(buf).is_err() {
                    break;
                }
            }
            Ok(total)
        });

        let writer = tokio::spawn(async move {
            let mut result = Ok(());
            while let Some(chunk) = rx.recv().await {
                if let Err(e) = stdin.write_all(&chunk).await {
                    result = Err(e);
                    break;
                }
            }
            drop(rx);
            if let Err(e) = stdin.shutdown().await {
                debug!(error = %e, "Closing extractor stdin");
            }
            result
        });

        let status = child.wait().await?;
        let produced = producer.await.map_err(io::Error::other)?;
        let written = writer.await.map_err(io::Error::other)?;

        if !status.success() {
            return Err(ConvertError::Extractor { status });
        }
        let bytes = produced.map_err(|e| ConvertError::Decompress {
            path: source.to_path_buf(),
            source: e,
        })?;
        written.map_err(ConvertError::Pipe)?;

        debug!(decompressed = %bytesize::ByteSize(bytes), "Extractor finished");
        Ok(())
    }
}

/// The output predates its source dump
fn is_outdated(source: &Path, output: &Path) -> io::Result<bool> {
    let source_time = std::fs::metadata(source)?.modified()?;
    let output_time = std::fs::metadata(output)?.modified()?;
    Ok(source_time > output_time)
}

async fn remove_dir_if_exists(path: &Path) -> io::Result<()> {
    match tokio::fs::remove_dir_all(path).await {
        Err(e) if e.kind() != io::ErrorKind::NotFound => Err(e),
        _ => Ok(()),
    }
}

/// Convert the dumps under `config.input`, then report listed wikis that had none
pub async fn run(config: &ToTextConfig) -> Result<ConvertSummary> {
    let wikis = config.lang.as_deref().map(WikiSet::from_file).transpose()?;

    let dumps = collect_dumps(&config.input, wikis.as_ref());
    info!(
        wikis = dumps.len(),
        files = dumps.values().map(Vec::len).sum::<usize>(),
        "Found dumps"
    );

    let summary = Converter::from_config(config).convert(&dumps).await;
    info!(
        converted = summary.converted,
        skipped = summary.skipped,
        failed = summary.failed,
        "Conversion finished"
    );

    if let Some(wikis) = &wikis {
        let missing = missing_wikis(wikis, &dumps);
        let path = sidecar_path(config.lang.as_deref(), &config.output, "totext_missing.txt");
        let mut content = String::new();
        for wiki in &missing {
            warn!(wiki = %wiki.id, name = %wiki.display_name, "No dump found");
            content.push_str(&format!("{}\t{}\n", wiki.display_name, wiki.id));
        }
        tokio::fs::write(&path, content).await?;
        info!(path = ?path, missing = missing.len(), "Wrote missing wikis");
    }

    Ok(summary)
}
