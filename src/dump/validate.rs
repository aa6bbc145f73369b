//! Integrity checks for finished transfers.
//!
//! A transfer that arrived with the declared size is still only a `.tmp` file.
//! The validator decides whether it is kept, using one of:
//!
//! - **checksum**: md5 of the file against the wiki's `md5sums.txt` manifest.
//!   The manifest lists dated names (`xxwiki-20240601-...`) while the file was
//!   fetched under its `latest` alias, so `latest` is matched as any 8 digit date.
//!   Manifests can lag behind what `latest` currently serves, which is why the
//!   decode check exists as an independent alternative.
//! - **stream decode**: decompress the whole bz2 archive and discard the output.
//! - **none**: accept as is.
//!
//! Accepted files are renamed to their final name. The decode and none
//! strategies also leave an empty `.ok` marker next to the file.

use std::collections::{BTreeMap, BTreeSet};
use std::fs::File;
use std::io::{self, BufReader, Read};
use std::path::{Path, PathBuf};
use std::time::Duration;

use bzip2::read::MultiBzDecoder;
use regex::Regex;
use tokio::sync::Mutex;
use tracing::{debug, info, instrument, warn};

use super::downloader::CHUNK_SIZE;
use super::{DumpError, Result, fetch_text};
use crate::util::sibling;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ValidationStrategy {
    Checksum,
    StreamDecode,
    None,
}

pub struct Validator {
    strategy: ValidationStrategy,
    client: reqwest::Client,
    dumps_url: String,
    base_path: PathBuf,
    timeout: Duration,
    /// Manifests fetched so far, by wiki id
    manifests: Mutex<BTreeMap<String, String>>,
}

/// md5 of a file, read in chunks
pub fn compute_file_md5(path: &Path) -> io::Result<String> {
    let mut file = File::open(path)?;
    let mut context = md5::Context::new();
    let mut buf = vec![0u8; CHUNK_SIZE];
    loop {
        let n = file.read(&mut buf)?;
        if n == 0 {
            break;
        }
        context.consume(&buf[..n]);
    }
    Ok(format!("{:x}", context.compute()))
}

/// Decompress the whole archive, returning the decompressed size
pub fn decode_bz2(path: &Path) -> io::Result<u64> {
    let file = File::open(path)?;
    let mut decoder = MultiBzDecoder::new(BufReader::with_capacity(CHUNK_SIZE, file));
    io::copy(&mut decoder, &mut io::sink())
}

/// The distinct checksums the manifest lists for `dump_filename`, whatever its date
pub fn manifest_entries(manifest: &str, dump_filename: &str) -> Result<BTreeSet<String>> {
    let name = regex::escape(dump_filename).replace("latest", "[0-9]{8}");
    let pattern = Regex::new(&format!(r"(?m)^(?P<md5>[a-f0-9]{{32}})\s+{name}\s*$"))
        .map_err(|e| DumpError::fetch(dump_filename, format!("bad manifest pattern: {e}")))?;

    Ok(pattern
        .captures_iter(manifest)
        .map(|captures| captures["md5"].to_string())
        .collect())
}

impl Validator {
    pub fn new(
        strategy: ValidationStrategy,
        client: reqwest::Client,
        dumps_url: &str,
        base_path: &Path,
        timeout: Duration,
    ) -> Self {
        Self {
            strategy,
            client,
            dumps_url: dumps_url.trim_end_matches('/').to_string(),
            base_path: base_path.to_path_buf(),
            timeout,
            manifests: Mutex::new(BTreeMap::new()),
        }
    }

    /// Checks that can be made before any byte is transferred.
    ///
    /// For the checksum strategy this loads the wiki's manifest and requires a
    /// usable entry for `dump_filename`, so a missing manifest never costs a download.
    pub async fn prepare(&self, wiki_id: &str, dump_filename: &str) -> Result<()> {
        if self.strategy == ValidationStrategy::Checksum {
            self.expected_md5(wiki_id, dump_filename).await?;
        }
        Ok(())
    }

    pub fn manifest_url(&self, wiki_id: &str) -> String {
        format!(
            "{}/{id}wiki/latest/{id}wiki-latest-md5sums.txt",
            self.dumps_url,
            id = wiki_id
        )
    }

    /// Local copy of the last fetched manifest
    pub fn manifest_cache_path(&self, wiki_id: &str) -> PathBuf {
        self.base_path
            .join(wiki_id)
            .join(format!("{wiki_id}-latest-md5sums.txt"))
    }

    /// Check `temp_path` and, when it passes, move it to `final_path`.
    ///
    /// On failure the temporary file is removed and `final_path` is left alone.
    #[instrument(level = "debug", skip(self, temp_path, final_path))]
    pub async fn validate(
        &self,
        temp_path: &Path,
        wiki_id: &str,
        dump_filename: &str,
        final_path: &Path,
    ) -> Result<()> {
        let outcome = match self.strategy {
            ValidationStrategy::Checksum => {
                self.verify_checksum(temp_path, wiki_id, dump_filename).await
            }
            ValidationStrategy::StreamDecode => verify_stream(temp_path).await,
            ValidationStrategy::None => {
                info!(wiki = wiki_id, "Assuming OK (no md5 or bz2 check)");
                Ok(())
            }
        };

        if let Err(e) = outcome {
            if let Err(remove_err) = tokio::fs::remove_file(temp_path).await {
                if remove_err.kind() != io::ErrorKind::NotFound {
                    warn!(path = ?temp_path, error = %remove_err, "Failed to discard rejected download");
                }
            }
            return Err(e);
        }

        self.promote(temp_path, final_path).await
    }

    async fn promote(&self, temp_path: &Path, final_path: &Path) -> Result<()> {
        let marker = sibling(final_path, "ok");
        // A previous marker describes the file being replaced
        match tokio::fs::remove_file(&marker).await {
            Err(e) if e.kind() != io::ErrorKind::NotFound => return Err(e.into()),
            _ => {}
        }

        tokio::fs::rename(temp_path, final_path).await?;
        debug!(path = ?final_path, "Promoted download");

        if self.strategy != ValidationStrategy::Checksum {
            tokio::fs::File::create(&marker).await?;
        }
        Ok(())
    }

    /// The wiki's manifest, fetched once and cached on disk next to its dumps
    async fn manifest(&self, wiki_id: &str) -> Result<String> {
        let mut manifests = self.manifests.lock().await;
        if let Some(manifest) = manifests.get(wiki_id) {
            return Ok(manifest.clone());
        }

        let manifest = fetch_text(&self.client, &self.manifest_url(wiki_id), self.timeout).await?;

        let cache = self.manifest_cache_path(wiki_id);
        if let Some(parent) = cache.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        tokio::fs::write(&cache, &manifest).await?;

        manifests.insert(wiki_id.to_string(), manifest.clone());
        Ok(manifest)
    }

    async fn expected_md5(&self, wiki_id: &str, dump_filename: &str) -> Result<String> {
        let manifest = self.manifest(wiki_id).await?;
        let entries = manifest_entries(&manifest, dump_filename)?;
        match entries.len() {
            1 => Ok(entries.into_iter().next().unwrap_or_default()),
            matches => {
                warn!(wiki = wiki_id, file = dump_filename, matches, "No usable md5 entry");
                Err(DumpError::ManifestEntry {
                    filename: dump_filename.to_string(),
                    matches,
                })
            }
        }
    }

    async fn verify_checksum(&self, temp_path: &Path, wiki_id: &str, dump_filename: &str) -> Result<()> {
        let path = temp_path.to_path_buf();
        let local = tokio::task::spawn_blocking(move || compute_file_md5(&path))
            .await
            .map_err(io::Error::other)??;

        let expected = self.expected_md5(wiki_id, dump_filename).await?;

        if local.eq_ignore_ascii_case(&expected) {
            info!(wiki = wiki_id, "Tested OK (md5)");
            Ok(())
        } else {
            warn!(wiki = wiki_id, %expected, actual = %local, "Wrong md5");
            Err(DumpError::ChecksumMismatch {
                filename: dump_filename.to_string(),
                expected,
                actual: local,
            })
        }
    }
}

async fn verify_stream(temp_path: &Path) -> Result<()> {
    let path = temp_path.to_path_buf();
    let decoded = tokio::task::spawn_blocking(move || decode_bz2(&path))
        .await
        .map_err(io::Error::other)?;

    match decoded {
        Ok(bytes) => {
            info!(decompressed = %bytesize::ByteSize(bytes), "Tested OK (bz2)");
            Ok(())
        }
        Err(source) => {
            warn!(error = %source, "bz2 corrupted");
            Err(DumpError::StreamCorrupt {
                path: temp_path.to_path_buf(),
                source,
            })
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bzip2::Compression;
    use bzip2::write::BzEncoder;
    use std::io::Write;
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    const FILE: &str = "xxwiki-latest-pages-articles1.xml-p1p1000.bz2";

    fn bz2(data: &[u8]) -> Vec<u8> {
        let mut encoder = BzEncoder::new(Vec::new(), Compression::default());
        encoder.write_all(data).unwrap();
        encoder.finish().unwrap()
    }

    fn validator(dumps_url: &str, base: &Path, strategy: ValidationStrategy) -> Validator {
        Validator::new(
            strategy,
            reqwest::Client::new(),
            dumps_url,
            base,
            Duration::from_secs(5),
        )
    }

    fn write_temp(dir: &Path, content: &[u8]) -> (PathBuf, PathBuf) {
        let final_path = dir.join("xxwiki-latest-pages-articles1.xml.bz2");
        let temp_path = sibling(&final_path, "tmp");
        std::fs::write(&temp_path, content).unwrap();
        (temp_path, final_path)
    }

    #[test]
    fn test_compute_file_md5() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("hello");
        std::fs::write(&path, b"Hello, world!").unwrap();
        assert_eq!(
            compute_file_md5(&path).unwrap(),
            "6cd3556deb0da54bca060b4c39479839"
        );
    }

    #[test]
    fn test_manifest_entries_match_dated_name() {
        let manifest = "\
0123456789abcdef0123456789abcdef  xxwiki-20240601-pages-articles1.xml-p1p1000.bz2
fedcba9876543210fedcba9876543210  xxwiki-20240601-pages-articles2.xml-p1001p2000.bz2
aaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaa  xxwiki-20240601-pages-articles1.xml-p1p1000.bz2-rss.xml
";
        let entries = manifest_entries(manifest, FILE).unwrap();
        assert_eq!(
            entries.into_iter().collect::<Vec<_>>(),
            vec!["0123456789abcdef0123456789abcdef".to_string()]
        );
    }

    #[test]
    fn test_manifest_entries_are_not_a_prefix_match() {
        let manifest = "0123456789abcdef0123456789abcdef  xxwiki-20240601-pages-articles1.xml-p1p10000.bz2\n";
        assert!(manifest_entries(manifest, FILE).unwrap().is_empty());
    }

    #[test]
    fn test_decode_bz2() {
        let dir = tempfile::tempdir().unwrap();
        let good = dir.path().join("good.bz2");
        std::fs::write(&good, bz2(b"<mediawiki>hello</mediawiki>")).unwrap();
        assert_eq!(decode_bz2(&good).unwrap(), 28);

        let mut data = bz2(&vec![b'x'; 100_000]);
        data.truncate(data.len() / 2);
        let truncated = dir.path().join("truncated.bz2");
        std::fs::write(&truncated, data).unwrap();
        assert!(decode_bz2(&truncated).is_err());

        let garbage = dir.path().join("garbage.bz2");
        std::fs::write(&garbage, b"this is not bzip2").unwrap();
        assert!(decode_bz2(&garbage).is_err());
    }

    #[tokio::test]
    async fn test_stream_decode_promotes_and_marks() {
        let dir = tempfile::tempdir().unwrap();
        let (temp_path, final_path) = write_temp(dir.path(), &bz2(b"<page/>"));

        validator("http://unused.invalid", dir.path(), ValidationStrategy::StreamDecode)
            .validate(&temp_path, "xx", FILE, &final_path)
            .await
            .unwrap();

        assert!(final_path.exists());
        assert!(!temp_path.exists());
        let marker = sibling(&final_path, "ok");
        assert_eq!(std::fs::metadata(marker).unwrap().len(), 0);
    }

    #[tokio::test]
    async fn test_stream_decode_rejects_corrupt_file() {
        let dir = tempfile::tempdir().unwrap();
        let mut data = bz2(&vec![b'y'; 50_000]);
        let middle = data.len() / 2;
        data[middle] ^= 0xff;
        data[middle + 1] ^= 0xff;
        let (temp_path, final_path) = write_temp(dir.path(), &data);

        let err = validator("http://unused.invalid", dir.path(), ValidationStrategy::StreamDecode)
            .validate(&temp_path, "xx", FILE, &final_path)
            .await
            .unwrap_err();

        assert!(matches!(err, DumpError::StreamCorrupt { .. }));
        assert!(!temp_path.exists());
        assert!(!final_path.exists());
        assert!(!sibling(&final_path, "ok").exists());
    }

    #[tokio::test]
    async fn test_none_strategy_accepts_anything() {
        let dir = tempfile::tempdir().unwrap();
        let (temp_path, final_path) = write_temp(dir.path(), b"whatever");

        validator("http://unused.invalid", dir.path(), ValidationStrategy::None)
            .validate(&temp_path, "xx", FILE, &final_path)
            .await
            .unwrap();

        assert_eq!(std::fs::read(&final_path).unwrap(), b"whatever");
        assert!(sibling(&final_path, "ok").exists());
    }

    async fn manifest_server(body: String) -> MockServer {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/xxwiki/latest/xxwiki-latest-md5sums.txt"))
            .respond_with(ResponseTemplate::new(200).set_body_string(body))
            .mount(&server)
            .await;
        server
    }

    #[tokio::test]
    async fn test_checksum_match_promotes_without_marker() {
        let content = b"dump bytes";
        let md5 = format!("{:x}", md5::compute(content));
        let server = manifest_server(format!(
            "{md5}  xxwiki-20240601-pages-articles1.xml-p1p1000.bz2\n"
        ))
        .await;

        let dir = tempfile::tempdir().unwrap();
        let (temp_path, final_path) = write_temp(dir.path(), content);
        let validator = validator(&server.uri(), dir.path(), ValidationStrategy::Checksum);

        validator
            .validate(&temp_path, "xx", FILE, &final_path)
            .await
            .unwrap();

        assert!(final_path.exists());
        assert!(!sibling(&final_path, "ok").exists());
        let cached = std::fs::read_to_string(validator.manifest_cache_path("xx")).unwrap();
        assert!(cached.contains(&md5));
    }

    #[tokio::test]
    async fn test_manifest_fetched_once_per_wiki() {
        let content = b"dump bytes";
        let md5 = format!("{:x}", md5::compute(content));
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/xxwiki/latest/xxwiki-latest-md5sums.txt"))
            .respond_with(ResponseTemplate::new(200).set_body_string(format!(
                "{md5}  xxwiki-20240601-pages-articles1.xml-p1p1000.bz2\n\
                 {md5}  xxwiki-20240601-pages-articles2.xml-p1001p2000.bz2\n"
            )))
            .expect(1)
            .mount(&server)
            .await;

        let dir = tempfile::tempdir().unwrap();
        let validator = validator(&server.uri(), dir.path(), ValidationStrategy::Checksum);
        validator.prepare("xx", FILE).await.unwrap();

        for (name, local) in [
            (FILE, "a.xml.bz2"),
            ("xxwiki-latest-pages-articles2.xml-p1001p2000.bz2", "b.xml.bz2"),
        ] {
            let final_path = dir.path().join(local);
            let temp_path = sibling(&final_path, "tmp");
            std::fs::write(&temp_path, content).unwrap();
            validator
                .validate(&temp_path, "xx", name, &final_path)
                .await
                .unwrap();
            assert!(final_path.exists());
        }
    }

    #[tokio::test]
    async fn test_prepare_rejects_before_download() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/xxwiki/latest/xxwiki-latest-md5sums.txt"))
            .respond_with(ResponseTemplate::new(404))
            .mount(&server)
            .await;

        let dir = tempfile::tempdir().unwrap();
        let err = validator(&server.uri(), dir.path(), ValidationStrategy::Checksum)
            .prepare("xx", FILE)
            .await
            .unwrap_err();
        assert!(matches!(err, DumpError::Fetch { .. }));

        // Other strategies need nothing up front
        validator(&server.uri(), dir.path(), ValidationStrategy::StreamDecode)
            .prepare("xx", FILE)
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_checksum_mismatch_discards() {
        let server = manifest_server(
            "0123456789abcdef0123456789abcdef  xxwiki-20240601-pages-articles1.xml-p1p1000.bz2\n"
                .to_string(),
        )
        .await;

        let dir = tempfile::tempdir().unwrap();
        let (temp_path, final_path) = write_temp(dir.path(), b"dump bytes");

        let err = validator(&server.uri(), dir.path(), ValidationStrategy::Checksum)
            .validate(&temp_path, "xx", FILE, &final_path)
            .await
            .unwrap_err();

        assert!(matches!(err, DumpError::ChecksumMismatch { .. }));
        assert!(!temp_path.exists());
        assert!(!final_path.exists());
    }

    #[tokio::test]
    async fn test_checksum_without_entry_is_not_retryable() {
        let server = manifest_server(
            "0123456789abcdef0123456789abcdef  xxwiki-20240601-pages-articles2.xml-p1001p2000.bz2\n"
                .to_string(),
        )
        .await;

        let dir = tempfile::tempdir().unwrap();
        let (temp_path, final_path) = write_temp(dir.path(), b"dump bytes");

        let err = validator(&server.uri(), dir.path(), ValidationStrategy::Checksum)
            .validate(&temp_path, "xx", FILE, &final_path)
            .await
            .unwrap_err();

        assert!(matches!(err, DumpError::ManifestEntry { matches: 0, .. }));
        assert!(!err.is_retryable());
        assert!(!temp_path.exists());
    }

    #[tokio::test]
    async fn test_checksum_with_conflicting_entries() {
        let server = manifest_server(
            "0123456789abcdef0123456789abcdef  xxwiki-20240501-pages-articles1.xml-p1p1000.bz2\n\
             fedcba9876543210fedcba9876543210  xxwiki-20240601-pages-articles1.xml-p1p1000.bz2\n"
                .to_string(),
        )
        .await;

        let dir = tempfile::tempdir().unwrap();
        let (temp_path, final_path) = write_temp(dir.path(), b"dump bytes");

        let err = validator(&server.uri(), dir.path(), ValidationStrategy::Checksum)
            .validate(&temp_path, "xx", FILE, &final_path)
            .await
            .unwrap_err();

        assert!(matches!(err, DumpError::ManifestEntry { matches: 2, .. }));
    }
}
