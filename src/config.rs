//! Config module for wikidumps

use std::path::{Path, PathBuf};
use std::time::Duration;

use clap::{Parser, Subcommand, ValueEnum};

use crate::dump::{DumpClass, ListingMode, ValidationStrategy};

pub const DEFAULT_DUMPS_URL: &str = "https://dumps.wikimedia.org";

#[derive(ValueEnum, Debug, Clone, Copy, Default, PartialEq, Eq)]
#[clap(rename_all = "lowercase")]
pub enum LogFormat {
    #[default]
    Text,
    Json,
}

#[derive(Parser, Debug, Clone)]
pub struct DownloadConfig {
    /// Output base path
    #[clap(short, long, env = "WD_OUT")]
    pub out: PathBuf,

    /// Relevant languages file (tab separated `display name`, `wiki id`).
    /// When absent, every wiki with a complete dump is discovered from the remote index
    #[clap(short, long, env = "WD_LANG")]
    pub lang: Option<PathBuf>,

    /// Force download even if already successfully downloaded
    #[clap(short, long, env = "WD_FORCE", default_value = "false")]
    pub force: bool,

    /// Disable md5 check
    #[clap(long, env = "WD_NOMD5", default_value = "false")]
    pub nomd5: bool,

    /// Disable bz2 integrity check
    #[clap(long, env = "WD_NOBZ2", default_value = "false")]
    pub nobz2: bool,

    /// Max attempts to download a dump before giving up on it for this run
    #[clap(
        short = 'r',
        long,
        env = "WD_MAX_RETRIES",
        default_value_t = 3,
        value_parser = clap::value_parser!(u32).range(1..)
    )]
    pub maxretries: u32,

    /// Timeout in seconds for http connections
    #[clap(short, long, env = "WD_TIMEOUT", default_value_t = 180)]
    pub timeout: u64,

    /// Which variant of the dump to fetch
    #[clap(long, env = "WD_MODE", value_enum, default_value = "auto")]
    pub mode: ListingMode,

    /// Dump family to fetch
    #[clap(long, env = "WD_DUMP_CLASS", value_enum, default_value = "pages-articles")]
    pub dump_class: DumpClass,

    /// Base url of the dumps mirror
    #[clap(long, env = "WD_DUMPS_URL", default_value = DEFAULT_DUMPS_URL)]
    pub dumps_url: String,

    /// Pause between two candidate downloads, in milliseconds
    #[clap(long, env = "WD_PAUSE_MS", default_value_t = 1000)]
    pub pause_ms: u64,
}

impl DownloadConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout)
    }

    pub fn pause(&self) -> Duration {
        Duration::from_millis(self.pause_ms)
    }

    /// md5 wins over bz2, bz2 wins over nothing
    pub fn strategy(&self) -> ValidationStrategy {
        match (self.nomd5, self.nobz2) {
            (false, _) => ValidationStrategy::Checksum,
            (true, false) => ValidationStrategy::StreamDecode,
            (true, true) => ValidationStrategy::None,
        }
    }

    /// Where the list of dumps that could not be obtained is written
    pub fn missing_path(&self) -> PathBuf {
        sidecar_path(self.lang.as_deref(), &self.out, "download_missing.txt")
    }
}

#[derive(Parser, Debug, Clone)]
pub struct ToTextConfig {
    /// Input base path
    #[clap(short, long, env = "WD_TOTEXT_INPUT")]
    pub input: PathBuf,

    /// Output base path
    #[clap(short, long, env = "WD_TOTEXT_OUTPUT")]
    pub output: PathBuf,

    /// Dry run, do not produce output
    #[clap(short, long, env = "WD_DRYRUN", default_value = "false")]
    pub dryrun: bool,

    /// Relevant languages file
    #[clap(short, long, env = "WD_LANG")]
    pub lang: Option<PathBuf>,

    /// Program that turns a decompressed dump on stdin into text files
    #[clap(long, env = "WD_EXTRACTOR", default_value = "python")]
    pub extractor: String,

    /// Leading arguments for the extractor, `-o <dir>` is appended
    #[clap(
        long,
        env = "WD_EXTRACTOR_ARGS",
        value_delimiter = ',',
        allow_hyphen_values = true,
        default_value = "WikiExtractor.py"
    )]
    pub extractor_args: Vec<String>,
}

impl ToTextConfig {
    /// Get extractor arguments (filters out empty strings)
    pub fn get_valid_extractor_args(&self) -> Vec<String> {
        self.extractor_args
            .iter()
            .filter(|s| !s.is_empty())
            .cloned()
            .collect()
    }
}

#[derive(Subcommand, Debug, Clone)]
pub enum Command {
    /// Download and verify the latest dumps
    Download(DownloadConfig),
    /// Convert downloaded dumps to plain text
    #[clap(name = "totext")]
    ToText(ToTextConfig),
}

#[derive(Parser, Debug, Clone)]
#[clap(name = "wikidumps", about = "Downloader of Wikimedia dumps")]
pub struct Config {
    #[clap(long, env = "WD_LOG_FORMAT", value_enum, default_value = "text", global = true)]
    pub log_format: LogFormat,

    #[clap(subcommand)]
    pub command: Command,
}

pub fn config() -> Config {
    Config::parse()
}

/// `{list}.{suffix}` next to the wiki list, or `{fallback}/{suffix}` when every wiki was discovered
pub fn sidecar_path(list: Option<&Path>, fallback: &Path, suffix: &str) -> PathBuf {
    match list {
        Some(path) => {
            let mut name = path.as_os_str().to_owned();
            name.push(".");
            name.push(suffix);
            PathBuf::from(name)
        }
        None => fallback.join(suffix),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(args: &[&str]) -> Config {
        Config::try_parse_from(args).unwrap()
    }

    #[test]
    fn test_download_defaults() {
        let config = parse(&["wikidumps", "download", "-o", "/data"]);
        let Command::Download(download) = config.command else {
            panic!("Expected download command");
        };
        assert_eq!(download.maxretries, 3);
        assert_eq!(download.timeout(), Duration::from_secs(180));
        assert_eq!(download.mode, ListingMode::Auto);
        assert_eq!(download.dump_class, DumpClass::PagesArticles);
        assert_eq!(download.strategy(), ValidationStrategy::Checksum);
        assert_eq!(download.dumps_url, DEFAULT_DUMPS_URL);
        assert!(!download.force);
    }

    #[test]
    fn test_strategy_selection() {
        let config = parse(&["wikidumps", "download", "-o", "/d", "--nomd5"]);
        let Command::Download(download) = config.command else {
            panic!("Expected download command");
        };
        assert_eq!(download.strategy(), ValidationStrategy::StreamDecode);

        let config = parse(&["wikidumps", "download", "-o", "/d", "--nomd5", "--nobz2"]);
        let Command::Download(download) = config.command else {
            panic!("Expected download command");
        };
        assert_eq!(download.strategy(), ValidationStrategy::None);

        // bz2 switch alone does not disable md5
        let config = parse(&["wikidumps", "download", "-o", "/d", "--nobz2"]);
        let Command::Download(download) = config.command else {
            panic!("Expected download command");
        };
        assert_eq!(download.strategy(), ValidationStrategy::Checksum);
    }

    #[test]
    fn test_zero_attempts_rejected() {
        assert!(Config::try_parse_from(["wikidumps", "download", "-o", "/d", "-r", "0"]).is_err());
        let config = parse(&["wikidumps", "download", "-o", "/d", "-r", "1"]);
        let Command::Download(download) = config.command else {
            panic!("Expected download command");
        };
        assert_eq!(download.maxretries, 1);
    }

    #[test]
    fn test_missing_path_next_to_list() {
        let config = parse(&["wikidumps", "download", "-o", "/d", "-l", "/cfg/langs.tsv"]);
        let Command::Download(download) = config.command else {
            panic!("Expected download command");
        };
        assert_eq!(
            download.missing_path(),
            PathBuf::from("/cfg/langs.tsv.download_missing.txt")
        );
    }

    #[test]
    fn test_totext_extractor_args() {
        let config = parse(&[
            "wikidumps",
            "totext",
            "-i",
            "/in",
            "-o",
            "/out",
            "--extractor",
            "wikiextractor",
            "--extractor-args=--no-templates,,--json",
        ]);
        let Command::ToText(totext) = config.command else {
            panic!("Expected totext command");
        };
        assert_eq!(
            totext.get_valid_extractor_args(),
            vec!["--no-templates".to_string(), "--json".to_string()]
        );
        assert!(!totext.dryrun);
    }
}
