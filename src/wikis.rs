//! Wiki selection for a run.
//!
//! A run either targets the wikis listed in a tab separated file
//! (`display name`, `wiki id`, anything after that is ignored) or every wiki
//! the dumps server reports as complete in its backup index.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::LazyLock;
use std::time::Duration;

use regex::Regex;
use thiserror::Error;

use crate::dump::{DumpError, fetch_text};

/// Display name given to wikis found through the remote index
pub const DISCOVERED_NAME: &str = "Added from web";

static COMPLETE_DUMP: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r#"<a href="(?P<project>[^"/>]+)wiki/(?P<date>\d+)">[^<]+</a>: <span class='done'>Dump complete</span>"#,
    )
    .expect("static regex")
});

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Failed to read wiki list {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("{path}:{line}: expected `display name<TAB>wiki id`, got {content:?}")]
    Malformed {
        path: PathBuf,
        line: usize,
        content: String,
    },
}

#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord)]
pub struct WikiTarget {
    /// Short code, `en` for `enwiki`
    pub id: String,
    pub display_name: String,
}

impl WikiTarget {
    pub fn new(id: impl Into<String>, display_name: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            display_name: display_name.into(),
        }
    }
}

/// The wikis selected for a run, keyed and iterated by id
#[derive(Debug, Clone, Default)]
pub struct WikiSet {
    wikis: BTreeMap<String, WikiTarget>,
}

impl WikiSet {
    pub fn insert(&mut self, wiki: WikiTarget) {
        self.wikis.insert(wiki.id.clone(), wiki);
    }

    pub fn get(&self, id: &str) -> Option<&WikiTarget> {
        self.wikis.get(id)
    }

    pub fn contains(&self, id: &str) -> bool {
        self.wikis.contains_key(id)
    }

    pub fn len(&self) -> usize {
        self.wikis.len()
    }

    pub fn is_empty(&self) -> bool {
        self.wikis.is_empty()
    }

    /// Sorted by id
    pub fn iter(&self) -> impl Iterator<Item = &WikiTarget> {
        self.wikis.values()
    }

    pub fn parse(path: &Path, content: &str) -> Result<Self, ConfigError> {
        let mut set = Self::default();
        for (index, line) in content.lines().enumerate() {
            let trimmed = line.trim();
            if trimmed.is_empty() {
                continue;
            }
            let mut fields = trimmed.split('\t').map(str::trim);
            match (fields.next(), fields.next()) {
                (Some(name), Some(id)) if !name.is_empty() && !id.is_empty() => {
                    set.insert(WikiTarget::new(id, name));
                }
                _ => {
                    return Err(ConfigError::Malformed {
                        path: path.to_path_buf(),
                        line: index + 1,
                        content: line.to_string(),
                    });
                }
            }
        }
        Ok(set)
    }

    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        Self::parse(path, &content)
    }

    /// Every wiki whose latest dump run completed, according to `{dumps_url}/backup-index.html`
    pub fn parse_backup_index(html: &str) -> Self {
        let mut set = Self::default();
        for captures in COMPLETE_DUMP.captures_iter(html) {
            set.insert(WikiTarget::new(&captures["project"], DISCOVERED_NAME));
        }
        set
    }

    #[tracing::instrument(skip(client))]
    pub async fn discover(
        client: &reqwest::Client,
        dumps_url: &str,
        timeout: Duration,
    ) -> Result<Self, DumpError> {
        let url = format!("{}/backup-index.html", dumps_url.trim_end_matches('/'));
        let html = fetch_text(client, &url, timeout).await?;
        let set = Self::parse_backup_index(&html);
        tracing::info!(wikis = set.len(), "Discovered wikis from backup index");
        Ok(set)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_list() {
        let content = "English\ten\nItaliano\tit\n\nLatina\tla\textra\n";
        let set = WikiSet::parse(Path::new("langs.tsv"), content).unwrap();
        let ids: Vec<_> = set.iter().map(|w| w.id.as_str()).collect();
        assert_eq!(ids, vec!["en", "it", "la"]);
        assert_eq!(set.get("it").unwrap().display_name, "Italiano");
    }

    #[test]
    fn test_parse_ledger_lines_as_input() {
        let content = "Test\txx\thttps://dumps.example/xxwiki/latest/xxwiki-latest-pages-articles.xml.bz2\n";
        let set = WikiSet::parse(Path::new("langs.tsv.download_missing.txt"), content).unwrap();
        assert_eq!(set.len(), 1);
        assert_eq!(set.get("xx").unwrap().display_name, "Test");
    }

    #[test]
    fn test_duplicate_id_keeps_last_name() {
        let content = "Old\ten\nNew\ten\n";
        let set = WikiSet::parse(Path::new("langs.tsv"), content).unwrap();
        assert_eq!(set.len(), 1);
        assert_eq!(set.get("en").unwrap().display_name, "New");
    }

    #[test]
    fn test_malformed_line() {
        let err = WikiSet::parse(Path::new("langs.tsv"), "English\ten\nbroken\n").unwrap_err();
        match err {
            ConfigError::Malformed { line, content, .. } => {
                assert_eq!(line, 2);
                assert_eq!(content, "broken");
            }
            other => panic!("Expected Malformed, got {other:?}"),
        }
    }

    #[test]
    fn test_missing_file() {
        let dir = tempfile::tempdir().unwrap();
        let err = WikiSet::from_file(&dir.path().join("nope.tsv")).unwrap_err();
        assert!(matches!(err, ConfigError::Read { .. }));
    }

    #[test]
    fn test_parse_backup_index() {
        let html = r#"<ul>
<li>2024-06-02 <a href="enwiki/20240601">enwiki</a>: <span class='done'>Dump complete</span></li>
<li>2024-06-02 <a href="itwiki/20240601">itwiki</a>: <span class='in-progress'>Dump in progress</span></li>
<li>2024-06-02 <a href="enwiktionary/20240601">enwiktionary</a>: <span class='done'>Dump complete</span></li>
<li>2024-06-02 <a href="zh_yuewiki/20240601">zh_yuewiki</a>: <span class='done'>Dump complete</span></li>
</ul>"#;
        let set = WikiSet::parse_backup_index(html);
        let ids: Vec<_> = set.iter().map(|w| w.id.as_str()).collect();
        assert_eq!(ids, vec!["en", "zh_yue"]);
        assert_eq!(set.get("en").unwrap().display_name, DISCOVERED_NAME);
    }
}
