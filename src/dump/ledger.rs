//! Record of the dumps a run has not obtained yet.
//!
//! Every candidate starts out missing and is removed once a verified file for
//! it is on disk. Whatever is left is written as `display\tid\turl` lines, which
//! the wiki list parser accepts, so the file can drive the next run.

use std::collections::{BTreeMap, BTreeSet};
use std::io::{self, Write};
use std::path::Path;

use tracing::{debug, info};

use super::DumpCandidate;
use crate::wikis::WikiTarget;

#[derive(Debug, Clone, Default)]
struct Entry {
    display_name: String,
    /// The wiki's listing advertised dumps, `missing` is authoritative
    listed: bool,
    missing: BTreeSet<String>,
}

#[derive(Debug, Default)]
pub struct Ledger {
    entries: BTreeMap<String, Entry>,
}

impl Ledger {
    pub fn new() -> Self {
        Self::default()
    }

    /// Start tracking a wiki whose listing is not known yet
    pub fn track(&mut self, wiki: &WikiTarget) {
        let entry = self.entries.entry(wiki.id.clone()).or_default();
        entry.display_name = wiki.display_name.clone();
    }

    /// Mark all of `candidates` outstanding for `wiki_id`.
    ///
    /// A listing without candidates leaves the wiki as a whole outstanding.
    pub fn record_candidates(&mut self, wiki_id: &str, candidates: &[DumpCandidate]) {
        let entry = self.entries.entry(wiki_id.to_string()).or_default();
        entry.listed = !candidates.is_empty();
        entry
            .missing
            .extend(candidates.iter().map(|candidate| candidate.url.clone()));
    }

    /// Remove one url from a wiki's outstanding set. Returns whether it was there
    pub fn mark_resolved(&mut self, wiki_id: &str, url: &str) -> bool {
        let removed = self
            .entries
            .get_mut(wiki_id)
            .is_some_and(|entry| entry.missing.remove(url));
        if removed {
            debug!(wiki = wiki_id, url, "Resolved");
        }
        removed
    }

    pub fn is_missing(&self, wiki_id: &str, url: &str) -> bool {
        self.entries
            .get(wiki_id)
            .is_some_and(|entry| !entry.listed || entry.missing.contains(url))
    }

    /// Nothing outstanding and no wiki left unlisted
    pub fn is_empty(&self) -> bool {
        self.entries
            .values()
            .all(|entry| entry.listed && entry.missing.is_empty())
    }

    /// Number of outstanding urls
    pub fn missing_count(&self) -> usize {
        self.entries.values().map(|entry| entry.missing.len()).sum()
    }

    /// The ledger lines, sorted by wiki id then url
    pub fn lines(&self) -> Vec<String> {
        let mut lines = Vec::new();
        for (id, entry) in &self.entries {
            if !entry.listed {
                lines.push(format!("{}\t{}", entry.display_name, id));
                continue;
            }
            for url in &entry.missing {
                lines.push(format!("{}\t{}\t{}", entry.display_name, id, url));
            }
        }
        lines
    }

    /// Replace the file at `path` with the current lines, atomically
    pub fn flush(&self, path: &Path) -> io::Result<()> {
        let dir = match path.parent() {
            Some(parent) if !parent.as_os_str().is_empty() => parent,
            _ => Path::new("."),
        };
        std::fs::create_dir_all(dir)?;

        let mut file = tempfile::NamedTempFile::new_in(dir)?;
        for line in self.lines() {
            writeln!(file, "{line}")?;
        }
        file.as_file().sync_all()?;
        file.persist(path).map_err(|e| e.error)?;

        info!(path = ?path, missing = self.missing_count(), "Wrote missing dumps");
        Ok(())
    }
}
