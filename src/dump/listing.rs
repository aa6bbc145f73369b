//! Dump listing resolution.
//!
//! A wiki's `latest/` directory on the dumps server is a plain HTML index: a
//! list of `<a>` tags whose href is the name of each file. Small wikis publish a
//! single `{id}wiki-latest-pages-articles.xml.bz2`, large ones split the same
//! content into numbered parts that carry the page range they cover, e.g.
//! `{id}wiki-latest-pages-articles1.xml-p1p41242.bz2`.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::LazyLock;
use std::time::Duration;

use clap::ValueEnum;
use regex::Regex;
use scraper::{Html, Selector};
use url::Url;

use super::{DumpError, Result, fetch_text};

static PAGE_RANGE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^(?P<stem>.*?)-p[0-9]+-?p[0-9]+(?P<ext>(?:\.xml)?\.bz2)$").expect("static regex")
});

#[derive(ValueEnum, Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum ListingMode {
    /// The monolithic file only
    Single,
    /// The numbered parts only
    Split,
    /// Parts when the wiki is split, the monolithic file otherwise
    #[default]
    Auto,
}

#[derive(ValueEnum, Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum DumpClass {
    #[default]
    PagesArticles,
    PagesMetaCurrent,
}

impl DumpClass {
    pub fn as_str(&self) -> &'static str {
        match self {
            DumpClass::PagesArticles => "pages-articles",
            DumpClass::PagesMetaCurrent => "pages-meta-current",
        }
    }
}

/// Strip the page range of a split dump, so `a1.xml-p1p1000.bz2` and `a1.xml.bz2` land on the same file
pub fn canonical_filename(filename: &str) -> String {
    PAGE_RANGE.replace(filename, "$stem$ext").into_owned()
}

fn has_page_range(filename: &str) -> bool {
    PAGE_RANGE.is_match(filename)
}

/// One remote dump file and the name it is stored under locally
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord)]
pub struct DumpCandidate {
    pub url: String,
    pub filename: String,
}

impl DumpCandidate {
    pub fn new(url: impl Into<String>) -> Self {
        let url = url.into();
        let filename = canonical_filename(remote_name(&url));
        Self { url, filename }
    }

    /// The last path segment of the url, page range included
    pub fn remote_filename(&self) -> &str {
        remote_name(&self.url)
    }

    fn keep_remote_name(mut self) -> Self {
        self.filename = self.remote_filename().to_string();
        self
    }
}

fn remote_name(url: &str) -> &str {
    url.rsplit('/').next().unwrap_or(url)
}

struct Patterns {
    single: Regex,
    split: Regex,
}

impl Patterns {
    fn new(wiki_id: &str, class: DumpClass) -> Result<Self> {
        let prefix = format!(
            "^{}wiki-latest-{}",
            regex::escape(wiki_id),
            regex::escape(class.as_str())
        );
        let suffix = r"\.xml(?:-p[0-9]+-?p[0-9]+)?\.bz2$";
        let build = |pattern: String| {
            Regex::new(&pattern).map_err(|e| DumpError::fetch(wiki_id, format!("bad pattern: {e}")))
        };
        Ok(Self {
            single: build(format!("{prefix}{suffix}"))?,
            split: build(format!("{prefix}[0-9]+{suffix}"))?,
        })
    }
}

pub struct ListingResolver {
    client: reqwest::Client,
    dumps_url: String,
    class: DumpClass,
    timeout: Duration,
}

impl ListingResolver {
    pub fn new(client: reqwest::Client, dumps_url: &str, class: DumpClass, timeout: Duration) -> Self {
        Self {
            client,
            dumps_url: dumps_url.trim_end_matches('/').to_string(),
            class,
            timeout,
        }
    }

    pub fn listing_url(&self, wiki_id: &str) -> String {
        format!("{}/{}wiki/latest/", self.dumps_url, wiki_id)
    }

    /// Fetch the wiki's `latest/` index and pick the dump files for `mode`, sorted by url
    #[tracing::instrument(level = "debug", skip(self))]
    pub async fn resolve(&self, wiki_id: &str, mode: ListingMode) -> Result<Vec<DumpCandidate>> {
        let url = self.listing_url(wiki_id);
        let html = fetch_text(&self.client, &url, self.timeout).await?;
        self.select(wiki_id, &url, &html, mode)
    }

    pub fn select(
        &self,
        wiki_id: &str,
        listing_url: &str,
        html: &str,
        mode: ListingMode,
    ) -> Result<Vec<DumpCandidate>> {
        let base = Url::parse(listing_url).map_err(|e| DumpError::fetch(listing_url, e))?;
        let patterns = Patterns::new(wiki_id, self.class)?;

        let mut single = BTreeSet::new();
        let mut split = BTreeSet::new();
        for href in parse_hrefs(html) {
            let name = remote_name(href.trim_end_matches('/'));
            let target = if patterns.split.is_match(name) {
                &mut split
            } else if patterns.single.is_match(name) {
                &mut single
            } else {
                continue;
            };
            match base.join(&href) {
                Ok(url) => {
                    target.insert(url.to_string());
                }
                Err(e) => tracing::warn!(href, error = %e, "Skipping unusable link"),
            }
        }

        tracing::debug!(
            wiki = wiki_id,
            single = single.len(),
            split = split.len(),
            "Dump links found"
        );

        let chosen = match mode {
            ListingMode::Split => split,
            ListingMode::Auto if !split.is_empty() => split,
            ListingMode::Auto => single,
            ListingMode::Single => drop_ranged_duplicates(single),
        };

        Ok(disambiguate(chosen.into_iter().map(DumpCandidate::new).collect()))
    }
}

/// Every href in the page, in document order
fn parse_hrefs(html: &str) -> Vec<String> {
    let document = Html::parse_document(html);
    let selector = Selector::parse("a[href]").expect("static selector");
    document
        .select(&selector)
        .filter_map(|element| element.value().attr("href"))
        .filter(|href| !href.is_empty())
        .map(str::to_string)
        .collect()
}

/// When the monolithic file is also published with a page range, keep only the plain one
fn drop_ranged_duplicates(urls: BTreeSet<String>) -> BTreeSet<String> {
    let plain: BTreeSet<String> = urls
        .iter()
        .map(|url| remote_name(url))
        .filter(|name| !has_page_range(name))
        .map(str::to_string)
        .collect();

    urls.into_iter()
        .filter(|url| {
            let name = remote_name(url);
            !(has_page_range(name) && plain.contains(&canonical_filename(name)))
        })
        .collect()
}

/// Parts that would collapse onto the same local file keep their remote names
fn disambiguate(candidates: Vec<DumpCandidate>) -> Vec<DumpCandidate> {
    let mut seen: BTreeMap<String, usize> = BTreeMap::new();
    for candidate in &candidates {
        *seen.entry(candidate.filename.clone()).or_default() += 1;
    }

    candidates
        .into_iter()
        .map(|candidate| {
            if seen.get(&candidate.filename).copied().unwrap_or_default() > 1 {
                tracing::debug!(url = %candidate.url, "Local name collision, keeping remote name");
                candidate.keep_remote_name()
            } else {
                candidate
            }
        })
        .collect()
}
