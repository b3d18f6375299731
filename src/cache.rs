//! On-disk JSON cache keyed by (namespace, identifier).
//!
//! The cache only saves work: unreadable entries count as misses and failed
//! writes are logged and dropped.

use std::fmt;
use std::io::Write as _;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};

use anyhow::Context as _;
use serde::Serialize;
use serde::de::DeserializeOwned;

use crate::config::CacheConfig;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Namespace {
    Crossref,
    Unpaywall,
    Matches,
}

impl Namespace {
    pub const ALL: [Namespace; 3] = [Self::Crossref, Self::Unpaywall, Self::Matches];

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Crossref => "crossref",
            Self::Unpaywall => "unpaywall",
            Self::Matches => "matches",
        }
    }
}

impl fmt::Display for Namespace {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Strips a `doi:`/`DOI:` prefix and replaces every character outside
/// `[A-Za-z0-9._-]` with `_`.
pub fn sanitize_filename(identifier: &str) -> String {
    let bare = identifier
        .strip_prefix("doi:")
        .or_else(|| identifier.strip_prefix("DOI:"))
        .unwrap_or(identifier);
    bare.chars()
        .map(|ch| {
            if ch.is_ascii_alphanumeric() || matches!(ch, '.' | '_' | '-') {
                ch
            } else {
                '_'
            }
        })
        .collect()
}

/// `{base}/cache/{namespace}/{sanitized identifier}.json`
pub fn cache_path(base: &Path, namespace: Namespace, identifier: &str) -> PathBuf {
    base.join("cache")
        .join(namespace.as_str())
        .join(format!("{}.json", sanitize_filename(identifier)))
}

/// The parsed entry, or `None` when it is missing or unreadable.
pub fn read_json<T: DeserializeOwned>(path: &Path) -> Option<T> {
    let contents = match std::fs::read_to_string(path) {
        Ok(contents) => contents,
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => return None,
        Err(err) => {
            tracing::debug!(path = %path.display(), %err, "cache read failed");
            return None;
        }
    };
    match serde_json::from_str(&contents) {
        Ok(value) => Some(value),
        Err(err) => {
            tracing::debug!(path = %path.display(), %err, "cache entry does not parse");
            None
        }
    }
}

/// Replaces the whole entry at `path` with indented JSON.
pub fn write_json<T: Serialize>(path: &Path, data: &T) -> anyhow::Result<()> {
    let parent = path
        .parent()
        .ok_or_else(|| anyhow::anyhow!("cache path must have parent: {}", path.display()))?;
    std::fs::create_dir_all(parent)
        .with_context(|| format!("create cache dir: {}", parent.display()))?;

    let json = serde_json::to_vec_pretty(data).context("serialize cache entry")?;
    let mut tmp = tempfile::NamedTempFile::new_in(parent)
        .with_context(|| format!("create temp cache file in {}", parent.display()))?;
    tmp.write_all(&json).context("write cache entry")?;
    tmp.persist(path)
        .map_err(|err| err.error)
        .with_context(|| format!("replace cache entry: {}", path.display()))?;
    Ok(())
}

/// The cache as seen by the pipeline: honours the enabled and force-refresh
/// switches and swallows write failures.
#[derive(Debug)]
pub struct Cache {
    base: PathBuf,
    settings: CacheConfig,
    write_failures: AtomicUsize,
}

impl Cache {
    pub fn new(base: impl Into<PathBuf>, settings: CacheConfig) -> Self {
        Self {
            base: base.into(),
            settings,
            write_failures: AtomicUsize::new(0),
        }
    }

    pub fn path(&self, namespace: Namespace, identifier: &str) -> PathBuf {
        cache_path(&self.base, namespace, identifier)
    }

    /// Lookups are skipped when caching is off or a refresh is forced.
    pub fn get<T: DeserializeOwned>(&self, namespace: Namespace, identifier: &str) -> Option<T> {
        if !self.settings.enabled || self.settings.force_refresh {
            return None;
        }
        read_json(&self.path(namespace, identifier))
    }

    pub fn put<T: Serialize>(&self, namespace: Namespace, identifier: &str, data: &T) {
        if !self.settings.enabled {
            return;
        }
        let path = self.path(namespace, identifier);
        if let Err(err) = write_json(&path, data) {
            self.write_failures.fetch_add(1, Ordering::Relaxed);
            tracing::warn!(
                path = %path.display(),
                err = format!("{err:#}"),
                "cache write failed"
            );
        }
    }

    pub fn write_failures(&self) -> usize {
        self.write_failures.load(Ordering::Relaxed)
    }
}
