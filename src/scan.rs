use std::num::NonZeroUsize;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::Context as _;
use tokio::sync::Semaphore;

use crate::cli::ScanArgs;
use crate::formats::MatchOutcome;

pub fn run(args: ScanArgs) -> anyhow::Result<()> {
    if !args.pdf.is_file() {
        tracing::warn!(path = %args.pdf.display(), "pdf not found; reporting no match");
    }
    let outcome = search_pdf(&args.pdf, &args.needles);
    let json = serde_json::to_string(&outcome).context("serialize scan outcome")?;
    println!("{json}");
    Ok(())
}

/// Case-sensitive search of every page of the PDF at `path` for `needles`.
///
/// A missing or unreadable file is "no match". Empty needles are ignored.
pub fn search_pdf(path: &Path, needles: &[String]) -> MatchOutcome {
    if !path.exists() {
        return MatchOutcome::default();
    }

    let document = match lopdf::Document::load(path) {
        Ok(document) => document,
        Err(err) => {
            tracing::warn!(path = %path.display(), %err, "open pdf failed");
            return MatchOutcome::default();
        }
    };

    let mut matches: Vec<String> = Vec::new();
    let mut pages: Vec<u32> = Vec::new();

    // `get_pages` is keyed by 1-based page number in ascending order.
    for page_number in document.get_pages().keys().copied() {
        let text = match document.extract_text(&[page_number]) {
            Ok(text) => text,
            Err(err) => {
                tracing::debug!(path = %path.display(), page = page_number, %err, "page text extraction failed");
                continue;
            }
        };

        let mut page_hit = false;
        for needle in needles.iter().filter(|needle| !needle.is_empty()) {
            if !text.contains(needle.as_str()) {
                continue;
            }
            page_hit = true;
            if !matches.contains(needle) {
                matches.push(needle.clone());
            }
        }
        if page_hit {
            pages.push(page_number);
        }
    }

    MatchOutcome {
        found: !matches.is_empty(),
        matches,
        pages,
    }
}

/// Runs [`search_pdf`] on the blocking thread pool, at most one scan per
/// available core at a time.
#[derive(Debug, Clone)]
pub struct Scanner {
    needles: Arc<[String]>,
    workers: Arc<Semaphore>,
}

impl Scanner {
    pub fn new(needles: Vec<String>) -> Self {
        let workers = std::thread::available_parallelism()
            .map(NonZeroUsize::get)
            .unwrap_or(1);
        Self::with_workers(needles, workers)
    }

    pub fn with_workers(needles: Vec<String>, workers: usize) -> Self {
        Self {
            needles: needles.into(),
            workers: Arc::new(Semaphore::new(workers.max(1))),
        }
    }

    pub async fn scan(&self, path: PathBuf) -> MatchOutcome {
        let _permit = match self.workers.acquire().await {
            Ok(permit) => permit,
            Err(err) => {
                tracing::error!(%err, "scan worker pool closed");
                return MatchOutcome::default();
            }
        };

        let needles = Arc::clone(&self.needles);
        let shown = path.display().to_string();
        match tokio::task::spawn_blocking(move || search_pdf(&path, &needles)).await {
            Ok(outcome) => outcome,
            Err(err) => {
                tracing::error!(path = %shown, %err, "pdf scan task failed");
                MatchOutcome::default()
            }
        }
    }
}


#[cfg(test)]
mod tests {
    use super::*;

    fn needles(values: &[&str]) -> Vec<String> {
        values.iter().map(|v| (*v).to_owned()).collect()
    }

    #[test]
    fn finds_needle_on_first_page() {
        let dir = tempfile::tempdir().unwrap();
        let pdf = dir.path().join("one.pdf");
        test_pdf::write(&pdf, &["An Example document"]);

        let outcome = search_pdf(&pdf, &needles(&["Example"]));
        assert_eq!(
            outcome,
            MatchOutcome {
                found: true,
                matches: vec!["Example".to_owned()],
                pages: vec![1],
            }
        );
    }

    #[test]
    fn records_matches_in_first_seen_order_and_pages_ascending() {
        let dir = tempfile::tempdir().unwrap();
        let pdf = dir.path().join("three.pdf");
        test_pdf::write(&pdf, &["nothing here", "beta and alpha", "alpha again"]);

        let outcome = search_pdf(&pdf, &needles(&["alpha", "beta", "gamma"]));
        assert!(outcome.found);
        assert_eq!(outcome.matches, vec!["alpha", "beta"]);
        assert_eq!(outcome.pages, vec![2, 3]);
    }

    #[test]
    fn search_is_case_sensitive() {
        let dir = tempfile::tempdir().unwrap();
        let pdf = dir.path().join("case.pdf");
        test_pdf::write(&pdf, &["Example"]);

        let outcome = search_pdf(&pdf, &needles(&["example", ""]));
        assert_eq!(outcome, MatchOutcome::default());
    }

    #[test]
    fn missing_or_broken_file_is_no_match() {
        let dir = tempfile::tempdir().unwrap();
        let outcome = search_pdf(&dir.path().join("missing.pdf"), &needles(&["x"]));
        assert_eq!(outcome, MatchOutcome::default());

        let broken = dir.path().join("broken.pdf");
        std::fs::write(&broken, b"%PDF-1.4 truncated").unwrap();
        let outcome = search_pdf(&broken, &needles(&["x"]));
        assert_eq!(outcome, MatchOutcome::default());
    }

    #[tokio::test]
    async fn scanner_runs_off_the_async_threads() {
        let dir = tempfile::tempdir().unwrap();
        let pdf = dir.path().join("scan.pdf");
        test_pdf::write(&pdf, &["needle in a haystack"]);

        let scanner = Scanner::with_workers(needles(&["needle"]), 2);
        let outcome = scanner.scan(pdf).await;
        assert!(outcome.found);
        assert_eq!(outcome.pages, vec![1]);
    }
}
