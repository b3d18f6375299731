//! Batch orchestration.
//!
//! Identifiers are processed in fixed-size batches, one batch at a time. Each
//! batch runs two stages:
//!
//! 1. prepare: metadata, OA status and PDF download for every identifier,
//!    concurrently up to the configured limit, into the staging directory;
//! 2. process: scan the staged PDFs on the blocking pool and move each one
//!    into the found or not-found directory. No network traffic.
//!
//! Stage 2 starts only after every Stage 1 task of the batch has finished, and
//! the next batch starts only after Stage 2 is done, so no two tasks ever touch
//! the same staged file.

use std::collections::HashSet;
use std::fmt;
use std::path::{Path, PathBuf};

use anyhow::Context as _;
use futures::future::join_all;
use reqwest::Client;
use tokio::sync::{Semaphore, SemaphorePermit};
use tokio_util::sync::CancellationToken;

use crate::cache::{Cache, Namespace, sanitize_filename};
use crate::cli::RunArgs;
use crate::config::Config;
use crate::download::{download_pdf, has_pdf_magic};
use crate::formats::{CrossrefWork, MatchOutcome, ResultRow, UnpaywallRecord};
use crate::http::{BackoffPolicy, build_client};
use crate::metadata::{fetch_metadata, fetch_oa_status, select_pdf_url};
use crate::scan::Scanner;

/// Directories under the output directory.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Layout {
    pub root: PathBuf,
    pub downloads: PathBuf,
    pub found: PathBuf,
    pub notfound: PathBuf,
    pub logs: PathBuf,
}

impl Layout {
    pub fn new(config: &Config) -> Self {
        let root = config.output_dir.clone();
        Self {
            downloads: root.join(&config.folders.downloads),
            found: root.join(&config.folders.found),
            notfound: root.join(&config.folders.notfound),
            logs: root.join("logs"),
            root,
        }
    }

    pub fn ensure(&self) -> anyhow::Result<()> {
        let cache_dirs = Namespace::ALL
            .iter()
            .map(|namespace| self.root.join("cache").join(namespace.as_str()));
        for dir in [&self.downloads, &self.found, &self.notfound]
            .into_iter()
            .cloned()
            .chain(cache_dirs)
        {
            std::fs::create_dir_all(&dir)
                .with_context(|| format!("create output dir: {}", dir.display()))?;
        }
        Ok(())
    }

    /// One staging path per identifier, in input order. Identifiers that
    /// sanitize to the same name get `_1`, `_2`, ... so no two rows of a run
    /// share a staged file. Names depend only on input order, so reruns over
    /// the same input pick the same names.
    pub fn staged_pdfs(&self, identifiers: &[String]) -> Vec<PathBuf> {
        let mut taken: HashSet<String> = HashSet::with_capacity(identifiers.len());
        identifiers
            .iter()
            .map(|doi| {
                let stem = sanitize_filename(doi);
                let mut name = format!("{stem}.pdf");
                let mut suffix = 1usize;
                while !taken.insert(name.clone()) {
                    name = format!("{stem}_{suffix}.pdf");
                    suffix += 1;
                }
                self.downloads.join(name)
            })
            .collect()
    }

    /// The file an earlier run already routed under the staged file's name.
    pub fn routed_pdf(&self, staged: &Path) -> Option<PathBuf> {
        let name = staged.file_name()?;
        [&self.found, &self.notfound]
            .into_iter()
            .map(|dir| dir.join(name))
            .find(|path| path.is_file())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BatchState {
    Preparing,
    Processing,
    Done,
}

impl fmt::Display for BatchState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Preparing => "preparing",
            Self::Processing => "processing",
            Self::Done => "done",
        })
    }
}

/// Where Stage 1 left the PDF for one identifier.
#[derive(Debug, Clone, PartialEq, Eq)]
enum PdfLocation {
    Staged(PathBuf),
    AlreadyRouted(PathBuf),
    Missing,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RunSummary {
    pub identifiers: usize,
    pub with_pdf: usize,
    pub matched: usize,
}

impl RunSummary {
    pub fn from_rows(rows: &[ResultRow]) -> Self {
        Self {
            identifiers: rows.len(),
            with_pdf: rows
                .iter()
                .filter(|row| row.pdf_final_path.is_some() || row.pdf_temp_path.is_some())
                .count(),
            matched: rows.iter().filter(|row| row.match_found).count(),
        }
    }
}

/// Owns the two HTTP sessions, the cache and the scan pool for one run.
pub struct Harvester {
    config: Config,
    layout: Layout,
    cache: Cache,
    api: Client,
    pdf: Client,
    backoff: BackoffPolicy,
    scanner: Scanner,
}

impl Harvester {
    pub fn new(config: Config) -> anyhow::Result<Self> {
        let layout = Layout::new(&config);
        let cache = Cache::new(layout.root.clone(), config.cache);
        let api = build_client(&config).context("build metadata client")?;
        let pdf = build_client(&config).context("build pdf client")?;
        let scanner = Scanner::new(config.strings.clone());
        Ok(Self {
            config,
            layout,
            cache,
            api,
            pdf,
            backoff: BackoffPolicy::default(),
            scanner,
        })
    }

    pub fn with_backoff(mut self, backoff: BackoffPolicy) -> Self {
        self.backoff = backoff;
        self
    }

    pub fn layout(&self) -> &Layout {
        &self.layout
    }

    /// Runs every batch in order and writes the final report. Cancellation is
    /// honoured between batches only.
    pub async fn run(
        &self,
        identifiers: &[String],
        cancel: &CancellationToken,
    ) -> anyhow::Result<Vec<ResultRow>> {
        self.layout.ensure()?;

        let batch_size = self.config.batch_size();
        let total_batches = identifiers.len().div_ceil(batch_size);
        let staged = self.layout.staged_pdfs(identifiers);
        let mut all_rows: Vec<ResultRow> = Vec::with_capacity(identifiers.len());

        let batches = identifiers.chunks(batch_size).zip(staged.chunks(batch_size));
        for (index, (chunk, staged_chunk)) in batches.enumerate() {
            let batch = index + 1;
            if cancel.is_cancelled() {
                tracing::warn!(batch, total_batches, "cancelled; skipping remaining batches");
                break;
            }

            tracing::info!(batch, total_batches, size = chunk.len(), state = %BatchState::Preparing, "batch: prepare + download");
            let rows = self.prepare_batch(chunk, staged_chunk).await;

            tracing::info!(batch, total_batches, state = %BatchState::Processing, "batch: scan + route");
            let rows = self.process_batch(rows).await;
            all_rows.extend(rows);

            if self.config.write_after_each_batch {
                match crate::report::write_reports(&self.layout.root, &all_rows) {
                    Ok(_) => tracing::info!(rows = all_rows.len(), "incremental report written"),
                    Err(err) => tracing::warn!(
                        err = format!("{err:#}"),
                        "incremental report failed"
                    ),
                }
            }
            tracing::info!(batch, total_batches, state = %BatchState::Done, "batch finished");
        }

        crate::report::write_reports(&self.layout.root, &all_rows)
            .context("write final report")?;
        let failures = self.cache.write_failures();
        if failures > 0 {
            tracing::warn!(failures, "some cache entries could not be written");
        }
        tracing::info!(
            rows = all_rows.len(),
            out = %self.layout.root.display(),
            "harvest finished"
        );
        Ok(all_rows)
    }

    /// Stage 1 for a whole batch; `staged[i]` is the staging path of
    /// `identifiers[i]`. Rows come back in input order.
    pub async fn prepare_batch(
        &self,
        identifiers: &[String],
        staged: &[PathBuf],
    ) -> Vec<ResultRow> {
        let gate = Semaphore::new(self.config.stage_one_concurrency());
        let tasks = identifiers.iter().zip(staged).map(|(doi, staged)| {
            let gate = &gate;
            async move {
                let Some(_permit) = admit(gate, doi).await else {
                    let (work, oa) = (CrossrefWork::default(), UnpaywallRecord::default());
                    return ResultRow::new(doi, &work, &oa);
                };
                self.prepare_one(doi, staged).await
            }
        });
        join_all(tasks).await
    }

    /// Stage 1 for one identifier. Never fails: anything that goes wrong
    /// leaves the corresponding fields empty.
    pub async fn prepare_one(&self, doi: &str, staged: &Path) -> ResultRow {
        let work = self.load_metadata(doi).await;
        let oa = self.load_oa_status(doi).await;
        let pdf_url = select_pdf_url(&oa);

        let mut row = ResultRow::new(doi, &work, &oa);
        if let Some(url) = pdf_url {
            match self.stage_pdf(&url, staged).await {
                PdfLocation::Staged(path) => row.pdf_temp_path = Some(path),
                PdfLocation::AlreadyRouted(path) => row.pdf_final_path = Some(path),
                PdfLocation::Missing => {}
            }
            row.pdf_url = url;
        }

        tracing::debug!(
            doi,
            is_oa = ?row.is_oa,
            staged = row.pdf_temp_path.is_some(),
            routed = row.pdf_final_path.is_some(),
            "prepared"
        );
        row
    }

    async fn load_metadata(&self, doi: &str) -> CrossrefWork {
        if let Some(work) = self.cache.get(Namespace::Crossref, doi) {
            return work;
        }
        match fetch_metadata(&self.api, &self.backoff, &self.config.api.crossref, doi).await {
            Ok(work) => {
                self.cache.put(Namespace::Crossref, doi, &work);
                work
            }
            Err(err) => {
                tracing::warn!(doi, err = format!("{err:#}"), "metadata fetch failed");
                CrossrefWork::default()
            }
        }
    }

    async fn load_oa_status(&self, doi: &str) -> UnpaywallRecord {
        if let Some(oa) = self.cache.get(Namespace::Unpaywall, doi) {
            return oa;
        }
        match fetch_oa_status(
            &self.api,
            &self.backoff,
            &self.config.api.unpaywall,
            doi,
            &self.config.email,
        )
        .await
        {
            Ok(oa) => {
                self.cache.put(Namespace::Unpaywall, doi, &oa);
                oa
            }
            Err(err) => {
                tracing::warn!(doi, err = format!("{err:#}"), "open-access lookup failed");
                UnpaywallRecord::default()
            }
        }
    }

    async fn stage_pdf(&self, url: &str, staged: &Path) -> PdfLocation {
        let force = self.config.cache.force_refresh;
        if !force && let Some(routed) = self.layout.routed_pdf(staged) {
            return PdfLocation::AlreadyRouted(routed);
        }

        if !force && has_pdf_magic(staged) {
            return PdfLocation::Staged(staged.to_path_buf());
        }
        if download_pdf(&self.pdf, url, staged).await {
            PdfLocation::Staged(staged.to_path_buf())
        } else {
            PdfLocation::Missing
        }
    }

    /// Stage 2 for one batch: match outcomes (cache, else scan) for every row
    /// with a PDF, then routing of the staged ones.
    pub async fn process_batch(&self, mut rows: Vec<ResultRow>) -> Vec<ResultRow> {
        let mut pending: Vec<(usize, PathBuf)> = Vec::new();
        for (index, row) in rows.iter_mut().enumerate() {
            let Some(source) = row
                .pdf_temp_path
                .clone()
                .or_else(|| row.pdf_final_path.clone())
            else {
                continue;
            };
            match self.cache.get::<MatchOutcome>(Namespace::Matches, &row.doi) {
                Some(cached) => row.apply_outcome(&cached),
                None => pending.push((index, source)),
            }
        }

        let outcomes = join_all(
            pending
                .iter()
                .map(|(_, path)| self.scanner.scan(path.clone())),
        )
        .await;
        for ((index, _), outcome) in pending.iter().zip(outcomes) {
            let row = &mut rows[*index];
            row.apply_outcome(&outcome);
            self.cache.put(Namespace::Matches, &row.doi, &outcome);
        }

        for row in &mut rows {
            self.route_row(row);
        }
        rows
    }

    fn route_row(&self, row: &mut ResultRow) {
        let Some(staged) = row.pdf_temp_path.take() else {
            return;
        };
        if !staged.exists() {
            tracing::debug!(doi = %row.doi, path = %staged.display(), "staged pdf already gone; not routing");
            return;
        }

        let dest_dir = if row.match_found {
            &self.layout.found
        } else {
            &self.layout.notfound
        };
        match crate::route::move_atomic(&staged, dest_dir) {
            Ok(final_path) => {
                tracing::debug!(
                    doi = %row.doi,
                    found = row.match_found,
                    path = %final_path.display(),
                    "routed"
                );
                row.pdf_final_path = Some(final_path);
            }
            Err(err) => {
                tracing::warn!(doi = %row.doi, err = format!("{err:#}"), "routing failed; pdf stays staged");
                row.pdf_temp_path = Some(staged);
            }
        }
    }
}

/// Waits for a Stage 1 slot. A closed gate skips the identifier.
async fn admit<'a>(gate: &'a Semaphore, doi: &str) -> Option<SemaphorePermit<'a>> {
    match gate.acquire().await {
        Ok(permit) => Some(permit),
        Err(err) => {
            tracing::error!(doi, %err, "stage one gate closed; skipping identifier");
            None
        }
    }
}

/// `run --config <path>`: loads the config, sets up logging under the output
/// directory, and harvests until done or interrupted.
pub async fn run(args: RunArgs) -> anyhow::Result<RunSummary> {
    let config = Config::load(&args.config)?;
    let layout = Layout::new(&config);
    crate::logging::init(&config.logging, &layout.logs).context("init logging")?;
    tracing::info!(config = %args.config.display(), "starting batched DOI harvest");

    let cancel = CancellationToken::new();
    let on_interrupt = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::warn!("interrupt received; finishing the current batch");
            on_interrupt.cancel();
        }
    });

    let rows = harvest(config, cancel).await?;
    let summary = RunSummary::from_rows(&rows);
    println!(
        "processed {} identifiers: {} pdfs, {} matched (report: {})",
        summary.identifiers,
        summary.with_pdf,
        summary.matched,
        layout.root.join(crate::report::CSV_REPORT).display()
    );
    Ok(summary)
}

/// Loads the identifiers, then harvests them. Input problems abort before the
/// first batch.
pub async fn harvest(config: Config, cancel: CancellationToken) -> anyhow::Result<Vec<ResultRow>> {
    let identifiers = crate::input::load_identifiers(&config.input, &config.doi_column)
        .context("load identifiers")?;
    tracing::info!(count = identifiers.len(), "loaded identifiers");

    let harvester = Harvester::new(config)?;
    harvester.run(&identifiers, &cancel).await
}
