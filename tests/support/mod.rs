use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::mpsc;
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Duration;

use lopdf::content::{Content, Operation};
use lopdf::{Document, Object, Stream, dictionary};

/// One identifier known to the stub services.
#[derive(Debug, Clone)]
pub struct Paper {
    pub doi: &'static str,
    pub title: &'static str,
    /// Body served as the open-access PDF; `None` means "not open access".
    pub pdf: Option<Vec<u8>>,
}

#[allow(dead_code)]
#[derive(Debug, Clone, Default)]
pub struct StubOptions {
    /// Answer every metadata request with this status (plus `Retry-After: 0`).
    pub crossref_status: Option<u16>,
    /// Hold every response this long so concurrent requests overlap.
    pub latency: Duration,
    /// Directories whose file count is recorded as each request arrives.
    pub watch: Vec<PathBuf>,
}

/// A request as seen on arrival.
#[allow(dead_code)]
#[derive(Debug, Clone)]
pub struct Arrival {
    pub path: String,
    /// Files present in the watched directories at that moment.
    pub watched_files: usize,
}

#[derive(Debug, Default)]
pub struct Hits {
    pub works: AtomicUsize,
    pub oa: AtomicUsize,
    pub pdf: AtomicUsize,
    pub in_flight: AtomicUsize,
    pub max_in_flight: AtomicUsize,
    pub arrivals: Mutex<Vec<Arrival>>,
}

/// Crossref, Unpaywall and PDF host on one local port. Each request is
/// answered on its own thread.
pub struct ServiceStub {
    pub base_url: String,
    pub hits: Arc<Hits>,
    shutdown_tx: Option<mpsc::Sender<()>>,
    handle: Option<thread::JoinHandle<()>>,
}

struct Routes {
    base_url: String,
    by_doi: HashMap<String, (usize, Paper)>,
    pdf_by_index: HashMap<String, Vec<u8>>,
    options: StubOptions,
    hits: Arc<Hits>,
}

#[allow(dead_code)]
impl ServiceStub {
    pub fn spawn(papers: Vec<Paper>) -> Self {
        Self::spawn_with(papers, StubOptions::default())
    }

    pub fn spawn_with(papers: Vec<Paper>, options: StubOptions) -> Self {
        let server = tiny_http::Server::http("127.0.0.1:0").expect("start service stub");
        let base_url = format!("http://{}", server.server_addr());
        let hits = Arc::new(Hits::default());
        let (shutdown_tx, shutdown_rx) = mpsc::channel::<()>();

        let by_doi: HashMap<String, (usize, Paper)> = papers
            .into_iter()
            .enumerate()
            .map(|(index, paper)| (paper.doi.to_owned(), (index, paper)))
            .collect();
        let pdf_by_index: HashMap<String, Vec<u8>> = by_doi
            .values()
            .filter_map(|(index, paper)| Some((index.to_string(), paper.pdf.clone()?)))
            .collect();
        let routes = Arc::new(Routes {
            base_url: base_url.clone(),
            by_doi,
            pdf_by_index,
            options,
            hits: Arc::clone(&hits),
        });

        let handle = thread::spawn(move || {
            loop {
                if shutdown_rx.try_recv().is_ok() {
                    break;
                }

                let request = match server.recv_timeout(Duration::from_millis(50)) {
                    Ok(Some(req)) => req,
                    Ok(None) => continue,
                    Err(_) => break,
                };

                let routes = Arc::clone(&routes);
                thread::spawn(move || routes.handle(request));
            }
        });

        Self {
            base_url,
            hits,
            shutdown_tx: Some(shutdown_tx),
            handle: Some(handle),
        }
    }

    pub fn works_hits(&self) -> usize {
        self.hits.works.load(Ordering::SeqCst)
    }

    pub fn oa_hits(&self) -> usize {
        self.hits.oa.load(Ordering::SeqCst)
    }

    pub fn pdf_hits(&self) -> usize {
        self.hits.pdf.load(Ordering::SeqCst)
    }

    pub fn max_in_flight(&self) -> usize {
        self.hits.max_in_flight.load(Ordering::SeqCst)
    }

    pub fn arrivals(&self) -> Vec<Arrival> {
        self.hits.arrivals.lock().expect("arrivals lock").clone()
    }
}

impl Drop for ServiceStub {
    fn drop(&mut self) {
        if let Some(tx) = self.shutdown_tx.take() {
            let _ = tx.send(());
        }
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}

impl Routes {
    fn handle(&self, request: tiny_http::Request) {
        let url = request.url().to_string();
        let (path, query) = url.split_once('?').unwrap_or((url.as_str(), ""));

        let watched_files = self
            .options
            .watch
            .iter()
            .map(|dir| std::fs::read_dir(dir).map(|entries| entries.count()).unwrap_or(0))
            .sum();
        self.hits
            .arrivals
            .lock()
            .expect("arrivals lock")
            .push(Arrival {
                path: path.to_owned(),
                watched_files,
            });

        let now = self.hits.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.hits.max_in_flight.fetch_max(now, Ordering::SeqCst);
        if !self.options.latency.is_zero() {
            thread::sleep(self.options.latency);
        }
        let response = self.respond(path, query);
        self.hits.in_flight.fetch_sub(1, Ordering::SeqCst);

        let _ = request.respond(response);
    }

    fn respond(&self, path: &str, query: &str) -> tiny_http::Response<std::io::Cursor<Vec<u8>>> {
        if let Some(doi) = path.strip_prefix("/works/") {
            self.hits.works.fetch_add(1, Ordering::SeqCst);
            match (self.options.crossref_status, self.by_doi.get(doi)) {
                (Some(status), _) => text(status, "unavailable").with_header(
                    tiny_http::Header::from_bytes(&b"Retry-After"[..], &b"0"[..])
                        .expect("build header"),
                ),
                (None, Some((_, paper))) => json(
                    200,
                    serde_json::json!({
                        "status": "ok",
                        "message": {
                            "title": [paper.title],
                            "container-title": ["Stub Journal"],
                            "issued": { "date-parts": [[2020, 5]] },
                            "author": [{ "given": "Ada", "family": "Lovelace" }],
                            "publisher": "Stub Press",
                            "type": "journal-article",
                            "URL": format!("https://doi.org/{doi}"),
                        }
                    }),
                ),
                (None, None) => text(404, "Resource not found."),
            }
        } else if let Some(doi) = path.strip_prefix("/v2/") {
            self.hits.oa.fetch_add(1, Ordering::SeqCst);
            if !query.starts_with("email=") {
                return text(422, "email required");
            }
            match self.by_doi.get(doi) {
                Some((index, paper)) if paper.pdf.is_some() => json(
                    200,
                    serde_json::json!({
                        "doi": doi,
                        "is_oa": true,
                        "best_oa_location": {
                            "url_for_pdf": format!("{}/pdf/{index}", self.base_url),
                            "license": "cc-by",
                        },
                        "oa_locations": [],
                    }),
                ),
                Some(_) => json(
                    200,
                    serde_json::json!({
                        "doi": doi,
                        "is_oa": false,
                        "best_oa_location": null,
                        "oa_locations": [],
                    }),
                ),
                None => text(404, "not found"),
            }
        } else if let Some(key) = path.strip_prefix("/pdf/") {
            self.hits.pdf.fetch_add(1, Ordering::SeqCst);
            match self.pdf_by_index.get(key) {
                Some(bytes) => tiny_http::Response::from_data(bytes.clone()),
                None => text(404, "no such pdf"),
            }
        } else {
            text(404, "not found")
        }
    }
}

fn text(status: u16, body: &str) -> tiny_http::Response<std::io::Cursor<Vec<u8>>> {
    tiny_http::Response::from_string(body).with_status_code(status)
}

fn json(status: u16, body: serde_json::Value) -> tiny_http::Response<std::io::Cursor<Vec<u8>>> {
    let header = tiny_http::Header::from_bytes(&b"Content-Type"[..], &b"application/json"[..])
        .expect("build header");
    tiny_http::Response::from_string(body.to_string())
        .with_status_code(status)
        .with_header(header)
}

/// A one-page-per-entry PDF whose pages show the given text.
#[allow(dead_code)]
pub fn pdf_bytes(pages: &[&str]) -> Vec<u8> {
    let mut doc = Document::with_version("1.5");
    let pages_id = doc.new_object_id();
    let font_id = doc.add_object(dictionary! {
        "Type" => "Font",
        "Subtype" => "Type1",
        "BaseFont" => "Courier",
        "Encoding" => "WinAnsiEncoding",
    });
    let resources_id = doc.add_object(dictionary! {
        "Font" => dictionary! { "F1" => font_id },
    });

    let mut kids: Vec<Object> = Vec::new();
    for text in pages {
        let content = Content {
            operations: vec![
                Operation::new("BT", vec![]),
                Operation::new("Tf", vec!["F1".into(), 24.into()]),
                Operation::new("Td", vec![72.into(), 700.into()]),
                Operation::new("Tj", vec![Object::string_literal(*text)]),
                Operation::new("ET", vec![]),
            ],
        };
        let content_id = doc.add_object(Stream::new(
            dictionary! {},
            content.encode().expect("encode page content"),
        ));
        let page_id = doc.add_object(dictionary! {
            "Type" => "Page",
            "Parent" => pages_id,
            "Contents" => content_id,
            "Resources" => resources_id,
            "MediaBox" => vec![0.into(), 0.into(), 612.into(), 792.into()],
        });
        kids.push(page_id.into());
    }

    let count = kids.len() as i64;
    doc.objects.insert(
        pages_id,
        Object::Dictionary(dictionary! {
            "Type" => "Pages",
            "Kids" => kids,
            "Count" => count,
        }),
    );
    let catalog_id = doc.add_object(dictionary! {
        "Type" => "Catalog",
        "Pages" => pages_id,
    });
    doc.trailer.set("Root", catalog_id);

    let mut bytes = Vec::new();
    doc.save_to(&mut bytes).expect("serialize test pdf");
    bytes
}

#[allow(dead_code)]
pub fn write_pdf(path: &Path, pages: &[&str]) {
    std::fs::write(path, pdf_bytes(pages)).expect("write test pdf");
}

/// Writes a one-column identifier workbook.
#[allow(dead_code)]
pub fn write_input_xlsx(path: &Path, column: &str, dois: &[&str]) {
    let mut workbook = rust_xlsxwriter::Workbook::new();
    let sheet = workbook.add_worksheet();
    sheet.write_string(0, 0, column).expect("write header");
    for (row, doi) in (1u32..).zip(dois) {
        sheet.write_string(row, 0, *doi).expect("write identifier");
    }
    workbook.save(path).expect("save input workbook");
}

/// Writes a one-column identifier CSV.
#[allow(dead_code)]
pub fn write_input(path: &Path, column: &str, dois: &[&str]) {
    let mut contents = format!("{column}\n");
    for doi in dois {
        contents.push_str(doi);
        contents.push('\n');
    }
    std::fs::write(path, contents).expect("write input csv");
}
