use std::io::Write as _;
use std::path::{Path, PathBuf};

use anyhow::Context as _;
use rust_xlsxwriter::{Workbook, Worksheet};
use serde::Serialize;

use crate::formats::ResultRow;

pub const CSV_REPORT: &str = "report.csv";
pub const JSONL_REPORT: &str = "report.jsonl";
pub const XLSX_REPORT: &str = "report.xlsx";

/// Flat tabular form of a [`ResultRow`]; list fields are joined with `", "`.
#[derive(Debug, Serialize)]
struct FlatRow<'a> {
    doi: &'a str,
    title: &'a str,
    journal: &'a str,
    year: Option<i32>,
    authors: &'a str,
    publisher: &'a str,
    #[serde(rename = "type")]
    work_type: &'a str,
    crossref_url: &'a str,
    is_oa: Option<bool>,
    oa_license: Option<&'a str>,
    pdf_url: &'a str,
    pdf_temp_path: String,
    pdf_final_path: String,
    match_found: bool,
    matched_strings: String,
    match_pages: String,
}

impl<'a> From<&'a ResultRow> for FlatRow<'a> {
    fn from(row: &'a ResultRow) -> Self {
        Self {
            doi: &row.doi,
            title: &row.title,
            journal: &row.journal,
            year: row.year,
            authors: &row.authors,
            publisher: &row.publisher,
            work_type: &row.work_type,
            crossref_url: &row.crossref_url,
            is_oa: row.is_oa,
            oa_license: row.oa_license.as_deref(),
            pdf_url: &row.pdf_url,
            pdf_temp_path: display_path(row.pdf_temp_path.as_deref()),
            pdf_final_path: display_path(row.pdf_final_path.as_deref()),
            match_found: row.match_found,
            matched_strings: row.matched_strings.join(", "),
            match_pages: row
                .match_pages
                .iter()
                .map(u32::to_string)
                .collect::<Vec<_>>()
                .join(", "),
        }
    }
}

impl FlatRow<'_> {
    /// Writes the row into `line` of the sheet. Empty values stay blank cells.
    fn write_to(&self, sheet: &mut Worksheet, line: u32) -> anyhow::Result<()> {
        let text = [
            (0, self.doi),
            (1, self.title),
            (2, self.journal),
            (4, self.authors),
            (5, self.publisher),
            (6, self.work_type),
            (7, self.crossref_url),
            (9, self.oa_license.unwrap_or_default()),
            (10, self.pdf_url),
            (11, self.pdf_temp_path.as_str()),
            (12, self.pdf_final_path.as_str()),
            (14, self.matched_strings.as_str()),
            (15, self.match_pages.as_str()),
        ];
        for (col, value) in text {
            if !value.is_empty() {
                sheet.write_string(line, col, value)?;
            }
        }
        if let Some(year) = self.year {
            sheet.write_number(line, 3, f64::from(year))?;
        }
        if let Some(is_oa) = self.is_oa {
            sheet.write_boolean(line, 8, is_oa)?;
        }
        sheet.write_boolean(line, 13, self.match_found)?;
        Ok(())
    }
}

fn display_path(path: Option<&Path>) -> String {
    path.map(|p| p.to_string_lossy().to_string())
        .unwrap_or_default()
}

/// Regenerates `report.xlsx`, `report.csv` and `report.jsonl` under `out_dir`
/// from scratch.
pub fn write_reports(out_dir: &Path, rows: &[ResultRow]) -> anyhow::Result<Vec<PathBuf>> {
    let xlsx_path = out_dir.join(XLSX_REPORT);
    let csv_path = out_dir.join(CSV_REPORT);
    let jsonl_path = out_dir.join(JSONL_REPORT);
    write_xlsx(&xlsx_path, rows).context("write xlsx report")?;
    write_csv(&csv_path, rows).context("write csv report")?;
    write_jsonl(&jsonl_path, rows).context("write jsonl report")?;
    Ok(vec![xlsx_path, csv_path, jsonl_path])
}

pub fn write_xlsx(path: &Path, rows: &[ResultRow]) -> anyhow::Result<()> {
    let mut workbook = Workbook::new();
    let sheet = workbook.add_worksheet();
    for (col, name) in (0u16..).zip(COLUMNS) {
        sheet.write_string(0, col, name)?;
    }
    for (line, row) in (1u32..).zip(rows) {
        FlatRow::from(row)
            .write_to(sheet, line)
            .with_context(|| format!("write report row: {}", row.doi))?;
    }

    let bytes = workbook.save_to_buffer().context("encode xlsx report")?;
    replace_file(path, |file| {
        file.write_all(&bytes).context("write xlsx bytes")?;
        file.flush().context("flush xlsx report")?;
        Ok(())
    })
}

pub fn write_csv(path: &Path, rows: &[ResultRow]) -> anyhow::Result<()> {
    replace_file(path, |file| {
        let mut writer = csv::Writer::from_writer(file);
        if rows.is_empty() {
            // `serialize` emits the header with the first record only.
            writer
                .write_record(COLUMNS)
                .context("write csv header")?;
        }
        for row in rows {
            writer
                .serialize(FlatRow::from(row))
                .with_context(|| format!("serialize report row: {}", row.doi))?;
        }
        writer.flush().context("flush csv report")?;
        Ok(())
    })
}

pub fn write_jsonl(path: &Path, rows: &[ResultRow]) -> anyhow::Result<()> {
    replace_file(path, |file| {
        for row in rows {
            serde_json::to_writer(&mut *file, row)
                .with_context(|| format!("serialize report row: {}", row.doi))?;
            file.write_all(b"\n").context("write report newline")?;
        }
        file.flush().context("flush jsonl report")?;
        Ok(())
    })
}

const COLUMNS: [&str; 16] = [
    "doi",
    "title",
    "journal",
    "year",
    "authors",
    "publisher",
    "type",
    "crossref_url",
    "is_oa",
    "oa_license",
    "pdf_url",
    "pdf_temp_path",
    "pdf_final_path",
    "match_found",
    "matched_strings",
    "match_pages",
];

/// Writes through a temporary sibling so readers never see half a report.
fn replace_file<F>(path: &Path, write: F) -> anyhow::Result<()>
where
    F: FnOnce(&mut std::fs::File) -> anyhow::Result<()>,
{
    let parent = path
        .parent()
        .ok_or_else(|| anyhow::anyhow!("report path must have parent: {}", path.display()))?;
    std::fs::create_dir_all(parent)
        .with_context(|| format!("create report dir: {}", parent.display()))?;

    let mut tmp = tempfile::NamedTempFile::new_in(parent)
        .with_context(|| format!("create temp report in {}", parent.display()))?;
    write(tmp.as_file_mut())?;
    tmp.persist(path)
        .map_err(|err| err.error)
        .with_context(|| format!("replace report: {}", path.display()))?;
    Ok(())
}
