use std::path::Path;

use anyhow::Context as _;
use calamine::Reader as _;

/// Extensions read as workbooks; anything else is parsed as CSV.
const SPREADSHEET_EXTENSIONS: [&str; 5] = ["xlsx", "xlsm", "xlsb", "xls", "ods"];

/// Header row plus data rows, every cell as text.
struct Table {
    headers: Vec<String>,
    rows: Vec<Vec<String>>,
}

/// Reads the identifier column of the input, in file order. Workbooks use
/// their first sheet; other files are CSV with a header row. Blank cells are
/// skipped; a missing column is an error.
pub fn load_identifiers(path: &Path, column: &str) -> anyhow::Result<Vec<String>> {
    let table = if is_spreadsheet(path) {
        read_sheet(path)?
    } else {
        read_csv(path)?
    };

    let Some(index) = table
        .headers
        .iter()
        .position(|header| header.trim() == column)
    else {
        anyhow::bail!(
            "input {} must contain column '{column}' (found: {})",
            path.display(),
            table.headers.join(", ")
        );
    };

    Ok(table
        .rows
        .iter()
        .filter_map(|row| row.get(index).map(|value| value.trim()))
        .filter(|value| !value.is_empty())
        .map(str::to_owned)
        .collect())
}

fn is_spreadsheet(path: &Path) -> bool {
    path.extension()
        .and_then(|ext| ext.to_str())
        .is_some_and(|ext| {
            SPREADSHEET_EXTENSIONS
                .iter()
                .any(|known| ext.eq_ignore_ascii_case(known))
        })
}

fn read_sheet(path: &Path) -> anyhow::Result<Table> {
    let mut workbook = calamine::open_workbook_auto(path)
        .with_context(|| format!("open input: {}", path.display()))?;
    let range = workbook
        .worksheet_range_at(0)
        .ok_or_else(|| anyhow::anyhow!("input {} has no worksheet", path.display()))?
        .with_context(|| format!("read first worksheet: {}", path.display()))?;

    let mut rows = range
        .rows()
        .map(|row| row.iter().map(|cell| cell.to_string()).collect::<Vec<_>>());
    let headers = rows.next().unwrap_or_default();
    Ok(Table {
        headers,
        rows: rows.collect(),
    })
}

fn read_csv(path: &Path) -> anyhow::Result<Table> {
    let mut reader = csv::ReaderBuilder::new()
        .flexible(true)
        .from_path(path)
        .with_context(|| format!("open input: {}", path.display()))?;

    let headers = reader
        .headers()
        .with_context(|| format!("read input header: {}", path.display()))?
        .iter()
        .map(str::to_owned)
        .collect();

    let mut rows = Vec::new();
    for (line, record) in reader.records().enumerate() {
        let record = record.with_context(|| format!("read input row {}", line + 2))?;
        rows.push(record.iter().map(str::to_owned).collect());
    }

    Ok(Table { headers, rows })
}
