//! Tabular file parsing: CSV/TSV via `csv`, spreadsheets via `calamine`.
//!
//! Every data row becomes one line of `header: value | header: value`
//! pairs, so a row stays self-describing after chunking.

use std::io::Cursor;

use calamine::{open_workbook_auto_from_rs, Reader};

use crate::error::AppError;

/// Upper bound on the size of an uploaded file.
pub const MAX_UPLOAD_BYTES: usize = 20 * 1024 * 1024;

/// Supported upload formats.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TabularFormat {
    Csv,
    Tsv,
    /// xlsx, xlsm, xls, ods
    Spreadsheet,
}

impl TabularFormat {
    /// Detect the format from a file name's extension.
    pub fn from_file_name(file_name: &str) -> Result<Self, AppError> {
        let extension = file_name
            .rsplit_once('.')
            .map(|(_, ext)| ext.to_lowercase())
            .unwrap_or_default();
        match extension.as_str() {
            "csv" => Ok(TabularFormat::Csv),
            "tsv" | "tab" => Ok(TabularFormat::Tsv),
            "xlsx" | "xlsm" | "xls" | "ods" => Ok(TabularFormat::Spreadsheet),
            _ => Err(AppError::validation(format!(
                "Unsupported file type for {}. Upload a .csv, .tsv, .xlsx, .xls or .ods file",
                file_name
            ))),
        }
    }
}

/// Flattened text of one table (a CSV file or one worksheet).
#[derive(Debug, Clone, PartialEq)]
pub struct ParsedDocument {
    pub sheet_name: Option<String>,
    pub text: String,
    pub row_count: usize,
}

/// Parse an uploaded file into one document per non-empty table.
pub fn parse_tabular(file_name: &str, bytes: &[u8]) -> Result<Vec<ParsedDocument>, AppError> {
    if bytes.len() > MAX_UPLOAD_BYTES {
        return Err(AppError::validation(format!(
            "File too large: {} bytes (max {})",
            bytes.len(),
            MAX_UPLOAD_BYTES
        )));
    }

    let documents = match TabularFormat::from_file_name(file_name)? {
        TabularFormat::Csv => parse_delimited(bytes, b',')?,
        TabularFormat::Tsv => parse_delimited(bytes, b'\t')?,
        TabularFormat::Spreadsheet => parse_spreadsheet(bytes)?,
    };

    if documents.is_empty() {
        return Err(AppError::validation(format!(
            "No readable rows found in {}",
            file_name
        )));
    }
    Ok(documents)
}

fn parse_delimited(bytes: &[u8], delimiter: u8) -> Result<Vec<ParsedDocument>, AppError> {
    // Excel exports often start with a UTF-8 BOM
    let bytes = bytes.strip_prefix(b"\xEF\xBB\xBF").unwrap_or(bytes);

    let mut reader = csv::ReaderBuilder::new()
        .delimiter(delimiter)
        .has_headers(true)
        .flexible(true)
        .from_reader(bytes);

    let headers: Vec<String> = reader
        .headers()
        .map_err(|e| AppError::validation(format!("Failed to read header row: {}", e)))?
        .iter()
        .map(str::to_string)
        .collect();

    let mut rows = Vec::new();
    for (line, record) in reader.records().enumerate() {
        let record = record.map_err(|e| {
            AppError::validation(format!("Malformed row {}: {}", line + 2, e))
        })?;
        rows.push(record.iter().map(str::to_string).collect::<Vec<_>>());
    }

    Ok(flatten_table(None, &headers, rows).into_iter().collect())
}

fn parse_spreadsheet(bytes: &[u8]) -> Result<Vec<ParsedDocument>, AppError> {
    let mut workbook = open_workbook_auto_from_rs(Cursor::new(bytes.to_vec()))
        .map_err(|e| AppError::validation(format!("Failed to open spreadsheet: {}", e)))?;

    let sheet_names: Vec<String> = workbook.sheet_names().to_vec();
    let mut documents = Vec::new();

    for sheet_name in sheet_names {
        let range = match workbook.worksheet_range(&sheet_name) {
            Ok(range) => range,
            Err(e) => {
                tracing::warn!("Skipping unreadable sheet {}: {}", sheet_name, e);
                continue;
            }
        };

        let mut rows = range
            .rows()
            .map(|row| row.iter().map(|cell| cell.to_string()).collect::<Vec<_>>());
        let Some(headers) = rows.next() else {
            continue;
        };
        if let Some(document) = flatten_table(Some(sheet_name), &headers, rows) {
            documents.push(document);
        }
    }

    Ok(documents)
}

/// Render rows as `header: value` lines. `None` when no row has content.
fn flatten_table(
    sheet_name: Option<String>,
    headers: &[String],
    rows: impl IntoIterator<Item = Vec<String>>,
) -> Option<ParsedDocument> {
    let headers: Vec<String> = headers
        .iter()
        .enumerate()
        .map(|(i, h)| {
            let h = sanitize_cell(h);
            if h.is_empty() {
                format!("column {}", i + 1)
            } else {
                h
            }
        })
        .collect();

    let mut lines = Vec::new();
    for row in rows {
        let pairs: Vec<String> = row
            .iter()
            .enumerate()
            .filter_map(|(i, value)| {
                let value = sanitize_cell(value);
                if value.is_empty() {
                    return None;
                }
                let header = headers
                    .get(i)
                    .cloned()
                    .unwrap_or_else(|| format!("column {}", i + 1));
                Some(format!("{}: {}", header, value))
            })
            .collect();
        if !pairs.is_empty() {
            lines.push(pairs.join(" | "));
        }
    }

    if lines.is_empty() {
        return None;
    }
    Some(ParsedDocument {
        sheet_name,
        row_count: lines.len(),
        text: lines.join("\n"),
    })
}

/// Drop control characters and collapse internal whitespace.
pub fn sanitize_cell(value: &str) -> String {
    value
        .chars()
        .map(|c| if c.is_control() { ' ' } else { c })
        .collect::<String>()
        .split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn format_detection_is_case_insensitive() {
        assert_eq!(
            TabularFormat::from_file_name("Sales.CSV").unwrap(),
            TabularFormat::Csv
        );
        assert_eq!(
            TabularFormat::from_file_name("q3.tsv").unwrap(),
            TabularFormat::Tsv
        );
        assert_eq!(
            TabularFormat::from_file_name("book.xlsx").unwrap(),
            TabularFormat::Spreadsheet
        );
        let err = TabularFormat::from_file_name("notes.pdf").unwrap_err();
        assert_eq!(err.code(), "validation_error");
        assert!(TabularFormat::from_file_name("no_extension").is_err());
    }

    #[test]
    fn csv_rows_become_labelled_lines() {
        let csv = "name,city,score\nAnn,Oslo,9\nBo,,7\n";
        let docs = parse_tabular("people.csv", csv.as_bytes()).unwrap();
        assert_eq!(docs.len(), 1);
        assert_eq!(docs[0].sheet_name, None);
        assert_eq!(docs[0].row_count, 2);
        assert_eq!(
            docs[0].text,
            "name: Ann | city: Oslo | score: 9\nname: Bo | score: 7"
        );
    }

    #[test]
    fn tsv_uses_tabs_and_strips_bom() {
        let tsv = "\u{feff}item\tqty\nbolts\t40\n";
        let docs = parse_tabular("stock.tsv", tsv.as_bytes()).unwrap();
        assert_eq!(docs[0].text, "item: bolts | qty: 40");
    }

    #[test]
    fn ragged_rows_get_positional_headers() {
        let csv = "a,\n1,2,3\n";
        let docs = parse_tabular("r.csv", csv.as_bytes()).unwrap();
        assert_eq!(docs[0].text, "a: 1 | column 2: 2 | column 3: 3");
    }

    #[test]
    fn header_only_file_is_rejected() {
        let err = parse_tabular("empty.csv", b"name,city\n").unwrap_err();
        assert_eq!(err.code(), "validation_error");
        let err = parse_tabular("blank.csv", b"name,city\n,\n , \n").unwrap_err();
        assert_eq!(err.code(), "validation_error");
    }

    #[test]
    fn garbage_spreadsheet_is_a_validation_error() {
        let err = parse_tabular("broken.xlsx", b"not a zip file").unwrap_err();
        assert_eq!(err.code(), "validation_error");
    }

    #[test]
    fn cells_are_sanitised() {
        assert_eq!(sanitize_cell("  multi\n line\t\u{7}value  "), "multi line value");
        assert_eq!(sanitize_cell("\u{0}"), "");
    }
}
