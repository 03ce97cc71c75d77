use async_trait::async_trait;
use calamine::{Data, Reader, open_workbook_auto_from_rs};
use std::io::Cursor;

use super::{FormatExtractor, RawExtraction, parse_blocking};
use crate::error::ExtractionError;
use crate::format::FormatKind;

const HEAD_ROWS: usize = 10;
const TAIL_ROWS: usize = 5;

/// Excel and OpenDocument workbooks, one block per sheet.
pub struct SpreadsheetExtractor {
    /// Workbooks larger than this are summarised per sheet.
    pub summarise_above_bytes: usize,
}

impl Default for SpreadsheetExtractor {
    fn default() -> Self {
        Self {
            summarise_above_bytes: 50_000,
        }
    }
}

#[async_trait]
impl FormatExtractor for SpreadsheetExtractor {
    fn kinds(&self) -> &'static [FormatKind] {
        &[FormatKind::Spreadsheet]
    }

    async fn extract(&self, bytes: &[u8]) -> Result<RawExtraction, ExtractionError> {
        let summarise = bytes.len() > self.summarise_above_bytes;
        let text = parse_blocking("spreadsheet", bytes, move |owned| workbook_text(owned, summarise)).await?;
        Ok(RawExtraction::text(text))
    }
}

fn workbook_text(bytes: Vec<u8>, summarise: bool) -> Result<String, ExtractionError> {
    let mut workbook =
        open_workbook_auto_from_rs(Cursor::new(bytes)).map_err(|e| ExtractionError::corrupt("spreadsheet", e))?;

    let names = workbook.sheet_names().to_owned();
    let mut out = Vec::new();
    if summarise {
        out.push(format!("Excel Workbook: {} sheets", names.len()));
    }

    for name in names {
        let range = workbook
            .worksheet_range(&name)
            .map_err(|e| ExtractionError::corrupt("spreadsheet", e))?;

        let rows: Vec<String> = range
            .rows()
            .map(row_text)
            .filter(|row| !row.is_empty())
            .collect();

        out.push(format!("--- Sheet: {} ---", name));
        out.extend(select_rows(rows, summarise));
    }

    Ok(out.join("\n"))
}

fn row_text(row: &[Data]) -> String {
    row.iter()
        .filter(|cell| !matches!(cell, Data::Empty))
        .map(|cell| cell.to_string())
        .collect::<Vec<_>>()
        .join(", ")
}

/// All rows, or head and tail with a note when summarising long sheets.
fn select_rows(rows: Vec<String>, summarise: bool) -> Vec<String> {
    if !summarise || rows.len() <= HEAD_ROWS + TAIL_ROWS {
        return rows;
    }

    let total = rows.len();
    let mut selected: Vec<String> = rows[..HEAD_ROWS].to_vec();
    selected.extend_from_slice(&rows[total - TAIL_ROWS..]);
    selected.push(format!(
        "[SUMMARY: Sheet has {} rows, showing first {} and last {}]",
        total, HEAD_ROWS, TAIL_ROWS
    ));
    selected
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn row_text_skips_empty_cells() {
        let row = vec![
            Data::String("INV-001".to_string()),
            Data::Empty,
            Data::Float(1250.5),
            Data::Bool(true),
        ];
        assert_eq!(row_text(&row), "INV-001, 1250.5, true");
    }

    #[test]
    fn long_sheets_are_summarised() {
        let rows: Vec<String> = (1..=40).map(|i| format!("row {}", i)).collect();
        let selected = select_rows(rows, true);

        assert_eq!(selected.len(), HEAD_ROWS + TAIL_ROWS + 1);
        assert_eq!(selected[0], "row 1");
        assert_eq!(selected[9], "row 10");
        assert_eq!(selected[10], "row 36");
        assert!(selected.last().unwrap().contains("Sheet has 40 rows"));
    }

    #[test]
    fn short_sheets_are_kept_whole() {
        let rows: Vec<String> = (1..=12).map(|i| format!("row {}", i)).collect();
        assert_eq!(select_rows(rows.clone(), true), rows);
    }

    #[tokio::test]
    async fn garbage_workbook_is_corrupt() {
        let err = SpreadsheetExtractor::default()
            .extract(b"not a workbook at all")
            .await
            .unwrap_err();
        assert!(matches!(err, ExtractionError::Corrupt { .. }));
    }
}
