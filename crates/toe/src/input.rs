use anyhow::{Context, Result, anyhow, bail};
use calamine::{Reader, open_workbook_auto};
use evidence::Control;
use std::collections::HashSet;
use std::path::Path;
use tracing::{info, warn};

/// Columns the control sheet must carry, with accepted header spellings.
const RISK: &[&str] = &["risk", "riskid"];
const RISK_DESCRIPTION: &[&str] = &["riskdescription"];
const CONTROL: &[&str] = &["control", "controlid"];
const CONTROL_DESCRIPTION: &[&str] = &["controldescription"];

/// Load controls from a CSV file or a spreadsheet (xlsx, xlsm, xls, ods).
/// Input order is preserved.
pub fn load_controls(path: &Path) -> Result<Vec<Control>> {
    let extension = path
        .extension()
        .and_then(|e| e.to_str())
        .map(|e| e.to_ascii_lowercase())
        .unwrap_or_default();

    let (headers, rows) = match extension.as_str() {
        "csv" => read_csv(path)?,
        "xlsx" | "xlsm" | "xls" | "ods" => read_workbook(path)?,
        other => bail!("Unsupported control sheet format '{}': {}", other, path.display()),
    };

    let controls = controls_from_rows(&headers, rows).with_context(|| format!("Invalid control sheet {}", path.display()))?;
    info!(path = %path.display(), controls = controls.len(), "Loaded control sheet");
    Ok(controls)
}

fn read_csv(path: &Path) -> Result<(Vec<String>, Vec<Vec<String>>)> {
    let mut reader = csv::ReaderBuilder::new()
        .flexible(true)
        .trim(csv::Trim::All)
        .from_path(path)
        .with_context(|| format!("Failed to open {}", path.display()))?;

    let headers = reader.headers()?.iter().map(str::to_string).collect();
    let mut rows = Vec::new();
    for record in reader.records() {
        let record = record.with_context(|| format!("Failed to read row from {}", path.display()))?;
        rows.push(record.iter().map(str::to_string).collect());
    }
    Ok((headers, rows))
}

fn read_workbook(path: &Path) -> Result<(Vec<String>, Vec<Vec<String>>)> {
    let mut workbook = open_workbook_auto(path).with_context(|| format!("Failed to open {}", path.display()))?;
    let sheet = workbook
        .sheet_names()
        .first()
        .cloned()
        .ok_or_else(|| anyhow!("Workbook has no sheets"))?;
    let range = workbook
        .worksheet_range(&sheet)
        .with_context(|| format!("Failed to read sheet '{}'", sheet))?;

    let mut rows = range
        .rows()
        .map(|row| row.iter().map(|cell| cell.to_string().trim().to_string()).collect::<Vec<_>>());
    let headers = rows.next().ok_or_else(|| anyhow!("Sheet '{}' is empty", sheet))?;
    Ok((headers, rows.collect()))
}

/// Lowercase and drop everything but letters and digits, so "Control ID",
/// "control_id" and "CONTROL" all compare equal to their aliases.
fn normalize_header(header: &str) -> String {
    header
        .chars()
        .filter(|c| c.is_alphanumeric())
        .flat_map(char::to_lowercase)
        .collect()
}

fn find_column(headers: &[String], aliases: &[&str], name: &str) -> Result<usize> {
    headers
        .iter()
        .position(|h| aliases.contains(&normalize_header(h).as_str()))
        .ok_or_else(|| anyhow!("Missing required column '{}'", name))
}

pub fn controls_from_rows(headers: &[String], rows: Vec<Vec<String>>) -> Result<Vec<Control>> {
    let risk = find_column(headers, RISK, "Risk")?;
    let risk_description = find_column(headers, RISK_DESCRIPTION, "Risk Description")?;
    let control = find_column(headers, CONTROL, "Control")?;
    let control_description = find_column(headers, CONTROL_DESCRIPTION, "Control Description")?;

    let cell = |row: &[String], i: usize| row.get(i).map(|s| s.trim().to_string()).unwrap_or_default();

    let mut seen = HashSet::new();
    let mut controls = Vec::with_capacity(rows.len());

    for (i, row) in rows.iter().enumerate() {
        if row.iter().all(|c| c.trim().is_empty()) {
            continue;
        }

        let control_id = cell(row, control);
        if control_id.is_empty() {
            // Header is row 1.
            warn!(row = i + 2, "Skipping row without a control id");
            continue;
        }
        if !seen.insert(control_id.clone()) {
            warn!(control_id = %control_id, row = i + 2, "Duplicate control id");
        }

        controls.push(Control::new(
            cell(row, risk),
            cell(row, risk_description),
            control_id,
            cell(row, control_description),
        ));
    }

    if controls.is_empty() {
        bail!("No controls found");
    }
    Ok(controls)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn strings(values: &[&str]) -> Vec<String> {
        values.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn headers_match_loosely() {
        let headers = strings(&["Risk ID", "RISK DESCRIPTION", "control_id", "Control  Description", "Owner"]);
        let rows = vec![strings(&["R1", "Fraud", "C001", "CFO approval", "Finance"])];

        let controls = controls_from_rows(&headers, rows).unwrap();
        assert_eq!(controls.len(), 1);
        assert_eq!(controls[0].risk_id, "R1");
        assert_eq!(controls[0].control_id, "C001");
        assert_eq!(controls[0].control_description, "CFO approval");
        assert!(controls[0].evidence_folder.is_none());
    }

    #[test]
    fn rows_without_control_id_are_skipped() {
        let headers = strings(&["Risk", "Risk Description", "Control", "Control Description"]);
        let rows = vec![
            strings(&["R1", "d", "C001", "x"]),
            strings(&["R2", "d", "  ", "y"]),
            strings(&["", "", "", ""]),
            strings(&["R3", "d", "C003"]),
        ];

        let controls = controls_from_rows(&headers, rows).unwrap();
        let ids: Vec<_> = controls.iter().map(|c| c.control_id.as_str()).collect();
        assert_eq!(ids, vec!["C001", "C003"]);
        assert_eq!(controls[1].control_description, "");
    }

    #[test]
    fn missing_column_is_reported() {
        let headers = strings(&["Risk", "Risk Description", "Control"]);
        let err = controls_from_rows(&headers, vec![strings(&["R1", "d", "C1"])]).unwrap_err();
        assert!(err.to_string().contains("Control Description"));
    }

    #[test]
    fn csv_sheet_is_loaded_in_order() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("controls.csv");
        let mut file = std::fs::File::create(&path).unwrap();
        writeln!(file, "Risk,Risk Description,Control,Control Description").unwrap();
        writeln!(file, "R1,Unauthorised payments,C002,\"Payments over 10,000 need CFO approval\"").unwrap();
        writeln!(file, "R2,Access creep,C001,Quarterly access review").unwrap();
        drop(file);

        let controls = load_controls(&path).unwrap();
        assert_eq!(controls[0].control_id, "C002");
        assert_eq!(controls[0].control_description, "Payments over 10,000 need CFO approval");
        assert_eq!(controls[1].control_id, "C001");
    }

    #[test]
    fn unknown_extension_is_rejected() {
        let err = load_controls(Path::new("controls.json")).unwrap_err();
        assert!(err.to_string().contains("Unsupported"));
    }
}
