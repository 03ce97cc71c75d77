use anyhow::{Context, Result};
use assess::AssessmentResult;
use std::io::Write;
use std::path::Path;
use tracing::info;

use crate::orchestrator::BatchRun;

pub const CSV_HEADERS: [&str; 15] = [
    "Risk",
    "Risk Description",
    "Control",
    "Control Description",
    "Evidence Summary",
    "Verdict",
    "Gaps",
    "Reasoning",
    "Status",
    "Error",
    "Notes",
    "Evidence OK",
    "Evidence Low Confidence",
    "Evidence Failed",
    "Model Calls",
];

#[derive(Debug, Clone, Copy, PartialEq, Eq, clap::ValueEnum)]
pub enum ReportFormat {
    /// One row per control
    Csv,
    /// Whole run, including usage statistics
    Json,
}

impl ReportFormat {
    /// Guess from the output file extension; CSV unless it ends in `.json`.
    pub fn from_path(path: &Path) -> Self {
        match path.extension().and_then(|e| e.to_str()) {
            Some(ext) if ext.eq_ignore_ascii_case("json") => Self::Json,
            _ => Self::Csv,
        }
    }
}

fn csv_row(result: &AssessmentResult) -> Vec<String> {
    vec![
        result.control.risk_id.clone(),
        result.control.risk_description.clone(),
        result.control.control_id.clone(),
        result.control.control_description.clone(),
        result.summary.clone(),
        result.verdict.to_string(),
        result.gaps.join("; "),
        result.reasoning.clone(),
        result.status.to_string(),
        result.error.clone().unwrap_or_default(),
        result.notes.join("; "),
        result.evidence.ok.to_string(),
        result.evidence.low_confidence.to_string(),
        result.evidence.failed.to_string(),
        result.model_calls.to_string(),
    ]
}

pub fn write_csv<W: Write>(writer: W, results: &[AssessmentResult]) -> Result<()> {
    let mut csv = csv::Writer::from_writer(writer);
    csv.write_record(CSV_HEADERS)?;
    for result in results {
        csv.write_record(csv_row(result))?;
    }
    csv.flush()?;
    Ok(())
}

pub fn write_json<W: Write>(writer: W, run: &BatchRun) -> Result<()> {
    serde_json::to_writer_pretty(writer, run)?;
    Ok(())
}

/// Write the report to `path`, creating parent directories as needed.
pub fn write_report(path: &Path, format: ReportFormat, run: &BatchRun) -> Result<()> {
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        std::fs::create_dir_all(parent).with_context(|| format!("Failed to create {}", parent.display()))?;
    }

    let file = std::fs::File::create(path).with_context(|| format!("Failed to create {}", path.display()))?;
    let writer = std::io::BufWriter::new(file);

    match format {
        ReportFormat::Csv => write_csv(writer, &run.results),
        ReportFormat::Json => write_json(writer, run),
    }
    .with_context(|| format!("Failed to write report {}", path.display()))?;

    info!(path = %path.display(), ?format, rows = run.results.len(), "Report written");
    Ok(())
}
