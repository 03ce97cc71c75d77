use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::io::Write;
use std::path::PathBuf;
use std::process::Stdio;
use tokio::process::Command;
use tracing::{debug, warn};

use crate::error::ExtractionError;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct OcrConfig {
    pub enabled: bool,
    pub tesseract_bin: PathBuf,
    pub pdftoppm_bin: PathBuf,
    pub languages: String,
    /// Below this mean word confidence the text is flagged low-confidence.
    pub low_confidence_threshold: f32,
    /// Total OCR attempts per document before it is marked failed.
    pub attempts: usize,
    pub max_pdf_pages: usize,
    pub dpi: u32,
}

impl Default for OcrConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            tesseract_bin: PathBuf::from("tesseract"),
            pdftoppm_bin: PathBuf::from("pdftoppm"),
            languages: "eng".to_string(),
            low_confidence_threshold: 0.70,
            attempts: 3,
            max_pdf_pages: 8,
            dpi: 200,
        }
    }
}

/// Text recognised on one image or page.
#[derive(Debug, Clone, PartialEq)]
pub struct OcrOutput {
    pub text: String,
    /// Mean word confidence in `[0, 1]`.
    pub confidence: f32,
}

/// OCR capability. Implementations must not modify the input.
#[async_trait]
pub trait OcrEngine: Send + Sync {
    async fn recognize_image(&self, image: &[u8]) -> Result<OcrOutput, ExtractionError>;

    /// Rasterise and recognise up to `max_pages` pages of a PDF.
    async fn recognize_pdf(&self, pdf: &[u8], max_pages: usize) -> Result<Vec<OcrOutput>, ExtractionError>;
}

/// Run an OCR call up to `attempts` times, returning the last error.
pub async fn recognize_with_retries<T, F, Fut>(attempts: usize, mut call: F) -> Result<T, ExtractionError>
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = Result<T, ExtractionError>>,
{
    let attempts = attempts.max(1);
    let mut last_error = None;

    for attempt in 1..=attempts {
        match call().await {
            Ok(out) => return Ok(out),
            // No point retrying a missing binary.
            Err(e @ ExtractionError::OcrUnavailable(_)) => return Err(e),
            Err(e) => {
                warn!(attempt, attempts, error = %e, "OCR attempt failed");
                last_error = Some(e);
            }
        }
    }

    Err(last_error.unwrap_or_else(|| ExtractionError::Ocr("no OCR attempt made".to_string())))
}

/// Tesseract CLI engine; `pdftoppm` rasterises PDF pages.
pub struct TesseractOcr {
    config: OcrConfig,
}

impl TesseractOcr {
    pub fn new(config: OcrConfig) -> Self {
        Self { config }
    }

    async fn run_tesseract(&self, image_path: &std::path::Path) -> Result<OcrOutput, ExtractionError> {
        let output = Command::new(&self.config.tesseract_bin)
            .arg(image_path)
            .arg("stdout")
            .args(["-l", &self.config.languages, "--oem", "3", "--psm", "6", "tsv"])
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .output()
            .await
            .map_err(|e| {
                ExtractionError::OcrUnavailable(format!("{}: {}", self.config.tesseract_bin.display(), e))
            })?;

        if !output.status.success() {
            return Err(ExtractionError::Ocr(format!(
                "tesseract exited with {}: {}",
                output.status,
                String::from_utf8_lossy(&output.stderr).trim()
            )));
        }

        Ok(parse_tsv(&String::from_utf8_lossy(&output.stdout)))
    }
}

#[async_trait]
impl OcrEngine for TesseractOcr {
    async fn recognize_image(&self, image: &[u8]) -> Result<OcrOutput, ExtractionError> {
        let mut file = tempfile::NamedTempFile::new()?;
        file.write_all(image)?;
        file.flush()?;
        self.run_tesseract(file.path()).await
    }

    async fn recognize_pdf(&self, pdf: &[u8], max_pages: usize) -> Result<Vec<OcrOutput>, ExtractionError> {
        let dir = tempfile::tempdir()?;
        let pdf_path = dir.path().join("input.pdf");
        tokio::fs::write(&pdf_path, pdf).await?;
        let prefix = dir.path().join("page");

        let output = Command::new(&self.config.pdftoppm_bin)
            .arg("-r")
            .arg(self.config.dpi.to_string())
            .args(["-f", "1", "-l"])
            .arg(max_pages.max(1).to_string())
            .arg("-png")
            .arg(&pdf_path)
            .arg(&prefix)
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .output()
            .await
            .map_err(|e| {
                ExtractionError::OcrUnavailable(format!("{}: {}", self.config.pdftoppm_bin.display(), e))
            })?;

        if !output.status.success() {
            return Err(ExtractionError::Ocr(format!(
                "pdftoppm exited with {}: {}",
                output.status,
                String::from_utf8_lossy(&output.stderr).trim()
            )));
        }

        // pdftoppm zero-pads page numbers uniformly, so name order is page order.
        let mut pages = Vec::new();
        let mut entries = tokio::fs::read_dir(dir.path()).await?;
        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) == Some("png") {
                pages.push(path);
            }
        }
        pages.sort();

        debug!(pages = pages.len(), "Rasterised PDF for OCR");

        let mut results = Vec::with_capacity(pages.len());
        for page in &pages {
            results.push(self.run_tesseract(page).await?);
        }
        Ok(results)
    }
}

/// Engine used when OCR is disabled in configuration.
pub struct DisabledOcr;

#[async_trait]
impl OcrEngine for DisabledOcr {
    async fn recognize_image(&self, _image: &[u8]) -> Result<OcrOutput, ExtractionError> {
        Err(ExtractionError::OcrUnavailable("OCR disabled in configuration".to_string()))
    }

    async fn recognize_pdf(&self, _pdf: &[u8], _max_pages: usize) -> Result<Vec<OcrOutput>, ExtractionError> {
        Err(ExtractionError::OcrUnavailable("OCR disabled in configuration".to_string()))
    }
}

/// Parse tesseract TSV output into text and mean word confidence.
/// Columns: level page_num block_num par_num line_num word_num left top width height conf text
pub fn parse_tsv(tsv: &str) -> OcrOutput {
    let mut text = String::new();
    let mut current_line: Option<(u32, u32, u32, u32)> = None;
    let mut confidences = Vec::new();

    for row in tsv.lines().skip(1) {
        let cols: Vec<&str> = row.split('\t').collect();
        if cols.len() < 12 || cols[0] != "5" {
            continue;
        }

        let word = cols[11].trim();
        if word.is_empty() {
            continue;
        }

        let key = (
            cols[1].parse().unwrap_or(0),
            cols[2].parse().unwrap_or(0),
            cols[3].parse().unwrap_or(0),
            cols[4].parse().unwrap_or(0),
        );
        match current_line {
            Some(prev) if prev == key => text.push(' '),
            Some(_) => text.push('\n'),
            None => {}
        }
        current_line = Some(key);
        text.push_str(word);

        if let Ok(conf) = cols[10].parse::<f32>() {
            if conf >= 0.0 {
                confidences.push(conf);
            }
        }
    }

    let confidence = if confidences.is_empty() {
        0.0
    } else {
        confidences.iter().sum::<f32>() / confidences.len() as f32 / 100.0
    };

    OcrOutput { text, confidence }
}
