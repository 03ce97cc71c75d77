use async_trait::async_trait;
use std::sync::Arc;
use tracing::{debug, warn};

use super::{FormatExtractor, RawExtraction, parse_blocking};
use crate::error::ExtractionError;
use crate::extracted::truncate_chars;
use crate::format::FormatKind;
use crate::ocr::{OcrConfig, OcrEngine, OcrOutput, recognize_with_retries};

const MAX_TEXT_PAGES: usize = 10;
const MAX_TEXT_CHARS: usize = 12_000;
const MAX_OCR_PAGE_CHARS: usize = 1_800;

/// PDF text layer, with OCR fallback for scanned documents.
pub struct PdfExtractor {
    ocr: Arc<dyn OcrEngine>,
    ocr_attempts: usize,
    max_ocr_pages: usize,
}

impl PdfExtractor {
    pub fn new(ocr: Arc<dyn OcrEngine>, config: &OcrConfig) -> Self {
        Self {
            ocr,
            ocr_attempts: config.attempts,
            max_ocr_pages: config.max_pdf_pages,
        }
    }

    async fn ocr_fallback(&self, bytes: &[u8], reason: &str) -> Result<RawExtraction, ExtractionError> {
        debug!(reason, "Falling back to PDF OCR");
        let pages = recognize_with_retries(self.ocr_attempts, || self.ocr.recognize_pdf(bytes, self.max_ocr_pages)).await?;
        render_ocr_pages(&pages, reason)
    }
}

#[async_trait]
impl FormatExtractor for PdfExtractor {
    fn kinds(&self) -> &'static [FormatKind] {
        &[FormatKind::Pdf]
    }

    async fn extract(&self, bytes: &[u8]) -> Result<RawExtraction, ExtractionError> {
        let pages = parse_blocking("pdf", bytes, |owned| {
            pdf_extract::extract_text_from_mem_by_pages(&owned).map_err(|e| ExtractionError::corrupt("pdf", e))
        })
        .await;

        match pages {
            Ok(pages) => match render_text_layer(&pages) {
                Some(text) => Ok(RawExtraction::text(text)),
                None => self.ocr_fallback(bytes, "PDF contains no extractable text").await,
            },
            Err(e) => {
                warn!(error = %e, "PDF text layer unreadable");
                let reason = format!("PDF text extraction failed: {}", e);
                self.ocr_fallback(bytes, &reason).await
            }
        }
    }
}

/// Text of the first pages, `None` when the document has no text layer.
fn render_text_layer(pages: &[String]) -> Option<String> {
    let processed = pages.len().min(MAX_TEXT_PAGES);
    let mut text = String::new();

    for page in &pages[..processed] {
        text.push_str(page);
        if text.chars().count() > MAX_TEXT_CHARS {
            if let Some(cut) = truncate_chars(&text, MAX_TEXT_CHARS) {
                text = cut;
            }
            break;
        }
    }

    if text.trim().is_empty() {
        return None;
    }

    let mut out = format!("=== PDF TEXT EXTRACTION ({} pages) ===\n{}", processed, text);
    if pages.len() > processed {
        out.push_str(&format!(
            "\n[NOTE: PDF has {} total pages, processed first {}]",
            pages.len(),
            processed
        ));
    }
    Some(out)
}

fn render_ocr_pages(pages: &[OcrOutput], reason: &str) -> Result<RawExtraction, ExtractionError> {
    let total_chars: usize = pages.iter().map(|p| p.text.chars().count()).sum();
    if total_chars == 0 {
        return Err(ExtractionError::Empty);
    }

    let mut out = format!("[{} - used OCR]\n=== PDF OCR EXTRACTION ===", reason);
    for (i, page) in pages.iter().enumerate() {
        out.push_str(&format!(
            "\n--- PAGE {} OCR (confidence {:.1}%) ---\n",
            i + 1,
            page.confidence * 100.0
        ));
        match truncate_chars(&page.text, MAX_OCR_PAGE_CHARS) {
            Some(cut) => {
                out.push_str(&cut);
                out.push_str(&format!("\n[PAGE {} OCR TRUNCATED]", i + 1));
            }
            None => out.push_str(&page.text),
        }
    }

    // Weighted by text length so near-empty pages do not drag the score.
    let weighted: f32 = pages
        .iter()
        .map(|p| p.confidence * p.text.chars().count() as f32)
        .sum();

    Ok(RawExtraction::ocr(out, weighted / total_chars as f32))
}
