pub mod docx;
pub mod email;
pub mod image;
pub mod msg;
pub mod pdf;
pub mod plain;
pub mod spreadsheet;

pub use docx::DocxExtractor;
pub use email::{EmlExtractor, MboxExtractor};
pub use image::ImageExtractor;
pub use msg::MsgExtractor;
pub use pdf::PdfExtractor;
pub use plain::PlainTextExtractor;
pub use spreadsheet::SpreadsheetExtractor;

use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, warn};

use crate::error::ExtractionError;
use crate::extracted::{EvidenceFile, ExtractedText, ExtractionQuality};
use crate::format::FormatKind;
use crate::ocr::{OcrConfig, OcrEngine};

/// Text produced by a format handler before quality grading and capping.
#[derive(Debug, Clone, PartialEq)]
pub struct RawExtraction {
    pub text: String,
    /// Set when the text came from OCR.
    pub confidence: Option<f32>,
    pub note: Option<String>,
}

impl RawExtraction {
    pub fn text(text: String) -> Self {
        Self {
            text,
            confidence: None,
            note: None,
        }
    }

    pub fn ocr(text: String, confidence: f32) -> Self {
        Self {
            text,
            confidence: Some(confidence),
            note: None,
        }
    }
}

/// One format family's text extraction.
#[async_trait]
pub trait FormatExtractor: Send + Sync {
    fn kinds(&self) -> &'static [FormatKind];

    async fn extract(&self, bytes: &[u8]) -> Result<RawExtraction, ExtractionError>;
}

/// Run a CPU-bound parser off the async workers. Panics inside format
/// libraries are reported as corrupt documents.
pub(crate) async fn parse_blocking<T, F>(format: &'static str, bytes: &[u8], parse: F) -> Result<T, ExtractionError>
where
    T: Send + 'static,
    F: FnOnce(Vec<u8>) -> Result<T, ExtractionError> + Send + 'static,
{
    let owned = bytes.to_vec();
    tokio::task::spawn_blocking(move || parse(owned))
        .await
        .map_err(|e| ExtractionError::corrupt(format, format!("parser aborted: {}", e)))?
}

/// Dispatches evidence files to the handler registered for their format.
pub struct Extractor {
    handlers: HashMap<FormatKind, Arc<dyn FormatExtractor>>,
    max_file_chars: usize,
    low_confidence_threshold: f32,
}

impl Extractor {
    pub fn new(max_file_chars: usize, low_confidence_threshold: f32) -> Self {
        Self {
            handlers: HashMap::new(),
            max_file_chars,
            low_confidence_threshold,
        }
    }

    /// All built-in handlers, sharing one OCR engine.
    pub fn with_default_handlers(max_file_chars: usize, ocr_config: &OcrConfig, ocr: Arc<dyn OcrEngine>) -> Self {
        let mut extractor = Self::new(max_file_chars, ocr_config.low_confidence_threshold);
        extractor.register(Arc::new(PlainTextExtractor));
        extractor.register(Arc::new(PdfExtractor::new(ocr.clone(), ocr_config)));
        extractor.register(Arc::new(DocxExtractor));
        extractor.register(Arc::new(SpreadsheetExtractor::default()));
        extractor.register(Arc::new(EmlExtractor));
        extractor.register(Arc::new(MboxExtractor));
        extractor.register(Arc::new(MsgExtractor));
        extractor.register(Arc::new(ImageExtractor::new(ocr, ocr_config)));
        extractor
    }

    /// Register a handler; replaces any earlier handler for the same kinds.
    pub fn register(&mut self, handler: Arc<dyn FormatExtractor>) {
        for kind in handler.kinds() {
            self.handlers.insert(*kind, handler.clone());
        }
    }

    pub fn max_file_chars(&self) -> usize {
        self.max_file_chars
    }

    /// Extract one file. Never fails: unreadable or unsupported files come
    /// back with `ExtractionQuality::Failed` and a reason.
    pub async fn extract(&self, file: &EvidenceFile) -> ExtractedText {
        let source = file.source_ref();

        let bytes = match file.read().await {
            Ok(bytes) => bytes,
            Err(e) => {
                warn!(file = %file.name, error = %e, "Evidence file unreadable");
                return ExtractedText::failed(source, ExtractionError::Io(e).to_string());
            }
        };

        let Some(handler) = self.handlers.get(&file.kind) else {
            debug!(file = %file.name, kind = %file.kind, "No extractor for format");
            return ExtractedText::failed(source, ExtractionError::Unsupported(file.kind.to_string()).to_string());
        };

        match handler.extract(&bytes).await {
            Ok(raw) => self.grade(source, raw),
            Err(e) => {
                warn!(file = %file.name, kind = %file.kind, error = %e, "Extraction failed");
                ExtractedText::failed(source, e.to_string())
            }
        }
    }

    /// Apply quality grading and the per-file cap to handler output.
    pub fn grade(&self, source: crate::extracted::SourceRef, raw: RawExtraction) -> ExtractedText {
        if raw.text.trim().is_empty() {
            return ExtractedText::failed(source, ExtractionError::Empty.to_string());
        }

        let quality = match raw.confidence {
            Some(c) if c < self.low_confidence_threshold => ExtractionQuality::LowConfidence,
            _ => ExtractionQuality::Ok,
        };

        let mut text = ExtractedText::new(source, raw.text, quality)
            .with_confidence(raw.confidence)
            .cap(self.max_file_chars);
        text.detail = raw.note;
        text
    }
}
