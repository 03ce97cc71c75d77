use async_trait::async_trait;
use std::sync::Arc;

use super::{FormatExtractor, RawExtraction};
use crate::error::ExtractionError;
use crate::extracted::truncate_chars;
use crate::format::FormatKind;
use crate::ocr::{OcrConfig, OcrEngine, recognize_with_retries};

const MAX_IMAGE_CHARS: usize = 7_500;

/// Screenshots and scans, read through the OCR engine.
pub struct ImageExtractor {
    ocr: Arc<dyn OcrEngine>,
    attempts: usize,
}

impl ImageExtractor {
    pub fn new(ocr: Arc<dyn OcrEngine>, config: &OcrConfig) -> Self {
        Self {
            ocr,
            attempts: config.attempts,
        }
    }
}

#[async_trait]
impl FormatExtractor for ImageExtractor {
    fn kinds(&self) -> &'static [FormatKind] {
        &[FormatKind::Image]
    }

    async fn extract(&self, bytes: &[u8]) -> Result<RawExtraction, ExtractionError> {
        let output = recognize_with_retries(self.attempts, || self.ocr.recognize_image(bytes)).await?;
        if output.text.trim().is_empty() {
            return Err(ExtractionError::Empty);
        }

        let mut text = output.text;
        let mut note = None;
        if let Some(cut) = truncate_chars(&text, MAX_IMAGE_CHARS) {
            text = cut;
            note = Some(format!("image OCR text cut to {} chars", MAX_IMAGE_CHARS));
        }

        let mut raw = RawExtraction::ocr(
            format!("OCR Text (Confidence: {:.1}%):\n{}", output.confidence * 100.0, text),
            output.confidence,
        );
        raw.note = note;
        Ok(raw)
    }
}
