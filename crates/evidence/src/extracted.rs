use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fmt;
use std::path::{Path, PathBuf};
use unicode_segmentation::UnicodeSegmentation;

use crate::format::FormatKind;

/// A discovered evidence file. Read-only; bytes are loaded on demand.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EvidenceFile {
    pub path: PathBuf,
    /// Path relative to the control's evidence folder, `/`-separated.
    pub name: String,
    pub kind: FormatKind,
    pub size_bytes: u64,
}

impl EvidenceFile {
    pub fn source_ref(&self) -> SourceRef {
        SourceRef {
            id: generate_source_id(&self.name),
            name: self.name.clone(),
            kind: self.kind,
            size_bytes: self.size_bytes,
        }
    }

    pub async fn read(&self) -> std::io::Result<Vec<u8>> {
        tokio::fs::read(&self.path).await
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

/// Lightweight descriptor of where a piece of text came from.
/// Does not own the file.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SourceRef {
    pub id: String,
    pub name: String,
    pub kind: FormatKind,
    pub size_bytes: u64,
}

impl SourceRef {
    pub fn external(source_name: &str, label: &str, size_bytes: u64) -> Self {
        let name = format!("{}: {}", source_name, label);
        Self {
            id: generate_source_id(&name),
            name,
            kind: FormatKind::External,
            size_bytes,
        }
    }
}

/// Stable id from the relative name (first 8 bytes of SHA-256, hex).
pub fn generate_source_id(name: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(name.as_bytes());
    let result = hasher.finalize();
    hex::encode(&result[..8])
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExtractionQuality {
    Ok,
    LowConfidence,
    Failed,
}

impl fmt::Display for ExtractionQuality {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Ok => "ok",
            Self::LowConfidence => "low-confidence",
            Self::Failed => "failed",
        })
    }
}

/// Normalised text of one evidence file (or source blob).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExtractedText {
    pub source: SourceRef,
    pub text: String,
    pub quality: ExtractionQuality,
    /// OCR confidence in `[0, 1]` when OCR produced the text.
    pub confidence: Option<f32>,
    pub truncated: bool,
    /// Length in chars before any truncation.
    pub original_chars: usize,
    /// Failure reason or extractor notes.
    pub detail: Option<String>,
}

impl ExtractedText {
    pub fn new(source: SourceRef, text: String, quality: ExtractionQuality) -> Self {
        let original_chars = text.chars().count();
        Self {
            source,
            text,
            quality,
            confidence: None,
            truncated: false,
            original_chars,
            detail: None,
        }
    }

    pub fn failed(source: SourceRef, reason: impl Into<String>) -> Self {
        Self {
            source,
            text: String::new(),
            quality: ExtractionQuality::Failed,
            confidence: None,
            truncated: false,
            original_chars: 0,
            detail: Some(reason.into()),
        }
    }

    pub fn with_confidence(mut self, confidence: Option<f32>) -> Self {
        self.confidence = confidence;
        self
    }

    pub fn char_len(&self) -> usize {
        self.text.chars().count()
    }

    pub fn is_usable(&self) -> bool {
        self.quality != ExtractionQuality::Failed && !self.text.trim().is_empty()
    }

    /// Keep the earliest `max_chars` chars; sets the truncation flag on overflow.
    pub fn cap(mut self, max_chars: usize) -> Self {
        if let Some(cut) = truncate_chars(&self.text, max_chars) {
            self.text = cut;
            self.truncated = true;
        }
        self
    }

    /// Estimate token count (rough: 4 chars per token)
    pub fn estimated_tokens(&self) -> usize {
        estimate_tokens(&self.text)
    }
}

pub fn estimate_tokens(text: &str) -> usize {
    text.chars().count() / 4
}

/// Prefix of `text` with at most `max_chars` chars, cut on a grapheme boundary.
/// Returns `None` when the text already fits.
pub fn truncate_chars(text: &str, max_chars: usize) -> Option<String> {
    if text.chars().count() <= max_chars {
        return None;
    }

    let mut out = String::new();
    let mut used = 0;
    for grapheme in text.graphemes(true) {
        let len = grapheme.chars().count();
        if used + len > max_chars {
            break;
        }
        out.push_str(grapheme);
        used += len;
    }
    Some(out)
}
