use async_trait::async_trait;

use crate::control::Control;
use crate::error::ExtractionError;
use crate::extracted::{ExtractedText, ExtractionQuality, SourceRef};

/// Text blob supplied by a non-file evidence source.
#[derive(Debug, Clone, PartialEq)]
pub struct SourceDocument {
    /// Human-readable label, e.g. a ticket key or report name.
    pub label: String,
    pub text: String,
}

/// Additional evidence for a control, fetched from a system rather than
/// the evidence folder (GRC exports, ticket history and the like).
#[async_trait]
pub trait EvidenceSource: Send + Sync {
    fn name(&self) -> &str;

    async fn fetch(&self, control: &Control) -> Result<Vec<SourceDocument>, ExtractionError>;
}

/// Fetch from one source, turning each document (or the whole failure)
/// into extracted text capped at `max_chars`.
pub async fn collect_from_source(source: &dyn EvidenceSource, control: &Control, max_chars: usize) -> Vec<ExtractedText> {
    match source.fetch(control).await {
        Ok(documents) => documents
            .into_iter()
            .map(|doc| {
                let source_ref = SourceRef::external(source.name(), &doc.label, doc.text.len() as u64);
                if doc.text.trim().is_empty() {
                    ExtractedText::failed(source_ref, ExtractionError::Empty.to_string())
                } else {
                    ExtractedText::new(source_ref, doc.text, ExtractionQuality::Ok).cap(max_chars)
                }
            })
            .collect(),
        Err(e) => {
            tracing::warn!(source = source.name(), control_id = %control.control_id, error = %e, "Evidence source failed");
            let source_ref = SourceRef::external(source.name(), "fetch", 0);
            vec![ExtractedText::failed(
                source_ref,
                ExtractionError::Source {
                    source_name: source.name().to_string(),
                    message: e.to_string(),
                }
                .to_string(),
            )]
        }
    }
}
