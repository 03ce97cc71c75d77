use async_trait::async_trait;

use super::{FormatExtractor, RawExtraction};
use crate::error::ExtractionError;
use crate::format::FormatKind;

/// Text, markdown, CSV, log and JSON files, decoded as lossy UTF-8.
pub struct PlainTextExtractor;

#[async_trait]
impl FormatExtractor for PlainTextExtractor {
    fn kinds(&self) -> &'static [FormatKind] {
        &[FormatKind::PlainText]
    }

    async fn extract(&self, bytes: &[u8]) -> Result<RawExtraction, ExtractionError> {
        let bytes = bytes.strip_prefix(b"\xEF\xBB\xBF").unwrap_or(bytes);
        Ok(RawExtraction::text(String::from_utf8_lossy(bytes).into_owned()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn strips_bom_and_replaces_invalid_bytes() {
        let raw = PlainTextExtractor
            .extract(b"\xEF\xBB\xBFTicket closed \xFF ok")
            .await
            .unwrap();
        assert_eq!(raw.text, "Ticket closed \u{FFFD} ok");
        assert!(raw.confidence.is_none());
    }
}
