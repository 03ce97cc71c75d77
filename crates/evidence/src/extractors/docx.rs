use async_trait::async_trait;
use quick_xml::Reader;
use quick_xml::events::Event;
use std::io::{Cursor, Read};

use super::{FormatExtractor, RawExtraction, parse_blocking};
use crate::error::ExtractionError;
use crate::format::FormatKind;

/// Word documents: paragraph text from `word/document.xml`.
pub struct DocxExtractor;

#[async_trait]
impl FormatExtractor for DocxExtractor {
    fn kinds(&self) -> &'static [FormatKind] {
        &[FormatKind::Word]
    }

    async fn extract(&self, bytes: &[u8]) -> Result<RawExtraction, ExtractionError> {
        let text = parse_blocking("docx", bytes, |owned| docx_text(&owned)).await?;
        Ok(RawExtraction::text(text))
    }
}

fn docx_text(bytes: &[u8]) -> Result<String, ExtractionError> {
    let mut archive = zip::ZipArchive::new(Cursor::new(bytes)).map_err(|e| ExtractionError::corrupt("docx", e))?;

    let mut xml = String::new();
    archive
        .by_name("word/document.xml")
        .map_err(|e| ExtractionError::corrupt("docx", e))?
        .read_to_string(&mut xml)?;

    paragraphs_from_xml(&xml)
}

fn paragraphs_from_xml(xml: &str) -> Result<String, ExtractionError> {
    let mut reader = Reader::from_str(xml);
    let mut out = String::new();
    let mut in_text = false;

    loop {
        match reader.read_event() {
            Ok(Event::Start(e)) => {
                if e.name().as_ref() == b"w:t" {
                    in_text = true;
                }
            }
            Ok(Event::End(e)) => match e.name().as_ref() {
                b"w:t" => in_text = false,
                b"w:p" => out.push('\n'),
                _ => {}
            },
            Ok(Event::Empty(e)) => match e.name().as_ref() {
                b"w:tab" => out.push('\t'),
                b"w:br" | b"w:cr" | b"w:p" => out.push('\n'),
                _ => {}
            },
            Ok(Event::Text(t)) if in_text => {
                let text = t.unescape().map_err(|e| ExtractionError::corrupt("docx", e))?;
                out.push_str(&text);
            }
            Ok(Event::Eof) => break,
            Err(e) => return Err(ExtractionError::corrupt("docx", e)),
            _ => {}
        }
    }

    Ok(out.trim_end().to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn make_docx(document_xml: &str) -> Vec<u8> {
        let mut zip = zip::ZipWriter::new(Cursor::new(Vec::new()));
        zip.start_file("word/document.xml", zip::write::SimpleFileOptions::default())
            .unwrap();
        zip.write_all(document_xml.as_bytes()).unwrap();
        zip.finish().unwrap().into_inner()
    }

    #[tokio::test]
    async fn extracts_paragraphs() {
        let xml = r#"<?xml version="1.0" encoding="UTF-8"?>
<w:document xmlns:w="http://schemas.openxmlformats.org/wordprocessingml/2006/main">
  <w:body>
    <w:p><w:r><w:t>Access review Q1</w:t></w:r></w:p>
    <w:p><w:r><w:t xml:space="preserve">Reviewer: </w:t></w:r><w:r><w:t>J. Doe &amp; team</w:t></w:r></w:p>
    <w:p><w:r><w:t>Status:</w:t><w:tab/><w:t>Approved</w:t></w:r></w:p>
  </w:body>
</w:document>"#;

        let raw = DocxExtractor.extract(&make_docx(xml)).await.unwrap();
        assert_eq!(raw.text, "Access review Q1\nReviewer: J. Doe & team\nStatus:\tApproved");
    }

    #[tokio::test]
    async fn missing_document_part_is_corrupt() {
        let mut zip = zip::ZipWriter::new(Cursor::new(Vec::new()));
        zip.start_file("other.xml", zip::write::SimpleFileOptions::default())
            .unwrap();
        zip.write_all(b"<x/>").unwrap();
        let bytes = zip.finish().unwrap().into_inner();

        let err = DocxExtractor.extract(&bytes).await.unwrap_err();
        assert!(matches!(err, ExtractionError::Corrupt { format: "docx", .. }));
    }
}
