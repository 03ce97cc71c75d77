use async_trait::async_trait;
use mail_parser::{Addr, Address, Message, MessageParser, MimeHeaders};

use super::{FormatExtractor, RawExtraction};
use crate::error::ExtractionError;
use crate::format::FormatKind;

const SEPARATOR_WIDTH: usize = 50;

/// RFC 822 `.eml` messages.
pub struct EmlExtractor;

#[async_trait]
impl FormatExtractor for EmlExtractor {
    fn kinds(&self) -> &'static [FormatKind] {
        &[FormatKind::Email]
    }

    async fn extract(&self, bytes: &[u8]) -> Result<RawExtraction, ExtractionError> {
        let message = MessageParser::default()
            .parse(bytes)
            .ok_or_else(|| ExtractionError::corrupt("eml", "not an RFC 822 message"))?;
        Ok(RawExtraction::text(render_message(&message, SEPARATOR_WIDTH)))
    }
}

/// Unix mailboxes, one block per message.
pub struct MboxExtractor;

#[async_trait]
impl FormatExtractor for MboxExtractor {
    fn kinds(&self) -> &'static [FormatKind] {
        &[FormatKind::Mailbox]
    }

    async fn extract(&self, bytes: &[u8]) -> Result<RawExtraction, ExtractionError> {
        let parser = MessageParser::default();
        let mut blocks = Vec::new();
        let mut skipped = 0;

        for (i, raw) in split_mbox(bytes).into_iter().enumerate() {
            match parser.parse(raw) {
                Some(message) => {
                    blocks.push(format!("=== EMAIL {} ===\n{}", i + 1, render_message(&message, 30)));
                }
                None => skipped += 1,
            }
        }

        if blocks.is_empty() {
            return Err(ExtractionError::corrupt("mbox", "no parseable messages"));
        }

        let mut extraction = RawExtraction::text(blocks.join("\n\n"));
        if skipped > 0 {
            extraction.note = Some(format!("{} unparseable messages skipped", skipped));
        }
        Ok(extraction)
    }
}

fn render_message(message: &Message, separator_width: usize) -> String {
    let mut lines = vec![
        format!("From: {}", format_address(message.from()).unwrap_or_else(|| "Unknown".to_string())),
        format!("To: {}", format_address(message.to()).unwrap_or_else(|| "Unknown".to_string())),
        format!("CC: {}", format_address(message.cc()).unwrap_or_else(|| "None".to_string())),
        format!(
            "Date: {}",
            message
                .date()
                .map(|d| d.to_rfc3339())
                .unwrap_or_else(|| "Unknown".to_string())
        ),
        format!("Subject: {}", message.subject().unwrap_or("No Subject")),
        "-".repeat(separator_width),
        "Body:".to_string(),
    ];

    // body_text falls back to an HTML-to-text rendering when there is no text part.
    match message.body_text(0) {
        Some(body) if !body.trim().is_empty() => lines.push(body.trim().to_string()),
        _ => lines.push("[No body content]".to_string()),
    }

    let attachments: Vec<String> = message
        .attachments()
        .filter_map(|part| part.attachment_name().map(str::to_string))
        .collect();
    if !attachments.is_empty() {
        lines.push("-".repeat(separator_width));
        lines.push("Attachments:".to_string());
        lines.extend(attachments.iter().map(|name| format!("  - {}", name)));
    }

    lines.join("\n")
}

fn format_address(address: Option<&Address>) -> Option<String> {
    let addrs: Vec<&Addr> = match address? {
        Address::List(list) => list.iter().collect(),
        Address::Group(groups) => groups.iter().flat_map(|g| g.addresses.iter()).collect(),
    };

    let rendered: Vec<String> = addrs
        .into_iter()
        .filter_map(|addr| match (addr.name.as_deref(), addr.address.as_deref()) {
            (Some(name), Some(email)) => Some(format!("{} <{}>", name, email)),
            (None, Some(email)) => Some(email.to_string()),
            (Some(name), None) => Some(name.to_string()),
            (None, None) => None,
        })
        .collect();

    if rendered.is_empty() { None } else { Some(rendered.join(", ")) }
}

/// Split an mbox on `From ` separator lines; separator lines are dropped.
fn split_mbox(bytes: &[u8]) -> Vec<&[u8]> {
    let mut starts = Vec::new();
    let mut line_start = 0;

    while line_start < bytes.len() {
        let line_end = bytes[line_start..]
            .iter()
            .position(|b| *b == b'\n')
            .map(|p| line_start + p + 1)
            .unwrap_or(bytes.len());

        if bytes[line_start..].starts_with(b"From ") {
            starts.push((line_start, line_end));
        }
        line_start = line_end;
    }

    let mut messages = Vec::new();
    for (i, (_, body_start)) in starts.iter().enumerate() {
        let end = starts.get(i + 1).map(|(next, _)| *next).unwrap_or(bytes.len());
        let message = &bytes[*body_start..end];
        if !message.iter().all(|b| b.is_ascii_whitespace()) {
            messages.push(message);
        }
    }
    messages
}
