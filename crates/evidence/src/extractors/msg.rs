use async_trait::async_trait;
use std::io::{Cursor, Read, Seek};
use std::path::{Path, PathBuf};

use super::{FormatExtractor, RawExtraction, parse_blocking};
use crate::error::ExtractionError;
use crate::extracted::truncate_chars;
use crate::format::FormatKind;

const SUBJECT: &str = "0037";
const BODY: &str = "1000";
const SENDER_NAME: &str = "0C1A";
const SENDER_EMAIL: &str = "0C1F";
const DISPLAY_TO: &str = "0E04";
const DISPLAY_CC: &str = "0E03";
const ATTACH_LONG_NAME: &str = "3707";
const ATTACH_SHORT_NAME: &str = "3704";

const BODY_LIMIT: usize = 800;
const BODY_KEEP: usize = 700;
const MAX_ATTACHMENTS: usize = 5;

/// Outlook `.msg` files (OLE compound documents).
pub struct MsgExtractor;

#[async_trait]
impl FormatExtractor for MsgExtractor {
    fn kinds(&self) -> &'static [FormatKind] {
        &[FormatKind::OutlookMessage]
    }

    async fn extract(&self, bytes: &[u8]) -> Result<RawExtraction, ExtractionError> {
        let text = parse_blocking("msg", bytes, |owned| msg_text(owned)).await?;
        Ok(RawExtraction::text(text))
    }
}

fn msg_text(bytes: Vec<u8>) -> Result<String, ExtractionError> {
    let mut file = cfb::CompoundFile::open(Cursor::new(bytes)).map_err(|e| ExtractionError::corrupt("msg", e))?;
    let root = Path::new("/");

    let sender = match (
        read_property(&mut file, root, SENDER_NAME),
        read_property(&mut file, root, SENDER_EMAIL),
    ) {
        (Some(name), Some(email)) => format!("{} <{}>", name, email),
        (Some(name), None) => name,
        (None, Some(email)) => email,
        (None, None) => "Unknown".to_string(),
    };

    let mut lines = vec![
        format!("From: {}", sender),
        format!(
            "To: {}",
            read_property(&mut file, root, DISPLAY_TO).unwrap_or_else(|| "Unknown".to_string())
        ),
        format!(
            "CC: {}",
            read_property(&mut file, root, DISPLAY_CC).unwrap_or_else(|| "None".to_string())
        ),
        format!(
            "Subject: {}",
            read_property(&mut file, root, SUBJECT).unwrap_or_else(|| "No Subject".to_string())
        ),
        "-".repeat(30),
        "Body:".to_string(),
    ];

    match read_property(&mut file, root, BODY) {
        Some(body) if !body.trim().is_empty() => {
            let body = body.trim();
            if body.chars().count() > BODY_LIMIT {
                let cut = truncate_chars(body, BODY_KEEP).unwrap_or_else(|| body.to_string());
                lines.push(format!("{}\n[... email body truncated ...]", cut));
            } else {
                lines.push(body.to_string());
            }
        }
        _ => lines.push("[No body content]".to_string()),
    }

    let attachments = attachment_names(&mut file);
    if !attachments.is_empty() {
        lines.push(format!("Attachments: {}", attachments.len()));
        lines.extend(
            attachments
                .iter()
                .take(MAX_ATTACHMENTS)
                .map(|name| format!("  - {}", name)),
        );
    }

    Ok(lines.join("\n"))
}

fn attachment_names<F: Read + Seek>(file: &mut cfb::CompoundFile<F>) -> Vec<String> {
    let storages: Vec<PathBuf> = match file.read_storage("/") {
        Ok(entries) => entries
            .filter(|e| e.is_storage() && e.name().starts_with("__attach_version1.0_#"))
            .map(|e| e.path().to_path_buf())
            .collect(),
        Err(_) => return Vec::new(),
    };

    let mut names: Vec<(PathBuf, String)> = storages
        .into_iter()
        .filter_map(|storage| {
            let name = read_property(file, &storage, ATTACH_LONG_NAME)
                .or_else(|| read_property(file, &storage, ATTACH_SHORT_NAME))?;
            Some((storage, name))
        })
        .collect();
    names.sort();
    names.into_iter().map(|(_, name)| name).collect()
}

/// String property from `storage`, trying the Unicode then the 8-bit stream.
fn read_property<F: Read + Seek>(file: &mut cfb::CompoundFile<F>, storage: &Path, tag: &str) -> Option<String> {
    for (suffix, unicode) in [("001F", true), ("001E", false)] {
        let path = storage.join(format!("__substg1.0_{}{}", tag, suffix));
        let Ok(mut stream) = file.open_stream(&path) else {
            continue;
        };
        let mut raw = Vec::new();
        if stream.read_to_end(&mut raw).is_err() {
            continue;
        }

        let value = if unicode { decode_utf16le(&raw) } else { String::from_utf8_lossy(&raw).into_owned() };
        let value = value.trim_end_matches('\0').trim().to_string();
        if !value.is_empty() {
            return Some(value);
        }
    }
    None
}

fn decode_utf16le(raw: &[u8]) -> String {
    let units: Vec<u16> = raw
        .chunks_exact(2)
        .map(|pair| u16::from_le_bytes([pair[0], pair[1]]))
        .collect();
    String::from_utf16_lossy(&units)
}
