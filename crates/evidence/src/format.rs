use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::Path;

/// Format family of an evidence document. Selects the extractor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FormatKind {
    PlainText,
    Pdf,
    Word,
    Spreadsheet,
    Email,
    Mailbox,
    OutlookMessage,
    Image,
    /// Text supplied by an evidence source rather than a file.
    External,
    Unsupported,
}

impl FormatKind {
    pub fn from_extension(ext: &str) -> Self {
        match ext.to_ascii_lowercase().as_str() {
            "txt" | "md" | "log" | "csv" | "json" => Self::PlainText,
            "pdf" => Self::Pdf,
            "docx" => Self::Word,
            "xlsx" | "xlsm" | "xls" | "ods" => Self::Spreadsheet,
            "eml" => Self::Email,
            "mbox" => Self::Mailbox,
            "msg" => Self::OutlookMessage,
            "png" | "jpg" | "jpeg" | "tif" | "tiff" | "bmp" | "gif" => Self::Image,
            _ => Self::Unsupported,
        }
    }

    /// Detect by extension, then by content signature for unknown extensions.
    pub fn detect(path: &Path, head: &[u8]) -> Self {
        let by_ext = path
            .extension()
            .and_then(|e| e.to_str())
            .map(Self::from_extension)
            .unwrap_or(Self::Unsupported);

        if by_ext != Self::Unsupported {
            return by_ext;
        }

        Self::sniff(head)
    }

    fn sniff(head: &[u8]) -> Self {
        let Some(kind) = infer::get(head) else {
            return Self::Unsupported;
        };

        match kind.mime_type() {
            "application/pdf" => Self::Pdf,
            "application/vnd.openxmlformats-officedocument.wordprocessingml.document" => Self::Word,
            "application/vnd.openxmlformats-officedocument.spreadsheetml.sheet"
            | "application/vnd.ms-excel"
            | "application/vnd.oasis.opendocument.spreadsheet" => Self::Spreadsheet,
            "message/rfc822" => Self::Email,
            "image/png" | "image/jpeg" | "image/tiff" | "image/bmp" | "image/gif" => Self::Image,
            _ => Self::Unsupported,
        }
    }

    pub fn label(&self) -> &'static str {
        match self {
            Self::PlainText => "text",
            Self::Pdf => "pdf",
            Self::Word => "word",
            Self::Spreadsheet => "spreadsheet",
            Self::Email => "email",
            Self::Mailbox => "mailbox",
            Self::OutlookMessage => "outlook message",
            Self::Image => "image",
            Self::External => "external",
            Self::Unsupported => "unsupported",
        }
    }
}

impl fmt::Display for FormatKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn extension_dispatch_is_case_insensitive() {
        assert_eq!(FormatKind::detect(Path::new("a/Approval.PDF"), b""), FormatKind::Pdf);
        assert_eq!(FormatKind::detect(Path::new("scan.JPG"), b""), FormatKind::Image);
        assert_eq!(FormatKind::detect(Path::new("mail.msg"), b""), FormatKind::OutlookMessage);
        assert_eq!(FormatKind::detect(Path::new("book.xls"), b""), FormatKind::Spreadsheet);
    }

    #[test]
    fn unknown_extension_is_sniffed() {
        let png_magic = [0x89, b'P', b'N', b'G', 0x0D, 0x0A, 0x1A, 0x0A, 0, 0, 0, 0];
        assert_eq!(FormatKind::detect(Path::new("scan.dat"), &png_magic), FormatKind::Image);
        assert_eq!(FormatKind::detect(Path::new("blob.bin"), b"\x00\x01\x02"), FormatKind::Unsupported);
    }
}
