use thiserror::Error;

#[derive(Error, Debug)]
pub enum ExtractionError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("unsupported format: {0}")]
    Unsupported(String),

    #[error("could not parse {format} document: {message}")]
    Corrupt { format: &'static str, message: String },

    #[error("OCR failed: {0}")]
    Ocr(String),

    #[error("OCR unavailable: {0}")]
    OcrUnavailable(String),

    #[error("document contains no extractable text")]
    Empty,

    #[error("evidence source '{source_name}' failed: {message}")]
    Source { source_name: String, message: String },
}

impl ExtractionError {
    pub fn corrupt(format: &'static str, err: impl std::fmt::Display) -> Self {
        Self::Corrupt {
            format,
            message: err.to_string(),
        }
    }
}
