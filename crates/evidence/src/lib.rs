//! Evidence discovery, text extraction and bundling for control reviews.

pub mod aggregator;
pub mod bundle;
pub mod control;
pub mod error;
pub mod extracted;
pub mod extractors;
pub mod format;
pub mod ocr;
pub mod reader;
pub mod sources;

pub use aggregator::Aggregator;
pub use bundle::{BudgetConfig, EvidenceBundle, QualitySummary};
pub use control::Control;
pub use error::ExtractionError;
pub use extracted::{EvidenceFile, ExtractedText, ExtractionQuality, SourceRef, estimate_tokens, truncate_chars};
pub use extractors::{Extractor, FormatExtractor, RawExtraction};
pub use format::FormatKind;
pub use ocr::{DisabledOcr, OcrConfig, OcrEngine, OcrOutput, TesseractOcr};
pub use reader::{EvidenceReader, sanitize_folder_name};
pub use sources::{EvidenceSource, SourceDocument};
