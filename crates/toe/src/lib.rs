pub mod config;
pub mod input;
pub mod orchestrator;
pub mod report;

pub use config::{AppConfig, ConcurrencyConfig, OperationMode};
pub use input::load_controls;
pub use orchestrator::{BatchOrchestrator, BatchRun, CANCELLED_ERROR, ControlState, StatusCounts};
pub use report::{ReportFormat, write_report};

use assess::{Assessor, ChatModel, ModelInvoker, PromptBuilder, RetryPolicy, Usage};
use evidence::{Aggregator, DisabledOcr, EvidenceReader, Extractor, OcrConfig, OcrEngine, TesseractOcr};
use std::sync::Arc;

/// OCR engine for `config`: tesseract when enabled, otherwise one that
/// reports OCR as unavailable.
pub fn ocr_engine(config: &OcrConfig) -> Arc<dyn OcrEngine> {
    if config.enabled {
        Arc::new(TesseractOcr::new(config.clone()))
    } else {
        Arc::new(DisabledOcr)
    }
}

/// Wire the full pipeline from configuration around the given model and OCR engine.
pub fn build_orchestrator(config: &AppConfig, model: Arc<dyn ChatModel>, ocr: Arc<dyn OcrEngine>) -> BatchOrchestrator {
    let extractor = Extractor::with_default_handlers(config.budget.max_file_chars, &config.ocr, ocr);
    let aggregator = Aggregator::new(
        EvidenceReader::new(config.evidence_root.clone()),
        Arc::new(extractor),
        config.budget.clone(),
    );

    let invoker = ModelInvoker::new(
        model,
        RetryPolicy::new(&config.retry),
        config.concurrency.max_concurrent_model_calls,
        config.request_timeout(),
        Usage::new(),
    );
    let assessor = Assessor::new(
        invoker,
        PromptBuilder::new(config.budget.max_request_chars),
        config.retry.corrective_retries,
    )
    .assess_without_evidence(config.assess_without_evidence);

    BatchOrchestrator::new(
        Arc::new(aggregator),
        Arc::new(assessor),
        config.concurrency.max_concurrent_controls,
    )
    .with_batch_timeout(config.batch_timeout())
    .with_token_price(config.usd_per_million_tokens)
}
