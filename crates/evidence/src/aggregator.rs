use std::sync::Arc;
use tracing::{debug, info, warn};

use crate::bundle::{BudgetConfig, EvidenceBundle};
use crate::control::Control;
use crate::extracted::ExtractedText;
use crate::extractors::Extractor;
use crate::reader::EvidenceReader;
use crate::sources::{EvidenceSource, collect_from_source};

/// Gathers every piece of evidence for a control into one bounded bundle.
pub struct Aggregator {
    reader: EvidenceReader,
    extractor: Arc<Extractor>,
    sources: Vec<Arc<dyn EvidenceSource>>,
    budget: BudgetConfig,
}

impl Aggregator {
    pub fn new(reader: EvidenceReader, extractor: Arc<Extractor>, budget: BudgetConfig) -> Self {
        Self {
            reader,
            extractor,
            sources: Vec::new(),
            budget,
        }
    }

    pub fn with_source(mut self, source: Arc<dyn EvidenceSource>) -> Self {
        self.sources.push(source);
        self
    }

    pub fn budget(&self) -> &BudgetConfig {
        &self.budget
    }

    /// Build the bundle for `control`. A missing folder or failing files
    /// yield a smaller (possibly empty) bundle, never an error.
    pub async fn aggregate(&self, control: &Control) -> EvidenceBundle {
        let mut texts: Vec<ExtractedText> = Vec::new();

        for source in &self.sources {
            texts.extend(collect_from_source(source.as_ref(), control, self.budget.max_file_chars).await);
        }

        let folder = control
            .evidence_folder
            .clone()
            .or_else(|| self.reader.resolve_folder(&control.control_id));

        match &folder {
            Some(folder) => match self.reader.list_files(folder).await {
                Ok(files) => {
                    debug!(control_id = %control.control_id, files = files.len(), "Discovered evidence files");
                    for file in &files {
                        texts.push(self.extractor.extract(file).await);
                    }
                }
                Err(e) => {
                    warn!(control_id = %control.control_id, folder = %folder.display(), error = %e, "Evidence folder unreadable");
                }
            },
            None => {
                debug!(control_id = %control.control_id, root = %self.reader.root().display(), "No evidence folder");
            }
        }

        let bundle = EvidenceBundle::assemble(&control.control_id, texts, &self.budget);

        info!(
            control_id = %control.control_id,
            included = bundle.entries.len(),
            chars = bundle.char_len(),
            est_tokens = bundle.estimated_tokens(),
            quality = %bundle.summary,
            "Evidence aggregated"
        );

        bundle
    }
}
