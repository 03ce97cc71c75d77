use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// One row of the control sheet. Immutable once loaded.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Control {
    pub risk_id: String,
    pub risk_description: String,
    pub control_id: String,
    pub control_description: String,
    /// Resolved evidence folder, `None` when no folder matched the control id.
    pub evidence_folder: Option<PathBuf>,
}

impl Control {
    pub fn new(
        risk_id: impl Into<String>,
        risk_description: impl Into<String>,
        control_id: impl Into<String>,
        control_description: impl Into<String>,
    ) -> Self {
        Self {
            risk_id: risk_id.into(),
            risk_description: risk_description.into(),
            control_id: control_id.into(),
            control_description: control_description.into(),
            evidence_folder: None,
        }
    }

    pub fn with_evidence_folder(mut self, folder: Option<PathBuf>) -> Self {
        self.evidence_folder = folder;
        self
    }
}
