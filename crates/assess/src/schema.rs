use evidence::{Control, QualitySummary};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::error::ParseError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Verdict {
    Sufficient,
    Insufficient,
    Indeterminate,
}

impl Verdict {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Sufficient => "sufficient",
            Self::Insufficient => "insufficient",
            Self::Indeterminate => "indeterminate",
        }
    }
}

impl FromStr for Verdict {
    type Err = ParseError;

    /// Exact match, case-insensitive. Anything else is rejected rather than guessed.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "sufficient" => Ok(Self::Sufficient),
            "insufficient" => Ok(Self::Insufficient),
            "indeterminate" => Ok(Self::Indeterminate),
            _ => Err(ParseError::UnknownVerdict(s.to_string())),
        }
    }
}

impl fmt::Display for Verdict {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProcessingStatus {
    Success,
    Partial,
    Failed,
}

impl ProcessingStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Success => "success",
            Self::Partial => "partial",
            Self::Failed => "failed",
        }
    }
}

impl fmt::Display for ProcessingStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A schema-valid model reply.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Assessment {
    pub summary: String,
    pub verdict: Verdict,
    pub gaps: Vec<String>,
    pub reasoning: String,
}

/// Outcome for one control; one row of the report.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AssessmentResult {
    pub control: Control,
    pub summary: String,
    pub verdict: Verdict,
    pub gaps: Vec<String>,
    pub reasoning: String,
    pub status: ProcessingStatus,
    /// Set for any non-success outcome.
    pub error: Option<String>,
    /// Processing notes: evidence quality, truncation, downgrades.
    pub notes: Vec<String>,
    pub evidence: QualitySummary,
    /// Model calls made for this control, retries included.
    pub model_calls: usize,
}

impl AssessmentResult {
    pub fn from_assessment(control: Control, assessment: Assessment, evidence: QualitySummary) -> Self {
        Self {
            control,
            summary: assessment.summary,
            verdict: assessment.verdict,
            gaps: assessment.gaps,
            reasoning: assessment.reasoning,
            status: ProcessingStatus::Success,
            error: None,
            notes: Vec::new(),
            evidence,
            model_calls: 0,
        }
    }

    /// Terminal failure; the verdict is never left positive.
    pub fn failed(control: Control, error: impl Into<String>, evidence: QualitySummary) -> Self {
        Self {
            control,
            summary: String::new(),
            verdict: Verdict::Indeterminate,
            gaps: Vec::new(),
            reasoning: String::new(),
            status: ProcessingStatus::Failed,
            error: Some(error.into()),
            notes: Vec::new(),
            evidence,
            model_calls: 0,
        }
    }

    pub fn with_note(mut self, note: impl Into<String>) -> Self {
        self.notes.push(note.into());
        self
    }
}
