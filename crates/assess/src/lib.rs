pub mod error;
pub mod invoker;
pub mod llm;
pub mod parser;
pub mod prompt;
pub mod retry;
pub mod schema;
pub mod usage;

pub use error::{InvocationError, ParseError};
pub use invoker::ModelInvoker;
pub use llm::{ChatModel, ModelConfig, OllamaClient, OpenAiClient, Provider, RawResponse, build_client};
pub use parser::parse_assessment;
pub use prompt::{AssessmentRequest, ChatMessage, PromptBuilder, Role};
pub use retry::{RetryConfig, RetryPolicy, Sleeper, TokioSleeper};
pub use schema::{Assessment, AssessmentResult, ProcessingStatus, Verdict};
pub use usage::{Usage, UsageSnapshot};

use evidence::{Control, EvidenceBundle};
use tracing::{info, warn};

pub const NO_EVIDENCE_NOTE: &str = "no evidence";

/// Pipeline step reported to the caller while a control is assessed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stage {
    Requesting,
    Parsing,
}

/// Turns one control and its evidence bundle into an assessment result.
pub struct Assessor {
    invoker: ModelInvoker,
    prompts: PromptBuilder,
    corrective_retries: usize,
    assess_without_evidence: bool,
}

impl Assessor {
    pub fn new(invoker: ModelInvoker, prompts: PromptBuilder, corrective_retries: usize) -> Self {
        Self {
            invoker,
            prompts,
            corrective_retries,
            assess_without_evidence: false,
        }
    }

    /// Send empty bundles to the model instead of answering locally.
    pub fn assess_without_evidence(mut self, enabled: bool) -> Self {
        self.assess_without_evidence = enabled;
        self
    }

    pub fn invoker(&self) -> &ModelInvoker {
        &self.invoker
    }

    pub fn prompts(&self) -> &PromptBuilder {
        &self.prompts
    }

    /// Never fails: every outcome, including invocation and parse failures,
    /// is captured in the returned result.
    pub async fn assess(&self, control: &Control, bundle: &EvidenceBundle, on_stage: &(dyn Fn(Stage) + Send + Sync)) -> AssessmentResult {
        let notes = evidence_notes(bundle);

        if bundle.is_empty() && !self.assess_without_evidence {
            info!(control_id = %control.control_id, "No evidence, skipping model call");
            let mut result = no_evidence_result(control, bundle);
            result.notes.extend(notes);
            return result;
        }

        let request = self.prompts.build(control, bundle);
        let mut result = self.request_and_parse(control, bundle, &request, on_stage).await;

        if request.truncated {
            result.notes.push("request cut to fit the request size limit".to_string());
        }
        result.notes.extend(notes);

        if bundle.is_empty() {
            result.notes.insert(0, NO_EVIDENCE_NOTE.to_string());
            if result.verdict == Verdict::Sufficient {
                warn!(control_id = %control.control_id, "Model judged empty evidence sufficient, downgrading");
                result.verdict = Verdict::Insufficient;
                result.notes.push("verdict downgraded: no evidence was provided".to_string());
            }
        }

        result
    }

    async fn request_and_parse(
        &self,
        control: &Control,
        bundle: &EvidenceBundle,
        request: &AssessmentRequest,
        on_stage: &(dyn Fn(Stage) + Send + Sync),
    ) -> AssessmentResult {
        let mut current = request.clone();
        let mut model_calls = 0;
        let mut corrections_left = self.corrective_retries;

        loop {
            on_stage(Stage::Requesting);
            let response = match self.invoker.invoke(&current).await {
                Ok(response) => response,
                Err(e) => {
                    model_calls += attempts_of(&e);
                    warn!(control_id = %control.control_id, error = %e, "Model invocation failed");
                    let mut result = AssessmentResult::failed(control.clone(), e.to_string(), bundle.summary);
                    result.model_calls = model_calls;
                    return result;
                }
            };
            model_calls += response.attempts;

            on_stage(Stage::Parsing);
            match parse_assessment(&response.content) {
                Ok(assessment) => {
                    let mut result = AssessmentResult::from_assessment(control.clone(), assessment, bundle.summary);
                    result.model_calls = model_calls;
                    if current.messages.len() > request.messages.len() {
                        result.notes.push("reply corrected after re-prompt".to_string());
                    }
                    return result;
                }
                Err(e) if corrections_left > 0 => {
                    corrections_left -= 1;
                    warn!(control_id = %control.control_id, error = %e, "Malformed model reply, re-prompting");
                    current = self.prompts.correction(request, &response.content, &e.to_string());
                }
                Err(e) => {
                    warn!(control_id = %control.control_id, error = %e, "Malformed model reply, giving up");
                    let mut result = AssessmentResult::failed(control.clone(), format!("parse failure: {}", e), bundle.summary);
                    result.status = ProcessingStatus::Partial;
                    result.summary = "Model reply could not be parsed into an assessment.".to_string();
                    result.reasoning = response.content.trim().to_string();
                    result.model_calls = model_calls;
                    return result;
                }
            }
        }
    }
}

fn attempts_of(error: &InvocationError) -> usize {
    match error {
        InvocationError::Exhausted { attempts, .. } => *attempts,
        _ => 1,
    }
}

fn no_evidence_result(control: &Control, bundle: &EvidenceBundle) -> AssessmentResult {
    let reasoning = match bundle.summary.total() {
        0 => "No evidence files or sources were found for this control, so operating effectiveness cannot be concluded.".to_string(),
        _ if bundle.summary.omitted > 0 => format!(
            "{} usable evidence sources did not fit the evidence budget, so operating effectiveness cannot be concluded.",
            bundle.summary.omitted
        ),
        n => format!(
            "All {} evidence sources failed extraction, so operating effectiveness cannot be concluded.",
            n
        ),
    };

    AssessmentResult::from_assessment(
        control.clone(),
        Assessment {
            summary: "No evidence provided.".to_string(),
            verdict: Verdict::Insufficient,
            gaps: vec!["No readable evidence was provided for this control.".to_string()],
            reasoning,
        },
        bundle.summary,
    )
    .with_note(NO_EVIDENCE_NOTE)
}

fn evidence_notes(bundle: &EvidenceBundle) -> Vec<String> {
    let s = &bundle.summary;
    let mut notes = Vec::new();
    if s.failed > 0 || s.low_confidence > 0 || s.truncated > 0 || s.omitted > 0 {
        notes.push(format!("evidence quality: {}", s));
    }
    for failure in &bundle.failures {
        notes.push(format!(
            "unreadable: {} ({})",
            failure.source.name,
            failure.detail.as_deref().unwrap_or("extraction failed")
        ));
    }
    notes
}
