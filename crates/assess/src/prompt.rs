use evidence::{Control, EvidenceBundle, QualitySummary, truncate_chars};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

const SYSTEM_PROMPT: &str = "You are an experienced IT and financial controls auditor performing a Test of \
Effectiveness (TOE) review. You judge only from the evidence supplied, cite the evidence files you rely on, \
and answer with a single JSON object and nothing else.";

const OUTPUT_SCHEMA: &str = r#"{
  "summary": "concise description of what the evidence shows, citing evidence files",
  "verdict": "sufficient | insufficient | indeterminate",
  "gaps": ["each specific deficiency between required and observed evidence"],
  "reasoning": "auditor-style reasoning for the verdict"
}"#;

const CRITERIA: &str = "EVALUATION CRITERIA:
- sufficient: the evidence demonstrates the control operated as designed (performance, authorisation, timing, documentation)
- insufficient: the evidence is missing, incomplete or contradicts effective operation
- indeterminate: the evidence cannot support either conclusion (unreadable, ambiguous or off-topic)
- List every gap; use an empty list only when there are none
- Treat sources marked low-confidence OCR with caution";

const NO_EVIDENCE_INSTRUCTION: &str = "NO EVIDENCE WAS PROVIDED for this control. You must not answer \
\"sufficient\". Answer \"insufficient\", state \"no evidence provided\" in the summary, and list the \
evidence that would be needed as gaps.";

const TRUNCATION_MARKER: &str = "\n[REQUEST TRUNCATED: evidence exceeded the maximum request size]";

const DESCRIPTION_MARKER: &str = " [... truncated]";

/// Evidence room kept when risk and control descriptions have to be shortened.
const EVIDENCE_RESERVE: usize = 200;

fn render_head(control: &Control, quality: &QualitySummary, risk_description: &str, control_description: &str) -> String {
    format!(
        "Perform a Test of Effectiveness review of the control below.\n\n\
         RISK ID: {}\nRISK DESCRIPTION: {}\nCONTROL ID: {}\nCONTROL DESCRIPTION: {}\n\n\
         EVIDENCE QUALITY: {}\n\nEVIDENCE PROVIDED:\n",
        control.risk_id, risk_description, control.control_id, control_description, quality,
    )
}

/// Cut `text` to at most `max_chars`, marking the cut when there is room for it.
fn shorten(text: &str, max_chars: usize) -> String {
    let marker = DESCRIPTION_MARKER.chars().count();
    match truncate_chars(text, max_chars) {
        None => text.to_string(),
        Some(_) if max_chars > marker => {
            let cut = truncate_chars(text, max_chars - marker).unwrap_or_default();
            format!("{}{}", cut, DESCRIPTION_MARKER)
        }
        Some(cut) => cut,
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    System,
    User,
    Assistant,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: Role,
    pub content: String,
}

impl ChatMessage {
    pub fn system(content: impl Into<String>) -> Self {
        Self {
            role: Role::System,
            content: content.into(),
        }
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: Role::User,
            content: content.into(),
        }
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self {
            role: Role::Assistant,
            content: content.into(),
        }
    }
}

/// Model-ready request for one control. Identical inputs give identical requests.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AssessmentRequest {
    pub control_id: String,
    pub messages: Vec<ChatMessage>,
    /// Evidence or descriptions were cut to respect the request size ceiling.
    pub truncated: bool,
    pub no_evidence: bool,
    /// SHA-256 over the messages, for comparing runs.
    pub fingerprint: String,
}

impl AssessmentRequest {
    fn new(control_id: String, messages: Vec<ChatMessage>, truncated: bool, no_evidence: bool) -> Self {
        let fingerprint = fingerprint(&messages);
        Self {
            control_id,
            messages,
            truncated,
            no_evidence,
            fingerprint,
        }
    }

    pub fn char_len(&self) -> usize {
        self.messages.iter().map(|m| m.content.chars().count()).sum()
    }
}

fn fingerprint(messages: &[ChatMessage]) -> String {
    let mut hasher = Sha256::new();
    for message in messages {
        hasher.update(format!("{:?}", message.role).as_bytes());
        hasher.update([0u8]);
        hasher.update(message.content.as_bytes());
        hasher.update([0u8]);
    }
    hex::encode(&hasher.finalize()[..16])
}

/// Assembles assessment requests from a fixed template.
#[derive(Debug, Clone)]
pub struct PromptBuilder {
    max_request_chars: usize,
}

impl PromptBuilder {
    pub fn new(max_request_chars: usize) -> Self {
        Self { max_request_chars }
    }

    pub fn build(&self, control: &Control, bundle: &EvidenceBundle) -> AssessmentRequest {
        let no_evidence = bundle.is_empty();

        let mut tail = String::from("\n\n");
        if no_evidence {
            tail.push_str(NO_EVIDENCE_INSTRUCTION);
            tail.push_str("\n\n");
        }
        tail.push_str(CRITERIA);
        tail.push_str("\n\nRespond with exactly one JSON object in this format:\n");
        tail.push_str(OUTPUT_SCHEMA);

        let evidence = bundle.render();
        let template = SYSTEM_PROMPT.chars().count()
            + render_head(control, &bundle.summary, "", "").chars().count()
            + tail.chars().count();

        // Descriptions give way first when the template alone overflows the ceiling.
        let reserve = evidence.chars().count().min(EVIDENCE_RESERVE);
        let descriptions = self.max_request_chars.saturating_sub(template + reserve);
        let risk_len = control.risk_description.chars().count();
        let control_len = control.control_description.chars().count();
        let mut truncated = false;

        let head = if risk_len + control_len > descriptions {
            truncated = true;
            let control_share = control_len.min(descriptions - risk_len.min(descriptions / 2));
            let risk_share = descriptions - control_share;
            render_head(
                control,
                &bundle.summary,
                &shorten(&control.risk_description, risk_share),
                &shorten(&control.control_description, control_share),
            )
        } else {
            render_head(
                control,
                &bundle.summary,
                &control.risk_description,
                &control.control_description,
            )
        };

        let fixed = SYSTEM_PROMPT.chars().count() + head.chars().count() + tail.chars().count();
        let available = self.max_request_chars.saturating_sub(fixed);

        let evidence = if evidence.chars().count() > available {
            truncated = true;
            let keep = available.saturating_sub(TRUNCATION_MARKER.chars().count());
            let cut = truncate_chars(&evidence, keep).unwrap_or_default();
            format!("{}{}", cut, TRUNCATION_MARKER)
        } else {
            evidence
        };

        let mut system = SYSTEM_PROMPT.to_string();
        let mut user = format!("{}{}{}", head, evidence, tail);
        // Identifiers and the quality line are never shortened above, so clamp as a last resort.
        if let Some(cut) = truncate_chars(&system, self.max_request_chars) {
            system = cut;
            truncated = true;
        }
        let room = self.max_request_chars - system.chars().count();
        if let Some(cut) = truncate_chars(&user, room) {
            user = cut;
            truncated = true;
        }

        AssessmentRequest::new(
            control.control_id.clone(),
            vec![ChatMessage::system(system), ChatMessage::user(user)],
            truncated,
            no_evidence,
        )
    }

    /// Re-prompt after a reply that failed validation.
    pub fn correction(&self, original: &AssessmentRequest, reply: &str, problem: &str) -> AssessmentRequest {
        let mut messages = original.messages.clone();
        messages.push(ChatMessage::assistant(reply));
        messages.push(ChatMessage::user(format!(
            "Your previous reply could not be used: {}.\n\n\
             Reply again with exactly one JSON object in this format, with no markdown, no code blocks \
             and no explanations. The verdict must be exactly one of sufficient, insufficient, indeterminate.\n{}",
            problem, OUTPUT_SCHEMA
        )));
        AssessmentRequest::new(original.control_id.clone(), messages, original.truncated, original.no_evidence)
    }

    /// Minimal request for checking connectivity.
    pub fn ping(&self) -> AssessmentRequest {
        AssessmentRequest::new(
            "ping".to_string(),
            vec![
                ChatMessage::system("You are a connectivity check. Answer with a JSON object."),
                ChatMessage::user(r#"Reply with {"status": "ok"}"#),
            ],
            false,
            false,
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use evidence::{BudgetConfig, ExtractedText, ExtractionQuality, FormatKind, SourceRef};

    fn control() -> Control {
        Control::new("R-01", "Unauthorised payments", "C001", "Payments above 10k require CFO approval")
    }

    fn bundle(texts: Vec<(&str, &str)>) -> EvidenceBundle {
        let texts = texts
            .into_iter()
            .map(|(name, body)| {
                let source = SourceRef {
                    id: name.to_string(),
                    name: name.to_string(),
                    kind: FormatKind::PlainText,
                    size_bytes: body.len() as u64,
                };
                ExtractedText::new(source, body.to_string(), ExtractionQuality::Ok)
            })
            .collect();
        EvidenceBundle::assemble("C001", texts, &BudgetConfig::default())
    }

    #[test]
    fn embeds_control_and_attributed_evidence() {
        let request = PromptBuilder::new(180_000).build(&control(), &bundle(vec![("approval.txt", "Signed by CFO")]));

        assert_eq!(request.messages.len(), 2);
        let user = &request.messages[1].content;
        assert!(user.contains("CONTROL ID: C001"));
        assert!(user.contains("CONTROL DESCRIPTION: Payments above 10k require CFO approval"));
        assert!(user.contains("=== EVIDENCE 1: approval.txt"));
        assert!(user.contains("Signed by CFO"));
        assert!(user.contains("\"verdict\""));
        assert!(!request.no_evidence);
        assert!(!request.truncated);
    }

    #[test]
    fn empty_bundle_takes_no_evidence_path() {
        let request = PromptBuilder::new(180_000).build(&control(), &bundle(vec![]));
        assert!(request.no_evidence);
        assert!(request.messages[1].content.contains("NO EVIDENCE WAS PROVIDED"));
        assert!(request.messages[1].content.contains("EVIDENCE PROVIDED:\n[NO EVIDENCE"));
    }

    #[test]
    fn oversize_request_is_hard_truncated() {
        let big = "x".repeat(10_000);
        let builder = PromptBuilder::new(4_000);
        let request = builder.build(&control(), &bundle(vec![("dump.txt", &big)]));

        assert!(request.truncated);
        assert!(request.char_len() <= 4_000);
        assert!(request.messages[1].content.contains("[REQUEST TRUNCATED"));
        assert!(request.messages[1].content.ends_with(OUTPUT_SCHEMA));
    }

    #[test]
    fn long_descriptions_are_shortened_to_fit() {
        let control = Control::new("R-01", "Unauthorised payments", "C001", "approve ".repeat(625));
        let builder = PromptBuilder::new(4_000);
        let request = builder.build(&control, &bundle(vec![]));

        assert!(request.truncated);
        assert!(request.no_evidence);
        assert!(request.char_len() <= 4_000);
        let user = &request.messages[1].content;
        assert!(user.contains("RISK DESCRIPTION: Unauthorised payments\n"));
        assert!(user.contains(DESCRIPTION_MARKER));
        assert!(user.contains("EVIDENCE PROVIDED:\n[NO EVIDENCE"));
        assert!(user.ends_with(OUTPUT_SCHEMA));
    }

    #[test]
    fn request_never_exceeds_a_tiny_ceiling() {
        let control = Control::new("R".repeat(500), "r".repeat(500), "C001", "c".repeat(500));
        for max in [0, 50, 300, 1_000] {
            let request = PromptBuilder::new(max).build(&control, &bundle(vec![("a.txt", "one")]));
            assert!(request.char_len() <= max, "ceiling {max}");
            assert!(request.truncated);
        }
    }

    #[test]
    fn identical_inputs_give_identical_requests() {
        let builder = PromptBuilder::new(180_000);
        let a = builder.build(&control(), &bundle(vec![("a.txt", "one"), ("b.txt", "two")]));
        let b = builder.build(&control(), &bundle(vec![("a.txt", "one"), ("b.txt", "two")]));
        assert_eq!(a, b);
        assert_eq!(a.fingerprint.len(), 32);

        let c = builder.build(&control(), &bundle(vec![("b.txt", "two"), ("a.txt", "one")]));
        assert_ne!(a.fingerprint, c.fingerprint);
    }

    #[test]
    fn correction_replays_previous_reply() {
        let builder = PromptBuilder::new(180_000);
        let original = builder.build(&control(), &bundle(vec![("a.txt", "one")]));
        let retry = builder.correction(&original, "VERDICT: yes", "reply contains no JSON object");

        assert_eq!(retry.messages.len(), 4);
        assert_eq!(retry.messages[2], ChatMessage::assistant("VERDICT: yes"));
        assert!(retry.messages[3].content.contains("reply contains no JSON object"));
        assert_ne!(retry.fingerprint, original.fingerprint);
    }
}
