use serde_json::{Deserializer, Map, Value};

use crate::error::ParseError;
use crate::schema::{Assessment, Verdict};

/// First complete JSON value starting at a `{`, ignoring prose or code fences around
/// it and anything after it. Later `{` are tried when an earlier one does not parse.
fn first_json_object(raw: &str) -> Result<Value, ParseError> {
    let mut first_error = None;
    for (start, _) in raw.match_indices('{') {
        match Deserializer::from_str(&raw[start..]).into_iter::<Value>().next() {
            Some(Ok(value)) => return Ok(value),
            Some(Err(e)) => {
                first_error.get_or_insert_with(|| e.to_string());
            }
            None => {}
        }
    }
    match first_error {
        Some(e) => Err(ParseError::InvalidJson(e)),
        None => Err(ParseError::NoJson),
    }
}

/// Validate a model reply against the assessment schema.
pub fn parse_assessment(raw: &str) -> Result<Assessment, ParseError> {
    let value = first_json_object(raw)?;
    let object = value.as_object().ok_or(ParseError::NotAnObject)?;

    let summary = required_text(object, "summary")?;
    let verdict: Verdict = required_str(object, "verdict")?.parse()?;
    let gaps = gaps(object)?;
    let reasoning = required_text(object, "reasoning")?;

    Ok(Assessment {
        summary,
        verdict,
        gaps,
        reasoning,
    })
}

fn required_str<'a>(object: &'a Map<String, Value>, field: &'static str) -> Result<&'a str, ParseError> {
    match object.get(field) {
        None | Some(Value::Null) => Err(ParseError::MissingField(field)),
        Some(Value::String(s)) => Ok(s.as_str()),
        Some(_) => Err(ParseError::WrongType {
            field,
            expected: "a string",
        }),
    }
}

fn required_text(object: &Map<String, Value>, field: &'static str) -> Result<String, ParseError> {
    let text = required_str(object, field)?.trim();
    if text.is_empty() {
        return Err(ParseError::EmptyField(field));
    }
    Ok(text.to_string())
}

fn gaps(object: &Map<String, Value>) -> Result<Vec<String>, ParseError> {
    let wrong_type = ParseError::WrongType {
        field: "gaps",
        expected: "a list of strings",
    };

    match object.get("gaps") {
        None | Some(Value::Null) => Err(ParseError::MissingField("gaps")),
        Some(Value::Array(items)) => items
            .iter()
            .filter_map(|item| match item {
                Value::String(s) if s.trim().is_empty() => None,
                Value::String(s) => Some(Ok(s.trim().to_string())),
                _ => Some(Err(wrong_type.clone())),
            })
            .collect(),
        Some(_) => Err(wrong_type),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_valid_reply() {
        let raw = r#"{"summary": "CFO approval present for all sampled payments",
                      "verdict": "sufficient",
                      "gaps": [],
                      "reasoning": "Each payment over 10k carries a dated CFO signature."}"#;
        let assessment = parse_assessment(raw).unwrap();
        assert_eq!(assessment.verdict, Verdict::Sufficient);
        assert!(assessment.gaps.is_empty());
        assert!(assessment.summary.starts_with("CFO approval"));
    }

    #[test]
    fn tolerates_code_fences_and_prose() {
        let raw = "Here is my assessment:\n```json\n{\"summary\": \"s\", \"verdict\": \"Insufficient\", \"gaps\": [\"no sign-off\", \"  \"], \"reasoning\": \"r\"}\n```";
        let assessment = parse_assessment(raw).unwrap();
        assert_eq!(assessment.verdict, Verdict::Insufficient);
        assert_eq!(assessment.gaps, vec!["no sign-off".to_string()]);
    }

    #[test]
    fn ignores_braces_after_the_object() {
        let raw = r#"{"summary": "s", "verdict": "sufficient", "gaps": [], "reasoning": "r"} Note: see {appendix}"#;
        assert_eq!(parse_assessment(raw).unwrap().verdict, Verdict::Sufficient);

        let raw = r#"Checked {file A}. {"summary": "s", "verdict": "indeterminate", "gaps": [], "reasoning": "r"}"#;
        assert_eq!(parse_assessment(raw).unwrap().verdict, Verdict::Indeterminate);
    }

    #[test]
    fn rejects_missing_and_empty_fields() {
        assert_eq!(
            parse_assessment(r#"{"verdict": "sufficient", "gaps": [], "reasoning": "r"}"#),
            Err(ParseError::MissingField("summary"))
        );
        assert_eq!(
            parse_assessment(r#"{"summary": "  ", "verdict": "sufficient", "gaps": [], "reasoning": "r"}"#),
            Err(ParseError::EmptyField("summary"))
        );
        assert_eq!(
            parse_assessment(r#"{"summary": "s", "verdict": "sufficient", "reasoning": "r"}"#),
            Err(ParseError::MissingField("gaps"))
        );
    }

    #[test]
    fn unknown_verdict_is_rejected_not_defaulted() {
        let err = parse_assessment(r#"{"summary": "s", "verdict": "YES", "gaps": [], "reasoning": "r"}"#).unwrap_err();
        assert_eq!(err, ParseError::UnknownVerdict("YES".to_string()));

        let err = parse_assessment(r#"{"summary": "s", "verdict": true, "gaps": [], "reasoning": "r"}"#).unwrap_err();
        assert!(matches!(err, ParseError::WrongType { field: "verdict", .. }));
    }

    #[test]
    fn rejects_non_json() {
        assert_eq!(parse_assessment("CONCLUSION: YES"), Err(ParseError::NoJson));
        assert!(matches!(parse_assessment("{not json}"), Err(ParseError::InvalidJson(_))));
    }

    #[test]
    fn gaps_must_be_strings() {
        let err = parse_assessment(r#"{"summary": "s", "verdict": "insufficient", "gaps": [1, 2], "reasoning": "r"}"#).unwrap_err();
        assert!(matches!(err, ParseError::WrongType { field: "gaps", .. }));
    }
}
