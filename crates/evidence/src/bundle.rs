use serde::{Deserialize, Serialize};
use std::fmt;

use crate::extracted::{ExtractedText, ExtractionQuality};

/// Size limits for evidence text, in chars.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BudgetConfig {
    pub max_file_chars: usize,
    pub max_bundle_chars: usize,
    /// Hard ceiling for the assembled request (instructions included).
    pub max_request_chars: usize,
    /// A segment that does not fit whole is only cut if at least this much room is left.
    pub min_partial_chars: usize,
}

impl Default for BudgetConfig {
    fn default() -> Self {
        Self {
            max_file_chars: 15_000,
            max_bundle_chars: 160_000,
            max_request_chars: 180_000,
            min_partial_chars: 500,
        }
    }
}

/// Per-quality counts over every source considered for a bundle.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct QualitySummary {
    pub ok: usize,
    pub low_confidence: usize,
    pub failed: usize,
    /// Included segments shortened by the per-file cap or the bundle budget.
    pub truncated: usize,
    /// Usable segments left out because the bundle budget was spent.
    pub omitted: usize,
}

impl QualitySummary {
    pub fn total(&self) -> usize {
        self.ok + self.low_confidence + self.failed
    }

    fn record(&mut self, text: &ExtractedText) {
        match text.quality {
            ExtractionQuality::Ok => self.ok += 1,
            ExtractionQuality::LowConfidence => self.low_confidence += 1,
            ExtractionQuality::Failed => self.failed += 1,
        }
    }
}

impl fmt::Display for QualitySummary {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} ok, {} low-confidence, {} failed, {} truncated, {} omitted",
            self.ok, self.low_confidence, self.failed, self.truncated, self.omitted
        )
    }
}

/// All extracted evidence for one control, in attribution order and within budget.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EvidenceBundle {
    pub control_id: String,
    /// Usable text, each entry attributed to its source.
    pub entries: Vec<ExtractedText>,
    /// Sources that produced no text, with reasons.
    pub failures: Vec<ExtractedText>,
    pub summary: QualitySummary,
    /// True when the bundle budget cut or dropped any segment.
    pub truncated: bool,
}

impl EvidenceBundle {
    /// Pack extraction results, in the given order, so that `render()` stays within
    /// `budget.max_bundle_chars`. Attribution headers, truncation notes, the budget
    /// warning and the unreadable-source list are charged against the budget too.
    /// Whole segments are kept while they fit; the first one that does not is cut
    /// if at least `min_partial_chars` of its text still fit, and everything after it
    /// is omitted.
    pub fn assemble(control_id: impl Into<String>, texts: Vec<ExtractedText>, budget: &BudgetConfig) -> Self {
        let mut summary = QualitySummary::default();
        for text in &texts {
            summary.record(text);
        }
        let (usable, failures): (Vec<_>, Vec<_>) = texts.into_iter().partition(ExtractedText::is_usable);

        let failures_cost = if failures.is_empty() {
            0
        } else {
            render_failures(&failures).chars().count()
        };
        let full_cost: usize = usable.iter().enumerate().map(|(i, t)| entry_cost(i, t)).sum();
        let limit = if full_cost + failures_cost <= budget.max_bundle_chars {
            budget.max_bundle_chars
        } else {
            let warning = budget_warning(usable.len(), usable.len()).chars().count() + 1;
            budget.max_bundle_chars.saturating_sub(failures_cost + warning)
        };

        let mut entries = Vec::new();
        let mut truncated = false;
        let mut used = 0usize;
        let mut exhausted = false;

        for text in usable {
            if exhausted {
                summary.omitted += 1;
                continue;
            }

            let index = entries.len();
            let cost = entry_cost(index, &text);
            if used + cost <= limit {
                used += cost;
                if text.truncated {
                    summary.truncated += 1;
                }
                entries.push(text);
                continue;
            }

            exhausted = true;
            truncated = true;
            let room = (limit - used).saturating_sub(cut_overhead(index, &text));
            if room >= budget.min_partial_chars {
                let mut cut = text.cap(room);
                cut.detail = Some(match cut.detail.take() {
                    Some(note) => format!("{}; cut to fit evidence budget", note),
                    None => "cut to fit evidence budget".to_string(),
                });
                used += entry_cost(index, &cut);
                summary.truncated += 1;
                entries.push(cut);
            } else {
                summary.omitted += 1;
            }
        }

        Self {
            control_id: control_id.into(),
            entries,
            failures,
            summary,
            truncated,
        }
    }

    /// No usable evidence: nothing found, or every extraction failed.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn char_len(&self) -> usize {
        self.entries.iter().map(|e| e.char_len()).sum()
    }

    pub fn estimated_tokens(&self) -> usize {
        self.entries.iter().map(|e| e.estimated_tokens()).sum()
    }

    /// Evidence text with one attribution header per source.
    pub fn render(&self) -> String {
        if self.is_empty() {
            let mut out = match self.summary.total() {
                0 => "[NO EVIDENCE: no evidence files or sources were found for this control]".to_string(),
                _ if self.summary.omitted > 0 => format!(
                    "[NO EVIDENCE: {} usable sources did not fit the evidence budget]",
                    self.summary.omitted
                ),
                n => format!("[NO EVIDENCE: all {} evidence sources failed extraction]", n),
            };
            if !self.failures.is_empty() {
                out.push('\n');
                out.push_str(&render_failures(&self.failures));
            }
            return out;
        }

        let mut out = Vec::new();
        if self.truncated {
            out.push(budget_warning(self.entries.len(), self.entries.len() + self.summary.omitted));
        }

        for (i, entry) in self.entries.iter().enumerate() {
            out.push(entry_header(i, entry));
            out.push(entry.text.clone());
            if entry.truncated {
                out.push(truncation_note(entry.char_len(), entry.original_chars));
            }
            out.push(String::new());
        }

        if !self.failures.is_empty() {
            out.push(render_failures(&self.failures));
        }

        out.join("\n").trim_end().to_string()
    }
}

fn budget_warning(included: usize, usable: usize) -> String {
    format!(
        "[WARNING: Evidence was truncated to fit the size budget. {} of {} usable sources included]\n",
        included, usable
    )
}

fn entry_header(index: usize, entry: &ExtractedText) -> String {
    format!("=== EVIDENCE {}: {} ===", index + 1, header_details(entry))
}

fn truncation_note(shown: usize, original: usize) -> String {
    format!("[TRUNCATED: showing {} of {} chars]", shown, original)
}

/// Chars `render` spends on an entry, separators included.
fn entry_cost(index: usize, entry: &ExtractedText) -> usize {
    let note = if entry.truncated {
        truncation_note(entry.char_len(), entry.original_chars).chars().count() + 1
    } else {
        0
    };
    entry_header(index, entry).chars().count() + entry.char_len() + note + 3
}

/// Upper bound on everything but the text for an entry about to be cut.
fn cut_overhead(index: usize, entry: &ExtractedText) -> usize {
    let note = truncation_note(entry.original_chars, entry.original_chars).chars().count() + 1;
    entry_header(index, entry).chars().count() + note + 3
}

fn render_failures(failures: &[ExtractedText]) -> String {
    let mut lines = vec!["=== UNREADABLE EVIDENCE ===".to_string()];
    for failure in failures {
        lines.push(format!(
            "- {}: {}",
            failure.source.name,
            failure.detail.as_deref().unwrap_or("extraction failed")
        ));
    }
    lines.join("\n")
}

fn header_details(entry: &ExtractedText) -> String {
    let mut details = format!(
        "{} ({}, {} bytes",
        entry.source.name, entry.source.kind, entry.source.size_bytes
    );
    if entry.quality == ExtractionQuality::LowConfidence {
        match entry.confidence {
            Some(c) => details.push_str(&format!(", low-confidence OCR {:.0}%", c * 100.0)),
            None => details.push_str(", low-confidence"),
        }
    }
    details.push(')');
    details
}
