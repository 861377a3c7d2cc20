//! Raw model text → validated classification.
//!
//! Clamp, don't reject: out-of-range or malformed fields are bounded and
//! recorded as `FieldAdjustment`s. Only a missing JSON span, JSON that stays
//! unparseable after one repair pass, or a missing `responsive` verdict is a
//! hard failure.

use std::collections::BTreeSet;
use std::sync::LazyLock;

use regex::Regex;
use serde::Serialize;
use serde_json::{Map, Value};
use thiserror::Error;

use crate::models::enums::FailureKind;

pub const MAX_REASON_CHARS: usize = 200;
pub const DEFAULT_REASON: &str = "No reason provided";

/// A validated model verdict.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ParsedClassification {
    pub responsive: bool,
    pub confidence: f64,
    pub reason: String,
    pub labels: BTreeSet<String>,
    pub adjustments: Vec<FieldAdjustment>,
    /// True when the JSON only parsed after the repair pass.
    pub repaired: bool,
}

/// A field value that was coerced or bounded instead of rejected.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "field", rename_all = "snake_case")]
pub enum FieldAdjustment {
    ResponsiveCoerced { raw: String },
    ConfidenceClamped { raw: f64 },
    ConfidenceFromText { raw: String },
    ConfidenceDefaulted,
    ReasonTruncated { original_chars: usize },
    ReasonDefaulted,
    LabelsDiscarded,
}

#[derive(Error, Debug, Clone, PartialEq)]
pub enum ParseFailure {
    #[error("No JSON object found in model output")]
    NoJsonFound,

    #[error("Model output is not valid JSON after repair: {0}")]
    InvalidJson(String),

    #[error("Model output violates the result schema: {0}")]
    SchemaViolation(String),
}

impl ParseFailure {
    pub fn kind(&self) -> FailureKind {
        match self {
            Self::NoJsonFound => FailureKind::NoJsonFound,
            Self::InvalidJson(_) => FailureKind::InvalidJson,
            Self::SchemaViolation(_) => FailureKind::SchemaViolation,
        }
    }
}

/// Parse one model response.
pub fn parse_response(raw: &str) -> Result<ParsedClassification, ParseFailure> {
    let text = strip_reasoning(raw);
    let candidates = json_candidates(&text);
    if candidates.is_empty() {
        return Err(ParseFailure::NoJsonFound);
    }

    // The first span that validates wins; model output often echoes an
    // example object before the verdict.
    let mut syntax_error = None;
    let mut schema_error = None;
    for span in &candidates {
        match serde_json::from_str::<Value>(span) {
            Ok(value) => match validate(value, false) {
                Ok(parsed) => return Ok(parsed),
                Err(failure) => {
                    schema_error.get_or_insert(failure);
                }
            },
            Err(e) => {
                syntax_error.get_or_insert_with(|| e.to_string());
            }
        }
    }

    for span in &candidates {
        let repaired = repair(span);
        if repaired == *span {
            continue;
        }
        if let Ok(value) = serde_json::from_str::<Value>(&repaired) {
            match validate(value, true) {
                Ok(parsed) => {
                    tracing::warn!("Model output needed JSON repair");
                    return Ok(parsed);
                }
                Err(failure) => {
                    schema_error.get_or_insert(failure);
                }
            }
        }
    }

    Err(schema_error.unwrap_or_else(|| ParseFailure::InvalidJson(syntax_error.unwrap_or_default())))
}

// ═══════════════════════════════════════════════════════════
// Span location
// ═══════════════════════════════════════════════════════════

/// Remove `<think>…</think>` reasoning blocks and stray tokenizer artifacts.
fn strip_reasoning(raw: &str) -> String {
    static THINK_BLOCK_RE: LazyLock<Regex> =
        LazyLock::new(|| Regex::new(r"(?is)<think>.*?</think>").expect("valid regex"));
    static STRAY_TAG_RE: LazyLock<Regex> =
        LazyLock::new(|| Regex::new(r"(?i)</?think>|<unused\d+>").expect("valid regex"));

    let text = THINK_BLOCK_RE.replace_all(raw, "");
    STRAY_TAG_RE.replace_all(&text, "").trim().to_string()
}

/// Every top-level `{…}` span in order. A final span that never closes
/// (truncated output) runs to the end of the text.
fn json_candidates(text: &str) -> Vec<&str> {
    let mut spans = Vec::new();
    let mut depth = 0usize;
    let mut start = None;
    let mut in_string = false;
    let mut escaped = false;

    for (i, ch) in text.char_indices() {
        if in_string {
            if escaped {
                escaped = false;
            } else if ch == '\\' {
                escaped = true;
            } else if ch == '"' {
                in_string = false;
            }
            continue;
        }
        match ch {
            '"' if depth > 0 => in_string = true,
            '{' => {
                if depth == 0 {
                    start = Some(i);
                }
                depth += 1;
            }
            '}' if depth > 0 => {
                depth -= 1;
                if depth == 0 {
                    if let Some(s) = start.take() {
                        spans.push(&text[s..=i]);
                    }
                }
            }
            _ => {}
        }
    }

    if let Some(s) = start {
        spans.push(&text[s..]);
    }
    spans
}

// ═══════════════════════════════════════════════════════════
// Repair
// ═══════════════════════════════════════════════════════════

/// One deterministic repair pass: typographic quotes, single-quoted JSON,
/// trailing commas, then closing whatever truncation left open.
fn repair(span: &str) -> String {
    static TRAILING_COMMA_RE: LazyLock<Regex> =
        LazyLock::new(|| Regex::new(r",(\s*[}\]])").expect("valid regex"));
    static SINGLE_QUOTED_RE: LazyLock<Regex> =
        LazyLock::new(|| Regex::new(r"'([^']*)'").expect("valid regex"));

    let mut text: String = span
        .chars()
        .map(|c| match c {
            '\u{201C}' | '\u{201D}' | '\u{201E}' | '\u{201F}' | '\u{2033}' => '"',
            '\u{2018}' | '\u{2019}' | '\u{201A}' | '\u{201B}' | '\u{2032}' => '\'',
            other => other,
        })
        .collect();

    if !text.contains('"') {
        text = SINGLE_QUOTED_RE.replace_all(&text, "\"$1\"").into_owned();
    }

    let closed = close_truncated(&text);
    TRAILING_COMMA_RE.replace_all(&closed, "$1").into_owned()
}

/// Close an unterminated string and any brackets left open.
fn close_truncated(text: &str) -> String {
    let mut stack = Vec::new();
    let mut in_string = false;
    let mut escaped = false;

    for ch in text.chars() {
        if in_string {
            if escaped {
                escaped = false;
            } else if ch == '\\' {
                escaped = true;
            } else if ch == '"' {
                in_string = false;
            }
            continue;
        }
        match ch {
            '"' => in_string = true,
            '{' => stack.push('}'),
            '[' => stack.push(']'),
            '}' | ']' => {
                stack.pop();
            }
            _ => {}
        }
    }

    if stack.is_empty() && !in_string {
        return text.to_string();
    }

    let mut out = text.to_string();
    if in_string {
        if escaped {
            out.pop();
        }
        out.push('"');
    }
    let trimmed_len = out.trim_end().len();
    out.truncate(trimmed_len);
    if out.ends_with(':') {
        out.push_str(" null");
    }
    while let Some(close) = stack.pop() {
        out.push(close);
    }
    out
}

// ═══════════════════════════════════════════════════════════
// Field validation
// ═══════════════════════════════════════════════════════════

fn validate(value: Value, repaired: bool) -> Result<ParsedClassification, ParseFailure> {
    let Value::Object(obj) = value else {
        return Err(ParseFailure::SchemaViolation("top-level value is not an object".into()));
    };
    let mut adjustments = Vec::new();

    let responsive = coerce_responsive(&obj, &mut adjustments)?;
    let confidence = coerce_confidence(obj.get("confidence"), &mut adjustments);
    let reason = coerce_reason(obj.get("reason"), &mut adjustments);
    let labels = coerce_labels(obj.get("labels"), &mut adjustments);

    Ok(ParsedClassification {
        responsive,
        confidence,
        reason,
        labels,
        adjustments,
        repaired,
    })
}

fn coerce_responsive(obj: &Map<String, Value>, adjustments: &mut Vec<FieldAdjustment>) -> Result<bool, ParseFailure> {
    let raw = match obj.get("responsive") {
        None | Some(Value::Null) => {
            return Err(ParseFailure::SchemaViolation("missing 'responsive'".into()));
        }
        Some(Value::Bool(b)) => return Ok(*b),
        Some(v) => v,
    };

    let coerced = match raw {
        Value::Number(n) => n.as_f64().map(|f| f != 0.0),
        Value::String(s) => match s.trim().to_ascii_lowercase().as_str() {
            "true" | "yes" | "y" | "1" | "responsive" => Some(true),
            "false" | "no" | "n" | "0" | "non-responsive" | "non_responsive" | "not responsive" => Some(false),
            _ => None,
        },
        _ => None,
    };

    match coerced {
        Some(b) => {
            adjustments.push(FieldAdjustment::ResponsiveCoerced { raw: raw.to_string() });
            Ok(b)
        }
        None => Err(ParseFailure::SchemaViolation(format!(
            "'responsive' is not a boolean: {raw}"
        ))),
    }
}

fn coerce_confidence(raw: Option<&Value>, adjustments: &mut Vec<FieldAdjustment>) -> f64 {
    let parsed = match raw {
        Some(Value::Number(n)) => n.as_f64(),
        Some(Value::String(s)) => {
            let trimmed = s.trim();
            let value = match trimmed.strip_suffix('%') {
                Some(pct) => pct.trim().parse::<f64>().ok().map(|v| v / 100.0),
                None => trimmed.parse::<f64>().ok(),
            };
            if value.is_some() {
                adjustments.push(FieldAdjustment::ConfidenceFromText { raw: s.clone() });
            }
            value
        }
        _ => None,
    };

    match parsed.filter(|v| v.is_finite()) {
        Some(v) if (0.0..=1.0).contains(&v) => v,
        Some(v) => {
            adjustments.push(FieldAdjustment::ConfidenceClamped { raw: v });
            v.clamp(0.0, 1.0)
        }
        None => {
            adjustments.push(FieldAdjustment::ConfidenceDefaulted);
            0.0
        }
    }
}

fn coerce_reason(raw: Option<&Value>, adjustments: &mut Vec<FieldAdjustment>) -> String {
    let text = match raw {
        Some(Value::String(s)) => s.trim().to_string(),
        Some(Value::Null) | None => String::new(),
        Some(other) => other.to_string(),
    };
    if text.is_empty() {
        adjustments.push(FieldAdjustment::ReasonDefaulted);
        return DEFAULT_REASON.to_string();
    }

    let chars = text.chars().count();
    if chars <= MAX_REASON_CHARS {
        return text;
    }
    adjustments.push(FieldAdjustment::ReasonTruncated { original_chars: chars });
    let mut cut: String = text.chars().take(MAX_REASON_CHARS - 3).collect();
    cut.push_str("...");
    cut
}

fn coerce_labels(raw: Option<&Value>, adjustments: &mut Vec<FieldAdjustment>) -> BTreeSet<String> {
    let items = match raw {
        None | Some(Value::Null) => return BTreeSet::new(),
        Some(Value::Array(items)) => items,
        Some(_) => {
            adjustments.push(FieldAdjustment::LabelsDiscarded);
            return BTreeSet::new();
        }
    };

    let mut labels = BTreeSet::new();
    for item in items {
        let Value::String(s) = item else {
            adjustments.push(FieldAdjustment::LabelsDiscarded);
            return BTreeSet::new();
        };
        let label = s.trim();
        if !label.is_empty() {
            labels.insert(label.to_string());
        }
    }
    labels
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_clean_json() {
        let parsed = parse_response(
            r#"{"responsive": true, "confidence": 0.92, "reason": "Mold remediation at Lincoln Elementary", "labels": ["mold"]}"#,
        )
        .unwrap();
        assert!(parsed.responsive);
        assert_eq!(parsed.confidence, 0.92);
        assert_eq!(parsed.labels.len(), 1);
        assert!(parsed.adjustments.is_empty());
        assert!(!parsed.repaired);
    }

    #[test]
    fn tolerates_prose_and_code_fences() {
        let raw = "Sure! Here is the classification:\n```json\n{\"responsive\": false, \"confidence\": 0.8, \"reason\": \"Lead teacher schedule\"}\n```\nLet me know.";
        let parsed = parse_response(raw).unwrap();
        assert!(!parsed.responsive);
        assert!(parsed.labels.is_empty());
    }

    #[test]
    fn strips_reasoning_blocks() {
        let raw = "<think>The word {lead} here means leadership</think>{\"responsive\": false, \"confidence\": 0.7, \"reason\": \"leadership\"}";
        let parsed = parse_response(raw).unwrap();
        assert!(!parsed.responsive);
    }

    #[test]
    fn braces_inside_strings_do_not_split_span() {
        let raw = r#"{"responsive": true, "confidence": 0.6, "reason": "mentions {asbestos} tiles", "labels": []}"#;
        let parsed = parse_response(raw).unwrap();
        assert_eq!(parsed.reason, "mentions {asbestos} tiles");
    }

    #[test]
    fn no_json_is_hard_failure() {
        let err = parse_response("I cannot classify this email.").unwrap_err();
        assert_eq!(err, ParseFailure::NoJsonFound);
        assert_eq!(err.kind(), FailureKind::NoJsonFound);
    }

    #[test]
    fn repairs_smart_quotes_and_trailing_commas() {
        let raw = "{\u{201C}responsive\u{201D}: true, \u{201C}confidence\u{201D}: 0.9, \u{201C}reason\u{201D}: \u{201C}HVAC failure\u{201D}, \u{201C}labels\u{201D}: [\u{201C}hvac\u{201D},],}";
        let parsed = parse_response(raw).unwrap();
        assert!(parsed.repaired);
        assert!(parsed.labels.contains("hvac"));
    }

    #[test]
    fn repairs_single_quoted_json() {
        let parsed = parse_response("{'responsive': true, 'confidence': 0.5, 'reason': 'roof leak'}").unwrap();
        assert!(parsed.repaired);
        assert_eq!(parsed.reason, "roof leak");
    }

    #[test]
    fn repairs_truncated_output() {
        let raw = r#"{"responsive": true, "confidence": 0.88, "reason": "Water testing found lead above action le"#;
        let parsed = parse_response(raw).unwrap();
        assert!(parsed.repaired);
        assert!(parsed.responsive);
        assert!(parsed.reason.starts_with("Water testing"));
    }

    #[test]
    fn repairs_truncated_after_key() {
        let raw = r#"{"responsive": false, "confidence":"#;
        let parsed = parse_response(raw).unwrap();
        assert_eq!(parsed.confidence, 0.0);
        assert!(parsed.adjustments.contains(&FieldAdjustment::ConfidenceDefaulted));
    }

    #[test]
    fn unrepairable_json_is_invalid() {
        let err = parse_response(r#"{"responsive": tru e, "confidence": }"#).unwrap_err();
        assert!(matches!(err, ParseFailure::InvalidJson(_)));
    }

    #[test]
    fn missing_responsive_is_schema_violation() {
        let err = parse_response(r#"{"confidence": 0.9}"#).unwrap_err();
        assert_eq!(err.kind(), FailureKind::SchemaViolation);
    }

    #[test]
    fn object_verdict_is_schema_violation() {
        let err = parse_response(r#"{"responsive": {"nested": 1}}"#).unwrap_err();
        assert!(matches!(err, ParseFailure::SchemaViolation(_)));
    }

    #[test]
    fn responsive_strings_and_numbers_coerce() {
        let parsed = parse_response(r#"{"responsive": "Yes", "confidence": 0.7}"#).unwrap();
        assert!(parsed.responsive);
        assert!(matches!(parsed.adjustments[0], FieldAdjustment::ResponsiveCoerced { .. }));

        let parsed = parse_response(r#"{"responsive": 0, "confidence": 0.7}"#).unwrap();
        assert!(!parsed.responsive);
    }

    #[test]
    fn confidence_always_within_unit_interval() {
        for (raw, expected) in [
            (r#"{"responsive": true, "confidence": 1.7}"#, 1.0),
            (r#"{"responsive": true, "confidence": -0.2}"#, 0.0),
            (r#"{"responsive": true, "confidence": "85%"}"#, 0.85),
            (r#"{"responsive": true, "confidence": "0.4"}"#, 0.4),
            (r#"{"responsive": true, "confidence": "high"}"#, 0.0),
            (r#"{"responsive": true, "confidence": null}"#, 0.0),
            (r#"{"responsive": true}"#, 0.0),
            (r#"{"responsive": true, "confidence": 85}"#, 1.0),
        ] {
            let parsed = parse_response(raw).unwrap();
            assert!((0.0..=1.0).contains(&parsed.confidence), "{raw}");
            assert!((parsed.confidence - expected).abs() < 1e-9, "{raw}");
        }
    }

    #[test]
    fn reason_truncated_to_limit() {
        let long = "x".repeat(450);
        let raw = format!(r#"{{"responsive": true, "confidence": 0.5, "reason": "{long}"}}"#);
        let parsed = parse_response(&raw).unwrap();
        assert_eq!(parsed.reason.chars().count(), MAX_REASON_CHARS);
        assert!(parsed.reason.ends_with("..."));
        assert!(parsed
            .adjustments
            .contains(&FieldAdjustment::ReasonTruncated { original_chars: 450 }));
    }

    #[test]
    fn missing_reason_gets_default() {
        let parsed = parse_response(r#"{"responsive": true, "confidence": 0.5}"#).unwrap();
        assert_eq!(parsed.reason, DEFAULT_REASON);
    }

    #[test]
    fn labels_must_be_strings() {
        let parsed = parse_response(r#"{"responsive": true, "confidence": 0.5, "labels": "mold"}"#).unwrap();
        assert!(parsed.labels.is_empty());
        assert!(parsed.adjustments.contains(&FieldAdjustment::LabelsDiscarded));

        let parsed = parse_response(r#"{"responsive": true, "confidence": 0.5, "labels": ["mold", 3]}"#).unwrap();
        assert!(parsed.labels.is_empty());
    }

    #[test]
    fn labels_deduplicated_and_trimmed() {
        let parsed = parse_response(
            r#"{"responsive": true, "confidence": 0.5, "labels": [" lead ", "lead", "", "asbestos"]}"#,
        )
        .unwrap();
        let labels: Vec<&str> = parsed.labels.iter().map(String::as_str).collect();
        assert_eq!(labels, vec!["asbestos", "lead"]);
    }

    #[test]
    fn first_parseable_candidate_wins() {
        let raw = r#"Format: {like this} -> {"responsive": true, "confidence": 0.9}"#;
        let parsed = parse_response(raw).unwrap();
        assert!(parsed.responsive);
    }

    #[test]
    fn later_valid_verdict_beats_earlier_schema_mismatch() {
        let raw = r#"Example: {"foo": 1} Answer: {"responsive": true, "confidence": 0.8, "reason": "mold report"}"#;
        let parsed = parse_response(raw).unwrap();
        assert!(parsed.responsive);
        assert_eq!(parsed.reason, "mold report");
    }

    #[test]
    fn schema_mismatch_reported_when_nothing_validates() {
        let err = parse_response(r#"{"foo": 1} then {"bar": 2}"#).unwrap_err();
        assert_eq!(err.kind(), FailureKind::SchemaViolation);
    }
}
