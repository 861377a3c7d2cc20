//! Classification prompt rendering from a versioned few-shot template.

use std::path::Path;

use serde::Deserialize;
use thiserror::Error;

use crate::models::Document;

/// Few-shot example bodies are cut to this many characters.
const EXAMPLE_BODY_CHARS: usize = 500;

const EMBEDDED_TEMPLATE: &str = include_str!("../../../resources/prompts/fewshot.json");

#[derive(Error, Debug)]
pub enum PromptError {
    #[error("Cannot read prompt template {path}: {source}")]
    Io {
        path: String,
        source: std::io::Error,
    },

    #[error("Invalid prompt template: {0}")]
    Invalid(String),
}

#[derive(Debug, Clone, Deserialize)]
struct PromptTemplate {
    version: String,
    system: String,
    #[serde(default)]
    output_schema: serde_json::Value,
    #[serde(default)]
    examples: Vec<FewShotExample>,
}

#[derive(Debug, Clone, Deserialize)]
struct FewShotExample {
    #[serde(default)]
    subject: Option<String>,
    #[serde(default)]
    from: Option<String>,
    #[serde(default)]
    body: Option<String>,
    output: serde_json::Value,
}

/// Renders the full prompt for one document.
#[derive(Debug, Clone)]
pub struct PromptBuilder {
    template: PromptTemplate,
    max_body_chars: usize,
}

impl PromptBuilder {
    /// The template compiled into the binary.
    pub fn embedded(max_body_chars: usize) -> Result<Self, PromptError> {
        Self::from_json(EMBEDDED_TEMPLATE, max_body_chars)
    }

    pub fn from_path(path: &Path, max_body_chars: usize) -> Result<Self, PromptError> {
        let raw = std::fs::read_to_string(path).map_err(|source| PromptError::Io {
            path: path.display().to_string(),
            source,
        })?;
        Self::from_json(&raw, max_body_chars)
    }

    pub fn from_json(raw: &str, max_body_chars: usize) -> Result<Self, PromptError> {
        let template: PromptTemplate =
            serde_json::from_str(raw).map_err(|e| PromptError::Invalid(e.to_string()))?;
        if template.version.trim().is_empty() {
            return Err(PromptError::Invalid("version must not be empty".into()));
        }
        if template.system.trim().is_empty() {
            return Err(PromptError::Invalid("system prompt must not be empty".into()));
        }
        Ok(Self {
            template,
            max_body_chars,
        })
    }

    pub fn version(&self) -> &str {
        &self.template.version
    }

    pub fn example_count(&self) -> usize {
        self.template.examples.len()
    }

    pub fn build(&self, doc: &Document) -> String {
        let mut parts: Vec<String> = Vec::new();

        parts.push(self.template.system.clone());
        parts.push(String::new());

        parts.push("Your output must be valid JSON with this structure:".into());
        parts.push("```json".into());
        parts.push(pretty(&self.template.output_schema));
        parts.push("```".into());
        parts.push(String::new());

        if !self.template.examples.is_empty() {
            parts.push("Here are some examples of correct classifications:".into());
            parts.push(String::new());
            for (i, example) in self.template.examples.iter().enumerate() {
                parts.push(format!("Example {}:", i + 1));
                parts.push(format!("Subject: {}", example.subject.as_deref().unwrap_or("N/A")));
                if let Some(from) = &example.from {
                    parts.push(format!("From: {from}"));
                }
                if let Some(body) = &example.body {
                    parts.push(format!("Body: {}", truncate_chars(body, EXAMPLE_BODY_CHARS)));
                }
                parts.push(String::new());
                parts.push("Classification:".into());
                parts.push(pretty(&example.output));
                parts.push(String::new());
            }
        }

        parts.push("Now classify this email:".into());
        parts.push(String::new());
        parts.push(format!("Subject: {}", doc.headers.subject.as_deref().unwrap_or("N/A")));
        if let Some(from) = &doc.headers.from {
            parts.push(format!("From: {from}"));
        }
        if let Some(to) = &doc.headers.to {
            parts.push(format!("To: {to}"));
        }
        if let Some(date) = &doc.headers.date {
            parts.push(format!("Date: {date}"));
        }
        parts.push(String::new());

        let body = truncate_chars(&doc.text, self.max_body_chars);
        if body.len() < doc.text.len() {
            parts.push(format!("Body: {body}\n[body truncated]"));
        } else {
            parts.push(format!("Body: {body}"));
        }
        parts.push(String::new());
        parts.push("Classification (output JSON only):".into());

        parts.join("\n")
    }
}

fn pretty(value: &serde_json::Value) -> String {
    serde_json::to_string_pretty(value).unwrap_or_else(|_| value.to_string())
}

fn truncate_chars(text: &str, max: usize) -> &str {
    match text.char_indices().nth(max) {
        Some((idx, _)) => &text[..idx],
        None => text,
    }
}
