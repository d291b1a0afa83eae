use std::sync::Arc;

use indoc::formatdoc;
use serde::{Deserialize, Serialize};

use crate::{email::message::MessageFields, model::category::UserCategory};

use super::{chat::TextModel, extract::extract_json};

pub const FALLBACK_CATEGORY: &str = "Other";
pub const FALLBACK_CONFIDENCE: f64 = 0.5;
pub const REASON_UNPARSEABLE: &str = "Could not parse LLM response";
pub const REASON_CALL_FAILED: &str = "Error occurred during classification";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClassificationResult {
    pub category: String,
    pub confidence: f64,
    pub reasoning: String,
}

impl ClassificationResult {
    fn fallback(reasoning: &str) -> Self {
        Self {
            category: FALLBACK_CATEGORY.to_string(),
            confidence: FALLBACK_CONFIDENCE,
            reasoning: reasoning.to_string(),
        }
    }

    /// Accepts only a non-empty `category` and a numeric `confidence`.
    fn from_json(value: serde_json::Value) -> Option<Self> {
        let category = value.get("category")?.as_str()?.trim();
        if category.is_empty() {
            return None;
        }

        let confidence = value.get("confidence")?.as_f64()?;
        if !confidence.is_finite() {
            return None;
        }

        let reasoning = value
            .get("reasoning")
            .and_then(|r| r.as_str())
            .unwrap_or_default();

        Some(Self {
            category: category.to_string(),
            confidence: confidence.clamp(0.0, 1.0),
            reasoning: reasoning.to_string(),
        })
    }
}

pub fn build_prompt(fields: &MessageFields, categories: &[UserCategory]) -> String {
    let category_list = categories
        .iter()
        .map(|c| match &c.description {
            Some(description) if !description.is_empty() => {
                format!("- {}: {}", c.name, description)
            }
            _ => format!("- {}", c.name),
        })
        .collect::<Vec<_>>()
        .join("\n");

    let snippet_line = if fields.snippet.is_empty() {
        String::new()
    } else {
        format!("Content Snippet: {}", fields.snippet)
    };

    formatdoc! {r#"
        Please classify this email into one of these categories:
        {category_list}

        Email Subject: {subject}
        From: {sender}
        {snippet_line}

        Please respond with only a JSON object in this exact format:
        {{
          "category": "category_name",
          "confidence": 0.95,
          "reasoning": "brief explanation of why this category was chosen"
        }}"#,
        category_list = category_list,
        subject = fields.subject,
        sender = fields.sender,
        snippet_line = snippet_line,
    }
}

#[derive(Clone)]
pub struct ClassificationEngine {
    model: Arc<dyn TextModel>,
}

impl ClassificationEngine {
    pub fn new(model: Arc<dyn TextModel>) -> Self {
        Self { model }
    }

    /// Never fails: any model or parse problem turns into the "Other" fallback.
    pub async fn classify(
        &self,
        fields: &MessageFields,
        categories: &[UserCategory],
    ) -> ClassificationResult {
        let prompt = build_prompt(fields, categories);

        let answer = match self.model.complete(&prompt).await {
            Ok(answer) => answer,
            Err(e) => {
                tracing::error!("Error classifying email: {:?}", e);
                return ClassificationResult::fallback(REASON_CALL_FAILED);
            }
        };

        match extract_json(&answer).and_then(ClassificationResult::from_json) {
            Some(result) => result,
            None => {
                tracing::warn!("Could not parse classification answer: {}", answer);
                ClassificationResult::fallback(REASON_UNPARSEABLE)
            }
        }
    }
}
