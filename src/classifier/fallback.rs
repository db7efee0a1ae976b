//! LLM-backed fallback classifier.

use std::sync::Arc;

use async_trait::async_trait;
use serde::Deserialize;

use crate::llm::{extract_json, ChatCompletion, CompletionRequest, LlmError};
use crate::prompts::render_classification;

use super::{CategoryVerdict, Classifier, ClassifierError, QueryCategory};

const CLASSIFY_MAX_TOKENS: u32 = 64;

#[derive(Debug, Deserialize)]
struct VerdictJson {
    category: Option<String>,
    confidence: Option<f64>,
}

pub struct LlmClassifier {
    client: Arc<dyn ChatCompletion>,
    model: String,
}

impl LlmClassifier {
    pub fn new(client: Arc<dyn ChatCompletion>, model: impl Into<String>) -> Self {
        Self {
            client,
            model: model.into(),
        }
    }
}

/// Parse `{"category": ..., "confidence": ...}` from model output.
pub fn parse_verdict(raw: &str) -> Result<CategoryVerdict, LlmError> {
    let parsed: VerdictJson =
        serde_json::from_str(extract_json(raw)).map_err(|e| LlmError::Parse(e.to_string()))?;
    let category = parsed
        .category
        .ok_or_else(|| LlmError::Parse("missing 'category'".into()))?
        .parse::<QueryCategory>()
        .map_err(LlmError::Parse)?;
    let confidence = parsed
        .confidence
        .filter(|c| c.is_finite())
        .ok_or_else(|| LlmError::Parse("missing 'confidence'".into()))?;
    Ok(CategoryVerdict {
        category,
        confidence: confidence.clamp(0.0, 1.0),
    })
}

#[async_trait]
impl Classifier for LlmClassifier {
    async fn classify(&self, question: &str) -> Result<CategoryVerdict, ClassifierError> {
        let prompt = render_classification(question);
        let req = CompletionRequest::new(&self.model, prompt.to_messages())
            .json()
            .max_tokens(CLASSIFY_MAX_TOKENS);
        let resp = self.client.complete(&req).await?;
        Ok(parse_verdict(&resp.content)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_wrapped_verdict() {
        let v = parse_verdict("Here you go: {\"category\": \"concept_explanation\", \"confidence\": 0.72}")
            .unwrap();
        assert_eq!(v.category, QueryCategory::ConceptExplanation);
        assert!((v.confidence - 0.72).abs() < 1e-12);
    }

    #[test]
    fn rejects_unknown_category() {
        let err = parse_verdict("{\"category\": \"weather\", \"confidence\": 0.9}").unwrap_err();
        assert!(matches!(err, LlmError::Parse(_)));
    }

    #[test]
    fn clamps_confidence() {
        let v = parse_verdict("{\"category\": \"comparison\", \"confidence\": 3.0}").unwrap();
        assert_eq!(v.confidence, 1.0);
    }
}
