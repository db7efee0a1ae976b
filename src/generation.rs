//! Prose generation over a deterministic context block.
//!
//! The generator only phrases what the engine already computed. Its output is
//! untrusted: the engine checks every number against the context and caps
//! confidence when one does not match.

use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::llm::{extract_json, ChatCompletion, CompletionRequest, LlmError};
use crate::prompts::render_generation;

const GENERATE_MAX_TOKENS: u32 = 600;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GenerationConstraints {
    pub max_words: usize,
    /// Extra instructions appended to the prompt.
    #[serde(default)]
    pub extra: Vec<String>,
}

impl Default for GenerationConstraints {
    fn default() -> Self {
        Self {
            max_words: 180,
            extra: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GeneratedAnswer {
    pub answer_text: String,
    pub claimed_confidence: f64,
    #[serde(default)]
    pub evidence_used: Vec<String>,
}

#[async_trait]
pub trait AnswerGenerator: Send + Sync {
    async fn generate(
        &self,
        question: &str,
        context: &str,
        constraints: &GenerationConstraints,
    ) -> Result<GeneratedAnswer, LlmError>;
}

pub struct LlmAnswerGenerator {
    client: Arc<dyn ChatCompletion>,
    model: String,
}

impl LlmAnswerGenerator {
    pub fn new(client: Arc<dyn ChatCompletion>, model: impl Into<String>) -> Self {
        Self {
            client,
            model: model.into(),
        }
    }
}

pub fn parse_answer(raw: &str) -> Result<GeneratedAnswer, LlmError> {
    let mut answer: GeneratedAnswer =
        serde_json::from_str(extract_json(raw)).map_err(|e| LlmError::Parse(e.to_string()))?;
    if answer.answer_text.trim().is_empty() {
        return Err(LlmError::Parse("empty answer_text".into()));
    }
    if !answer.claimed_confidence.is_finite() {
        answer.claimed_confidence = 0.0;
    }
    answer.claimed_confidence = answer.claimed_confidence.clamp(0.0, 1.0);
    Ok(answer)
}

#[async_trait]
impl AnswerGenerator for LlmAnswerGenerator {
    async fn generate(
        &self,
        question: &str,
        context: &str,
        constraints: &GenerationConstraints,
    ) -> Result<GeneratedAnswer, LlmError> {
        let prompt = render_generation(question, context, constraints.max_words, &constraints.extra);
        let req = CompletionRequest::new(&self.model, prompt.to_messages())
            .json()
            .max_tokens(GENERATE_MAX_TOKENS);
        let resp = self.client.complete(&req).await?;
        parse_answer(&resp.content)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_fenced_answer() {
        let raw = "```json\n{\"answer_text\": \"Worth 12 million.\", \"claimed_confidence\": 1.4, \"evidence_used\": [\"10.1000/x\"]}\n```";
        let answer = parse_answer(raw).unwrap();
        assert_eq!(answer.answer_text, "Worth 12 million.");
        assert_eq!(answer.claimed_confidence, 1.0);
        assert_eq!(answer.evidence_used, vec!["10.1000/x"]);
    }

    #[test]
    fn rejects_empty_text() {
        assert!(parse_answer("{\"answer_text\": \" \", \"claimed_confidence\": 0.5}").is_err());
    }
}
