use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use esv_bridge::classifier::{Classifier, LlmClassifier, QueryCategory};
use esv_bridge::generation::{AnswerGenerator, GenerationConstraints, LlmAnswerGenerator};
use esv_bridge::llm::{
    ChatCompletion, CompletionRequest, FinishReason, LlmError, Message, OpenRouterClient, RetryConfig,
    RetryingClient,
};
use serde_json::json;
use wiremock::matchers::{body_partial_json, header, method, path};
use wiremock::{Mock, MockServer, Request, Respond, ResponseTemplate};

fn client(server: &MockServer) -> OpenRouterClient {
    OpenRouterClient::with_config("sk-test", server.uri(), Duration::from_secs(5)).unwrap()
}

fn completion_body(content: &str) -> serde_json::Value {
    json!({
        "choices": [{
            "message": { "content": content },
            "finish_reason": "stop"
        }],
        "usage": { "prompt_tokens": 12, "completion_tokens": 7 }
    })
}

#[tokio::test]
async fn parses_content_usage_and_finish_reason() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/chat/completions"))
        .and(header("authorization", "Bearer sk-test"))
        .respond_with(ResponseTemplate::new(200).set_body_json(completion_body("hello")))
        .mount(&server)
        .await;

    let req = CompletionRequest::new("openai/gpt-4o-mini", vec![Message::user("hi")]);
    let resp = client(&server).complete(&req).await.unwrap();
    assert_eq!(resp.content, "hello");
    assert_eq!(resp.finish_reason, FinishReason::Stop);
    assert_eq!(resp.input_tokens, 12);
    assert_eq!(resp.output_tokens, 7);
}

#[tokio::test]
async fn rate_limit_is_retryable() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/chat/completions"))
        .respond_with(ResponseTemplate::new(429))
        .mount(&server)
        .await;

    let req = CompletionRequest::new("m", vec![Message::user("hi")]);
    let err = client(&server).complete(&req).await.unwrap_err();
    assert!(matches!(err, LlmError::RateLimited { .. }));
    assert!(err.is_retryable());
    assert_eq!(err.code(), "rate_limited");
}

#[tokio::test]
async fn client_error_carries_provider_code() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/chat/completions"))
        .respond_with(ResponseTemplate::new(400).set_body_json(json!({
            "error": { "message": "bad model", "code": 400 }
        })))
        .mount(&server)
        .await;

    let req = CompletionRequest::new("m", vec![Message::user("hi")]);
    let err = client(&server).complete(&req).await.unwrap_err();
    assert!(!err.is_retryable());
    let ctx = err.context().unwrap();
    assert_eq!(ctx.http_status, Some(400));
    assert_eq!(ctx.provider_code.as_deref(), Some("400"));
}

#[tokio::test]
async fn refusal_content_is_an_error() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/chat/completions"))
        .respond_with(ResponseTemplate::new(200).set_body_json(completion_body("I cannot help with that.")))
        .mount(&server)
        .await;

    let req = CompletionRequest::new("m", vec![Message::user("hi")]);
    let err = client(&server).complete(&req).await.unwrap_err();
    assert!(matches!(err, LlmError::Refused(_)));
}

struct FlipResponder {
    calls: Arc<AtomicUsize>,
    first: ResponseTemplate,
    second: ResponseTemplate,
}

impl Respond for FlipResponder {
    fn respond(&self, _request: &Request) -> ResponseTemplate {
        let n = self.calls.fetch_add(1, Ordering::SeqCst);
        if n == 0 {
            self.first.clone()
        } else {
            self.second.clone()
        }
    }
}

#[tokio::test]
async fn retrying_client_recovers_from_server_error() {
    let server = MockServer::start().await;
    let calls = Arc::new(AtomicUsize::new(0));
    Mock::given(method("POST"))
        .and(path("/chat/completions"))
        .respond_with(FlipResponder {
            calls: calls.clone(),
            first: ResponseTemplate::new(503).set_body_json(json!({
                "error": { "message": "overloaded", "code": "unavailable" }
            })),
            second: ResponseTemplate::new(200).set_body_json(completion_body("ok")),
        })
        .mount(&server)
        .await;

    let retrying = RetryingClient::new(
        client(&server),
        RetryConfig {
            max_retries: 2,
            retry_base_delay: Duration::from_millis(1),
        },
    );
    let req = CompletionRequest::new("m", vec![Message::user("hi")]);
    let resp = retrying.complete(&req).await.unwrap();
    assert_eq!(resp.content, "ok");
    assert_eq!(calls.load(Ordering::SeqCst), 2);
}

#[tokio::test]
async fn llm_classifier_requests_json_and_parses_verdict() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/chat/completions"))
        .and(body_partial_json(json!({
            "model": "openai/gpt-4o-mini",
            "response_format": { "type": "json_object" }
        })))
        .respond_with(ResponseTemplate::new(200).set_body_json(completion_body(
            "```json\n{\"category\": \"risk_assessment\", \"confidence\": 0.7}\n```",
        )))
        .mount(&server)
        .await;

    let classifier = LlmClassifier::new(Arc::new(client(&server)), "openai/gpt-4o-mini");
    let verdict = classifier.classify("is the reef in danger?").await.unwrap();
    assert_eq!(verdict.category, QueryCategory::RiskAssessment);
    assert!((verdict.confidence - 0.7).abs() < 1e-12);
}

#[tokio::test]
async fn answer_generator_parses_structured_answer() {
    let server = MockServer::start().await;
    let content = json!({
        "answer_text": "Cabo Pulmo is worth about 35 million USD per year.",
        "claimed_confidence": 0.8,
        "evidence_used": ["10.1371/journal.pone.0023601"]
    })
    .to_string();
    Mock::given(method("POST"))
        .and(path("/chat/completions"))
        .respond_with(ResponseTemplate::new(200).set_body_json(completion_body(&content)))
        .mount(&server)
        .await;

    let generator = LlmAnswerGenerator::new(Arc::new(client(&server)), "openai/gpt-4o-mini");
    let answer = generator
        .generate(
            "What is Cabo Pulmo worth?",
            "total value: 35,036,964 USD/yr",
            &GenerationConstraints::default(),
        )
        .await
        .unwrap();
    assert!(answer.answer_text.contains("35 million"));
    assert!((answer.claimed_confidence - 0.8).abs() < 1e-12);
    assert_eq!(answer.evidence_used.len(), 1);
}

#[tokio::test]
async fn slow_provider_surfaces_as_retryable_timeout() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/chat/completions"))
        .respond_with(
            ResponseTemplate::new(200)
                .set_body_json(completion_body("late"))
                .set_delay(Duration::from_secs(2)),
        )
        .mount(&server)
        .await;

    let slow = OpenRouterClient::with_config("sk-test", server.uri(), Duration::from_millis(200)).unwrap();
    let req = CompletionRequest::new("m", vec![Message::user("hi")]);
    let err = slow.complete(&req).await.unwrap_err();
    assert!(matches!(err, LlmError::Timeout(d) if d == Duration::from_millis(200)));
    assert!(err.is_retryable());
    assert_eq!(err.code(), "timeout");
}
