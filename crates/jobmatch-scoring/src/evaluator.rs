use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use jobmatch_core::{truncate_chars, CandidateProfile, Category, ErrorKind, LlmAssessment, Posting};
use jobmatch_storage::{
    classify_reqwest_error, classify_status, retry_with_backoff, AttemptOutcome, BackoffPolicy, RetryDisposition,
};
use reqwest::StatusCode;
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use thiserror::Error;
use tokio::sync::Semaphore;
use tracing::{debug, info_span, warn, Instrument};

const SYSTEM_PROMPT: &str = "You are an assistant that evaluates how well a candidate matches a job posting. \
Reply with a single JSON object and nothing else.";

#[derive(Debug, Error)]
pub enum TransportError {
    #[error("reasoning service call timed out after {0:?}")]
    Timeout(Duration),
    #[error("reasoning service rate limited the request")]
    RateLimited,
    #[error("reasoning service rejected the credentials (status {status})")]
    Auth { status: u16 },
    #[error("reasoning service returned status {status}: {message}")]
    Status { status: u16, message: String },
    #[error("reasoning service reply could not be read: {0}")]
    Envelope(String),
    #[error("request to reasoning service failed: {0}")]
    Request(#[source] reqwest::Error),
}

impl TransportError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            TransportError::RateLimited => ErrorKind::RateLimit,
            _ => ErrorKind::Network,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChatRole {
    System,
    User,
    Assistant,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: ChatRole,
    pub content: String,
}

impl ChatMessage {
    pub fn system(content: impl Into<String>) -> Self {
        Self {
            role: ChatRole::System,
            content: content.into(),
        }
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: ChatRole::User,
            content: content.into(),
        }
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self {
            role: ChatRole::Assistant,
            content: content.into(),
        }
    }
}

/// One chat-completion attempt. Returns the model's reply text.
#[async_trait]
pub trait ReasoningTransport: Send + Sync {
    async fn complete(&self, messages: &[ChatMessage]) -> AttemptOutcome<String, TransportError>;
}

#[derive(Debug, Clone)]
pub struct OpenAiCompatibleConfig {
    /// Base URL (`https://api.openai.com/v1`) or the full `/chat/completions` URL.
    pub endpoint: String,
    pub api_key: String,
    pub model: String,
    pub request_timeout: Duration,
}

impl OpenAiCompatibleConfig {
    fn completions_url(&self) -> String {
        let endpoint = self.endpoint.trim_end_matches('/');
        if endpoint.ends_with("/chat/completions") {
            endpoint.to_string()
        } else {
            format!("{endpoint}/chat/completions")
        }
    }
}

#[derive(Debug, Serialize)]
struct CompletionRequest<'a> {
    model: &'a str,
    temperature: f32,
    response_format: ResponseFormat,
    messages: &'a [ChatMessage],
}

#[derive(Debug, Serialize)]
struct ResponseFormat {
    #[serde(rename = "type")]
    kind: &'static str,
}

#[derive(Debug, Deserialize)]
struct CompletionResponse {
    #[serde(default)]
    choices: Vec<CompletionChoice>,
}

#[derive(Debug, Deserialize)]
struct CompletionChoice {
    message: CompletionMessage,
}

#[derive(Debug, Deserialize)]
struct CompletionMessage {
    content: Option<String>,
}

/// Chat-completions client for OpenAI and API-compatible servers.
#[derive(Debug, Clone)]
pub struct OpenAiCompatibleClient {
    client: reqwest::Client,
    url: String,
    config: OpenAiCompatibleConfig,
}

impl OpenAiCompatibleClient {
    pub fn new(config: OpenAiCompatibleConfig) -> anyhow::Result<Self> {
        let client = reqwest::Client::builder()
            .gzip(true)
            .timeout(config.request_timeout)
            .build()
            .map_err(|e| anyhow::anyhow!("building reasoning client: {e}"))?;
        Ok(Self {
            client,
            url: config.completions_url(),
            config,
        })
    }
}

#[async_trait]
impl ReasoningTransport for OpenAiCompatibleClient {
    async fn complete(&self, messages: &[ChatMessage]) -> AttemptOutcome<String, TransportError> {
        let body = CompletionRequest {
            model: &self.config.model,
            temperature: 0.0,
            response_format: ResponseFormat { kind: "json_object" },
            messages,
        };
        let span = info_span!("reasoning_call", model = %self.config.model);
        async {
            let resp = match self
                .client
                .post(&self.url)
                .bearer_auth(&self.config.api_key)
                .json(&body)
                .send()
                .await
            {
                Ok(resp) => resp,
                Err(err) if err.is_timeout() => {
                    return AttemptOutcome::Retryable(TransportError::Timeout(self.config.request_timeout))
                }
                Err(err) => {
                    return match classify_reqwest_error(&err) {
                        RetryDisposition::Retryable => AttemptOutcome::Retryable(TransportError::Request(err)),
                        RetryDisposition::NonRetryable => AttemptOutcome::Terminal(TransportError::Request(err)),
                    }
                }
            };

            let status = resp.status();
            if status == StatusCode::TOO_MANY_REQUESTS {
                return AttemptOutcome::Retryable(TransportError::RateLimited);
            }
            if status == StatusCode::UNAUTHORIZED || status == StatusCode::FORBIDDEN {
                return AttemptOutcome::Terminal(TransportError::Auth {
                    status: status.as_u16(),
                });
            }
            if !status.is_success() {
                let message = resp.text().await.unwrap_or_default();
                let error = TransportError::Status {
                    status: status.as_u16(),
                    message: truncate_chars(&message, 300),
                };
                return match classify_status(status) {
                    RetryDisposition::Retryable => AttemptOutcome::Retryable(error),
                    RetryDisposition::NonRetryable => AttemptOutcome::Terminal(error),
                };
            }

            match resp.json::<CompletionResponse>().await {
                Ok(parsed) => AttemptOutcome::Success(
                    parsed
                        .choices
                        .into_iter()
                        .next()
                        .and_then(|c| c.message.content)
                        .unwrap_or_default(),
                ),
                Err(err) if err.is_timeout() => {
                    AttemptOutcome::Retryable(TransportError::Timeout(self.config.request_timeout))
                }
                Err(err) => AttemptOutcome::Terminal(TransportError::Envelope(err.to_string())),
            }
        }
        .instrument(span)
        .await
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SchemaViolation {
    #[error("reply is not a JSON object: {0}")]
    NotJson(String),
    #[error("missing field `{0}`")]
    MissingField(&'static str),
    #[error("confidence must be an integer from 0 to 100, got {0}")]
    Confidence(String),
    #[error("label must be one of must_apply, recommended, can_apply, general; got {0}")]
    Label(String),
    #[error("explanation must be 1 to 3 sentences, got {0}")]
    Explanation(usize),
}

#[derive(Debug, Error)]
pub enum EvaluatorError {
    #[error("reasoning call failed after {attempts} attempt(s): {source}")]
    Transport {
        attempts: usize,
        #[source]
        source: TransportError,
    },
    #[error("reasoning reply failed validation {attempts} time(s): {last}")]
    Schema { attempts: usize, last: SchemaViolation },
}

impl EvaluatorError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            EvaluatorError::Transport { source, .. } => source.kind(),
            EvaluatorError::Schema { .. } => ErrorKind::Schema,
        }
    }
}

#[derive(Debug, Clone)]
pub struct EvaluatorConfig {
    /// Requests per posting, counting repair retries after a schema violation.
    pub max_attempts: usize,
    pub call_timeout: Duration,
    pub concurrency: usize,
    /// Transport-level retries inside one request.
    pub backoff: BackoffPolicy,
    pub description_chars: usize,
    pub profile_chars: usize,
}

impl Default for EvaluatorConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            call_timeout: Duration::from_secs(45),
            concurrency: 2,
            backoff: BackoffPolicy::default(),
            description_chars: 3000,
            profile_chars: 2000,
        }
    }
}

/// Strips ```json fences and any prose around the outermost JSON object.
fn json_payload(reply: &str) -> &str {
    let text = reply.trim();
    let text = text
        .strip_prefix("```json")
        .or_else(|| text.strip_prefix("```"))
        .map(|inner| inner.trim().trim_end_matches("```").trim())
        .unwrap_or(text);
    match (text.find('{'), text.rfind('}')) {
        (Some(start), Some(end)) if start < end => &text[start..=end],
        _ => text,
    }
}

fn sentence_count(text: &str) -> usize {
    let chars: Vec<char> = text.chars().collect();
    let mut count = 0;
    let mut in_sentence = false;
    for (i, c) in chars.iter().enumerate() {
        if matches!(c, '.' | '!' | '?') {
            let at_boundary = chars.get(i + 1).map_or(true, |next| next.is_whitespace());
            if at_boundary && in_sentence {
                count += 1;
                in_sentence = false;
            }
        } else if !c.is_whitespace() {
            in_sentence = true;
        }
    }
    if in_sentence {
        count += 1;
    }
    count
}

/// Validates a model reply against `{confidence: 0..=100, label, explanation: 1-3 sentences}`.
pub fn parse_assessment(reply: &str) -> Result<LlmAssessment, SchemaViolation> {
    let value: JsonValue =
        serde_json::from_str(json_payload(reply)).map_err(|e| SchemaViolation::NotJson(e.to_string()))?;
    let object = value
        .as_object()
        .ok_or_else(|| SchemaViolation::NotJson(format!("expected an object, got {value}")))?;

    let confidence = object.get("confidence").ok_or(SchemaViolation::MissingField("confidence"))?;
    let confidence = match confidence.as_f64() {
        Some(v) if v.fract() == 0.0 && (0.0..=100.0).contains(&v) => v as u8,
        _ => return Err(SchemaViolation::Confidence(confidence.to_string())),
    };

    let label = object.get("label").ok_or(SchemaViolation::MissingField("label"))?;
    let label = label
        .as_str()
        .and_then(Category::parse_label)
        .ok_or_else(|| SchemaViolation::Label(label.to_string()))?;

    let explanation = object
        .get("explanation")
        .and_then(JsonValue::as_str)
        .map(str::trim)
        .ok_or(SchemaViolation::MissingField("explanation"))?;
    let sentences = sentence_count(explanation);
    if !(1..=3).contains(&sentences) {
        return Err(SchemaViolation::Explanation(sentences));
    }

    Ok(LlmAssessment {
        confidence,
        label,
        explanation: explanation.to_string(),
    })
}

fn repair_instruction(violation: &SchemaViolation) -> String {
    format!(
        "Your previous reply was rejected: {violation}. Reply again with only a JSON object with exactly the keys \
\"confidence\" (integer 0-100), \"label\" (one of \"must_apply\", \"recommended\", \"can_apply\", \"general\") \
and \"explanation\" (1 to 3 sentences)."
    )
}

/// Remote reasoning step: bounded concurrency, per-call timeout, transport retries and
/// schema repair retries.
pub struct ExternalEvaluator {
    transport: Arc<dyn ReasoningTransport>,
    config: EvaluatorConfig,
    permits: Arc<Semaphore>,
}

impl ExternalEvaluator {
    pub fn new(transport: Arc<dyn ReasoningTransport>, config: EvaluatorConfig) -> Self {
        let permits = Arc::new(Semaphore::new(config.concurrency.max(1)));
        Self {
            transport,
            config,
            permits,
        }
    }

    pub fn build_messages(&self, profile: &CandidateProfile, posting: &Posting) -> Vec<ChatMessage> {
        let prompt = format!(
            "Return a single JSON object with EXACT keys: confidence (integer 0-100), label (one of \"must_apply\", \
\"recommended\", \"can_apply\", \"general\"), explanation (short, 1-3 sentences).\n\n\
Job Title:\n{title}\n\nJob Description:\n{description}\n\n\
Candidate Profile (short):\n{profile}\n\n\
Candidate explicit skill list (comma-separated):\n{skills}\n\n\
Rules:\n\
- Confidence reflects match strength: 0 (no fit) to 100 (near perfect fit).\n\
- Consider both skills and experience; be precise but concise.\n\
- Do not output anything except the JSON object.",
            title = posting.title,
            description = truncate_chars(&posting.description_text, self.config.description_chars),
            profile = profile.summary(self.config.profile_chars),
            skills = profile.skills_list().join(", "),
        );
        vec![ChatMessage::system(SYSTEM_PROMPT), ChatMessage::user(prompt)]
    }

    async fn call(&self, messages: &[ChatMessage]) -> Result<String, EvaluatorError> {
        let timeout = self.config.call_timeout;
        retry_with_backoff(&self.config.backoff, |attempt| async move {
            match tokio::time::timeout(timeout, self.transport.complete(messages)).await {
                Ok(outcome) => outcome,
                Err(_) => {
                    debug!(attempt, "reasoning call hit the per-call timeout");
                    AttemptOutcome::Retryable(TransportError::Timeout(timeout))
                }
            }
        })
        .await
        .map_err(|err| {
            let attempts = err.attempts();
            EvaluatorError::Transport {
                attempts,
                source: err.into_error(),
            }
        })
    }

    pub async fn evaluate(&self, profile: &CandidateProfile, posting: &Posting) -> Result<LlmAssessment, EvaluatorError> {
        let _permit = self.permits.acquire().await.expect("semaphore not closed");
        let mut messages = self.build_messages(profile, posting);
        let base_len = messages.len();
        let max_attempts = self.config.max_attempts.max(1);
        let mut last = SchemaViolation::NotJson("no reply".to_string());

        for attempt in 1..=max_attempts {
            let reply = self.call(&messages).await?;
            match parse_assessment(&reply) {
                Ok(assessment) => {
                    debug!(url = %posting.source_url, attempt, confidence = assessment.confidence, "posting evaluated");
                    return Ok(assessment);
                }
                Err(violation) => {
                    warn!(url = %posting.source_url, attempt, %violation, "evaluator reply failed validation");
                    messages.truncate(base_len);
                    messages.push(ChatMessage::assistant(reply));
                    messages.push(ChatMessage::user(repair_instruction(&violation)));
                    last = violation;
                }
            }
        }
        Err(EvaluatorError::Schema {
            attempts: max_attempts,
            last,
        })
    }
}
