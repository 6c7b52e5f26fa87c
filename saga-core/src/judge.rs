//! External service boundary: judgment and content generation.
//!
//! The engine consumes two collaborators it never implements itself:
//! a judgment service answering small enumerated questions, and a content
//! service producing chapter prose and dialogue. Both are async traits so
//! tests can script them deterministically; production implementations sit
//! on top of the [`oracle`] client with forced tool choice, so every answer
//! arrives as JSON constrained to the requested domain.
//!
//! Retry is handled here, once, by [`with_retry`]; decision tables never
//! loop on the service themselves. Every failure mode collapses into the
//! two-variant [`ServiceError`] taxonomy the decision tables branch on.

use crate::story::DialogueLine;
use async_trait::async_trait;
use oracle::{Message, Oracle, Request, Tool};
use rand::Rng;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::future::Future;
use std::time::Duration;
use thiserror::Error;

/// Recoverable failures at the service boundary.
///
/// Every call site maps these to its documented fail-safe; neither variant
/// is allowed to propagate out of a decision table as a hard error.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ServiceError {
    /// The service was unreachable, timed out, or retries were exhausted.
    #[error("service unavailable: {0}")]
    Unavailable(String),

    /// The service answered outside its enumerated domain.
    #[error("malformed response: {0}")]
    Malformed(String),
}

/// One answer field in a judgment request.
///
/// An empty `allowed` list means free text (used for rationale capture);
/// anything else is a closed domain the answer must come from.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LabelField {
    pub name: String,
    pub description: String,
    /// The closed domain the answer must come from; empty = free text.
    pub allowed: Vec<String>,
}

impl LabelField {
    pub fn new(
        name: impl Into<String>,
        description: impl Into<String>,
        allowed: Vec<String>,
    ) -> Self {
        Self {
            name: name.into(),
            description: description.into(),
            allowed,
        }
    }
}

/// A structured judgment request: instruction, answer schema, context.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JudgmentRequest {
    pub instruction: String,
    pub fields: Vec<LabelField>,
    pub context: String,
}

impl JudgmentRequest {
    pub fn new(instruction: impl Into<String>) -> Self {
        Self {
            instruction: instruction.into(),
            fields: Vec::new(),
            context: String::new(),
        }
    }

    pub fn with_field(mut self, field: LabelField) -> Self {
        self.fields.push(field);
        self
    }

    pub fn with_context(mut self, context: impl Into<String>) -> Self {
        self.context = context.into();
        self
    }
}

/// Raw answer values keyed by field name.
///
/// Values are unvalidated strings; the caller checks each against its
/// enumerated domain and substitutes fail-safe defaults.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct JudgmentResponse {
    pub values: BTreeMap<String, String>,
}

impl JudgmentResponse {
    pub fn value(&self, field: &str) -> Option<&str> {
        self.values.get(field).map(String::as_str)
    }
}

/// The judgment service: discrete, side-effect-free answers.
#[async_trait]
pub trait JudgmentService: Send + Sync {
    /// Answer a multi-field enumerated question.
    async fn judge(&self, request: JudgmentRequest) -> Result<JudgmentResponse, ServiceError>;

    /// Answer a forced yes/no question.
    async fn ask_binary(&self, question: &str, context: &str) -> Result<bool, ServiceError>;

    /// Pick exactly one of the given options.
    async fn choose(
        &self,
        question: &str,
        options: &[String],
        context: &str,
    ) -> Result<String, ServiceError>;
}

/// How much of a chapter a regeneration request covers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RewriteScope {
    /// The offending sentence only.
    Sentence,
    /// The surrounding scene.
    Scene,
    /// The whole chapter.
    Chapter,
}

/// A content-generation request for one chapter.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChapterSpec {
    pub chapter_id: String,
    pub title: String,
    /// Character roster available to the generator.
    pub roster: Vec<String>,
    /// Generation instruction, including cause and dependency context.
    pub instruction: String,
    pub scope: RewriteScope,
}

impl ChapterSpec {
    pub fn new(chapter_id: impl Into<String>, title: impl Into<String>) -> Self {
        Self {
            chapter_id: chapter_id.into(),
            title: title.into(),
            roster: Vec::new(),
            instruction: String::new(),
            scope: RewriteScope::Chapter,
        }
    }

    pub fn with_roster(mut self, roster: Vec<String>) -> Self {
        self.roster = roster;
        self
    }

    pub fn with_instruction(mut self, instruction: impl Into<String>) -> Self {
        self.instruction = instruction.into();
        self
    }

    pub fn with_scope(mut self, scope: RewriteScope) -> Self {
        self.scope = scope;
        self
    }
}

/// The content-generation service: chapter prose and dialogue.
#[async_trait]
pub trait ContentService: Send + Sync {
    async fn generate_prose(&self, spec: &ChapterSpec) -> Result<String, ServiceError>;

    async fn generate_dialogue(&self, spec: &ChapterSpec)
        -> Result<Vec<DialogueLine>, ServiceError>;
}

// ============================================================================
// Bounded retry
// ============================================================================

/// Bounded retry with jittered exponential backoff.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    /// Total attempts, including the first.
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay: Duration::from_millis(250),
            max_delay: Duration::from_secs(4),
        }
    }
}

impl RetryPolicy {
    /// A policy that never retries.
    pub fn none() -> Self {
        Self {
            max_attempts: 1,
            ..Self::default()
        }
    }

    /// Backoff before the given retry (1-based), with jitter.
    fn delay_before(&self, retry: u32) -> Duration {
        let exp = self
            .base_delay
            .saturating_mul(1u32 << retry.saturating_sub(1).min(16));
        let capped = exp.min(self.max_delay);
        let jitter_range = (capped.as_millis() as u64 / 4).max(1);
        let jitter = rand::thread_rng().gen_range(0..jitter_range);
        capped + Duration::from_millis(jitter)
    }
}

/// Run a service call under the policy, retrying both unavailable and
/// malformed outcomes (a re-prompt is the historical fix for the latter).
/// Returns the last error once attempts are exhausted.
pub async fn with_retry<T, F, Fut>(policy: &RetryPolicy, mut call: F) -> Result<T, ServiceError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, ServiceError>>,
{
    let mut last_error = ServiceError::Unavailable("no attempts made".to_string());

    for attempt in 1..=policy.max_attempts.max(1) {
        match call().await {
            Ok(value) => return Ok(value),
            Err(err) => {
                tracing::debug!(attempt, error = %err, "service call attempt failed");
                last_error = err;
                if attempt < policy.max_attempts {
                    tokio::time::sleep(policy.delay_before(attempt)).await;
                }
            }
        }
    }

    Err(last_error)
}

// ============================================================================
// Oracle-backed implementations
// ============================================================================

const JUDGMENT_TOOL: &str = "submit_judgment";
const DIALOGUE_TOOL: &str = "submit_dialogue";

/// Maximum tokens for a judgment answer (labels, not prose).
const JUDGMENT_MAX_TOKENS: usize = 500;

/// Maximum tokens for generated chapter content.
const CONTENT_MAX_TOKENS: usize = 4096;

fn map_oracle_error(err: oracle::Error) -> ServiceError {
    match err {
        oracle::Error::Parse(msg) => ServiceError::Malformed(msg),
        other => ServiceError::Unavailable(other.to_string()),
    }
}

/// Judgment service backed by the Claude API.
#[derive(Clone)]
pub struct OracleJudge {
    client: Oracle,
    retry: RetryPolicy,
}

impl OracleJudge {
    pub fn new(client: Oracle) -> Self {
        Self {
            client,
            retry: RetryPolicy::default(),
        }
    }

    pub fn from_env() -> Result<Self, oracle::Error> {
        Ok(Self::new(Oracle::from_env()?))
    }

    pub fn with_retry_policy(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    async fn judge_once(&self, request: &JudgmentRequest) -> Result<JudgmentResponse, ServiceError> {
        let mut properties = serde_json::Map::new();
        let mut required = Vec::new();
        for field in &request.fields {
            let mut property = serde_json::json!({
                "type": "string",
                "description": field.description,
            });
            if !field.allowed.is_empty() {
                property["enum"] = serde_json::json!(field.allowed);
            }
            properties.insert(field.name.clone(), property);
            required.push(field.name.clone());
        }
        let schema = serde_json::json!({
            "type": "object",
            "properties": properties,
            "required": required,
        });

        let mut prompt = request.instruction.clone();
        if !request.context.is_empty() {
            prompt.push_str("\n\n## Context\n");
            prompt.push_str(&request.context);
        }

        let api_request = Request::new(vec![Message::user(prompt)])
            .with_max_tokens(JUDGMENT_MAX_TOKENS)
            .with_temperature(0.0)
            .with_forced_tool(Tool::new(
                JUDGMENT_TOOL,
                "Submit the requested labels, one value per field.",
                schema,
            ));

        let response = self
            .client
            .complete(api_request)
            .await
            .map_err(map_oracle_error)?;

        let input = response
            .tool_input(JUDGMENT_TOOL)
            .ok_or_else(|| ServiceError::Malformed("no judgment tool call in response".to_string()))?;

        let object = input
            .as_object()
            .ok_or_else(|| ServiceError::Malformed("judgment answer is not an object".to_string()))?;

        let mut values = BTreeMap::new();
        for (key, value) in object {
            if let Some(text) = value.as_str() {
                values.insert(key.clone(), text.to_string());
            }
        }

        Ok(JudgmentResponse { values })
    }
}

#[async_trait]
impl JudgmentService for OracleJudge {
    async fn judge(&self, request: JudgmentRequest) -> Result<JudgmentResponse, ServiceError> {
        with_retry(&self.retry, || self.judge_once(&request)).await
    }

    async fn ask_binary(&self, question: &str, context: &str) -> Result<bool, ServiceError> {
        let request = JudgmentRequest::new(question)
            .with_field(LabelField::new(
                "answer",
                "Answer the question with exactly YES or NO.",
                vec!["YES".to_string(), "NO".to_string()],
            ))
            .with_context(context);

        let response = self.judge(request).await?;
        match response.value("answer").map(|v| v.trim().to_uppercase()) {
            Some(answer) if answer == "YES" => Ok(true),
            Some(answer) if answer == "NO" => Ok(false),
            other => Err(ServiceError::Malformed(format!(
                "binary answer outside domain: {other:?}"
            ))),
        }
    }

    async fn choose(
        &self,
        question: &str,
        options: &[String],
        context: &str,
    ) -> Result<String, ServiceError> {
        let request = JudgmentRequest::new(question)
            .with_field(LabelField::new(
                "choice",
                "Pick exactly one of the allowed options.",
                options.to_vec(),
            ))
            .with_context(context);

        let response = self.judge(request).await?;
        match response.value("choice") {
            Some(choice) if options.iter().any(|o| o == choice) => Ok(choice.to_string()),
            other => Err(ServiceError::Malformed(format!(
                "choice outside offered options: {other:?}"
            ))),
        }
    }
}

/// Content-generation service backed by the Claude API.
#[derive(Clone)]
pub struct OracleContent {
    client: Oracle,
    retry: RetryPolicy,
}

impl OracleContent {
    pub fn new(client: Oracle) -> Self {
        Self {
            client,
            retry: RetryPolicy::default(),
        }
    }

    pub fn from_env() -> Result<Self, oracle::Error> {
        Ok(Self::new(Oracle::from_env()?))
    }

    pub fn with_retry_policy(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    fn build_prompt(spec: &ChapterSpec, want: &str) -> String {
        let mut prompt = format!(
            "Generate {want} for chapter \"{}\" ({}).\n",
            spec.title, spec.chapter_id
        );
        if !spec.roster.is_empty() {
            prompt.push_str(&format!("Characters available: {}.\n", spec.roster.join(", ")));
        }
        prompt.push_str(&format!("Scope: {:?}.\n\n", spec.scope));
        prompt.push_str(&spec.instruction);
        prompt
    }

    async fn prose_once(&self, spec: &ChapterSpec) -> Result<String, ServiceError> {
        let request = Request::new(vec![Message::user(Self::build_prompt(spec, "prose"))])
            .with_max_tokens(CONTENT_MAX_TOKENS)
            .with_temperature(0.8);

        let response = self
            .client
            .complete(request)
            .await
            .map_err(map_oracle_error)?;
        let text = response.text();
        if text.trim().is_empty() {
            return Err(ServiceError::Malformed("empty prose response".to_string()));
        }
        Ok(text)
    }

    async fn dialogue_once(&self, spec: &ChapterSpec) -> Result<Vec<DialogueLine>, ServiceError> {
        let schema = serde_json::json!({
            "type": "object",
            "properties": {
                "lines": {
                    "type": "array",
                    "items": {
                        "type": "object",
                        "properties": {
                            "speaker": {"type": "string"},
                            "line": {"type": "string"},
                        },
                        "required": ["speaker", "line"],
                    },
                },
            },
            "required": ["lines"],
        });

        let request = Request::new(vec![Message::user(Self::build_prompt(spec, "dialogue"))])
            .with_max_tokens(CONTENT_MAX_TOKENS)
            .with_temperature(0.8)
            .with_forced_tool(Tool::new(
                DIALOGUE_TOOL,
                "Submit the dialogue as an ordered list of speaker/line pairs.",
                schema,
            ));

        let response = self
            .client
            .complete(request)
            .await
            .map_err(map_oracle_error)?;

        let input = response
            .tool_input(DIALOGUE_TOOL)
            .ok_or_else(|| ServiceError::Malformed("no dialogue tool call in response".to_string()))?;

        #[derive(Deserialize)]
        struct Lines {
            lines: Vec<DialogueLine>,
        }

        let parsed: Lines = serde_json::from_value(input.clone())
            .map_err(|e| ServiceError::Malformed(format!("dialogue payload: {e}")))?;
        Ok(parsed.lines)
    }
}

#[async_trait]
impl ContentService for OracleContent {
    async fn generate_prose(&self, spec: &ChapterSpec) -> Result<String, ServiceError> {
        with_retry(&self.retry, || self.prose_once(spec)).await
    }

    async fn generate_dialogue(
        &self,
        spec: &ChapterSpec,
    ) -> Result<Vec<DialogueLine>, ServiceError> {
        with_retry(&self.retry, || self.dialogue_once(spec)).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    #[test]
    fn test_judgment_request_builder() {
        let request = JudgmentRequest::new("Classify the beat")
            .with_field(LabelField::new(
                "presence",
                "Does the beat admit dialogue?",
                vec!["AFFIRMED".to_string(), "DENIED".to_string()],
            ))
            .with_context("Scene context here");

        assert_eq!(request.fields.len(), 1);
        assert_eq!(request.fields[0].allowed.len(), 2);
        assert_eq!(request.context, "Scene context here");
    }

    #[tokio::test]
    async fn test_with_retry_succeeds_after_failures() {
        let attempts = AtomicU32::new(0);
        let policy = RetryPolicy {
            max_attempts: 3,
            base_delay: Duration::from_millis(1),
            max_delay: Duration::from_millis(2),
        };

        let result = with_retry(&policy, || {
            let n = attempts.fetch_add(1, Ordering::SeqCst);
            async move {
                if n < 2 {
                    Err(ServiceError::Unavailable("flaky".to_string()))
                } else {
                    Ok(42u32)
                }
            }
        })
        .await;

        assert_eq!(result, Ok(42));
        assert_eq!(attempts.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_with_retry_exhausts() {
        let policy = RetryPolicy {
            max_attempts: 2,
            base_delay: Duration::from_millis(1),
            max_delay: Duration::from_millis(2),
        };

        let result: Result<u32, _> = with_retry(&policy, || async {
            Err(ServiceError::Malformed("always bad".to_string()))
        })
        .await;

        assert_eq!(result, Err(ServiceError::Malformed("always bad".to_string())));
    }

    #[tokio::test]
    async fn test_retry_none_is_single_attempt() {
        let attempts = AtomicU32::new(0);

        let _: Result<(), _> = with_retry(&RetryPolicy::none(), || {
            attempts.fetch_add(1, Ordering::SeqCst);
            async { Err(ServiceError::Unavailable("down".to_string())) }
        })
        .await;

        assert_eq!(attempts.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    #[ignore = "requires ANTHROPIC_API_KEY"]
    async fn test_live_binary_judgment() {
        dotenvy::dotenv().ok();
        let judge = match OracleJudge::from_env() {
            Ok(judge) => judge,
            Err(_) => return,
        };

        let answer = judge
            .ask_binary("Is the sea made of water? Answer YES or NO.", "")
            .await;
        assert_eq!(answer, Ok(true));
    }

    #[test]
    fn test_chapter_spec_builder() {
        let spec = ChapterSpec::new("Chapter 5", "The Reckoning")
            .with_roster(vec!["Mira".to_string(), "Aldric".to_string()])
            .with_instruction("Regenerate after upstream edit")
            .with_scope(RewriteScope::Scene);

        assert_eq!(spec.scope, RewriteScope::Scene);
        assert_eq!(spec.roster.len(), 2);
    }
}
