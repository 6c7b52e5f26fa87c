//! Minimal Claude Messages API client for discrete structured judgments.
//!
//! This crate is the transport layer for services that ask a model small,
//! bounded questions: classify a narrative beat, answer yes/no, pick one
//! option from a list, or generate a bounded block of content. It supports:
//! - Non-streaming completions with an explicit per-call timeout
//! - Tool definitions with forced tool choice, so enumerated-schema answers
//!   come back as machine-readable JSON instead of free text
//!
//! Callers are expected to validate every returned value against its own
//! enumerated domain; this crate only guarantees transport and shape.

use reqwest::header::{HeaderMap, HeaderValue, CONTENT_TYPE};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use thiserror::Error;

const API_BASE: &str = "https://api.anthropic.com/v1";
const API_VERSION: &str = "2023-06-01";
const DEFAULT_MODEL: &str = "claude-sonnet-4-20250514";

/// Default wall-clock budget for a single completion call.
const DEFAULT_CALL_TIMEOUT: Duration = Duration::from_secs(60);

/// Errors that can occur when using the Oracle client.
#[derive(Debug, Error)]
pub enum Error {
    #[error("API key not configured")]
    NoApiKey,

    #[error("Network error: {0}")]
    Network(String),

    #[error("Call exceeded timeout of {0:?}")]
    Timeout(Duration),

    #[error("API error (status {status}): {message}")]
    Api { status: u16, message: String },

    #[error("Failed to parse response: {0}")]
    Parse(String),

    #[error("Invalid configuration: {0}")]
    Config(String),
}

impl Error {
    /// Whether this failure is worth retrying at the call site.
    pub fn is_retryable(&self) -> bool {
        match self {
            Error::Network(_) | Error::Timeout(_) => true,
            Error::Api { status, .. } => *status == 429 || *status >= 500,
            _ => false,
        }
    }
}

/// Claude API client for bounded, single-shot calls.
#[derive(Clone)]
pub struct Oracle {
    client: reqwest::Client,
    api_key: String,
    model: String,
    call_timeout: Duration,
}

impl Oracle {
    /// Create a new client with the given API key.
    pub fn new(api_key: impl Into<String>) -> Self {
        Self {
            client: reqwest::Client::builder()
                .connect_timeout(Duration::from_secs(30))
                .build()
                .expect("Failed to build HTTP client"),
            api_key: api_key.into(),
            model: DEFAULT_MODEL.to_string(),
            call_timeout: DEFAULT_CALL_TIMEOUT,
        }
    }

    /// Create a client from the ANTHROPIC_API_KEY environment variable.
    pub fn from_env() -> Result<Self, Error> {
        let api_key = std::env::var("ANTHROPIC_API_KEY").map_err(|_| Error::NoApiKey)?;
        Ok(Self::new(api_key))
    }

    /// Set the default model for this client.
    pub fn with_model(mut self, model: impl Into<String>) -> Self {
        self.model = model.into();
        self
    }

    /// Set the wall-clock budget applied to every completion call.
    pub fn with_call_timeout(mut self, timeout: Duration) -> Self {
        self.call_timeout = timeout;
        self
    }

    /// The model used when a request does not name one.
    pub fn model(&self) -> &str {
        &self.model
    }

    /// Send a completion request and return the full response.
    ///
    /// The call is bounded by the client's call timeout; a call that
    /// exceeds it fails with [`Error::Timeout`] rather than blocking.
    pub async fn complete(&self, request: Request) -> Result<Response, Error> {
        let deadline = self.call_timeout;
        match tokio::time::timeout(deadline, self.complete_inner(request)).await {
            Ok(result) => result,
            Err(_) => Err(Error::Timeout(deadline)),
        }
    }

    async fn complete_inner(&self, request: Request) -> Result<Response, Error> {
        let api_request = self.build_api_request(&request);
        let headers = self.build_headers()?;

        let response = self
            .client
            .post(format!("{API_BASE}/messages"))
            .headers(headers)
            .json(&api_request)
            .send()
            .await
            .map_err(|e| Error::Network(e.to_string()))?;

        if !response.status().is_success() {
            let status = response.status().as_u16();
            let body = response.text().await.unwrap_or_default();
            return Err(Error::Api {
                status,
                message: body,
            });
        }

        let api_response: ApiResponse = response
            .json()
            .await
            .map_err(|e| Error::Parse(e.to_string()))?;

        Ok(convert_response(api_response))
    }

    fn build_headers(&self) -> Result<HeaderMap, Error> {
        let mut headers = HeaderMap::new();
        headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
        headers.insert(
            "x-api-key",
            HeaderValue::from_str(&self.api_key)
                .map_err(|e| Error::Config(format!("Invalid API key: {e}")))?,
        );
        headers.insert("anthropic-version", HeaderValue::from_static(API_VERSION));
        Ok(headers)
    }

    fn build_api_request(&self, request: &Request) -> ApiRequest {
        ApiRequest {
            model: request.model.clone().unwrap_or_else(|| self.model.clone()),
            max_tokens: request.max_tokens,
            system: request.system.clone(),
            messages: request
                .messages
                .iter()
                .map(|m| ApiMessage {
                    role: match m.role {
                        Role::User => "user".to_string(),
                        Role::Assistant => "assistant".to_string(),
                    },
                    content: m.content.iter().map(ApiContentBlock::from).collect(),
                })
                .collect(),
            temperature: request.temperature,
            tools: request.tools.as_ref().map(|tools| {
                tools
                    .iter()
                    .map(|t| ApiTool {
                        name: t.name.clone(),
                        description: t.description.clone(),
                        input_schema: t.input_schema.clone(),
                    })
                    .collect()
            }),
            tool_choice: request.tool_choice.as_ref().map(|tc| match tc {
                ToolChoice::Auto => ApiToolChoice {
                    r#type: "auto".to_string(),
                    name: None,
                },
                ToolChoice::Any => ApiToolChoice {
                    r#type: "any".to_string(),
                    name: None,
                },
                ToolChoice::Tool { name } => ApiToolChoice {
                    r#type: "tool".to_string(),
                    name: Some(name.clone()),
                },
            }),
        }
    }
}

fn convert_response(api_response: ApiResponse) -> Response {
    let content: Vec<ContentBlock> = api_response
        .content
        .into_iter()
        .map(|c| match c {
            ApiContent::Text { text } => ContentBlock::Text { text },
            ApiContent::ToolUse { id, name, input } => ContentBlock::ToolUse { id, name, input },
            ApiContent::Thinking { thinking } => ContentBlock::Text { text: thinking },
        })
        .collect();

    let stop_reason = match api_response.stop_reason.as_str() {
        "end_turn" => StopReason::EndTurn,
        "max_tokens" => StopReason::MaxTokens,
        "stop_sequence" => StopReason::StopSequence,
        "tool_use" => StopReason::ToolUse,
        _ => StopReason::EndTurn,
    };

    Response {
        id: api_response.id,
        model: api_response.model,
        content,
        stop_reason,
        usage: Usage {
            input_tokens: api_response.usage.input_tokens,
            output_tokens: api_response.usage.output_tokens,
        },
    }
}

// ============================================================================
// Public types
// ============================================================================

/// A completion request.
#[derive(Debug, Clone)]
pub struct Request {
    pub model: Option<String>,
    pub max_tokens: usize,
    pub system: Option<String>,
    pub messages: Vec<Message>,
    pub temperature: Option<f32>,
    pub tools: Option<Vec<Tool>>,
    pub tool_choice: Option<ToolChoice>,
}

impl Request {
    /// Create a new request with the given messages.
    pub fn new(messages: Vec<Message>) -> Self {
        Self {
            model: None,
            max_tokens: 1024,
            system: None,
            messages,
            temperature: None,
            tools: None,
            tool_choice: None,
        }
    }

    pub fn with_model(mut self, model: impl Into<String>) -> Self {
        self.model = Some(model.into());
        self
    }

    pub fn with_max_tokens(mut self, max_tokens: usize) -> Self {
        self.max_tokens = max_tokens;
        self
    }

    pub fn with_system(mut self, system: impl Into<String>) -> Self {
        self.system = Some(system.into());
        self
    }

    pub fn with_temperature(mut self, temperature: f32) -> Self {
        self.temperature = Some(temperature);
        self
    }

    /// Attach a single tool and force the model to answer through it.
    ///
    /// This is how enumerated-schema judgments are requested: the tool's
    /// input schema is the answer schema, and the answer arrives as the
    /// tool call's input JSON.
    pub fn with_forced_tool(mut self, tool: Tool) -> Self {
        self.tool_choice = Some(ToolChoice::Tool {
            name: tool.name.clone(),
        });
        self.tools = Some(vec![tool]);
        self
    }

    pub fn with_tools(mut self, tools: Vec<Tool>) -> Self {
        self.tools = Some(tools);
        self
    }

    pub fn with_tool_choice(mut self, tool_choice: ToolChoice) -> Self {
        self.tool_choice = Some(tool_choice);
        self
    }
}

/// A message in the conversation.
#[derive(Debug, Clone)]
pub struct Message {
    pub role: Role,
    pub content: Vec<ContentBlock>,
}

impl Message {
    /// Create a user message with text content.
    pub fn user(text: impl Into<String>) -> Self {
        Self {
            role: Role::User,
            content: vec![ContentBlock::Text { text: text.into() }],
        }
    }

    /// Create an assistant message with text content.
    pub fn assistant(text: impl Into<String>) -> Self {
        Self {
            role: Role::Assistant,
            content: vec![ContentBlock::Text { text: text.into() }],
        }
    }
}

/// The role of a message sender.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    User,
    Assistant,
}

/// A block of content in a message.
#[derive(Debug, Clone)]
pub enum ContentBlock {
    Text {
        text: String,
    },
    ToolUse {
        id: String,
        name: String,
        input: serde_json::Value,
    },
    ToolResult {
        tool_use_id: String,
        content: String,
        is_error: bool,
    },
}

impl ContentBlock {
    /// Extract text from a Text content block.
    pub fn as_text(&self) -> Option<&str> {
        if let ContentBlock::Text { text } = self {
            Some(text)
        } else {
            None
        }
    }
}

/// A tool definition. For judgment calls the input schema doubles as the
/// answer schema.
#[derive(Debug, Clone)]
pub struct Tool {
    pub name: String,
    pub description: String,
    pub input_schema: serde_json::Value,
}

impl Tool {
    pub fn new(
        name: impl Into<String>,
        description: impl Into<String>,
        input_schema: serde_json::Value,
    ) -> Self {
        Self {
            name: name.into(),
            description: description.into(),
            input_schema,
        }
    }
}

/// Tool choice configuration.
#[derive(Debug, Clone)]
pub enum ToolChoice {
    Auto,
    Any,
    Tool { name: String },
}

/// A completion response.
#[derive(Debug, Clone)]
pub struct Response {
    pub id: String,
    pub model: String,
    pub content: Vec<ContentBlock>,
    pub stop_reason: StopReason,
    pub usage: Usage,
}

impl Response {
    /// Get all text content concatenated.
    pub fn text(&self) -> String {
        self.content
            .iter()
            .filter_map(|block| block.as_text())
            .collect::<Vec<_>>()
            .join("")
    }

    /// Get the input JSON of the first tool call with the given name.
    ///
    /// This is where a forced-tool judgment answer lives.
    pub fn tool_input(&self, name: &str) -> Option<&serde_json::Value> {
        self.content.iter().find_map(|block| match block {
            ContentBlock::ToolUse {
                name: tool_name,
                input,
                ..
            } if tool_name == name => Some(input),
            _ => None,
        })
    }
}

/// Why the model stopped generating.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopReason {
    EndTurn,
    MaxTokens,
    StopSequence,
    ToolUse,
}

/// Token usage information.
#[derive(Debug, Clone)]
pub struct Usage {
    pub input_tokens: usize,
    pub output_tokens: usize,
}

// ============================================================================
// Internal API types
// ============================================================================

#[derive(Debug, Serialize)]
struct ApiRequest {
    model: String,
    max_tokens: usize,
    #[serde(skip_serializing_if = "Option::is_none")]
    system: Option<String>,
    messages: Vec<ApiMessage>,
    #[serde(skip_serializing_if = "Option::is_none")]
    temperature: Option<f32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    tools: Option<Vec<ApiTool>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    tool_choice: Option<ApiToolChoice>,
}

#[derive(Debug, Serialize)]
struct ApiMessage {
    role: String,
    content: Vec<ApiContentBlock>,
}

#[derive(Debug, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum ApiContentBlock {
    Text {
        text: String,
    },
    ToolUse {
        id: String,
        name: String,
        input: serde_json::Value,
    },
    ToolResult {
        tool_use_id: String,
        content: String,
        is_error: bool,
    },
}

impl From<&ContentBlock> for ApiContentBlock {
    fn from(block: &ContentBlock) -> Self {
        match block {
            ContentBlock::Text { text } => ApiContentBlock::Text { text: text.clone() },
            ContentBlock::ToolUse { id, name, input } => ApiContentBlock::ToolUse {
                id: id.clone(),
                name: name.clone(),
                input: input.clone(),
            },
            ContentBlock::ToolResult {
                tool_use_id,
                content,
                is_error,
            } => ApiContentBlock::ToolResult {
                tool_use_id: tool_use_id.clone(),
                content: content.clone(),
                is_error: *is_error,
            },
        }
    }
}

#[derive(Debug, Serialize)]
struct ApiTool {
    name: String,
    description: String,
    input_schema: serde_json::Value,
}

#[derive(Debug, Serialize)]
struct ApiToolChoice {
    r#type: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    name: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ApiResponse {
    id: String,
    model: String,
    content: Vec<ApiContent>,
    stop_reason: String,
    usage: ApiUsage,
}

#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum ApiContent {
    Text {
        text: String,
    },
    ToolUse {
        id: String,
        name: String,
        input: serde_json::Value,
    },
    Thinking {
        thinking: String,
    },
}

#[derive(Debug, Deserialize)]
struct ApiUsage {
    input_tokens: usize,
    output_tokens: usize,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_client_creation() {
        let client = Oracle::new("test-key");
        assert_eq!(client.model(), DEFAULT_MODEL);
    }

    #[test]
    fn test_client_with_model() {
        let client = Oracle::new("test-key").with_model("claude-3-5-haiku-20241022");
        assert_eq!(client.model(), "claude-3-5-haiku-20241022");
    }

    #[test]
    fn test_request_builder() {
        let request = Request::new(vec![Message::user("Classify this beat")])
            .with_system("You label narrative beats")
            .with_max_tokens(500)
            .with_temperature(0.0);

        assert_eq!(request.max_tokens, 500);
        assert!(request.system.is_some());
        assert_eq!(request.temperature, Some(0.0));
    }

    #[test]
    fn test_forced_tool_sets_choice() {
        let tool = Tool::new(
            "classify",
            "Answer the classification",
            json!({"type": "object", "properties": {}}),
        );
        let request = Request::new(vec![Message::user("go")]).with_forced_tool(tool);

        assert!(matches!(
            request.tool_choice,
            Some(ToolChoice::Tool { ref name }) if name == "classify"
        ));
        assert_eq!(request.tools.as_ref().map(|t| t.len()), Some(1));
    }

    #[test]
    fn test_response_tool_input() {
        let response = Response {
            id: "msg_1".to_string(),
            model: DEFAULT_MODEL.to_string(),
            content: vec![
                ContentBlock::Text {
                    text: "answering".to_string(),
                },
                ContentBlock::ToolUse {
                    id: "tu_1".to_string(),
                    name: "classify".to_string(),
                    input: json!({"presence": "AFFIRMED"}),
                },
            ],
            stop_reason: StopReason::ToolUse,
            usage: Usage {
                input_tokens: 10,
                output_tokens: 5,
            },
        };

        let input = response.tool_input("classify").unwrap();
        assert_eq!(input["presence"], "AFFIRMED");
        assert!(response.tool_input("other").is_none());
        assert_eq!(response.text(), "answering");
    }

    #[test]
    fn test_error_retryability() {
        assert!(Error::Network("reset".to_string()).is_retryable());
        assert!(Error::Timeout(Duration::from_secs(5)).is_retryable());
        assert!(Error::Api {
            status: 529,
            message: "overloaded".to_string()
        }
        .is_retryable());
        assert!(!Error::Api {
            status: 400,
            message: "bad request".to_string()
        }
        .is_retryable());
        assert!(!Error::NoApiKey.is_retryable());
    }
}
