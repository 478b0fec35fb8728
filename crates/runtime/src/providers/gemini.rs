//! Gemini API decision provider.

use std::fmt;
use std::time::Duration;

use registry::{ToolDescriptor, ToolOutcome};
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use tracing::debug;

use crate::call::{ToolCall, ToolResult};
use crate::decision::{
    Decision, DecisionProvider, function_declarations, parse_decision_text, parse_function_call,
};
use crate::{Error, Result};

const GEMINI_API_URL: &str = "https://generativelanguage.googleapis.com/v1beta";

/// Default model.
pub const DEFAULT_MODEL: &str = "gemini-2.5-flash";

const DECIDE_INSTRUCTION: &str = "Use a tool when one fits the user's request. \
     If no tool applies, answer directly.";

const SYNTHESIZE_INSTRUCTION: &str = "Extract and return only the result text \
     (for example translated_text or transcribed_text) from the function response.";

/// How the model is asked to select a tool.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DecisionMode {
    /// Native function declarations; the reply is a typed call or text.
    #[default]
    FunctionCalling,
    /// Tools rendered into a selector prompt; the reply is a JSON object.
    JsonPrompt,
}

impl fmt::Display for DecisionMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::FunctionCalling => write!(f, "function_calling"),
            Self::JsonPrompt => write!(f, "json_prompt"),
        }
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// API Wire Types
// ─────────────────────────────────────────────────────────────────────────────

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct ApiRequest {
    contents: Vec<ApiContent>,
    #[serde(skip_serializing_if = "Option::is_none")]
    system_instruction: Option<ApiContent>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    tools: Vec<ApiTool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    generation_config: Option<ApiGenerationConfig>,
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct ApiContent {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    role: Option<String>,
    #[serde(default)]
    parts: Vec<ApiPart>,
}

impl ApiContent {
    fn new(role: Option<&str>, part: ApiPart) -> Self {
        Self {
            role: role.map(String::from),
            parts: vec![part],
        }
    }
}

#[derive(Debug, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ApiPart {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    text: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    function_call: Option<ApiFunctionCall>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    function_response: Option<ApiFunctionResponse>,
}

impl ApiPart {
    fn text(text: impl Into<String>) -> Self {
        Self {
            text: Some(text.into()),
            ..Self::default()
        }
    }
}

#[derive(Debug, Serialize, Deserialize)]
struct ApiFunctionCall {
    name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    args: Option<Value>,
}

#[derive(Debug, Serialize, Deserialize)]
struct ApiFunctionResponse {
    name: String,
    response: Value,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct ApiTool {
    function_declarations: Vec<ApiFunctionDeclaration>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct ApiFunctionDeclaration {
    name: String,
    description: String,
    parameters_json_schema: Value,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct ApiGenerationConfig {
    response_mime_type: &'static str,
}

#[derive(Debug, Deserialize)]
struct ApiResponse {
    #[serde(default)]
    candidates: Vec<ApiCandidate>,
}

#[derive(Debug, Deserialize)]
struct ApiCandidate {
    #[serde(default)]
    content: Option<ApiContent>,
}

impl ApiResponse {
    /// Parts of the first candidate.
    fn into_parts(self) -> Vec<ApiPart> {
        self.candidates
            .into_iter()
            .next()
            .and_then(|c| c.content)
            .map(|c| c.parts)
            .unwrap_or_default()
    }
}

fn joined_text(parts: &[ApiPart]) -> String {
    parts
        .iter()
        .filter_map(|p| p.text.as_deref())
        .collect::<Vec<_>>()
        .join("")
}

// ─────────────────────────────────────────────────────────────────────────────
// Backend Implementation
// ─────────────────────────────────────────────────────────────────────────────

/// Builder for creating a Gemini backend.
#[derive(Debug, Clone)]
pub struct GeminiBackendBuilder {
    api_key: String,
    model: String,
    mode: DecisionMode,
    base_url: String,
    timeout: Duration,
    system: Option<String>,
}

impl GeminiBackendBuilder {
    pub fn new(api_key: impl Into<String>, model: impl Into<String>) -> Self {
        Self {
            api_key: api_key.into(),
            model: model.into(),
            mode: DecisionMode::default(),
            base_url: GEMINI_API_URL.to_string(),
            timeout: Duration::from_secs(60),
            system: None,
        }
    }

    pub fn mode(mut self, mode: DecisionMode) -> Self {
        self.mode = mode;
        self
    }

    /// Override the API root (everything before `/models/...`).
    pub fn base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = base_url.into();
        self
    }

    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Replace the decision-step system instruction.
    pub fn system(mut self, system: impl Into<String>) -> Self {
        self.system = Some(system.into());
        self
    }

    pub fn build(self) -> Result<GeminiBackend> {
        if self.api_key.trim().is_empty() {
            return Err(Error::Config("Gemini API key is empty".into()));
        }

        let client = reqwest::Client::builder()
            .timeout(self.timeout)
            .build()
            .map_err(|e| Error::Config(e.to_string()))?;

        Ok(GeminiBackend {
            client,
            api_key: self.api_key,
            model: self.model,
            mode: self.mode,
            base_url: self.base_url.trim_end_matches('/').to_string(),
            system: self.system,
        })
    }
}

/// Gemini API backend.
pub struct GeminiBackend {
    client: reqwest::Client,
    api_key: String,
    model: String,
    mode: DecisionMode,
    base_url: String,
    system: Option<String>,
}

impl GeminiBackend {
    pub fn builder(api_key: impl Into<String>, model: impl Into<String>) -> GeminiBackendBuilder {
        GeminiBackendBuilder::new(api_key, model)
    }

    pub fn mode(&self) -> DecisionMode {
        self.mode
    }

    fn system_instruction(&self, default: &str) -> ApiContent {
        let text = self.system.as_deref().unwrap_or(default);
        ApiContent::new(None, ApiPart::text(text))
    }

    async fn generate(&self, request: &ApiRequest) -> Result<Vec<ApiPart>> {
        let url = format!("{}/models/{}:generateContent", self.base_url, self.model);

        let response = self
            .client
            .post(url)
            .header("x-goog-api-key", &self.api_key)
            .header("content-type", "application/json")
            .json(request)
            .send()
            .await
            .map_err(|e| Error::Network(e.to_string()))?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            return Err(Error::Api(format!("{status}: {body}")));
        }

        let api_response: ApiResponse = response
            .json()
            .await
            .map_err(|e| Error::Api(e.to_string()))?;

        Ok(api_response.into_parts())
    }

    async fn decide_with_functions(&self, input: &str, tools: &[ToolDescriptor]) -> Result<Decision> {
        let declarations: Vec<ApiFunctionDeclaration> = function_declarations(tools)
            .into_iter()
            .map(|d| ApiFunctionDeclaration {
                name: d.name,
                description: d.description,
                parameters_json_schema: d.parameters,
            })
            .collect();

        let tools = if declarations.is_empty() {
            Vec::new()
        } else {
            vec![ApiTool {
                function_declarations: declarations,
            }]
        };

        let request = ApiRequest {
            contents: vec![ApiContent::new(Some("user"), ApiPart::text(input))],
            system_instruction: Some(self.system_instruction(DECIDE_INSTRUCTION)),
            tools,
            generation_config: None,
        };

        let mut parts = self.generate(&request).await?.into_iter();
        let first = parts
            .next()
            .ok_or_else(|| Error::Decision("model returned no content".into()))?;

        if parts.any(|p| p.function_call.is_some()) {
            debug!("ignoring additional function calls after the first part");
        }

        match first {
            ApiPart {
                function_call: Some(call),
                ..
            } => parse_function_call(Some(&call.name), call.args),
            ApiPart {
                text: Some(text), ..
            } => parse_decision_text(&text),
            _ => Err(Error::Decision(
                "first part is neither text nor a function call".into(),
            )),
        }
    }

    async fn decide_with_prompt(&self, input: &str, tools: &[ToolDescriptor]) -> Result<Decision> {
        let request = ApiRequest {
            contents: vec![ApiContent::new(
                Some("user"),
                ApiPart::text(selector_prompt(input, tools)),
            )],
            system_instruction: self.system.as_deref().map(|s| ApiContent::new(None, ApiPart::text(s))),
            tools: Vec::new(),
            generation_config: Some(ApiGenerationConfig {
                response_mime_type: "application/json",
            }),
        };

        let parts = self.generate(&request).await?;
        parse_decision_text(&joined_text(&parts))
    }
}

/// Prompt asking the model to answer with `{name, arguments}`.
fn selector_prompt(input: &str, tools: &[ToolDescriptor]) -> String {
    let listing = tools
        .iter()
        .map(|t| {
            let schema = serde_json::to_string(&t.parameter_schema).unwrap_or_default();
            format!("- {}: {}\n  parameters: {schema}", t.name, t.description)
        })
        .collect::<Vec<_>>()
        .join("\n");

    format!(
        "You are a tool selector. Based on the user input, decide which tool to call.\n\n\
         Available tools:\n{listing}\n\n\
         User input: {input}\n\n\
         Respond with ONLY a JSON object in this format:\n\
         {{\"name\": \"tool_name\", \"arguments\": {{\"arg1\": \"value1\"}}}}\n\n\
         If the tool takes no arguments, use an empty object for \"arguments\".\n\
         If no tool applies, respond with {{\"name\": null, \"text\": \"<your answer>\"}}."
    )
}

impl fmt::Display for GeminiBackend {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "gemini({}, mode={})", self.model, self.mode)
    }
}

impl DecisionProvider for GeminiBackend {
    async fn decide(&self, input: &str, tools: &[ToolDescriptor]) -> Result<Decision> {
        match self.mode {
            DecisionMode::FunctionCalling => self.decide_with_functions(input, tools).await,
            DecisionMode::JsonPrompt => self.decide_with_prompt(input, tools).await,
        }
    }

    async fn synthesize(&self, input: &str, call: &ToolCall, result: &ToolResult) -> Result<String> {
        let response = match &result.outcome {
            ToolOutcome::Ok { payload } => Value::Object(payload.clone()),
            ToolOutcome::Error { kind, message } => json!({"error": message, "kind": kind}),
        };

        let request = ApiRequest {
            contents: vec![
                ApiContent::new(Some("user"), ApiPart::text(input)),
                ApiContent::new(
                    Some("model"),
                    ApiPart {
                        function_call: Some(ApiFunctionCall {
                            name: call.tool_name.clone(),
                            args: Some(Value::Object(call.arguments.clone())),
                        }),
                        ..ApiPart::default()
                    },
                ),
                ApiContent::new(
                    Some("user"),
                    ApiPart {
                        function_response: Some(ApiFunctionResponse {
                            name: call.tool_name.clone(),
                            response,
                        }),
                        ..ApiPart::default()
                    },
                ),
            ],
            system_instruction: Some(ApiContent::new(None, ApiPart::text(SYNTHESIZE_INSTRUCTION))),
            tools: Vec::new(),
            generation_config: None,
        };

        let text = joined_text(&self.generate(&request).await?);
        if text.trim().is_empty() {
            return Err(Error::Decision("model returned no text".into()));
        }
        Ok(text.trim().to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::extract::{Path, State};
    use axum::http::{HeaderMap, StatusCode};
    use axum::routing::post;
    use axum::{Json, Router};
    use registry::{Arguments, ParameterSchema, PropertySchema};
    use std::sync::{Arc, Mutex};

    #[derive(Clone)]
    struct Fake {
        status: StatusCode,
        reply: Value,
        seen: Arc<Mutex<Vec<(String, Option<String>, Value)>>>,
    }

    async fn handle(
        State(fake): State<Fake>,
        Path(call): Path<String>,
        headers: HeaderMap,
        Json(body): Json<Value>,
    ) -> (StatusCode, Json<Value>) {
        let key = headers
            .get("x-goog-api-key")
            .and_then(|v| v.to_str().ok())
            .map(String::from);
        fake.seen.lock().unwrap().push((call, key, body));
        (fake.status, Json(fake.reply.clone()))
    }

    async fn serve(status: StatusCode, reply: Value) -> (String, Fake) {
        let fake = Fake {
            status,
            reply,
            seen: Arc::default(),
        };
        let app = Router::new()
            .route("/models/{call}", post(handle))
            .with_state(fake.clone());
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });
        (format!("http://{addr}"), fake)
    }

    fn backend(base: &str, mode: DecisionMode) -> GeminiBackend {
        GeminiBackend::builder("test-key", DEFAULT_MODEL)
            .base_url(base)
            .mode(mode)
            .build()
            .unwrap()
    }

    fn tools() -> Vec<ToolDescriptor> {
        vec![
            ToolDescriptor::new("translate", "Translates the given text to Thai language.")
                .with_schema(
                    ParameterSchema::object().required_property("text", PropertySchema::string()),
                ),
        ]
    }

    fn candidate(parts: Value) -> Value {
        json!({"candidates": [{"content": {"role": "model", "parts": parts}}]})
    }

    #[test]
    fn empty_api_key_is_a_config_error() {
        let err = GeminiBackend::builder(" ", DEFAULT_MODEL).build().err().unwrap();
        assert!(matches!(err, Error::Config(_)));
    }

    #[test]
    fn mode_deserializes_from_snake_case() {
        let mode: DecisionMode = serde_json::from_value(json!("json_prompt")).unwrap();
        assert_eq!(mode, DecisionMode::JsonPrompt);
        assert_eq!(mode.to_string(), "json_prompt");
    }

    #[tokio::test]
    async fn function_call_selects_a_tool() {
        let (base, fake) = serve(
            StatusCode::OK,
            candidate(json!([
                {"functionCall": {"name": "translate", "args": {"text": "hello"}}},
                {"functionCall": {"name": "translate", "args": {"text": "ignored"}}}
            ])),
        )
        .await;

        let decision = backend(&base, DecisionMode::FunctionCalling)
            .decide("hello", &tools())
            .await
            .unwrap();
        assert_eq!(
            decision,
            Decision::ToolSelected {
                name: "translate".into(),
                arguments: json!({"text": "hello"}).as_object().cloned().unwrap(),
            }
        );

        let seen = fake.seen.lock().unwrap();
        let (call, key, body) = &seen[0];
        assert_eq!(call, "gemini-2.5-flash:generateContent");
        assert_eq!(key.as_deref(), Some("test-key"));
        let decl = &body["tools"][0]["functionDeclarations"][0];
        assert_eq!(decl["name"], "translate");
        assert_eq!(decl["parametersJsonSchema"]["required"], json!(["text"]));
        assert_eq!(body["contents"][0]["parts"][0]["text"], "hello");
    }

    #[tokio::test]
    async fn text_reply_is_a_direct_answer() {
        let (base, _fake) = serve(StatusCode::OK, candidate(json!([{"text": "hi"}]))).await;
        let decision = backend(&base, DecisionMode::FunctionCalling)
            .decide("hey", &tools())
            .await
            .unwrap();
        assert_eq!(decision, Decision::NoToolSelected("hi".into()));
    }

    #[tokio::test]
    async fn numeric_text_reply_is_a_direct_answer() {
        let (base, _fake) = serve(StatusCode::OK, candidate(json!([{"text": "42"}]))).await;
        for mode in [DecisionMode::FunctionCalling, DecisionMode::JsonPrompt] {
            let decision = backend(&base, mode).decide("6 * 7?", &tools()).await.unwrap();
            assert_eq!(decision, Decision::NoToolSelected("42".into()), "{mode}");
        }
    }

    #[tokio::test]
    async fn empty_candidates_are_a_decision_error() {
        let (base, _fake) = serve(StatusCode::OK, json!({"candidates": []})).await;
        let err = backend(&base, DecisionMode::FunctionCalling)
            .decide("hey", &tools())
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Decision(_)));
    }

    #[tokio::test]
    async fn json_prompt_mode_parses_the_reply() {
        let (base, fake) = serve(
            StatusCode::OK,
            candidate(json!([{"text": "{\"name\": \"translate\", \"arguments\": {\"text\": \"hi\"}}"}])),
        )
        .await;

        let decision = backend(&base, DecisionMode::JsonPrompt)
            .decide("hi", &tools())
            .await
            .unwrap();
        assert!(matches!(decision, Decision::ToolSelected { ref name, .. } if name == "translate"));

        let seen = fake.seen.lock().unwrap();
        let body = &seen[0].2;
        assert_eq!(body["generationConfig"]["responseMimeType"], "application/json");
        assert!(body.get("tools").is_none());
        let prompt = body["contents"][0]["parts"][0]["text"].as_str().unwrap();
        assert!(prompt.contains("- translate: Translates the given text to Thai language."));
        assert!(prompt.contains("User input: hi"));
    }

    #[tokio::test]
    async fn synthesize_sends_the_function_response() {
        let (base, fake) = serve(StatusCode::OK, candidate(json!([{"text": " สวัสดี \n"}]))).await;

        let mut arguments = Arguments::new();
        arguments.insert("text".into(), json!("hello"));
        let call = ToolCall::new("translate", arguments);
        let mut payload = registry::Payload::new();
        payload.insert("translated_text".into(), json!("สวัสดี"));
        let result = ToolResult::ok(call.correlation_id.clone(), payload);

        let text = backend(&base, DecisionMode::FunctionCalling)
            .synthesize("hello", &call, &result)
            .await
            .unwrap();
        assert_eq!(text, "สวัสดี");

        let seen = fake.seen.lock().unwrap();
        let contents = &seen[0].2["contents"];
        assert_eq!(contents[1]["role"], "model");
        assert_eq!(contents[1]["parts"][0]["functionCall"]["name"], "translate");
        assert_eq!(
            contents[2]["parts"][0]["functionResponse"]["response"]["translated_text"],
            "สวัสดี"
        );
    }

    #[tokio::test]
    async fn api_errors_carry_status_and_body() {
        let (base, _fake) = serve(
            StatusCode::BAD_REQUEST,
            json!({"error": {"message": "API key not valid"}}),
        )
        .await;
        let err = backend(&base, DecisionMode::FunctionCalling)
            .decide("hi", &tools())
            .await
            .unwrap_err();
        match err {
            Error::Api(message) => {
                assert!(message.starts_with("400"), "{message}");
                assert!(message.contains("API key not valid"));
            }
            other => panic!("unexpected error: {other}"),
        }
    }
}
