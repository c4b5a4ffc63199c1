#![forbid(unsafe_code)]

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::{Duration, Instant};

use anyhow::{anyhow, Context, Result};
use crew_desk_domain::{Persona, RuntimeBinding, StageReply, StageRequest};
use serde_json::{json, Value};
use sha2::{Digest, Sha256};

const DEFAULT_CHAT_URL: &str = "https://api.openai.com/v1/chat/completions";
const DEFAULT_API_KEY_ENV: &str = "OPENAI_API_KEY";

/// The external agent engine, invoked once per stage.
///
/// Implementations are treated as stateless per call; everything a stage
/// needs arrives in the request.
pub trait AgentRuntime: Send + Sync {
    fn runtime_name(&self) -> &'static str;

    #[allow(clippy::missing_errors_doc)]
    fn invoke(&self, request: &StageRequest) -> Result<StageReply>;
}

/// Deterministic in-process runtime.
///
/// Without scripted replies it answers with a token derived from the request
/// hash, so identical requests get identical replies. Scripted replies and
/// failures are keyed by stage name. Every request is recorded.
#[derive(Debug)]
pub struct MockRuntime {
    adapter_version: String,
    model_id: String,
    replies: BTreeMap<String, String>,
    failures: BTreeMap<String, String>,
    invocations: Mutex<Vec<StageRequest>>,
}

impl Default for MockRuntime {
    fn default() -> Self {
        Self {
            adapter_version: "mock.v1".to_string(),
            model_id: "mock-model".to_string(),
            replies: BTreeMap::new(),
            failures: BTreeMap::new(),
            invocations: Mutex::new(Vec::new()),
        }
    }
}

impl MockRuntime {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn with_model(mut self, model_id: impl Into<String>) -> Self {
        self.model_id = model_id.into();
        self
    }

    #[must_use]
    pub fn with_reply(mut self, stage_name: impl Into<String>, text: impl Into<String>) -> Self {
        self.replies.insert(stage_name.into(), text.into());
        self
    }

    #[must_use]
    pub fn failing_on(mut self, stage_name: impl Into<String>, message: impl Into<String>) -> Self {
        self.failures.insert(stage_name.into(), message.into());
        self
    }

    /// Requests received so far, in invocation order.
    #[must_use]
    pub fn invocations(&self) -> Vec<StageRequest> {
        self.invocations
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    #[must_use]
    pub fn invocation_count(&self) -> usize {
        self.invocations
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    fn deterministic_token(&self, request: &StageRequest) -> String {
        let mut hasher = Sha256::new();
        hasher.update(request.input_hash.as_bytes());
        hasher.update(self.model_id.as_bytes());
        hasher.update(self.adapter_version.as_bytes());
        hex::encode(hasher.finalize())
    }
}

impl AgentRuntime for MockRuntime {
    fn runtime_name(&self) -> &'static str {
        "mock"
    }

    fn invoke(&self, request: &StageRequest) -> Result<StageReply> {
        self.invocations
            .lock()
            .map_err(|_| anyhow!("mock runtime invocation log is poisoned"))?
            .push(request.clone());

        if let Some(message) = self.failures.get(&request.stage_name) {
            return Err(anyhow!("{message}"));
        }

        let text = match self.replies.get(&request.stage_name) {
            Some(text) => text.clone(),
            None => {
                let token = self.deterministic_token(request);
                let sources: Vec<&str> = request
                    .context
                    .iter()
                    .map(|entry| entry.stage_name.as_str())
                    .collect();
                format!(
                    "# {}\n\nmock:{}:{}\n\ncontext: {}\n",
                    request.persona.role,
                    request.stage_name,
                    token.chars().take(16).collect::<String>(),
                    if sources.is_empty() {
                        "none".to_string()
                    } else {
                        sources.join(", ")
                    }
                )
            }
        };

        Ok(StageReply {
            text,
            model_id: self.model_id.clone(),
            latency_ms: Some(0),
        })
    }
}

/// Runtime backed by an OpenAI-compatible chat-completions endpoint.
#[derive(Debug, Clone)]
pub struct ChatCompletionsRuntime {
    adapter_version: String,
    model_id: String,
    config: ChatRuntimeConfig,
}

impl ChatCompletionsRuntime {
    /// Build the runtime from a binding, resolving the API key from the environment.
    ///
    /// # Errors
    /// Returns an error when the binding params are malformed or the API key
    /// environment variable is not set.
    pub fn from_binding(binding: &RuntimeBinding) -> Result<Self> {
        if binding.model_id.trim().is_empty() {
            return Err(anyhow!("chat runtime requires a model_id"));
        }
        Ok(Self {
            adapter_version: "chat_completions.v1".to_string(),
            model_id: binding.model_id.clone(),
            config: ChatRuntimeConfig::from_params(&binding.params)?,
        })
    }

    fn build_body(&self, request: &StageRequest) -> Value {
        json!({
            "model": self.model_id,
            "temperature": self.config.temperature,
            "max_tokens": self.config.max_tokens,
            "messages": [
                { "role": "system", "content": system_prompt(&request.persona) },
                { "role": "user", "content": request.instructions },
            ],
        })
    }
}

impl AgentRuntime for ChatCompletionsRuntime {
    fn runtime_name(&self) -> &'static str {
        "openai"
    }

    fn invoke(&self, request: &StageRequest) -> Result<StageReply> {
        let started = Instant::now();
        let agent = ureq::AgentBuilder::new()
            .timeout(Duration::from_millis(self.config.timeout_ms))
            .build();

        let mut req = agent
            .request("POST", &self.config.url)
            .set("content-type", "application/json")
            .set("authorization", &format!("Bearer {}", self.config.api_key))
            .set("x-adapter-version", &self.adapter_version);
        for (header, value) in &self.config.headers {
            req = req.set(header, value);
        }

        let body = match req.send_json(self.build_body(request)) {
            Ok(response) => response
                .into_json::<Value>()
                .context("chat completion response is not valid JSON")?,
            Err(ureq::Error::Status(code, response)) => {
                let detail = match response.into_json::<Value>() {
                    Ok(value) => error_message(&value),
                    Err(_) => None,
                };
                return Err(anyhow!(
                    "chat completion request failed with http status {code}{}",
                    detail.map(|msg| format!(": {msg}")).unwrap_or_default()
                ));
            }
            Err(ureq::Error::Transport(err)) => {
                return Err(anyhow!("http transport failure: {err}"));
            }
        };

        let text = extract_completion_text(&body)?;
        let latency_ms = u64::try_from(started.elapsed().as_millis()).ok();
        tracing::debug!(
            stage = %request.stage_name,
            model = %self.model_id,
            latency_ms,
            "chat completion returned"
        );

        Ok(StageReply {
            text,
            model_id: body
                .get("model")
                .and_then(Value::as_str)
                .unwrap_or(&self.model_id)
                .to_string(),
            latency_ms,
        })
    }
}

/// Select the runtime adapter named by the binding.
///
/// # Errors
/// Returns an error for unknown providers or when the adapter cannot be configured.
pub fn route_runtime(binding: &RuntimeBinding) -> Result<Arc<dyn AgentRuntime>> {
    match binding.provider_name.as_str() {
        "mock" => Ok(Arc::new(MockRuntime::new().with_model(&binding.model_id))),
        "openai" => Ok(Arc::new(ChatCompletionsRuntime::from_binding(binding)?)),
        other => Err(anyhow!(
            "unsupported runtime provider '{other}'; supported providers are 'mock' and 'openai'"
        )),
    }
}

/// Name of the environment variable that holds the API key for a binding.
#[must_use]
pub fn api_key_env(binding: &RuntimeBinding) -> Option<String> {
    match binding.provider_name.as_str() {
        "mock" => None,
        _ => Some(
            binding
                .params
                .get("api_key_env")
                .and_then(Value::as_str)
                .unwrap_or(DEFAULT_API_KEY_ENV)
                .to_string(),
        ),
    }
}

fn system_prompt(persona: &Persona) -> String {
    format!(
        "You are {}.\n\nGoal: {}\n\n{}",
        persona.role, persona.goal, persona.backstory
    )
}

fn extract_completion_text(body: &Value) -> Result<String> {
    let content = body
        .get("choices")
        .and_then(Value::as_array)
        .and_then(|choices| choices.first())
        .and_then(|choice| choice.get("message"))
        .and_then(|message| message.get("content"))
        .and_then(Value::as_str)
        .ok_or_else(|| anyhow!("chat completion response has no choices[0].message.content"))?;
    Ok(content.to_string())
}

fn error_message(body: &Value) -> Option<String> {
    body.get("error")
        .and_then(|err| err.get("message"))
        .and_then(Value::as_str)
        .map(ToString::to_string)
}

#[derive(Debug, Clone)]
struct ChatRuntimeConfig {
    url: String,
    temperature: f64,
    max_tokens: u64,
    timeout_ms: u64,
    headers: BTreeMap<String, String>,
    api_key: String,
}

impl ChatRuntimeConfig {
    fn from_params(params: &Value) -> Result<Self> {
        let url = params
            .get("url")
            .and_then(Value::as_str)
            .unwrap_or(DEFAULT_CHAT_URL)
            .to_string();
        let temperature = params
            .get("temperature")
            .and_then(Value::as_f64)
            .unwrap_or(0.7);
        let max_tokens = params
            .get("max_tokens")
            .and_then(Value::as_u64)
            .unwrap_or(4_000);
        let timeout_ms = params
            .get("timeout_ms")
            .and_then(Value::as_u64)
            .unwrap_or(600_000);

        let mut headers = BTreeMap::new();
        if let Some(raw_headers) = params.get("headers") {
            let obj = raw_headers
                .as_object()
                .ok_or_else(|| anyhow!("params.headers must be an object"))?;
            for (key, value) in obj {
                let str_value = value
                    .as_str()
                    .ok_or_else(|| anyhow!("params.headers values must be strings, key='{key}'"))?;
                headers.insert(key.clone(), str_value.to_string());
            }
        }

        let env_name = params
            .get("api_key_env")
            .and_then(Value::as_str)
            .unwrap_or(DEFAULT_API_KEY_ENV);
        let api_key = std::env::var(env_name)
            .map_err(|_| anyhow!("missing env var '{env_name}' required by the chat runtime"))?;

        Ok(Self {
            url,
            temperature,
            max_tokens,
            timeout_ms,
            headers,
            api_key,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::{
        api_key_env, extract_completion_text, route_runtime, AgentRuntime, ChatCompletionsRuntime,
        MockRuntime,
    };
    use crew_desk_domain::{ContextEntry, Persona, RunId, RuntimeBinding, StageRequest};
    use serde_json::json;

    fn fixture_request(stage_name: &str) -> StageRequest {
        StageRequest {
            run_id: RunId::new(),
            stage_name: stage_name.to_string(),
            stage_index: 0,
            persona: Persona::new("Analyst", "analyze", "backstory"),
            instructions: "do work".to_string(),
            context: vec![ContextEntry {
                stage_name: "earlier".to_string(),
                text: "prior".to_string(),
            }],
            input_hash: "fixture-input-hash".to_string(),
        }
    }

    #[test]
    fn mock_runtime_output_is_stable_for_same_input() {
        let runtime = MockRuntime::new();
        let request = fixture_request("analyze");

        let first = runtime.invoke(&request);
        let second = runtime.invoke(&request);
        assert!(first.is_ok());
        assert_eq!(first.ok(), second.ok());
        assert_eq!(runtime.invocation_count(), 2);
    }

    #[test]
    fn mock_runtime_uses_scripted_replies_and_failures() {
        let runtime = MockRuntime::new()
            .with_reply("analyze", "A-RESULT")
            .failing_on("write", "provider exploded");

        let reply = runtime.invoke(&fixture_request("analyze"));
        assert_eq!(reply.map(|r| r.text).ok(), Some("A-RESULT".to_string()));

        let failed = runtime.invoke(&fixture_request("write"));
        match failed {
            Ok(_) => panic!("scripted failure must surface"),
            Err(err) => assert!(err.to_string().contains("provider exploded")),
        }
        assert_eq!(runtime.invocations().len(), 2);
    }

    #[test]
    fn chat_runtime_requires_api_key_env() {
        let missing = format!("CREW_DESK_TEST_MISSING_{}", ulid::Ulid::new());
        let binding = RuntimeBinding {
            provider_name: "openai".to_string(),
            model_id: "gpt-4o-mini".to_string(),
            params: json!({ "api_key_env": missing }),
        };
        assert!(ChatCompletionsRuntime::from_binding(&binding).is_err());
    }

    #[test]
    fn router_rejects_unknown_provider() {
        let binding = RuntimeBinding {
            provider_name: "carrier_pigeon".to_string(),
            model_id: "m".to_string(),
            params: json!({}),
        };
        assert!(route_runtime(&binding).is_err());

        let mock = RuntimeBinding {
            provider_name: "mock".to_string(),
            ..binding
        };
        assert!(route_runtime(&mock).is_ok());
        assert_eq!(api_key_env(&mock), None);
    }

    #[test]
    fn completion_text_is_read_from_first_choice() {
        let body = json!({
            "model": "gpt-4o-mini",
            "choices": [ { "message": { "role": "assistant", "content": "hello" } } ]
        });
        assert_eq!(
            extract_completion_text(&body).ok(),
            Some("hello".to_string())
        );
        assert!(extract_completion_text(&json!({ "choices": [] })).is_err());
    }
}
