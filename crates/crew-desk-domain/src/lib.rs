#![forbid(unsafe_code)]

use std::path::PathBuf;
use std::str::FromStr;

use anyhow::{anyhow, Result};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sha2::{Digest, Sha256};
use time::OffsetDateTime;
use ulid::Ulid;

pub type DateTimeUtc = OffsetDateTime;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct RunId(pub Ulid);

impl RunId {
    #[must_use]
    pub fn new() -> Self {
        Self(Ulid::new())
    }
}

impl Default for RunId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for RunId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct RecordId(pub Ulid);

impl RecordId {
    #[must_use]
    pub fn new() -> Self {
        Self(Ulid::new())
    }
}

impl Default for RecordId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for RecordId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for RecordId {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        Ulid::from_str(s.trim())
            .map(Self)
            .map_err(|err| anyhow!("invalid record id '{s}': {err}"))
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Pending,
    Running,
    Succeeded,
    Failed,
}

impl RunStatus {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Running => "running",
            Self::Succeeded => "succeeded",
            Self::Failed => "failed",
        }
    }
}

/// Role, goal and backstory that parameterize one agent.
#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
#[serde(deny_unknown_fields)]
pub struct Persona {
    pub role: String,
    pub goal: String,
    pub backstory: String,
}

impl Persona {
    #[must_use]
    pub fn new(
        role: impl Into<String>,
        goal: impl Into<String>,
        backstory: impl Into<String>,
    ) -> Self {
        Self {
            role: role.into(),
            goal: goal.into(),
            backstory: backstory.into(),
        }
    }
}

/// One unit of agent work inside a pipeline.
///
/// `dependencies` name earlier stages whose results are injected into this
/// stage's instructions. When `output_artifact` is set the stage result is
/// also written to that path.
#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
#[serde(deny_unknown_fields)]
pub struct Stage {
    pub name: String,
    pub persona: Persona,
    pub instructions: String,
    #[serde(default)]
    pub dependencies: Vec<String>,
    #[serde(default)]
    pub output_artifact: Option<PathBuf>,
}

impl Stage {
    #[must_use]
    pub fn new(name: impl Into<String>, persona: Persona, instructions: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            persona,
            instructions: instructions.into(),
            dependencies: Vec::new(),
            output_artifact: None,
        }
    }

    #[must_use]
    pub fn depends_on<I, S>(mut self, dependencies: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.dependencies = dependencies.into_iter().map(Into::into).collect();
        self
    }

    #[must_use]
    pub fn with_output_artifact(mut self, path: impl Into<PathBuf>) -> Self {
        self.output_artifact = Some(path.into());
        self
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
pub struct ContextEntry {
    pub stage_name: String,
    pub text: String,
}

/// Fully resolved input for a single runtime invocation.
///
/// `instructions` already carries the dependency context verbatim; `context`
/// repeats it in structured form for adapters that want it separately.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct StageRequest {
    pub run_id: RunId,
    pub stage_name: String,
    pub stage_index: usize,
    pub persona: Persona,
    pub instructions: String,
    pub context: Vec<ContextEntry>,
    pub input_hash: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct StageReply {
    pub text: String,
    pub model_id: String,
    pub latency_ms: Option<u64>,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq)]
#[serde(rename_all = "snake_case")]
pub enum ProgressPhase {
    Started,
    Completed,
}

impl ProgressPhase {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Started => "started",
            Self::Completed => "completed",
        }
    }
}

/// Lifecycle notification emitted at a stage boundary.
///
/// `completed` counts stages finished so far out of `total`.
#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
pub struct ProgressEvent {
    pub run_id: RunId,
    pub stage_name: String,
    pub stage_label: String,
    pub phase: ProgressPhase,
    pub completed: usize,
    pub total: usize,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
#[serde(rename_all = "snake_case")]
pub enum HistoryCategory {
    Documentation,
    Refactoring,
    Research,
    DailyNews,
}

impl HistoryCategory {
    pub const ALL: [Self; 4] = [
        Self::Documentation,
        Self::Refactoring,
        Self::Research,
        Self::DailyNews,
    ];

    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Documentation => "documentation",
            Self::Refactoring => "refactoring",
            Self::Research => "research",
            Self::DailyNews => "daily_news",
        }
    }

    #[must_use]
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "documentation" => Some(Self::Documentation),
            "refactoring" => Some(Self::Refactoring),
            "research" => Some(Self::Research),
            "daily_news" => Some(Self::DailyNews),
            _ => None,
        }
    }
}

impl std::fmt::Display for HistoryCategory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Which agent runtime adapter to use and with which model.
#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
#[serde(deny_unknown_fields)]
pub struct RuntimeBinding {
    pub provider_name: String,
    pub model_id: String,
    #[serde(default)]
    pub params: Value,
}

impl Default for RuntimeBinding {
    fn default() -> Self {
        Self {
            provider_name: "openai".to_string(),
            model_id: "gpt-4o-mini".to_string(),
            params: Value::Null,
        }
    }
}

#[must_use]
pub fn now_utc() -> DateTimeUtc {
    OffsetDateTime::now_utc()
}

#[must_use]
pub fn hash_bytes(bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    hex::encode(hasher.finalize())
}

/// Hash a JSON value with stable `serde_json` serialization + SHA-256.
///
/// # Errors
/// Returns an error if JSON serialization fails.
pub fn hash_json(value: &Value) -> Result<String> {
    let bytes = serde_json::to_vec(value)?;
    Ok(hash_bytes(&bytes))
}

/// Ensure a string field is non-empty after trimming.
///
/// # Errors
/// Returns an error when the provided value is empty/whitespace.
pub fn ensure_non_empty(field_name: &str, value: &str) -> Result<()> {
    if value.trim().is_empty() {
        return Err(anyhow!("{field_name} MUST be non-empty"));
    }
    Ok(())
}

/// Compute a deterministic hash for a stage request, ignoring its own hash field.
///
/// # Errors
/// Returns an error if the request cannot be serialized.
pub fn compute_stage_request_hash(request: &StageRequest) -> Result<String> {
    let mut value = serde_json::to_value(request)?;
    if let Some(obj) = value.as_object_mut() {
        obj.remove("input_hash");
    }
    hash_json(&value)
}
