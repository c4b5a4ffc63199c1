#![forbid(unsafe_code)]

use std::collections::{BTreeMap, BTreeSet};
use std::path::PathBuf;

use crew_desk_domain::{
    compute_stage_request_hash, ensure_non_empty, ContextEntry, ProgressEvent, ProgressPhase, RunId,
    RunStatus, Stage, StageRequest,
};
use crew_desk_runtime::AgentRuntime;
use thiserror::Error;

mod bridge;

pub use bridge::{run_with_progress, spawn_pipeline, BackgroundRun};

/// Stage name to produced text.
pub type StageResults = BTreeMap<String, String>;

#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("invalid pipeline configuration: {0}")]
    Configuration(String),
    #[error("stage '{stage}' failed: {source}")]
    RuntimeInvocation {
        stage: String,
        #[source]
        source: Box<dyn std::error::Error + Send + Sync + 'static>,
    },
    #[error("stage '{stage}' could not write artifact {}: {source}", .path.display())]
    ArtifactWrite {
        stage: String,
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("pipeline worker stopped unexpectedly: {0}")]
    Interrupted(String),
}

impl PipelineError {
    /// Name of the stage the failure is attributed to, if any.
    #[must_use]
    pub fn stage(&self) -> Option<&str> {
        match self {
            Self::RuntimeInvocation { stage, .. } | Self::ArtifactWrite { stage, .. } => {
                Some(stage)
            }
            Self::Configuration(_) | Self::Interrupted(_) => None,
        }
    }
}

/// A failed run together with the results of the stages that finished first.
///
/// `completed` is diagnostic only and never the pipeline's artifact.
#[derive(Debug, Error)]
#[error("pipeline run {run_id} failed: {error}")]
pub struct RunFailure {
    pub run_id: RunId,
    #[source]
    pub error: PipelineError,
    pub completed: StageResults,
}

/// Check a stage list before anything runs.
///
/// Every dependency must name a stage declared earlier in the list.
///
/// # Errors
/// Returns `PipelineError::Configuration` on empty fields, duplicate names,
/// repeated or unknown dependencies, or dependencies declared later than their
/// dependent.
pub fn validate_stages(stages: &[Stage]) -> Result<(), PipelineError> {
    let mut seen: BTreeSet<&str> = BTreeSet::new();
    let declared: BTreeSet<&str> = stages.iter().map(|stage| stage.name.as_str()).collect();

    for stage in stages {
        validate_stage_fields(stage)?;
        let mut listed: BTreeSet<&str> = BTreeSet::new();
        for dep in &stage.dependencies {
            if !listed.insert(dep.as_str()) {
                return Err(PipelineError::Configuration(format!(
                    "stage {} lists dependency {dep} more than once",
                    stage.name
                )));
            }
            if dep == &stage.name {
                return Err(PipelineError::Configuration(format!(
                    "stage {} depends on itself",
                    stage.name
                )));
            }
            if !declared.contains(dep.as_str()) {
                return Err(PipelineError::Configuration(format!(
                    "stage {} depends on unknown stage {dep}",
                    stage.name
                )));
            }
            if !seen.contains(dep.as_str()) {
                return Err(PipelineError::Configuration(format!(
                    "stage {} depends on {dep}, which is declared after it",
                    stage.name
                )));
            }
        }
        if !seen.insert(stage.name.as_str()) {
            return Err(PipelineError::Configuration(format!(
                "duplicate stage name: {}",
                stage.name
            )));
        }
    }
    Ok(())
}

fn validate_stage_fields(stage: &Stage) -> Result<(), PipelineError> {
    let checks = [
        ("stage.name", stage.name.as_str()),
        ("stage.persona.role", stage.persona.role.as_str()),
        ("stage.instructions", stage.instructions.as_str()),
    ];
    for (field, value) in checks {
        ensure_non_empty(field, value)
            .map_err(|err| PipelineError::Configuration(format!("{}: {err}", stage.name)))?;
    }
    Ok(())
}

/// One invocation of an ordered stage list.
#[derive(Debug, Clone)]
pub struct PipelineRun {
    run_id: RunId,
    stages: Vec<Stage>,
    results: StageResults,
    status: RunStatus,
}

impl PipelineRun {
    /// # Errors
    /// Returns `PipelineError::Configuration` when the stages fail validation.
    pub fn new(stages: Vec<Stage>) -> Result<Self, PipelineError> {
        validate_stages(&stages)?;
        Ok(Self {
            run_id: RunId::new(),
            stages,
            results: StageResults::new(),
            status: RunStatus::Pending,
        })
    }

    #[must_use]
    pub fn run_id(&self) -> RunId {
        self.run_id
    }

    #[must_use]
    pub fn stages(&self) -> &[Stage] {
        &self.stages
    }

    #[must_use]
    pub fn results(&self) -> &StageResults {
        &self.results
    }

    #[must_use]
    pub fn status(&self) -> RunStatus {
        self.status
    }

    #[must_use]
    pub fn into_results(self) -> StageResults {
        self.results
    }

    /// Result of the last declared stage, once it has run.
    #[must_use]
    pub fn final_result(&self) -> Option<&str> {
        self.stages
            .last()
            .and_then(|stage| self.results.get(&stage.name))
            .map(String::as_str)
    }

    fn into_failure(self, error: PipelineError) -> RunFailure {
        RunFailure {
            run_id: self.run_id,
            error,
            completed: self.results,
        }
    }
}

/// Receives stage boundary events as the executor crosses them.
pub trait StageObserver {
    fn notify(&self, event: &ProgressEvent);
}

impl<F> StageObserver for F
where
    F: Fn(&ProgressEvent),
{
    fn notify(&self, event: &ProgressEvent) {
        self(event);
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct NoopObserver;

impl StageObserver for NoopObserver {
    fn notify(&self, _event: &ProgressEvent) {}
}

static NOOP_OBSERVER: NoopObserver = NoopObserver;

/// Runs stages strictly in declared order, one runtime call per stage.
pub struct SequentialExecutor<'a> {
    runtime: &'a dyn AgentRuntime,
    observer: &'a dyn StageObserver,
}

impl<'a> SequentialExecutor<'a> {
    #[must_use]
    pub fn new(runtime: &'a dyn AgentRuntime, observer: &'a dyn StageObserver) -> Self {
        Self { runtime, observer }
    }

    #[must_use]
    pub fn without_observer(runtime: &'a dyn AgentRuntime) -> Self {
        Self::new(runtime, &NOOP_OBSERVER)
    }

    /// Validate and execute `stages`, returning every stage's result.
    ///
    /// # Errors
    /// Returns `RunFailure` carrying the first error and the results of the
    /// stages that completed before it.
    pub fn run_stages(&self, stages: Vec<Stage>) -> Result<StageResults, RunFailure> {
        let mut run = PipelineRun::new(stages).map_err(|error| RunFailure {
            run_id: RunId::new(),
            error,
            completed: StageResults::new(),
        })?;
        match self.run(&mut run) {
            Ok(()) => Ok(run.into_results()),
            Err(error) => Err(run.into_failure(error)),
        }
    }

    /// Execute a pending run in place. Stops at the first failing stage.
    ///
    /// # Errors
    /// Returns `PipelineError` when the run was already executed, a dependency
    /// result is missing, the runtime fails, or an artifact cannot be written.
    pub fn run(&self, run: &mut PipelineRun) -> Result<(), PipelineError> {
        if run.status != RunStatus::Pending {
            return Err(PipelineError::Configuration(format!(
                "run {} was already executed (status {})",
                run.run_id,
                run.status.as_str()
            )));
        }
        run.status = RunStatus::Running;
        let total = run.stages.len();
        tracing::info!(
            run_id = %run.run_id,
            total,
            runtime = self.runtime.runtime_name(),
            "pipeline run started"
        );

        for (index, stage) in run.stages.iter().enumerate() {
            self.emit(run.run_id, stage, ProgressPhase::Started, index, total);
            tracing::info!(
                run_id = %run.run_id,
                stage = %stage.name,
                index,
                total,
                "stage started"
            );

            match self.execute_stage(run.run_id, index, stage, &run.results) {
                Ok(text) => {
                    run.results.insert(stage.name.clone(), text);
                }
                Err(err) => {
                    tracing::error!(
                        run_id = %run.run_id,
                        stage = %stage.name,
                        error = %err,
                        "stage failed"
                    );
                    run.status = RunStatus::Failed;
                    return Err(err);
                }
            }

            tracing::info!(
                run_id = %run.run_id,
                stage = %stage.name,
                index,
                total,
                "stage completed"
            );
            self.emit(
                run.run_id,
                stage,
                ProgressPhase::Completed,
                index + 1,
                total,
            );
        }

        run.status = RunStatus::Succeeded;
        tracing::info!(run_id = %run.run_id, total, "pipeline run succeeded");
        Ok(())
    }

    fn execute_stage(
        &self,
        run_id: RunId,
        index: usize,
        stage: &Stage,
        results: &StageResults,
    ) -> Result<String, PipelineError> {
        let context = resolve_context(stage, results)?;
        let mut request = StageRequest {
            run_id,
            stage_name: stage.name.clone(),
            stage_index: index,
            persona: stage.persona.clone(),
            instructions: compose_instructions(&stage.instructions, &context),
            context,
            input_hash: String::new(),
        };
        request.input_hash =
            compute_stage_request_hash(&request).map_err(|err| runtime_failure(stage, err))?;

        let reply = self
            .runtime
            .invoke(&request)
            .map_err(|err| runtime_failure(stage, err))?;
        tracing::debug!(
            stage = %stage.name,
            model = %reply.model_id,
            latency_ms = reply.latency_ms,
            chars = reply.text.len(),
            "runtime replied"
        );

        if let Some(path) = &stage.output_artifact {
            std::fs::write(path, &reply.text).map_err(|source| PipelineError::ArtifactWrite {
                stage: stage.name.clone(),
                path: path.clone(),
                source,
            })?;
            tracing::info!(stage = %stage.name, path = %path.display(), "artifact written");
        }

        Ok(reply.text)
    }

    fn emit(
        &self,
        run_id: RunId,
        stage: &Stage,
        phase: ProgressPhase,
        completed: usize,
        total: usize,
    ) {
        self.observer.notify(&ProgressEvent {
            run_id,
            stage_name: stage.name.clone(),
            stage_label: stage.persona.role.clone(),
            phase,
            completed,
            total,
        });
    }
}

/// Validate and run `stages` without progress reporting.
///
/// # Errors
/// Returns `RunFailure` as described on [`SequentialExecutor::run_stages`].
pub fn run_pipeline(
    stages: Vec<Stage>,
    runtime: &dyn AgentRuntime,
) -> Result<StageResults, RunFailure> {
    SequentialExecutor::without_observer(runtime).run_stages(stages)
}

fn runtime_failure(stage: &Stage, err: anyhow::Error) -> PipelineError {
    PipelineError::RuntimeInvocation {
        stage: stage.name.clone(),
        source: err.into(),
    }
}

fn resolve_context(
    stage: &Stage,
    results: &StageResults,
) -> Result<Vec<ContextEntry>, PipelineError> {
    stage
        .dependencies
        .iter()
        .map(|dep| {
            results
                .get(dep)
                .map(|text| ContextEntry {
                    stage_name: dep.clone(),
                    text: text.clone(),
                })
                .ok_or_else(|| {
                    PipelineError::Configuration(format!(
                        "stage {} needs the result of {dep}, which has not been produced",
                        stage.name
                    ))
                })
        })
        .collect()
}

/// Stage instructions followed by each dependency result, verbatim.
#[must_use]
pub fn compose_instructions(instructions: &str, context: &[ContextEntry]) -> String {
    let mut composed = instructions.to_string();
    for entry in context {
        composed.push_str("\n\n---\nOutput of the '");
        composed.push_str(&entry.stage_name);
        composed.push_str("' stage:\n\n");
        composed.push_str(&entry.text);
    }
    composed
}
