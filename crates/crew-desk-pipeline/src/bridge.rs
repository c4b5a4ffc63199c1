use std::sync::mpsc::{self, Receiver, Sender};
use std::sync::{Arc, Condvar, Mutex, PoisonError};
use std::thread::JoinHandle;
use std::time::Duration;

use crew_desk_domain::{ProgressEvent, RunId};
use crew_desk_runtime::AgentRuntime;

use crate::{PipelineError, PipelineRun, RunFailure, SequentialExecutor, StageObserver};

#[derive(Debug, Default)]
struct DoneSignal {
    finished: Mutex<bool>,
    changed: Condvar,
}

impl DoneSignal {
    fn set(&self) {
        *self.finished.lock().unwrap_or_else(PoisonError::into_inner) = true;
        self.changed.notify_all();
    }

    fn is_set(&self) -> bool {
        *self.finished.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn wait_timeout(&self, timeout: Duration) -> bool {
        let guard = self.finished.lock().unwrap_or_else(PoisonError::into_inner);
        let (guard, _) = self
            .changed
            .wait_timeout_while(guard, timeout, |finished| !*finished)
            .unwrap_or_else(PoisonError::into_inner);
        *guard
    }
}

/// Raises the done signal when the worker exits, including by panic.
struct DoneGuard(Arc<DoneSignal>);

impl Drop for DoneGuard {
    fn drop(&mut self) {
        self.0.set();
    }
}

struct ChannelObserver {
    sender: Sender<ProgressEvent>,
}

impl StageObserver for ChannelObserver {
    fn notify(&self, event: &ProgressEvent) {
        // receiver gone means nobody is listening any more
        let _ = self.sender.send(event.clone());
    }
}

/// A pipeline run executing on its own worker thread.
///
/// Not cancellable. Dropping the handle leaves the worker running to completion.
pub struct BackgroundRun {
    run_id: RunId,
    total: usize,
    events: Receiver<ProgressEvent>,
    done: Arc<DoneSignal>,
    handle: JoinHandle<Result<PipelineRun, RunFailure>>,
}

impl BackgroundRun {
    #[must_use]
    pub fn run_id(&self) -> RunId {
        self.run_id
    }

    #[must_use]
    pub fn total_stages(&self) -> usize {
        self.total
    }

    #[must_use]
    pub fn is_done(&self) -> bool {
        self.done.is_set()
    }

    /// Block for at most `timeout`. Returns whether the run has finished.
    #[must_use]
    pub fn wait_timeout(&self, timeout: Duration) -> bool {
        self.done.wait_timeout(timeout)
    }

    /// Events emitted since the previous call, in emission order.
    #[must_use]
    pub fn poll_events(&self) -> Vec<ProgressEvent> {
        self.events.try_iter().collect()
    }

    /// Wait for the worker and take its outcome.
    ///
    /// # Errors
    /// Returns the run's `RunFailure`, or an `Interrupted` failure if the worker panicked.
    pub fn join(self) -> Result<PipelineRun, RunFailure> {
        let run_id = self.run_id;
        match self.handle.join() {
            Ok(outcome) => outcome,
            Err(panic) => {
                let message = panic
                    .downcast_ref::<&str>()
                    .map(ToString::to_string)
                    .or_else(|| panic.downcast_ref::<String>().cloned())
                    .unwrap_or_else(|| "worker panicked".to_string());
                Err(RunFailure {
                    run_id,
                    error: PipelineError::Interrupted(message),
                    completed: crate::StageResults::new(),
                })
            }
        }
    }
}

/// Start `run` on a worker thread and return immediately.
#[must_use]
pub fn spawn_pipeline(run: PipelineRun, runtime: Arc<dyn AgentRuntime>) -> BackgroundRun {
    let run_id = run.run_id();
    let total = run.stages().len();
    let (sender, events) = mpsc::channel();
    let done = Arc::new(DoneSignal::default());
    let worker_done = Arc::clone(&done);

    let handle = std::thread::spawn(move || {
        let _guard = DoneGuard(worker_done);
        let observer = ChannelObserver { sender };
        let executor = SequentialExecutor::new(runtime.as_ref(), &observer);
        let mut run = run;
        match executor.run(&mut run) {
            Ok(()) => Ok(run),
            Err(error) => Err(run.into_failure(error)),
        }
    });

    tracing::debug!(run_id = %run_id, total, "pipeline worker spawned");
    BackgroundRun {
        run_id,
        total,
        events,
        done,
        handle,
    }
}

/// Run in the background and deliver progress to `on_event` between bounded waits.
///
/// # Errors
/// Returns the run's `RunFailure` once the worker finishes.
pub fn run_with_progress<F>(
    run: PipelineRun,
    runtime: Arc<dyn AgentRuntime>,
    poll_interval: Duration,
    mut on_event: F,
) -> Result<PipelineRun, RunFailure>
where
    F: FnMut(&ProgressEvent),
{
    let background = spawn_pipeline(run, runtime);
    loop {
        let finished = background.wait_timeout(poll_interval);
        for event in background.poll_events() {
            on_event(&event);
        }
        if finished {
            break;
        }
    }
    background.join()
}

#[cfg(test)]
mod tests {
    use super::{run_with_progress, spawn_pipeline};
    use crate::{PipelineError, PipelineRun};
    use crew_desk_domain::{Persona, ProgressPhase, Stage};
    use crew_desk_runtime::{AgentRuntime, MockRuntime};
    use std::sync::Arc;
    use std::time::Duration;

    fn stages() -> Vec<Stage> {
        vec![
            Stage::new("hunt", Persona::new("Hunter", "g", "b"), "find"),
            Stage::new("analyze", Persona::new("Analyzer", "g", "b"), "rank").depends_on(["hunt"]),
            Stage::new("report", Persona::new("Writer", "g", "b"), "write")
                .depends_on(["hunt", "analyze"]),
        ]
    }

    #[test]
    fn progress_events_arrive_in_stage_order() {
        let runtime: Arc<dyn AgentRuntime> = Arc::new(MockRuntime::new());
        let run = PipelineRun::new(stages()).unwrap_or_else(|_| unreachable!());
        let mut seen = Vec::new();

        let outcome = run_with_progress(run, runtime, Duration::from_millis(5), |event| {
            seen.push((event.stage_label.clone(), event.phase, event.completed));
        });

        let run = outcome.unwrap_or_else(|err| panic!("run failed: {err}"));
        assert_eq!(run.results().len(), 3);
        assert!(run.final_result().is_some());
        assert_eq!(
            seen,
            vec![
                ("Hunter".to_string(), ProgressPhase::Started, 0),
                ("Hunter".to_string(), ProgressPhase::Completed, 1),
                ("Analyzer".to_string(), ProgressPhase::Started, 1),
                ("Analyzer".to_string(), ProgressPhase::Completed, 2),
                ("Writer".to_string(), ProgressPhase::Started, 2),
                ("Writer".to_string(), ProgressPhase::Completed, 3),
            ]
        );
    }

    #[test]
    fn background_failure_reports_stage_and_partial_results() {
        let runtime: Arc<dyn AgentRuntime> =
            Arc::new(MockRuntime::new().failing_on("analyze", "rate limited"));
        let run = PipelineRun::new(stages()).unwrap_or_else(|_| unreachable!());

        let background = spawn_pipeline(run, runtime);
        while !background.wait_timeout(Duration::from_millis(10)) {}
        assert!(background.is_done());
        assert_eq!(background.total_stages(), 3);

        let events = background.poll_events();
        assert_eq!(events.last().map(|e| e.phase), Some(ProgressPhase::Started));

        let failure = match background.join() {
            Ok(_) => panic!("analyze should fail"),
            Err(failure) => failure,
        };
        assert_eq!(failure.error.stage(), Some("analyze"));
        assert!(matches!(
            failure.error,
            PipelineError::RuntimeInvocation { .. }
        ));
        assert_eq!(failure.completed.keys().collect::<Vec<_>>(), vec!["hunt"]);
    }
}
