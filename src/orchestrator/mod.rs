//! Test orchestrator: one Run Task and one Progress Task per invocation.
//!
//! `start_test` checks the single-run gate, publishes `Started`, then spawns
//! both tasks and returns. The Run Task makes the blocking engine calls
//! (`init`, `run`, `result`) on the blocking pool; the Progress Task polls
//! status, progress and logs on a fixed interval while holding the scoped
//! performance resource, and publishes `Completed` once its loop ends.
//!
//! The single-run gate is shared by both tasks and opens only after the last
//! of them exits, so a new invocation never overlaps the previous poller.

pub mod resource;
pub mod run_state;

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use thiserror::Error;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::engine::{
    EngineError, EngineFactory, EngineHandle, EngineStatus, HandleLifetime, TestDescriptor,
};
use crate::lock;
use crate::notify::{NotificationBus, NotificationEvent};
use crate::params::{ParamError, ParamView, ParameterModel, ResetSummary};

use self::resource::{NoopResource, PerformanceResource, ResourceGrant};
use self::run_state::{RunState, RunningGuard};

/// Message carried by the `Update` sent when a start request is refused.
pub const REJECTED_MESSAGE: &str = "rejected: already running";
/// Message carried by the `Update` sent once the engine accepted `init`.
pub const INITIALIZED_MESSAGE: &str = "initialized";

#[derive(Debug, Error)]
pub enum StartError {
    #[error(transparent)]
    Engine(#[from] EngineError),

    #[error("no Tokio runtime available to spawn test tasks")]
    NoRuntime,
}

/// Result of a start request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StartOutcome {
    Started,
    /// Another test is running; nothing was spawned and the engine was not touched.
    Rejected,
}

/// Timing and handle policy for an orchestrator.
#[derive(Debug, Clone)]
pub struct OrchestratorSettings {
    /// Delay before the first progress poll.
    pub warm_up: Duration,
    pub poll_interval: Duration,
    pub handle_lifetime: HandleLifetime,
}

impl Default for OrchestratorSettings {
    fn default() -> Self {
        Self {
            warm_up: Duration::from_millis(300),
            poll_interval: Duration::from_millis(300),
            handle_lifetime: HandleLifetime::Shared,
        }
    }
}

/// Everything both tasks of one invocation need.
#[derive(Clone)]
struct TaskContext {
    test_id: usize,
    run_id: Uuid,
    handle: Arc<EngineHandle>,
    bus: Arc<NotificationBus>,
    /// Set once the Run Task has exited, by any path.
    run_finished: Arc<AtomicBool>,
    /// Serializes log draining so chunks keep engine order across tasks.
    drain: Arc<Mutex<()>>,
}

impl TaskContext {
    fn run_finished(&self) -> bool {
        self.run_finished.load(Ordering::Acquire)
    }

    fn update(&self, message: impl Into<String>) {
        self.bus.publish(NotificationEvent::Update {
            test_id: self.test_id,
            message: message.into(),
        });
    }
}

struct Invocation {
    run_id: Uuid,
    test_id: usize,
    run: JoinHandle<()>,
    progress: JoinHandle<()>,
}

impl Invocation {
    fn is_finished(&self) -> bool {
        self.run.is_finished() && self.progress.is_finished()
    }
}

pub struct Orchestrator {
    factory: Arc<dyn EngineFactory>,
    settings: OrchestratorSettings,
    bus: Arc<NotificationBus>,
    run_state: Arc<RunState>,
    resource: Arc<dyn PerformanceResource>,
    handle: Mutex<Option<Arc<EngineHandle>>>,
    invocations: Mutex<Vec<Invocation>>,
}

impl Orchestrator {
    /// Creates the first engine handle immediately.
    pub fn new(
        factory: Arc<dyn EngineFactory>,
        settings: OrchestratorSettings,
        bus: Arc<NotificationBus>,
    ) -> Result<Self, EngineError> {
        let handle = EngineHandle::create(factory.as_ref())?;
        Ok(Self {
            factory,
            settings,
            bus,
            run_state: Arc::new(RunState::new()),
            resource: Arc::new(NoopResource),
            handle: Mutex::new(Some(Arc::new(handle))),
            invocations: Mutex::new(Vec::new()),
        })
    }

    pub fn with_resource(mut self, resource: Arc<dyn PerformanceResource>) -> Self {
        self.resource = resource;
        self
    }

    pub fn bus(&self) -> &Arc<NotificationBus> {
        &self.bus
    }

    pub fn settings(&self) -> &OrchestratorSettings {
        &self.settings
    }

    pub fn is_running(&self) -> bool {
        self.run_state.is_running()
    }

    /// The live engine handle, creating a fresh one if the last was closed.
    pub fn handle(&self) -> Result<Arc<EngineHandle>, EngineError> {
        let mut slot = lock(&self.handle);
        if let Some(handle) = slot.as_ref().filter(|h| h.is_open()) {
            return Ok(Arc::clone(handle));
        }
        let handle = Arc::new(EngineHandle::create(self.factory.as_ref())?);
        *slot = Some(Arc::clone(&handle));
        Ok(handle)
    }

    pub fn tests(&self) -> Result<Vec<TestDescriptor>, EngineError> {
        self.handle()?.tests()
    }

    pub fn parameters(&self) -> Result<ParameterModel, EngineError> {
        Ok(ParameterModel::new(self.handle()?))
    }

    pub fn params_for_test(&self, test_id: usize) -> Result<Vec<ParamView>, ParamError> {
        self.parameters()?.describe(test_id)
    }

    pub fn reset_settings(&self, test_id: usize) -> Result<ResetSummary, ParamError> {
        self.parameters()?.reset_all(test_id)
    }

    /// Start a test and return without waiting for it.
    ///
    /// Must be called from within a Tokio runtime.
    pub fn start_test(&self, test_id: usize) -> Result<StartOutcome, StartError> {
        let Some(guard) = RunState::try_acquire(&self.run_state) else {
            info!(test_id, "Start rejected, a test is already running");
            self.bus.publish(NotificationEvent::Update {
                test_id,
                message: REJECTED_MESSAGE.to_string(),
            });
            return Ok(StartOutcome::Rejected);
        };

        let runtime = tokio::runtime::Handle::try_current().map_err(|_| StartError::NoRuntime)?;
        let ctx = TaskContext {
            test_id,
            run_id: Uuid::new_v4(),
            handle: self.handle()?,
            bus: Arc::clone(&self.bus),
            run_finished: Arc::new(AtomicBool::new(false)),
            drain: Arc::new(Mutex::new(())),
        };
        let guard = Arc::new(guard);

        info!(test_id, run_id = %ctx.run_id, "Starting test");
        self.bus.publish(NotificationEvent::Started { test_id });

        let run = {
            let ctx = ctx.clone();
            let lifetime = self.settings.handle_lifetime;
            let guard = Arc::clone(&guard);
            runtime.spawn_blocking(move || run_task(ctx, lifetime, guard))
        };
        let progress = runtime.spawn(progress_task(
            ctx.clone(),
            self.settings.clone(),
            Arc::clone(&self.resource),
            guard,
        ));

        let mut invocations = lock(&self.invocations);
        invocations.retain(|i| !i.is_finished());
        invocations.push(Invocation {
            run_id: ctx.run_id,
            test_id,
            run,
            progress,
        });
        Ok(StartOutcome::Started)
    }

    /// Wait until every spawned Run and Progress Task has exited.
    pub async fn wait_idle(&self) {
        loop {
            let pending: Vec<Invocation> = std::mem::take(&mut *lock(&self.invocations));
            if pending.is_empty() {
                return;
            }
            for invocation in pending {
                for (task, join) in [("run", invocation.run), ("progress", invocation.progress)] {
                    if let Err(e) = join.await {
                        warn!(
                            test_id = invocation.test_id,
                            run_id = %invocation.run_id,
                            task,
                            error = %e,
                            "Test task ended abnormally"
                        );
                    }
                }
            }
        }
    }
}

/// Marks the Run Task as finished when dropped, including on panic.
struct RunFinished(Arc<AtomicBool>);

impl Drop for RunFinished {
    fn drop(&mut self) {
        self.0.store(true, Ordering::Release);
    }
}

/// Blocking body of the Run Task.
fn run_task(ctx: TaskContext, lifetime: HandleLifetime, guard: Arc<RunningGuard>) {
    let _guard = guard;
    let _finished = RunFinished(Arc::clone(&ctx.run_finished));
    let (test_id, run_id) = (ctx.test_id, ctx.run_id);

    if let Err(e) = ctx.handle.init(test_id) {
        warn!(test_id, %run_id, error = %e, "Engine init failed");
        ctx.update(e.to_string());
        finish_handle(&ctx, lifetime);
        return;
    }
    ctx.update(INITIALIZED_MESSAGE);

    debug!(test_id, %run_id, "Engine run started");
    match ctx.handle.run() {
        Ok(()) => report_result(&ctx),
        Err(EngineError::InvalidHandle) => {
            debug!(test_id, %run_id, "Handle invalidated during run");
        }
        Err(e) => {
            warn!(test_id, %run_id, error = %e, "Engine run failed");
            ctx.update(e.to_string());
        }
    }

    finish_handle(&ctx, lifetime);
}

/// Publish the outcome of a run that returned normally: the engine's
/// message on `Error` status, otherwise its result text.
fn report_result(ctx: &TaskContext) {
    let (test_id, run_id) = (ctx.test_id, ctx.run_id);
    let status = ctx.handle.status();
    let result = ctx.handle.result().unwrap_or_default();
    match status {
        Ok(EngineStatus::Error) => {
            warn!(test_id, %run_id, %result, "Engine reported error status");
            ctx.update(format!("engine fault: {}", result));
        }
        Ok(status) => {
            info!(test_id, %run_id, %status, "Engine run finished");
            if !result.is_empty() {
                ctx.update(result);
            }
        }
        Err(e) => debug!(test_id, %run_id, error = %e, "Handle invalidated during run"),
    }
}

/// Closing discards pending engine logs, so they are drained first.
fn finish_handle(ctx: &TaskContext, lifetime: HandleLifetime) {
    if lifetime == HandleLifetime::PerInvocation {
        if let Err(e) = drain_logs(ctx) {
            debug!(test_id = ctx.test_id, run_id = %ctx.run_id, error = %e, "Log drain before close skipped");
        }
        ctx.handle.close();
    }
}

/// One poll cycle. Returns whether the engine is still running.
fn poll_once(ctx: &TaskContext) -> Result<bool, EngineError> {
    let status = ctx.handle.status()?;
    let progress = ctx.handle.progress()?;
    ctx.bus.publish(NotificationEvent::ShortUpdate {
        test_id: ctx.test_id,
        message: progress.to_string(),
    });
    drain_logs(ctx)?;
    Ok(status == EngineStatus::Running)
}

fn drain_logs(ctx: &TaskContext) -> Result<(), EngineError> {
    let _drain = lock(&ctx.drain);
    while ctx.handle.has_logs()? {
        let chunk = ctx.handle.read_log()?;
        if chunk.is_empty() {
            break;
        }
        ctx.update(chunk);
    }
    Ok(())
}

async fn progress_task(
    ctx: TaskContext,
    settings: OrchestratorSettings,
    resource: Arc<dyn PerformanceResource>,
    guard: Arc<RunningGuard>,
) {
    let _guard = guard;
    let (test_id, run_id) = (ctx.test_id, ctx.run_id);
    let grant = ResourceGrant::acquire(resource);
    tokio::time::sleep(settings.warm_up).await;

    let mut polls: u32 = 0;
    loop {
        // Sampled before the poll so a finished run still gets one last poll.
        let run_finished = ctx.run_finished();
        let poll_ctx = ctx.clone();
        match tokio::task::spawn_blocking(move || poll_once(&poll_ctx)).await {
            Ok(Ok(true)) if !run_finished => polls += 1,
            Ok(Ok(true)) => {
                polls += 1;
                debug!(test_id, %run_id, polls, "Run Task exited while engine reports running");
                break;
            }
            Ok(Ok(false)) => {
                polls += 1;
                break;
            }
            Ok(Err(EngineError::InvalidHandle)) => {
                debug!(test_id, %run_id, polls, "Handle closed, ending progress polling");
                break;
            }
            Ok(Err(e)) => {
                warn!(test_id, %run_id, error = %e, "Progress poll failed");
                break;
            }
            Err(e) => {
                warn!(test_id, %run_id, error = %e, "Progress poll panicked");
                break;
            }
        }
        tokio::time::sleep(settings.poll_interval).await;
    }

    // Pick up whatever the engine logged after the last poll.
    let drain_ctx = ctx.clone();
    if let Ok(Err(e)) = tokio::task::spawn_blocking(move || drain_logs(&drain_ctx)).await {
        debug!(test_id, %run_id, error = %e, "Final log drain skipped");
    }

    drop(grant);
    info!(test_id, %run_id, polls, "Progress polling finished");
    ctx.bus.publish(NotificationEvent::Completed { test_id });
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::sim::SimulatedEngine;
    use crate::engine::Engine;
    use crate::notify::EventLog;

    fn fast_settings(lifetime: HandleLifetime) -> OrchestratorSettings {
        OrchestratorSettings {
            warm_up: Duration::from_millis(1),
            poll_interval: Duration::from_millis(5),
            handle_lifetime: lifetime,
        }
    }

    fn orchestrator(lifetime: HandleLifetime) -> (Orchestrator, Arc<EventLog>) {
        orchestrator_with(0.0, fast_settings(lifetime))
    }

    fn orchestrator_with(
        time_scale: f64,
        settings: OrchestratorSettings,
    ) -> (Orchestrator, Arc<EventLog>) {
        let factory = move || -> Result<Box<dyn Engine>, EngineError> {
            Ok(Box::new(SimulatedEngine::new(time_scale)))
        };
        let bus = Arc::new(NotificationBus::new());
        let log = EventLog::new();
        bus.subscribe(log.clone());
        let orch = Orchestrator::new(Arc::new(factory), settings, bus).unwrap();
        (orch, log)
    }

    fn completed_count(events: &[NotificationEvent]) -> usize {
        events
            .iter()
            .filter(|e| matches!(e, NotificationEvent::Completed { .. }))
            .count()
    }

    #[tokio::test]
    async fn test_run_reaches_completed_and_clears_flag() {
        let (orch, log) = orchestrator(HandleLifetime::Shared);
        assert_eq!(orch.start_test(5).unwrap(), StartOutcome::Started);
        orch.wait_idle().await;

        // Run Task updates and Completed may interleave in any order.
        let events = log.events();
        assert_eq!(events.first(), Some(&NotificationEvent::Started { test_id: 5 }));
        let completed = events
            .iter()
            .filter(|e| matches!(e, NotificationEvent::Completed { .. }))
            .count();
        assert_eq!(completed, 1);
        assert!(events.contains(&NotificationEvent::Update {
            test_id: 5,
            message: INITIALIZED_MESSAGE.to_string(),
        }));
        assert!(events
            .iter()
            .any(|e| e.message().is_some_and(|m| m.starts_with("VoiceMark completed"))));
        assert!(!orch.is_running());
        assert!(orch.handle().unwrap().is_open());
    }

    #[tokio::test]
    async fn test_unknown_test_surfaces_as_update() {
        let (orch, log) = orchestrator(HandleLifetime::Shared);
        orch.start_test(42).unwrap();
        orch.wait_idle().await;

        let events = log.events();
        assert!(events.contains(&NotificationEvent::Update {
            test_id: 42,
            message: EngineError::UnknownTest { test_id: 42 }.to_string(),
        }));
        assert!(events.contains(&NotificationEvent::Completed { test_id: 42 }));
        assert!(!orch.is_running());
    }

    #[tokio::test]
    async fn test_per_invocation_handle_is_replaced() {
        let (orch, _log) = orchestrator(HandleLifetime::PerInvocation);
        let first = orch.handle().unwrap();
        orch.start_test(0).unwrap();
        orch.wait_idle().await;

        assert!(!first.is_open());
        let second = orch.handle().unwrap();
        assert!(second.is_open());
        assert!(!Arc::ptr_eq(&first, &second));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_next_invocation_never_sees_previous_poller() {
        let (orch, log) = orchestrator(HandleLifetime::Shared);
        orch.start_test(0).unwrap();
        let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
        while orch.is_running() && tokio::time::Instant::now() < deadline {
            tokio::time::sleep(Duration::from_millis(1)).await;
        }
        assert_eq!(orch.start_test(5).unwrap(), StartOutcome::Started);
        orch.wait_idle().await;

        let events = log.events();
        let second = events
            .iter()
            .position(|e| *e == NotificationEvent::Started { test_id: 5 })
            .unwrap();
        assert!(events[..second].contains(&NotificationEvent::Completed { test_id: 0 }));
        assert!(events[second..].iter().all(|e| e.test_id() == 5));
        assert_eq!(completed_count(&events), 2);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_oversized_time_scale_faults_and_completes() {
        let (orch, log) = orchestrator_with(1e30, fast_settings(HandleLifetime::Shared));
        orch.start_test(0).unwrap();
        tokio::time::timeout(Duration::from_secs(5), orch.wait_idle())
            .await
            .expect("invocation should finish");

        let events = log.events();
        assert_eq!(completed_count(&events), 1);
        assert!(events
            .iter()
            .any(|e| e.message().is_some_and(|m| m.starts_with("engine fault:"))));
        assert!(!orch.is_running());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_per_invocation_keeps_logs_written_before_close() {
        // The run finishes and closes its handle long before the first poll.
        let settings = OrchestratorSettings {
            warm_up: Duration::from_millis(200),
            poll_interval: Duration::from_millis(5),
            handle_lifetime: HandleLifetime::PerInvocation,
        };
        let (orch, log) = orchestrator_with(0.0, settings);
        orch.start_test(5).unwrap();
        orch.wait_idle().await;

        let events = log.events();
        let has = |needle: &str| {
            events
                .iter()
                .any(|e| e.message().is_some_and(|m| m.contains(needle)))
        };
        assert!(has("Group : VoiceMark"));
        assert!(has("VoiceMark progress 100%"));
        assert_eq!(completed_count(&events), 1);
    }

    #[test]
    fn test_start_outside_runtime_fails_cleanly() {
        let (orch, log) = orchestrator(HandleLifetime::Shared);
        assert!(matches!(orch.start_test(0), Err(StartError::NoRuntime)));
        assert!(!orch.is_running());
        assert!(log.events().is_empty());
    }

    #[tokio::test]
    async fn test_reset_settings_through_orchestrator() {
        let (orch, _log) = orchestrator(HandleLifetime::Shared);
        let params = orch.parameters().unwrap();
        let views = orch.params_for_test(0).unwrap();
        let level = views
            .iter()
            .position(|v| v.name().unwrap() == "audio_level")
            .unwrap();
        params.set(0, level, crate::params::Value::Int(2)).unwrap();

        let summary = orch.reset_settings(0).unwrap();
        assert!(summary.is_clean());
        assert_eq!(params.get(0, level).unwrap(), crate::params::Value::Int(1));
    }
}
