use chrono::{DateTime, Utc};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, AtomicU8, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, OnceLock, PoisonError, TryLockError};
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace};

use spyglass_config::DEFAULT_SCRIPT_TIMEOUT_MS;
use spyglass_events::{NotificationDispatcher, ScriptRunningState, ScriptStateChanged};

use crate::error::{ScriptError, ScriptResult};
use crate::runtime::ScriptRuntime;

/// Extension of script files picked up from directories
pub const SCRIPT_EXTENSION: &str = "rhai";

/// Milliseconds on a process-wide monotonic clock
pub(crate) fn monotonic_ms() -> u64 {
    static EPOCH: OnceLock<Instant> = OnceLock::new();
    EPOCH.get_or_init(Instant::now).elapsed().as_millis() as u64
}

pub(crate) fn lock<T: ?Sized>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Where a script's body comes from
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ScriptSource {
    /// Re-read from disk on every run
    File(PathBuf),
    Inline(String),
}

impl ScriptSource {
    pub fn read(&self) -> ScriptResult<String> {
        match self {
            ScriptSource::File(path) => std::fs::read_to_string(path).map_err(|source| {
                if source.kind() == std::io::ErrorKind::NotFound {
                    ScriptError::NotFound(path.clone())
                } else {
                    ScriptError::Io {
                        path: path.clone(),
                        source,
                    }
                }
            }),
            ScriptSource::Inline(text) => Ok(text.clone()),
        }
    }

    pub fn file(&self) -> Option<&Path> {
        match self {
            ScriptSource::File(path) => Some(path),
            ScriptSource::Inline(_) => None,
        }
    }
}

/// Something the script environment started that must end with the script
pub trait StoppableTask: Send + Sync {
    fn stop(&self);
}

/// Liveness and publication counters, shared with the script's I/O bridge
#[derive(Debug)]
pub struct ScriptTelemetry {
    last_touch_ms: AtomicU64,
    timeout_ms: AtomicU64,
    published_count: AtomicU64,
    last_published: Mutex<Option<DateTime<Utc>>>,
}

impl ScriptTelemetry {
    pub fn new(timeout: Duration) -> Self {
        Self {
            last_touch_ms: AtomicU64::new(monotonic_ms()),
            timeout_ms: AtomicU64::new(timeout.as_millis() as u64),
            published_count: AtomicU64::new(0),
            last_published: Mutex::new(None),
        }
    }

    /// Record a heartbeat
    pub fn touch(&self) {
        self.last_touch_ms.store(monotonic_ms(), Ordering::Release);
    }

    pub fn last_touch_ms(&self) -> u64 {
        self.last_touch_ms.load(Ordering::Acquire)
    }

    /// Time since the last heartbeat
    pub fn idle_for(&self) -> Duration {
        Duration::from_millis(monotonic_ms().saturating_sub(self.last_touch_ms()))
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms.load(Ordering::Acquire))
    }

    pub fn set_timeout(&self, timeout: Duration) {
        self.timeout_ms
            .store(timeout.as_millis() as u64, Ordering::Release);
    }

    pub fn record_publication(&self) {
        self.published_count.fetch_add(1, Ordering::AcqRel);
        *lock(&self.last_published) = Some(Utc::now());
    }

    pub fn published_count(&self) -> u64 {
        self.published_count.load(Ordering::Acquire)
    }

    pub fn last_published(&self) -> Option<DateTime<Utc>> {
        *lock(&self.last_published)
    }
}

/// A registered script.
///
/// Owned by the [`ScriptManager`](crate::ScriptManager); runners and watchdogs
/// only hold clones of the `Arc`. The status is written by the runner and
/// the watchdog, always under `transition_lock` so that the order of
/// dispatched notifications matches the order of writes.
pub struct Script {
    id: String,
    name: String,
    source: ScriptSource,
    repeat: bool,
    auto_start: bool,
    root_directory: Option<PathBuf>,
    status: AtomicU8,
    transition_lock: Mutex<()>,
    telemetry: Arc<ScriptTelemetry>,
    runtime: Mutex<Box<dyn ScriptRuntime>>,
    active_run: Mutex<Option<CancellationToken>>,
    last_error: Mutex<Option<String>>,
    tasks: Mutex<Vec<Arc<dyn StoppableTask>>>,
}

impl Script {
    pub(crate) fn new(
        id: impl Into<String>,
        name: impl Into<String>,
        source: ScriptSource,
        runtime: Box<dyn ScriptRuntime>,
    ) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            source,
            repeat: false,
            auto_start: false,
            root_directory: None,
            status: AtomicU8::new(ScriptRunningState::NotStarted as u8),
            transition_lock: Mutex::new(()),
            telemetry: Arc::new(ScriptTelemetry::new(Duration::from_millis(
                DEFAULT_SCRIPT_TIMEOUT_MS,
            ))),
            runtime: Mutex::new(runtime),
            active_run: Mutex::new(None),
            last_error: Mutex::new(None),
            tasks: Mutex::new(Vec::new()),
        }
    }

    pub(crate) fn with_repeat(mut self, repeat: bool) -> Self {
        self.repeat = repeat;
        self
    }

    pub(crate) fn with_auto_start(mut self, auto_start: bool) -> Self {
        self.auto_start = auto_start;
        self
    }

    pub(crate) fn with_timeout(self, timeout: Duration) -> Self {
        self.telemetry.set_timeout(timeout);
        self
    }

    pub(crate) fn with_root_directory(mut self, root: impl Into<PathBuf>) -> Self {
        self.root_directory = Some(root.into());
        self
    }

    /// Canonical path for file scripts, the given name for inline ones
    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Name including the subdirectory under the directory it was populated from
    pub fn name_with_subdirectory(&self) -> String {
        let (Some(root), Some(file)) = (&self.root_directory, self.source.file()) else {
            return self.name.clone();
        };

        match file.strip_prefix(root) {
            Ok(relative) => relative.with_extension("").to_string_lossy().into_owned(),
            Err(_) => self.name.clone(),
        }
    }

    pub fn source(&self) -> &ScriptSource {
        &self.source
    }

    pub fn is_file_based(&self) -> bool {
        matches!(self.source, ScriptSource::File(_))
    }

    pub fn is_repeat(&self) -> bool {
        self.repeat
    }

    pub fn is_auto_start(&self) -> bool {
        self.auto_start
    }

    pub fn status(&self) -> ScriptRunningState {
        ScriptRunningState::from_u8(self.status.load(Ordering::Acquire))
            .unwrap_or(ScriptRunningState::NotStarted)
    }

    pub fn telemetry(&self) -> &Arc<ScriptTelemetry> {
        &self.telemetry
    }

    pub fn timeout(&self) -> Duration {
        self.telemetry.timeout()
    }

    pub fn touch(&self) {
        self.telemetry.touch();
    }

    /// Message of the error that failed the most recent run
    pub fn last_error(&self) -> Option<String> {
        lock(&self.last_error).clone()
    }

    /// Whether a run currently owns this script's runtime
    pub fn is_active(&self) -> bool {
        lock(&self.active_run).is_some()
    }

    pub fn add_task(&self, task: Arc<dyn StoppableTask>) {
        lock(&self.tasks).push(task);
    }

    /// Stop and forget every background task registered for this script
    pub fn stop_tasks(&self) {
        let tasks: Vec<_> = lock(&self.tasks).drain(..).collect();
        if !tasks.is_empty() {
            debug!(target: "scripting", "Stopping {} background task(s) of {}", tasks.len(), self.name);
        }
        for task in tasks {
            task.stop();
        }
    }

    pub fn task_count(&self) -> usize {
        lock(&self.tasks).len()
    }

    /// Claim the script for a new run.
    ///
    /// Returns `false` (and changes nothing) while the script is running or
    /// a previous body is still being evaluated, e.g. after being frozen.
    pub(crate) fn begin_run(
        &self,
        cancel: CancellationToken,
        dispatcher: &NotificationDispatcher,
    ) -> bool {
        let mut active = lock(&self.active_run);
        if active.is_some() || self.status() == ScriptRunningState::Running {
            return false;
        }
        *active = Some(cancel);
        *lock(&self.last_error) = None;
        self.transition(ScriptRunningState::Running, dispatcher);
        true
    }

    /// Release the run claim and record the final state
    pub(crate) fn complete_run(
        &self,
        final_state: ScriptRunningState,
        dispatcher: &NotificationDispatcher,
    ) {
        let mut active = lock(&self.active_run);
        active.take();
        self.transition(final_state, dispatcher);
    }

    /// Request cooperative cancellation of the active run
    pub(crate) fn request_stop(&self) -> bool {
        match lock(&self.active_run).as_ref() {
            Some(cancel) => {
                cancel.cancel();
                true
            }
            None => false,
        }
    }

    pub(crate) fn transition(
        &self,
        new_state: ScriptRunningState,
        dispatcher: &NotificationDispatcher,
    ) {
        let _guard = lock(&self.transition_lock);
        trace!(target: "scripting", "Changing [{}] script's state to [{}]", self.name, new_state);
        self.status.store(new_state as u8, Ordering::Release);
        dispatcher.dispatch(ScriptStateChanged::new(self.id.clone(), new_state));
    }

    /// Move from Running to Frozen; any other state is left alone
    pub(crate) fn freeze_if_running(&self, dispatcher: &NotificationDispatcher) -> bool {
        let _guard = lock(&self.transition_lock);
        let frozen = self
            .status
            .compare_exchange(
                ScriptRunningState::Running as u8,
                ScriptRunningState::Frozen as u8,
                Ordering::AcqRel,
                Ordering::Acquire,
            )
            .is_ok();
        if frozen {
            dispatcher.dispatch(ScriptStateChanged::new(
                self.id.clone(),
                ScriptRunningState::Frozen,
            ));
        }
        frozen
    }

    pub(crate) fn set_last_error(&self, error: &ScriptError) {
        *lock(&self.last_error) = Some(error.to_string());
    }

    /// Run `f` with exclusive access to the runtime, waiting for it if needed
    pub(crate) fn with_runtime<R>(&self, f: impl FnOnce(&mut dyn ScriptRuntime) -> R) -> R {
        let mut runtime = lock(&self.runtime);
        f(runtime.as_mut())
    }

    /// Run `f` with exclusive access to the runtime, failing if it is in use
    pub(crate) fn try_with_runtime<R>(
        &self,
        f: impl FnOnce(&mut dyn ScriptRuntime) -> R,
    ) -> ScriptResult<R> {
        let mut runtime = match self.runtime.try_lock() {
            Ok(runtime) => runtime,
            Err(TryLockError::Poisoned(poisoned)) => poisoned.into_inner(),
            Err(TryLockError::WouldBlock) => return Err(ScriptError::Busy(self.id.clone())),
        };
        Ok(f(runtime.as_mut()))
    }
}

impl std::fmt::Debug for Script {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Script")
            .field("id", &self.id)
            .field("name", &self.name)
            .field("status", &self.status())
            .field("repeat", &self.repeat)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runtime::RhaiRuntime;
    use std::sync::atomic::AtomicBool;

    fn inline(name: &str) -> Script {
        Script::new(
            name,
            name,
            ScriptSource::Inline("true".into()),
            Box::new(RhaiRuntime::new(name)),
        )
    }

    #[test]
    fn test_new_script_not_started() {
        let script = inline("s");
        assert_eq!(script.status(), ScriptRunningState::NotStarted);
        assert_eq!(script.timeout(), Duration::from_millis(DEFAULT_SCRIPT_TIMEOUT_MS));
        assert!(!script.is_active());
    }

    #[test]
    fn test_begin_run_claims_once() {
        let script = inline("s");
        let dispatcher = NotificationDispatcher::disabled();

        assert!(script.begin_run(CancellationToken::new(), &dispatcher));
        assert!(!script.begin_run(CancellationToken::new(), &dispatcher));
        assert_eq!(script.status(), ScriptRunningState::Running);

        script.complete_run(ScriptRunningState::Finished, &dispatcher);
        assert!(!script.is_active());
        assert!(script.begin_run(CancellationToken::new(), &dispatcher));
    }

    #[test]
    fn test_frozen_script_with_live_body_cannot_be_restarted() {
        let script = inline("s");
        let dispatcher = NotificationDispatcher::disabled();

        assert!(script.begin_run(CancellationToken::new(), &dispatcher));
        assert!(script.freeze_if_running(&dispatcher));
        assert_eq!(script.status(), ScriptRunningState::Frozen);
        assert!(!script.begin_run(CancellationToken::new(), &dispatcher));
    }

    #[test]
    fn test_freeze_only_from_running() {
        let script = inline("s");
        let dispatcher = NotificationDispatcher::disabled();
        assert!(!script.freeze_if_running(&dispatcher));
        assert_eq!(script.status(), ScriptRunningState::NotStarted);
    }

    #[test]
    fn test_request_stop_cancels_active_token() {
        let script = inline("s");
        let dispatcher = NotificationDispatcher::disabled();
        assert!(!script.request_stop());

        let token = CancellationToken::new();
        script.begin_run(token.clone(), &dispatcher);
        assert!(script.request_stop());
        assert!(token.is_cancelled());
    }

    #[test]
    fn test_name_with_subdirectory() {
        let script = Script::new(
            "/scripts/other/loop.rhai",
            "loop",
            ScriptSource::File(PathBuf::from("/scripts/other/loop.rhai")),
            Box::new(RhaiRuntime::new("loop")),
        )
        .with_root_directory("/scripts");

        assert_eq!(
            PathBuf::from(script.name_with_subdirectory()),
            PathBuf::from("other/loop")
        );
        assert_eq!(inline("x").name_with_subdirectory(), "x");
    }

    #[test]
    fn test_publication_counters() {
        let telemetry = ScriptTelemetry::new(Duration::from_millis(100));
        assert!(telemetry.last_published().is_none());
        telemetry.record_publication();
        telemetry.record_publication();
        assert_eq!(telemetry.published_count(), 2);
        assert!(telemetry.last_published().is_some());
    }

    struct Flag(AtomicBool);

    impl StoppableTask for Flag {
        fn stop(&self) {
            self.0.store(true, Ordering::SeqCst);
        }
    }

    #[test]
    fn test_stop_tasks() {
        let script = inline("s");
        let flag = Arc::new(Flag(AtomicBool::new(false)));
        script.add_task(flag.clone());
        assert_eq!(script.task_count(), 1);
        script.stop_tasks();
        assert!(flag.0.load(Ordering::SeqCst));
        assert_eq!(script.task_count(), 0);
    }

    #[test]
    fn test_stopped_tasks_are_not_stopped_again() {
        let script = inline("s");
        let first = Arc::new(Flag(AtomicBool::new(false)));
        script.add_task(first.clone());
        script.stop_tasks();

        first.0.store(false, Ordering::SeqCst);
        let second = Arc::new(Flag(AtomicBool::new(false)));
        script.add_task(second.clone());
        script.stop_tasks();

        assert!(!first.0.load(Ordering::SeqCst));
        assert!(second.0.load(Ordering::SeqCst));
    }
}
