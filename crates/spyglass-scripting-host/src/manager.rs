use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};
use std::time::Duration;
use tokio::runtime::Handle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use spyglass_config::ScriptDetails;
use spyglass_events::{NotificationDispatcher, SpyMessage};

use crate::context::{
    InvocationContext, ScriptArgs, ScriptValue, AFTER_HOOK, ARGS_BINDING, BEFORE_HOOK,
    MESSAGE_BINDING, ON_MESSAGE_HOOK, RECEIVED_MESSAGE_BINDING,
};
use crate::error::{ScriptError, ScriptResult};
use crate::io::{MessageTransport, ScriptIo};
use crate::runtime::{rhai_runtime_factory, RuntimeFactory};
use crate::script::{Script, ScriptSource};
use crate::script_runner::{RunMode, ScriptRunner};
use crate::script_scanner::{list_script_files, ScanResult};
use crate::watchdog::DEFAULT_WATCHDOG_INTERVAL;

/// The script catalog.
///
/// Registers scripts, starts and stops their runs and invokes their hooks.
/// All methods take `&self`; share the manager behind an `Arc`.
pub struct ScriptManager {
    handle: Handle,
    dispatcher: NotificationDispatcher,
    transport: Arc<dyn MessageTransport>,
    runtime_factory: RuntimeFactory,
    watchdog_interval: Duration,
    scripts: RwLock<HashMap<String, Arc<Script>>>,
    custom_parameters: RwLock<ScriptArgs>,
    shutdown: CancellationToken,
}

impl ScriptManager {
    pub fn new(
        handle: Handle,
        dispatcher: NotificationDispatcher,
        transport: Arc<dyn MessageTransport>,
    ) -> Self {
        Self {
            handle,
            dispatcher,
            transport,
            runtime_factory: rhai_runtime_factory(),
            watchdog_interval: DEFAULT_WATCHDOG_INTERVAL,
            scripts: RwLock::new(HashMap::new()),
            custom_parameters: RwLock::new(ScriptArgs::new()),
            shutdown: CancellationToken::new(),
        }
    }

    pub fn with_watchdog_interval(mut self, interval: Duration) -> Self {
        self.watchdog_interval = interval;
        self
    }

    pub fn with_runtime_factory(mut self, factory: RuntimeFactory) -> Self {
        self.runtime_factory = factory;
        self
    }

    fn read_scripts(&self) -> RwLockReadGuard<'_, HashMap<String, Arc<Script>>> {
        self.scripts.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write_scripts(&self) -> RwLockWriteGuard<'_, HashMap<String, Arc<Script>>> {
        self.scripts.write().unwrap_or_else(PoisonError::into_inner)
    }

    // ===== Registration =====

    fn file_script(&self, path: PathBuf, details: &ScriptDetails, root: Option<&Path>) -> Script {
        let name = path
            .file_stem()
            .map(|s| s.to_string_lossy().into_owned())
            .unwrap_or_else(|| path.to_string_lossy().into_owned());
        let id = path.to_string_lossy().into_owned();

        let script = Script::new(
            id,
            name.clone(),
            ScriptSource::File(path),
            (self.runtime_factory)(&name),
        )
        .with_repeat(details.repeat)
        .with_auto_start(details.auto_start)
        .with_timeout(details.timeout());

        match root {
            Some(root) => script.with_root_directory(root),
            None => script,
        }
    }

    fn insert_replacing(&self, script: Script) -> Arc<Script> {
        let script = Arc::new(script);
        let previous = self
            .write_scripts()
            .insert(script.id().to_string(), script.clone());

        if let Some(previous) = previous {
            debug!(target: "scripting", "Replacing script {}", previous.id());
            previous.request_stop();
            previous.stop_tasks();
        }
        script
    }

    /// Register a file script, replacing any script with the same id
    pub fn add_script(&self, details: &ScriptDetails) -> ScriptResult<Arc<Script>> {
        let path = canonical_script_path(&details.file)?;
        let script = self.insert_replacing(self.file_script(path, details, None));
        info!(target: "scripting", "Added script {}", script.id());
        Ok(script)
    }

    pub fn add_script_path(&self, path: impl AsRef<Path>) -> ScriptResult<Arc<Script>> {
        self.add_script(&ScriptDetails::new(path.as_ref()))
    }

    /// Register a script from source text; `name` doubles as its id
    pub fn add_inline_script(&self, name: &str, text: &str) -> Arc<Script> {
        let script = Script::new(
            name,
            name,
            ScriptSource::Inline(text.to_string()),
            (self.runtime_factory)(name),
        );
        let script = self.insert_replacing(script);
        info!(target: "scripting", "Added inline script {}", name);
        script
    }

    /// Like `add_inline_script`, with the options of a configured script
    pub fn add_inline_script_with(
        &self,
        name: &str,
        text: &str,
        repeat: bool,
        timeout: Duration,
    ) -> Arc<Script> {
        let script = Script::new(
            name,
            name,
            ScriptSource::Inline(text.to_string()),
            (self.runtime_factory)(name),
        )
        .with_repeat(repeat)
        .with_timeout(timeout);
        self.insert_replacing(script)
    }

    /// Register each entry, logging and skipping the ones that fail
    pub fn add_scripts(&self, details: &[ScriptDetails]) -> Vec<Arc<Script>> {
        details
            .iter()
            .filter_map(|entry| match self.add_script(entry) {
                Ok(script) => Some(script),
                Err(e) => {
                    warn!(target: "scripting", "Skipping script {}: {}", entry.file.display(), e);
                    None
                }
            })
            .collect()
    }

    /// Register the configured scripts that are not in the catalog yet
    pub fn populate_scripts(&self, details: &[ScriptDetails]) -> Vec<Arc<Script>> {
        let mut added = Vec::new();
        for entry in details {
            let path = match canonical_script_path(&entry.file) {
                Ok(path) => path,
                Err(e) => {
                    warn!(target: "scripting", "Skipping script {}: {}", entry.file.display(), e);
                    continue;
                }
            };
            if let Some(script) = self.insert_if_absent(path, entry, None) {
                added.push(script);
            }
        }
        added
    }

    /// Register every script file found in `dir` not in the catalog yet
    pub fn populate_from_directory(&self, dir: &Path, recursive: bool) -> Vec<Arc<Script>> {
        let files = list_script_files(dir, recursive);
        if files.is_empty() {
            info!(target: "scripting", "No scripts found in {}", dir.display());
            return Vec::new();
        }

        let root = std::fs::canonicalize(dir).unwrap_or_else(|_| dir.to_path_buf());
        let mut added = Vec::new();
        for file in files {
            match canonical_script_path(&file) {
                Ok(path) => {
                    let details = ScriptDetails::new(&path);
                    if let Some(script) = self.insert_if_absent(path, &details, Some(&root)) {
                        added.push(script);
                    }
                }
                Err(e) => warn!(target: "scripting", "Skipping {}: {}", file.display(), e),
            }
        }

        info!(
            target: "scripting",
            "Populated {} new script(s) from {}",
            added.len(),
            dir.display()
        );
        added
    }

    fn insert_if_absent(
        &self,
        path: PathBuf,
        details: &ScriptDetails,
        root: Option<&Path>,
    ) -> Option<Arc<Script>> {
        let id = path.to_string_lossy().into_owned();
        let mut scripts = self.write_scripts();
        if scripts.contains_key(&id) {
            return None;
        }
        let script = Arc::new(self.file_script(path, details, root));
        scripts.insert(id, script.clone());
        debug!(target: "scripting", "Registered script {}", script.id());
        Some(script)
    }

    /// Apply a directory scan: register added files, evict removed ones.
    ///
    /// Changed files need nothing; sources are re-read on every run.
    pub fn refresh_from_directory(&self, dir: &Path, scan: &ScanResult) -> Vec<Arc<Script>> {
        let root = std::fs::canonicalize(dir).unwrap_or_else(|_| dir.to_path_buf());

        for removed in &scan.removed {
            let id = match removed.strip_prefix(dir) {
                Ok(relative) => root.join(relative),
                Err(_) => removed.clone(),
            };
            if self.remove_script(&id.to_string_lossy()).is_some() {
                info!(target: "scripting", "Script file {} removed", removed.display());
            }
        }

        let mut added = Vec::new();
        for file in &scan.added {
            if let Ok(path) = canonical_script_path(file) {
                let details = ScriptDetails::new(&path);
                if let Some(script) = self.insert_if_absent(path, &details, Some(&root)) {
                    info!(target: "scripting", "Script file {} added", file.display());
                    added.push(script);
                }
            }
        }
        added
    }

    pub fn add_custom_parameters(&self, parameters: ScriptArgs) {
        self.custom_parameters
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .extend(parameters);
    }

    // ===== Lookup =====

    pub fn get_script(&self, id: &str) -> Option<Arc<Script>> {
        self.read_scripts().get(id).cloned()
    }

    pub fn contains_script(&self, id: &str) -> bool {
        self.read_scripts().contains_key(id)
    }

    /// All registered scripts, ordered by id
    pub fn scripts(&self) -> Vec<Arc<Script>> {
        let mut scripts: Vec<_> = self.read_scripts().values().cloned().collect();
        scripts.sort_by(|a, b| a.id().cmp(b.id()));
        scripts
    }

    pub fn are_scripts_running(&self) -> bool {
        self.read_scripts().values().any(|s| s.is_active())
    }

    // ===== Runs =====

    fn context_for(
        &self,
        script: &Script,
        cancel: CancellationToken,
        args: Option<&ScriptArgs>,
    ) -> InvocationContext {
        let io = ScriptIo::new(
            script.name(),
            script.telemetry().clone(),
            self.transport.clone(),
            cancel,
        );

        // Custom parameters take precedence over call arguments
        let mut merged = args.cloned().unwrap_or_default();
        merged.extend(
            self.custom_parameters
                .read()
                .unwrap_or_else(PoisonError::into_inner)
                .clone(),
        );

        InvocationContext::new(io).with_binding(ARGS_BINDING, ScriptValue::Object(merged))
    }

    fn start(
        &self,
        script: &Arc<Script>,
        asynchronous: bool,
        args: Option<&ScriptArgs>,
        message: Option<(&str, &SpyMessage)>,
    ) -> bool {
        let cancel = self.shutdown.child_token();
        let mut ctx = self.context_for(script, cancel.clone(), args);
        if let Some((binding, message)) = message {
            if let Err(e) = ctx.bind_serialized(binding, message) {
                error!(target: "scripting", "Cannot run {}: {}", script.name(), e);
                return false;
            }
        }

        if !script.begin_run(cancel, &self.dispatcher) {
            debug!(target: "scripting", "Script {} already running", script.name());
            return false;
        }

        if asynchronous {
            let runner = ScriptRunner::new(
                script.clone(),
                ctx,
                self.dispatcher.clone(),
                RunMode::Asynchronous(self.handle.clone()),
                self.watchdog_interval,
            );
            self.handle.spawn_blocking(move || runner.run());
        } else {
            let runner = ScriptRunner::new(
                script.clone(),
                ctx,
                self.dispatcher.clone(),
                RunMode::Synchronous,
                self.watchdog_interval,
            );
            runner.run();
        }
        true
    }

    /// Start a run; `false` if the script is already running.
    ///
    /// A synchronous run blocks until it ends; an asynchronous one returns
    /// as soon as it has been dispatched.
    pub fn run_script(
        &self,
        script: &Arc<Script>,
        asynchronous: bool,
        args: Option<&ScriptArgs>,
    ) -> bool {
        self.start(script, asynchronous, args, None)
    }

    /// Run asynchronously with `message` bound
    pub fn run_script_with_message(&self, script: &Arc<Script>, message: &SpyMessage) -> bool {
        self.start(script, true, None, Some((MESSAGE_BINDING, message)))
    }

    /// Call the script's `onMessage` function with `receivedMessage` bound
    pub fn run_script_with_received_message(
        &self,
        script: &Arc<Script>,
        message: &SpyMessage,
    ) -> bool {
        let result = self.call(script, ON_MESSAGE_HOOK, &[], |ctx| {
            ctx.bind_serialized(RECEIVED_MESSAGE_BINDING, message)
        });
        match result {
            Ok(Some(_)) => true,
            Ok(None) => {
                debug!(target: "scripting", "Script {} has no {} function", script.name(), ON_MESSAGE_HOOK);
                false
            }
            Err(e) => {
                warn!(target: "scripting", "{} of {} failed: {}", ON_MESSAGE_HOOK, script.name(), e);
                false
            }
        }
    }

    /// Run a registered script synchronously with `receivedMessage` bound
    pub fn run_script_file_with_received_message(&self, id: &str, message: &SpyMessage) -> bool {
        match self.get_script(id) {
            Some(script) => {
                self.start(&script, false, None, Some((RECEIVED_MESSAGE_BINDING, message)))
            }
            None => {
                warn!(target: "scripting", "Script {} not found", id);
                false
            }
        }
    }

    /// Register a file script (replacing) and start it
    pub fn add_and_run_script(
        &self,
        path: impl AsRef<Path>,
        asynchronous: bool,
        args: Option<&ScriptArgs>,
    ) -> ScriptResult<Arc<Script>> {
        let script = self.add_script_path(path)?;
        self.run_script(&script, asynchronous, args);
        Ok(script)
    }

    /// Ask the active run to stop; the body may keep going until it reaches
    /// a point where the runtime checks for cancellation
    pub fn stop_script(&self, script: &Script) -> bool {
        let requested = script.request_stop();
        if requested {
            info!(target: "scripting", "Stopping script {}", script.name());
        }
        requested
    }

    pub fn stop_scripts(&self) {
        for script in self.scripts() {
            if script.is_file_based() {
                self.stop_script(&script);
            }
        }
    }

    /// Evict a script, stopping its run and its background tasks
    pub fn remove_script(&self, id: &str) -> Option<Arc<Script>> {
        let removed = self.write_scripts().remove(id)?;
        removed.request_stop();
        removed.stop_tasks();
        info!(target: "scripting", "Removed script {}", id);
        Some(removed)
    }

    /// Stop every run and background task; later runs end immediately
    pub fn shutdown(&self) {
        info!(target: "scripting", "Shutting down script manager");
        self.shutdown.cancel();
        for script in self.read_scripts().values() {
            script.stop_tasks();
        }
    }

    // ===== Hooks =====

    fn call(
        &self,
        script: &Script,
        function: &str,
        args: &[ScriptValue],
        bind: impl FnOnce(&mut InvocationContext) -> ScriptResult<()>,
    ) -> ScriptResult<Option<ScriptValue>> {
        let source = script.source().read()?;
        let mut ctx = self.context_for(script, self.shutdown.child_token(), None);
        bind(&mut ctx)?;
        script.try_with_runtime(|runtime| runtime.invoke_function(&source, function, args, &ctx))?
    }

    /// Call a top-level function of the script.
    ///
    /// `Ok(None)` when the script defines no such function;
    /// [`ScriptError::Busy`] while a run is evaluating the script.
    pub fn invoke_function(
        &self,
        script: &Script,
        function: &str,
        args: &[ScriptValue],
    ) -> ScriptResult<Option<ScriptValue>> {
        self.call(script, function, args, |_| Ok(()))
    }

    fn invoke_hook(&self, script: &Script, hook: &str) -> bool {
        match self.invoke_function(script, hook, &[]) {
            Ok(_) => true,
            Err(e) => {
                warn!(target: "scripting", "{} hook of {} failed: {}", hook, script.name(), e);
                false
            }
        }
    }

    /// `true` when the hook succeeds or is not defined
    pub fn invoke_before(&self, script: &Script) -> bool {
        self.invoke_hook(script, BEFORE_HOOK)
    }

    pub fn invoke_after(&self, script: &Script) -> bool {
        self.invoke_hook(script, AFTER_HOOK)
    }
}

impl Drop for ScriptManager {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}

fn canonical_script_path(path: &Path) -> ScriptResult<PathBuf> {
    std::fs::canonicalize(path).map_err(|source| {
        if source.kind() == std::io::ErrorKind::NotFound {
            ScriptError::NotFound(path.to_path_buf())
        } else {
            ScriptError::Io {
                path: path.to_path_buf(),
                source,
            }
        }
    })
}
