//! The process-wide embedded interpreter and the bridge's public surface.
//!
//! The interpreter starts on first use and lives until the process exits. It
//! is never restarted: a failed start is remembered and reported to every
//! later caller.

use crate::arguments::{CallArguments, WireCall};
use crate::callback;
use crate::coordinator::{interpreter_lock, run_blocking, InterpreterLock, PendingCall, WorkerPool};
use crate::dispatcher::Dispatcher;
use crate::errors::{self, BridgeError};
use crate::handles::{self, Handle, HandleRegistry, ModuleHandle, ObjectHandle};
use crate::value::HostValue;
use ncp_config::{BridgeConfig, CallbackMode};
use once_cell::sync::OnceCell;
use parking_lot::Mutex;
use pyo3::prelude::*;
use pyo3::types::{PyDict, PyModule};
use std::ffi::CString;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, info};

static INTERPRETER: OnceCell<Result<Interpreter, BridgeError>> = OnceCell::new();

/// Handle to the embedded interpreter
pub struct Interpreter {
    config: BridgeConfig,
    dispatcher: Arc<Dispatcher>,
    workers: WorkerPool,
    lock: &'static InterpreterLock,
    import_paths: Mutex<Vec<String>>,
    executable: Mutex<Option<PathBuf>>,
}

impl Interpreter {
    /// Get the interpreter, starting it from the loaded configuration on first use
    pub fn get() -> Result<&'static Interpreter, BridgeError> {
        if let Some(interpreter) = Self::instance() {
            return Ok(interpreter);
        }
        let config = BridgeConfig::load()?;
        Self::initialize(config)
    }

    /// Start the interpreter with `config`.
    ///
    /// Only the first call has an effect; later calls return the running
    /// interpreter and ignore their configuration.
    pub fn initialize(config: BridgeConfig) -> Result<&'static Interpreter, BridgeError> {
        if INTERPRETER.get().is_some() {
            debug!("Interpreter already initialized, ignoring new configuration");
        }
        match INTERPRETER.get_or_init(|| Interpreter::start(config)) {
            Ok(interpreter) => Ok(interpreter),
            Err(e) => Err(BridgeError::Initialization(format!("{}", e))),
        }
    }

    /// The running interpreter, if it started successfully
    pub(crate) fn instance() -> Option<&'static Interpreter> {
        INTERPRETER.get().and_then(|started| started.as_ref().ok())
    }

    fn start(config: BridgeConfig) -> Result<Interpreter, BridgeError> {
        let start_time = Instant::now();
        config.validate()?;

        Python::initialize();
        debug!("Python interpreter initialized");

        let interpreter = Interpreter {
            dispatcher: Arc::new(Dispatcher::new(config.traceback)),
            workers: WorkerPool::new(config.worker_threads)?,
            lock: interpreter_lock(),
            import_paths: Mutex::new(Vec::new()),
            executable: Mutex::new(None),
            config,
        };

        run_blocking(interpreter.lock, |py| {
            let sys = PyModule::import(py, "sys")?;
            let version = sys.getattr("version")?.extract::<String>()?;
            debug!("Embedded Python {}", version);
            // Register the main thread with the threading module up front
            PyModule::import(py, "threading")?;
            Ok(())
        })
        .map_err(|e| BridgeError::Initialization(format!("{}", e)))?;

        for path in &interpreter.config.import_paths {
            interpreter.add_import_path(path)?;
        }
        if let Some(executable) = &interpreter.config.executable {
            interpreter.pin_executable(executable)?;
        }
        callback::set_mode(interpreter.config.callback_mode);

        info!(
            "Bridge ready ({} worker threads, {} callbacks) in {:?}",
            interpreter.workers.threads(),
            interpreter.config.callback_mode,
            start_time.elapsed()
        );
        Ok(interpreter)
    }

    /// Import a module from a file path (`dir/name.py`) or a bare module name
    pub fn import_sync(&self, path: &str, dedup: bool) -> Result<ModuleHandle, BridgeError> {
        let dispatcher = &self.dispatcher;
        run_blocking(self.lock, |py| dispatcher.import(py, path, dedup))
    }

    pub fn import(&self, path: &str, dedup: bool) -> PendingCall<ModuleHandle> {
        let dispatcher = Arc::clone(&self.dispatcher);
        let path = path.to_string();
        self.workers
            .spawn(self.lock, move |py| dispatcher.import(py, &path, dedup))
    }

    /// Construct an instance of `class_name` from a module
    pub fn create_sync(
        &self,
        module: ModuleHandle,
        class_name: &str,
        arguments: CallArguments,
    ) -> Result<ObjectHandle, BridgeError> {
        let dispatcher = &self.dispatcher;
        run_blocking(self.lock, |py| {
            dispatcher.create(py, module, class_name, &arguments)
        })
    }

    pub fn create(
        &self,
        module: ModuleHandle,
        class_name: &str,
        arguments: CallArguments,
    ) -> PendingCall<ObjectHandle> {
        let dispatcher = Arc::clone(&self.dispatcher);
        let class_name = class_name.to_string();
        self.workers.spawn(self.lock, move |py| {
            dispatcher.create(py, module, &class_name, &arguments)
        })
    }

    /// Call a function on a module or a method on an object
    pub fn call_sync(
        &self,
        handle: impl Into<Handle>,
        member: &str,
        arguments: CallArguments,
    ) -> Result<HostValue, BridgeError> {
        let handle = handle.into();
        let dispatcher = &self.dispatcher;
        run_blocking(self.lock, |py| dispatcher.call(py, handle, member, &arguments))
    }

    pub fn call(
        &self,
        handle: impl Into<Handle>,
        member: &str,
        arguments: CallArguments,
    ) -> PendingCall<HostValue> {
        let handle = handle.into();
        let dispatcher = Arc::clone(&self.dispatcher);
        let member = member.to_string();
        self.workers.spawn(self.lock, move |py| {
            dispatcher.call(py, handle, &member, &arguments)
        })
    }

    /// Call with a flat `[handle, member, ...args]` list, validating its shape first
    pub fn call_wire_sync(&self, args: Vec<HostValue>) -> Result<HostValue, BridgeError> {
        let call = WireCall::parse(args)?;
        self.call_sync(call.handle, &call.member, call.arguments)
    }

    pub fn call_wire(&self, args: Vec<HostValue>) -> PendingCall<HostValue> {
        match WireCall::parse(args) {
            Ok(call) => self.call(call.handle, &call.member, call.arguments),
            Err(e) => PendingCall::settled(Err(e)),
        }
    }

    /// Run statements in a handle's namespace
    pub fn exec_sync(
        &self,
        handle: impl Into<Handle>,
        code: &str,
    ) -> Result<HostValue, BridgeError> {
        let handle = handle.into();
        let dispatcher = &self.dispatcher;
        run_blocking(self.lock, |py| dispatcher.exec(py, handle, code))
    }

    pub fn exec(&self, handle: impl Into<Handle>, code: &str) -> PendingCall<HostValue> {
        let handle = handle.into();
        let dispatcher = Arc::clone(&self.dispatcher);
        let code = code.to_string();
        self.workers
            .spawn(self.lock, move |py| dispatcher.exec(py, handle, &code))
    }

    /// Evaluate an expression in a handle's namespace
    pub fn eval_sync(
        &self,
        handle: impl Into<Handle>,
        code: &str,
    ) -> Result<HostValue, BridgeError> {
        let handle = handle.into();
        let dispatcher = &self.dispatcher;
        run_blocking(self.lock, |py| dispatcher.eval(py, handle, code))
    }

    pub fn eval(&self, handle: impl Into<Handle>, code: &str) -> PendingCall<HostValue> {
        let handle = handle.into();
        let dispatcher = Arc::clone(&self.dispatcher);
        let code = code.to_string();
        self.workers
            .spawn(self.lock, move |py| dispatcher.eval(py, handle, &code))
    }

    /// Reload every module loaded from `path`, or from anywhere under it when it
    /// is a directory. Issued handles stay valid. Returns the number reloaded.
    pub fn reimport(&self, path: &str) -> Result<usize, BridgeError> {
        if path.is_empty() {
            return Err(BridgeError::Argument(
                "Reimport needs a file or directory path".to_string(),
            ));
        }
        let dispatcher = &self.dispatcher;
        run_blocking(self.lock, |py| dispatcher.reimport(py, path))
    }

    /// Append a directory to the module search path for all later imports
    pub fn add_import_path(&self, path: impl AsRef<Path>) -> Result<(), BridgeError> {
        let path = path.as_ref().to_string_lossy().into_owned();
        let added = run_blocking(self.lock, |py| {
            handles::append_sys_path(py, &path).map_err(BridgeError::from)
        })?;

        let mut paths = self.import_paths.lock();
        if !paths.contains(&path) {
            paths.push(path.clone());
        }
        if added {
            info!("Added import path {}", path);
        }
        Ok(())
    }

    /// Import paths added through this bridge, in order
    pub fn import_paths(&self) -> Vec<String> {
        self.import_paths.lock().clone()
    }

    /// Point subprocess-spawning features (`multiprocessing`) at `path`
    pub fn pin_executable(&self, path: impl AsRef<Path>) -> Result<(), BridgeError> {
        let path = path.as_ref();
        let code = pin_executable_snippet(&path.to_string_lossy());
        let code = CString::new(code)
            .map_err(|_| BridgeError::Argument("Executable path contains a NUL byte".to_string()))?;
        let traceback = self.config.traceback;

        run_blocking(self.lock, |py| {
            let globals = PyDict::new(py);
            py.run(&code, Some(&globals), None)
                .map_err(|e| errors::translate(py, e, traceback))
        })?;

        *self.executable.lock() = Some(path.to_path_buf());
        info!("Pinned interpreter executable to {}", path.display());
        Ok(())
    }

    pub fn executable(&self) -> Option<PathBuf> {
        self.executable.lock().clone()
    }

    /// Choose how host functions answer callbacks, for every call from now on
    pub fn set_callback_mode(&self, mode: CallbackMode) {
        callback::set_mode(mode);
        debug!("Callback mode set to {}", mode);
    }

    pub fn callback_mode(&self) -> CallbackMode {
        callback::mode()
    }

    /// Forget a handle. Returns false if it was not live.
    pub fn release(&self, handle: impl Into<Handle>) -> Result<bool, BridgeError> {
        let handle = handle.into();
        let dispatcher = &self.dispatcher;
        run_blocking(self.lock, |_py| Ok(dispatcher.release(handle)))
    }

    /// Number of handles currently live
    pub fn live_handles(&self) -> usize {
        self.dispatcher.handles().len()
    }

    pub fn config(&self) -> &BridgeConfig {
        &self.config
    }
}

/// Run `f` against the live handle registry, or an empty one before startup
pub(crate) fn with_handles<R>(f: impl FnOnce(&HandleRegistry) -> R) -> R {
    match Interpreter::instance() {
        Some(interpreter) => f(&interpreter.dispatcher.handles()),
        None => f(&HandleRegistry::new()),
    }
}

/// Python source that pins the `multiprocessing` executable to `path`
fn pin_executable_snippet(path: &str) -> String {
    let escaped = path
        .replace('\\', "\\\\")
        .replace('"', "\\\"")
        .replace('\n', "\\n")
        .replace('\r', "\\r");
    format!(
        "import multiprocessing\nmultiprocessing.set_executable(\"{}\")\n",
        escaped
    )
}
