//! Member resolution and invocation on handles.
//!
//! Every operation here runs with the interpreter lock held and the thread
//! attached. The registry mutex is only held while handles are resolved and
//! arguments converted, never while interpreter code runs, so host callbacks
//! raised by that code can use the registry freely.

use crate::arguments::CallArguments;
use crate::codec;
use crate::errors::{self, BridgeError};
use crate::handles::{self, Handle, HandleRegistry, ModuleHandle, ObjectHandle};
use crate::value::HostValue;
use parking_lot::{Mutex, MutexGuard};
use pyo3::exceptions::PyAttributeError;
use pyo3::prelude::*;
use pyo3::types::PyDict;
use std::ffi::CString;
use tracing::{debug, info};

pub(crate) struct Dispatcher {
    handles: Mutex<HandleRegistry>,
    traceback: bool,
}

impl Dispatcher {
    pub fn new(traceback: bool) -> Self {
        Self {
            handles: Mutex::new(HandleRegistry::new()),
            traceback,
        }
    }

    pub fn handles(&self) -> MutexGuard<'_, HandleRegistry> {
        self.handles.lock()
    }

    /// Import `path`, reusing the live handle for the same path string when `dedup` is set
    pub fn import(
        &self,
        py: Python<'_>,
        path: &str,
        dedup: bool,
    ) -> Result<ModuleHandle, BridgeError> {
        if dedup {
            if let Some(handle) = self.handles().find_module(path) {
                debug!("Reusing {} for {}", handle, path);
                return Ok(handle);
            }
        }

        let module = handles::load_module(py, path)?;
        let handle = self
            .handles()
            .register_module(path, module.into_any().unbind());
        info!("Imported {} as {}", path, handle);
        Ok(handle)
    }

    /// Construct `class_name` from a module; a handle exists only if construction succeeds
    pub fn create(
        &self,
        py: Python<'_>,
        module: ModuleHandle,
        class_name: &str,
        arguments: &CallArguments,
    ) -> Result<ObjectHandle, BridgeError> {
        let handle = Handle::Module(module);
        let (namespace, args, kwargs) = {
            let registry = self.handles();
            let resolved = registry.resolve(py, handle)?;
            let (args, kwargs) = codec::encode_arguments(py, arguments, &registry)?;
            (resolved.namespace, args, kwargs)
        };

        let namespace = namespace.into_bound(py);
        let class = self.lookup(py, &namespace, handle, class_name)?;
        let instance = class
            .call(args, kwargs.as_ref())
            .map_err(|e| errors::translate(py, e, self.traceback))?;

        let object = self
            .handles()
            .register_object(namespace.unbind(), instance.unbind());
        debug!("Constructed {} from {}.{}", object, handle, class_name);
        Ok(object)
    }

    /// Call `member` on a module or object
    pub fn call(
        &self,
        py: Python<'_>,
        handle: Handle,
        member: &str,
        arguments: &CallArguments,
    ) -> Result<HostValue, BridgeError> {
        let (target, args, kwargs) = {
            let registry = self.handles();
            let resolved = registry.resolve(py, handle)?;
            let (args, kwargs) = codec::encode_arguments(py, arguments, &registry)?;
            (resolved.object, args, kwargs)
        };

        let target = target.into_bound(py);
        let callee = self.lookup(py, &target, handle, member)?;
        debug!("Calling {} on {}", member, handle);

        let result = callee
            .call(args, kwargs.as_ref())
            .map_err(|e| errors::translate(py, e, self.traceback))?;
        codec::to_host(&result)
    }

    /// Run statements in the handle's namespace; always yields `Undefined`
    pub fn exec(
        &self,
        py: Python<'_>,
        handle: Handle,
        code: &str,
    ) -> Result<HostValue, BridgeError> {
        self.run_snippet(py, handle, code, false)
    }

    /// Evaluate an expression in the handle's namespace
    pub fn eval(
        &self,
        py: Python<'_>,
        handle: Handle,
        code: &str,
    ) -> Result<HostValue, BridgeError> {
        self.run_snippet(py, handle, code, true)
    }

    fn run_snippet(
        &self,
        py: Python<'_>,
        handle: Handle,
        code: &str,
        evaluate: bool,
    ) -> Result<HostValue, BridgeError> {
        let resolved = self.handles().resolve(py, handle)?;
        let source = CString::new(code)
            .map_err(|_| BridgeError::Argument("Source text contains a NUL byte".to_string()))?;

        let namespace = resolved.namespace.into_bound(py);
        let globals = namespace.getattr("__dict__")?;
        let globals = globals.cast::<PyDict>().map_err(PyErr::from)?;

        // Instances are reachable as `self` on top of their module's globals
        let locals = match resolved.instance {
            Some(instance) => {
                let locals = PyDict::new(py);
                locals.set_item("self", instance)?;
                Some(locals)
            }
            None => None,
        };

        if evaluate {
            let value = py
                .eval(&source, Some(globals), locals.as_ref())
                .map_err(|e| errors::translate(py, e, self.traceback))?;
            codec::to_host(&value)
        } else {
            py.run(&source, Some(globals), locals.as_ref())
                .map_err(|e| errors::translate(py, e, self.traceback))?;
            Ok(HostValue::Undefined)
        }
    }

    /// Resolve `member` on `target`, turning a missing attribute into a lookup failure
    fn lookup<'py>(
        &self,
        py: Python<'py>,
        target: &Bound<'py, PyAny>,
        handle: Handle,
        member: &str,
    ) -> Result<Bound<'py, PyAny>, BridgeError> {
        target.getattr(member).map_err(|err| {
            if err.is_instance_of::<PyAttributeError>(py) {
                BridgeError::Lookup {
                    target: describe_target(target, handle),
                    member: member.to_string(),
                }
            } else {
                errors::translate(py, err, self.traceback)
            }
        })
    }

    /// Reload modules loaded from `target`; returns how many were reloaded
    pub fn reimport(&self, py: Python<'_>, target: &str) -> Result<usize, BridgeError> {
        let reloaded = handles::reload_matching(py, target)?;
        info!("Reimported {} module(s) under {}", reloaded.len(), target);
        for name in &reloaded {
            debug!("Reloaded {}", name);
        }
        Ok(reloaded.len())
    }

    /// Forget a handle; false if it was not live
    pub fn release(&self, handle: Handle) -> bool {
        // Dropped after the registry guard; finalizers may call back into the bridge
        let released = self.handles().release(handle);
        if released.is_some() {
            debug!("Released {}", handle);
        }
        released.is_some()
    }
}

fn describe_target(target: &Bound<'_, PyAny>, handle: Handle) -> String {
    match handle {
        Handle::Module(_) => {
            let name = target
                .getattr("__name__")
                .and_then(|name| name.extract::<String>())
                .unwrap_or_else(|_| "?".to_string());
            format!("module '{}' ({})", name, handle)
        }
        Handle::Object(_) => {
            let type_name = target
                .get_type()
                .name()
                .map(|name| name.to_string())
                .unwrap_or_else(|_| "?".to_string());
            format!("object of type '{}' ({})", type_name, handle)
        }
    }
}
