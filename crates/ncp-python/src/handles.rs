//! Opaque handles for interpreter objects held by the host.
//!
//! Handles are plain ids; the registry maps them to the Python objects they
//! stand for. Ids are never reused within a process, so a released handle can
//! never alias a newer object.

use crate::errors::{describe, BridgeError};
use once_cell::sync::Lazy;
use parking_lot::Mutex;
use pyo3::exceptions::PyImportError;
use pyo3::prelude::*;
use pyo3::types::{PyDict, PyList, PyModule};
use std::collections::{HashMap, HashSet};
use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::sync::atomic::{AtomicU64, Ordering};
use tracing::debug;

const MODULE_PREFIX: &str = "@ncp-";
const OBJECT_PREFIX: &str = "#ncp-";

/// Handle to an imported module
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ModuleHandle(u64);

/// Handle to an instance constructed from a module's class
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ObjectHandle(u64);

impl ModuleHandle {
    pub fn from_raw(id: u64) -> Self {
        Self(id)
    }

    pub fn id(self) -> u64 {
        self.0
    }
}

impl ObjectHandle {
    pub fn from_raw(id: u64) -> Self {
        Self(id)
    }

    pub fn id(self) -> u64 {
        self.0
    }
}

/// Either kind of handle; any call target
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Handle {
    Module(ModuleHandle),
    Object(ObjectHandle),
}

impl Handle {
    pub fn id(self) -> u64 {
        match self {
            Handle::Module(handle) => handle.id(),
            Handle::Object(handle) => handle.id(),
        }
    }
}

impl From<ModuleHandle> for Handle {
    fn from(handle: ModuleHandle) -> Self {
        Handle::Module(handle)
    }
}

impl From<ObjectHandle> for Handle {
    fn from(handle: ObjectHandle) -> Self {
        Handle::Object(handle)
    }
}

impl fmt::Display for ModuleHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}{}", MODULE_PREFIX, self.0)
    }
}

impl fmt::Display for ObjectHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}{}", OBJECT_PREFIX, self.0)
    }
}

impl fmt::Display for Handle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Handle::Module(handle) => handle.fmt(f),
            Handle::Object(handle) => handle.fmt(f),
        }
    }
}

/// Parse a handle token (`@ncp-<id>` or `#ncp-<id>`)
impl FromStr for Handle {
    type Err = BridgeError;

    fn from_str(token: &str) -> Result<Self, Self::Err> {
        let parse_id = |digits: &str| {
            digits
                .parse::<u64>()
                .map_err(|_| BridgeError::InvalidHandle(token.to_string()))
        };

        if let Some(digits) = token.strip_prefix(MODULE_PREFIX) {
            Ok(Handle::Module(ModuleHandle(parse_id(digits)?)))
        } else if let Some(digits) = token.strip_prefix(OBJECT_PREFIX) {
            Ok(Handle::Object(ObjectHandle(parse_id(digits)?)))
        } else {
            Err(BridgeError::InvalidHandle(token.to_string()))
        }
    }
}

enum Origin {
    /// Imported from a path string
    Module { path: String },
    /// Constructed from a class found on a module; snippets run in that module
    Object { namespace: Py<PyAny> },
}

struct Entry {
    object: Py<PyAny>,
    origin: Origin,
}

/// A handle resolved to its interpreter objects
pub(crate) struct Resolved {
    /// The object the handle stands for
    pub object: Py<PyAny>,
    /// Module whose namespace snippets run in
    pub namespace: Py<PyAny>,
    /// `self` binding for snippets run against an instance
    pub instance: Option<Py<PyAny>>,
}

/// Live handles and the objects behind them
#[derive(Default)]
pub(crate) struct HandleRegistry {
    next_id: u64,
    entries: HashMap<u64, Entry>,
    by_path: HashMap<String, ModuleHandle>,
}

impl HandleRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    fn allocate(&mut self) -> u64 {
        self.next_id += 1;
        self.next_id
    }

    /// Live handle most recently issued for `path`, if any
    pub fn find_module(&self, path: &str) -> Option<ModuleHandle> {
        self.by_path.get(path).copied()
    }

    pub fn register_module(&mut self, path: &str, module: Py<PyAny>) -> ModuleHandle {
        let handle = ModuleHandle(self.allocate());
        self.entries.insert(
            handle.0,
            Entry {
                object: module,
                origin: Origin::Module {
                    path: path.to_string(),
                },
            },
        );
        self.by_path.insert(path.to_string(), handle);
        handle
    }

    pub fn register_object(&mut self, namespace: Py<PyAny>, object: Py<PyAny>) -> ObjectHandle {
        let handle = ObjectHandle(self.allocate());
        self.entries.insert(
            handle.0,
            Entry {
                object,
                origin: Origin::Object { namespace },
            },
        );
        handle
    }

    /// Object behind a handle, checking the handle's kind
    pub fn object(&self, py: Python<'_>, handle: Handle) -> Result<Py<PyAny>, BridgeError> {
        let entry = self.entry(handle)?;
        Ok(entry.object.clone_ref(py))
    }

    pub fn resolve(&self, py: Python<'_>, handle: Handle) -> Result<Resolved, BridgeError> {
        let entry = self.entry(handle)?;
        let resolved = match &entry.origin {
            Origin::Module { .. } => Resolved {
                object: entry.object.clone_ref(py),
                namespace: entry.object.clone_ref(py),
                instance: None,
            },
            Origin::Object { namespace } => Resolved {
                object: entry.object.clone_ref(py),
                namespace: namespace.clone_ref(py),
                instance: Some(entry.object.clone_ref(py)),
            },
        };
        Ok(resolved)
    }

    fn entry(&self, handle: Handle) -> Result<&Entry, BridgeError> {
        let entry = self
            .entries
            .get(&handle.id())
            .ok_or_else(|| BridgeError::InvalidHandle(handle.to_string()))?;
        let kind_matches = matches!(
            (&entry.origin, handle),
            (Origin::Module { .. }, Handle::Module(_)) | (Origin::Object { .. }, Handle::Object(_))
        );
        if kind_matches {
            Ok(entry)
        } else {
            Err(BridgeError::InvalidHandle(handle.to_string()))
        }
    }

    /// Drop a handle. Instances constructed from a released module keep working.
    pub fn release(&mut self, handle: Handle) -> Option<Py<PyAny>> {
        self.entry(handle).ok()?;
        let entry = self.entries.remove(&handle.id())?;
        if let Origin::Module { path } = &entry.origin {
            if self.by_path.get(path) == Some(&ModuleHandle(handle.id())) {
                self.by_path.remove(path);
            }
        }
        Some(entry.object)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }
}

/// Modules loaded straight from a file under a private name, keyed by that name
static LOCATION_LOADED: Lazy<Mutex<HashSet<String>>> = Lazy::new(Default::default);
static LOCATION_IDS: AtomicU64 = AtomicU64::new(0);

/// Import the module at `path`.
///
/// The directory part is appended to `sys.path` once and the file stem, minus
/// any `.py` suffix, is imported by name. When that name already refers to a
/// different file, the file is loaded directly under a private module name.
/// A bare name imports from the existing search path.
pub(crate) fn load_module<'py>(
    py: Python<'py>,
    path: &str,
) -> Result<Bound<'py, PyModule>, BridgeError> {
    let import_error = |reason: String| BridgeError::Import {
        module: path.to_string(),
        reason,
    };

    let location = Path::new(path);
    let name = location
        .file_stem()
        .and_then(|stem| stem.to_str())
        .filter(|stem| !stem.is_empty())
        .ok_or_else(|| import_error("path has no module name".to_string()))?;

    let Some(dir) = location.parent().filter(|dir| !dir.as_os_str().is_empty()) else {
        return PyModule::import(py, name).map_err(|e| import_error(describe(py, &e)));
    };
    append_sys_path(py, &dir.to_string_lossy()).map_err(|e| import_error(describe(py, &e)))?;

    let file = if location.extension().is_some() {
        location.to_path_buf()
    } else {
        location.with_extension("py")
    };
    let origin = import_origin(py, name).map_err(|e| import_error(describe(py, &e)))?;

    match origin {
        Some(origin) if resolve_path(&origin) != resolve_path(&file) => {
            debug!(
                "Module name {} is taken by {}, loading {} directly",
                name,
                origin.display(),
                file.display()
            );
            load_from_location(py, name, &file).map_err(|e| import_error(describe(py, &e)))
        }
        _ => PyModule::import(py, name).map_err(|e| import_error(describe(py, &e))),
    }
}

/// Source file a plain import of `name` would bind: the cached module's, or
/// the one found on the search path. Empty when the module has no file.
fn import_origin(py: Python<'_>, name: &str) -> PyResult<Option<PathBuf>> {
    let modules = PyModule::import(py, "sys")?.getattr("modules")?;
    let modules = modules.cast::<PyDict>()?;
    if let Some(module) = modules.get_item(name)? {
        let file = module
            .getattr("__file__")
            .and_then(|file| file.extract::<PathBuf>())
            .unwrap_or_default();
        return Ok(Some(file));
    }

    let util = PyModule::import(py, "importlib.util")?;
    let spec = util.call_method1("find_spec", (name,))?;
    if spec.is_none() {
        return Ok(None);
    }
    let origin = spec.getattr("origin")?;
    if origin.is_none() {
        return Ok(Some(PathBuf::new()));
    }
    Ok(Some(origin.extract::<PathBuf>().unwrap_or_default()))
}

/// Execute `file` as a fresh module registered under a private name
fn load_from_location<'py>(
    py: Python<'py>,
    name: &str,
    file: &Path,
) -> PyResult<Bound<'py, PyModule>> {
    let unique = format!("{}__ncp{}", name, LOCATION_IDS.fetch_add(1, Ordering::Relaxed));
    let util = PyModule::import(py, "importlib.util")?;
    let spec = util.call_method1(
        "spec_from_file_location",
        (&unique, file.to_string_lossy().into_owned()),
    )?;
    if spec.is_none() {
        return Err(PyImportError::new_err(format!(
            "No loader for {}",
            file.display()
        )));
    }

    let module = util.call_method1("module_from_spec", (&spec,))?;
    let modules = PyModule::import(py, "sys")?.getattr("modules")?;
    modules.set_item(&unique, &module)?;
    if let Err(err) = spec
        .getattr("loader")?
        .call_method1("exec_module", (&module,))
    {
        modules.del_item(&unique)?;
        return Err(err);
    }

    LOCATION_LOADED.lock().insert(unique);
    Ok(module.cast_into::<PyModule>()?)
}

/// Append `dir` to `sys.path` unless already present
pub(crate) fn append_sys_path(py: Python<'_>, dir: &str) -> PyResult<bool> {
    let sys = PyModule::import(py, "sys")?;
    let sys_path = sys.getattr("path")?;
    let sys_path = sys_path.cast::<PyList>()?;

    if sys_path.contains(dir)? {
        return Ok(false);
    }
    sys_path.append(dir)?;
    Ok(true)
}

/// Absolute form of `path` with symlinks resolved as far as it exists
fn resolve_path(path: &Path) -> PathBuf {
    if let Ok(resolved) = fs::canonicalize(path) {
        return resolved;
    }
    let absolute = std::path::absolute(path).unwrap_or_else(|_| path.to_path_buf());
    match (absolute.parent(), absolute.file_name()) {
        (Some(parent), Some(name)) => fs::canonicalize(parent)
            .map(|parent| parent.join(name))
            .unwrap_or(absolute),
        _ => absolute,
    }
}

/// Whether a module loaded from `file` belongs to the reimport `target`:
/// the file itself, a file under the directory, or the file minus its suffix
fn is_reimport_match(file: &Path, target: &Path) -> bool {
    file.starts_with(target) || file.with_extension("") == target
}

/// Reload every loaded module whose source file is `target` or lies under it.
///
/// Relative targets resolve against the working directory. Modules are
/// reloaded in place, so handles and references to the module objects observe
/// the fresh state. Returns the names of the reloaded modules.
pub(crate) fn reload_matching(py: Python<'_>, target: &str) -> Result<Vec<String>, BridgeError> {
    let target_path = resolve_path(Path::new(target));
    let sys = PyModule::import(py, "sys")?;
    let importlib = PyModule::import(py, "importlib")?;

    // Snapshot first; reloading may add entries to sys.modules.
    let modules = sys.getattr("modules")?;
    let snapshot = modules.cast::<PyDict>().map_err(PyErr::from)?.copy()?;

    let mut reloaded = Vec::new();
    for (name, module) in snapshot.iter() {
        let Ok(file) = module.getattr("__file__") else {
            continue;
        };
        let Ok(file) = file.extract::<PathBuf>() else {
            continue;
        };
        if !is_reimport_match(&resolve_path(&file), &target_path) {
            continue;
        }

        let name = name.to_string();
        let by_location = LOCATION_LOADED.lock().contains(&name);
        let result = if by_location {
            // Not findable by name; run the module's own loader again
            module
                .getattr("__spec__")
                .and_then(|spec| spec.getattr("loader"))
                .and_then(|loader| loader.call_method1("exec_module", (&module,)))
        } else {
            importlib.call_method1("reload", (&module,))
        };
        result.map_err(|e| BridgeError::Import {
            module: name.clone(),
            reason: describe(py, &e),
        })?;
        reloaded.push(name);
    }

    Ok(reloaded)
}
