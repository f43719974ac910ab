use crate::callback::HostCallbackError;
use pyo3::exceptions::PyTypeError;
use pyo3::prelude::*;
use thiserror::Error;

/// Errors surfaced by the bridge
///
/// Blocking calls return these directly; non-blocking calls settle their
/// `PendingCall` with the same value, so both calling styles carry identical text.
#[derive(Error, Debug)]
pub enum BridgeError {
    #[error("Cannot load module '{module}': {reason}")]
    Import { module: String, reason: String },

    #[error("Attribute '{member}' not found on {target}")]
    Lookup { target: String, member: String },

    #[error("{0}")]
    Argument(String),

    #[error("Invalid parameter: unknown type ({0})")]
    UnknownType(String),

    #[error("Wrong type of arguments")]
    WrongArguments,

    #[error("{message}")]
    Runtime {
        message: String,
        traceback: Option<String>,
    },

    #[error("Invalid handle: {0}")]
    InvalidHandle(String),

    #[error("Host callback failed: {0}")]
    Callback(String),

    #[error("Failed to initialize Python interpreter: {0}")]
    Initialization(String),

    #[error(transparent)]
    Config(#[from] ncp_config::ConfigError),
}

/// Failure classes of the bridge's error taxonomy
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    ImportFailure,
    LookupFailure,
    ArgumentFailure,
    RuntimeFailure,
    InvalidHandleFailure,
    LifecycleFailure,
}

impl BridgeError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            BridgeError::Import { .. } => ErrorKind::ImportFailure,
            BridgeError::Lookup { .. } => ErrorKind::LookupFailure,
            BridgeError::Argument(_) | BridgeError::UnknownType(_) | BridgeError::WrongArguments => {
                ErrorKind::ArgumentFailure
            }
            BridgeError::Runtime { .. } | BridgeError::Callback(_) => ErrorKind::RuntimeFailure,
            BridgeError::InvalidHandle(_) => ErrorKind::InvalidHandleFailure,
            BridgeError::Initialization(_) | BridgeError::Config(_) => ErrorKind::LifecycleFailure,
        }
    }

    /// Python traceback captured with a runtime failure, when enabled in config
    pub fn traceback(&self) -> Option<&str> {
        match self {
            BridgeError::Runtime { traceback, .. } => traceback.as_deref(),
            _ => None,
        }
    }

    /// Message followed by the traceback, if one was captured
    pub fn full_message(&self) -> String {
        match self.traceback() {
            Some(tb) => format!("{}\n{}", self, tb.trim_end()),
            None => self.to_string(),
        }
    }
}

/// Generic conversion from PyErr to BridgeError.
///
/// NOTE: This conversion drops the traceback and never classifies arity
/// errors. Call paths that face the host go through `translate` instead.
impl From<PyErr> for BridgeError {
    fn from(err: PyErr) -> Self {
        BridgeError::Runtime {
            message: format!("{}", err),
            traceback: None,
        }
    }
}

/// Render an exception as `TypeName: message`
pub(crate) fn describe(py: Python<'_>, err: &PyErr) -> String {
    let type_name = err
        .get_type(py)
        .name()
        .map(|name| name.to_string())
        .unwrap_or_else(|_| "Exception".to_string());
    let text = err
        .value(py)
        .str()
        .map(|s| s.to_string())
        .unwrap_or_default();

    if text.is_empty() {
        type_name
    } else {
        format!("{}: {}", type_name, text)
    }
}

/// Classify an exception raised while running host-requested code
pub(crate) fn translate(py: Python<'_>, err: PyErr, include_traceback: bool) -> BridgeError {
    if err.is_instance_of::<HostCallbackError>(py) {
        let text = err
            .value(py)
            .str()
            .map(|s| s.to_string())
            .unwrap_or_default();
        return BridgeError::Callback(text);
    }

    let message = describe(py, &err);

    if err.is_instance_of::<PyTypeError>(py) && is_arity_message(&message) {
        return BridgeError::Argument(message);
    }

    let traceback = if include_traceback {
        err.traceback(py).and_then(|tb| tb.format().ok())
    } else {
        None
    };

    BridgeError::Runtime { message, traceback }
}

/// Interpreter wording for a call that is missing required parameters
fn is_arity_message(message: &str) -> bool {
    message.contains("missing")
        && (message.contains("required positional argument")
            || message.contains("required keyword-only argument"))
}
