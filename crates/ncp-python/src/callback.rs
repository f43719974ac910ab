//! Calls from interpreter code back into host functions.
//!
//! A host function crosses into the interpreter as a [`HostCallable`]. Calling
//! it detaches from the interpreter, suspends the interpreter lock and hands a
//! [`CallbackRequest`] to whoever serves the current call: the calling thread
//! itself for blocking calls, or the [`PendingCall`](crate::PendingCall) of a
//! non-blocking one. Each request carries its own reply channel.

use crate::codec;
use crate::coordinator::interpreter_lock;
use crate::interpreter::with_handles;
use crate::value::{CallbackResult, HostFunctionRef, HostReply, HostValue};
use futures::channel::{mpsc, oneshot};
use ncp_config::CallbackMode;
use pyo3::exceptions::PyRuntimeError;
use pyo3::prelude::*;
use pyo3::types::PyTuple;
use std::cell::RefCell;
use std::marker::PhantomData;
use std::sync::atomic::{AtomicBool, Ordering};

pyo3::create_exception!(
    nodecallspython,
    HostCallbackError,
    PyRuntimeError,
    "Raised inside the interpreter when a host callback fails."
);

static PROMISE_MODE: AtomicBool = AtomicBool::new(false);

/// Select how host functions answer callbacks, process-wide
pub(crate) fn set_mode(mode: CallbackMode) {
    PROMISE_MODE.store(mode == CallbackMode::Promise, Ordering::SeqCst);
}

pub(crate) fn mode() -> CallbackMode {
    if PROMISE_MODE.load(Ordering::SeqCst) {
        CallbackMode::Promise
    } else {
        CallbackMode::Sync
    }
}

/// A host function invocation waiting to be served on the host side
pub(crate) struct CallbackRequest {
    function: HostFunctionRef,
    args: Vec<HostValue>,
    reply: oneshot::Sender<HostReply>,
}

impl CallbackRequest {
    /// Run the host function and send its reply back to the interpreter side
    pub(crate) fn service(self) {
        tracing::debug!("Servicing host callback with {} argument(s)", self.args.len());
        let reply = self.function.call(self.args);
        // The interpreter side gave up waiting; nothing to deliver to.
        let _ = self.reply.send(reply);
    }
}

/// Where callbacks raised on this thread are delivered
#[derive(Clone)]
pub(crate) enum Route {
    /// Run the host function on the current thread
    Inline,
    /// Hand the request to a pending call's host side
    Queue(mpsc::UnboundedSender<CallbackRequest>),
}

thread_local! {
    static ROUTES: RefCell<Vec<Route>> = const { RefCell::new(Vec::new()) };
}

/// Scope in which callbacks on this thread follow `route`
pub(crate) struct RouteScope {
    _thread_bound: PhantomData<*const ()>,
}

impl RouteScope {
    pub(crate) fn enter(route: Route) -> Self {
        ROUTES.with_borrow_mut(|routes| routes.push(route));
        Self {
            _thread_bound: PhantomData,
        }
    }
}

impl Drop for RouteScope {
    fn drop(&mut self) {
        ROUTES.with_borrow_mut(|routes| {
            routes.pop();
        });
    }
}

/// Callbacks made outside any bridge call run inline
fn current_route() -> Route {
    ROUTES
        .with_borrow(|routes| routes.last().cloned())
        .unwrap_or(Route::Inline)
}

/// Interpreter-side proxy for a host function
#[pyclass(frozen, module = "nodecallspython", name = "HostFunction")]
pub(crate) struct HostCallable {
    function: HostFunctionRef,
}

impl HostCallable {
    pub(crate) fn new(function: HostFunctionRef) -> Self {
        Self { function }
    }

    pub(crate) fn function(&self) -> &HostFunctionRef {
        &self.function
    }
}

#[pymethods]
impl HostCallable {
    #[pyo3(signature = (*args))]
    fn __call__<'py>(
        &self,
        py: Python<'py>,
        args: &Bound<'py, PyTuple>,
    ) -> PyResult<Bound<'py, PyAny>> {
        let args = args
            .iter()
            .map(|arg| codec::to_host(&arg))
            .collect::<Result<Vec<_>, _>>()
            .map_err(|e| HostCallbackError::new_err(e.to_string()))?;

        let function = self.function.clone();
        let route = current_route();
        let mode = mode();

        let result = py.detach(move || {
            let _suspended = interpreter_lock().suspend();
            invoke(route, mode, function, args)
        });

        let value = result.map_err(HostCallbackError::new_err)?;
        with_handles(|handles| codec::to_interpreter(py, &value, handles))
            .map_err(|e| HostCallbackError::new_err(e.to_string()))
    }

    fn __repr__(&self) -> String {
        format!("<host function {:?}>", self.function)
    }
}

fn invoke(
    route: Route,
    mode: CallbackMode,
    function: HostFunctionRef,
    args: Vec<HostValue>,
) -> CallbackResult {
    let reply = match route {
        Route::Inline => function.call(args),
        Route::Queue(sender) => {
            let (reply_tx, reply_rx) = oneshot::channel();
            let request = CallbackRequest {
                function,
                args,
                reply: reply_tx,
            };
            sender
                .unbounded_send(request)
                .map_err(|_| "The pending call serving this callback was dropped".to_string())?;
            futures::executor::block_on(reply_rx)
                .map_err(|_| "Host dropped the callback without answering".to_string())?
        }
    };
    settle(reply, mode)
}

/// Resolve a host reply according to the callback mode
fn settle(reply: HostReply, mode: CallbackMode) -> CallbackResult {
    match (reply, mode) {
        (HostReply::Ready(result), _) => result,
        (HostReply::Deferred(deferred), CallbackMode::Promise) => deferred.wait(),
        (HostReply::Deferred(_), CallbackMode::Sync) => Err(
            "Host function returned a deferred value while callbacks are in sync mode"
                .to_string(),
        ),
    }
}
