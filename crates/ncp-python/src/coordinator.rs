//! Serialized access to the interpreter.
//!
//! Every entry into the interpreter holds the process-wide [`InterpreterLock`].
//! Lock order is fixed: take the lock while detached, then attach to the
//! interpreter. Nothing waits on the lock while attached, which is what keeps
//! the lock and the interpreter's own thread state from deadlocking each other.

use crate::callback::{CallbackRequest, Route, RouteScope};
use crate::errors::BridgeError;
use futures::channel::{mpsc, oneshot};
use futures::{FutureExt, StreamExt};
use parking_lot::{Condvar, Mutex};
use pyo3::prelude::*;
use std::future::Future;
use std::pin::Pin;
use std::task::{Context, Poll};
use std::thread::{self, ThreadId};

static LOCK: InterpreterLock = InterpreterLock::new();

/// The lock guarding the embedded interpreter
pub(crate) fn interpreter_lock() -> &'static InterpreterLock {
    &LOCK
}

struct LockState {
    owner: Option<ThreadId>,
    depth: usize,
}

/// Reentrant lock that its owner can fully suspend while waiting on host code
pub struct InterpreterLock {
    state: Mutex<LockState>,
    released: Condvar,
}

impl InterpreterLock {
    pub const fn new() -> Self {
        Self {
            state: Mutex::new(LockState {
                owner: None,
                depth: 0,
            }),
            released: Condvar::new(),
        }
    }

    /// Block until the current thread owns the lock
    pub fn acquire(&self) -> LockGuard<'_> {
        let me = thread::current().id();
        let mut state = self.state.lock();
        if state.owner == Some(me) {
            state.depth += 1;
        } else {
            while state.owner.is_some() {
                self.released.wait(&mut state);
            }
            state.owner = Some(me);
            state.depth = 1;
        }
        LockGuard { lock: self }
    }

    /// Release every level the current thread holds until the returned value drops.
    ///
    /// A thread that does not own the lock gets a no-op suspension.
    pub fn suspend(&self) -> Suspension<'_> {
        let me = thread::current().id();
        let mut state = self.state.lock();
        if state.owner != Some(me) {
            return Suspension {
                lock: self,
                depth: 0,
            };
        }

        let depth = state.depth;
        state.owner = None;
        state.depth = 0;
        self.released.notify_one();
        Suspension { lock: self, depth }
    }

    pub fn is_held_by_current_thread(&self) -> bool {
        self.state.lock().owner == Some(thread::current().id())
    }

    fn release(&self) {
        let mut state = self.state.lock();
        state.depth = state.depth.saturating_sub(1);
        if state.depth == 0 {
            state.owner = None;
            self.released.notify_one();
        }
    }

    fn restore(&self, depth: usize) {
        let me = thread::current().id();
        let mut state = self.state.lock();
        while state.owner.is_some() {
            self.released.wait(&mut state);
        }
        state.owner = Some(me);
        state.depth = depth;
    }
}

impl Default for InterpreterLock {
    fn default() -> Self {
        Self::new()
    }
}

/// One level of ownership of an [`InterpreterLock`]
#[must_use = "the lock is released when the guard drops"]
pub struct LockGuard<'a> {
    lock: &'a InterpreterLock,
}

impl Drop for LockGuard<'_> {
    fn drop(&mut self) {
        self.lock.release();
    }
}

/// A suspended ownership of an [`InterpreterLock`]; restores it on drop
#[must_use = "the lock is reacquired when the suspension drops"]
pub struct Suspension<'a> {
    lock: &'a InterpreterLock,
    depth: usize,
}

impl Drop for Suspension<'_> {
    fn drop(&mut self) {
        if self.depth > 0 {
            self.lock.restore(self.depth);
        }
    }
}

/// Run `job` on the current thread under the lock.
///
/// Callbacks raised by the job are serviced inline on this thread.
pub(crate) fn run_blocking<T>(
    lock: &InterpreterLock,
    job: impl for<'py> FnOnce(Python<'py>) -> Result<T, BridgeError>,
) -> Result<T, BridgeError> {
    let _route = RouteScope::enter(Route::Inline);
    let _guard = lock.acquire();
    Python::attach(job)
}

/// Bounded pool running non-blocking calls
pub(crate) struct WorkerPool {
    pool: rayon::ThreadPool,
}

impl WorkerPool {
    pub fn new(threads: usize) -> Result<Self, BridgeError> {
        let pool = rayon::ThreadPoolBuilder::new()
            .num_threads(threads)
            .thread_name(|index| format!("ncp-worker-{}", index))
            .build()
            .map_err(|e| {
                BridgeError::Initialization(format!("Failed to start worker pool: {}", e))
            })?;
        Ok(Self { pool })
    }

    pub fn threads(&self) -> usize {
        self.pool.current_num_threads()
    }

    /// Queue `job` on a worker; the worker takes the lock before attaching.
    ///
    /// Callbacks raised by the job travel back to the returned [`PendingCall`].
    pub fn spawn<T, F>(&self, lock: &'static InterpreterLock, job: F) -> PendingCall<T>
    where
        T: Send + 'static,
        F: for<'py> FnOnce(Python<'py>) -> Result<T, BridgeError> + Send + 'static,
    {
        let (result_tx, result_rx) = oneshot::channel();
        let (callback_tx, callback_rx) = mpsc::unbounded();

        self.pool.spawn(move || {
            let result = {
                let _route = RouteScope::enter(Route::Queue(callback_tx));
                let _guard = lock.acquire();
                Python::attach(job)
            };
            // The caller may have dropped its PendingCall; the call still ran.
            let _ = result_tx.send(result);
        });

        PendingCall {
            result: result_rx,
            callbacks: Some(callback_rx),
        }
    }
}

/// Result of a non-blocking call.
///
/// Awaiting or [`wait`](PendingCall::wait)ing it also services host callbacks
/// the call raises, on the awaiting thread. Dropping it does not cancel the
/// call; callbacks raised afterwards fail inside the interpreter.
#[must_use = "a pending call does nothing for the caller unless awaited"]
pub struct PendingCall<T> {
    result: oneshot::Receiver<Result<T, BridgeError>>,
    callbacks: Option<mpsc::UnboundedReceiver<CallbackRequest>>,
}

impl<T> PendingCall<T> {
    /// A call that already settled without reaching a worker
    pub(crate) fn settled(result: Result<T, BridgeError>) -> Self {
        let (result_tx, result_rx) = oneshot::channel();
        // The receiver is alive right here, so the send cannot fail.
        let _ = result_tx.send(result);
        Self {
            result: result_rx,
            callbacks: None,
        }
    }

    /// Block the current thread until the call settles
    pub fn wait(self) -> Result<T, BridgeError> {
        futures::executor::block_on(self)
    }

    fn service_callbacks(&mut self, cx: &mut Context<'_>) {
        let Some(callbacks) = self.callbacks.as_mut() else {
            return;
        };
        loop {
            match callbacks.poll_next_unpin(cx) {
                Poll::Ready(Some(request)) => request.service(),
                Poll::Ready(None) => {
                    self.callbacks = None;
                    return;
                }
                Poll::Pending => return,
            }
        }
    }
}

impl<T> Future for PendingCall<T> {
    type Output = Result<T, BridgeError>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let this = self.get_mut();
        this.service_callbacks(cx);

        match this.result.poll_unpin(cx) {
            Poll::Ready(Ok(result)) => Poll::Ready(result),
            Poll::Ready(Err(_)) => Poll::Ready(Err(BridgeError::Runtime {
                message: "Call was abandoned before it completed".to_string(),
                traceback: None,
            })),
            Poll::Pending => Poll::Pending,
        }
    }
}
