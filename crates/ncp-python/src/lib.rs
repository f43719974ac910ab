//! Bridge from a host runtime to one embedded Python interpreter
//!
//! The bridge provides:
//! 1. Module import, instance construction, calls and snippet execution on
//!    opaque handles, each in a blocking and a non-blocking form
//! 2. Value marshaling, including typed buffers shared without copying and host
//!    functions the interpreter can call back
//! 3. Reimport of changed modules while issued handles stay valid
//!
//! All interpreter access is serialized behind one process-wide lock.
//! Non-blocking calls run on a bounded worker pool and settle a [`PendingCall`].

mod arguments;
mod buffer;
mod callback;
mod codec;
mod coordinator;
mod dispatcher;
pub mod errors;
mod handles;
mod interpreter;
mod value;

pub use arguments::{CallArguments, WireCall, KWARGS_MARKER};
pub use buffer::{ElementType, HostBuffer};
pub use codec::MAX_DEPTH;
pub use coordinator::{InterpreterLock, LockGuard, PendingCall, Suspension};
pub use errors::{BridgeError, ErrorKind};
pub use handles::{Handle, ModuleHandle, ObjectHandle};
pub use interpreter::Interpreter;
pub use ncp_config::{BridgeConfig, CallbackMode};
pub use value::{
    deferred, CallbackResult, Deferred, HostFunction, HostFunctionRef, HostReply, HostValue,
    Resolver,
};
