//! Remote debugger client for compiled Petri nets.
//!
//! The editor attaches to a running net over TCP, starts, pauses and stops
//! it, pushes breakpoints, receives the set of active states, and evaluates
//! expressions by compiling a small evaluator that the peer loads and runs.
//!
//! ```ignore
//! let queue = Arc::new(CallbackQueue::new());
//! let client = DebugClient::new(ClientConfig::from_settings(&settings), Collaborators {
//!     document, codegen, compiler,
//!     scheduler: queue.clone(),
//!     hooks: Arc::new(MyHooks),
//! });
//! client.attach()?;
//! loop {
//!     queue.wait_and_run(Duration::from_millis(50));
//!     // ...
//! }
//! ```

pub mod bridge;
pub mod codegen;
pub mod compiler;
pub mod document;
pub mod error;
pub mod evaluate;
mod receiver;
pub mod registry;
pub mod session;
pub mod state;

pub use bridge::{Callback, CallbackQueue, CallbackScheduler, DebuggerHooks, NoHooks};
pub use codegen::{generator_for, CEvaluatorGenerator, CodeGenerator, LuaEvaluatorGenerator};
pub use compiler::{compiler_for, CommandCompiler, CompilerInvoker, LuaCompiler};
pub use document::{sha1_hex, NetDocument, SourceDocument};
pub use error::{DebugError, EvaluateError};
pub use evaluate::{Expression, LastEvaluations};
pub use receiver::{RECEIVE_RETRIES, RETRY_SPACING};
pub use registry::{ActiveStateMap, BreakpointSet};
pub use session::{ClientConfig, Collaborators, DebugClient, ATTACH_WAIT};
pub use state::{PetriState, SessionState, SessionStatus};
