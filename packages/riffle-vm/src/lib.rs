//! riffle-vm: a segment-based VM for algebraic effects.
//!
//! # Architecture
//!
//! - **Mode-based step machine**: Deliver, Throw, HandleYield, Return
//! - **Segment-based continuations**: Arc snapshots with one-shot semantics
//! - **Evidence-based dispatch**: scope chains of prompt markers, top-only
//!   busy exclusion, lazy completion cleanup
//! - **Host boundary protocol**: the engine suspends with `NeedsHost` and
//!   consumes classified outcomes; it never steps user coroutines itself

pub mod arena;
pub mod boundary;
pub mod continuation;
pub mod do_ctrl;
pub mod driver;
pub mod effect;
pub mod error;
pub mod frame;
pub mod handler;
pub mod host;
pub mod host_call;
pub mod ids;
pub mod kleisli;
pub mod program;
pub mod run;
pub mod scheduler;
pub mod segment;
pub mod store;
pub mod value;
mod vm;
mod vm_ctrl;
mod vm_dispatch;

#[cfg(test)]
mod vm_tests;

// Re-exports for convenience
pub use arena::SegmentArena;
pub use boundary::{classify, Yielded};
pub use continuation::Continuation;
pub use do_ctrl::{CallArg, DoCtrl, DoExpr};
pub use driver::{Mode, StepEvent, VmException};
pub use effect::Effect;
pub use error::VMError;
pub use frame::{CallMetadata, Frame};
pub use handler::{
    reader_handler, state_handler, writer_handler, Handler, HandlerEntry, HandlerProgram,
    HandlerProgramFactory, HandlerStep, HostHandler, ReaderHandlerFactory, StateHandlerFactory,
    WriterHandlerFactory,
};
pub use host::{HostFn, HostFnResult, HostValue};
pub use host_call::{CoroMethod, HostCall, HostCallOutcome, PendingHost};
pub use ids::{CallbackId, ContinuationId, DispatchId, Marker, PromiseId, SegmentId, TaskId};
pub use kleisli::{program_kernel, KleisliProgram, ParamKind, ParamSpec, ProgramArg};
pub use program::{
    coroutine_ref, CoroStep, Coroutine, CoroutineRef, GenCoroutine, GenStep, Next, ProgramFactory,
};
pub use run::{execute_host_call, run, RunResult, Runtime};
pub use scheduler::{
    complete_promise, create_external_promise, create_promise, fail_promise, gather, race, spawn,
    ExternalPromise, PromiseHandle, SchedulerEffect, SchedulerHandler, StoreMergePolicy, StoreMode,
    TaskHandle, TaskResult, Waitable,
};
pub use segment::{Segment, SegmentKind};
pub use store::Store;
pub use value::Value;
pub use vm::{Callback, DebugConfig, DebugLevel, VM};
pub use vm_dispatch::DispatchContext;
