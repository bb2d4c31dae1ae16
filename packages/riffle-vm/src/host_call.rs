//! Host boundary call protocol.
//!
//! `HostCall` describes work only the driver can perform; `PendingHost`
//! remembers how to route the outcome back into the engine;
//! `HostCallOutcome` is the classified result the driver feeds to
//! `VM::receive_host_result`.

use crate::boundary::Yielded;
use crate::continuation::Continuation;
use crate::driver::VmException;
use crate::effect::Effect;
use crate::frame::CallMetadata;
use crate::handler::{HandlerProgramRef, HostHandler};
use crate::host::HostFn;
use crate::program::{CoroutineRef, ProgramFactory};
use crate::value::Value;

/// How to advance a suspended coroutine.
#[derive(Debug, Clone)]
pub enum CoroMethod {
    /// First step; no value to deliver.
    Next,
    Send { value: Value },
    Throw { exc: VmException },
}

/// A host call the engine needs executed.
#[derive(Debug, Clone)]
pub enum HostCall {
    StartProgram {
        program: ProgramFactory,
    },
    CallFunction {
        func: HostFn,
        args: Vec<Value>,
        kwargs: Vec<(String, Value)>,
    },
    CallHandler {
        handler: HostHandler,
        effect: Effect,
        continuation: Continuation,
    },
    StepCoroutine {
        coroutine: CoroutineRef,
        method: CoroMethod,
    },
    /// Only an async driver can execute this; the sync driver must reject it
    /// with a type error.
    CallAsync {
        func: HostFn,
        args: Vec<Value>,
    },
}

impl HostCall {
    pub fn kind(&self) -> &'static str {
        match self {
            HostCall::StartProgram { .. } => "StartProgram",
            HostCall::CallFunction { .. } => "CallFunction",
            HostCall::CallHandler { .. } => "CallHandler",
            HostCall::StepCoroutine { method, .. } => match method {
                CoroMethod::Next => "StepCoroutine(Next)",
                CoroMethod::Send { .. } => "StepCoroutine(Send)",
                CoroMethod::Throw { .. } => "StepCoroutine(Throw)",
            },
            HostCall::CallAsync { .. } => "CallAsync",
        }
    }
}

/// Routing record consumed by `receive_host_result`.
#[derive(Debug, Clone)]
pub enum PendingHost {
    /// Outcome is an unstarted coroutine to push as a frame.
    StartProgramFrame { metadata: Option<CallMetadata> },
    /// Outcome of a plain function call: a coroutine is pushed as a frame,
    /// anything else is delivered.
    CallFuncReturn { metadata: Option<CallMetadata> },
    /// Outcome of stepping the coroutine that was popped from the current
    /// segment; it is re-pushed on yield.
    StepCoroutine {
        coroutine: CoroutineRef,
        metadata: Option<CallMetadata>,
    },
    /// Outcome is the host handler's coroutine; pushed behind a
    /// handler-return hook.
    CallHandler {
        k_user: Continuation,
        effect: Effect,
    },
    /// Outcome resumes a suspended native handler program.
    NativeProgram { program: HandlerProgramRef },
    /// Outcome of an async escape; delivered as-is.
    AsyncEscape,
}

impl PendingHost {
    pub fn kind(&self) -> &'static str {
        match self {
            PendingHost::StartProgramFrame { .. } => "StartProgramFrame",
            PendingHost::CallFuncReturn { .. } => "CallFuncReturn",
            PendingHost::StepCoroutine { .. } => "StepCoroutine",
            PendingHost::CallHandler { .. } => "CallHandler",
            PendingHost::NativeProgram { .. } => "NativeProgram",
            PendingHost::AsyncEscape => "AsyncEscape",
        }
    }
}

/// Classified outcome of a host call.
#[derive(Debug, Clone)]
pub enum HostCallOutcome {
    /// The call returned a plain value.
    Value(Value),
    /// The coroutine yielded; the boundary classified it already.
    GenYield(Yielded),
    /// The coroutine returned.
    GenReturn(Value),
    /// The coroutine (or call) raised.
    GenError(VmException),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_host_call_kinds() {
        let call = HostCall::CallAsync {
            func: HostFn::unary("noop", Ok),
            args: vec![],
        };
        assert_eq!(call.kind(), "CallAsync");
    }

    #[test]
    fn test_pending_kinds() {
        assert_eq!(
            PendingHost::StartProgramFrame { metadata: None }.kind(),
            "StartProgramFrame"
        );
        assert_eq!(PendingHost::AsyncEscape.kind(), "AsyncEscape");
    }
}
