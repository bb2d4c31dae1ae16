//! Control primitives and the deferred-expression union.

use crate::continuation::Continuation;
use crate::driver::VmException;
use crate::effect::Effect;
use crate::frame::CallMetadata;
use crate::handler::Handler;
use crate::host::{HostFn, HostValue};
use crate::program::ProgramFactory;
use crate::value::Value;

/// Anything the engine can evaluate.
#[derive(Debug, Clone)]
pub enum DoExpr {
    /// A control-primitive node.
    Ctrl(DoCtrl),
    /// An effect to dispatch.
    Effect(Effect),
    /// An unstarted bare program (legacy kleisli call without metadata).
    Program(ProgramFactory),
    /// A host object the engine cannot interpret. Classification turns this
    /// into a type error.
    Opaque(HostValue),
}

impl DoExpr {
    pub fn pure(value: impl Into<Value>) -> Self {
        DoExpr::Ctrl(DoCtrl::Pure {
            value: value.into(),
        })
    }

    pub fn effect(effect: Effect) -> Self {
        DoExpr::Effect(effect)
    }

    pub fn with_handler(handler: Handler, expr: DoExpr) -> Self {
        DoExpr::Ctrl(DoCtrl::WithHandler {
            handler,
            expr: Box::new(expr),
        })
    }
}

impl From<DoCtrl> for DoExpr {
    fn from(ctrl: DoCtrl) -> Self {
        DoExpr::Ctrl(ctrl)
    }
}

impl From<Effect> for DoExpr {
    fn from(effect: Effect) -> Self {
        DoExpr::Effect(effect)
    }
}

impl From<ProgramFactory> for DoExpr {
    fn from(factory: ProgramFactory) -> Self {
        DoExpr::Program(factory)
    }
}

/// One argument of a `Call` node: either already a value or a deferred
/// sub-expression the engine evaluates before invoking the callee.
#[derive(Debug, Clone)]
pub enum CallArg {
    Value(Value),
    Expr(Box<DoExpr>),
}

impl CallArg {
    pub fn value(v: impl Into<Value>) -> Self {
        CallArg::Value(v.into())
    }

    pub fn expr(e: impl Into<DoExpr>) -> Self {
        CallArg::Expr(Box::new(e.into()))
    }

    pub fn is_resolved(&self) -> bool {
        matches!(self, CallArg::Value(_))
    }
}

#[derive(Debug, Clone)]
pub enum DoCtrl {
    /// Deliver a constant.
    Pure { value: Value },
    /// Evaluate `source`, then apply `mapper` to the result.
    Map { source: Box<DoExpr>, mapper: HostFn },
    /// Evaluate `source`, then evaluate the expression `binder` returns.
    FlatMap { source: Box<DoExpr>, binder: HostFn },
    /// Dispatch an effect explicitly.
    Perform { effect: Effect },
    /// Call-resume: on completion control returns to the yielding handler.
    Resume {
        continuation: Continuation,
        value: Value,
    },
    /// Call-resume delivering an exception at the suspension point.
    ResumeThrow {
        continuation: Continuation,
        exception: VmException,
    },
    /// Tail-resume: the yielding handler is abandoned.
    Transfer {
        continuation: Continuation,
        value: Value,
    },
    /// Tail-resume delivering an exception.
    TransferThrow {
        continuation: Continuation,
        exception: VmException,
    },
    /// Install `handler` around `expr`.
    WithHandler {
        handler: Handler,
        expr: Box<DoExpr>,
    },
    /// Advance the current dispatch to the next outer handler, optionally
    /// substituting the effect. The delegating handler must not resume.
    Delegate { effect: Option<Effect> },
    /// Invoke `f` after resolving every argument left-to-right.
    Call {
        f: CallArg,
        args: Vec<CallArg>,
        kwargs: Vec<(String, CallArg)>,
        metadata: CallMetadata,
    },
    /// Atomic CreateContinuation + ResumeContinuation: evaluate `expr` in a
    /// fresh scope under `handlers`; the caller suspends until it finishes.
    Eval {
        expr: Box<DoExpr>,
        handlers: Vec<Handler>,
    },
    /// Produce an unstarted continuation; no execution yet.
    CreateContinuation {
        expr: Box<DoExpr>,
        handlers: Vec<Handler>,
    },
    /// Resume a continuation; for unstarted ones installs the handlers and
    /// starts the program (the value is ignored).
    ResumeContinuation {
        continuation: Continuation,
        value: Value,
    },
    /// Call-site continuation of the current dispatch.
    GetContinuation,
    /// Full handler chain of the current dispatch, as host identities.
    GetHandlers,
    /// Call metadata collected by walking caller links; no host access.
    GetCallStack,
    /// Escape hatch for async drivers; the sync driver rejects it.
    AsyncEscape { action: HostFn },
}

impl DoCtrl {
    /// Short tag for diagnostics and traces.
    pub fn kind(&self) -> &'static str {
        match self {
            DoCtrl::Pure { .. } => "Pure",
            DoCtrl::Map { .. } => "Map",
            DoCtrl::FlatMap { .. } => "FlatMap",
            DoCtrl::Perform { .. } => "Perform",
            DoCtrl::Resume { .. } => "Resume",
            DoCtrl::ResumeThrow { .. } => "ResumeThrow",
            DoCtrl::Transfer { .. } => "Transfer",
            DoCtrl::TransferThrow { .. } => "TransferThrow",
            DoCtrl::WithHandler { .. } => "WithHandler",
            DoCtrl::Delegate { .. } => "Delegate",
            DoCtrl::Call { .. } => "Call",
            DoCtrl::Eval { .. } => "Eval",
            DoCtrl::CreateContinuation { .. } => "CreateContinuation",
            DoCtrl::ResumeContinuation { .. } => "ResumeContinuation",
            DoCtrl::GetContinuation => "GetContinuation",
            DoCtrl::GetHandlers => "GetHandlers",
            DoCtrl::GetCallStack => "GetCallStack",
            DoCtrl::AsyncEscape { .. } => "AsyncEscape",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_do_expr_conversions() {
        assert!(matches!(
            DoExpr::from(Effect::get("x")),
            DoExpr::Effect(Effect::Get { .. })
        ));
        assert!(matches!(
            DoExpr::pure(Value::Int(1)),
            DoExpr::Ctrl(DoCtrl::Pure {
                value: Value::Int(1)
            })
        ));
    }

    #[test]
    fn test_call_arg_resolution_state() {
        assert!(CallArg::value(Value::Unit).is_resolved());
        assert!(!CallArg::expr(Effect::get("x")).is_resolved());
    }

    #[test]
    fn test_do_ctrl_kind_tags() {
        assert_eq!(DoCtrl::GetHandlers.kind(), "GetHandlers");
        assert_eq!(
            DoCtrl::Delegate { effect: None }.kind(),
            "Delegate"
        );
        assert_eq!(
            DoCtrl::Pure {
                value: Value::Unit
            }
            .kind(),
            "Pure"
        );
    }
}
