//! Kleisli programs and the call-time macro expansion.
//!
//! A kleisli program is a deferred invocation target: calling it does not
//! run anything, it deterministically lowers the call into a `DoCtrl::Call`
//! node whose arguments are either pre-resolved values or deferred
//! expressions the VM evaluates left-to-right before invoking the kernel.
//!
//! Lowering to a control primitive (rather than dispatching a "call" effect)
//! is what keeps function calls from recursing through the handler stack:
//! the engine evaluates Call directly, no handler lookup involved.

use std::collections::HashMap;

use crate::do_ctrl::{CallArg, DoCtrl, DoExpr};
use crate::effect::Effect;
use crate::frame::CallMetadata;
use crate::host::{HostFn, HostValue};
use crate::value::Value;

/// Declared shape of one kernel parameter.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParamSpec {
    pub name: String,
    pub kind: ParamKind,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ParamKind {
    /// Plain-value parameter: effect or expression arguments are unwrapped
    /// and evaluated before the kernel runs.
    Value,
    /// The parameter wants the unevaluated object itself (a program, an
    /// effect, a whole expression); arguments pass through as pure values.
    Deferred,
}

impl ParamSpec {
    pub fn value(name: impl Into<String>) -> Self {
        ParamSpec {
            name: name.into(),
            kind: ParamKind::Value,
        }
    }

    pub fn deferred(name: impl Into<String>) -> Self {
        ParamSpec {
            name: name.into(),
            kind: ParamKind::Deferred,
        }
    }
}

/// How one argument position is treated at call time.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum WrapPolicy {
    /// Unwrap: effects become `Perform`, expressions pass as-is.
    Unwrap,
    /// Keep the object as a value (composability-preserving default for
    /// deferred parameters).
    Pure,
}

/// Auto-unwrap strategy, computed once at program construction.
///
/// The strategy must be stable across calls to the same program; computing
/// it per call would be both wasteful and a consistency hazard.
#[derive(Debug, Clone)]
struct CallStrategy {
    positional: Vec<WrapPolicy>,
    by_name: HashMap<String, WrapPolicy>,
}

impl CallStrategy {
    fn from_params(params: &[ParamSpec]) -> Self {
        let policy = |kind: ParamKind| match kind {
            ParamKind::Value => WrapPolicy::Unwrap,
            ParamKind::Deferred => WrapPolicy::Pure,
        };
        CallStrategy {
            positional: params.iter().map(|p| policy(p.kind)).collect(),
            by_name: params
                .iter()
                .map(|p| (p.name.clone(), policy(p.kind)))
                .collect(),
        }
    }

    fn for_position(&self, idx: usize) -> WrapPolicy {
        self.positional.get(idx).copied().unwrap_or(WrapPolicy::Unwrap)
    }

    fn for_keyword(&self, name: &str) -> WrapPolicy {
        self.by_name.get(name).copied().unwrap_or(WrapPolicy::Unwrap)
    }
}

/// An actual argument at a call site.
#[derive(Debug, Clone)]
pub enum ProgramArg {
    Value(Value),
    Effect(Effect),
    Expr(DoExpr),
}

impl From<Value> for ProgramArg {
    fn from(v: Value) -> Self {
        ProgramArg::Value(v)
    }
}

impl From<Effect> for ProgramArg {
    fn from(e: Effect) -> Self {
        ProgramArg::Effect(e)
    }
}

impl From<DoExpr> for ProgramArg {
    fn from(e: DoExpr) -> Self {
        ProgramArg::Expr(e)
    }
}

/// A callable kleisli program with cached call strategy.
#[derive(Debug, Clone)]
pub struct KleisliProgram {
    name: String,
    source_file: String,
    source_line: u32,
    kernel: HostFn,
    /// Stable host identity of the kernel, minted once.
    kernel_value: HostValue,
    strategy: CallStrategy,
}

impl KleisliProgram {
    pub fn new(
        name: impl Into<String>,
        source_file: impl Into<String>,
        source_line: u32,
        params: &[ParamSpec],
        kernel: HostFn,
    ) -> Self {
        let name = name.into();
        let kernel_value = HostValue::new(name.clone(), kernel.clone());
        KleisliProgram {
            name,
            source_file: source_file.into(),
            source_line,
            kernel,
            kernel_value,
            strategy: CallStrategy::from_params(params),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn kernel(&self) -> &HostFn {
        &self.kernel
    }

    /// Macro-expand a call into a `DoCtrl::Call` node.
    pub fn call(&self, args: Vec<ProgramArg>) -> DoExpr {
        self.call_with_kwargs(args, vec![])
    }

    pub fn call_with_kwargs(
        &self,
        args: Vec<ProgramArg>,
        kwargs: Vec<(String, ProgramArg)>,
    ) -> DoExpr {
        let call_args = args
            .into_iter()
            .enumerate()
            .map(|(idx, arg)| classify_arg(self.strategy.for_position(idx), arg))
            .collect();
        let call_kwargs = kwargs
            .into_iter()
            .map(|(name, arg)| {
                let classified = classify_arg(self.strategy.for_keyword(&name), arg);
                (name, classified)
            })
            .collect();

        DoExpr::Ctrl(DoCtrl::Call {
            f: CallArg::Value(Value::Host(self.kernel_value.clone())),
            args: call_args,
            kwargs: call_kwargs,
            metadata: CallMetadata::new(
                self.name.clone(),
                self.source_file.clone(),
                self.source_line,
            ),
        })
    }
}

fn classify_arg(policy: WrapPolicy, arg: ProgramArg) -> CallArg {
    match (policy, arg) {
        // Pre-resolved: plain values never need evaluation.
        (_, ProgramArg::Value(v)) => CallArg::Value(v),
        (WrapPolicy::Unwrap, ProgramArg::Effect(e)) => {
            CallArg::Expr(Box::new(DoExpr::Ctrl(DoCtrl::Perform { effect: e })))
        }
        (WrapPolicy::Unwrap, ProgramArg::Expr(e)) => CallArg::Expr(Box::new(e)),
        (WrapPolicy::Pure, ProgramArg::Effect(e)) => {
            CallArg::Value(Value::Host(HostValue::new("Effect", DoExpr::Effect(e))))
        }
        (WrapPolicy::Pure, ProgramArg::Expr(e)) => {
            CallArg::Value(Value::Host(HostValue::new("DoExpr", e)))
        }
    }
}

/// Build a kernel `HostFn` from a coroutine constructor.
pub fn program_kernel(
    name: impl Into<String>,
    make: impl Fn(Vec<Value>, Vec<(String, Value)>) -> Box<dyn crate::program::Coroutine>
        + Send
        + Sync
        + 'static,
) -> HostFn {
    HostFn::new(name, move |args, kwargs| {
        Ok(crate::host::HostFnResult::Coroutine(make(args, kwargs)))
    })
}
