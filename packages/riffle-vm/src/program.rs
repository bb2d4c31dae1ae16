//! Coroutine abstraction for user programs.
//!
//! The engine never steps a coroutine itself: frames hold an opaque
//! [`CoroutineRef`] and the driver advances it in response to
//! `NeedsHost(StepCoroutine)`. Programs written directly in Rust use the
//! [`GenCoroutine`] adapter, a chain of continuation closures that plays the
//! role of a generator.

use std::fmt;
use std::sync::{Arc, Mutex};

use crate::do_ctrl::DoExpr;
use crate::driver::VmException;
use crate::value::Value;

/// One advancement of a coroutine, as observed by the driver.
#[derive(Debug)]
pub enum CoroStep {
    /// The coroutine yielded an expression for the engine to interpret.
    Yield(DoExpr),
    /// The coroutine finished with a value.
    Return(Value),
    /// The coroutine raised.
    Raise(VmException),
}

/// A resumable user program.
///
/// `resume` delivers the value produced by the previous yield (unit on the
/// first step); `throw` delivers an exception at the suspension point.
pub trait Coroutine: fmt::Debug + Send {
    fn resume(&mut self, value: Value) -> CoroStep;

    fn throw(&mut self, exc: VmException) -> CoroStep {
        CoroStep::Raise(exc)
    }
}

/// Shared handle to a coroutine. Cloned into frame snapshots; locked only
/// by the driver while it executes a step.
pub type CoroutineRef = Arc<Mutex<Box<dyn Coroutine>>>;

pub fn coroutine_ref(coroutine: Box<dyn Coroutine>) -> CoroutineRef {
    Arc::new(Mutex::new(coroutine))
}

/// What a [`GenCoroutine`] continuation closure produces.
pub enum GenStep {
    /// Yield an expression, then continue with the given closure.
    Yield(DoExpr, Next),
    Return(Value),
    Raise(VmException),
}

/// Boxed continuation closure receiving the value sent back into the
/// generator.
pub struct Next(Box<dyn FnOnce(Value) -> GenStep + Send>);

impl Next {
    pub fn new(f: impl FnOnce(Value) -> GenStep + Send + 'static) -> Self {
        Next(Box::new(f))
    }
}

impl GenStep {
    /// Yield `expr`, then run `next` with the delivered value.
    pub fn yield_then(
        expr: impl Into<DoExpr>,
        next: impl FnOnce(Value) -> GenStep + Send + 'static,
    ) -> Self {
        GenStep::Yield(expr.into(), Next::new(next))
    }

    pub fn done(value: impl Into<Value>) -> Self {
        GenStep::Return(value.into())
    }
}

/// Generator emulation over chained [`Next`] closures.
///
/// This stands in for the host language's native coroutines: the driver sees
/// the same next/send/throw protocol it would apply to a real generator.
pub struct GenCoroutine {
    state: GenState,
}

enum GenState {
    Ready(Next),
    Done,
}

impl GenCoroutine {
    pub fn new(first: Next) -> Self {
        GenCoroutine {
            state: GenState::Ready(first),
        }
    }

    pub fn boxed(first: Next) -> Box<dyn Coroutine> {
        Box::new(GenCoroutine::new(first))
    }
}

impl fmt::Debug for GenCoroutine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = match self.state {
            GenState::Ready(_) => "ready",
            GenState::Done => "done",
        };
        write!(f, "GenCoroutine({state})")
    }
}

impl Coroutine for GenCoroutine {
    fn resume(&mut self, value: Value) -> CoroStep {
        match std::mem::replace(&mut self.state, GenState::Done) {
            GenState::Ready(Next(f)) => match f(value) {
                GenStep::Yield(expr, next) => {
                    self.state = GenState::Ready(next);
                    CoroStep::Yield(expr)
                }
                GenStep::Return(v) => CoroStep::Return(v),
                GenStep::Raise(e) => CoroStep::Raise(e),
            },
            GenState::Done => CoroStep::Raise(VmException::runtime_error(
                "coroutine resumed after completion",
            )),
        }
    }

    fn throw(&mut self, exc: VmException) -> CoroStep {
        self.state = GenState::Done;
        CoroStep::Raise(exc)
    }
}

/// Factory for unstarted programs.
///
/// A bare program yield carries one of these; `HostCall::StartProgram` asks
/// the driver to materialize a fresh coroutine from it.
#[derive(Clone)]
pub struct ProgramFactory {
    name: String,
    make: Arc<dyn Fn() -> Box<dyn Coroutine> + Send + Sync>,
}

impl ProgramFactory {
    pub fn new(
        name: impl Into<String>,
        make: impl Fn() -> Box<dyn Coroutine> + Send + Sync + 'static,
    ) -> Self {
        ProgramFactory {
            name: name.into(),
            make: Arc::new(make),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn instantiate(&self) -> Box<dyn Coroutine> {
        (self.make)()
    }
}

impl fmt::Debug for ProgramFactory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ProgramFactory({})", self.name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::effect::Effect;

    #[test]
    fn test_gen_coroutine_yield_and_return() {
        let mut gen = GenCoroutine::new(Next::new(|_| {
            GenStep::yield_then(DoExpr::Effect(Effect::get("x")), |v| {
                GenStep::done(Value::Int(v.as_int().unwrap_or(0) + 1))
            })
        }));

        match gen.resume(Value::Unit) {
            CoroStep::Yield(DoExpr::Effect(Effect::Get { key })) => assert_eq!(key, "x"),
            other => panic!("expected yield of Get, got {other:?}"),
        }
        match gen.resume(Value::Int(10)) {
            CoroStep::Return(Value::Int(11)) => {}
            other => panic!("expected return of 11, got {other:?}"),
        }
    }

    #[test]
    fn test_gen_coroutine_resume_after_done_raises() {
        let mut gen = GenCoroutine::new(Next::new(|_| GenStep::done(Value::Unit)));
        assert!(matches!(gen.resume(Value::Unit), CoroStep::Return(_)));
        assert!(matches!(gen.resume(Value::Unit), CoroStep::Raise(_)));
    }

    #[test]
    fn test_gen_coroutine_throw_closes() {
        let mut gen = GenCoroutine::new(Next::new(|_| GenStep::done(Value::Unit)));
        let step = gen.throw(VmException::runtime_error("stop"));
        assert!(matches!(step, CoroStep::Raise(_)));
        assert!(matches!(gen.resume(Value::Unit), CoroStep::Raise(_)));
    }

    #[test]
    fn test_program_factory_instantiates_fresh_coroutines() {
        let factory = ProgramFactory::new("unit", || {
            GenCoroutine::boxed(Next::new(|_| GenStep::done(Value::Unit)))
        });
        let mut a = factory.instantiate();
        let mut b = factory.instantiate();
        assert!(matches!(a.resume(Value::Unit), CoroStep::Return(_)));
        assert!(matches!(b.resume(Value::Unit), CoroStep::Return(_)));
    }
}
