//! Synchronous driver and the user-facing run contract.

use std::collections::HashMap;

use tracing::trace;

use crate::boundary::classify;
use crate::do_ctrl::DoExpr;
use crate::driver::{StepEvent, VmException};
use crate::error::VMError;
use crate::handler::Handler;
use crate::host::{HostFnResult, HostValue};
use crate::host_call::{CoroMethod, HostCall, HostCallOutcome};
use crate::program::CoroStep;
use crate::value::Value;
use crate::vm::{DebugConfig, VM};

/// Result of one engine run: the outcome plus a snapshot of the L2 store at
/// the point the run ended (success or failure alike).
#[derive(Debug)]
pub struct RunResult {
    pub result: Result<Value, VMError>,
    pub state: HashMap<String, Value>,
    pub env: HashMap<String, Value>,
    pub log: Vec<Value>,
}

impl RunResult {
    pub fn is_ok(&self) -> bool {
        self.result.is_ok()
    }

    pub fn unwrap_value(self) -> Value {
        match self.result {
            Ok(v) => v,
            Err(e) => panic!("run failed: {e}"),
        }
    }
}

/// Synchronous step-loop shell around one VM instance.
pub struct Runtime {
    pub vm: VM,
    /// Kinds of host calls executed, in order. Cheap observational record
    /// used to compare run shapes.
    pub call_trace: Vec<&'static str>,
}

impl Runtime {
    pub fn new() -> Self {
        Runtime {
            vm: VM::new(),
            call_trace: Vec::new(),
        }
    }

    pub fn with_debug(debug: DebugConfig) -> Self {
        Runtime {
            vm: VM::with_debug(debug),
            call_trace: Vec::new(),
        }
    }

    pub fn seed_env(&mut self, env: HashMap<String, Value>) {
        for (k, v) in env {
            self.vm.seed_env(k, v);
        }
    }

    pub fn seed_state(&mut self, store: HashMap<String, Value>) {
        for (k, v) in store {
            self.vm.seed_state(k, v);
        }
    }

    /// Wrap `program` in nested `WithHandler` (first handler outermost) and
    /// drive the step loop to a terminal event.
    pub fn run(&mut self, program: DoExpr, handlers: Vec<Handler>) -> RunResult {
        let mut expr = program;
        for handler in handlers.into_iter().rev() {
            expr = DoExpr::with_handler(handler, expr);
        }

        self.vm.start(expr);
        let result = self.drive();
        RunResult {
            result,
            state: self.vm.snapshot_state(),
            env: self.vm.snapshot_env(),
            log: self.vm.snapshot_log(),
        }
    }

    fn drive(&mut self) -> Result<Value, VMError> {
        loop {
            match self.vm.step() {
                StepEvent::Continue => continue,
                StepEvent::NeedsHost(call) => {
                    self.call_trace.push(call.kind());
                    trace!(call = call.kind(), "host call");
                    let outcome = execute_host_call(call);
                    self.vm.receive_host_result(outcome);
                }
                StepEvent::Done(value) => return Ok(value),
                StepEvent::Error(e) => return Err(e),
            }
        }
    }
}

impl Default for Runtime {
    fn default() -> Self {
        Self::new()
    }
}

/// Execute a host call synchronously and classify the outcome.
///
/// Classification of coroutine yields happens here, on the host side of the
/// boundary; the engine never re-inspects raw host objects.
pub fn execute_host_call(call: HostCall) -> HostCallOutcome {
    match call {
        HostCall::StartProgram { program } => {
            let coroutine = program.instantiate();
            HostCallOutcome::Value(Value::Host(HostValue::of_coroutine(
                crate::program::coroutine_ref(coroutine),
            )))
        }

        HostCall::CallFunction { func, args, kwargs } => match func.invoke(args, kwargs) {
            Ok(HostFnResult::Value(v)) => HostCallOutcome::Value(v),
            Ok(HostFnResult::Coroutine(c)) => HostCallOutcome::Value(Value::Host(
                HostValue::of_coroutine(crate::program::coroutine_ref(c)),
            )),
            Ok(HostFnResult::Expr(expr)) => HostCallOutcome::GenYield(classify(expr)),
            Err(e) => HostCallOutcome::GenError(e),
        },

        HostCall::CallHandler {
            handler,
            effect,
            continuation,
        } => match handler.invoke(effect, continuation) {
            Ok(coroutine) => HostCallOutcome::Value(Value::Host(HostValue::of_coroutine(
                crate::program::coroutine_ref(coroutine),
            ))),
            Err(e) => HostCallOutcome::GenError(e),
        },

        HostCall::StepCoroutine { coroutine, method } => {
            let step = {
                let mut guard = coroutine.lock().expect("coroutine lock poisoned");
                match method {
                    CoroMethod::Next => guard.resume(Value::Unit),
                    CoroMethod::Send { value } => guard.resume(value),
                    CoroMethod::Throw { exc } => guard.throw(exc),
                }
            };
            match step {
                CoroStep::Yield(expr) => HostCallOutcome::GenYield(classify(expr)),
                CoroStep::Return(v) => HostCallOutcome::GenReturn(v),
                CoroStep::Raise(e) => HostCallOutcome::GenError(e),
            }
        }

        // The synchronous driver cannot execute async work.
        HostCall::CallAsync { func, .. } => HostCallOutcome::GenError(VmException::type_error(
            format!("CallAsync({}) requires the async driver", func.name()),
        )),
    }
}

/// Run `program` under `handlers` with seeded environment and store.
///
/// Handlers are installed as nested `WithHandler`, first element outermost;
/// semantically identical to writing the nesting by hand.
pub fn run(
    program: impl Into<DoExpr>,
    handlers: Vec<Handler>,
    env: HashMap<String, Value>,
    store: HashMap<String, Value>,
) -> RunResult {
    let mut runtime = Runtime::new();
    runtime.seed_env(env);
    runtime.seed_state(store);
    runtime.run(program.into(), handlers)
}
