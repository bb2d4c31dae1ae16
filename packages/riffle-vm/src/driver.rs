//! Driver-facing step state: modes, step events, and throwable exceptions.

use crate::boundary::Yielded;
use crate::error::VMError;
use crate::host::HostValue;
use crate::host_call::HostCall;
use crate::value::Value;

/// Exception value that travels through `Mode::Throw`.
///
/// Distinct from [`VMError`]: an exception can be caught by coroutine and
/// handler-program frames on the way out; a `VMError` is terminal.
#[derive(Debug, Clone)]
pub enum VmException {
    RuntimeError { message: String },
    TypeError { message: String },
    /// Opaque host payload, carried with a rendered message for diagnostics.
    Host { payload: HostValue, message: String },
}

/// Per-step execution mode of the VM.
#[derive(Debug, Clone)]
pub enum Mode {
    Deliver(Value),
    Throw(VmException),
    HandleYield(Yielded),
    Return(Value),
}

/// Outcome of a single `VM::step` invocation.
#[derive(Debug)]
pub enum StepEvent {
    /// Pure internal transition; step again immediately.
    Continue,
    /// Execute the described host call, then feed the outcome back through
    /// `VM::receive_host_result`.
    NeedsHost(HostCall),
    /// Terminal success.
    Done(Value),
    /// Terminal failure.
    Error(VMError),
}

impl VmException {
    pub fn runtime_error(message: impl Into<String>) -> Self {
        VmException::RuntimeError {
            message: message.into(),
        }
    }

    pub fn type_error(message: impl Into<String>) -> Self {
        VmException::TypeError {
            message: message.into(),
        }
    }

    pub fn host(payload: HostValue, message: impl Into<String>) -> Self {
        VmException::Host {
            payload,
            message: message.into(),
        }
    }

    pub fn message(&self) -> &str {
        match self {
            VmException::RuntimeError { message }
            | VmException::TypeError { message }
            | VmException::Host { message, .. } => message,
        }
    }

    pub fn is_type_error(&self) -> bool {
        matches!(self, VmException::TypeError { .. })
    }
}

impl Mode {
    pub fn deliver(value: impl Into<Value>) -> Self {
        Mode::Deliver(value.into())
    }

    pub fn is_deliver(&self) -> bool {
        matches!(self, Mode::Deliver(_))
    }

    pub fn is_throw(&self) -> bool {
        matches!(self, Mode::Throw(_))
    }

    pub fn is_return(&self) -> bool {
        matches!(self, Mode::Return(_))
    }
}

impl StepEvent {
    pub fn is_done(&self) -> bool {
        matches!(self, StepEvent::Done(_))
    }

    pub fn is_error(&self) -> bool {
        matches!(self, StepEvent::Error(_))
    }

    pub fn is_needs_host(&self) -> bool {
        matches!(self, StepEvent::NeedsHost(_))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_exception_constructors() {
        let e = VmException::runtime_error("boom");
        assert_eq!(e.message(), "boom");
        assert!(!e.is_type_error());

        let t = VmException::type_error("bad type");
        assert!(t.is_type_error());
    }

    #[test]
    fn test_mode_predicates() {
        assert!(Mode::deliver(1i64).is_deliver());
        assert!(Mode::Throw(VmException::runtime_error("x")).is_throw());
        assert!(Mode::Return(Value::Unit).is_return());
    }
}
