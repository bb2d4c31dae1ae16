//! Effect types that user code can yield.
//!
//! Effects are the requests user programs make; handlers in scope supply
//! their interpretation. The engine only ever inspects the tag.

use crate::host::{HostFn, HostValue};
use crate::scheduler::SchedulerEffect;
use crate::value::Value;

#[derive(Debug, Clone)]
pub enum Effect {
    /// Read `key` from the state map.
    Get { key: String },
    /// Write `value` under `key` in the state map.
    Put { key: String, value: Value },
    /// Replace the value under `key` with `modifier(old)`; resumes with the
    /// old value.
    Modify { key: String, modifier: HostFn },
    /// Read `key` from the environment map.
    Ask { key: String },
    /// Append `message` to the log.
    Tell { message: Value },
    /// Cooperative-concurrency effects, interpreted by the scheduler handler.
    Scheduler(SchedulerEffect),
    /// Host-defined effect the core cannot interpret.
    Host(HostValue),
}

impl Effect {
    pub fn get(key: impl Into<String>) -> Self {
        Effect::Get { key: key.into() }
    }

    pub fn put(key: impl Into<String>, value: impl Into<Value>) -> Self {
        Effect::Put {
            key: key.into(),
            value: value.into(),
        }
    }

    pub fn modify(key: impl Into<String>, modifier: HostFn) -> Self {
        Effect::Modify {
            key: key.into(),
            modifier,
        }
    }

    pub fn ask(key: impl Into<String>) -> Self {
        Effect::Ask { key: key.into() }
    }

    pub fn tell(message: impl Into<Value>) -> Self {
        Effect::Tell {
            message: message.into(),
        }
    }

    /// Diagnostic type name; used in error messages only.
    pub fn type_name(&self) -> &'static str {
        match self {
            Effect::Get { .. } => "Get",
            Effect::Put { .. } => "Put",
            Effect::Modify { .. } => "Modify",
            Effect::Ask { .. } => "Ask",
            Effect::Tell { .. } => "Tell",
            Effect::Scheduler(e) => e.type_name(),
            Effect::Host(_) => "HostEffect",
        }
    }

    pub fn is_state(&self) -> bool {
        matches!(
            self,
            Effect::Get { .. } | Effect::Put { .. } | Effect::Modify { .. }
        )
    }

    pub fn is_reader(&self) -> bool {
        matches!(self, Effect::Ask { .. })
    }

    pub fn is_writer(&self) -> bool {
        matches!(self, Effect::Tell { .. })
    }

    pub fn is_scheduler(&self) -> bool {
        matches!(self, Effect::Scheduler(_))
    }
}
