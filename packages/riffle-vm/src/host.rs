//! Opaque host-side values and callables.
//!
//! The engine treats everything the host owns as an opaque handle: it may
//! clone it, compare it by identity, and hand it back across the boundary,
//! but it never looks inside. The driver downcasts handles back to concrete
//! types when it executes a host call.

use std::any::Any;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use crate::driver::VmException;
use crate::program::CoroutineRef;
use crate::value::Value;

static HOST_VALUE_COUNTER: AtomicU64 = AtomicU64::new(1);
static HOST_FN_COUNTER: AtomicU64 = AtomicU64::new(1);

/// Opaque reference to a host-owned object.
///
/// Identity (not structure) is the equality notion: two `HostValue`s are the
/// same object iff they were produced by cloning one original handle.
#[derive(Clone)]
pub struct HostValue {
    id: u64,
    label: String,
    inner: Arc<dyn Any + Send + Sync>,
}

impl HostValue {
    pub fn new<T: Any + Send + Sync>(label: impl Into<String>, value: T) -> Self {
        HostValue {
            id: HOST_VALUE_COUNTER.fetch_add(1, Ordering::Relaxed),
            label: label.into(),
            inner: Arc::new(value),
        }
    }

    /// Identity id, unique per original handle.
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Diagnostic label (the host-side type name, typically).
    pub fn label(&self) -> &str {
        &self.label
    }

    pub fn downcast_ref<T: Any>(&self) -> Option<&T> {
        self.inner.downcast_ref::<T>()
    }

    /// True iff both handles refer to the same host object.
    pub fn same_object(&self, other: &HostValue) -> bool {
        self.id == other.id
    }

    /// Wrap a coroutine so it can cross the boundary as a plain value.
    pub fn of_coroutine(coroutine: CoroutineRef) -> Self {
        HostValue::new("coroutine", coroutine)
    }

    pub fn as_coroutine(&self) -> Option<CoroutineRef> {
        self.downcast_ref::<CoroutineRef>().cloned()
    }
}

impl fmt::Debug for HostValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "HostValue({}#{})", self.label, self.id)
    }
}

impl PartialEq for HostValue {
    fn eq(&self, other: &Self) -> bool {
        self.same_object(other)
    }
}

impl Eq for HostValue {}

/// Result of invoking a host callable.
pub enum HostFnResult {
    /// Plain value.
    Value(Value),
    /// A coroutine to be pushed as a host-coroutine frame.
    Coroutine(Box<dyn crate::program::Coroutine>),
    /// A deferred expression the engine should evaluate.
    Expr(crate::do_ctrl::DoExpr),
}

type HostFnImpl =
    dyn Fn(Vec<Value>, Vec<(String, Value)>) -> Result<HostFnResult, VmException> + Send + Sync;

/// A host-owned callable with a stable identity.
#[derive(Clone)]
pub struct HostFn {
    id: u64,
    name: String,
    f: Arc<HostFnImpl>,
}

impl HostFn {
    pub fn new(
        name: impl Into<String>,
        f: impl Fn(Vec<Value>, Vec<(String, Value)>) -> Result<HostFnResult, VmException>
            + Send
            + Sync
            + 'static,
    ) -> Self {
        HostFn {
            id: HOST_FN_COUNTER.fetch_add(1, Ordering::Relaxed),
            name: name.into(),
            f: Arc::new(f),
        }
    }

    /// Convenience constructor for single-argument value functions.
    pub fn unary(
        name: impl Into<String>,
        f: impl Fn(Value) -> Result<Value, VmException> + Send + Sync + 'static,
    ) -> Self {
        HostFn::new(name, move |mut args, _kwargs| {
            let arg = if args.is_empty() {
                Value::Unit
            } else {
                args.remove(0)
            };
            f(arg).map(HostFnResult::Value)
        })
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn invoke(
        &self,
        args: Vec<Value>,
        kwargs: Vec<(String, Value)>,
    ) -> Result<HostFnResult, VmException> {
        (self.f)(args, kwargs)
    }
}

impl fmt::Debug for HostFn {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "HostFn({}#{})", self.name, self.id)
    }
}
