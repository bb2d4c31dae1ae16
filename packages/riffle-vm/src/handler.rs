//! Handler types and the built-in state/reader/writer handlers.

use std::fmt;
use std::sync::{Arc, Mutex};

use crate::continuation::Continuation;
use crate::do_ctrl::{DoCtrl, DoExpr};
use crate::driver::VmException;
use crate::effect::Effect;
use crate::host::HostValue;
use crate::host_call::HostCall;
use crate::ids::SegmentId;
use crate::program::Coroutine;
use crate::store::Store;
use crate::value::Value;

/// One step of a native handler program.
#[derive(Debug)]
pub enum HandlerStep {
    /// Yield an expression for the engine to evaluate; the program is
    /// resumed with its value.
    Yield(DoExpr),
    /// Finish; under a prompt boundary this is the implicit handler return.
    Return(Value),
    Throw(VmException),
    /// Suspend on a host call; the outcome resumes this program.
    NeedsHost { call: HostCall },
}

/// A native handler program instance.
///
/// Generator-like: `start` receives the dispatched effect and the call-site
/// continuation, `resume`/`throw` continue after a yield. Instances that
/// outlive one step are held behind shared ownership with interior
/// mutability; the engine never keeps the borrow across a host call.
pub trait HandlerProgram: fmt::Debug + Send {
    fn start(&mut self, effect: Effect, k_user: Continuation, store: &mut Store) -> HandlerStep;

    fn resume(&mut self, value: Value, store: &mut Store) -> HandlerStep;

    fn throw(&mut self, exc: VmException, _store: &mut Store) -> HandlerStep {
        HandlerStep::Throw(exc)
    }
}

pub type HandlerProgramRef = Arc<Mutex<Box<dyn HandlerProgram>>>;

pub fn handler_program_ref(program: Box<dyn HandlerProgram>) -> HandlerProgramRef {
    Arc::new(Mutex::new(program))
}

/// Factory producing a fresh program instance per dispatch.
pub trait HandlerProgramFactory: fmt::Debug + Send + Sync {
    fn name(&self) -> &'static str;

    fn can_handle(&self, effect: &Effect) -> bool;

    fn instantiate(&self) -> Box<dyn HandlerProgram>;
}

pub type HandlerFactoryRef = Arc<dyn HandlerProgramFactory>;

type HostHandlerImpl =
    dyn Fn(Effect, Continuation) -> Result<Box<dyn Coroutine>, VmException> + Send + Sync;

/// A host-owned handler function.
///
/// Called with the effect and the call-site continuation, it returns a
/// coroutine that runs as the handler body. The identity handle preserves
/// the original host object for `GetHandlers`.
#[derive(Clone)]
pub struct HostHandler {
    identity: HostValue,
    name: String,
    f: Arc<HostHandlerImpl>,
}

impl HostHandler {
    pub fn new(
        name: impl Into<String>,
        f: impl Fn(Effect, Continuation) -> Result<Box<dyn Coroutine>, VmException>
            + Send
            + Sync
            + 'static,
    ) -> Self {
        let name = name.into();
        HostHandler {
            identity: HostValue::new(name.clone(), ()),
            name,
            f: Arc::new(f),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn identity(&self) -> &HostValue {
        &self.identity
    }

    pub fn invoke(
        &self,
        effect: Effect,
        k_user: Continuation,
    ) -> Result<Box<dyn Coroutine>, VmException> {
        (self.f)(effect, k_user)
    }
}

impl fmt::Debug for HostHandler {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "HostHandler({}#{})", self.name, self.identity.id())
    }
}

#[derive(Debug, Clone)]
pub enum Handler {
    Native(HandlerFactoryRef),
    Host(HostHandler),
}

impl Handler {
    pub fn native(factory: impl HandlerProgramFactory + 'static) -> Self {
        Handler::Native(Arc::new(factory))
    }

    pub fn can_handle(&self, effect: &Effect) -> bool {
        match self {
            Handler::Native(factory) => factory.can_handle(effect),
            // Host handlers see every effect; they delegate what they do
            // not understand.
            Handler::Host(_) => true,
        }
    }

    pub fn name(&self) -> &str {
        match self {
            Handler::Native(factory) => factory.name(),
            Handler::Host(h) => h.name(),
        }
    }

    /// Identity comparison: same host object, or same factory allocation.
    pub fn is_same(&self, other: &Handler) -> bool {
        match (self, other) {
            (Handler::Native(a), Handler::Native(b)) => Arc::ptr_eq(a, b),
            (Handler::Host(a), Handler::Host(b)) => a.identity().same_object(b.identity()),
            _ => false,
        }
    }
}

/// Registry entry created at `WithHandler` time.
///
/// Entries persist for the VM's life: markers embedded in captured scope
/// chains may outlive any particular installation site.
#[derive(Debug, Clone)]
pub struct HandlerEntry {
    pub handler: Handler,
    pub prompt_seg_id: SegmentId,
}

impl HandlerEntry {
    pub fn new(handler: Handler, prompt_seg_id: SegmentId) -> Self {
        HandlerEntry {
            handler,
            prompt_seg_id,
        }
    }
}

// ---------------------------------------------------------------------------
// Built-in handlers
// ---------------------------------------------------------------------------

#[derive(Debug)]
pub struct StateHandlerFactory;

#[derive(Debug)]
pub struct ReaderHandlerFactory;

#[derive(Debug)]
pub struct WriterHandlerFactory;

impl HandlerProgramFactory for StateHandlerFactory {
    fn name(&self) -> &'static str {
        "StateHandler"
    }

    fn can_handle(&self, effect: &Effect) -> bool {
        effect.is_state()
    }

    fn instantiate(&self) -> Box<dyn HandlerProgram> {
        Box::new(StateProgram { phase: StatePhase::Start })
    }
}

impl HandlerProgramFactory for ReaderHandlerFactory {
    fn name(&self) -> &'static str {
        "ReaderHandler"
    }

    fn can_handle(&self, effect: &Effect) -> bool {
        effect.is_reader()
    }

    fn instantiate(&self) -> Box<dyn HandlerProgram> {
        Box::new(SingleResumeProgram {
            name: "ReaderHandler",
            done: false,
            pick: pick_reader_value,
        })
    }
}

impl HandlerProgramFactory for WriterHandlerFactory {
    fn name(&self) -> &'static str {
        "WriterHandler"
    }

    fn can_handle(&self, effect: &Effect) -> bool {
        effect.is_writer()
    }

    fn instantiate(&self) -> Box<dyn HandlerProgram> {
        Box::new(SingleResumeProgram {
            name: "WriterHandler",
            done: false,
            pick: pick_writer_value,
        })
    }
}

fn resume_with(k: Continuation, value: Value) -> HandlerStep {
    HandlerStep::Yield(DoExpr::Ctrl(DoCtrl::Resume {
        continuation: k,
        value,
    }))
}

#[derive(Debug)]
enum StatePhase {
    Start,
    /// Waiting for the resumed computation's result.
    AfterResume,
    /// Waiting for the modifier function's result.
    ModifyPending {
        key: String,
        old: Value,
        k: Continuation,
    },
    Done,
}

#[derive(Debug)]
struct StateProgram {
    phase: StatePhase,
}

impl HandlerProgram for StateProgram {
    fn start(&mut self, effect: Effect, k_user: Continuation, store: &mut Store) -> HandlerStep {
        match effect {
            Effect::Get { key } => {
                let value = store.get(&key).cloned().unwrap_or(Value::None);
                self.phase = StatePhase::AfterResume;
                resume_with(k_user, value)
            }
            Effect::Put { key, value } => {
                store.put(key, value);
                self.phase = StatePhase::AfterResume;
                resume_with(k_user, Value::Unit)
            }
            Effect::Modify { key, modifier } => {
                let old = store.get(&key).cloned().unwrap_or(Value::None);
                self.phase = StatePhase::ModifyPending {
                    key,
                    old: old.clone(),
                    k: k_user,
                };
                HandlerStep::NeedsHost {
                    call: HostCall::CallFunction {
                        func: modifier,
                        args: vec![old],
                        kwargs: vec![],
                    },
                }
            }
            other => HandlerStep::Throw(VmException::runtime_error(format!(
                "state handler cannot handle {}",
                other.type_name()
            ))),
        }
    }

    fn resume(&mut self, value: Value, store: &mut Store) -> HandlerStep {
        match std::mem::replace(&mut self.phase, StatePhase::Done) {
            StatePhase::AfterResume => HandlerStep::Return(value),
            StatePhase::ModifyPending { key, old, k } => {
                store.put(key, value);
                self.phase = StatePhase::AfterResume;
                resume_with(k, old)
            }
            _ => HandlerStep::Throw(VmException::runtime_error(
                "state handler resumed in unexpected phase",
            )),
        }
    }
}

fn pick_reader_value(effect: &Effect, store: &Store) -> Result<Value, VmException> {
    match effect {
        Effect::Ask { key } => Ok(store.ask(key).cloned().unwrap_or(Value::None)),
        other => Err(VmException::runtime_error(format!(
            "reader handler cannot handle {}",
            other.type_name()
        ))),
    }
}

fn pick_writer_value(effect: &Effect, store: &Store) -> Result<Value, VmException> {
    match effect {
        Effect::Tell { message } => {
            // The log append happens in start(); see SingleResumeProgram.
            let _ = message;
            Ok(Value::Unit)
        }
        other => Err(VmException::runtime_error(format!(
            "writer handler cannot handle {}",
            other.type_name()
        ))),
    }
}

/// Shared shape of reader/writer: resume once, then return the resumed
/// computation's result.
struct SingleResumeProgram {
    name: &'static str,
    done: bool,
    pick: fn(&Effect, &Store) -> Result<Value, VmException>,
}

impl fmt::Debug for SingleResumeProgram {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}(done={})", self.name, self.done)
    }
}

impl HandlerProgram for SingleResumeProgram {
    fn start(&mut self, effect: Effect, k_user: Continuation, store: &mut Store) -> HandlerStep {
        if let Effect::Tell { message } = &effect {
            store.tell(message.clone());
        }
        match (self.pick)(&effect, store) {
            Ok(value) => resume_with(k_user, value),
            Err(exc) => HandlerStep::Throw(exc),
        }
    }

    fn resume(&mut self, value: Value, _store: &mut Store) -> HandlerStep {
        if self.done {
            return HandlerStep::Throw(VmException::runtime_error(format!(
                "{} resumed after completion",
                self.name
            )));
        }
        self.done = true;
        HandlerStep::Return(value)
    }
}

pub fn state_handler() -> Handler {
    Handler::native(StateHandlerFactory)
}

pub fn reader_handler() -> Handler {
    Handler::native(ReaderHandlerFactory)
}

pub fn writer_handler() -> Handler {
    Handler::native(WriterHandlerFactory)
}
