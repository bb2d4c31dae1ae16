//! Core VM struct and step execution.

use std::collections::{HashMap, HashSet};

use tracing::trace;

use crate::arena::SegmentArena;
use crate::boundary::{classify, Yielded};
use crate::continuation::Continuation;
use crate::do_ctrl::DoExpr;
use crate::driver::{Mode, StepEvent, VmException};
use crate::error::VMError;
use crate::frame::Frame;
use crate::handler::{HandlerEntry, HandlerProgramRef, HandlerStep};
use crate::host::HostValue;
use crate::host_call::{CoroMethod, HostCall, HostCallOutcome, PendingHost};
use crate::ids::{CallbackId, ContinuationId, Marker, SegmentId};
use crate::segment::Segment;
use crate::store::Store;
use crate::value::Value;
use crate::vm_dispatch::DispatchContext;

/// One-shot engine callback: consumes the delivered value, produces the
/// next mode.
pub type Callback = Box<dyn FnOnce(Value, &mut VM) -> Mode + Send>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DebugLevel {
    Off,
    Steps,
    Trace,
}

#[derive(Debug, Clone)]
pub struct DebugConfig {
    pub level: DebugLevel,
    pub show_frames: bool,
}

impl Default for DebugConfig {
    fn default() -> Self {
        DebugConfig {
            level: DebugLevel::Off,
            show_frames: false,
        }
    }
}

impl DebugConfig {
    pub fn steps() -> Self {
        DebugConfig {
            level: DebugLevel::Steps,
            show_frames: false,
        }
    }

    pub fn trace() -> Self {
        DebugConfig {
            level: DebugLevel::Trace,
            show_frames: true,
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.level != DebugLevel::Off
    }
}

pub struct VM {
    pub segments: SegmentArena,
    pub(crate) dispatch_stack: Vec<DispatchContext>,
    pub(crate) callbacks: HashMap<CallbackId, Callback>,
    pub(crate) consumed_continuations: HashSet<ContinuationId>,
    pub(crate) handlers: HashMap<Marker, HandlerEntry>,
    /// L2 observable store backing the standard effects.
    pub store: Store,
    /// L3 opt-in scratch area; never read by the core.
    pub host_scratch: Option<HostValue>,
    pub current_segment: Option<SegmentId>,
    pub mode: Mode,
    pub(crate) pending_host: Option<PendingHost>,
    /// Host call produced while routing a previous outcome; emitted by the
    /// next `step`.
    pub(crate) queued_host_call: Option<HostCall>,
    pub debug: DebugConfig,
    pub step_counter: u64,
}

impl VM {
    pub fn new() -> Self {
        VM {
            segments: SegmentArena::new(),
            dispatch_stack: Vec::new(),
            callbacks: HashMap::new(),
            consumed_continuations: HashSet::new(),
            handlers: HashMap::new(),
            store: Store::new(),
            host_scratch: None,
            current_segment: None,
            mode: Mode::Deliver(Value::Unit),
            pending_host: None,
            queued_host_call: None,
            debug: DebugConfig::default(),
            step_counter: 0,
        }
    }

    pub fn with_debug(debug: DebugConfig) -> Self {
        VM {
            debug,
            ..Self::new()
        }
    }

    /// Install the root segment and queue `expr` for evaluation.
    pub fn start(&mut self, expr: DoExpr) {
        let root = Segment::new(Marker::fresh(), None, Vec::new());
        let root_id = self.segments.alloc(root);
        self.current_segment = Some(root_id);
        self.mode = Mode::HandleYield(classify(expr));
    }

    // -- store boundary ----------------------------------------------------

    pub fn seed_state(&mut self, key: impl Into<String>, value: Value) {
        self.store.put(key.into(), value);
    }

    pub fn seed_env(&mut self, key: impl Into<String>, value: Value) {
        self.store.env.insert(key.into(), value);
    }

    pub fn snapshot_state(&self) -> HashMap<String, Value> {
        self.store.state.clone()
    }

    pub fn snapshot_env(&self) -> HashMap<String, Value> {
        self.store.env.clone()
    }

    pub fn snapshot_log(&self) -> Vec<Value> {
        self.store.log.clone()
    }

    // -- segments and callbacks --------------------------------------------

    pub fn alloc_segment(&mut self, segment: Segment) -> SegmentId {
        self.segments.alloc(segment)
    }

    pub fn current_segment_ref(&self) -> Option<&Segment> {
        self.current_segment.and_then(|id| self.segments.get(id))
    }

    pub fn current_segment_mut(&mut self) -> Option<&mut Segment> {
        self.current_segment
            .and_then(|id| self.segments.get_mut(id))
    }

    pub fn register_callback(&mut self, callback: Callback) -> CallbackId {
        let id = CallbackId::fresh();
        self.callbacks.insert(id, callback);
        id
    }

    pub(crate) fn push_frame_on_current(&mut self, frame: Frame) -> Result<(), VMError> {
        match self.current_segment_mut() {
            Some(seg) => {
                seg.push_frame(frame);
                Ok(())
            }
            None => Err(VMError::internal("no current segment to push a frame on")),
        }
    }

    // -- one-shot tracking -------------------------------------------------

    pub fn is_consumed(&self, id: ContinuationId) -> bool {
        self.consumed_continuations.contains(&id)
    }

    pub fn mark_consumed(&mut self, id: ContinuationId) {
        self.consumed_continuations.insert(id);
    }

    pub fn capture_continuation(
        &self,
        dispatch_id: Option<crate::ids::DispatchId>,
    ) -> Option<Continuation> {
        let segment = self.current_segment_ref()?;
        Some(Continuation::capture(segment, dispatch_id))
    }

    pub fn install_handler(&mut self, marker: Marker, entry: HandlerEntry) {
        self.handlers.insert(marker, entry);
    }

    pub fn installed_handler_markers(&self) -> Vec<Marker> {
        self.handlers.keys().copied().collect()
    }

    pub fn dispatch_depth(&self) -> usize {
        self.dispatch_stack.len()
    }

    // -- step machine ------------------------------------------------------

    /// Advance the VM by exactly one mode transition.
    pub fn step(&mut self) -> StepEvent {
        self.step_counter += 1;

        if let Some(call) = self.queued_host_call.take() {
            return StepEvent::NeedsHost(call);
        }

        if self.debug.is_enabled() {
            trace!(
                step = self.step_counter,
                mode = self.mode_kind(),
                segment = ?self.current_segment,
                dispatch_depth = self.dispatch_stack.len(),
                "step"
            );
        }

        match &self.mode {
            Mode::Deliver(_) | Mode::Throw(_) => self.step_deliver_or_throw(),
            Mode::HandleYield(_) => self.step_handle_yield(),
            Mode::Return(_) => self.step_return(),
        }
    }

    fn mode_kind(&self) -> &'static str {
        match &self.mode {
            Mode::Deliver(_) => "Deliver",
            Mode::Throw(_) => "Throw",
            Mode::HandleYield(y) => y.kind(),
            Mode::Return(_) => "Return",
        }
    }

    fn step_deliver_or_throw(&mut self) -> StepEvent {
        let seg_id = match self.current_segment {
            Some(id) => id,
            None => return StepEvent::Error(VMError::internal("no current segment")),
        };

        let (frame, caller) = {
            let segment = match self.segments.get_mut(seg_id) {
                Some(s) => s,
                None => return StepEvent::Error(VMError::invalid_segment("segment not found")),
            };
            (segment.pop_frame(), segment.caller)
        };

        let mode = self.mode.clone();

        let Some(frame) = frame else {
            // Frame stack exhausted: a delivery becomes the segment's
            // return value, a throw walks to the caller unchanged.
            return match mode {
                Mode::Deliver(v) => {
                    self.mode = Mode::Return(v);
                    StepEvent::Continue
                }
                Mode::Throw(exc) => match caller {
                    Some(caller_id) => {
                        self.current_segment = Some(caller_id);
                        StepEvent::Continue
                    }
                    None => StepEvent::Error(VMError::uncaught_exception(exc)),
                },
                _ => unreachable!("step_deliver_or_throw outside Deliver/Throw"),
            };
        };

        match frame {
            Frame::NativeReturn { cb } => {
                let callback = self.callbacks.remove(&cb);
                match mode {
                    Mode::Deliver(v) => {
                        let Some(callback) = callback else {
                            return StepEvent::Error(VMError::internal("callback not found"));
                        };
                        self.mode = callback(v, self);
                        StepEvent::Continue
                    }
                    // Native-return frames do not catch; the consumed
                    // callback is dropped and the throw keeps walking.
                    Mode::Throw(_) => StepEvent::Continue,
                    _ => unreachable!(),
                }
            }

            Frame::NativeProgram { program } => {
                let step = {
                    let mut guard = program.lock().expect("handler program lock poisoned");
                    match mode {
                        Mode::Deliver(v) => guard.resume(v, &mut self.store),
                        Mode::Throw(e) => guard.throw(e, &mut self.store),
                        _ => unreachable!(),
                    }
                };
                self.apply_handler_step(program, step);
                StepEvent::Continue
            }

            Frame::HostCoroutine {
                coroutine,
                started,
                metadata,
            } => {
                let method = match mode {
                    Mode::Deliver(v) => {
                        if started {
                            CoroMethod::Send { value: v }
                        } else {
                            CoroMethod::Next
                        }
                    }
                    Mode::Throw(e) => CoroMethod::Throw { exc: e },
                    _ => unreachable!(),
                };
                self.pending_host = Some(PendingHost::StepCoroutine {
                    coroutine: coroutine.clone(),
                    metadata,
                });
                StepEvent::NeedsHost(HostCall::StepCoroutine { coroutine, method })
            }
        }
    }

    fn step_handle_yield(&mut self) -> StepEvent {
        let yielded = match &self.mode {
            Mode::HandleYield(y) => y.clone(),
            _ => return StepEvent::Error(VMError::internal("invalid mode for handle_yield")),
        };

        match yielded {
            Yielded::Effect(effect) => match self.start_dispatch(effect) {
                Ok(event) => event,
                Err(e) => StepEvent::Error(e),
            },

            Yielded::Ctrl(ctrl) => self.handle_ctrl(ctrl),

            Yielded::Program(factory) => {
                self.pending_host = Some(PendingHost::StartProgramFrame { metadata: None });
                StepEvent::NeedsHost(HostCall::StartProgram { program: factory })
            }

            Yielded::Unknown(host) => {
                self.mode = Mode::Throw(VmException::type_error(format!(
                    "cannot interpret yielded host object {host:?}"
                )));
                StepEvent::Continue
            }
        }
    }

    fn step_return(&mut self) -> StepEvent {
        let value = match &self.mode {
            Mode::Return(v) => v.clone(),
            _ => return StepEvent::Error(VMError::internal("invalid mode for return")),
        };

        let seg_id = match self.current_segment {
            Some(id) => id,
            None => return StepEvent::Done(value),
        };

        let caller = self.segments.get(seg_id).and_then(|s| s.caller);

        match caller {
            Some(caller_id) => {
                self.current_segment = Some(caller_id);
                self.mode = Mode::Deliver(value);
                StepEvent::Continue
            }
            None => StepEvent::Done(value),
        }
    }

    // -- native handler program stepping -----------------------------------

    pub(crate) fn apply_handler_step(&mut self, program: HandlerProgramRef, step: HandlerStep) {
        match step {
            HandlerStep::Yield(expr) => {
                if let Some(seg) = self.current_segment_mut() {
                    seg.push_frame(Frame::native_program(program));
                }
                self.mode = Mode::HandleYield(classify(expr));
            }
            HandlerStep::Return(v) => {
                self.mode = Mode::Deliver(v);
            }
            HandlerStep::Throw(e) => {
                self.mode = Mode::Throw(e);
            }
            HandlerStep::NeedsHost { call } => {
                self.pending_host = Some(PendingHost::NativeProgram { program });
                self.queued_host_call = Some(call);
            }
        }
    }

    /// Push the hook that detects the handler's implicit return at its
    /// prompt boundary.
    pub(crate) fn push_handler_return_hook(&mut self) {
        let cb = self.register_callback(Box::new(|value, vm| vm.handle_handler_return(value)));
        if let Some(seg) = self.current_segment_mut() {
            seg.push_frame(Frame::native_return(cb));
        }
    }

    // -- host result routing -----------------------------------------------

    /// Consume the pending host call and route `outcome` back into the
    /// step machine.
    pub fn receive_host_result(&mut self, outcome: HostCallOutcome) {
        let Some(pending) = self.pending_host.take() else {
            self.protocol_violation("host result received with no pending host call");
            return;
        };

        match (pending, outcome) {
            (PendingHost::StartProgramFrame { metadata }, HostCallOutcome::Value(v)) => {
                match coroutine_from_value(&v) {
                    Some(coroutine) => {
                        let frame = Frame::host_coroutine(coroutine, metadata);
                        if let Some(seg) = self.current_segment_mut() {
                            seg.push_frame(frame);
                        }
                        self.mode = Mode::Deliver(Value::Unit);
                    }
                    None => self.protocol_violation("StartProgram outcome was not a coroutine"),
                }
            }
            (PendingHost::StartProgramFrame { .. }, HostCallOutcome::GenError(e)) => {
                self.mode = Mode::Throw(e);
            }

            (PendingHost::CallFuncReturn { metadata }, HostCallOutcome::Value(v)) => {
                match coroutine_from_value(&v) {
                    Some(coroutine) => {
                        let frame = Frame::host_coroutine(coroutine, metadata);
                        if let Some(seg) = self.current_segment_mut() {
                            seg.push_frame(frame);
                        }
                        self.mode = Mode::Deliver(Value::Unit);
                    }
                    None => {
                        self.mode = Mode::Deliver(v);
                    }
                }
            }
            // A binder returned a deferred expression; evaluate it in place.
            (PendingHost::CallFuncReturn { .. }, HostCallOutcome::GenYield(y)) => {
                self.mode = Mode::HandleYield(y);
            }
            (PendingHost::CallFuncReturn { .. }, HostCallOutcome::GenError(e)) => {
                self.mode = Mode::Throw(e);
            }

            (
                PendingHost::StepCoroutine {
                    coroutine,
                    metadata,
                },
                HostCallOutcome::GenYield(y),
            ) => {
                if let Some(seg) = self.current_segment_mut() {
                    seg.push_frame(Frame::HostCoroutine {
                        coroutine,
                        started: true,
                        metadata,
                    });
                }
                self.mode = Mode::HandleYield(y);
            }
            (PendingHost::StepCoroutine { .. }, HostCallOutcome::GenReturn(v)) => {
                self.mode = Mode::Deliver(v);
            }
            (PendingHost::StepCoroutine { .. }, HostCallOutcome::GenError(e)) => {
                self.mode = Mode::Throw(e);
            }

            (PendingHost::CallHandler { .. }, HostCallOutcome::Value(v)) => {
                match coroutine_from_value(&v) {
                    Some(coroutine) => {
                        self.push_handler_return_hook();
                        let frame = Frame::host_coroutine(coroutine, None);
                        if let Some(seg) = self.current_segment_mut() {
                            seg.push_frame(frame);
                        }
                        self.mode = Mode::Deliver(Value::Unit);
                    }
                    None => {
                        self.protocol_violation("CallHandler outcome was not a coroutine")
                    }
                }
            }
            (PendingHost::CallHandler { .. }, HostCallOutcome::GenError(e)) => {
                self.mode = Mode::Throw(e);
            }

            (PendingHost::NativeProgram { program }, HostCallOutcome::Value(v)) => {
                let step = {
                    let mut guard = program.lock().expect("handler program lock poisoned");
                    guard.resume(v, &mut self.store)
                };
                self.apply_handler_step(program, step);
            }
            (PendingHost::NativeProgram { .. }, HostCallOutcome::GenError(e)) => {
                self.mode = Mode::Throw(e);
            }

            (PendingHost::AsyncEscape, HostCallOutcome::Value(v)) => {
                self.mode = Mode::Deliver(v);
            }
            (PendingHost::AsyncEscape, HostCallOutcome::GenError(e)) => {
                self.mode = Mode::Throw(e);
            }

            (pending, outcome) => {
                self.protocol_violation(&format!(
                    "mismatched host outcome: pending={} outcome={}",
                    pending.kind(),
                    outcome_kind(&outcome)
                ));
            }
        }
    }

    /// A mismatched pending/outcome pair is a bug in the host wrapper.
    fn protocol_violation(&mut self, message: &str) {
        debug_assert!(false, "boundary protocol violation: {message}");
        self.mode = Mode::Throw(VmException::runtime_error(format!(
            "boundary protocol violation: {message}"
        )));
    }
}

fn outcome_kind(outcome: &HostCallOutcome) -> &'static str {
    match outcome {
        HostCallOutcome::Value(_) => "Value",
        HostCallOutcome::GenYield(_) => "GenYield",
        HostCallOutcome::GenReturn(_) => "GenReturn",
        HostCallOutcome::GenError(_) => "GenError",
    }
}

pub(crate) fn coroutine_from_value(value: &Value) -> Option<crate::program::CoroutineRef> {
    value.as_host().and_then(|h| h.as_coroutine())
}

impl Default for VM {
    fn default() -> Self {
        Self::new()
    }
}
