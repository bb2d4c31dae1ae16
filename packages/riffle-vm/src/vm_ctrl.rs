//! Control-primitive implementations.

use tracing::debug;

use crate::boundary::{classify, Yielded};
use crate::continuation::Continuation;
use crate::do_ctrl::{CallArg, DoCtrl, DoExpr};
use crate::driver::{Mode, StepEvent, VmException};
use crate::error::VMError;
use crate::frame::{CallMetadata, Frame};
use crate::handler::{Handler, HandlerEntry};
use crate::host::HostFn;
use crate::host_call::{HostCall, PendingHost};
use crate::ids::{Marker, SegmentId};
use crate::segment::{Segment, SegmentKind};
use crate::value::Value;
use crate::vm::VM;

/// What to deliver into a materialized continuation.
#[derive(Debug, Clone)]
pub(crate) enum ResumePayload {
    Value(Value),
    Exception(VmException),
}

impl VM {
    pub(crate) fn handle_ctrl(&mut self, ctrl: DoCtrl) -> StepEvent {
        match ctrl {
            DoCtrl::Pure { value } => {
                self.mode = Mode::Deliver(value);
                StepEvent::Continue
            }

            // Map and FlatMap lower identically: evaluate the source, then
            // feed it to the host callable. Whether the callable's result is
            // a plain value or another expression is decided by the
            // CallFuncReturn routing.
            DoCtrl::Map { source, mapper } => self.eval_then_call(*source, mapper),
            DoCtrl::FlatMap { source, binder } => self.eval_then_call(*source, binder),

            DoCtrl::Perform { effect } => match self.start_dispatch(effect) {
                Ok(event) => event,
                Err(e) => StepEvent::Error(e),
            },

            DoCtrl::Resume {
                continuation,
                value,
            } => self.activate_continuation(
                continuation,
                ResumePayload::Value(value),
                false,
                "Resume",
            ),

            DoCtrl::ResumeThrow {
                continuation,
                exception,
            } => self.activate_continuation(
                continuation,
                ResumePayload::Exception(exception),
                false,
                "ResumeThrow",
            ),

            DoCtrl::Transfer {
                continuation,
                value,
            } => self.activate_continuation(
                continuation,
                ResumePayload::Value(value),
                true,
                "Transfer",
            ),

            DoCtrl::TransferThrow {
                continuation,
                exception,
            } => self.activate_continuation(
                continuation,
                ResumePayload::Exception(exception),
                true,
                "TransferThrow",
            ),

            DoCtrl::WithHandler { handler, expr } => self.handle_with_handler(handler, *expr),

            DoCtrl::Delegate { effect } => self.handle_delegate(effect),

            DoCtrl::Call {
                f,
                args,
                kwargs,
                metadata,
            } => self.handle_call(f, args, kwargs, metadata),

            DoCtrl::Eval { expr, handlers } => {
                let caller = self.current_segment;
                self.install_scoped(*expr, handlers, caller)
            }

            DoCtrl::CreateContinuation { expr, handlers } => {
                self.mode = Mode::Deliver(Value::Continuation(Continuation::create(
                    *expr, handlers,
                )));
                StepEvent::Continue
            }

            DoCtrl::ResumeContinuation {
                continuation,
                value,
            } => self.handle_resume_continuation(continuation, value),

            DoCtrl::GetContinuation => self.handle_get_continuation(),

            DoCtrl::GetHandlers => self.handle_get_handlers(),

            DoCtrl::GetCallStack => {
                let stack = self.collect_call_stack();
                self.mode = Mode::Deliver(Value::CallStack(stack));
                StepEvent::Continue
            }

            DoCtrl::AsyncEscape { action } => {
                self.pending_host = Some(PendingHost::AsyncEscape);
                StepEvent::NeedsHost(HostCall::CallAsync {
                    func: action,
                    args: vec![],
                })
            }
        }
    }

    // -- continuation activation -------------------------------------------

    /// Materialize a captured continuation and switch to it.
    ///
    /// Resume attaches the current segment as caller; Transfer severs it.
    /// Both consume the continuation id and complete the owning dispatch
    /// when the target is its call site.
    pub(crate) fn activate_continuation(
        &mut self,
        k: Continuation,
        payload: ResumePayload,
        transfer: bool,
        operation: &'static str,
    ) -> StepEvent {
        if !k.started {
            return StepEvent::Error(VMError::unstarted_misuse(operation, k.id));
        }
        if self.is_consumed(k.id) {
            return StepEvent::Error(VMError::one_shot_violation(k.id));
        }
        self.mark_consumed(k.id);
        self.lazy_pop_completed();
        self.check_dispatch_completion(&k);

        debug!(
            continuation = k.id.raw(),
            operation, transfer, "activate continuation"
        );

        let exec_seg = Segment {
            marker: k.marker,
            frames: (*k.frames_snapshot).clone(),
            caller: if transfer { None } else { self.current_segment },
            scope_chain: (*k.scope_chain).clone(),
            kind: SegmentKind::Normal,
        };
        let exec_seg_id = self.alloc_segment(exec_seg);
        self.current_segment = Some(exec_seg_id);

        self.mode = match payload {
            ResumePayload::Value(v) => Mode::Deliver(v),
            ResumePayload::Exception(e) => Mode::Throw(e),
        };
        StepEvent::Continue
    }

    fn handle_resume_continuation(&mut self, k: Continuation, value: Value) -> StepEvent {
        if k.started {
            return self.activate_continuation(
                k,
                ResumePayload::Value(value),
                false,
                "ResumeContinuation",
            );
        }

        // Unstarted: install the handler stack and start the program. The
        // delivered value is ignored.
        if self.is_consumed(k.id) {
            return StepEvent::Error(VMError::one_shot_violation(k.id));
        }
        let Some(program) = k.program else {
            return StepEvent::Error(VMError::unstarted_misuse("ResumeContinuation", k.id));
        };
        self.mark_consumed(k.id);

        let caller = self.current_segment;
        self.install_scoped(*program, k.handlers, caller)
    }

    // -- scoped evaluation --------------------------------------------------

    /// Install `handlers` outermost-first in a fresh scope rooted at
    /// `caller`, then queue `expr` in the innermost body segment.
    pub(crate) fn install_scoped(
        &mut self,
        expr: DoExpr,
        handlers: Vec<Handler>,
        caller: Option<SegmentId>,
    ) -> StepEvent {
        let mut cursor = caller;
        let mut scope: Vec<Marker> = Vec::new();

        for handler in handlers {
            let marker = Marker::fresh();
            let prompt = Segment::new_prompt(marker, cursor, scope.clone(), marker);
            let prompt_id = self.alloc_segment(prompt);
            self.install_handler(marker, HandlerEntry::new(handler, prompt_id));

            scope.insert(0, marker);
            let body = Segment::new(marker, Some(prompt_id), scope.clone());
            cursor = Some(self.alloc_segment(body));
        }

        let target = match cursor {
            Some(id) if cursor != caller => id,
            _ => {
                // No handlers: evaluate in a bare segment.
                let seg = Segment::new(Marker::fresh(), caller, scope);
                self.alloc_segment(seg)
            }
        };

        self.current_segment = Some(target);
        self.mode = Mode::HandleYield(classify(expr));
        StepEvent::Continue
    }

    fn handle_with_handler(&mut self, handler: Handler, expr: DoExpr) -> StepEvent {
        let Some(outside_seg_id) = self.current_segment else {
            return StepEvent::Error(VMError::internal("no current segment for WithHandler"));
        };
        let outside_scope = self
            .segments
            .get(outside_seg_id)
            .map(|s| s.scope_chain.clone())
            .unwrap_or_default();

        let marker = Marker::fresh();
        let prompt = Segment::new_prompt(marker, Some(outside_seg_id), outside_scope.clone(), marker);
        let prompt_id = self.alloc_segment(prompt);
        self.install_handler(marker, HandlerEntry::new(handler, prompt_id));

        let mut body_scope = vec![marker];
        body_scope.extend(outside_scope);
        let body = Segment::new(marker, Some(prompt_id), body_scope);
        let body_id = self.alloc_segment(body);

        self.current_segment = Some(body_id);
        self.mode = Mode::HandleYield(classify(expr));
        StepEvent::Continue
    }

    // -- call node ----------------------------------------------------------

    /// Resolve the callee and every argument sequentially left-to-right,
    /// then invoke the callee through the host.
    ///
    /// Each unresolved slot re-enters the engine: a native-return callback
    /// rebuilds the Call node with the slot filled and evaluation picks up
    /// at the next slot.
    fn handle_call(
        &mut self,
        f: CallArg,
        args: Vec<CallArg>,
        kwargs: Vec<(String, CallArg)>,
        metadata: CallMetadata,
    ) -> StepEvent {
        enum Slot {
            F,
            Arg(usize),
            Kw(usize),
        }

        let slot = if !f.is_resolved() {
            Some(Slot::F)
        } else if let Some(idx) = args.iter().position(|a| !a.is_resolved()) {
            Some(Slot::Arg(idx))
        } else if let Some(idx) = kwargs.iter().position(|(_, a)| !a.is_resolved()) {
            Some(Slot::Kw(idx))
        } else {
            None
        };

        if let Some(slot) = slot {
            let mut f = f;
            let mut args = args;
            let mut kwargs = kwargs;
            let pending_expr = match &slot {
                Slot::F => std::mem::replace(&mut f, CallArg::Value(Value::Unit)),
                Slot::Arg(idx) => std::mem::replace(&mut args[*idx], CallArg::Value(Value::Unit)),
                Slot::Kw(idx) => {
                    std::mem::replace(&mut kwargs[*idx].1, CallArg::Value(Value::Unit))
                }
            };
            let CallArg::Expr(expr) = pending_expr else {
                return StepEvent::Error(VMError::internal("unresolved call slot was a value"));
            };

            let cb = self.register_callback(Box::new(move |value, _vm| {
                match slot {
                    Slot::F => f = CallArg::Value(value),
                    Slot::Arg(idx) => args[idx] = CallArg::Value(value),
                    Slot::Kw(idx) => kwargs[idx].1 = CallArg::Value(value),
                }
                Mode::HandleYield(Yielded::Ctrl(DoCtrl::Call {
                    f,
                    args,
                    kwargs,
                    metadata,
                }))
            }));
            if let Err(e) = self.push_frame_on_current(Frame::native_return(cb)) {
                return StepEvent::Error(e);
            }
            self.mode = Mode::HandleYield(classify(*expr));
            return StepEvent::Continue;
        }

        // Everything resolved: extract the callee and cross the boundary.
        let f_value = match f {
            CallArg::Value(v) => v,
            CallArg::Expr(_) => unreachable!("checked above"),
        };
        let Some(func) = f_value
            .as_host()
            .and_then(|h| h.downcast_ref::<HostFn>().cloned())
        else {
            self.mode = Mode::Throw(VmException::type_error(format!(
                "call target is not callable (got {})",
                f_value.kind()
            )));
            return StepEvent::Continue;
        };

        let resolved_args: Vec<Value> = args
            .into_iter()
            .map(|a| match a {
                CallArg::Value(v) => v,
                CallArg::Expr(_) => unreachable!("checked above"),
            })
            .collect();
        let resolved_kwargs: Vec<(String, Value)> = kwargs
            .into_iter()
            .map(|(name, a)| match a {
                CallArg::Value(v) => (name, v),
                CallArg::Expr(_) => unreachable!("checked above"),
            })
            .collect();

        self.pending_host = Some(PendingHost::CallFuncReturn {
            metadata: Some(metadata),
        });
        StepEvent::NeedsHost(HostCall::CallFunction {
            func,
            args: resolved_args,
            kwargs: resolved_kwargs,
        })
    }

    /// Shared lowering for Map/FlatMap: evaluate `source`, then call `func`
    /// with the result.
    fn eval_then_call(&mut self, source: DoExpr, func: HostFn) -> StepEvent {
        let metadata = CallMetadata::new(func.name().to_string(), "<native>", 0);
        let cb = self.register_callback(Box::new(move |value, _vm| {
            Mode::HandleYield(Yielded::Ctrl(DoCtrl::Call {
                f: CallArg::Value(Value::Host(crate::host::HostValue::new(
                    func.name().to_string(),
                    func,
                ))),
                args: vec![CallArg::Value(value)],
                kwargs: vec![],
                metadata,
            }))
        }));
        if let Err(e) = self.push_frame_on_current(Frame::native_return(cb)) {
            return StepEvent::Error(e);
        }
        self.mode = Mode::HandleYield(classify(source));
        StepEvent::Continue
    }

    // -- dispatch introspection ---------------------------------------------

    fn handle_get_continuation(&mut self) -> StepEvent {
        self.lazy_pop_completed();
        let Some(top) = self.dispatch_stack.last() else {
            return StepEvent::Error(VMError::dispatch_context_missing("GetContinuation"));
        };
        self.mode = Mode::Deliver(Value::Continuation(top.k_user.clone()));
        StepEvent::Continue
    }

    fn handle_get_handlers(&mut self) -> StepEvent {
        self.lazy_pop_completed();
        let Some(top) = self.dispatch_stack.last() else {
            return StepEvent::Error(VMError::dispatch_context_missing("GetHandlers"));
        };
        let chain = top.handler_chain.clone();

        let mut handlers = Vec::with_capacity(chain.len());
        for marker in chain {
            let Some(entry) = self.handlers.get(&marker) else {
                return StepEvent::Error(VMError::handler_not_found(marker));
            };
            // Clone of the registry handler: identity (Arc / host object)
            // is preserved, which is the contract GetHandlers must keep.
            handlers.push(entry.handler.clone());
        }
        self.mode = Mode::Deliver(Value::Handlers(handlers));
        StepEvent::Continue
    }

    /// Walk caller links from the current segment collecting call metadata
    /// from host-coroutine frames, innermost first. Pure engine-side walk.
    pub(crate) fn collect_call_stack(&self) -> Vec<CallMetadata> {
        let mut stack = Vec::new();
        let mut cursor = self.current_segment;
        while let Some(seg_id) = cursor {
            let Some(seg) = self.segments.get(seg_id) else {
                break;
            };
            for frame in seg.frames.iter().rev() {
                if let Some(meta) = frame.metadata() {
                    stack.push(meta.clone());
                }
            }
            cursor = seg.caller;
        }
        stack
    }
}
