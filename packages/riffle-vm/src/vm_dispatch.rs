//! Effect dispatch: handler search, busy boundaries, delegation, and
//! completion bookkeeping.

use std::collections::HashSet;

use tracing::debug;

use crate::continuation::Continuation;
use crate::driver::{Mode, StepEvent};
use crate::effect::Effect;
use crate::error::VMError;
use crate::handler::{Handler, HandlerEntry};
use crate::host_call::{HostCall, PendingHost};
use crate::ids::{DispatchId, Marker, SegmentId};
use crate::segment::Segment;
use crate::value::Value;
use crate::vm::VM;

/// Bookkeeping for one in-flight effect dispatch.
#[derive(Debug, Clone)]
pub struct DispatchContext {
    pub dispatch_id: DispatchId,
    pub effect: Effect,
    /// Visible markers at dispatch time, innermost first.
    pub handler_chain: Vec<Marker>,
    /// Position in `handler_chain`; advanced by Delegate.
    pub handler_idx: usize,
    /// Captured call-site continuation.
    pub k_user: Continuation,
    /// Prompt boundary of the root handler of this dispatch.
    pub prompt_seg_id: SegmentId,
    /// Set once a terminating action has fired.
    pub completed: bool,
}

impl VM {
    pub fn current_scope_chain(&self) -> Vec<Marker> {
        self.current_segment_ref()
            .map(|seg| seg.scope_chain.clone())
            .unwrap_or_default()
    }

    /// Pop completed dispatches off the top of the stack. Idempotent; must
    /// run before anything that inspects the top of the dispatch stack.
    pub fn lazy_pop_completed(&mut self) {
        while let Some(top) = self.dispatch_stack.last() {
            if top.completed {
                self.dispatch_stack.pop();
            } else {
                break;
            }
        }
    }

    /// Top-only busy exclusion: handlers at indices `0..=handler_idx` of the
    /// topmost live dispatch are invisible; handlers busy in older
    /// dispatches stay visible.
    pub fn visible_handlers(&self, scope_chain: &[Marker]) -> Vec<Marker> {
        let Some(top) = self.dispatch_stack.last() else {
            return scope_chain.to_vec();
        };

        if top.completed || self.consumed_continuations.contains(&top.k_user.id) {
            return scope_chain.to_vec();
        }

        let busy: HashSet<Marker> = top.handler_chain[..=top.handler_idx]
            .iter()
            .copied()
            .collect();

        scope_chain
            .iter()
            .copied()
            .filter(|marker| !busy.contains(marker))
            .collect()
    }

    pub fn find_matching_handler(
        &self,
        handler_chain: &[Marker],
        effect: &Effect,
    ) -> Result<Option<(usize, Marker, HandlerEntry)>, VMError> {
        for (idx, &marker) in handler_chain.iter().enumerate() {
            let Some(entry) = self.handlers.get(&marker) else {
                return Err(VMError::handler_not_found(marker));
            };
            if entry.handler.can_handle(effect) {
                return Ok(Some((idx, marker, entry.clone())));
            }
        }
        Ok(None)
    }

    pub fn start_dispatch(&mut self, effect: Effect) -> Result<StepEvent, VMError> {
        self.lazy_pop_completed();

        let scope_chain = self.current_scope_chain();
        let handler_chain = self.visible_handlers(&scope_chain);

        let Some((handler_idx, handler_marker, entry)) =
            self.find_matching_handler(&handler_chain, &effect)?
        else {
            return Err(VMError::unhandled_effect(effect));
        };

        let dispatch_id = DispatchId::fresh();
        let prompt_seg_id = entry.prompt_seg_id;

        let k_user = self
            .capture_continuation(Some(dispatch_id))
            .ok_or_else(|| VMError::internal("no current segment during dispatch"))?;

        debug!(
            dispatch = dispatch_id.raw(),
            effect = effect.type_name(),
            handler = entry.handler.name(),
            handler_idx,
            "start dispatch"
        );

        // Fresh execution segment for the handler; it returns to the prompt
        // boundary and sees the call site's evidence vector.
        let handler_seg = Segment::new(handler_marker, Some(prompt_seg_id), scope_chain);
        let handler_seg_id = self.alloc_segment(handler_seg);
        self.current_segment = Some(handler_seg_id);

        self.dispatch_stack.push(DispatchContext {
            dispatch_id,
            effect: effect.clone(),
            handler_chain,
            handler_idx,
            k_user: k_user.clone(),
            prompt_seg_id,
            completed: false,
        });

        Ok(self.invoke_handler(entry.handler, effect, k_user))
    }

    /// Invoke a handler in the current (freshly created) handler segment.
    pub(crate) fn invoke_handler(
        &mut self,
        handler: Handler,
        effect: Effect,
        k_user: Continuation,
    ) -> StepEvent {
        match handler {
            Handler::Native(factory) => {
                self.push_handler_return_hook();
                let mut program = factory.instantiate();
                let step = program.start(effect, k_user, &mut self.store);
                let program_ref = crate::handler::handler_program_ref(program);
                self.apply_handler_step(program_ref, step);
                StepEvent::Continue
            }
            Handler::Host(host_handler) => {
                self.pending_host = Some(PendingHost::CallHandler {
                    k_user: k_user.clone(),
                    effect: effect.clone(),
                });
                StepEvent::NeedsHost(HostCall::CallHandler {
                    handler: host_handler,
                    effect,
                    continuation: k_user,
                })
            }
        }
    }

    /// Mark the owning dispatch completed when `k` is its call-site
    /// continuation. Both ids must match; this keeps unrelated continuations
    /// (e.g. scheduler-held handles) from completing a dispatch by accident.
    pub(crate) fn check_dispatch_completion(&mut self, k: &Continuation) {
        let Some(dispatch_id) = k.dispatch_id else {
            return;
        };
        if let Some(ctx) = self
            .dispatch_stack
            .iter_mut()
            .rev()
            .find(|ctx| ctx.dispatch_id == dispatch_id)
        {
            if ctx.k_user.id == k.id {
                ctx.completed = true;
            }
        }
    }

    /// Advance the current dispatch to the next outer handler.
    ///
    /// The delegating handler is in tail position: its frames are cleared
    /// and it will not resume. The outer handler's segment returns to the
    /// inner handler's segment, so the outer return value flows back as the
    /// Delegate's yield value on its way out.
    pub(crate) fn handle_delegate(&mut self, effect_override: Option<Effect>) -> StepEvent {
        self.lazy_pop_completed();

        let (handler_chain, start_idx, dispatch_id) = match self.dispatch_stack.last() {
            Some(top) => (
                top.handler_chain.clone(),
                top.handler_idx + 1,
                top.dispatch_id,
            ),
            None => {
                return StepEvent::Error(VMError::dispatch_context_missing("Delegate"));
            }
        };

        let effect = match effect_override {
            Some(e) => e,
            None => match self.dispatch_stack.last() {
                Some(top) => top.effect.clone(),
                None => unreachable!(),
            },
        };

        let inner_seg_id = self.current_segment;
        if let Some(seg) = self.current_segment_mut() {
            seg.frames.clear();
        }

        for idx in start_idx..handler_chain.len() {
            let marker = handler_chain[idx];
            let Some(entry) = self.handlers.get(&marker) else {
                return StepEvent::Error(VMError::handler_not_found(marker));
            };
            if !entry.handler.can_handle(&effect) {
                continue;
            }
            let handler = entry.handler.clone();

            debug!(
                dispatch = dispatch_id.raw(),
                effect = effect.type_name(),
                to_idx = idx,
                handler = handler.name(),
                "delegate"
            );

            let k_user = {
                let top = self
                    .dispatch_stack
                    .last_mut()
                    .expect("dispatch context checked above");
                top.handler_idx = idx;
                top.effect = effect.clone();
                top.k_user.clone()
            };

            let scope_chain = self.current_scope_chain();
            let handler_seg = Segment::new(marker, inner_seg_id, scope_chain);
            let handler_seg_id = self.alloc_segment(handler_seg);
            self.current_segment = Some(handler_seg_id);

            return self.invoke_handler(handler, effect, k_user);
        }

        StepEvent::Error(VMError::unhandled_effect(effect))
    }

    /// Implicit handler return, reached through the hook frame pushed under
    /// every handler body.
    ///
    /// If the handler's segment returns straight to the dispatch's prompt
    /// boundary, the dispatch completes and the call site is abandoned (its
    /// continuation id is consumed). The value then flows through the
    /// prompt boundary along the ordinary caller chain.
    pub(crate) fn handle_handler_return(&mut self, value: Value) -> Mode {
        self.lazy_pop_completed();

        let Some(top) = self.dispatch_stack.last() else {
            return Mode::Deliver(value);
        };
        let prompt_seg_id = top.prompt_seg_id;
        let callsite_id = top.k_user.id;
        let dispatch_id = top.dispatch_id;

        // The handler's return reaches the prompt either directly or, after
        // a Delegate, through the cleared segments of inner handlers.
        let mut returns_to_prompt = false;
        let mut cursor = self.current_segment_ref().and_then(|seg| seg.caller);
        let mut hops = 0usize;
        while let Some(seg_id) = cursor {
            if seg_id == prompt_seg_id {
                returns_to_prompt = true;
                break;
            }
            let Some(seg) = self.segments.get(seg_id) else {
                break;
            };
            if seg.has_frames() || hops > self.segments.slot_count() {
                break;
            }
            cursor = seg.caller;
            hops += 1;
        }

        if returns_to_prompt {
            debug!(dispatch = dispatch_id.raw(), "handler returned; dispatch completed");
            if let Some(top) = self.dispatch_stack.last_mut() {
                top.completed = true;
            }
            self.consumed_continuations.insert(callsite_id);
        }

        Mode::Deliver(value)
    }
}
