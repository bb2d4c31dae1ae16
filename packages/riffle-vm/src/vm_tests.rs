//! VM-level and end-to-end tests.

use std::collections::HashMap;

use pretty_assertions::assert_eq;

use crate::continuation::Continuation;
use crate::do_ctrl::{DoCtrl, DoExpr};
use crate::driver::{Mode, StepEvent, VmException};
use crate::effect::Effect;
use crate::error::VMError;
use crate::handler::{
    reader_handler, state_handler, writer_handler, Handler, HostHandler,
};
use crate::host::{HostFn, HostValue};
use crate::ids::{DispatchId, Marker, SegmentId};
use crate::kleisli::{program_kernel, KleisliProgram, ParamSpec, ProgramArg};
use crate::program::{GenCoroutine, GenStep, Next, ProgramFactory};
use crate::run::{RunResult, Runtime};
use crate::scheduler::{self, SchedulerHandler, StoreMergePolicy, StoreMode};
use crate::segment::Segment;
use crate::value::Value;
use crate::vm::VM;
use crate::vm_ctrl::ResumePayload;
use crate::vm_dispatch::DispatchContext;

// -- helpers ----------------------------------------------------------------

/// Opt-in step tracing for debugging test runs:
/// `RIFFLE_TEST_LOG=riffle_vm=trace cargo test -- --nocapture`.
fn init_test_tracing() {
    static INIT: std::sync::Once = std::sync::Once::new();
    INIT.call_once(|| {
        let Ok(filter) = std::env::var("RIFFLE_TEST_LOG") else {
            return;
        };
        let _ = tracing_subscriber::fmt()
            .with_env_filter(tracing_subscriber::EnvFilter::new(filter))
            .with_test_writer()
            .try_init();
    });
}

fn run(
    program: DoExpr,
    handlers: Vec<Handler>,
    env: HashMap<String, Value>,
    store: HashMap<String, Value>,
) -> RunResult {
    init_test_tracing();
    crate::run::run(program, handlers, env, store)
}

fn prog(name: &'static str, f: impl Fn() -> Next + Send + Sync + 'static) -> DoExpr {
    DoExpr::Program(ProgramFactory::new(name, move || {
        GenCoroutine::boxed(f())
    }))
}

fn host_handler(
    name: &'static str,
    f: impl Fn(Effect, Continuation) -> Next + Send + Sync + 'static,
) -> Handler {
    Handler::Host(HostHandler::new(name, move |effect, k| {
        Ok(GenCoroutine::boxed(f(effect, k)))
    }))
}

fn custom_effect() -> Effect {
    Effect::Host(HostValue::new("E", ()))
}

fn no_env() -> HashMap<String, Value> {
    HashMap::new()
}

fn store_with(key: &str, value: i64) -> HashMap<String, Value> {
    HashMap::from([(key.to_string(), Value::Int(value))])
}

fn log_strings(log: &[Value]) -> Vec<String> {
    log.iter()
        .map(|v| v.as_str().unwrap_or("<non-string>").to_string())
        .collect()
}

fn list_ints(value: &Value) -> Vec<i64> {
    value
        .as_list()
        .expect("expected a list value")
        .iter()
        .map(|v| v.as_int().expect("expected an int"))
        .collect()
}

fn make_dummy_continuation() -> Continuation {
    let seg = Segment::new(Marker::fresh(), None, vec![]);
    Continuation::capture(&seg, None)
}

fn dummy_context(
    chain: Vec<Marker>,
    handler_idx: usize,
    completed: bool,
) -> DispatchContext {
    let k_user = make_dummy_continuation();
    DispatchContext {
        dispatch_id: DispatchId::fresh(),
        effect: Effect::get("x"),
        handler_chain: chain,
        handler_idx,
        k_user,
        prompt_seg_id: SegmentId::from_index(0),
        completed,
    }
}

// -- VM basics --------------------------------------------------------------

#[test]
fn test_vm_creation() {
    let vm = VM::new();
    assert!(vm.current_segment.is_none());
    assert_eq!(vm.dispatch_depth(), 0);
    assert!(vm.installed_handler_markers().is_empty());
}

#[test]
fn test_vm_step_return_no_caller() {
    let mut vm = VM::new();
    let seg_id = vm.alloc_segment(Segment::new(Marker::fresh(), None, vec![]));
    vm.current_segment = Some(seg_id);
    vm.mode = Mode::Return(Value::Int(42));

    let event = vm.step();
    assert!(matches!(event, StepEvent::Done(Value::Int(42))));
}

#[test]
fn test_vm_step_return_with_caller() {
    let mut vm = VM::new();
    let marker = Marker::fresh();
    let caller_id = vm.alloc_segment(Segment::new(marker, None, vec![]));
    let child_id = vm.alloc_segment(Segment::new(marker, Some(caller_id), vec![]));

    vm.current_segment = Some(child_id);
    vm.mode = Mode::Return(Value::Int(99));

    let event = vm.step();
    assert!(matches!(event, StepEvent::Continue));
    assert_eq!(vm.current_segment, Some(caller_id));
    assert!(vm.mode.is_deliver());
}

#[test]
fn test_vm_throw_with_no_caller_is_uncaught() {
    let mut vm = VM::new();
    let seg_id = vm.alloc_segment(Segment::new(Marker::fresh(), None, vec![]));
    vm.current_segment = Some(seg_id);
    vm.mode = Mode::Throw(VmException::runtime_error("boom"));

    let event = vm.step();
    assert!(matches!(
        event,
        StepEvent::Error(VMError::UncaughtException { .. })
    ));
}

#[test]
fn test_vm_one_shot_tracking() {
    let mut vm = VM::new();
    let id = crate::ids::ContinuationId::fresh();

    assert!(!vm.is_consumed(id));
    vm.mark_consumed(id);
    assert!(vm.is_consumed(id));
}

// -- P2 / P3: snapshot immutability and scope preservation ------------------

#[test]
fn test_capture_snapshot_ignores_later_mutation() {
    let mut vm = VM::new();
    let marker = Marker::fresh();
    let seg_id = vm.alloc_segment(Segment::new(marker, None, vec![marker]));
    vm.current_segment = Some(seg_id);

    let k = vm.capture_continuation(None).unwrap();
    assert!(k.frames_snapshot.is_empty());

    vm.segments
        .get_mut(seg_id)
        .unwrap()
        .push_frame(crate::frame::Frame::native_return(
            crate::ids::CallbackId::fresh(),
        ));

    assert!(k.frames_snapshot.is_empty());
    assert_eq!(vm.segments.get(seg_id).unwrap().frame_count(), 1);
}

#[test]
fn test_resume_materializes_with_captured_scope_chain() {
    let mut vm = VM::new();
    let m1 = Marker::fresh();
    let m2 = Marker::fresh();
    let seg_id = vm.alloc_segment(Segment::new(m1, None, vec![m1, m2]));
    vm.current_segment = Some(seg_id);

    let k = vm.capture_continuation(None).unwrap();
    let event =
        vm.activate_continuation(k.clone(), ResumePayload::Value(Value::Int(1)), false, "Resume");
    assert!(matches!(event, StepEvent::Continue));

    let new_seg = vm.current_segment_ref().unwrap();
    assert_eq!(new_seg.scope_chain, vec![m1, m2]);
    assert_eq!(new_seg.caller, Some(seg_id));
}

#[test]
fn test_transfer_materializes_without_caller_and_keeps_scope() {
    let mut vm = VM::new();
    let m1 = Marker::fresh();
    let seg_id = vm.alloc_segment(Segment::new(m1, None, vec![m1]));
    vm.current_segment = Some(seg_id);

    let k = vm.capture_continuation(None).unwrap();
    let event =
        vm.activate_continuation(k, ResumePayload::Value(Value::Int(1)), true, "Transfer");
    assert!(matches!(event, StepEvent::Continue));

    let new_seg = vm.current_segment_ref().unwrap();
    assert_eq!(new_seg.scope_chain, vec![m1]);
    assert!(new_seg.caller.is_none());
}

// -- P1: one-shot enforcement ----------------------------------------------

#[test]
fn test_one_shot_violation_on_second_activation() {
    let mut vm = VM::new();
    let marker = Marker::fresh();
    let seg_id = vm.alloc_segment(Segment::new(marker, None, vec![marker]));
    vm.current_segment = Some(seg_id);

    let k = vm.capture_continuation(None).unwrap();
    let id = k.id;

    let first =
        vm.activate_continuation(k.clone(), ResumePayload::Value(Value::Int(1)), false, "Resume");
    assert!(matches!(first, StepEvent::Continue));

    let second =
        vm.activate_continuation(k, ResumePayload::Value(Value::Int(2)), false, "Resume");
    match second {
        StepEvent::Error(VMError::OneShotViolation { continuation_id }) => {
            assert_eq!(continuation_id, id);
        }
        other => panic!("expected OneShotViolation, got {other:?}"),
    }
}

#[test]
fn test_resume_on_unstarted_continuation_is_misuse() {
    let mut vm = VM::new();
    let seg_id = vm.alloc_segment(Segment::new(Marker::fresh(), None, vec![]));
    vm.current_segment = Some(seg_id);

    let k = Continuation::create(DoExpr::pure(Value::Unit), vec![]);
    let event = vm.activate_continuation(k, ResumePayload::Value(Value::Unit), false, "Resume");
    assert!(matches!(
        event,
        StepEvent::Error(VMError::UnstartedMisuse { .. })
    ));
}

// -- P4 / P10: visibility and lazy cleanup ----------------------------------

#[test]
fn test_visible_handlers_no_dispatch() {
    let vm = VM::new();
    let m1 = Marker::fresh();
    let m2 = Marker::fresh();
    let scope = vec![m1, m2];

    assert_eq!(vm.visible_handlers(&scope), scope);
}

#[test]
fn test_visible_handlers_with_busy_boundary() {
    let mut vm = VM::new();
    let m1 = Marker::fresh();
    let m2 = Marker::fresh();
    let m3 = Marker::fresh();

    vm.dispatch_stack
        .push(dummy_context(vec![m1, m2, m3], 1, false));

    assert_eq!(vm.visible_handlers(&[m1, m2, m3]), vec![m3]);
}

#[test]
fn test_visible_handlers_completed_dispatch_is_transparent() {
    let mut vm = VM::new();
    let m1 = Marker::fresh();
    let m2 = Marker::fresh();

    vm.dispatch_stack.push(dummy_context(vec![m1, m2], 0, true));

    assert_eq!(vm.visible_handlers(&[m1, m2]), vec![m1, m2]);
}

#[test]
fn test_older_dispatches_do_not_contribute_busy_markers() {
    let mut vm = VM::new();
    let m1 = Marker::fresh();
    let m2 = Marker::fresh();
    let m3 = Marker::fresh();

    // Older dispatch busy on m1; the top dispatch busy on m2 only.
    vm.dispatch_stack.push(dummy_context(vec![m1, m3], 0, false));
    vm.dispatch_stack.push(dummy_context(vec![m2, m3], 0, false));

    assert_eq!(vm.visible_handlers(&[m1, m2, m3]), vec![m1, m3]);
}

#[test]
fn test_lazy_pop_completed_is_idempotent() {
    let mut vm = VM::new();
    vm.dispatch_stack.push(dummy_context(vec![], 0, true));
    vm.dispatch_stack.push(dummy_context(vec![], 0, true));
    vm.dispatch_stack.push(dummy_context(vec![], 0, false));

    vm.lazy_pop_completed();
    assert_eq!(vm.dispatch_depth(), 3);

    vm.dispatch_stack.last_mut().unwrap().completed = true;
    vm.lazy_pop_completed();
    assert_eq!(vm.dispatch_depth(), 0);

    vm.lazy_pop_completed();
    assert_eq!(vm.dispatch_depth(), 0);
}

#[test]
fn test_delegate_outside_dispatch_errors() {
    let mut vm = VM::new();
    let event = vm.handle_delegate(None);
    assert!(matches!(
        event,
        StepEvent::Error(VMError::DispatchContextMissing { .. })
    ));
}

// -- end-to-end scenario 1: state round trip --------------------------------

#[test]
fn test_state_round_trip() {
    let p = prog("round_trip", || {
        Next::new(|_| {
            GenStep::yield_then(Effect::get("x"), |x| {
                let n = x.as_int().expect("x must be an int");
                GenStep::yield_then(Effect::put("x", Value::Int(n + 1)), move |_| {
                    GenStep::done(Value::Int(n + 1))
                })
            })
        })
    });

    let result = run(p, vec![state_handler()], no_env(), store_with("x", 10));
    assert_eq!(result.result.unwrap().as_int(), Some(11));
    assert_eq!(result.state.get("x").unwrap().as_int(), Some(11));
}

#[test]
fn test_modify_round_trips_through_host_function() {
    let p = prog("modify", || {
        Next::new(|_| {
            let inc = HostFn::unary("inc", |v| Ok(Value::Int(v.as_int().unwrap_or(0) + 5)));
            GenStep::yield_then(Effect::modify("n", inc), |old| GenStep::done(old))
        })
    });

    let result = run(p, vec![state_handler()], no_env(), store_with("n", 10));
    // Modify resumes with the old value; the store holds the new one.
    assert_eq!(result.result.unwrap().as_int(), Some(10));
    assert_eq!(result.state.get("n").unwrap().as_int(), Some(15));
}

// -- end-to-end scenario 2: delegate up one level ---------------------------

#[test]
fn test_delegate_up_one_level() {
    // Outer handler: resume the call site with 42, return what comes back.
    let h0 = host_handler("h0", |_, k| {
        Next::new(move |_| {
            GenStep::yield_then(
                DoCtrl::Resume {
                    continuation: k,
                    value: Value::Int(42),
                },
                GenStep::done,
            )
        })
    });
    // Inner handler: pass the effect outward.
    let h1 = host_handler("h1", |_, _| {
        Next::new(|_| GenStep::yield_then(DoCtrl::Delegate { effect: None }, GenStep::done))
    });

    let p = prog("double", || {
        Next::new(|_| {
            GenStep::yield_then(custom_effect(), |x| {
                GenStep::done(Value::Int(x.as_int().unwrap() * 2))
            })
        })
    });

    let result = run(p, vec![h0, h1], no_env(), HashMap::new());
    assert_eq!(result.result.unwrap().as_int(), Some(84));
}

#[test]
fn test_delegate_with_substituted_effect() {
    // The inner handler rewrites the opaque effect into a state read.
    let h = host_handler("rewrite", |_, _| {
        Next::new(|_| {
            GenStep::yield_then(
                DoCtrl::Delegate {
                    effect: Some(Effect::get("x")),
                },
                GenStep::done,
            )
        })
    });

    let p = prog("p", || {
        Next::new(|_| GenStep::yield_then(custom_effect(), GenStep::done))
    });

    let result = run(p, vec![state_handler(), h], no_env(), store_with("x", 7));
    assert_eq!(result.result.unwrap().as_int(), Some(7));
}

#[test]
fn test_two_delegates_advance_strictly() {
    let delegate = |name: &'static str| {
        host_handler(name, |_, _| {
            Next::new(|_| GenStep::yield_then(DoCtrl::Delegate { effect: None }, GenStep::done))
        })
    };
    let h0 = host_handler("h0", |_, k| {
        Next::new(move |_| {
            GenStep::yield_then(
                DoCtrl::Resume {
                    continuation: k,
                    value: Value::Int(5),
                },
                GenStep::done,
            )
        })
    });

    let p = prog("p", || {
        Next::new(|_| {
            GenStep::yield_then(custom_effect(), |x| {
                GenStep::done(Value::Int(x.as_int().unwrap() + 1))
            })
        })
    });

    let result = run(
        p,
        vec![h0, delegate("mid"), delegate("inner")],
        no_env(),
        HashMap::new(),
    );
    assert_eq!(result.result.unwrap().as_int(), Some(6));
}

#[test]
fn test_delegate_with_no_outer_handler_is_unhandled() {
    let h = host_handler("lonely", |_, _| {
        Next::new(|_| GenStep::yield_then(DoCtrl::Delegate { effect: None }, GenStep::done))
    });
    let p = prog("p", || {
        Next::new(|_| GenStep::yield_then(custom_effect(), GenStep::done))
    });

    let result = run(p, vec![h], no_env(), HashMap::new());
    assert!(matches!(
        result.result,
        Err(VMError::UnhandledEffect { .. })
    ));
}

// -- end-to-end scenario 3: one-shot violation ------------------------------

#[test]
fn test_one_shot_violation_from_handler() {
    let h = host_handler("twice", |_, _| {
        Next::new(|_| {
            GenStep::yield_then(DoCtrl::GetContinuation, |kv| {
                let k1 = kv.as_continuation().unwrap().clone();
                let k2 = k1.clone();
                GenStep::yield_then(
                    DoCtrl::Resume {
                        continuation: k1,
                        value: Value::Int(1),
                    },
                    move |_| {
                        GenStep::yield_then(
                            DoCtrl::Resume {
                                continuation: k2,
                                value: Value::Int(2),
                            },
                            GenStep::done,
                        )
                    },
                )
            })
        })
    });

    // The program logs what the first resume delivered, so the success of
    // the first consumption stays observable through the failure.
    let p = prog("p", || {
        Next::new(|_| {
            GenStep::yield_then(custom_effect(), |x| {
                GenStep::yield_then(Effect::tell(x), |_| GenStep::done(Value::Unit))
            })
        })
    });

    let result = run(p, vec![h, writer_handler()], no_env(), HashMap::new());
    assert!(matches!(
        result.result,
        Err(VMError::OneShotViolation { .. })
    ));
    assert_eq!(result.log.len(), 1);
    assert_eq!(result.log[0].as_int(), Some(1));
}

// -- end-to-end scenario 4: call-macro argument ordering --------------------

#[test]
fn test_call_macro_argument_ordering() {
    let kernel = program_kernel("p", |args, _kwargs| {
        let a = args.first().cloned().unwrap_or(Value::None);
        let b = args.get(1).cloned().unwrap_or(Value::None);
        GenCoroutine::boxed(Next::new(move |_| {
            let b = b.clone();
            GenStep::yield_then(Effect::tell(a.clone()), move |_| {
                GenStep::yield_then(Effect::tell(b), |_| GenStep::done(Value::Int(0)))
            })
        }))
    });
    let p = KleisliProgram::new(
        "p",
        "programs.rs",
        21,
        &[ParamSpec::value("a"), ParamSpec::value("b")],
        kernel,
    );

    let call = p.call(vec![
        ProgramArg::Effect(Effect::ask("x")),
        ProgramArg::Effect(Effect::ask("y")),
    ]);

    let env = HashMap::from([
        ("x".to_string(), Value::String("X".to_string())),
        ("y".to_string(), Value::String("Y".to_string())),
    ]);
    let result = run(
        call,
        vec![reader_handler(), writer_handler()],
        env,
        HashMap::new(),
    );

    assert_eq!(result.result.unwrap().as_int(), Some(0));
    assert_eq!(log_strings(&result.log), vec!["X", "Y"]);
}

// -- end-to-end scenario 5: nested dispatch through busy handler ------------

#[test]
fn test_nested_dispatch_skips_busy_handler() {
    // Outer handler answers any instance of the effect by abandoning the
    // call site with 99.
    let h_outer = host_handler("outer", |_, _| Next::new(|_| GenStep::done(Value::Int(99))));
    // Inner handler re-yields the effect while handling it; busy exclusion
    // must route the nested occurrence to the outer handler.
    let h_inner = host_handler("inner", |_, k| {
        Next::new(move |_| {
            GenStep::yield_then(custom_effect(), move |v| {
                GenStep::yield_then(
                    DoCtrl::Resume {
                        continuation: k,
                        value: v,
                    },
                    GenStep::done,
                )
            })
        })
    });

    let p = prog("p", || {
        Next::new(|_| GenStep::yield_then(custom_effect(), GenStep::done))
    });

    let result = run(p, vec![h_outer, h_inner], no_env(), HashMap::new());
    assert_eq!(result.result.unwrap().as_int(), Some(99));
}

// -- end-to-end scenario 6: transfer abandons the handler -------------------

#[test]
fn test_transfer_ends_handler_cleanly() {
    let h = host_handler("transferrer", |_, k| {
        Next::new(move |_| {
            GenStep::yield_then(
                DoCtrl::Transfer {
                    continuation: k,
                    value: Value::Int(7),
                },
                |_| {
                    // Unreachable: the handler was abandoned by Transfer.
                    GenStep::yield_then(Effect::tell("after-transfer"), |_| {
                        GenStep::done(Value::Unit)
                    })
                },
            )
        })
    });

    let p = prog("p", || {
        Next::new(|_| GenStep::yield_then(custom_effect(), GenStep::done))
    });

    let result = run(p, vec![writer_handler(), h], no_env(), HashMap::new());
    assert_eq!(result.result.unwrap().as_int(), Some(7));
    assert!(result.log.is_empty());
}

// -- P8: handler identity through GetHandlers -------------------------------

#[test]
fn test_get_handlers_preserves_identity() {
    let probe = host_handler("probe", |_, k| {
        Next::new(move |_| {
            GenStep::yield_then(DoCtrl::GetHandlers, move |handlers| {
                GenStep::yield_then(
                    DoCtrl::Resume {
                        continuation: k,
                        value: handlers,
                    },
                    GenStep::done,
                )
            })
        })
    });
    let state = state_handler();

    let p = prog("p", || {
        Next::new(|_| GenStep::yield_then(custom_effect(), GenStep::done))
    });

    let result = run(
        p,
        vec![state.clone(), probe.clone()],
        no_env(),
        HashMap::new(),
    );
    let value = result.result.unwrap();
    let handlers = value.as_handlers().expect("expected handler list");

    // Innermost first: the probe itself, then the state handler; each entry
    // is the same object the caller installed, not a structural copy.
    assert_eq!(handlers.len(), 2);
    assert!(handlers[0].is_same(&probe));
    assert!(handlers[1].is_same(&state));
}

#[test]
fn test_get_continuation_outside_dispatch_errors() {
    let p = prog("p", || {
        Next::new(|_| GenStep::yield_then(DoCtrl::GetContinuation, GenStep::done))
    });
    let result = run(p, vec![], no_env(), HashMap::new());
    assert!(matches!(
        result.result,
        Err(VMError::DispatchContextMissing { .. })
    ));
}

// -- P9: run equals manual nesting ------------------------------------------

#[test]
fn test_run_equals_manual_with_handler_nesting() {
    let make_program = || {
        prog("p", || {
            Next::new(|_| {
                GenStep::yield_then(Effect::ask("greeting"), |g| {
                    GenStep::yield_then(Effect::tell(g), |_| {
                        GenStep::yield_then(Effect::get("count"), |c| {
                            GenStep::done(Value::Int(c.as_int().unwrap_or(0) + 1))
                        })
                    })
                })
            })
        })
    };
    let env = HashMap::from([("greeting".to_string(), Value::String("hi".to_string()))]);

    init_test_tracing();
    let mut via_list = Runtime::new();
    via_list.seed_env(env.clone());
    via_list.seed_state(store_with("count", 4));
    let flat = via_list.run(
        make_program(),
        vec![state_handler(), reader_handler(), writer_handler()],
    );

    let mut via_nesting = Runtime::new();
    via_nesting.seed_env(env);
    via_nesting.seed_state(store_with("count", 4));
    let nested = via_nesting.run(
        DoExpr::with_handler(
            state_handler(),
            DoExpr::with_handler(
                reader_handler(),
                DoExpr::with_handler(writer_handler(), make_program()),
            ),
        ),
        vec![],
    );

    assert_eq!(flat.result.unwrap().as_int(), Some(5));
    assert_eq!(nested.result.unwrap().as_int(), Some(5));
    assert_eq!(log_strings(&flat.log), log_strings(&nested.log));
    assert_eq!(
        flat.state.get("count").unwrap().as_int(),
        nested.state.get("count").unwrap().as_int()
    );
    // Same sequence of host calls, observed at the boundary.
    assert_eq!(via_list.call_trace, via_nesting.call_trace);
}

// -- errors -----------------------------------------------------------------

#[test]
fn test_unhandled_effect_reports_type_name() {
    let p = prog("p", || {
        Next::new(|_| GenStep::yield_then(Effect::ask("missing"), GenStep::done))
    });
    let result = run(p, vec![state_handler()], no_env(), HashMap::new());
    match result.result {
        Err(VMError::UnhandledEffect { effect }) => assert_eq!(effect.type_name(), "Ask"),
        other => panic!("expected UnhandledEffect, got {other:?}"),
    }
}

#[test]
fn test_uncaught_program_exception_surfaces_with_store() {
    let p = prog("p", || {
        Next::new(|_| {
            GenStep::yield_then(Effect::tell("before boom"), |_| {
                GenStep::Raise(VmException::runtime_error("boom"))
            })
        })
    });
    let result = run(p, vec![writer_handler()], no_env(), HashMap::new());
    match result.result {
        Err(VMError::UncaughtException { exception }) => {
            assert_eq!(exception.message(), "boom");
        }
        other => panic!("expected UncaughtException, got {other:?}"),
    }
    // The L2 snapshot still reflects state at the point of failure.
    assert_eq!(log_strings(&result.log), vec!["before boom"]);
}

#[test]
fn test_unknown_yield_is_a_type_error() {
    let p = prog("p", || {
        Next::new(|_| {
            GenStep::yield_then(DoExpr::Opaque(HostValue::new("mystery", 1u8)), GenStep::done)
        })
    });
    let result = run(p, vec![], no_env(), HashMap::new());
    match result.result {
        Err(VMError::UncaughtException { exception }) => assert!(exception.is_type_error()),
        other => panic!("expected a type error, got {other:?}"),
    }
}

// -- composition primitives --------------------------------------------------

#[test]
fn test_pure_delivers_without_dispatch() {
    let result = run(DoExpr::pure(Value::Int(3)), vec![], no_env(), HashMap::new());
    assert_eq!(result.result.unwrap().as_int(), Some(3));
}

#[test]
fn test_map_applies_host_function_to_result() {
    let double = HostFn::unary("double", |v| Ok(Value::Int(v.as_int().unwrap_or(0) * 2)));
    let expr = DoExpr::Ctrl(DoCtrl::Map {
        source: Box::new(DoExpr::Effect(Effect::get("x"))),
        mapper: double,
    });

    let result = run(expr, vec![state_handler()], no_env(), store_with("x", 21));
    assert_eq!(result.result.unwrap().as_int(), Some(42));
}

#[test]
fn test_flat_map_evaluates_binder_expression() {
    let binder = HostFn::new("store_then_read", |mut args, _| {
        let v = args.remove(0);
        Ok(crate::host::HostFnResult::Expr(DoExpr::Ctrl(DoCtrl::Map {
            source: Box::new(DoExpr::Effect(Effect::put("y", v))),
            mapper: HostFn::unary("const", |_| Ok(Value::String("stored".into()))),
        })))
    });
    let expr = DoExpr::Ctrl(DoCtrl::FlatMap {
        source: Box::new(DoExpr::pure(Value::Int(9))),
        binder,
    });

    let result = run(expr, vec![state_handler()], no_env(), HashMap::new());
    assert_eq!(result.result.unwrap().as_str(), Some("stored"));
    assert_eq!(result.state.get("y").unwrap().as_int(), Some(9));
}

#[test]
fn test_eval_runs_in_fresh_scope() {
    // The inner expression sees only the handlers Eval installs, not the
    // outer reader.
    let inner = prog("inner", || {
        Next::new(|_| {
            GenStep::yield_then(Effect::put("from_inner", Value::Int(1)), |_| {
                GenStep::done(Value::String("inner done".into()))
            })
        })
    });
    let p_expr = DoExpr::Ctrl(DoCtrl::Eval {
        expr: Box::new(inner),
        handlers: vec![state_handler()],
    });
    let outer = prog("outer", move || {
        let p_expr = p_expr.clone();
        Next::new(move |_| GenStep::yield_then(p_expr, GenStep::done))
    });

    let result = run(outer, vec![reader_handler()], no_env(), HashMap::new());
    assert_eq!(result.result.unwrap().as_str(), Some("inner done"));
    assert_eq!(result.state.get("from_inner").unwrap().as_int(), Some(1));
}

#[test]
fn test_eval_scope_hides_outer_handlers() {
    let inner = prog("inner", || {
        Next::new(|_| GenStep::yield_then(Effect::ask("x"), GenStep::done))
    });
    let expr = DoExpr::Ctrl(DoCtrl::Eval {
        expr: Box::new(inner),
        handlers: vec![],
    });
    let outer = prog("outer", move || {
        let expr = expr.clone();
        Next::new(move |_| GenStep::yield_then(expr, GenStep::done))
    });

    // A reader is installed outside, but Eval's fresh scope cannot see it.
    let result = run(outer, vec![reader_handler()], no_env(), HashMap::new());
    assert!(matches!(
        result.result,
        Err(VMError::UnhandledEffect { .. })
    ));
}

#[test]
fn test_create_then_resume_continuation() {
    let inner = prog("inner", || {
        Next::new(|_| {
            GenStep::yield_then(Effect::get("seed"), |v| {
                GenStep::done(Value::Int(v.as_int().unwrap_or(0) * 10))
            })
        })
    });
    let create = DoExpr::Ctrl(DoCtrl::CreateContinuation {
        expr: Box::new(inner),
        handlers: vec![state_handler()],
    });

    let p = prog("outer", move || {
        let create = create.clone();
        Next::new(move |_| {
            GenStep::yield_then(create, |kv| {
                let k = kv.as_continuation().unwrap().clone();
                assert!(!k.is_started());
                GenStep::yield_then(
                    DoCtrl::ResumeContinuation {
                        continuation: k,
                        value: Value::Unit,
                    },
                    GenStep::done,
                )
            })
        })
    });

    let result = run(p, vec![], no_env(), store_with("seed", 4));
    assert_eq!(result.result.unwrap().as_int(), Some(40));
}

#[test]
fn test_resume_continuation_twice_is_one_shot_violation() {
    let create = DoExpr::Ctrl(DoCtrl::CreateContinuation {
        expr: Box::new(DoExpr::pure(Value::Int(1))),
        handlers: vec![],
    });
    let p = prog("outer", move || {
        let create = create.clone();
        Next::new(move |_| {
            GenStep::yield_then(create, |kv| {
                let k1 = kv.as_continuation().unwrap().clone();
                let k2 = k1.clone();
                GenStep::yield_then(
                    DoCtrl::ResumeContinuation {
                        continuation: k1,
                        value: Value::Unit,
                    },
                    move |_| {
                        GenStep::yield_then(
                            DoCtrl::ResumeContinuation {
                                continuation: k2,
                                value: Value::Unit,
                            },
                            GenStep::done,
                        )
                    },
                )
            })
        })
    });

    let result = run(p, vec![], no_env(), HashMap::new());
    assert!(matches!(
        result.result,
        Err(VMError::OneShotViolation { .. })
    ));
}

#[test]
fn test_get_call_stack_reports_kleisli_metadata() {
    let kernel = program_kernel("leaf", |_args, _| {
        GenCoroutine::boxed(Next::new(|_| {
            GenStep::yield_then(DoCtrl::GetCallStack, GenStep::done)
        }))
    });
    let leaf = KleisliProgram::new("leaf", "programs.rs", 77, &[], kernel);
    let call = leaf.call(vec![]);

    let p = prog("main", move || {
        let call = call.clone();
        Next::new(move |_| GenStep::yield_then(call, GenStep::done))
    });

    let result = run(p, vec![], no_env(), HashMap::new());
    let Value::CallStack(stack) = result.result.unwrap() else {
        panic!("expected a call stack value");
    };
    assert_eq!(stack[0].function_name, "leaf");
    assert_eq!(stack[0].source_file, "programs.rs");
    assert_eq!(stack[0].source_line, 77);
}

#[test]
fn test_sync_driver_rejects_async_escape() {
    let p = prog("p", || {
        Next::new(|_| {
            GenStep::yield_then(
                DoCtrl::AsyncEscape {
                    action: HostFn::unary("later", Ok),
                },
                GenStep::done,
            )
        })
    });
    let result = run(p, vec![], no_env(), HashMap::new());
    match result.result {
        Err(VMError::UncaughtException { exception }) => assert!(exception.is_type_error()),
        other => panic!("expected type error from sync driver, got {other:?}"),
    }
}

// -- scheduler --------------------------------------------------------------

#[test]
fn test_spawn_and_gather_in_order() {
    let sched = SchedulerHandler::new();

    let task = |n: i64| {
        prog("task", move || {
            Next::new(move |_| GenStep::done(Value::Int(n)))
        })
    };

    let p = prog("main", move || {
        let t1 = task(1);
        let t2 = task(2);
        Next::new(move |_| {
            GenStep::yield_then(scheduler::spawn(t1.clone(), vec![], StoreMode::Shared), {
                let t2 = t2.clone();
                move |h1| {
                    GenStep::yield_then(
                        scheduler::spawn(t2.clone(), vec![], StoreMode::Shared),
                        move |h2| {
                            let wait = scheduler::gather(&[h1.clone(), h2]).unwrap();
                            GenStep::yield_then(wait, GenStep::done)
                        },
                    )
                }
            })
        })
    });

    let result = run(p, vec![sched.handler()], no_env(), HashMap::new());
    assert_eq!(list_ints(&result.result.unwrap()), vec![1, 2]);
}

#[test]
fn test_shared_task_sees_and_mutates_store() {
    let sched = SchedulerHandler::new();

    let task = prog("writer_task", || {
        Next::new(|_| {
            GenStep::yield_then(Effect::put("shared", Value::Int(5)), |_| {
                GenStep::done(Value::Unit)
            })
        })
    });

    let p = prog("main", move || {
        let task = task.clone();
        Next::new(move |_| {
            GenStep::yield_then(
                scheduler::spawn(task.clone(), vec![], StoreMode::Shared),
                |handle| {
                    let wait = scheduler::gather(&[handle]).unwrap();
                    GenStep::yield_then(wait, |_| GenStep::done(Value::Unit))
                },
            )
        })
    });

    let result = run(
        p,
        vec![sched.handler(), state_handler()],
        no_env(),
        HashMap::new(),
    );
    assert!(result.result.is_ok());
    assert_eq!(result.state.get("shared").unwrap().as_int(), Some(5));
}

#[test]
fn test_isolated_task_merges_logs_only() {
    let sched = SchedulerHandler::new();

    let task = prog("isolated_task", || {
        Next::new(|_| {
            GenStep::yield_then(Effect::tell("from task"), |_| {
                GenStep::yield_then(Effect::put("leak", Value::Int(1)), |_| {
                    GenStep::done(Value::Unit)
                })
            })
        })
    });

    let p = prog("main", move || {
        let task = task.clone();
        Next::new(move |_| {
            GenStep::yield_then(Effect::tell("before"), move |_| {
                let task = task.clone();
                GenStep::yield_then(
                    scheduler::spawn(
                        task,
                        vec![],
                        StoreMode::Isolated {
                            merge: StoreMergePolicy::LogsOnly,
                        },
                    ),
                    |handle| {
                        let wait = scheduler::gather(&[handle]).unwrap();
                        GenStep::yield_then(wait, |_| GenStep::done(Value::Unit))
                    },
                )
            })
        })
    });

    let result = run(
        p,
        vec![sched.handler(), state_handler(), writer_handler()],
        no_env(),
        HashMap::new(),
    );
    assert!(result.result.is_ok());
    // Logs merged in gather order; state changes discarded.
    assert_eq!(log_strings(&result.log), vec!["before", "from task"]);
    assert!(result.state.get("leak").is_none());
}

#[test]
fn test_promise_completion_wakes_waiter() {
    let sched = SchedulerHandler::new();

    let p = prog("main", || {
        Next::new(|_| {
            GenStep::yield_then(scheduler::create_promise(), |promise| {
                let completer = {
                    let promise = promise.clone();
                    prog("completer", move || {
                        let promise = promise.clone();
                        Next::new(move |_| {
                            let complete =
                                scheduler::complete_promise(&promise, Value::Int(42)).unwrap();
                            GenStep::yield_then(complete, |_| GenStep::done(Value::Unit))
                        })
                    })
                };
                GenStep::yield_then(
                    scheduler::spawn(completer, vec![], StoreMode::Shared),
                    move |_task| {
                        let wait = scheduler::gather(&[promise.clone()]).unwrap();
                        GenStep::yield_then(wait, GenStep::done)
                    },
                )
            })
        })
    });

    let result = run(p, vec![sched.handler()], no_env(), HashMap::new());
    assert_eq!(list_ints(&result.result.unwrap()), vec![42]);
}

#[test]
fn test_race_returns_first_completion() {
    let sched = SchedulerHandler::new();

    let task = |n: i64| {
        prog("task", move || {
            Next::new(move |_| GenStep::done(Value::Int(n)))
        })
    };

    let p = prog("main", move || {
        let fast = task(10);
        let slow = task(20);
        Next::new(move |_| {
            GenStep::yield_then(
                scheduler::spawn(fast.clone(), vec![], StoreMode::Shared),
                {
                    let slow = slow.clone();
                    move |h1| {
                        GenStep::yield_then(
                            scheduler::spawn(slow.clone(), vec![], StoreMode::Shared),
                            move |h2| {
                                let wait = scheduler::race(&[h1.clone(), h2]).unwrap();
                                GenStep::yield_then(wait, GenStep::done)
                            },
                        )
                    }
                },
            )
        })
    });

    let result = run(p, vec![sched.handler()], no_env(), HashMap::new());
    assert_eq!(result.result.unwrap().as_int(), Some(10));
}

#[test]
fn test_failed_task_propagates_through_gather() {
    let sched = SchedulerHandler::new();

    let failing = prog("failing", || {
        Next::new(|_| GenStep::Raise(VmException::runtime_error("task exploded")))
    });

    let p = prog("main", move || {
        let failing = failing.clone();
        Next::new(move |_| {
            GenStep::yield_then(
                scheduler::spawn(failing.clone(), vec![], StoreMode::Shared),
                |handle| {
                    let wait = scheduler::gather(&[handle]).unwrap();
                    GenStep::yield_then(wait, GenStep::done)
                },
            )
        })
    });

    let result = run(p, vec![sched.handler()], no_env(), HashMap::new());
    match result.result {
        Err(VMError::UncaughtException { exception }) => {
            assert_eq!(exception.message(), "task exploded");
        }
        other => panic!("expected task failure, got {other:?}"),
    }
}
