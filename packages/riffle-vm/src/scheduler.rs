//! Scheduler handler for cooperative multitasking.
//!
//! The scheduler is a native handler program factory that manages tasks and
//! promises and context-switches with Transfer-only semantics so the
//! segment graph does not grow with the number of switches. All program
//! instances of one `SchedulerHandler` share a single state behind
//! `Arc<Mutex<_>>`.
//!
//! Tasks are unstarted continuations whose program is a `TaskBody` wrapper:
//! it yields the task's real program, then converts its outcome (return or
//! raise) into a `TaskCompleted` effect that drives the next switch.

use std::collections::{HashMap, VecDeque};
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use tracing::debug;

use crate::continuation::Continuation;
use crate::do_ctrl::{DoCtrl, DoExpr};
use crate::driver::VmException;
use crate::effect::Effect;
use crate::handler::{
    Handler, HandlerFactoryRef, HandlerProgram, HandlerProgramFactory, HandlerStep,
};
use crate::host::HostValue;
use crate::ids::{PromiseId, TaskId};
use crate::program::{Coroutine, CoroStep};
use crate::store::Store;
use crate::value::Value;

pub const SCHEDULER_HANDLER_NAME: &str = "SchedulerHandler";

pub type TaskResult = Result<Value, VmException>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TaskHandle {
    pub id: TaskId,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct PromiseHandle {
    pub id: PromiseId,
}

/// Queue through which the outside world completes external promises.
#[derive(Clone, Default)]
pub struct ExternalCompletionQueue {
    inner: Arc<Mutex<VecDeque<(PromiseId, TaskResult)>>>,
}

impl ExternalCompletionQueue {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&self, promise: PromiseId, result: TaskResult) {
        self.inner
            .lock()
            .expect("external completion queue poisoned")
            .push_back((promise, result));
    }

    fn drain(&self) -> Vec<(PromiseId, TaskResult)> {
        self.inner
            .lock()
            .expect("external completion queue poisoned")
            .drain(..)
            .collect()
    }
}

impl fmt::Debug for ExternalCompletionQueue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ExternalCompletionQueue").finish_non_exhaustive()
    }
}

/// Promise handle completable from outside the VM.
#[derive(Debug, Clone)]
pub struct ExternalPromise {
    pub id: PromiseId,
    queue: ExternalCompletionQueue,
}

impl ExternalPromise {
    pub fn complete(&self, value: Value) {
        self.queue.push(self.id, Ok(value));
    }

    pub fn fail(&self, error: VmException) {
        self.queue.push(self.id, Err(error));
    }
}

/// Store isolation mode for spawned tasks.
#[derive(Debug, Clone, Copy)]
pub enum StoreMode {
    /// Task shares the VM store; reads and writes are immediately visible.
    Shared,
    /// Task runs on a snapshot taken at spawn; the merge policy decides
    /// what comes back.
    Isolated { merge: StoreMergePolicy },
}

#[derive(Debug, Clone, Copy)]
pub enum StoreMergePolicy {
    /// Merge only logs, appended in gather-item order. State and env
    /// changes are discarded.
    LogsOnly,
}

/// What a task can wait on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Waitable {
    Task(TaskId),
    Promise(PromiseId),
    External(PromiseId),
}

impl Waitable {
    pub fn from_value(value: &Value) -> Option<Waitable> {
        match value {
            Value::Task(h) => Some(Waitable::Task(h.id)),
            Value::Promise(h) => Some(Waitable::Promise(h.id)),
            Value::ExternalPromise(h) => Some(Waitable::External(h.id)),
            _ => None,
        }
    }
}

#[derive(Debug, Clone)]
pub enum SchedulerEffect {
    Spawn {
        program: Box<DoExpr>,
        /// Extra handlers for the task, outermost first. Empty means
        /// "reinstall the spawn site's chain".
        handlers: Vec<Handler>,
        store_mode: StoreMode,
    },
    Gather {
        items: Vec<Waitable>,
    },
    Race {
        items: Vec<Waitable>,
    },
    CreatePromise,
    CompletePromise {
        promise: PromiseId,
        value: Value,
    },
    FailPromise {
        promise: PromiseId,
        error: VmException,
    },
    CreateExternalPromise,
    /// Emitted by `TaskBody` when a task finishes. Internal.
    TaskCompleted {
        task: TaskId,
        result: TaskResult,
    },
    /// Scheduler-specific host effect the core cannot interpret.
    Host(HostValue),
}

impl SchedulerEffect {
    pub fn type_name(&self) -> &'static str {
        match self {
            SchedulerEffect::Spawn { .. } => "Spawn",
            SchedulerEffect::Gather { .. } => "Gather",
            SchedulerEffect::Race { .. } => "Race",
            SchedulerEffect::CreatePromise => "CreatePromise",
            SchedulerEffect::CompletePromise { .. } => "CompletePromise",
            SchedulerEffect::FailPromise { .. } => "FailPromise",
            SchedulerEffect::CreateExternalPromise => "CreateExternalPromise",
            SchedulerEffect::TaskCompleted { .. } => "TaskCompleted",
            SchedulerEffect::Host(_) => "SchedulerHost",
        }
    }
}

// -- effect constructors ----------------------------------------------------

pub fn spawn(program: impl Into<DoExpr>, handlers: Vec<Handler>, store_mode: StoreMode) -> Effect {
    Effect::Scheduler(SchedulerEffect::Spawn {
        program: Box::new(program.into()),
        handlers,
        store_mode,
    })
}

fn waitables(items: &[Value]) -> Result<Vec<Waitable>, VmException> {
    items
        .iter()
        .map(|v| {
            Waitable::from_value(v).ok_or_else(|| {
                VmException::type_error(format!("cannot wait on a {} value", v.kind()))
            })
        })
        .collect()
}

pub fn gather(items: &[Value]) -> Result<Effect, VmException> {
    Ok(Effect::Scheduler(SchedulerEffect::Gather {
        items: waitables(items)?,
    }))
}

pub fn race(items: &[Value]) -> Result<Effect, VmException> {
    Ok(Effect::Scheduler(SchedulerEffect::Race {
        items: waitables(items)?,
    }))
}

pub fn create_promise() -> Effect {
    Effect::Scheduler(SchedulerEffect::CreatePromise)
}

pub fn complete_promise(promise: &Value, value: Value) -> Result<Effect, VmException> {
    match promise {
        Value::Promise(h) => Ok(Effect::Scheduler(SchedulerEffect::CompletePromise {
            promise: h.id,
            value,
        })),
        other => Err(VmException::type_error(format!(
            "complete_promise expects a promise, got {}",
            other.kind()
        ))),
    }
}

pub fn fail_promise(promise: &Value, error: VmException) -> Result<Effect, VmException> {
    match promise {
        Value::Promise(h) => Ok(Effect::Scheduler(SchedulerEffect::FailPromise {
            promise: h.id,
            error,
        })),
        other => Err(VmException::type_error(format!(
            "fail_promise expects a promise, got {}",
            other.kind()
        ))),
    }
}

pub fn create_external_promise() -> Effect {
    Effect::Scheduler(SchedulerEffect::CreateExternalPromise)
}

// -- task body wrapper ------------------------------------------------------

static TASK_COUNTER: AtomicU64 = AtomicU64::new(1);
static PROMISE_COUNTER: AtomicU64 = AtomicU64::new(1);

/// Coroutine wrapped around every spawned program.
///
/// Yields the program itself, then reports the outcome as a TaskCompleted
/// effect. A raise out of the program is converted the same way.
struct TaskBody {
    task: TaskId,
    program: Option<DoExpr>,
    running: bool,
}

impl fmt::Debug for TaskBody {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "TaskBody(task={})", self.task.raw())
    }
}

impl Coroutine for TaskBody {
    fn resume(&mut self, value: Value) -> CoroStep {
        match self.program.take() {
            Some(program) => {
                self.running = true;
                CoroStep::Yield(program)
            }
            None if self.running => {
                self.running = false;
                CoroStep::Yield(DoExpr::Effect(Effect::Scheduler(
                    SchedulerEffect::TaskCompleted {
                        task: self.task,
                        result: Ok(value),
                    },
                )))
            }
            None => CoroStep::Raise(VmException::runtime_error(
                "task body resumed after completion",
            )),
        }
    }

    fn throw(&mut self, exc: VmException) -> CoroStep {
        if self.running {
            self.running = false;
            CoroStep::Yield(DoExpr::Effect(Effect::Scheduler(
                SchedulerEffect::TaskCompleted {
                    task: self.task,
                    result: Err(exc),
                },
            )))
        } else {
            CoroStep::Raise(exc)
        }
    }
}

// -- scheduler state --------------------------------------------------------

#[derive(Debug)]
enum TaskStatus {
    Pending { cont: Continuation },
    Running,
    Done { result: TaskResult },
}

#[derive(Debug)]
enum TaskStoreSlot {
    Shared,
    Isolated {
        store: Option<Store>,
        merge: StoreMergePolicy,
    },
}

#[derive(Debug)]
struct TaskEntry {
    status: TaskStatus,
    store: TaskStoreSlot,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum WaitMode {
    All,
    Any,
}

#[derive(Debug, Clone)]
struct WaitRequest {
    k: Continuation,
    items: Vec<Waitable>,
    mode: WaitMode,
    /// Task that parked here; `None` means the scheduler scope's main flow.
    waiting_task: Option<TaskId>,
}

#[derive(Debug)]
pub struct SchedulerState {
    tasks: HashMap<TaskId, TaskEntry>,
    promises: HashMap<PromiseId, Option<TaskResult>>,
    ready: VecDeque<TaskId>,
    waiters: Vec<WaitRequest>,
    external: ExternalCompletionQueue,
    current_task: Option<TaskId>,
    /// Stash of the non-task store while an isolated task is loaded.
    base_store: Option<Store>,
    /// Set right after construction; used to reinstall the scheduler into
    /// spawned tasks.
    self_handler: Option<Handler>,
}

impl SchedulerState {
    fn new() -> Self {
        SchedulerState {
            tasks: HashMap::new(),
            promises: HashMap::new(),
            ready: VecDeque::new(),
            waiters: Vec::new(),
            external: ExternalCompletionQueue::new(),
            current_task: None,
            base_store: None,
            self_handler: None,
        }
    }

    fn alloc_task(&mut self) -> TaskId {
        TaskId::from_raw(TASK_COUNTER.fetch_add(1, Ordering::Relaxed))
    }

    fn alloc_promise(&mut self) -> PromiseId {
        PromiseId::from_raw(PROMISE_COUNTER.fetch_add(1, Ordering::Relaxed))
    }

    fn item_result(&self, item: &Waitable) -> Option<TaskResult> {
        match item {
            Waitable::Task(id) => match self.tasks.get(id).map(|t| &t.status) {
                Some(TaskStatus::Done { result }) => Some(result.clone()),
                _ => None,
            },
            Waitable::Promise(id) | Waitable::External(id) => {
                self.promises.get(id).and_then(|p| p.clone())
            }
        }
    }

    fn wait_is_ready(&self, request: &WaitRequest) -> bool {
        match request.mode {
            WaitMode::All => request
                .items
                .iter()
                .all(|item| self.item_result(item).is_some()),
            WaitMode::Any => request
                .items
                .iter()
                .any(|item| self.item_result(item).is_some()),
        }
    }

    /// Outcome of a satisfied wait. All: list of results in item order
    /// (first failure wins); Any: the first completed item's result.
    fn collect_wait(&self, request: &WaitRequest) -> TaskResult {
        match request.mode {
            WaitMode::All => {
                let mut values = Vec::with_capacity(request.items.len());
                for item in &request.items {
                    match self.item_result(item) {
                        Some(Ok(v)) => values.push(v),
                        Some(Err(e)) => return Err(e),
                        None => {
                            return Err(VmException::runtime_error(
                                "gather collected before completion",
                            ))
                        }
                    }
                }
                Ok(Value::List(values))
            }
            WaitMode::Any => {
                for item in &request.items {
                    if let Some(result) = self.item_result(item) {
                        return result;
                    }
                }
                Err(VmException::runtime_error("race collected before completion"))
            }
        }
    }

    fn resolve_promise(&mut self, promise: PromiseId, result: TaskResult) -> Result<(), VmException> {
        match self.promises.get_mut(&promise) {
            Some(slot) => {
                if slot.is_some() {
                    return Err(VmException::runtime_error(format!(
                        "promise {} already completed",
                        promise.raw()
                    )));
                }
                *slot = Some(result);
                Ok(())
            }
            None => Err(VmException::runtime_error(format!(
                "unknown promise {}",
                promise.raw()
            ))),
        }
    }

    /// Append isolated task logs into `store`, in item order.
    fn merge_logs(&self, items: &[Waitable], store: &mut Store) {
        for item in items {
            let Waitable::Task(task_id) = item else {
                continue;
            };
            if let Some(TaskEntry {
                store:
                    TaskStoreSlot::Isolated {
                        store: Some(task_store),
                        merge: StoreMergePolicy::LogsOnly,
                    },
                ..
            }) = self.tasks.get(task_id)
            {
                store.log.extend(task_store.log.iter().cloned());
            }
        }
    }

    /// Save the loaded context's store, then load the one for `target`
    /// (`None` = the scheduler scope's main flow).
    fn switch_store(&mut self, target: Option<TaskId>, store: &mut Store) {
        if self.current_task == target {
            return;
        }

        if let Some(old) = self.current_task {
            if let Some(TaskEntry {
                store: TaskStoreSlot::Isolated { store: slot, .. },
                ..
            }) = self.tasks.get_mut(&old)
            {
                *slot = Some(store.clone());
            }
        }

        match target {
            Some(new) => {
                let isolated = matches!(
                    self.tasks.get(&new).map(|t| &t.store),
                    Some(TaskStoreSlot::Isolated { .. })
                );
                if isolated {
                    if self.current_task.is_none() && self.base_store.is_none() {
                        self.base_store = Some(store.clone());
                    }
                    if let Some(TaskEntry {
                        store: TaskStoreSlot::Isolated { store: slot, .. },
                        ..
                    }) = self.tasks.get_mut(&new)
                    {
                        if let Some(task_store) = slot.take() {
                            *store = task_store;
                        }
                    }
                }
            }
            None => {
                if let Some(base) = self.base_store.take() {
                    *store = base;
                }
            }
        }
        self.current_task = target;
    }

    fn finish_task(&mut self, task: TaskId, result: TaskResult, store: &mut Store) {
        if self.current_task == Some(task) {
            if let Some(TaskEntry {
                store: TaskStoreSlot::Isolated { store: slot, .. },
                ..
            }) = self.tasks.get_mut(&task)
            {
                *slot = Some(store.clone());
                if let Some(base) = self.base_store.take() {
                    *store = base;
                }
            }
            self.current_task = None;
        }
        if let Some(entry) = self.tasks.get_mut(&task) {
            entry.status = TaskStatus::Done { result };
        }
        debug!(task = task.raw(), "task completed");
    }

    fn apply_external_completions(&mut self) -> bool {
        let drained = self.external.drain();
        let got_any = !drained.is_empty();
        for (promise, result) in drained {
            let _ = self.resolve_promise(promise, result);
        }
        got_any
    }
}

// -- handler ---------------------------------------------------------------

#[derive(Debug)]
struct SchedulerFactory {
    state: Arc<Mutex<SchedulerState>>,
}

impl HandlerProgramFactory for SchedulerFactory {
    fn name(&self) -> &'static str {
        SCHEDULER_HANDLER_NAME
    }

    fn can_handle(&self, effect: &Effect) -> bool {
        effect.is_scheduler()
    }

    fn instantiate(&self) -> Box<dyn HandlerProgram> {
        Box::new(SchedulerProgram {
            state: self.state.clone(),
            phase: Phase::Idle,
        })
    }
}

/// Entry point: owns the shared state and hands out identity-stable
/// `Handler` values.
#[derive(Debug, Clone)]
pub struct SchedulerHandler {
    factory: Arc<SchedulerFactory>,
}

impl SchedulerHandler {
    pub fn new() -> Self {
        let state = Arc::new(Mutex::new(SchedulerState::new()));
        let factory = Arc::new(SchedulerFactory {
            state: state.clone(),
        });
        let handler: HandlerFactoryRef = factory.clone();
        state
            .lock()
            .expect("scheduler lock poisoned")
            .self_handler = Some(Handler::Native(handler));
        SchedulerHandler { factory }
    }

    pub fn handler(&self) -> Handler {
        let factory: HandlerFactoryRef = self.factory.clone();
        Handler::Native(factory)
    }
}

impl Default for SchedulerHandler {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Debug)]
enum Phase {
    Idle,
    /// The resumed computation's result passes through as the handler
    /// return.
    AfterResume,
    /// Switched away; any value flowing back means "look for more work".
    Parked,
    SpawnAwaitHandlers {
        k_user: Continuation,
        program: Box<DoExpr>,
        store_mode: StoreMode,
    },
    SpawnAwaitContinuation {
        k_user: Continuation,
        task: TaskId,
        store_mode: StoreMode,
    },
}

struct SchedulerProgram {
    state: Arc<Mutex<SchedulerState>>,
    phase: Phase,
}

impl fmt::Debug for SchedulerProgram {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "SchedulerProgram({:?})", self.phase)
    }
}

fn resume_step(k: Continuation, value: Value) -> HandlerStep {
    HandlerStep::Yield(DoExpr::Ctrl(DoCtrl::Resume {
        continuation: k,
        value,
    }))
}

/// Transfer-style activation: started continuations are transferred,
/// unstarted ones are installed and started.
fn transfer_step(k: Continuation, value: Value) -> HandlerStep {
    if k.started {
        HandlerStep::Yield(DoExpr::Ctrl(DoCtrl::Transfer {
            continuation: k,
            value,
        }))
    } else {
        HandlerStep::Yield(DoExpr::Ctrl(DoCtrl::ResumeContinuation {
            continuation: k,
            value,
        }))
    }
}

fn throw_step(k: Continuation, error: VmException) -> HandlerStep {
    if k.started {
        HandlerStep::Yield(DoExpr::Ctrl(DoCtrl::TransferThrow {
            continuation: k,
            exception: error,
        }))
    } else {
        HandlerStep::Throw(error)
    }
}

impl SchedulerProgram {
    /// Find the next thing to run: a satisfied waiter, then a ready task,
    /// then externally-completed promises. With nothing runnable and no
    /// waiters the fallback value passes through; with waiters it is a
    /// deadlock.
    fn next_action(&mut self, fallback: Value, store: &mut Store) -> HandlerStep {
        loop {
            let mut state = self.state.lock().expect("scheduler lock poisoned");

            if let Some(idx) = (0..state.waiters.len())
                .find(|&i| state.wait_is_ready(&state.waiters[i]))
            {
                let request = state.waiters.remove(idx);
                let outcome = state.collect_wait(&request);
                state.switch_store(request.waiting_task, store);
                if request.mode == WaitMode::All {
                    state.merge_logs(&request.items, store);
                }
                self.phase = Phase::Parked;
                return match outcome {
                    Ok(value) => transfer_step(request.k, value),
                    Err(error) => throw_step(request.k, error),
                };
            }

            if let Some(task_id) = state.ready.pop_front() {
                let cont = match state.tasks.get_mut(&task_id) {
                    Some(entry) => {
                        match std::mem::replace(&mut entry.status, TaskStatus::Running) {
                            TaskStatus::Pending { cont } => Some(cont),
                            other => {
                                entry.status = other;
                                None
                            }
                        }
                    }
                    None => None,
                };
                let Some(cont) = cont else {
                    continue;
                };
                state.switch_store(Some(task_id), store);
                debug!(task = task_id.raw(), "switching to task");
                self.phase = Phase::Parked;
                return transfer_step(cont, Value::Unit);
            }

            if state.apply_external_completions() {
                continue;
            }

            if state.waiters.is_empty() {
                return HandlerStep::Return(fallback);
            }

            return HandlerStep::Throw(VmException::runtime_error(
                "scheduler deadlock: waiters pending with nothing runnable",
            ));
        }
    }

    fn begin_wait(
        &mut self,
        k_user: Continuation,
        items: Vec<Waitable>,
        mode: WaitMode,
        store: &mut Store,
    ) -> HandlerStep {
        let ready_now = {
            let state = self.state.lock().expect("scheduler lock poisoned");
            let probe = WaitRequest {
                k: k_user.clone(),
                items: items.clone(),
                mode,
                waiting_task: state.current_task,
            };
            if state.wait_is_ready(&probe) {
                Some(state.collect_wait(&probe))
            } else {
                None
            }
        };

        if let Some(outcome) = ready_now {
            let state = self.state.lock().expect("scheduler lock poisoned");
            if mode == WaitMode::All {
                state.merge_logs(&items, store);
            }
            drop(state);
            return match outcome {
                Ok(value) => {
                    self.phase = Phase::AfterResume;
                    resume_step(k_user, value)
                }
                Err(error) => {
                    self.phase = Phase::AfterResume;
                    HandlerStep::Yield(DoExpr::Ctrl(DoCtrl::ResumeThrow {
                        continuation: k_user,
                        exception: error,
                    }))
                }
            };
        }

        {
            let mut state = self.state.lock().expect("scheduler lock poisoned");
            let waiting_task = state.current_task;
            state.waiters.push(WaitRequest {
                k: k_user,
                items,
                mode,
                waiting_task,
            });
        }
        self.next_action(Value::Unit, store)
    }

    fn handle_spawn(
        &mut self,
        k_user: Continuation,
        program: Box<DoExpr>,
        handlers: Vec<Handler>,
        store_mode: StoreMode,
    ) -> HandlerStep {
        if handlers.is_empty() {
            // Reinstall the spawn site's chain around the task so its
            // effects stay dispatchable while outer dispatches are busy.
            self.phase = Phase::SpawnAwaitHandlers {
                k_user,
                program,
                store_mode,
            };
            return HandlerStep::Yield(DoExpr::Ctrl(DoCtrl::GetHandlers));
        }
        self.create_task_continuation(k_user, program, handlers, store_mode)
    }

    fn create_task_continuation(
        &mut self,
        k_user: Continuation,
        program: Box<DoExpr>,
        handlers: Vec<Handler>,
        store_mode: StoreMode,
    ) -> HandlerStep {
        let (task, handlers) = {
            let mut state = self.state.lock().expect("scheduler lock poisoned");
            let task = state.alloc_task();
            let mut handlers = handlers;
            let self_handler = state.self_handler.clone();
            if let Some(sched) = self_handler {
                if !handlers.iter().any(|h| h.is_same(&sched)) {
                    handlers.push(sched);
                }
            }
            (task, handlers)
        };

        let body = DoExpr::Program(crate::program::ProgramFactory::new(
            format!("task-{}", task.raw()),
            move || {
                Box::new(TaskBody {
                    task,
                    program: Some((*program).clone()),
                    running: false,
                })
            },
        ));

        self.phase = Phase::SpawnAwaitContinuation {
            k_user,
            task,
            store_mode,
        };
        HandlerStep::Yield(DoExpr::Ctrl(DoCtrl::CreateContinuation {
            expr: Box::new(body),
            handlers,
        }))
    }
}

impl HandlerProgram for SchedulerProgram {
    fn start(&mut self, effect: Effect, k_user: Continuation, store: &mut Store) -> HandlerStep {
        let Effect::Scheduler(effect) = effect else {
            return HandlerStep::Throw(VmException::runtime_error(format!(
                "scheduler cannot handle {}",
                effect.type_name()
            )));
        };

        match effect {
            SchedulerEffect::Spawn {
                program,
                handlers,
                store_mode,
            } => self.handle_spawn(k_user, program, handlers, store_mode),

            SchedulerEffect::Gather { items } => {
                self.begin_wait(k_user, items, WaitMode::All, store)
            }
            SchedulerEffect::Race { items } => self.begin_wait(k_user, items, WaitMode::Any, store),

            SchedulerEffect::CreatePromise => {
                let id = {
                    let mut state = self.state.lock().expect("scheduler lock poisoned");
                    let id = state.alloc_promise();
                    state.promises.insert(id, None);
                    id
                };
                self.phase = Phase::AfterResume;
                resume_step(k_user, Value::Promise(PromiseHandle { id }))
            }

            SchedulerEffect::CompletePromise { promise, value } => {
                let resolved = self
                    .state
                    .lock()
                    .expect("scheduler lock poisoned")
                    .resolve_promise(promise, Ok(value));
                match resolved {
                    Ok(()) => {
                        self.phase = Phase::AfterResume;
                        resume_step(k_user, Value::Unit)
                    }
                    Err(error) => HandlerStep::Throw(error),
                }
            }

            SchedulerEffect::FailPromise { promise, error } => {
                let resolved = self
                    .state
                    .lock()
                    .expect("scheduler lock poisoned")
                    .resolve_promise(promise, Err(error));
                match resolved {
                    Ok(()) => {
                        self.phase = Phase::AfterResume;
                        resume_step(k_user, Value::Unit)
                    }
                    Err(error) => HandlerStep::Throw(error),
                }
            }

            SchedulerEffect::CreateExternalPromise => {
                let handle = {
                    let mut state = self.state.lock().expect("scheduler lock poisoned");
                    let id = state.alloc_promise();
                    state.promises.insert(id, None);
                    ExternalPromise {
                        id,
                        queue: state.external.clone(),
                    }
                };
                self.phase = Phase::AfterResume;
                resume_step(k_user, Value::ExternalPromise(handle))
            }

            SchedulerEffect::TaskCompleted { task, result } => {
                self.state
                    .lock()
                    .expect("scheduler lock poisoned")
                    .finish_task(task, result, store);
                // The completing task's continuation is dead; pick the next
                // runnable. With nothing left the unit return bubbles back
                // to whichever parked scheduler program started this chain.
                self.next_action(Value::Unit, store)
            }

            SchedulerEffect::Host(host) => HandlerStep::Throw(VmException::runtime_error(
                format!("unsupported scheduler host effect {host:?}"),
            )),
        }
    }

    fn resume(&mut self, value: Value, store: &mut Store) -> HandlerStep {
        match std::mem::replace(&mut self.phase, Phase::Idle) {
            Phase::AfterResume => HandlerStep::Return(value),

            Phase::Parked => self.next_action(value, store),

            Phase::SpawnAwaitHandlers {
                k_user,
                program,
                store_mode,
            } => {
                let Value::Handlers(chain) = value else {
                    return HandlerStep::Throw(VmException::type_error(
                        "scheduler spawn expected a GetHandlers result",
                    ));
                };
                // The dispatch chain is innermost-first; installation order
                // is outermost-first.
                let mut handlers = chain;
                handlers.reverse();
                self.create_task_continuation(k_user, program, handlers, store_mode)
            }

            Phase::SpawnAwaitContinuation {
                k_user,
                task,
                store_mode,
            } => {
                let Value::Continuation(cont) = value else {
                    return HandlerStep::Throw(VmException::type_error(
                        "scheduler spawn expected a continuation",
                    ));
                };
                {
                    let mut state = self.state.lock().expect("scheduler lock poisoned");
                    let slot = match store_mode {
                        StoreMode::Shared => TaskStoreSlot::Shared,
                        StoreMode::Isolated { merge } => {
                            // The task inherits state and env but starts
                            // with an empty log, so merging appends only
                            // what the task itself told.
                            let mut snapshot = store.clone();
                            snapshot.log.clear();
                            TaskStoreSlot::Isolated {
                                store: Some(snapshot),
                                merge,
                            }
                        }
                    };
                    state.tasks.insert(
                        task,
                        TaskEntry {
                            status: TaskStatus::Pending { cont },
                            store: slot,
                        },
                    );
                    state.ready.push_back(task);
                }
                debug!(task = task.raw(), "task spawned");
                self.phase = Phase::AfterResume;
                resume_step(k_user, Value::Task(TaskHandle { id: task }))
            }

            Phase::Idle => HandlerStep::Throw(VmException::runtime_error(
                "unexpected resume in scheduler: no pending operation",
            )),
        }
    }
}
