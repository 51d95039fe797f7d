// Copyright 2025. Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! Tasks: a coroutine body bound to a [`Future`]-shaped result slot.

use crate::coro::{Coro, Reply, Request, Step, Value, erase};
use crate::error::Error;
use crate::executor::LoopHandle;
use crate::future::{Future, Wait};
use std::cell::{Cell, RefCell};
use std::fmt;
use std::mem;
use std::rc::{Rc, Weak};
use std::sync::atomic::{AtomicU64, Ordering};

/// A unique, monotonically increasing task id.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Hash)]
pub struct Id(u64);

impl Id {
    pub(crate) fn next() -> Self {
        static NEXT: AtomicU64 = AtomicU64::new(1);
        Self(NEXT.fetch_add(1, Ordering::Relaxed))
    }

    #[must_use]
    pub fn as_u64(self) -> u64 {
        self.0
    }
}

/// A runnable wrapper binding a coroutine body to a result slot.
///
/// `Task` is itself awaitable: awaiting one drives the body directly, so
/// the driver sees the same requests the body would hand to the scheduler
/// (they do not route through the scheduler a second time). Await a task
/// inline only if it was not also spawned; for spawned tasks use
/// [`wait`][Task::wait].
#[derive(Clone)]
pub struct Task {
    future: Future,
    core: Rc<TaskCore>,
}

struct TaskCore {
    id: Id,
    body: RefCell<Box<dyn Coro<Output = Value>>>,
    pending_throw: RefCell<Option<Error>>,
    sched: RefCell<Option<LoopHandle>>,
    closed: Cell<bool>,
    /// Placement generation. Every queue/timer/registry entry captures the
    /// epoch at insertion; a mismatch on removal marks the entry stale.
    /// This is what keeps "a task is on at most one scheduler queue" true
    /// even when a throw re-routes a parked task.
    epoch: Cell<u64>,
}

/// A non-owning reference to a task, used to record lock and semaphore
/// holders without keeping them alive.
#[derive(Clone, Debug)]
pub struct WeakTask {
    id: Id,
    core: Weak<TaskCore>,
}

// === impl Task ===

impl Task {
    /// Wrap a coroutine into a task. The task is not scheduled; hand it to
    /// [`EventLoop::run_until`][crate::EventLoop::run_until], await it
    /// inline, or prefer [`spawn`] to create and schedule in one go.
    pub fn new<C>(coro: C) -> Self
    where
        C: Coro + 'static,
        C::Output: 'static,
    {
        Self::from_erased(erase(coro))
    }

    pub(crate) fn from_erased(body: Box<dyn Coro<Output = Value>>) -> Self {
        Self {
            future: Future::new(),
            core: Rc::new(TaskCore {
                id: Id::next(),
                body: RefCell::new(body),
                pending_throw: RefCell::new(None),
                sched: RefCell::new(None),
                closed: Cell::new(false),
                epoch: Cell::new(0),
            }),
        }
    }

    #[must_use]
    pub fn id(&self) -> Id {
        self.core.id
    }

    pub fn done(&self) -> bool {
        self.future.done()
    }

    pub fn cancelled(&self) -> bool {
        self.future.cancelled()
    }

    /// The task's result; see [`Future::result`].
    ///
    /// # Errors
    ///
    /// Raises the task's recorded error, or [`Error::NotReady`].
    pub fn result(&self) -> Result<Value, Error> {
        self.future.result()
    }

    /// Wait for the task to finish; see [`Future::wait`].
    pub fn wait(&self) -> Wait {
        self.future.wait()
    }

    #[must_use]
    pub fn downgrade(&self) -> WeakTask {
        WeakTask {
            id: self.core.id,
            core: Rc::downgrade(&self.core),
        }
    }

    pub(crate) fn future(&self) -> &Future {
        &self.future
    }

    pub(crate) fn bind(&self, handle: LoopHandle) {
        *self.core.sched.borrow_mut() = Some(handle);
    }

    pub(crate) fn epoch(&self) -> u64 {
        self.core.epoch.get()
    }

    pub(crate) fn bump_epoch(&self) -> u64 {
        let next = self.core.epoch.get() + 1;
        self.core.epoch.set(next);
        next
    }

    pub(crate) fn take_pending_throw(&self) -> Option<Error> {
        self.core.pending_throw.borrow_mut().take()
    }

    pub(crate) fn has_pending_throw(&self) -> bool {
        self.core.pending_throw.borrow().is_some()
    }

    pub(crate) fn close_body(&self) {
        if !self.core.closed.replace(true) {
            self.core
                .body
                .try_borrow_mut()
                .expect("task body closed re-entrantly")
                .close();
        }
    }

    /// Request cancellation.
    ///
    /// A terminal task is left untouched (`true` only if it was already
    /// cancelled). A task that is currently being stepped gets *Cancelled*
    /// queued for injection at its next step. A suspended task has
    /// *Cancelled* thrown into its body right here: the body may catch it
    /// to clean up and then either re-raise (any error) or return
    /// normally; the outcome is recorded on the task's future.
    pub fn cancel(&self) -> bool {
        if self.future.done() {
            return self.future.cancelled();
        }
        if self.future.running() {
            tracing::trace!(task = self.core.id.as_u64(), "queueing cancellation");
            *self.core.pending_throw.borrow_mut() = Some(Error::Cancelled);
            return true;
        }
        tracing::trace!(task = self.core.id.as_u64(), "injecting cancellation");
        match self.drive_throw(Error::Cancelled) {
            Step::Complete(_) | Step::Failed(_) => {}
            Step::Yield(_) => {
                // Catching *Cancelled* permits cleanup followed by return
                // or re-raise, not further suspension.
                tracing::warn!(
                    task = self.core.id.as_u64(),
                    "body suspended after cancellation; closing it"
                );
                self.close_body();
                self.future.cancel();
            }
        }
        true
    }

    /// Queue an arbitrary error for injection at the task's next step and
    /// wake the task if it is parked.
    pub fn throw(&self, error: Error) {
        if self.future.done() {
            return;
        }
        *self.core.pending_throw.borrow_mut() = Some(error);
        let handle = self.core.sched.borrow().clone();
        if let Some(handle) = handle {
            handle.wake(self.clone());
        }
    }

    /// Step the body and record any terminal outcome on the future.
    pub(crate) fn drive_step(&self, reply: Reply) -> Step<Value> {
        if self.future.done() {
            return self.terminal_step();
        }
        self.future.set_running(true);
        let step = self
            .core
            .body
            .try_borrow_mut()
            .expect("task body stepped re-entrantly")
            .step(reply);
        self.future.set_running(false);
        self.record(step)
    }

    /// Throw into the body and record any terminal outcome on the future.
    pub(crate) fn drive_throw(&self, error: Error) -> Step<Value> {
        if self.future.done() {
            return self.terminal_step();
        }
        self.future.set_running(true);
        let step = self
            .core
            .body
            .try_borrow_mut()
            .expect("task body stepped re-entrantly")
            .throw(error);
        self.future.set_running(false);
        self.record(step)
    }

    fn terminal_step(&self) -> Step<Value> {
        match self.future.result() {
            Ok(value) => Step::Complete(value),
            Err(error) => Step::Failed(error),
        }
    }

    fn record(&self, step: Step<Value>) -> Step<Value> {
        match &step {
            Step::Complete(value) => {
                self.core.pending_throw.borrow_mut().take();
                let _ = self.future.set_result(value.clone());
            }
            Step::Failed(Error::Cancelled) => {
                self.future.cancel();
            }
            Step::Failed(error) => {
                let _ = self.future.set_exception(error.clone());
            }
            Step::Yield(_) => {}
        }
        step
    }
}

impl Coro for Task {
    type Output = Value;

    fn step(&mut self, reply: Reply) -> Step<Value> {
        self.drive_step(reply)
    }

    fn throw(&mut self, error: Error) -> Step<Value> {
        self.drive_throw(error)
    }

    fn close(&mut self) {
        self.close_body();
    }
}

impl PartialEq for Task {
    fn eq(&self, other: &Self) -> bool {
        self.core.id == other.core.id
    }
}

impl Eq for Task {}

impl fmt::Debug for Task {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Task")
            .field("id", &self.core.id.as_u64())
            .field("future", &self.future)
            .finish()
    }
}

// === impl WeakTask ===

impl WeakTask {
    #[must_use]
    pub fn id(&self) -> Id {
        self.id
    }

    /// Whether any strong handle to the task still exists.
    #[must_use]
    pub fn is_alive(&self) -> bool {
        self.core.strong_count() > 0
    }
}

/// Spawn a coroutine as a new task on the running loop.
///
/// The child enters the pending-tasks buffer and runs no earlier than the
/// next tick; the reply is its [`Task`].
pub fn spawn<C>(coro: C) -> Spawn
where
    C: Coro + 'static,
    C::Output: 'static,
{
    Spawn {
        state: SpawnState::Init(erase(coro)),
    }
}

/// Coroutine returned by [`spawn`].
#[must_use = "coroutines do nothing unless stepped by the event loop"]
pub struct Spawn {
    state: SpawnState,
}

enum SpawnState {
    Init(Box<dyn Coro<Output = Value>>),
    Requested,
    Done,
}

impl Coro for Spawn {
    type Output = Task;

    fn step(&mut self, reply: Reply) -> Step<Task> {
        match mem::replace(&mut self.state, SpawnState::Done) {
            SpawnState::Init(body) => {
                self.state = SpawnState::Requested;
                Step::Yield(Request::Spawn(body))
            }
            SpawnState::Requested => {
                let Reply::Task(task) = reply else {
                    panic!("scheduler delivered a mismatched reply to spawn");
                };
                Step::Complete(task)
            }
            SpawnState::Done => panic!("coroutine stepped after completion"),
        }
    }
}

/// Ask the scheduler for the task currently being stepped.
pub fn current_task() -> CurrentTask {
    CurrentTask { requested: false }
}

/// Coroutine returned by [`current_task`].
#[must_use = "coroutines do nothing unless stepped by the event loop"]
pub struct CurrentTask {
    requested: bool,
}

impl Coro for CurrentTask {
    type Output = Task;

    fn step(&mut self, reply: Reply) -> Step<Task> {
        if !self.requested {
            self.requested = true;
            return Step::Yield(Request::CurrentTask);
        }
        let Reply::Task(task) = reply else {
            panic!("scheduler delivered a mismatched reply to current_task");
        };
        Step::Complete(task)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::coro::{CoroExt, fail, ready, yield_now};

    #[test]
    fn task_records_completion_through_delegation() {
        let mut task = Task::new(ready(7_i32));
        match task.step(Reply::None) {
            Step::Complete(value) => assert_eq!(*value.downcast::<i32>().unwrap(), 7),
            other => panic!("unexpected step: {other:?}"),
        }
        assert!(task.done());
        assert_eq!(*task.result().unwrap().downcast::<i32>().unwrap(), 7);
    }

    #[test]
    fn task_records_failure() {
        let mut task = Task::new(fail::<()>(Error::task("boom")));
        assert!(matches!(task.step(Reply::None), Step::Failed(Error::Task(_))));
        assert!(task.done());
        assert!(matches!(task.result(), Err(Error::Task(_))));
    }

    #[test]
    fn cancelling_a_suspended_task_injects_cancelled() {
        let mut task = Task::new(yield_now());
        assert!(matches!(task.step(Reply::None), Step::Yield(_)));
        assert!(task.cancel());
        assert!(task.cancelled());
        assert!(matches!(task.result(), Err(Error::Cancelled)));
    }

    #[test]
    fn a_body_may_swallow_cancelled_and_return() {
        let mut task = Task::new(yield_now().then(|result| {
            assert!(matches!(result, Err(Error::Cancelled)));
            ready("cleaned up")
        }));
        assert!(matches!(task.step(Reply::None), Step::Yield(_)));
        assert!(task.cancel());
        assert!(!task.cancelled());
        assert_eq!(
            *task.result().unwrap().downcast::<&str>().unwrap(),
            "cleaned up"
        );
    }

    #[test]
    fn double_cancel_is_idempotent() {
        let mut task = Task::new(yield_now());
        assert!(matches!(task.step(Reply::None), Step::Yield(_)));
        assert!(task.cancel());
        assert!(task.cancel());
        assert!(task.cancelled());
    }

    #[test]
    fn cancel_after_completion_reports_false() {
        let mut task = Task::new(ready(()));
        assert!(matches!(task.step(Reply::None), Step::Complete(_)));
        assert!(!task.cancel());
    }

    #[test]
    fn a_body_suspending_after_cancellation_is_closed() {
        let mut task = Task::new(yield_now().then(|_| yield_now()));
        assert!(matches!(task.step(Reply::None), Step::Yield(_)));
        assert!(task.cancel());
        assert!(task.cancelled());
    }

    #[test]
    fn weak_task_tracks_liveness() {
        let task = Task::new(ready(()));
        let weak = task.downgrade();
        assert!(weak.is_alive());
        assert_eq!(weak.id(), task.id());
        drop(task);
        assert!(!weak.is_alive());
    }
}
