// Copyright 2025. Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! The event loop.
//!
//! One tick is: merge the pending-tasks buffer into the ready queue,
//! service due timers, move tasks whose awaited future resolved back to
//! ready, poll the readiness source under a bounded budget, then drain
//! the ready queue by stepping each task once and dispatching the request
//! it yields. Tasks spawned or re-armed during a tick land in the pending
//! buffer and run no earlier than the next tick, so a self-yielding task
//! cannot starve its siblings.

use crate::coro::{Coro, Reply, Request, Step, Value, erase, unit};
use crate::error::Error;
use crate::future::Future;
#[cfg(unix)]
use crate::io::PollSource;
use crate::io::{Interest, IoDriver, ReadinessSource};
use crate::task::Task;
use crate::time::Clock;
use crate::time::timer::TimerHeap;
use std::cell::RefCell;
use std::collections::VecDeque;
use std::fmt;
use std::io;
use std::mem;
use std::rc::{Rc, Weak};
use std::time::Duration;

/// A queue placement: the task plus the reply to deliver on its next
/// step. The reply travels with the placement instead of living in a
/// scratch slot on the task.
#[derive(Debug)]
struct Scheduled {
    task: Task,
    reply: Reply,
    epoch: u64,
}

#[derive(Debug)]
struct JoinEntry {
    future: Future,
    task: Task,
    epoch: u64,
}

struct Core {
    ready: VecDeque<Scheduled>,
    pending: VecDeque<Scheduled>,
    timers: TimerHeap,
    joins: Vec<JoinEntry>,
    io: IoDriver,
    clock: Clock,
    depth: usize,
    stopped: bool,
}

/// A single-threaded cooperative event loop.
///
/// Cloning is cheap and hands out another handle to the same loop.
#[derive(Clone)]
pub struct EventLoop {
    core: Rc<RefCell<Core>>,
}

/// A weak, non-owning handle to a running loop, delivered to tasks that
/// yield [`Request::Handle`]. Using a handle after its loop was dropped
/// panics.
#[derive(Clone, Debug)]
pub struct LoopHandle {
    core: Weak<RefCell<Core>>,
}

// === impl Core ===

impl Core {
    fn enqueue(&mut self, task: Task, reply: Reply) {
        let epoch = task.bump_epoch();
        self.pending.push_back(Scheduled { task, reply, epoch });
    }

    fn has_work(&self) -> bool {
        !self.ready.is_empty()
            || !self.pending.is_empty()
            || !self.timers.is_empty()
            || !self.joins.is_empty()
            || self.io.has_waiters()
    }
}

// === impl EventLoop ===

impl EventLoop {
    /// A loop over the platform's readiness source.
    ///
    /// # Errors
    ///
    /// Fails if the OS selector cannot be created.
    #[cfg(unix)]
    pub fn new() -> io::Result<Self> {
        Ok(Self::with_source(Box::new(PollSource::new()?)))
    }

    /// A loop over a caller-provided readiness source.
    #[must_use]
    pub fn with_source(source: Box<dyn ReadinessSource>) -> Self {
        Self {
            core: Rc::new(RefCell::new(Core {
                ready: VecDeque::new(),
                pending: VecDeque::new(),
                timers: TimerHeap::default(),
                joins: Vec::new(),
                io: IoDriver::new(source),
                clock: Clock::new(),
                depth: 0,
                stopped: false,
            })),
        }
    }

    /// The per-thread default loop, created on first use.
    ///
    /// # Errors
    ///
    /// Fails if a loop has to be created and the OS selector is
    /// unavailable.
    #[cfg(unix)]
    pub fn current() -> io::Result<Self> {
        CURRENT.with(|cell| {
            let mut cell = cell.borrow_mut();
            if let Some(lp) = &*cell {
                return Ok(lp.clone());
            }
            let lp = Self::new()?;
            *cell = Some(lp.clone());
            Ok(lp)
        })
    }

    #[must_use]
    pub fn handle(&self) -> LoopHandle {
        LoopHandle {
            core: Rc::downgrade(&self.core),
        }
    }

    /// The loop's monotonic time.
    #[must_use]
    pub fn time(&self) -> Duration {
        self.core.borrow().clock.now()
    }

    /// Add a task to the pending buffer; it will run no earlier than the
    /// next tick. Usable both before the loop runs and from within tasks.
    pub fn spawn<C>(&self, coro: C) -> Task
    where
        C: Coro + 'static,
        C::Output: 'static,
    {
        self.spawn_erased(erase(coro))
    }

    pub(crate) fn spawn_erased(&self, body: Box<dyn Coro<Output = Value>>) -> Task {
        let task = Task::from_erased(body);
        task.bind(self.handle());
        tracing::trace!(task = task.id().as_u64(), "task spawned");
        self.core.borrow_mut().enqueue(task.clone(), Reply::None);
        task
    }

    /// Ask the loop to stop after the current tick.
    pub fn stop(&self) {
        self.core.borrow_mut().stopped = true;
    }

    /// Run the coroutine to completion and return its output.
    ///
    /// The root is wrapped as a task and pushed at the head of the ready
    /// queue, ahead of anything already scheduled.
    ///
    /// # Errors
    ///
    /// Raises the root task's error verbatim, [`Error::LoopAlreadyRunning`]
    /// on re-entry, and [`Error::NotReady`] if the loop runs out of work
    /// before the root finishes.
    pub fn run_until<C>(&self, coro: C) -> Result<C::Output, Error>
    where
        C: Coro + 'static,
        C::Output: 'static,
    {
        let slot: Rc<RefCell<Option<C::Output>>> = Rc::new(RefCell::new(None));
        let root = Task::from_erased(Box::new(Capture {
            inner: coro,
            slot: slot.clone(),
        }));

        {
            let mut core = self.core.borrow_mut();
            if core.depth > 0 {
                return Err(Error::LoopAlreadyRunning);
            }
            core.depth += 1;
            core.stopped = false;
            root.bind(self.handle());
            let epoch = root.bump_epoch();
            core.ready.push_front(Scheduled {
                task: root.clone(),
                reply: Reply::None,
                epoch,
            });
        }
        let _guard = DepthGuard(self.core.clone());

        tracing::debug!(root = root.id().as_u64(), "run_until starting");
        while !root.done() {
            let (work, stopped) = {
                let core = self.core.borrow();
                (core.has_work(), core.stopped)
            };
            if !work || stopped {
                break;
            }
            self.tick()?;
        }
        tracing::debug!(root = root.id().as_u64(), "run_until finished");

        if !root.done() {
            return Err(Error::NotReady);
        }
        root.result()?;
        let value = slot
            .borrow_mut()
            .take()
            .expect("root task completed without filling its capture slot");
        Ok(value)
    }

    /// Tick until there is no work left or [`stop`][EventLoop::stop] is
    /// called.
    ///
    /// # Errors
    ///
    /// Fails with [`Error::LoopAlreadyRunning`] on re-entry or if the
    /// readiness source fails.
    pub fn run_forever(&self) -> Result<(), Error> {
        {
            let mut core = self.core.borrow_mut();
            if core.depth > 0 {
                return Err(Error::LoopAlreadyRunning);
            }
            core.depth += 1;
            core.stopped = false;
        }
        let _guard = DepthGuard(self.core.clone());

        tracing::debug!("run_forever starting");
        loop {
            let (work, stopped) = {
                let core = self.core.borrow();
                (core.has_work(), core.stopped)
            };
            if !work || stopped {
                break;
            }
            self.tick()?;
        }
        tracing::debug!("run_forever finished");
        Ok(())
    }

    /// One full pass: merge, timers, joins, I/O poll, drain.
    fn tick(&self) -> Result<(), Error> {
        let woken = {
            let mut core = self.core.borrow_mut();
            let core = &mut *core;

            // merge the pending buffer
            core.ready.extend(core.pending.drain(..));

            // due timers, before I/O
            let now = core.clock.now();
            while let Some(task) = core.timers.pop_due(now) {
                let epoch = task.bump_epoch();
                tracing::trace!(task = task.id().as_u64(), "timer fired");
                core.ready.push_back(Scheduled {
                    task,
                    reply: Reply::None,
                    epoch,
                });
            }

            // tasks whose awaited future resolved, in insertion order
            let joins = mem::take(&mut core.joins);
            for entry in joins {
                if entry.task.done() || entry.epoch != entry.task.epoch() {
                    continue;
                }
                if entry.future.done() {
                    let epoch = entry.task.bump_epoch();
                    core.ready.push_back(Scheduled {
                        task: entry.task,
                        reply: Reply::None,
                        epoch,
                    });
                } else {
                    core.joins.push(entry);
                }
            }

            // poll I/O under a bounded budget
            let budget = if !core.ready.is_empty() {
                Some(Duration::ZERO)
            } else if let Some(deadline) = core.timers.next_deadline() {
                Some(deadline.saturating_sub(core.clock.now()))
            } else if core.io.has_registered() {
                None
            } else {
                Some(Duration::ZERO)
            };
            core.io.poll(budget)?
        };
        // resolve outside the loop borrow: done callbacks may re-enter
        for waiter in woken {
            let _ = waiter.set_result(unit());
        }

        // drain: every popped task is stepped once or closed once
        loop {
            let next = self.core.borrow_mut().ready.pop_front();
            let Some(scheduled) = next else { break };
            self.run_one(scheduled);
        }
        Ok(())
    }

    fn run_one(&self, scheduled: Scheduled) {
        let Scheduled { task, reply, epoch } = scheduled;
        if epoch != task.epoch() {
            return;
        }
        if task.done() {
            task.close_body();
            return;
        }
        let step = match task.take_pending_throw() {
            Some(error) => {
                tracing::trace!(task = task.id().as_u64(), %error, "injecting queued error");
                task.drive_throw(error)
            }
            None => task.drive_step(reply),
        };
        match step {
            // terminal outcomes were recorded on the task's future
            Step::Complete(_) => {
                tracing::trace!(task = task.id().as_u64(), "task complete");
            }
            Step::Failed(error) => {
                tracing::trace!(task = task.id().as_u64(), %error, "task failed");
            }
            Step::Yield(request) => self.dispatch(task, request),
        }
    }

    /// Interpret a yield request. Parking requests are overridden when an
    /// error was queued mid-step, so the injection lands promptly.
    fn dispatch(&self, task: Task, request: Request) {
        let forced = task.has_pending_throw();
        let mut core_ref = self.core.borrow_mut();
        let core = &mut *core_ref;
        tracing::trace!(task = task.id().as_u64(), ?request, forced, "dispatch");
        match request {
            Request::Resched => core.enqueue(task, Reply::None),
            Request::Sleep(duration) if duration.is_zero() => core.enqueue(task, Reply::None),
            Request::Sleep(duration) => {
                if forced {
                    core.enqueue(task, Reply::None);
                } else {
                    let deadline = core.clock.now().saturating_add(duration);
                    let epoch = task.bump_epoch();
                    core.timers.insert(deadline, task, epoch);
                }
            }
            Request::Park => {
                if forced {
                    core.enqueue(task, Reply::None);
                }
            }
            Request::Handle => {
                let handle = self.handle();
                core.enqueue(task, Reply::Handle(handle));
            }
            Request::Time => {
                let now = core.clock.now();
                core.enqueue(task, Reply::Time(now));
            }
            Request::CurrentTask => {
                let current = task.clone();
                core.enqueue(task, Reply::Task(current));
            }
            Request::Spawn(body) => {
                let child = Task::from_erased(body);
                child.bind(self.handle());
                tracing::trace!(
                    parent = task.id().as_u64(),
                    child = child.id().as_u64(),
                    "task spawned"
                );
                core.enqueue(child.clone(), Reply::None);
                core.enqueue(task, Reply::Task(child));
            }
            Request::RegisterIo(raw) => match core.io.register(raw) {
                Ok(handle) => core.enqueue(task, Reply::Io(handle)),
                Err(error) => {
                    drop(core_ref);
                    fail_task(&task, error.into());
                }
            },
            Request::DeregisterIo(handle) => {
                if !core.io.is_registered(&handle) {
                    drop(core_ref);
                    fail_task(&task, Error::InvalidYield("descriptor not registered"));
                    return;
                }
                let (waiters, result) = core.io.deregister(&handle);
                match result {
                    Ok(()) => core.enqueue(task, Reply::None),
                    Err(error) => {
                        drop(core_ref);
                        fail_task(&task, error.into());
                        for waiter in waiters {
                            waiter.cancel();
                        }
                        return;
                    }
                }
                drop(core_ref);
                for waiter in waiters {
                    waiter.cancel();
                }
            }
            Request::WaitRead(handle, future) => {
                if !core.io.is_registered(&handle) {
                    drop(core_ref);
                    fail_task(&task, Error::InvalidYield("descriptor not registered"));
                    return;
                }
                core.io.push_waiter(&handle, Interest::READ, future.clone());
                if forced {
                    core.enqueue(task, Reply::None);
                } else {
                    let epoch = task.bump_epoch();
                    core.joins.push(JoinEntry { future, task, epoch });
                }
            }
            Request::WaitWrite(handle, future) => {
                if !core.io.is_registered(&handle) {
                    drop(core_ref);
                    fail_task(&task, Error::InvalidYield("descriptor not registered"));
                    return;
                }
                core.io.push_waiter(&handle, Interest::WRITE, future.clone());
                if forced {
                    core.enqueue(task, Reply::None);
                } else {
                    let epoch = task.bump_epoch();
                    core.joins.push(JoinEntry { future, task, epoch });
                }
            }
            Request::WaitFuture(future) => {
                if forced || future.done() {
                    core.enqueue(task, Reply::None);
                } else {
                    let epoch = task.bump_epoch();
                    core.joins.push(JoinEntry {
                        future,
                        task,
                        epoch,
                    });
                }
            }
        }
    }
}

fn fail_task(task: &Task, error: Error) {
    tracing::trace!(task = task.id().as_u64(), %error, "failing task");
    let _ = task.future().set_exception(error);
    task.close_body();
}

struct DepthGuard(Rc<RefCell<Core>>);

impl Drop for DepthGuard {
    fn drop(&mut self) {
        self.0.borrow_mut().depth -= 1;
    }
}

/// Adapter capturing a typed root output for [`EventLoop::run_until`].
struct Capture<C: Coro> {
    inner: C,
    slot: Rc<RefCell<Option<C::Output>>>,
}

impl<C: Coro> Coro for Capture<C> {
    type Output = Value;

    fn step(&mut self, reply: Reply) -> Step<Value> {
        match self.inner.step(reply) {
            Step::Yield(request) => Step::Yield(request),
            Step::Complete(value) => {
                *self.slot.borrow_mut() = Some(value);
                Step::Complete(unit())
            }
            Step::Failed(error) => Step::Failed(error),
        }
    }

    fn throw(&mut self, error: Error) -> Step<Value> {
        match self.inner.throw(error) {
            Step::Yield(request) => Step::Yield(request),
            Step::Complete(value) => {
                *self.slot.borrow_mut() = Some(value);
                Step::Complete(unit())
            }
            Step::Failed(error) => Step::Failed(error),
        }
    }

    fn close(&mut self) {
        self.inner.close();
    }
}

// === impl LoopHandle ===

impl LoopHandle {
    fn lp(&self) -> EventLoop {
        EventLoop {
            core: self.core.upgrade().expect("event loop has been dropped"),
        }
    }

    /// See [`EventLoop::spawn`].
    pub fn spawn<C>(&self, coro: C) -> Task
    where
        C: Coro + 'static,
        C::Output: 'static,
    {
        self.lp().spawn(coro)
    }

    /// See [`EventLoop::time`].
    #[must_use]
    pub fn time(&self) -> Duration {
        self.lp().time()
    }

    /// See [`EventLoop::stop`].
    pub fn stop(&self) {
        self.lp().stop();
    }

    pub(crate) fn wake(&self, task: Task) {
        self.lp().core.borrow_mut().enqueue(task, Reply::None);
    }
}

impl fmt::Debug for EventLoop {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let core = self.core.borrow();
        f.debug_struct("EventLoop")
            .field("ready", &core.ready.len())
            .field("pending", &core.pending.len())
            .field("joins", &core.joins.len())
            .field("depth", &core.depth)
            .finish_non_exhaustive()
    }
}

#[cfg(unix)]
thread_local! {
    static CURRENT: RefCell<Option<EventLoop>> = const { RefCell::new(None) };
}

/// Run a coroutine on the per-thread default loop.
///
/// # Errors
///
/// See [`EventLoop::run_until`]; selector-creation failures surface as
/// [`Error::Io`].
#[cfg(unix)]
pub fn run<C>(coro: C) -> Result<C::Output, Error>
where
    C: Coro + 'static,
    C::Output: 'static,
{
    EventLoop::current().map_err(Error::from)?.run_until(coro)
}

/// Ask the scheduler for a handle to the running loop.
pub fn get_loop() -> GetLoop {
    GetLoop { requested: false }
}

/// Coroutine returned by [`get_loop`].
#[must_use = "coroutines do nothing unless stepped by the event loop"]
pub struct GetLoop {
    requested: bool,
}

impl Coro for GetLoop {
    type Output = LoopHandle;

    fn step(&mut self, reply: Reply) -> Step<LoopHandle> {
        if !self.requested {
            self.requested = true;
            return Step::Yield(Request::Handle);
        }
        let Reply::Handle(handle) = reply else {
            panic!("scheduler delivered a mismatched reply to get_loop");
        };
        Step::Complete(handle)
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use crate::coro::{CoroExt, fail, ready, yield_now};
    use crate::task::{current_task, spawn};
    use crate::time::{get_time, sleep, sleep_forever};
    use std::time::Instant;
    use tracing_subscriber::EnvFilter;
    use tracing_subscriber::util::SubscriberInitExt;

    fn recorder() -> (Rc<RefCell<Vec<&'static str>>>, impl Fn(&'static str) + Clone) {
        let log: Rc<RefCell<Vec<&'static str>>> = Rc::new(RefCell::new(Vec::new()));
        let sink = log.clone();
        (log, move |entry| sink.borrow_mut().push(entry))
    }

    #[test]
    fn run_until_returns_the_root_value() {
        let lp = EventLoop::new().unwrap();
        assert_eq!(lp.run_until(ready(5)).unwrap(), 5);
    }

    #[test]
    fn the_default_loop_is_created_on_first_use() {
        assert_eq!(run(ready("hello")).unwrap(), "hello");
        // a second run reuses the thread's loop
        assert_eq!(run(ready(2)).unwrap(), 2);
    }

    #[test]
    fn sleepers_resume_in_deadline_order() {
        let _trace = tracing_subscriber::fmt()
            .with_env_filter(EnvFilter::from_default_env())
            .set_default();

        let lp = EventLoop::new().unwrap();
        let (log, record) = recorder();
        for (name, ms) in [("A", 200_u64), ("B", 50), ("C", 100)] {
            let record = record.clone();
            lp.spawn(sleep(Duration::from_millis(ms)).map(move |()| record(name)));
        }
        lp.run_forever().unwrap();
        assert_eq!(*log.borrow(), ["B", "C", "A"]);
    }

    #[test]
    fn tasks_spawned_during_a_tick_wait_for_the_next_one() {
        let lp = EventLoop::new().unwrap();
        let (log, record) = recorder();

        let child_record = record.clone();
        let parent_record = record.clone();
        lp.spawn(
            spawn(ready(()).map(move |()| child_record("child")))
                .map(move |_| parent_record("parent")),
        );
        let sibling_record = record.clone();
        lp.spawn(ready(()).map(move |()| sibling_record("sibling")));

        lp.run_forever().unwrap();
        // the sibling was already queued when the child was spawned
        assert_eq!(*log.borrow(), ["sibling", "child", "parent"]);
    }

    #[test]
    fn the_root_task_runs_ahead_of_prior_spawns() {
        let lp = EventLoop::new().unwrap();
        let (log, record) = recorder();
        let early = record.clone();
        lp.spawn(ready(()).map(move |()| early("pre")));
        let root = record.clone();
        lp.run_until(ready(()).map(move |()| root("root"))).unwrap();
        assert_eq!(*log.borrow(), ["root", "pre"]);
    }

    #[test]
    fn reentrant_runs_are_rejected() {
        let lp = EventLoop::new().unwrap();
        let inner = lp.clone();
        let result = lp
            .run_until(yield_now().map(move |()| {
                assert!(matches!(
                    inner.run_until(ready(())),
                    Err(Error::LoopAlreadyRunning)
                ));
                assert!(matches!(inner.run_forever(), Err(Error::LoopAlreadyRunning)));
                7
            }))
            .unwrap();
        assert_eq!(result, 7);
    }

    #[test]
    fn a_task_error_reaches_run_until_verbatim() {
        let lp = EventLoop::new().unwrap();
        match lp.run_until(fail::<()>(Error::task("boom"))) {
            Err(Error::Task(message)) => assert_eq!(&*message, "boom"),
            other => panic!("unexpected outcome: {other:?}"),
        }
    }

    #[test]
    fn a_parked_root_with_no_other_work_is_not_ready() {
        let lp = EventLoop::new().unwrap();
        assert!(matches!(lp.run_until(sleep_forever()), Err(Error::NotReady)));
    }

    #[test]
    fn current_task_matches_the_spawn_handle() {
        let lp = EventLoop::new().unwrap();
        let seen: Rc<RefCell<Option<crate::task::Id>>> = Rc::new(RefCell::new(None));
        let sink = seen.clone();
        let body = spawn(current_task().map(move |me| {
            *sink.borrow_mut() = Some(me.id());
        }))
        .and_then(|child| child.wait().map(move |()| child.id()));
        let child_id = lp.run_until(body).unwrap();
        assert_eq!(seen.borrow().unwrap(), child_id);
    }

    #[test]
    fn get_time_reports_the_loop_clock() {
        let lp = EventLoop::new().unwrap();
        let (before, after) = lp
            .run_until(
                get_time().and_then(|before| {
                    sleep(Duration::from_millis(20)).and_then(move |()| {
                        get_time().map(move |after| (before, after))
                    })
                }),
            )
            .unwrap();
        assert!(after >= before + Duration::from_millis(15));
    }

    #[test]
    fn a_handle_spawns_and_stops_the_loop() {
        let lp = EventLoop::new().unwrap();
        let (log, record) = recorder();

        // park something far in the future so only stop can end the run
        lp.spawn(sleep(Duration::from_secs(3600)));
        let record = record.clone();
        lp.spawn(get_loop().and_then(move |handle| {
            let spawned = handle.spawn(ready(()).map(move |()| record("from-handle")));
            sleep(Duration::from_millis(20)).map(move |()| {
                assert!(spawned.done());
                handle.stop();
            })
        }));

        let begin = Instant::now();
        lp.run_forever().unwrap();
        assert!(begin.elapsed() < Duration::from_secs(60));
        assert_eq!(*log.borrow(), ["from-handle"]);
    }

    #[test]
    fn sleep_zero_yields_once() {
        let lp = EventLoop::new().unwrap();
        let begin = Instant::now();
        lp.run_until(sleep(Duration::ZERO)).unwrap();
        assert!(begin.elapsed() < Duration::from_millis(100));
    }

    #[test]
    fn waiting_on_a_spawned_task_delivers_its_result() {
        let lp = EventLoop::new().unwrap();
        let body = spawn(sleep(Duration::from_millis(10)).map(|()| 7_i32)).and_then(|child| {
            child.wait().map(move |()| {
                *child.result().unwrap().downcast::<i32>().unwrap()
            })
        });
        assert_eq!(lp.run_until(body).unwrap(), 7);
    }

    #[test]
    fn throw_revives_a_parked_task() {
        let lp = EventLoop::new().unwrap();
        let body = spawn(sleep_forever()).and_then(|parked| {
            sleep(Duration::from_millis(10)).and_then(move |()| {
                parked.throw(Error::task("poke"));
                parked.wait().then(move |outcome| {
                    assert!(matches!(outcome, Err(Error::Task(_))));
                    ready(parked)
                })
            })
        });
        let begin = Instant::now();
        let parked = lp.run_until(body).unwrap();
        assert!(parked.done());
        assert!(matches!(parked.result(), Err(Error::Task(_))));
        assert!(begin.elapsed() < Duration::from_secs(5));
    }

    #[test]
    fn cancelling_a_sleeper_wakes_the_loop_early() {
        let lp = EventLoop::new().unwrap();
        let body = spawn(sleep(Duration::from_secs(3600))).and_then(|sleeper| {
            sleep(Duration::from_millis(10)).map(move |()| {
                assert!(sleeper.cancel());
                sleeper
            })
        });
        let begin = Instant::now();
        let sleeper = lp.run_until(body).unwrap();
        lp.run_forever().unwrap();
        assert!(sleeper.cancelled());
        assert!(
            begin.elapsed() < Duration::from_secs(60),
            "the tombstoned timer must not hold the loop"
        );
    }
}
