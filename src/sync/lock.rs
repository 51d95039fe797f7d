// Copyright 2025. Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! Mutual exclusion across suspension points.

use crate::coro::{Coro, Reply, Request, Step, unit};
use crate::error::Error;
use crate::future::Future;
use crate::task::{Task, WeakTask};
use std::cell::RefCell;
use std::collections::VecDeque;
use std::fmt;
use std::mem;
use std::rc::Rc;

/// A FIFO, task-aware lock.
///
/// The holder is recorded as a task id plus a non-owning reference; a
/// holder whose task has been dropped no longer blocks the lock. Releases
/// with queued waiters hand the lock over directly: it stays held and the
/// first live waiter installs itself as holder when it resumes.
#[derive(Clone, Default)]
pub struct Lock {
    inner: Rc<RefCell<LockInner>>,
}

#[derive(Default)]
struct LockInner {
    held: bool,
    holder: Option<WeakTask>,
    waiters: VecDeque<Future>,
}

// === impl Lock ===

impl Lock {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn locked(&self) -> bool {
        self.inner.borrow().held
    }

    /// Take the lock, waiting FIFO behind earlier claimants.
    pub fn acquire(&self) -> Acquire {
        Acquire {
            lock: self.clone(),
            state: AcquireState::Init,
        }
    }

    /// Release the lock.
    ///
    /// Fails with [`Error::NotHolder`] when the current task does not
    /// hold it.
    pub fn release(&self) -> Release {
        Release {
            lock: self.clone(),
            requested: false,
        }
    }

    /// Clear a holder whose task no longer exists, handing over to the
    /// next live waiter if any.
    fn reap_dead_holder(inner: &mut LockInner) -> Option<Future> {
        let dead = inner
            .held
            .then(|| inner.holder.as_ref())
            .flatten()
            .is_some_and(|holder| !holder.is_alive());
        if !dead {
            return None;
        }
        inner.holder = None;
        if let Some(next) = pop_live(&mut inner.waiters) {
            Some(next)
        } else {
            inner.held = false;
            None
        }
    }
}

impl fmt::Debug for Lock {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let inner = self.inner.borrow();
        f.debug_struct("Lock")
            .field("held", &inner.held)
            .field("holder", &inner.holder.as_ref().map(WeakTask::id))
            .field("waiters", &inner.waiters.len())
            .finish()
    }
}

fn pop_live(waiters: &mut VecDeque<Future>) -> Option<Future> {
    while let Some(waiter) = waiters.pop_front() {
        if !waiter.done() {
            return Some(waiter);
        }
    }
    None
}

/// Coroutine returned by [`Lock::acquire`].
#[must_use = "coroutines do nothing unless stepped by the event loop"]
pub struct Acquire {
    lock: Lock,
    state: AcquireState,
}

enum AcquireState {
    Init,
    Claim,
    Waiting { me: Task, waiter: Future },
    Done,
}

impl Coro for Acquire {
    type Output = ();

    fn step(&mut self, reply: Reply) -> Step<()> {
        match mem::replace(&mut self.state, AcquireState::Done) {
            AcquireState::Init => {
                self.state = AcquireState::Claim;
                Step::Yield(Request::CurrentTask)
            }
            AcquireState::Claim => {
                let Reply::Task(me) = reply else {
                    panic!("scheduler delivered a mismatched reply to acquire");
                };
                let (handover, parked) = {
                    let mut inner = self.lock.inner.borrow_mut();
                    // a handover means the previous holder's task is gone;
                    // the queue head gets the lock and we line up behind it
                    let handover = Lock::reap_dead_holder(&mut inner);
                    if handover.is_none() && !inner.held {
                        inner.held = true;
                        inner.holder = Some(me.downgrade());
                        (None, None)
                    } else {
                        let waiter = Future::new();
                        inner.waiters.push_back(waiter.clone());
                        (handover, Some(waiter))
                    }
                };
                if let Some(next) = handover {
                    let _ = next.set_result(unit());
                }
                match parked {
                    Some(waiter) => {
                        let pending = waiter.clone();
                        self.state = AcquireState::Waiting { me, waiter };
                        Step::Yield(Request::WaitFuture(pending))
                    }
                    None => Step::Complete(()),
                }
            }
            AcquireState::Waiting { me, waiter } => match waiter.result() {
                Ok(_) => {
                    let mut inner = self.lock.inner.borrow_mut();
                    inner.holder = Some(me.downgrade());
                    Step::Complete(())
                }
                Err(Error::NotReady) => {
                    let pending = waiter.clone();
                    self.state = AcquireState::Waiting { me, waiter };
                    Step::Yield(Request::WaitFuture(pending))
                }
                Err(error) => Step::Failed(error),
            },
            AcquireState::Done => panic!("coroutine stepped after completion"),
        }
    }

    fn throw(&mut self, error: Error) -> Step<()> {
        if let AcquireState::Waiting { waiter, .. } = &self.state {
            if !waiter.cancel() && waiter.result().is_ok() {
                // the lock was already handed to us; pass it on instead
                // of leaving it held by a dying task
                let next = {
                    let mut inner = self.lock.inner.borrow_mut();
                    match pop_live(&mut inner.waiters) {
                        Some(next) => Some(next),
                        None => {
                            inner.held = false;
                            inner.holder = None;
                            None
                        }
                    }
                };
                if let Some(next) = next {
                    let _ = next.set_result(unit());
                }
            }
        }
        self.state = AcquireState::Done;
        Step::Failed(error)
    }
}

/// Coroutine returned by [`Lock::release`].
#[must_use = "coroutines do nothing unless stepped by the event loop"]
pub struct Release {
    lock: Lock,
    requested: bool,
}

impl Coro for Release {
    type Output = ();

    fn step(&mut self, reply: Reply) -> Step<()> {
        if !self.requested {
            self.requested = true;
            return Step::Yield(Request::CurrentTask);
        }
        let Reply::Task(me) = reply else {
            panic!("scheduler delivered a mismatched reply to release");
        };
        let next = {
            let mut inner = self.lock.inner.borrow_mut();
            let holds = inner
                .holder
                .as_ref()
                .is_some_and(|holder| holder.id() == me.id());
            if !holds {
                return Step::Failed(Error::NotHolder);
            }
            inner.holder = None;
            match pop_live(&mut inner.waiters) {
                // the lock stays held; the waiter installs itself on resume
                Some(next) => Some(next),
                None => {
                    inner.held = false;
                    None
                }
            }
        };
        if let Some(next) = next {
            let _ = next.set_result(unit());
        }
        Step::Complete(())
    }
}

/// A [`Lock`] that hands out a shared resource on acquire.
pub struct ResourceLock<T> {
    lock: Lock,
    value: Rc<RefCell<T>>,
}

// === impl ResourceLock ===

impl<T> ResourceLock<T> {
    pub fn new(value: T) -> Self {
        Self {
            lock: Lock::new(),
            value: Rc::new(RefCell::new(value)),
        }
    }

    /// Take the lock and receive the guarded resource.
    pub fn acquire(&self) -> AcquireResource<T> {
        AcquireResource {
            acquire: self.lock.acquire(),
            value: self.value.clone(),
        }
    }

    /// See [`Lock::release`].
    pub fn release(&self) -> Release {
        self.lock.release()
    }

    #[must_use]
    pub fn locked(&self) -> bool {
        self.lock.locked()
    }
}

impl<T> Clone for ResourceLock<T> {
    fn clone(&self) -> Self {
        Self {
            lock: self.lock.clone(),
            value: self.value.clone(),
        }
    }
}

/// Coroutine returned by [`ResourceLock::acquire`].
#[must_use = "coroutines do nothing unless stepped by the event loop"]
pub struct AcquireResource<T> {
    acquire: Acquire,
    value: Rc<RefCell<T>>,
}

impl<T> Coro for AcquireResource<T> {
    type Output = Rc<RefCell<T>>;

    fn step(&mut self, reply: Reply) -> Step<Self::Output> {
        match self.acquire.step(reply) {
            Step::Yield(request) => Step::Yield(request),
            Step::Complete(()) => Step::Complete(self.value.clone()),
            Step::Failed(error) => Step::Failed(error),
        }
    }

    fn throw(&mut self, error: Error) -> Step<Self::Output> {
        match self.acquire.throw(error) {
            Step::Yield(request) => Step::Yield(request),
            Step::Complete(()) => Step::Complete(self.value.clone()),
            Step::Failed(error) => Step::Failed(error),
        }
    }

    fn close(&mut self) {
        self.acquire.close();
    }
}

/// A counting lock: up to `max` concurrent holders, FIFO waiters.
#[derive(Clone)]
pub struct Semaphore {
    inner: Rc<RefCell<SemInner>>,
}

struct SemInner {
    max: usize,
    holders: Vec<WeakTask>,
    /// Slots freed by a release that already woke a waiter; reserved so a
    /// barging claimant cannot overshoot `max`.
    reserved: usize,
    waiters: VecDeque<Future>,
}

// === impl Semaphore ===

impl Semaphore {
    /// # Panics
    ///
    /// Panics if `max` is zero.
    #[must_use]
    pub fn new(max: usize) -> Self {
        assert!(max > 0, "a semaphore needs at least one slot");
        Self {
            inner: Rc::new(RefCell::new(SemInner {
                max,
                holders: Vec::new(),
                reserved: 0,
                waiters: VecDeque::new(),
            })),
        }
    }

    #[must_use]
    pub fn holders(&self) -> usize {
        let mut inner = self.inner.borrow_mut();
        inner.holders.retain(WeakTask::is_alive);
        inner.holders.len()
    }

    /// Take a slot, waiting FIFO when all are held.
    pub fn acquire(&self) -> SemAcquire {
        SemAcquire {
            semaphore: self.clone(),
            state: SemState::Init,
        }
    }

    /// Give a slot back.
    ///
    /// Fails with [`Error::NotHolder`] when the current task holds none.
    pub fn release(&self) -> SemRelease {
        SemRelease {
            semaphore: self.clone(),
            requested: false,
        }
    }
}

impl fmt::Debug for Semaphore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let inner = self.inner.borrow();
        f.debug_struct("Semaphore")
            .field("max", &inner.max)
            .field("holders", &inner.holders.len())
            .field("waiters", &inner.waiters.len())
            .finish()
    }
}

/// Coroutine returned by [`Semaphore::acquire`].
#[must_use = "coroutines do nothing unless stepped by the event loop"]
pub struct SemAcquire {
    semaphore: Semaphore,
    state: SemState,
}

enum SemState {
    Init,
    Claim,
    Waiting { me: Task, waiter: Future },
    Done,
}

impl Coro for SemAcquire {
    type Output = ();

    fn step(&mut self, reply: Reply) -> Step<()> {
        match mem::replace(&mut self.state, SemState::Done) {
            SemState::Init => {
                self.state = SemState::Claim;
                Step::Yield(Request::CurrentTask)
            }
            SemState::Claim => {
                let Reply::Task(me) = reply else {
                    panic!("scheduler delivered a mismatched reply to acquire");
                };
                let mut inner = self.semaphore.inner.borrow_mut();
                inner.holders.retain(WeakTask::is_alive);
                if inner.holders.len() + inner.reserved < inner.max {
                    inner.holders.push(me.downgrade());
                    Step::Complete(())
                } else {
                    let waiter = Future::new();
                    inner.waiters.push_back(waiter.clone());
                    drop(inner);
                    let pending = waiter.clone();
                    self.state = SemState::Waiting { me, waiter };
                    Step::Yield(Request::WaitFuture(pending))
                }
            }
            SemState::Waiting { me, waiter } => match waiter.result() {
                Ok(_) => {
                    let mut inner = self.semaphore.inner.borrow_mut();
                    inner.reserved = inner.reserved.saturating_sub(1);
                    inner.holders.push(me.downgrade());
                    Step::Complete(())
                }
                Err(Error::NotReady) => {
                    let pending = waiter.clone();
                    self.state = SemState::Waiting { me, waiter };
                    Step::Yield(Request::WaitFuture(pending))
                }
                Err(error) => Step::Failed(error),
            },
            SemState::Done => panic!("coroutine stepped after completion"),
        }
    }

    fn throw(&mut self, error: Error) -> Step<()> {
        if let SemState::Waiting { waiter, .. } = &self.state {
            // the slot reserved for us goes back to the pool, or on to
            // the next live waiter if the grant already happened
            let next = {
                let mut inner = self.semaphore.inner.borrow_mut();
                if waiter.cancel() {
                    inner.reserved = inner.reserved.saturating_sub(1);
                    None
                } else if waiter.result().is_ok() {
                    match pop_live(&mut inner.waiters) {
                        Some(next) => Some(next),
                        None => {
                            inner.reserved = inner.reserved.saturating_sub(1);
                            None
                        }
                    }
                } else {
                    None
                }
            };
            if let Some(next) = next {
                let _ = next.set_result(unit());
            }
        }
        self.state = SemState::Done;
        Step::Failed(error)
    }
}

/// Coroutine returned by [`Semaphore::release`].
#[must_use = "coroutines do nothing unless stepped by the event loop"]
pub struct SemRelease {
    semaphore: Semaphore,
    requested: bool,
}

impl Coro for SemRelease {
    type Output = ();

    fn step(&mut self, reply: Reply) -> Step<()> {
        if !self.requested {
            self.requested = true;
            return Step::Yield(Request::CurrentTask);
        }
        let Reply::Task(me) = reply else {
            panic!("scheduler delivered a mismatched reply to release");
        };
        let next = {
            let mut inner = self.semaphore.inner.borrow_mut();
            let Some(position) = inner.holders.iter().position(|h| h.id() == me.id()) else {
                return Step::Failed(Error::NotHolder);
            };
            inner.holders.swap_remove(position);
            match pop_live(&mut inner.waiters) {
                Some(next) => {
                    inner.reserved += 1;
                    Some(next)
                }
                None => None,
            }
        };
        if let Some(next) = next {
            let _ = next.set_result(unit());
        }
        Step::Complete(())
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use crate::coro::CoroExt;
    use crate::executor::EventLoop;
    use crate::task::spawn;
    use crate::time::sleep;
    use std::time::Duration;

    #[test]
    fn acquisition_order_matches_spawn_order() {
        let lp = EventLoop::new().unwrap();
        let lock = Lock::new();
        let order: Rc<RefCell<Vec<usize>>> = Rc::new(RefCell::new(Vec::new()));

        for i in 0..3 {
            let lock = lock.clone();
            let order = order.clone();
            let inner = lock.clone();
            lp.spawn(
                lock.acquire()
                    .and_then(move |()| {
                        order.borrow_mut().push(i);
                        sleep(Duration::from_millis(10))
                    })
                    .and_then(move |()| inner.release()),
            );
        }
        lp.run_forever().unwrap();
        assert_eq!(*order.borrow(), [0, 1, 2]);
        assert!(!lock.locked());
    }

    #[test]
    fn release_by_a_non_holder_fails() {
        let lp = EventLoop::new().unwrap();
        let lock = Lock::new();
        assert!(matches!(
            lp.run_until(lock.release()),
            Err(Error::NotHolder)
        ));
    }

    #[test]
    fn a_cancelled_waiter_is_skipped_on_release() {
        let lp = EventLoop::new().unwrap();
        let lock = Lock::new();
        let granted_to_victim: Rc<RefCell<bool>> = Rc::new(RefCell::new(false));
        let reached: Rc<RefCell<bool>> = Rc::new(RefCell::new(false));

        let body = {
            let lock = lock.clone();
            let reached = reached.clone();
            let granted = granted_to_victim.clone();
            lock.acquire().and_then(move |()| {
                let blocked = lock.clone();
                spawn(blocked.acquire().map(move |()| {
                    *granted.borrow_mut() = true;
                }))
                .and_then(move |victim| {
                    let third_lock = lock.clone();
                    let third = spawn(third_lock.acquire().map(move |()| {
                        *reached.borrow_mut() = true;
                    }));
                    third.and_then(move |_| {
                        sleep(Duration::from_millis(10)).and_then(move |()| {
                            assert!(victim.cancel());
                            lock.release()
                        })
                    })
                })
            })
        };
        lp.run_until(body).unwrap();
        lp.run_forever().unwrap();
        assert!(*reached.borrow(), "release must skip the cancelled waiter");
        assert!(!*granted_to_victim.borrow());
    }

    #[test]
    fn a_dropped_holder_releases_the_lock() {
        let lp = EventLoop::new().unwrap();
        let lock = Lock::new();

        // hold the lock from a task, then drop every handle to it
        let holder = lp.spawn({
            let lock = lock.clone();
            lock.acquire()
        });
        lp.run_forever().unwrap();
        assert!(lock.locked());
        drop(holder);
        // the loop keeps no terminal tasks; the weak holder is now dead
        let second = {
            let lock = lock.clone();
            lock.acquire().map(|()| true)
        };
        assert!(lp.run_until(second).unwrap());
    }

    #[test]
    fn resource_lock_hands_out_its_value() {
        let lp = EventLoop::new().unwrap();
        let resource = ResourceLock::new(41_i32);
        let release = resource.clone();
        let body = resource.acquire().and_then(move |value| {
            *value.borrow_mut() += 1;
            let got = *value.borrow();
            release.release().map(move |()| got)
        });
        assert_eq!(lp.run_until(body).unwrap(), 42);
    }

    #[test]
    fn semaphore_admits_at_most_max_holders() {
        let lp = EventLoop::new().unwrap();
        let semaphore = Semaphore::new(2);
        let peak: Rc<RefCell<(usize, usize)>> = Rc::new(RefCell::new((0, 0)));

        for _ in 0..5 {
            let semaphore = semaphore.clone();
            let peak = peak.clone();
            let leave = semaphore.clone();
            lp.spawn(
                semaphore
                    .acquire()
                    .and_then(move |()| {
                        {
                            let mut peak = peak.borrow_mut();
                            peak.0 += 1;
                            peak.1 = peak.1.max(peak.0);
                        }
                        sleep(Duration::from_millis(5)).map(move |()| {
                            peak.borrow_mut().0 -= 1;
                        })
                    })
                    .and_then(move |()| leave.release()),
            );
        }
        lp.run_forever().unwrap();
        assert_eq!(peak.borrow().1, 2, "no more than two concurrent holders");
    }

    #[test]
    fn semaphore_release_by_a_non_holder_fails() {
        let lp = EventLoop::new().unwrap();
        let semaphore = Semaphore::new(1);
        assert!(matches!(
            lp.run_until(semaphore.release()),
            Err(Error::NotHolder)
        ));
    }

    #[test]
    fn sequential_acquire_release_from_one_task() {
        let lp = EventLoop::new().unwrap();
        let lock = Lock::new();
        let lock2 = lock.clone();
        let body = lock
            .acquire()
            .and_then({
                let lock = lock2.clone();
                move |()| lock.release()
            })
            .and_then({
                let lock = lock2.clone();
                move |()| lock.acquire()
            })
            .and_then(move |()| lock2.release())
            .map(|()| true);
        assert!(lp.run_until(body).unwrap());
        assert!(!lock.locked());
    }
}
