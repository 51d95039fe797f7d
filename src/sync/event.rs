// Copyright 2025. Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

use crate::coro::{Coro, Reply, Request, Step, unit};
use crate::error::Error;
use crate::future::Future;
use std::cell::RefCell;
use std::fmt;
use std::mem;
use std::rc::Rc;

/// A boolean latch.
///
/// Any number of tasks may wait; `set` wakes all of them. `clear` re-arms
/// the latch for the next round of waiters.
#[derive(Clone, Default)]
pub struct Event {
    inner: Rc<RefCell<EventInner>>,
}

#[derive(Default)]
struct EventInner {
    set: bool,
    waiters: Vec<Future>,
}

// === impl Event ===

impl Event {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn is_set(&self) -> bool {
        self.inner.borrow().set
    }

    /// Set the latch and wake every current waiter.
    pub fn set(&self) {
        let waiters = {
            let mut inner = self.inner.borrow_mut();
            inner.set = true;
            mem::take(&mut inner.waiters)
        };
        for waiter in waiters {
            let _ = waiter.set_result(unit());
        }
    }

    /// Reset the latch. Waiters already woken keep their wakeup.
    pub fn clear(&self) {
        self.inner.borrow_mut().set = false;
    }

    /// Suspend until the latch is set. Returns immediately if it already
    /// is.
    pub fn wait(&self) -> WaitEvent {
        WaitEvent {
            event: self.clone(),
            state: WaitState::Init,
        }
    }
}

impl fmt::Debug for Event {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let inner = self.inner.borrow();
        f.debug_struct("Event")
            .field("set", &inner.set)
            .field("waiters", &inner.waiters.len())
            .finish()
    }
}

/// Coroutine returned by [`Event::wait`].
#[must_use = "coroutines do nothing unless stepped by the event loop"]
pub struct WaitEvent {
    event: Event,
    state: WaitState,
}

enum WaitState {
    Init,
    Waiting(Future),
    Done,
}

impl Coro for WaitEvent {
    type Output = ();

    fn step(&mut self, _reply: Reply) -> Step<()> {
        match mem::replace(&mut self.state, WaitState::Done) {
            WaitState::Init => {
                let mut inner = self.event.inner.borrow_mut();
                if inner.set {
                    return Step::Complete(());
                }
                let waiter = Future::new();
                inner.waiters.push(waiter.clone());
                drop(inner);
                let pending = waiter.clone();
                self.state = WaitState::Waiting(waiter);
                Step::Yield(Request::WaitFuture(pending))
            }
            WaitState::Waiting(waiter) => match waiter.result() {
                Ok(_) => Step::Complete(()),
                Err(Error::NotReady) => {
                    let pending = waiter.clone();
                    self.state = WaitState::Waiting(waiter);
                    Step::Yield(Request::WaitFuture(pending))
                }
                Err(error) => Step::Failed(error),
            },
            WaitState::Done => panic!("coroutine stepped after completion"),
        }
    }

    fn throw(&mut self, error: Error) -> Step<()> {
        if let WaitState::Waiting(waiter) = &self.state {
            waiter.cancel();
        }
        self.state = WaitState::Done;
        Step::Failed(error)
    }
}

/// Suspend until `predicate` returns true.
///
/// The scheduler polls by rescheduling the task each tick, so the
/// predicate should be cheap.
pub fn wait_until<F>(predicate: F) -> Conditional<F>
where
    F: Fn() -> bool,
{
    Conditional { predicate }
}

/// Coroutine returned by [`wait_until`]: a wait whose completion is a
/// user-supplied predicate.
#[must_use = "coroutines do nothing unless stepped by the event loop"]
pub struct Conditional<F> {
    predicate: F,
}

impl<F> Coro for Conditional<F>
where
    F: Fn() -> bool,
{
    type Output = ();

    fn step(&mut self, _reply: Reply) -> Step<()> {
        if (self.predicate)() {
            Step::Complete(())
        } else {
            Step::Yield(Request::Resched)
        }
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use crate::coro::CoroExt;
    use crate::executor::EventLoop;
    use crate::time::sleep;
    use std::cell::Cell;
    use std::time::Duration;

    #[test]
    fn set_wakes_every_waiter() {
        let lp = EventLoop::new().unwrap();
        let event = Event::new();
        let woken: Rc<Cell<usize>> = Rc::new(Cell::new(0));

        for _ in 0..3 {
            let event = event.clone();
            let woken = woken.clone();
            lp.spawn(event.wait().map(move |()| woken.set(woken.get() + 1)));
        }
        {
            let event = event.clone();
            lp.spawn(sleep(Duration::from_millis(10)).map(move |()| event.set()));
        }
        lp.run_forever().unwrap();
        assert_eq!(woken.get(), 3);
        assert!(event.is_set());
    }

    #[test]
    fn wait_returns_immediately_when_already_set() {
        let lp = EventLoop::new().unwrap();
        let event = Event::new();
        event.set();
        lp.run_until(event.wait()).unwrap();
    }

    #[test]
    fn clear_re_arms_the_latch() {
        let event = Event::new();
        event.set();
        assert!(event.is_set());
        event.clear();
        assert!(!event.is_set());
    }

    #[test]
    fn wait_until_polls_the_predicate() {
        let lp = EventLoop::new().unwrap();
        let flag: Rc<Cell<bool>> = Rc::new(Cell::new(false));
        {
            let flag = flag.clone();
            lp.spawn(sleep(Duration::from_millis(10)).map(move |()| flag.set(true)));
        }
        let watched = flag.clone();
        lp.run_until(wait_until(move || watched.get())).unwrap();
        assert!(flag.get());
    }
}
