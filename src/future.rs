// Copyright 2025. Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! A single-assignment result cell.
//!
//! A [`Future`] holds either a value or an error, exactly once. It is a
//! cheap-to-clone handle; whoever resolves it wakes every join waiter
//! synchronously. Awaiting a future (its [`Coro`] implementation) parks
//! the awaiting task on the future's own resolution via
//! [`Request::WaitFuture`].

use crate::coro::{Coro, Reply, Request, Step, Value, unit};
use crate::error::Error;
use std::cell::RefCell;
use std::fmt;
use std::mem;
use std::rc::Rc;

/// A single-assignment cell holding a value or an error.
#[derive(Clone, Default)]
pub struct Future {
    inner: Rc<RefCell<Inner>>,
}

#[derive(Default)]
struct Inner {
    result: Option<Value>,
    error: Option<Error>,
    complete: bool,
    cancelled: bool,
    running: bool,
    done_callback: Option<Box<dyn FnOnce(&Future)>>,
    join_waiters: Vec<Future>,
}

impl Inner {
    fn terminal(&self) -> bool {
        self.complete || self.cancelled || self.error.is_some()
    }
}

// === impl Future ===

impl Future {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record the value and wake all join waiters.
    ///
    /// # Errors
    ///
    /// Fails with [`Error::AlreadyCompleted`] if the future is terminal.
    pub fn set_result(&self, value: Value) -> Result<(), Error> {
        let (callback, waiters) = {
            let mut inner = self.inner.borrow_mut();
            if inner.terminal() {
                return Err(Error::AlreadyCompleted);
            }
            inner.complete = true;
            inner.result = Some(value);
            (
                inner.done_callback.take(),
                mem::take(&mut inner.join_waiters),
            )
        };
        if let Some(callback) = callback {
            callback(self);
        }
        for waiter in waiters {
            let _ = waiter.set_result(unit());
        }
        Ok(())
    }

    /// Record the error and propagate it to all join waiters.
    ///
    /// # Errors
    ///
    /// Fails with [`Error::AlreadyCompleted`] if the future is terminal.
    pub fn set_exception(&self, error: Error) -> Result<(), Error> {
        let (callback, waiters) = {
            let mut inner = self.inner.borrow_mut();
            if inner.terminal() {
                return Err(Error::AlreadyCompleted);
            }
            inner.error = Some(error.clone());
            (
                inner.done_callback.take(),
                mem::take(&mut inner.join_waiters),
            )
        };
        if let Some(callback) = callback {
            callback(self);
        }
        for waiter in waiters {
            let _ = waiter.set_exception(error.clone());
        }
        Ok(())
    }

    /// Flip into the cancelled terminal state.
    ///
    /// Idempotent. Returns `false` without touching the future if it is
    /// already complete, already failed, or currently running.
    pub fn cancel(&self) -> bool {
        let (callback, waiters) = {
            let mut inner = self.inner.borrow_mut();
            if inner.cancelled {
                return true;
            }
            if inner.complete || inner.error.is_some() || inner.running {
                return false;
            }
            inner.cancelled = true;
            inner.error = Some(Error::Cancelled);
            (
                inner.done_callback.take(),
                mem::take(&mut inner.join_waiters),
            )
        };
        if let Some(callback) = callback {
            callback(self);
        }
        for waiter in waiters {
            let _ = waiter.set_exception(Error::Cancelled);
        }
        true
    }

    /// The recorded value.
    ///
    /// # Errors
    ///
    /// Raises the recorded error, or [`Error::NotReady`] if the future is
    /// not terminal yet.
    pub fn result(&self) -> Result<Value, Error> {
        let inner = self.inner.borrow();
        if let Some(error) = &inner.error {
            return Err(error.clone());
        }
        if !inner.complete {
            return Err(Error::NotReady);
        }
        Ok(inner
            .result
            .clone()
            .expect("complete future without a result"))
    }

    pub fn done(&self) -> bool {
        self.inner.borrow().terminal()
    }

    pub fn cancelled(&self) -> bool {
        self.inner.borrow().cancelled
    }

    pub fn running(&self) -> bool {
        self.inner.borrow().running
    }

    pub(crate) fn set_running(&self, running: bool) {
        self.inner.borrow_mut().running = running;
    }

    /// Install the single done callback, invoked once when the future
    /// reaches any terminal state. Installing on an already-terminal
    /// future invokes the callback immediately.
    pub fn set_done_callback(&self, callback: impl FnOnce(&Future) + 'static) {
        {
            let mut inner = self.inner.borrow_mut();
            if !inner.terminal() {
                inner.done_callback = Some(Box::new(callback));
                return;
            }
        }
        callback(self);
    }

    pub(crate) fn add_join_waiter(&self, waiter: Future) {
        self.inner.borrow_mut().join_waiters.push(waiter);
    }

    /// Wait for this future to finish without consuming its value.
    ///
    /// Completes immediately if the future is terminal; otherwise a fresh
    /// join waiter is installed and awaited. The target's error (including
    /// cancellation) propagates.
    pub fn wait(&self) -> Wait {
        Wait {
            target: self.clone(),
            state: WaitState::Init,
        }
    }
}

impl Coro for Future {
    type Output = Value;

    fn step(&mut self, _reply: Reply) -> Step<Value> {
        if self.done() {
            match self.result() {
                Ok(value) => Step::Complete(value),
                Err(error) => Step::Failed(error),
            }
        } else {
            Step::Yield(Request::WaitFuture(self.clone()))
        }
    }
}

impl fmt::Debug for Future {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let inner = self.inner.borrow();
        f.debug_struct("Future")
            .field("complete", &inner.complete)
            .field("cancelled", &inner.cancelled)
            .field("running", &inner.running)
            .field("error", &inner.error)
            .field("join_waiters", &inner.join_waiters.len())
            .finish()
    }
}

/// Coroutine returned by [`Future::wait`].
#[must_use = "coroutines do nothing unless stepped by the event loop"]
pub struct Wait {
    target: Future,
    state: WaitState,
}

enum WaitState {
    Init,
    Parked(Future),
    Done,
}

impl Coro for Wait {
    type Output = ();

    fn step(&mut self, _reply: Reply) -> Step<()> {
        match mem::replace(&mut self.state, WaitState::Done) {
            WaitState::Init => {
                if self.target.done() {
                    return match self.target.result() {
                        Ok(_) => Step::Complete(()),
                        Err(error) => Step::Failed(error),
                    };
                }
                let waiter = Future::new();
                self.target.add_join_waiter(waiter.clone());
                self.state = WaitState::Parked(waiter.clone());
                Step::Yield(Request::WaitFuture(waiter))
            }
            WaitState::Parked(waiter) => match waiter.result() {
                Ok(_) => Step::Complete(()),
                Err(Error::NotReady) => {
                    self.state = WaitState::Parked(waiter.clone());
                    Step::Yield(Request::WaitFuture(waiter))
                }
                Err(error) => Step::Failed(error),
            },
            WaitState::Done => panic!("coroutine stepped after completion"),
        }
    }

    fn throw(&mut self, error: Error) -> Step<()> {
        if let WaitState::Parked(waiter) = &self.state {
            waiter.cancel();
        }
        self.state = WaitState::Done;
        Step::Failed(error)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn result_before_completion_is_not_ready() {
        let future = Future::new();
        assert!(matches!(future.result(), Err(Error::NotReady)));
        assert!(!future.done());
    }

    #[test]
    fn terminal_state_is_single_assignment() {
        let future = Future::new();
        future.set_result(Rc::new(5_i32)).unwrap();
        assert!(matches!(
            future.set_exception(Error::task("late")),
            Err(Error::AlreadyCompleted)
        ));
        assert!(matches!(
            future.set_result(Rc::new(6_i32)),
            Err(Error::AlreadyCompleted)
        ));
        let value = future.result().unwrap();
        assert_eq!(*value.downcast::<i32>().unwrap(), 5);
    }

    #[test]
    fn double_cancel_is_a_no_op() {
        let future = Future::new();
        assert!(future.cancel());
        assert!(future.cancel());
        assert!(future.cancelled());
        assert!(matches!(future.result(), Err(Error::Cancelled)));
    }

    #[test]
    fn cancel_after_completion_fails() {
        let future = Future::new();
        future.set_result(unit()).unwrap();
        assert!(!future.cancel());
        assert!(!future.cancelled());
    }

    #[test]
    fn cancel_while_running_is_blocked() {
        let future = Future::new();
        future.set_running(true);
        assert!(!future.cancel());
        future.set_running(false);
        assert!(future.cancel());
    }

    #[test]
    fn join_waiters_resolve_with_the_outcome() {
        let future = Future::new();
        let on_success = Future::new();
        future.add_join_waiter(on_success.clone());
        future.set_result(unit()).unwrap();
        assert!(on_success.done());
        assert!(on_success.result().is_ok());

        let failing = Future::new();
        let on_failure = Future::new();
        failing.add_join_waiter(on_failure.clone());
        failing.set_exception(Error::task("boom")).unwrap();
        assert!(matches!(on_failure.result(), Err(Error::Task(_))));
    }

    #[test]
    fn done_callback_fires_once() {
        let future = Future::new();
        let fired = Rc::new(RefCell::new(0));
        let counter = fired.clone();
        future.set_done_callback(move |_| *counter.borrow_mut() += 1);
        future.set_result(unit()).unwrap();
        assert_eq!(*fired.borrow(), 1);

        // installing on a terminal future invokes immediately
        let counter = fired.clone();
        future.set_done_callback(move |_| *counter.borrow_mut() += 1);
        assert_eq!(*fired.borrow(), 2);
    }

    #[test]
    fn awaiting_a_future_yields_until_terminal() {
        let mut future = Future::new();
        assert!(matches!(
            future.step(Reply::None),
            Step::Yield(Request::WaitFuture(_))
        ));
        future.set_result(Rc::new("done")).unwrap();
        match future.step(Reply::None) {
            Step::Complete(value) => {
                assert_eq!(*value.downcast::<&str>().unwrap(), "done");
            }
            other => panic!("unexpected step: {other:?}"),
        }
    }
}
