// Copyright 2025. Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! The suspension primitive.
//!
//! A [`Coro`] is a resumable computation: each call to [`step`][Coro::step]
//! runs it up to its next suspension point, where it hands a [`Request`]
//! back to the scheduler. The scheduler answers with a [`Reply`] on the
//! following step. Errors are injected at the suspension point with
//! [`throw`][Coro::throw], and [`close`][Coro::close] force-terminates.
//!
//! Task bodies are built by chaining coroutines with the combinators on
//! [`CoroExt`]; when an inner coroutine finishes mid-step, its successor
//! keeps running within the same step until something suspends.

use crate::error::Error;
use crate::executor::LoopHandle;
use crate::future::Future;
use crate::io::{IoHandle, RawHandle};
use crate::task::Task;
use std::any::Any;
use std::fmt;
use std::mem;
use std::rc::Rc;
use std::time::Duration;

/// A type-erased task result.
///
/// The scheduler runs heterogeneous tasks, so their outputs are erased at
/// the task boundary. Typed values are recovered through the capture slot
/// in [`run_until`][crate::EventLoop::run_until] or by downcasting the
/// value returned from [`Task::result`][crate::Task::result].
pub type Value = Rc<dyn Any>;

pub(crate) fn unit() -> Value {
    Rc::new(())
}

/// The outcome of stepping a coroutine once.
pub enum Step<T> {
    /// Suspended; the scheduler should act on the request.
    Yield(Request),
    /// Ran to completion.
    Complete(T),
    /// Raised an error.
    Failed(Error),
}

impl<T> fmt::Debug for Step<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Yield(request) => f.debug_tuple("Yield").field(request).finish(),
            Self::Complete(_) => f.write_str("Complete(..)"),
            Self::Failed(error) => f.debug_tuple("Failed").field(error).finish(),
        }
    }
}

/// A request handed from a suspended coroutine to the scheduler.
///
/// This is a closed set: the scheduler dispatches exhaustively and there
/// is no unknown tag at runtime.
pub enum Request {
    /// Reschedule at the tail of the next tick.
    Resched,
    /// Park on the timer heap for the given duration. A zero duration is
    /// treated like [`Resched`][Request::Resched].
    Sleep(Duration),
    /// Park indefinitely; only [`Task::cancel`] or [`Task::throw`] revive.
    Park,
    /// Reply with a handle to the running loop.
    Handle,
    /// Reply with the loop's monotonic time.
    Time,
    /// Reply with the task currently being stepped.
    CurrentTask,
    /// Spawn the boxed body as a new task; reply with its [`Task`].
    Spawn(Box<dyn Coro<Output = Value>>),
    /// Register a descriptor with the readiness source; reply with an
    /// [`IoHandle`].
    RegisterIo(RawHandle),
    /// Cancel all waiters on the handle and unregister its descriptor.
    DeregisterIo(IoHandle),
    /// Queue the future as a read waiter and park on it.
    WaitRead(IoHandle, Future),
    /// Queue the future as a write waiter and park on it.
    WaitWrite(IoHandle, Future),
    /// Park until the future reaches a terminal state.
    WaitFuture(Future),
}

/// The scheduler's answer delivered at the next step.
#[derive(Clone, Debug)]
pub enum Reply {
    None,
    Handle(LoopHandle),
    Time(Duration),
    Task(Task),
    Io(IoHandle),
}

/// A resumable computation driven by the scheduler (or by an enclosing
/// coroutine).
///
/// Contract: only the driver calls `step`, the first reply is
/// [`Reply::None`] and is ignored, and a completed coroutine must never be
/// stepped again (doing so panics).
pub trait Coro {
    type Output;

    /// Run to the next suspension point, delivering `reply` at the
    /// current one.
    fn step(&mut self, reply: Reply) -> Step<Self::Output>;

    /// Raise `error` at the current suspension point.
    ///
    /// The default propagates the error outward unchanged. Combinators
    /// forward it to the innermost live coroutine first so that waiter
    /// cleanup and timeout translation happen on the way out.
    fn throw(&mut self, error: Error) -> Step<Self::Output> {
        Step::Failed(error)
    }

    /// Force termination. Must be idempotent.
    fn close(&mut self) {}
}

impl<T: ?Sized + Coro> Coro for Box<T> {
    type Output = T::Output;

    fn step(&mut self, reply: Reply) -> Step<Self::Output> {
        (**self).step(reply)
    }

    fn throw(&mut self, error: Error) -> Step<Self::Output> {
        (**self).throw(error)
    }

    fn close(&mut self) {
        (**self).close();
    }
}

/// Chaining adapters for [`Coro`].
pub trait CoroExt: Coro + Sized {
    /// Run `self`, then feed its output into `next` and run the result.
    ///
    /// Errors from `self` skip `next` and propagate.
    fn and_then<F, B>(self, next: F) -> AndThen<Self, F, B>
    where
        F: FnOnce(Self::Output) -> B,
        B: Coro,
    {
        AndThen {
            state: Chain::First(self, next),
        }
    }

    /// Map the output of `self`.
    fn map<F, U>(self, f: F) -> Map<Self, F>
    where
        F: FnOnce(Self::Output) -> U,
    {
        Map {
            inner: self,
            f: Some(f),
        }
    }

    /// Run `self`, then feed its `Result` into `next` and run the result.
    ///
    /// Unlike [`and_then`][CoroExt::and_then] the continuation also sees
    /// errors, including ones injected with [`Coro::throw`] — this is the
    /// catch point for cancellation-aware cleanup.
    fn then<F, B>(self, next: F) -> Then<Self, F, B>
    where
        F: FnOnce(Result<Self::Output, Error>) -> B,
        B: Coro,
    {
        Then {
            state: Chain::First(self, next),
        }
    }
}

impl<C: Coro> CoroExt for C {}

enum Chain<A, F, B> {
    First(A, F),
    Second(B),
    Done,
}

/// Coroutine returned by [`CoroExt::and_then`].
#[must_use = "coroutines do nothing unless stepped by the event loop"]
pub struct AndThen<A, F, B> {
    state: Chain<A, F, B>,
}

impl<A, F, B> AndThen<A, F, B>
where
    A: Coro,
    F: FnOnce(A::Output) -> B,
    B: Coro,
{
    fn resume(&mut self, reply: Reply, error: Option<Error>) -> Step<B::Output> {
        match mem::replace(&mut self.state, Chain::Done) {
            Chain::First(mut first, next) => {
                let step = match error {
                    Some(error) => first.throw(error),
                    None => first.step(reply),
                };
                match step {
                    Step::Yield(request) => {
                        self.state = Chain::First(first, next);
                        Step::Yield(request)
                    }
                    Step::Complete(value) => {
                        self.state = Chain::Second(next(value));
                        self.resume(Reply::None, None)
                    }
                    Step::Failed(error) => Step::Failed(error),
                }
            }
            Chain::Second(mut second) => {
                let step = match error {
                    Some(error) => second.throw(error),
                    None => second.step(reply),
                };
                match step {
                    Step::Yield(request) => {
                        self.state = Chain::Second(second);
                        Step::Yield(request)
                    }
                    done => done,
                }
            }
            Chain::Done => panic!("coroutine stepped after completion"),
        }
    }
}

impl<A, F, B> Coro for AndThen<A, F, B>
where
    A: Coro,
    F: FnOnce(A::Output) -> B,
    B: Coro,
{
    type Output = B::Output;

    fn step(&mut self, reply: Reply) -> Step<Self::Output> {
        self.resume(reply, None)
    }

    fn throw(&mut self, error: Error) -> Step<Self::Output> {
        self.resume(Reply::None, Some(error))
    }

    fn close(&mut self) {
        match mem::replace(&mut self.state, Chain::Done) {
            Chain::First(mut first, _) => first.close(),
            Chain::Second(mut second) => second.close(),
            Chain::Done => {}
        }
    }
}

/// Coroutine returned by [`CoroExt::then`].
#[must_use = "coroutines do nothing unless stepped by the event loop"]
pub struct Then<A, F, B> {
    state: Chain<A, F, B>,
}

impl<A, F, B> Then<A, F, B>
where
    A: Coro,
    F: FnOnce(Result<A::Output, Error>) -> B,
    B: Coro,
{
    fn resume(&mut self, reply: Reply, error: Option<Error>) -> Step<B::Output> {
        match mem::replace(&mut self.state, Chain::Done) {
            Chain::First(mut first, next) => {
                let step = match error {
                    Some(error) => first.throw(error),
                    None => first.step(reply),
                };
                let outcome = match step {
                    Step::Yield(request) => {
                        self.state = Chain::First(first, next);
                        return Step::Yield(request);
                    }
                    Step::Complete(value) => Ok(value),
                    Step::Failed(error) => Err(error),
                };
                self.state = Chain::Second(next(outcome));
                self.resume(Reply::None, None)
            }
            Chain::Second(mut second) => {
                let step = match error {
                    Some(error) => second.throw(error),
                    None => second.step(reply),
                };
                match step {
                    Step::Yield(request) => {
                        self.state = Chain::Second(second);
                        Step::Yield(request)
                    }
                    done => done,
                }
            }
            Chain::Done => panic!("coroutine stepped after completion"),
        }
    }
}

impl<A, F, B> Coro for Then<A, F, B>
where
    A: Coro,
    F: FnOnce(Result<A::Output, Error>) -> B,
    B: Coro,
{
    type Output = B::Output;

    fn step(&mut self, reply: Reply) -> Step<Self::Output> {
        self.resume(reply, None)
    }

    fn throw(&mut self, error: Error) -> Step<Self::Output> {
        self.resume(Reply::None, Some(error))
    }

    fn close(&mut self) {
        match mem::replace(&mut self.state, Chain::Done) {
            Chain::First(mut first, _) => first.close(),
            Chain::Second(mut second) => second.close(),
            Chain::Done => {}
        }
    }
}

/// Coroutine returned by [`CoroExt::map`].
#[must_use = "coroutines do nothing unless stepped by the event loop"]
pub struct Map<A, F> {
    inner: A,
    f: Option<F>,
}

impl<A, F, U> Coro for Map<A, F>
where
    A: Coro,
    F: FnOnce(A::Output) -> U,
{
    type Output = U;

    fn step(&mut self, reply: Reply) -> Step<U> {
        match self.inner.step(reply) {
            Step::Yield(request) => Step::Yield(request),
            Step::Complete(value) => {
                let f = self.f.take().expect("coroutine stepped after completion");
                Step::Complete(f(value))
            }
            Step::Failed(error) => Step::Failed(error),
        }
    }

    fn throw(&mut self, error: Error) -> Step<U> {
        match self.inner.throw(error) {
            Step::Yield(request) => Step::Yield(request),
            Step::Complete(value) => {
                let f = self.f.take().expect("coroutine stepped after completion");
                Step::Complete(f(value))
            }
            Step::Failed(error) => Step::Failed(error),
        }
    }

    fn close(&mut self) {
        self.inner.close();
    }
}

/// An immediately-complete coroutine.
pub fn ready<T>(value: T) -> Ready<T> {
    Ready(Some(value))
}

/// Coroutine returned by [`ready`].
#[must_use = "coroutines do nothing unless stepped by the event loop"]
pub struct Ready<T>(Option<T>);

impl<T> Coro for Ready<T> {
    type Output = T;

    fn step(&mut self, _reply: Reply) -> Step<T> {
        match self.0.take() {
            Some(value) => Step::Complete(value),
            None => panic!("coroutine stepped after completion"),
        }
    }
}

/// An immediately-failing coroutine.
pub fn fail<T>(error: Error) -> Fail<T> {
    Fail(Some(error), std::marker::PhantomData)
}

/// Coroutine returned by [`fail`].
#[must_use = "coroutines do nothing unless stepped by the event loop"]
pub struct Fail<T>(Option<Error>, std::marker::PhantomData<fn() -> T>);

impl<T> Coro for Fail<T> {
    type Output = T;

    fn step(&mut self, _reply: Reply) -> Step<T> {
        match self.0.take() {
            Some(error) => Step::Failed(error),
            None => panic!("coroutine stepped after completion"),
        }
    }
}

/// Yield once, letting every other ready task run before resuming.
pub fn yield_now() -> YieldNow {
    YieldNow { yielded: false }
}

/// Coroutine returned by [`yield_now`].
#[must_use = "coroutines do nothing unless stepped by the event loop"]
pub struct YieldNow {
    yielded: bool,
}

impl Coro for YieldNow {
    type Output = ();

    fn step(&mut self, _reply: Reply) -> Step<()> {
        if self.yielded {
            Step::Complete(())
        } else {
            self.yielded = true;
            Step::Yield(Request::Resched)
        }
    }
}

/// Adapter erasing a typed coroutine output into a [`Value`].
pub(crate) struct Erased<C>(pub(crate) C);

impl<C> Coro for Erased<C>
where
    C: Coro,
    C::Output: 'static,
{
    type Output = Value;

    fn step(&mut self, reply: Reply) -> Step<Value> {
        match self.0.step(reply) {
            Step::Yield(request) => Step::Yield(request),
            Step::Complete(value) => Step::Complete(Rc::new(value) as Value),
            Step::Failed(error) => Step::Failed(error),
        }
    }

    fn throw(&mut self, error: Error) -> Step<Value> {
        match self.0.throw(error) {
            Step::Yield(request) => Step::Yield(request),
            Step::Complete(value) => Step::Complete(Rc::new(value) as Value),
            Step::Failed(error) => Step::Failed(error),
        }
    }

    fn close(&mut self) {
        self.0.close();
    }
}

pub(crate) fn erase<C>(coro: C) -> Box<dyn Coro<Output = Value>>
where
    C: Coro + 'static,
    C::Output: 'static,
{
    Box::new(Erased(coro))
}

impl fmt::Debug for Request {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Resched => f.write_str("Resched"),
            Self::Sleep(duration) => f.debug_tuple("Sleep").field(duration).finish(),
            Self::Park => f.write_str("Park"),
            Self::Handle => f.write_str("Handle"),
            Self::Time => f.write_str("Time"),
            Self::CurrentTask => f.write_str("CurrentTask"),
            Self::Spawn(_) => f.write_str("Spawn(..)"),
            Self::RegisterIo(handle) => f.debug_tuple("RegisterIo").field(handle).finish(),
            Self::DeregisterIo(handle) => f.debug_tuple("DeregisterIo").field(handle).finish(),
            Self::WaitRead(handle, _) => f.debug_tuple("WaitRead").field(handle).finish(),
            Self::WaitWrite(handle, _) => f.debug_tuple("WaitWrite").field(handle).finish(),
            Self::WaitFuture(future) => f.debug_tuple("WaitFuture").field(future).finish(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn drive<C: Coro>(mut coro: C) -> Result<C::Output, Error> {
        loop {
            match coro.step(Reply::None) {
                Step::Yield(_) => {}
                Step::Complete(value) => return Ok(value),
                Step::Failed(error) => return Err(error),
            }
        }
    }

    #[test]
    fn and_then_chains_within_one_step() {
        let coro = ready(2).and_then(|n| ready(n * 3)).map(|n| n + 1);
        assert_eq!(drive(coro).unwrap(), 7);
    }

    #[test]
    fn and_then_skips_continuation_on_error() {
        let coro = fail::<i32>(Error::task("boom")).and_then(|_| ready(1));
        assert!(matches!(drive(coro), Err(Error::Task(_))));
    }

    #[test]
    fn then_observes_errors() {
        let coro = fail::<i32>(Error::task("boom")).then(|result| {
            assert!(result.is_err());
            ready(99)
        });
        assert_eq!(drive(coro).unwrap(), 99);
    }

    #[test]
    fn then_catches_thrown_errors() {
        let mut coro = yield_now().then(|result| match result {
            Err(Error::Cancelled) => ready("cleaned up"),
            other => panic!("unexpected outcome: {other:?}"),
        });
        assert!(matches!(coro.step(Reply::None), Step::Yield(_)));
        match coro.throw(Error::Cancelled) {
            Step::Complete(message) => assert_eq!(message, "cleaned up"),
            other => panic!("unexpected step: {other:?}"),
        }
    }

    #[test]
    fn yield_now_suspends_once() {
        let mut coro = yield_now();
        assert!(matches!(coro.step(Reply::None), Step::Yield(Request::Resched)));
        assert!(matches!(coro.step(Reply::None), Step::Complete(())));
    }
}
