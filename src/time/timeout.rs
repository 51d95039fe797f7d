// Copyright 2025. Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! Timeout scopes, built purely on scheduled cancellation.
//!
//! On entry the scope records the current task and spawns a canceller
//! that sleeps for the deadline and then cancels it. A *Cancelled* error
//! attributable to the scope's own deadline is translated into
//! [`Error::Timeout`] on the way out; any other error, and cancellation
//! that arrives from outside the scope, propagate unchanged. If the body
//! finishes first the canceller is cancelled, tombstoning its timer entry.

use crate::coro::{Coro, CoroExt, Reply, Request, Step, erase, ready};
use crate::error::Error;
use crate::task::Task;
use crate::time::sleep;
use std::cell::Cell;
use std::mem;
use std::rc::Rc;
use std::time::Duration;

/// Run `body` under a deadline.
///
/// The deadline is enforced by cancelling the task the scope runs inside,
/// so it only fires once the task reaches a suspension point (cancellation
/// is cooperative).
pub fn timeout<C: Coro>(duration: Duration, body: C) -> Timeout<C> {
    Timeout {
        duration,
        flags: Rc::new(Flags::default()),
        state: State::Init(body),
    }
}

/// Coroutine returned by [`timeout`].
#[must_use = "coroutines do nothing unless stepped by the event loop"]
pub struct Timeout<C> {
    duration: Duration,
    flags: Rc<Flags>,
    state: State<C>,
}

#[derive(Default)]
struct Flags {
    /// The canceller fired before the scope exited.
    fired: Cell<bool>,
    /// The body finished (either way) before the canceller fired.
    exited: Cell<bool>,
}

enum State<C> {
    Init(C),
    AwaitTask(C),
    AwaitCanceller(C),
    Running { body: C, canceller: Task },
    Done,
}

// === impl Timeout ===

impl<C: Coro> Timeout<C> {
    fn resume(&mut self, reply: Reply, error: Option<Error>) -> Step<C::Output> {
        match mem::replace(&mut self.state, State::Done) {
            State::Init(mut body) => {
                if let Some(error) = error {
                    body.close();
                    return Step::Failed(error);
                }
                self.state = State::AwaitTask(body);
                Step::Yield(Request::CurrentTask)
            }
            State::AwaitTask(mut body) => {
                if let Some(error) = error {
                    body.close();
                    return Step::Failed(error);
                }
                let Reply::Task(current) = reply else {
                    panic!("scheduler delivered a mismatched reply to timeout");
                };
                let flags = self.flags.clone();
                let canceller = sleep(self.duration).and_then(move |()| {
                    if !flags.exited.get() {
                        flags.fired.set(true);
                        current.cancel();
                    }
                    ready(())
                });
                self.state = State::AwaitCanceller(body);
                Step::Yield(Request::Spawn(erase(canceller)))
            }
            State::AwaitCanceller(mut body) => {
                if let Some(error) = error {
                    body.close();
                    return Step::Failed(error);
                }
                let Reply::Task(canceller) = reply else {
                    panic!("scheduler delivered a mismatched reply to timeout");
                };
                self.drive(body, canceller, Reply::None, None)
            }
            State::Running { body, canceller } => self.drive(body, canceller, reply, error),
            State::Done => panic!("coroutine stepped after completion"),
        }
    }

    fn drive(
        &mut self,
        mut body: C,
        canceller: Task,
        reply: Reply,
        error: Option<Error>,
    ) -> Step<C::Output> {
        let step = match error {
            Some(error) => body.throw(error),
            None => body.step(reply),
        };
        match step {
            Step::Yield(request) => {
                self.state = State::Running { body, canceller };
                Step::Yield(request)
            }
            Step::Complete(value) => {
                self.flags.exited.set(true);
                canceller.cancel();
                Step::Complete(value)
            }
            Step::Failed(error) => {
                let expired =
                    error.is_cancelled() && self.flags.fired.get() && !self.flags.exited.get();
                self.flags.exited.set(true);
                canceller.cancel();
                if expired {
                    Step::Failed(Error::Timeout)
                } else {
                    Step::Failed(error)
                }
            }
        }
    }
}

impl<C: Coro> Coro for Timeout<C> {
    type Output = C::Output;

    fn step(&mut self, reply: Reply) -> Step<Self::Output> {
        self.resume(reply, None)
    }

    fn throw(&mut self, error: Error) -> Step<Self::Output> {
        self.resume(Reply::None, Some(error))
    }

    fn close(&mut self) {
        if let State::Running { body, canceller } = mem::replace(&mut self.state, State::Done) {
            self.flags.exited.set(true);
            let mut body = body;
            body.close();
            canceller.cancel();
        }
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use crate::coro::CoroExt;
    use crate::executor::EventLoop;
    use crate::time::sleep;
    use std::time::Instant;
    use tracing_subscriber::EnvFilter;
    use tracing_subscriber::util::SubscriberInitExt;

    #[test]
    fn timeout_fires_and_translates_to_timeout_error() {
        let _trace = tracing_subscriber::fmt()
            .with_env_filter(EnvFilter::from_default_env())
            .set_default();

        let lp = EventLoop::new().unwrap();
        let begin = Instant::now();
        let result = lp.run_until(timeout(Duration::from_millis(100), sleep(Duration::from_secs(1))));
        let elapsed = begin.elapsed();

        assert!(matches!(result, Err(Error::Timeout)));
        assert!(
            elapsed >= Duration::from_millis(90) && elapsed < Duration::from_millis(500),
            "expected the scope to fire around 100ms, got {elapsed:?}"
        );
    }

    #[test]
    fn timeout_does_not_fire_when_the_body_finishes_first() {
        let lp = EventLoop::new().unwrap();
        let begin = Instant::now();
        let result = lp.run_until(timeout(
            Duration::from_secs(1),
            sleep(Duration::from_millis(50)).map(|()| 42),
        ));
        let elapsed = begin.elapsed();

        assert_eq!(result.unwrap(), 42);
        assert!(
            elapsed < Duration::from_millis(500),
            "the scope must not wait out its deadline, got {elapsed:?}"
        );
    }

    #[test]
    fn the_cancelled_canceller_does_not_keep_the_loop_alive() {
        let lp = EventLoop::new().unwrap();
        let begin = Instant::now();
        lp.run_until(timeout(Duration::from_secs(5), ready(()))).unwrap();
        lp.run_forever().unwrap();
        assert!(begin.elapsed() < Duration::from_secs(1));
    }

    #[test]
    fn external_cancellation_is_not_translated() {
        let lp = EventLoop::new().unwrap();
        let body = crate::task::spawn(timeout(
            Duration::from_secs(10),
            sleep(Duration::from_secs(10)),
        ))
        .and_then(|victim| {
            sleep(Duration::from_millis(20)).map(move |()| {
                assert!(victim.cancel());
                victim
            })
        })
        .and_then(|victim| victim.wait().then(move |_| ready(victim)));
        let victim = lp.run_until(body).unwrap();
        assert!(victim.cancelled());
        assert!(matches!(victim.result(), Err(Error::Cancelled)));
    }
}
