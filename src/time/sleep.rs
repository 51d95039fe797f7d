// Copyright 2025. Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

use crate::coro::{Coro, Reply, Request, Step};
use std::time::Duration;

/// Suspend for the given duration.
///
/// A zero duration yields exactly once (the loop processes everything
/// else that is ready before resuming). The sleeping task parks on the
/// timer heap and does not block the loop.
pub fn sleep(duration: Duration) -> Sleep {
    Sleep {
        duration,
        state: SleepState::Armed,
    }
}

/// Suspend until cancelled or thrown into.
///
/// The task parks outside every queue; only [`Task::cancel`][crate::Task::cancel]
/// or [`Task::throw`][crate::Task::throw] revive it, and the error they
/// inject propagates out of the sleep.
pub fn sleep_forever() -> SleepForever {
    SleepForever(())
}

/// Coroutine returned by [`sleep`].
#[must_use = "coroutines do nothing unless stepped by the event loop"]
#[derive(Debug)]
pub struct Sleep {
    duration: Duration,
    state: SleepState,
}

#[derive(Debug, Copy, Clone, Eq, PartialEq)]
enum SleepState {
    Armed,
    Parked,
    Done,
}

impl Coro for Sleep {
    type Output = ();

    fn step(&mut self, _reply: Reply) -> Step<()> {
        match self.state {
            SleepState::Armed => {
                self.state = SleepState::Parked;
                Step::Yield(Request::Sleep(self.duration))
            }
            SleepState::Parked => {
                self.state = SleepState::Done;
                Step::Complete(())
            }
            SleepState::Done => panic!("coroutine stepped after completion"),
        }
    }
}

/// Coroutine returned by [`sleep_forever`].
#[must_use = "coroutines do nothing unless stepped by the event loop"]
#[derive(Debug)]
pub struct SleepForever(());

impl Coro for SleepForever {
    type Output = ();

    fn step(&mut self, _reply: Reply) -> Step<()> {
        // re-park on any spurious resumption
        Step::Yield(Request::Park)
    }
}
