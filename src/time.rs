// Copyright 2025. Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! Time utilities: the loop clock, sleeping, and timeout scopes.

mod clock;
mod sleep;
mod timeout;
pub(crate) mod timer;

pub use clock::Clock;
pub use sleep::{Sleep, SleepForever, sleep, sleep_forever};
pub use timeout::{Timeout, timeout};

use crate::coro::{Coro, Reply, Request, Step};
use std::time::Duration;

/// Ask the scheduler for the loop's monotonic time.
///
/// The value is the `Duration` since the loop's clock epoch, good for
/// measuring waits and deadlines; it never goes backwards.
pub fn get_time() -> GetTime {
    GetTime { requested: false }
}

/// Coroutine returned by [`get_time`].
#[must_use = "coroutines do nothing unless stepped by the event loop"]
pub struct GetTime {
    requested: bool,
}

impl Coro for GetTime {
    type Output = Duration;

    fn step(&mut self, reply: Reply) -> Step<Duration> {
        if !self.requested {
            self.requested = true;
            return Step::Yield(Request::Time);
        }
        let Reply::Time(now) = reply else {
            panic!("scheduler delivered a mismatched reply to get_time");
        };
        Step::Complete(now)
    }
}
