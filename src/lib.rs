// Copyright 2025. Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! corio is a single-threaded cooperative runtime: one event loop
//! multiplexes many stackless tasks over one OS thread, driven by a timer
//! heap and readiness notifications from the platform's non-blocking I/O
//! demultiplexer.
//!
//! A task body is a [`Coro`] — a resumable computation that yields
//! [`Request`]s to the scheduler and is resumed with [`Reply`]s. Bodies
//! are composed from the primitives here ([`sleep`], [`spawn`],
//! [`wait_read`], locks, queues, events) with the combinators on
//! [`CoroExt`]:
//!
//! ```no_run
//! use corio::{CoroExt, run, sleep, spawn};
//! use std::time::Duration;
//!
//! let out = run(spawn(sleep(Duration::from_millis(10)).map(|()| 42))
//!     .and_then(|task| task.wait().map(move |()| task)))
//! .unwrap();
//! assert!(out.done());
//! ```

mod error;

pub mod coro;
pub mod executor;
pub mod future;
pub mod io;
pub mod sync;
pub mod task;
pub mod time;

pub use coro::{Coro, CoroExt, Reply, Request, Step, Value, fail, ready, yield_now};
pub use error::Error;
pub use executor::{EventLoop, LoopHandle, get_loop};
#[cfg(unix)]
pub use executor::run;
pub use future::Future;
#[cfg(unix)]
pub use io::PollSource;
pub use io::{
    Interest, IoHandle, RawHandle, ReadinessSource, unwrap_file, wait_read, wait_write, wrap_file,
};
pub use sync::{Conditional, Event, HeapQueue, Lock, Queue, ResourceLock, Semaphore, TaskGroup,
    wait_until};
pub use task::{Id, Task, current_task, spawn};
pub use time::{Clock, get_time, sleep, sleep_forever, timeout};
