// Copyright 2025. Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

use std::io;
use std::rc::Rc;

/// Everything that can go wrong inside the runtime.
///
/// Errors raised by a task body surface as that task's error and are
/// re-raised to whoever awaits the task. The loop itself never fails on a
/// user error; it only propagates.
#[derive(Clone, Debug, thiserror::Error)]
pub enum Error {
    /// The task or future was explicitly cancelled.
    #[error("task or future was cancelled")]
    Cancelled,
    /// A timeout scope's deadline expired before its body finished.
    #[error("timeout scope deadline expired")]
    Timeout,
    /// `set_result`/`set_exception` on a future that is already terminal.
    #[error("future has already completed")]
    AlreadyCompleted,
    /// `result` on a future that has not reached a terminal state.
    #[error("result is not ready")]
    NotReady,
    /// A lock or semaphore was released by a task that does not hold it.
    #[error("released by a task that does not hold it")]
    NotHolder,
    /// A non-blocking queue operation on a full or empty queue.
    #[error("operation would block")]
    WouldBlock,
    /// A yield request that is invalid in its current context.
    #[error("invalid yield request: {0}")]
    InvalidYield(&'static str),
    /// A re-entrant `run_until`/`run_forever` on an active loop.
    #[error("event loop is already running")]
    LoopAlreadyRunning,
    /// The readiness source failed.
    #[error("i/o driver error: {0}")]
    Io(Rc<io::Error>),
    /// An error raised by a task body.
    #[error("task failed: {0}")]
    Task(Rc<str>),
}

impl Error {
    /// A user-level task error carrying a message.
    pub fn task(message: impl AsRef<str>) -> Self {
        Self::Task(Rc::from(message.as_ref()))
    }

    /// `true` for the cancellation marker injected by [`cancel`][crate::Task::cancel].
    #[inline]
    pub fn is_cancelled(&self) -> bool {
        matches!(self, Self::Cancelled)
    }
}

impl From<io::Error> for Error {
    fn from(err: io::Error) -> Self {
        Self::Io(Rc::new(err))
    }
}
