// Copyright 2025. Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! Synchronization primitives built on futures, spawn, and sleep.
//!
//! Everything here sequences *logical* critical sections across
//! suspension points; within the loop thread there is no data race to
//! guard against. Waiters are served FIFO, and a waiter whose task is
//! cancelled is skipped instead of being woken as a corpse.

mod event;
mod lock;
mod queue;
mod task_group;

pub use event::{Conditional, Event, wait_until};
pub use lock::{Lock, ResourceLock, Semaphore};
pub use queue::{HeapQueue, Queue};
pub use task_group::TaskGroup;
