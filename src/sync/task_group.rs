// Copyright 2025. Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

use crate::coro::{Coro, Reply, Request, Step, Value, erase};
use crate::error::Error;
use crate::task::Task;
use std::cell::RefCell;
use std::fmt;
use std::mem;
use std::rc::Rc;

/// A group of tasks joined together.
///
/// `spawn` records each child; `join` suspends until every recorded task
/// is terminal and reports the first non-cancellation error among them.
/// With [`cancel_on_error`][TaskGroup::cancel_on_error], the first error
/// observed during the join cancels the remaining siblings.
#[derive(Clone, Default)]
pub struct TaskGroup {
    tasks: Rc<RefCell<Vec<Task>>>,
    cancel_on_error: bool,
}

// === impl TaskGroup ===

impl TaskGroup {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Cancel the remaining siblings as soon as one task errors.
    #[must_use]
    pub fn cancel_on_error(mut self) -> Self {
        self.cancel_on_error = true;
        self
    }

    /// Spawn a coroutine into the group.
    pub fn spawn<C>(&self, coro: C) -> GroupSpawn
    where
        C: Coro + 'static,
        C::Output: 'static,
    {
        GroupSpawn {
            tasks: self.tasks.clone(),
            state: SpawnState::Init(erase(coro)),
        }
    }

    /// The tasks recorded so far.
    #[must_use]
    pub fn tasks(&self) -> Vec<Task> {
        self.tasks.borrow().clone()
    }

    /// Cancel every recorded task that has not finished.
    pub fn cancel_rest(&self) {
        for task in self.tasks.borrow().iter() {
            if !task.done() {
                task.cancel();
            }
        }
    }

    /// Wait for every recorded task, including ones spawned while
    /// joining.
    pub fn join(&self) -> Join {
        Join {
            group: self.clone(),
            next: 0,
            first_error: None,
        }
    }
}

impl fmt::Debug for TaskGroup {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TaskGroup")
            .field("tasks", &self.tasks.borrow().len())
            .field("cancel_on_error", &self.cancel_on_error)
            .finish()
    }
}

/// Coroutine returned by [`TaskGroup::spawn`].
#[must_use = "coroutines do nothing unless stepped by the event loop"]
pub struct GroupSpawn {
    tasks: Rc<RefCell<Vec<Task>>>,
    state: SpawnState,
}

enum SpawnState {
    Init(Box<dyn Coro<Output = Value>>),
    Requested,
    Done,
}

impl Coro for GroupSpawn {
    type Output = Task;

    fn step(&mut self, reply: Reply) -> Step<Task> {
        match mem::replace(&mut self.state, SpawnState::Done) {
            SpawnState::Init(body) => {
                self.state = SpawnState::Requested;
                Step::Yield(Request::Spawn(body))
            }
            SpawnState::Requested => {
                let Reply::Task(task) = reply else {
                    panic!("scheduler delivered a mismatched reply to spawn");
                };
                self.tasks.borrow_mut().push(task.clone());
                Step::Complete(task)
            }
            SpawnState::Done => panic!("coroutine stepped after completion"),
        }
    }
}

/// Coroutine returned by [`TaskGroup::join`].
#[must_use = "coroutines do nothing unless stepped by the event loop"]
pub struct Join {
    group: TaskGroup,
    next: usize,
    first_error: Option<Error>,
}

impl Coro for Join {
    type Output = ();

    fn step(&mut self, _reply: Reply) -> Step<()> {
        loop {
            let task = {
                let tasks = self.group.tasks.borrow();
                match tasks.get(self.next) {
                    Some(task) => task.clone(),
                    None => break,
                }
            };
            if !task.done() {
                return Step::Yield(Request::WaitFuture(task.future().clone()));
            }
            self.next += 1;
            if let Err(error) = task.result()
                && !error.is_cancelled()
                && self.first_error.is_none()
            {
                if self.group.cancel_on_error {
                    self.group.cancel_rest();
                }
                self.first_error = Some(error);
            }
        }
        match self.first_error.take() {
            Some(error) => Step::Failed(error),
            None => Step::Complete(()),
        }
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use crate::coro::{CoroExt, fail, ready};
    use crate::executor::EventLoop;
    use crate::time::sleep;
    use std::cell::Cell;
    use std::time::Duration;

    #[test]
    fn join_waits_for_every_member() {
        let lp = EventLoop::new().unwrap();
        let group = TaskGroup::new();
        let finished: Rc<Cell<usize>> = Rc::new(Cell::new(0));

        let body = {
            let group = group.clone();
            let g2 = group.clone();
            let g3 = group.clone();
            let (f1, f2) = (finished.clone(), finished.clone());
            group
                .spawn(sleep(Duration::from_millis(10)).map(move |()| f1.set(f1.get() + 1)))
                .and_then(move |_| {
                    g2.spawn(sleep(Duration::from_millis(30)).map(move |()| f2.set(f2.get() + 1)))
                })
                .and_then(move |_| g3.join())
        };
        lp.run_until(body).unwrap();
        assert_eq!(finished.get(), 2);
        assert!(group.tasks().iter().all(Task::done));
    }

    #[test]
    fn join_reports_the_first_member_error() {
        let lp = EventLoop::new().unwrap();
        let group = TaskGroup::new();
        let body = {
            let group = group.clone();
            let g2 = group.clone();
            let g3 = group.clone();
            group
                .spawn(sleep(Duration::from_millis(5)))
                .and_then(move |_| g2.spawn(fail::<()>(Error::task("member down"))))
                .and_then(move |_| g3.join())
        };
        assert!(matches!(lp.run_until(body), Err(Error::Task(_))));
    }

    #[test]
    fn cancel_on_error_stops_the_siblings() {
        let lp = EventLoop::new().unwrap();
        let group = TaskGroup::new().cancel_on_error();
        let body = {
            let group = group.clone();
            let g2 = group.clone();
            let g3 = group.clone();
            group
                .spawn(fail::<()>(Error::task("early failure")))
                .and_then(move |_| g2.spawn(sleep(Duration::from_secs(3600))))
                .and_then(move |_| g3.join())
        };
        let begin = std::time::Instant::now();
        assert!(matches!(lp.run_until(body), Err(Error::Task(_))));
        lp.run_forever().unwrap();
        assert!(
            begin.elapsed() < Duration::from_secs(60),
            "the sleeping sibling must be cancelled, not awaited"
        );
        assert!(group.tasks()[1].cancelled());
    }

    #[test]
    fn cancel_rest_cancels_unfinished_members() {
        let lp = EventLoop::new().unwrap();
        let group = TaskGroup::new();
        let body = {
            let group = group.clone();
            let g2 = group.clone();
            group
                .spawn(sleep(Duration::from_secs(3600)))
                .and_then(move |_| {
                    sleep(Duration::from_millis(5)).map(move |()| g2.cancel_rest())
                })
                .and_then(move |()| ready(()))
        };
        lp.run_until(body).unwrap();
        lp.run_forever().unwrap();
        assert!(group.tasks()[0].cancelled());
    }
}
