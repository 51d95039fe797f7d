// Copyright 2025. Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! Bounded async queues.
//!
//! `put`/`get` suspend when the queue is full/empty; items travel through
//! typed slots, never through the erased task-value channel. Waiters
//! whose tasks were cancelled are skipped: a producer walking the getter
//! queue keeps the item for the next live consumer, and a consumer
//! refilling from the putter queue drops a cancelled putter's item the
//! way the putter would have observed anyway.

use crate::coro::{Coro, Reply, Request, Step, unit};
use crate::error::Error;
use crate::future::Future;
use std::cell::RefCell;
use std::cmp::Reverse;
use std::collections::{BinaryHeap, VecDeque};
use std::fmt;
use std::mem;
use std::rc::Rc;

/// Item storage policy: FIFO/LIFO sequence or ordered heap.
pub trait Store<T>: Default {
    fn push(&mut self, item: T);
    fn pop(&mut self) -> Option<T>;
    fn len(&self) -> usize;
}

/// Sequential storage behind [`Queue`].
pub struct SeqStore<T> {
    items: VecDeque<T>,
    lifo: bool,
}

impl<T> Default for SeqStore<T> {
    fn default() -> Self {
        Self {
            items: VecDeque::new(),
            lifo: false,
        }
    }
}

impl<T> Store<T> for SeqStore<T> {
    fn push(&mut self, item: T) {
        self.items.push_back(item);
    }

    fn pop(&mut self) -> Option<T> {
        if self.lifo {
            self.items.pop_back()
        } else {
            self.items.pop_front()
        }
    }

    fn len(&self) -> usize {
        self.items.len()
    }
}

/// Ordered storage behind [`HeapQueue`].
pub struct HeapStore<T: Ord> {
    items: BinaryHeap<Reverse<T>>,
}

impl<T: Ord> Default for HeapStore<T> {
    fn default() -> Self {
        Self {
            items: BinaryHeap::new(),
        }
    }
}

impl<T: Ord> Store<T> for HeapStore<T> {
    fn push(&mut self, item: T) {
        self.items.push(Reverse(item));
    }

    fn pop(&mut self) -> Option<T> {
        self.items.pop().map(|Reverse(item)| item)
    }

    fn len(&self) -> usize {
        self.items.len()
    }
}

struct Inner<T, S> {
    store: S,
    /// 0 means unbounded.
    capacity: usize,
    getters: VecDeque<Getter<T>>,
    putters: VecDeque<Putter<T>>,
}

struct Getter<T> {
    future: Future,
    slot: Rc<RefCell<Option<T>>>,
}

struct Putter<T> {
    future: Future,
    item: Rc<RefCell<Option<T>>>,
}

impl<T, S: Store<T>> Inner<T, S> {
    fn full(&self) -> bool {
        self.capacity != 0 && self.store.len() >= self.capacity
    }

    fn empty(&self) -> bool {
        self.store.len() == 0
    }

    /// Hand `item` straight to the first live getter, or stow it.
    fn deliver(&mut self, item: T) -> Option<Future> {
        while let Some(getter) = self.getters.pop_front() {
            if getter.future.done() {
                continue;
            }
            *getter.slot.borrow_mut() = Some(item);
            return Some(getter.future);
        }
        self.store.push(item);
        None
    }

    /// Refill from the first live putter after a pop freed a slot.
    fn refill(&mut self) -> Option<Future> {
        while let Some(putter) = self.putters.pop_front() {
            if putter.future.done() {
                // a cancelled putter's item is dropped with it
                continue;
            }
            if let Some(item) = putter.item.borrow_mut().take() {
                self.store.push(item);
            }
            return Some(putter.future);
        }
        None
    }
}

/// A bounded FIFO (or LIFO) queue with async `put`/`get`.
pub struct Queue<T> {
    inner: Rc<RefCell<Inner<T, SeqStore<T>>>>,
}

// === impl Queue ===

impl<T: 'static> Queue<T> {
    /// A FIFO queue. `capacity` 0 means unbounded.
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        Self {
            inner: new_inner(capacity, SeqStore::default()),
        }
    }

    /// A LIFO queue. `capacity` 0 means unbounded.
    #[must_use]
    pub fn lifo(capacity: usize) -> Self {
        Self {
            inner: new_inner(
                capacity,
                SeqStore {
                    items: VecDeque::new(),
                    lifo: true,
                },
            ),
        }
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.inner.borrow().store.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.inner.borrow().empty()
    }

    #[must_use]
    pub fn is_full(&self) -> bool {
        self.inner.borrow().full()
    }

    /// Push an item, suspending while the queue is full.
    pub fn put(&self, item: T) -> Put<T, SeqStore<T>> {
        put(&self.inner, item)
    }

    /// Pop an item, suspending while the queue is empty.
    pub fn get(&self) -> Get<T, SeqStore<T>> {
        get(&self.inner)
    }

    /// Push without suspending.
    ///
    /// # Errors
    ///
    /// Fails with [`Error::WouldBlock`] when the queue is full.
    pub fn put_nowait(&self, item: T) -> Result<(), Error> {
        put_nowait(&self.inner, item)
    }

    /// Pop without suspending.
    ///
    /// # Errors
    ///
    /// Fails with [`Error::WouldBlock`] when the queue is empty.
    pub fn get_nowait(&self) -> Result<T, Error> {
        get_nowait(&self.inner)
    }

    /// Re-yield until the queue is empty.
    pub fn join(&self) -> Join<T, SeqStore<T>> {
        Join {
            inner: self.inner.clone(),
        }
    }
}

impl<T> Clone for Queue<T> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

impl<T> fmt::Debug for Queue<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let inner = self.inner.borrow();
        f.debug_struct("Queue")
            .field("len", &inner.store.len())
            .field("capacity", &inner.capacity)
            .field("lifo", &inner.store.lifo)
            .field("getters", &inner.getters.len())
            .field("putters", &inner.putters.len())
            .finish()
    }
}

/// A bounded queue that pops items in ascending order.
pub struct HeapQueue<T: Ord> {
    inner: Rc<RefCell<Inner<T, HeapStore<T>>>>,
}

// === impl HeapQueue ===

impl<T: Ord + 'static> HeapQueue<T> {
    /// An ordered queue. `capacity` 0 means unbounded.
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        Self {
            inner: new_inner(capacity, HeapStore::default()),
        }
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.inner.borrow().store.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.inner.borrow().empty()
    }

    #[must_use]
    pub fn is_full(&self) -> bool {
        self.inner.borrow().full()
    }

    /// See [`Queue::put`].
    pub fn put(&self, item: T) -> Put<T, HeapStore<T>> {
        put(&self.inner, item)
    }

    /// See [`Queue::get`].
    pub fn get(&self) -> Get<T, HeapStore<T>> {
        get(&self.inner)
    }

    /// See [`Queue::put_nowait`].
    ///
    /// # Errors
    ///
    /// Fails with [`Error::WouldBlock`] when the queue is full.
    pub fn put_nowait(&self, item: T) -> Result<(), Error> {
        put_nowait(&self.inner, item)
    }

    /// See [`Queue::get_nowait`].
    ///
    /// # Errors
    ///
    /// Fails with [`Error::WouldBlock`] when the queue is empty.
    pub fn get_nowait(&self) -> Result<T, Error> {
        get_nowait(&self.inner)
    }
}

impl<T: Ord> Clone for HeapQueue<T> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

impl<T: Ord> fmt::Debug for HeapQueue<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let inner = self.inner.borrow();
        f.debug_struct("HeapQueue")
            .field("len", &inner.store.len())
            .field("capacity", &inner.capacity)
            .finish()
    }
}

fn new_inner<T, S>(capacity: usize, store: S) -> Rc<RefCell<Inner<T, S>>> {
    Rc::new(RefCell::new(Inner {
        store,
        capacity,
        getters: VecDeque::new(),
        putters: VecDeque::new(),
    }))
}

fn put<T, S: Store<T>>(inner: &Rc<RefCell<Inner<T, S>>>, item: T) -> Put<T, S> {
    Put {
        inner: inner.clone(),
        state: PutState::Init(item),
    }
}

fn get<T, S: Store<T>>(inner: &Rc<RefCell<Inner<T, S>>>) -> Get<T, S> {
    Get {
        inner: inner.clone(),
        state: GetState::Init,
    }
}

fn put_nowait<T, S: Store<T>>(inner: &Rc<RefCell<Inner<T, S>>>, item: T) -> Result<(), Error> {
    let delivered = {
        let mut inner = inner.borrow_mut();
        if inner.full() {
            return Err(Error::WouldBlock);
        }
        inner.deliver(item)
    };
    if let Some(future) = delivered {
        let _ = future.set_result(unit());
    }
    Ok(())
}

fn get_nowait<T, S: Store<T>>(inner: &Rc<RefCell<Inner<T, S>>>) -> Result<T, Error> {
    let (item, refilled) = {
        let mut inner = inner.borrow_mut();
        let Some(item) = inner.store.pop() else {
            return Err(Error::WouldBlock);
        };
        (item, inner.refill())
    };
    if let Some(future) = refilled {
        let _ = future.set_result(unit());
    }
    Ok(item)
}

/// Coroutine returned by [`Queue::put`] and [`HeapQueue::put`].
#[must_use = "coroutines do nothing unless stepped by the event loop"]
pub struct Put<T, S> {
    inner: Rc<RefCell<Inner<T, S>>>,
    state: PutState<T>,
}

enum PutState<T> {
    Init(T),
    Waiting(Future),
    Done,
}

impl<T, S: Store<T>> Coro for Put<T, S> {
    type Output = ();

    fn step(&mut self, _reply: Reply) -> Step<()> {
        match mem::replace(&mut self.state, PutState::Done) {
            PutState::Init(item) => {
                let (delivered, parked) = {
                    let mut inner = self.inner.borrow_mut();
                    if inner.full() {
                        let future = Future::new();
                        inner.putters.push_back(Putter {
                            future: future.clone(),
                            item: Rc::new(RefCell::new(Some(item))),
                        });
                        (None, Some(future))
                    } else {
                        (inner.deliver(item), None)
                    }
                };
                if let Some(future) = delivered {
                    let _ = future.set_result(unit());
                }
                match parked {
                    Some(future) => {
                        let pending = future.clone();
                        self.state = PutState::Waiting(future);
                        Step::Yield(Request::WaitFuture(pending))
                    }
                    None => Step::Complete(()),
                }
            }
            PutState::Waiting(future) => match future.result() {
                Ok(_) => Step::Complete(()),
                Err(Error::NotReady) => {
                    let pending = future.clone();
                    self.state = PutState::Waiting(future);
                    Step::Yield(Request::WaitFuture(pending))
                }
                Err(error) => Step::Failed(error),
            },
            PutState::Done => panic!("coroutine stepped after completion"),
        }
    }

    fn throw(&mut self, error: Error) -> Step<()> {
        if let PutState::Waiting(future) = &self.state {
            future.cancel();
        }
        self.state = PutState::Done;
        Step::Failed(error)
    }
}

/// Coroutine returned by [`Queue::get`] and [`HeapQueue::get`].
#[must_use = "coroutines do nothing unless stepped by the event loop"]
pub struct Get<T, S> {
    inner: Rc<RefCell<Inner<T, S>>>,
    state: GetState<T>,
}

enum GetState<T> {
    Init,
    Waiting {
        future: Future,
        slot: Rc<RefCell<Option<T>>>,
    },
    Done,
}

impl<T, S: Store<T>> Coro for Get<T, S> {
    type Output = T;

    fn step(&mut self, _reply: Reply) -> Step<T> {
        match mem::replace(&mut self.state, GetState::Done) {
            GetState::Init => {
                let (item, refilled, parked) = {
                    let mut inner = self.inner.borrow_mut();
                    match inner.store.pop() {
                        Some(item) => (Some(item), inner.refill(), None),
                        None => {
                            let future = Future::new();
                            let slot = Rc::new(RefCell::new(None));
                            inner.getters.push_back(Getter {
                                future: future.clone(),
                                slot: slot.clone(),
                            });
                            (None, None, Some((future, slot)))
                        }
                    }
                };
                if let Some(future) = refilled {
                    let _ = future.set_result(unit());
                }
                if let Some(item) = item {
                    return Step::Complete(item);
                }
                let (future, slot) = parked.expect("empty pop without a parked getter");
                let pending = future.clone();
                self.state = GetState::Waiting { future, slot };
                Step::Yield(Request::WaitFuture(pending))
            }
            GetState::Waiting { future, slot } => match future.result() {
                Ok(_) => {
                    let item = slot
                        .borrow_mut()
                        .take()
                        .expect("queue getter resolved without an item");
                    Step::Complete(item)
                }
                Err(Error::NotReady) => {
                    let pending = future.clone();
                    self.state = GetState::Waiting { future, slot };
                    Step::Yield(Request::WaitFuture(pending))
                }
                Err(error) => Step::Failed(error),
            },
            GetState::Done => panic!("coroutine stepped after completion"),
        }
    }

    fn throw(&mut self, error: Error) -> Step<T> {
        if let GetState::Waiting { future, slot } = &self.state {
            if !future.cancel() && future.result().is_ok() {
                // an item was already handed to us; put it back in
                // circulation instead of dropping it with this task
                let item = slot.borrow_mut().take();
                if let Some(item) = item {
                    let delivered = self.inner.borrow_mut().deliver(item);
                    if let Some(next) = delivered {
                        let _ = next.set_result(unit());
                    }
                }
            }
        }
        self.state = GetState::Done;
        Step::Failed(error)
    }
}

/// Coroutine returned by [`Queue::join`].
#[must_use = "coroutines do nothing unless stepped by the event loop"]
pub struct Join<T, S> {
    inner: Rc<RefCell<Inner<T, S>>>,
}

impl<T, S: Store<T>> Coro for Join<T, S> {
    type Output = ();

    fn step(&mut self, _reply: Reply) -> Step<()> {
        if self.inner.borrow().empty() {
            Step::Complete(())
        } else {
            Step::Yield(Request::Resched)
        }
    }
}
