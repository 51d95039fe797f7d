// Copyright 2025. Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! Readiness-driven I/O.
//!
//! [`ReadinessSource`] abstracts the platform demultiplexer behind a
//! register/modify/deregister/select contract; [`PollSource`] implements
//! it over [`mio::Poll`]. The loop keeps one source for its lifetime and
//! a wait registry mapping each registered descriptor to FIFO queues of
//! read and write waiter futures.

use crate::coro::{Coro, Reply, Request, Step};
use crate::error::Error;
use crate::future::Future;
use std::cell::RefCell;
use std::collections::{HashMap, VecDeque};
use std::fmt;
use std::io;
use std::mem;
use std::rc::Rc;
use std::time::Duration;

cfg_if::cfg_if! {
    if #[cfg(unix)] {
        /// A raw OS descriptor.
        pub type RawHandle = std::os::fd::RawFd;
    } else {
        /// A raw OS descriptor.
        pub type RawHandle = std::os::windows::io::RawSocket;
    }
}

bitflags::bitflags! {
    /// Readiness interest: what a descriptor is watched (or ready) for.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct Interest: u8 {
        const READ = 1 << 0;
        const WRITE = 1 << 1;
    }
}

/// The platform readiness demultiplexer.
///
/// `select` blocks for at most `timeout` (`None` means unbounded) and
/// appends every descriptor that is currently ready, together with the
/// subset of `{READ, WRITE}` it is ready for.
pub trait ReadinessSource {
    fn register(&mut self, handle: RawHandle, interest: Interest) -> io::Result<()>;
    fn modify(&mut self, handle: RawHandle, interest: Interest) -> io::Result<()>;
    fn deregister(&mut self, handle: RawHandle) -> io::Result<()>;
    fn select(
        &mut self,
        timeout: Option<Duration>,
        ready: &mut Vec<(RawHandle, Interest)>,
    ) -> io::Result<()>;
}

cfg_if::cfg_if! {
    if #[cfg(unix)] {
        use mio::Token;
        use mio::unix::SourceFd;

        /// [`ReadinessSource`] backed by the OS selector via [`mio::Poll`]
        /// (epoll/kqueue).
        pub struct PollSource {
            poll: mio::Poll,
            events: mio::Events,
        }

        // === impl PollSource ===

        impl PollSource {
            /// # Errors
            ///
            /// Fails if the OS selector cannot be created.
            pub fn new() -> io::Result<Self> {
                Ok(Self {
                    poll: mio::Poll::new()?,
                    events: mio::Events::with_capacity(1024),
                })
            }
        }

        impl ReadinessSource for PollSource {
            fn register(&mut self, handle: RawHandle, interest: Interest) -> io::Result<()> {
                self.poll.registry().register(
                    &mut SourceFd(&handle),
                    Token(handle as usize),
                    mio_interest(interest),
                )
            }

            fn modify(&mut self, handle: RawHandle, interest: Interest) -> io::Result<()> {
                self.poll.registry().reregister(
                    &mut SourceFd(&handle),
                    Token(handle as usize),
                    mio_interest(interest),
                )
            }

            fn deregister(&mut self, handle: RawHandle) -> io::Result<()> {
                self.poll.registry().deregister(&mut SourceFd(&handle))
            }

            fn select(
                &mut self,
                timeout: Option<Duration>,
                ready: &mut Vec<(RawHandle, Interest)>,
            ) -> io::Result<()> {
                loop {
                    match self.poll.poll(&mut self.events, timeout) {
                        Err(err) if err.kind() == io::ErrorKind::Interrupted => continue,
                        Err(err) => return Err(err),
                        Ok(()) => break,
                    }
                }
                for event in self.events.iter() {
                    let mut readiness = Interest::empty();
                    if event.is_readable() {
                        readiness |= Interest::READ;
                    }
                    if event.is_writable() {
                        readiness |= Interest::WRITE;
                    }
                    if !readiness.is_empty() {
                        ready.push((event.token().0 as RawHandle, readiness));
                    }
                }
                Ok(())
            }
        }

        impl fmt::Debug for PollSource {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.debug_struct("PollSource").finish_non_exhaustive()
            }
        }

        fn mio_interest(interest: Interest) -> mio::Interest {
            match (interest.contains(Interest::READ), interest.contains(Interest::WRITE)) {
                (true, true) => mio::Interest::READABLE.add(mio::Interest::WRITABLE),
                (true, false) => mio::Interest::READABLE,
                (false, true) => mio::Interest::WRITABLE,
                (false, false) => panic!("interest must include read or write"),
            }
        }
    }
}

/// An I/O-capable handle to a descriptor registered with the loop.
///
/// Obtained through [`wrap_file`]; carries the per-descriptor wait queues.
#[derive(Clone)]
pub struct IoHandle {
    raw: RawHandle,
    queues: Rc<RefCell<WaitQueues>>,
}

#[derive(Default)]
struct WaitQueues {
    read: VecDeque<Future>,
    write: VecDeque<Future>,
}

// === impl IoHandle ===

impl IoHandle {
    #[must_use]
    pub fn raw(&self) -> RawHandle {
        self.raw
    }
}

impl fmt::Debug for IoHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let queues = self.queues.borrow();
        f.debug_struct("IoHandle")
            .field("raw", &self.raw)
            .field("read_waiters", &queues.read.len())
            .field("write_waiters", &queues.write.len())
            .finish()
    }
}

/// The loop-owned side of the registry: one readiness source plus the
/// per-descriptor wait slots.
pub(crate) struct IoDriver {
    source: Box<dyn ReadinessSource>,
    slots: HashMap<RawHandle, IoHandle>,
    scratch: Vec<(RawHandle, Interest)>,
}

// === impl IoDriver ===

impl IoDriver {
    pub(crate) fn new(source: Box<dyn ReadinessSource>) -> Self {
        Self {
            source,
            slots: HashMap::new(),
            scratch: Vec::new(),
        }
    }

    /// Register `raw` for read+write interest. Registering a descriptor
    /// twice hands back the existing slot.
    pub(crate) fn register(&mut self, raw: RawHandle) -> io::Result<IoHandle> {
        if let Some(handle) = self.slots.get(&raw) {
            return Ok(handle.clone());
        }
        self.source
            .register(raw, Interest::READ | Interest::WRITE)?;
        let handle = IoHandle {
            raw,
            queues: Rc::default(),
        };
        self.slots.insert(raw, handle.clone());
        tracing::trace!(raw, "descriptor registered");
        Ok(handle)
    }

    /// Drop the slot and unregister from the source. The drained waiters
    /// are returned for the caller to cancel outside the loop borrow.
    pub(crate) fn deregister(&mut self, handle: &IoHandle) -> (Vec<Future>, io::Result<()>) {
        let mut waiters = Vec::new();
        {
            let mut queues = handle.queues.borrow_mut();
            waiters.extend(queues.read.drain(..));
            waiters.extend(queues.write.drain(..));
        }
        if self.slots.remove(&handle.raw).is_none() {
            return (waiters, Ok(()));
        }
        tracing::trace!(raw = handle.raw, "descriptor deregistered");
        (waiters, self.source.deregister(handle.raw))
    }

    pub(crate) fn is_registered(&self, handle: &IoHandle) -> bool {
        self.slots
            .get(&handle.raw)
            .is_some_and(|slot| Rc::ptr_eq(&slot.queues, &handle.queues))
    }

    pub(crate) fn push_waiter(&mut self, handle: &IoHandle, interest: Interest, waiter: Future) {
        let mut queues = handle.queues.borrow_mut();
        if interest.contains(Interest::READ) {
            queues.read.push_back(waiter);
        } else {
            queues.write.push_back(waiter);
        }
    }

    pub(crate) fn has_registered(&self) -> bool {
        !self.slots.is_empty()
    }

    /// Whether any live waiter is queued anywhere.
    pub(crate) fn has_waiters(&self) -> bool {
        self.slots.values().any(|handle| {
            let queues = handle.queues.borrow();
            queues.read.iter().any(|f| !f.done()) || queues.write.iter().any(|f| !f.done())
        })
    }

    /// Block in the source for at most `timeout` and collect the futures
    /// to resolve: one live waiter per ready event per descriptor.
    pub(crate) fn poll(&mut self, timeout: Option<Duration>) -> io::Result<Vec<Future>> {
        let mut events = mem::take(&mut self.scratch);
        events.clear();
        let outcome = self.source.select(timeout, &mut events);

        let mut woken = Vec::new();
        for (raw, readiness) in events.drain(..) {
            let Some(handle) = self.slots.get(&raw) else {
                continue;
            };
            let mut queues = handle.queues.borrow_mut();
            if readiness.contains(Interest::READ)
                && let Some(waiter) = pop_live(&mut queues.read)
            {
                woken.push(waiter);
            }
            if readiness.contains(Interest::WRITE)
                && let Some(waiter) = pop_live(&mut queues.write)
            {
                woken.push(waiter);
            }
        }
        self.scratch = events;
        outcome?;
        Ok(woken)
    }
}

fn pop_live(queue: &mut VecDeque<Future>) -> Option<Future> {
    while let Some(waiter) = queue.pop_front() {
        if !waiter.done() {
            return Some(waiter);
        }
    }
    None
}

impl fmt::Debug for IoDriver {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("IoDriver")
            .field("slots", &self.slots.len())
            .finish_non_exhaustive()
    }
}

/// Register a raw descriptor with the running loop's readiness source.
///
/// The descriptor is watched for both read and write interest; the reply
/// is an [`IoHandle`] accepted by [`wait_read`]/[`wait_write`]. Ownership
/// of the descriptor stays with the caller.
pub fn wrap_file(raw: RawHandle) -> WrapFile {
    WrapFile {
        raw,
        requested: false,
    }
}

/// Coroutine returned by [`wrap_file`].
#[must_use = "coroutines do nothing unless stepped by the event loop"]
pub struct WrapFile {
    raw: RawHandle,
    requested: bool,
}

impl Coro for WrapFile {
    type Output = IoHandle;

    fn step(&mut self, reply: Reply) -> Step<IoHandle> {
        if !self.requested {
            self.requested = true;
            return Step::Yield(Request::RegisterIo(self.raw));
        }
        let Reply::Io(handle) = reply else {
            panic!("scheduler delivered a mismatched reply to wrap_file");
        };
        Step::Complete(handle)
    }
}

/// Cancel every pending waiter on the handle and unregister its
/// descriptor from the readiness source.
pub fn unwrap_file(handle: &IoHandle) -> UnwrapFile {
    UnwrapFile {
        handle: Some(handle.clone()),
    }
}

/// Coroutine returned by [`unwrap_file`].
#[must_use = "coroutines do nothing unless stepped by the event loop"]
pub struct UnwrapFile {
    handle: Option<IoHandle>,
}

impl Coro for UnwrapFile {
    type Output = ();

    fn step(&mut self, _reply: Reply) -> Step<()> {
        match self.handle.take() {
            Some(handle) => Step::Yield(Request::DeregisterIo(handle)),
            None => Step::Complete(()),
        }
    }
}

/// Suspend until the descriptor is ready to read.
///
/// One waiter is woken per readiness event per tick, in FIFO order. The
/// source may be edge-triggered: with several concurrent waiters on one
/// descriptor, a waiter behind the first may need a fresh edge to wake.
pub fn wait_read(handle: &IoHandle) -> WaitReady {
    WaitReady {
        handle: handle.clone(),
        interest: Interest::READ,
        state: WaitState::Init,
    }
}

/// Suspend until the descriptor is ready to write. See [`wait_read`].
pub fn wait_write(handle: &IoHandle) -> WaitReady {
    WaitReady {
        handle: handle.clone(),
        interest: Interest::WRITE,
        state: WaitState::Init,
    }
}

/// Coroutine returned by [`wait_read`] and [`wait_write`].
#[must_use = "coroutines do nothing unless stepped by the event loop"]
pub struct WaitReady {
    handle: IoHandle,
    interest: Interest,
    state: WaitState,
}

enum WaitState {
    Init,
    Parked(Future),
    Done,
}

impl Coro for WaitReady {
    type Output = ();

    fn step(&mut self, _reply: Reply) -> Step<()> {
        match mem::replace(&mut self.state, WaitState::Done) {
            WaitState::Init => {
                let waiter = Future::new();
                self.state = WaitState::Parked(waiter.clone());
                if self.interest.contains(Interest::READ) {
                    Step::Yield(Request::WaitRead(self.handle.clone(), waiter))
                } else {
                    Step::Yield(Request::WaitWrite(self.handle.clone(), waiter))
                }
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

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use crate::coro::{CoroExt, ready};
    use crate::executor::EventLoop;
    use crate::task::spawn;
    use crate::time::sleep;
    use std::io::{Read, Write};
    use std::os::fd::AsRawFd;
    use std::os::unix::net::UnixStream;
    use std::time::Instant;
    use tracing_subscriber::EnvFilter;
    use tracing_subscriber::util::SubscriberInitExt;

    fn pair() -> (UnixStream, UnixStream) {
        let (a, b) = UnixStream::pair().unwrap();
        a.set_nonblocking(true).unwrap();
        b.set_nonblocking(true).unwrap();
        (a, b)
    }

    #[test]
    fn poll_source_reports_writability() {
        let (a, _b) = pair();
        let mut source = PollSource::new().unwrap();
        source.register(a.as_raw_fd(), Interest::WRITE).unwrap();

        let mut events = Vec::new();
        source.select(Some(Duration::from_millis(100)), &mut events).unwrap();
        assert!(
            events
                .iter()
                .any(|(raw, i)| *raw == a.as_raw_fd() && i.contains(Interest::WRITE))
        );
        source.deregister(a.as_raw_fd()).unwrap();
    }

    #[test]
    fn read_wakeup_crosses_a_socket_pair() {
        let _trace = tracing_subscriber::fmt()
            .with_env_filter(EnvFilter::from_default_env())
            .set_default();

        let (reader_sock, writer_sock) = pair();
        let lp = EventLoop::new().unwrap();

        lp.spawn(sleep(Duration::from_millis(50)).map(move |()| {
            (&writer_sock).write_all(b"hi").unwrap();
        }));

        let fd = reader_sock.as_raw_fd();
        let begin = Instant::now();
        let body = wrap_file(fd).and_then(move |handle| {
            let cleanup = handle.clone();
            wait_read(&handle)
                .map(move |()| {
                    let mut buf = [0_u8; 8];
                    let n = (&reader_sock).read(&mut buf).unwrap();
                    String::from_utf8_lossy(&buf[..n]).into_owned()
                })
                .and_then(move |message| unwrap_file(&cleanup).map(move |()| message))
        });
        let message = lp.run_until(body).unwrap();
        let elapsed = begin.elapsed();

        assert_eq!(message, "hi");
        assert!(
            elapsed >= Duration::from_millis(40) && elapsed < Duration::from_millis(500),
            "reader should wake with the 50ms send, got {elapsed:?}"
        );
    }

    #[test]
    fn write_readiness_is_immediate_on_a_fresh_socket() {
        let (a, _b) = pair();
        let lp = EventLoop::new().unwrap();
        let fd = a.as_raw_fd();
        let body = wrap_file(fd).and_then(|handle| wait_write(&handle));
        let begin = Instant::now();
        lp.run_until(body).unwrap();
        assert!(begin.elapsed() < Duration::from_millis(200));
    }

    #[test]
    fn unwrap_file_cancels_pending_waiters() {
        let (a, _b) = pair();
        let lp = EventLoop::new().unwrap();
        let fd = a.as_raw_fd();

        let body = wrap_file(fd).and_then(|handle| {
            let unwrapped = handle.clone();
            spawn(wait_read(&handle)).and_then(move |waiter| {
                sleep(Duration::from_millis(10))
                    .and_then(move |()| unwrap_file(&unwrapped))
                    .and_then(move |()| waiter.wait().then(move |_| ready(waiter)))
            })
        });
        let waiter = lp.run_until(body).unwrap();
        assert!(waiter.cancelled());
    }

    #[test]
    fn waiting_on_a_deregistered_handle_is_invalid() {
        let (a, _b) = pair();
        let lp = EventLoop::new().unwrap();
        let fd = a.as_raw_fd();

        let body = wrap_file(fd).and_then(|handle| {
            let stale = handle.clone();
            unwrap_file(&handle).and_then(move |()| wait_read(&stale))
        });
        assert!(matches!(lp.run_until(body), Err(Error::InvalidYield(_))));
    }
}
