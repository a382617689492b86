// SPDX-License-Identifier: Apache-2.0 OR MIT

//! Readiness multiplexer.
//!
//! Split into two halves at creation: [`Poller`] is the shared side
//! (registration, re-arm, capacity accounting, stop) that any thread may
//! use, and [`EventLoop`] is the polling side owned by the worker
//! thread. Tokens are the raw descriptor, so a ready event resolves back
//! to its handle through the registry alone.
//!
//! Delivery is effectively one-shot: the loop hands out one batch and
//! never polls again before the caller finishes dispatching it, and each
//! descriptor is re-armed only after its event is handled. A re-arm that
//! races a close is expected and tolerated.

use std::os::fd::RawFd;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use mio::event::Source;
use mio::{Events, Interest, Poll, Registry, Token, Waker};

use crate::error::{set_last_error, NetError};

/// Token reserved for the stop waker; descriptor tokens never collide
/// with it.
const WAKER_TOKEN: Token = Token(usize::MAX);

/// Shared half of the multiplexer.
pub struct Poller {
    registry: Registry,
    waker: Arc<Waker>,
    live: Arc<AtomicUsize>,
    stopping: Arc<AtomicBool>,
    capacity: usize,
}

/// Polling half of the multiplexer, owned by the worker thread.
pub struct EventLoop {
    poll: Poll,
    events: Events,
    stopping: Arc<AtomicBool>,
    timeout: Duration,
}

impl Poller {
    /// Create both halves. `capacity` bounds the number of registered
    /// descriptors; `timeout` bounds each wait so the stop flag is
    /// observed even on an idle loop.
    pub fn create(capacity: usize, timeout: Duration) -> Result<(Poller, EventLoop), NetError> {
        let poll = match Poll::new() {
            Ok(p) => p,
            Err(e) => {
                log::warn!("[poller] create failed: {}", e);
                set_last_error(NetError::PollerCreate);
                return Err(NetError::PollerCreate);
            }
        };
        let registry = match poll.registry().try_clone() {
            Ok(r) => r,
            Err(e) => {
                log::warn!("[poller] registry clone failed: {}", e);
                set_last_error(NetError::PollerCreate);
                return Err(NetError::PollerCreate);
            }
        };
        let waker = match Waker::new(poll.registry(), WAKER_TOKEN) {
            Ok(w) => Arc::new(w),
            Err(e) => {
                log::warn!("[poller] waker create failed: {}", e);
                set_last_error(NetError::PollerCreate);
                return Err(NetError::PollerCreate);
            }
        };
        let stopping = Arc::new(AtomicBool::new(false));
        let shared = Poller {
            registry,
            waker,
            live: Arc::new(AtomicUsize::new(0)),
            stopping: stopping.clone(),
            capacity: capacity.max(1),
        };
        let event_loop = EventLoop {
            poll,
            events: Events::with_capacity(shared.capacity.min(1024)),
            stopping,
            timeout,
        };
        Ok((shared, event_loop))
    }

    /// Register `source` for readable readiness under its descriptor.
    pub fn add<S: Source + ?Sized>(&self, source: &mut S, fd: RawFd) -> Result<(), NetError> {
        if self.live.load(Ordering::Acquire) >= self.capacity {
            log::warn!("[poller] capacity {} reached", self.capacity);
            set_last_error(NetError::CapacityFull);
            return Err(NetError::CapacityFull);
        }
        if let Err(e) = self
            .registry
            .register(source, Token(fd as usize), Interest::READABLE)
        {
            log::warn!("[poller] register fd {} failed: {}", fd, e);
            set_last_error(NetError::Register);
            return Err(NetError::Register);
        }
        self.live.fetch_add(1, Ordering::AcqRel);
        Ok(())
    }

    /// Re-arm a descriptor after its event has been dispatched.
    ///
    /// Failing because the descriptor was concurrently closed or
    /// deregistered is the expected race and is ignored.
    pub fn rearm<S: Source + ?Sized>(&self, source: &mut S, fd: RawFd) {
        if let Err(e) = self
            .registry
            .reregister(source, Token(fd as usize), Interest::READABLE)
        {
            if gone(&e) {
                log::debug!("[poller] rearm fd {}: already gone", fd);
            } else {
                log::warn!("[poller] rearm fd {} failed: {}", fd, e);
            }
        }
    }

    /// Deregister a descriptor and release its capacity slot.
    pub fn remove<S: Source + ?Sized>(&self, source: &mut S, fd: RawFd) {
        if let Err(e) = self.registry.deregister(source) {
            if gone(&e) {
                log::debug!("[poller] remove fd {}: already gone", fd);
            } else {
                log::warn!("[poller] deregister fd {} failed: {}", fd, e);
            }
        }
        let _ = self
            .live
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| n.checked_sub(1));
    }

    /// Number of currently registered descriptors.
    pub fn live(&self) -> usize {
        self.live.load(Ordering::Acquire)
    }

    /// Ask the loop to exit and wake it out of its wait.
    pub fn stop(&self) {
        self.stopping.store(true, Ordering::Release);
        if let Err(e) = self.waker.wake() {
            log::warn!("[poller] wake failed: {}", e);
        }
    }
}

fn gone(e: &std::io::Error) -> bool {
    e.kind() == std::io::ErrorKind::NotFound
        || matches!(e.raw_os_error(), Some(libc::ENOENT) | Some(libc::EBADF))
}

impl EventLoop {
    /// Whether [`Poller::stop`] has been called.
    pub fn stopping(&self) -> bool {
        self.stopping.load(Ordering::Acquire)
    }

    /// One bounded wait; ready descriptors are appended to `ready`.
    ///
    /// Interruptions and poll errors are absorbed so a worker loop built
    /// on this never dies; an error backs off briefly instead of
    /// spinning.
    pub fn poll(&mut self, ready: &mut Vec<RawFd>) {
        match self.poll.poll(&mut self.events, Some(self.timeout)) {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::Interrupted => return,
            Err(e) => {
                log::warn!("[poller] poll failed: {}", e);
                std::thread::sleep(Duration::from_millis(10));
                return;
            }
        }
        for event in self.events.iter() {
            let token = event.token();
            if token != WAKER_TOKEN {
                ready.push(token.0 as RawFd);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::net;
    use std::net::Ipv4Addr;
    use std::os::fd::AsRawFd;
    use std::time::Instant;

    #[test]
    fn add_and_remove_track_live_count() {
        let (poller, _event_loop) =
            Poller::create(4, Duration::from_millis(100)).expect("create should succeed");
        let mut socket = net::bind_udp(0).expect("bind should succeed");
        let fd = socket.as_raw_fd();

        assert_eq!(poller.live(), 0);
        poller.add(&mut socket, fd).expect("add should succeed");
        assert_eq!(poller.live(), 1);
        poller.remove(&mut socket, fd);
        assert_eq!(poller.live(), 0);
    }

    #[test]
    fn capacity_is_enforced() {
        let (poller, _event_loop) =
            Poller::create(1, Duration::from_millis(100)).expect("create should succeed");
        let mut a = net::bind_udp(0).expect("bind should succeed");
        let mut b = net::bind_udp(0).expect("bind should succeed");
        let fd_a = a.as_raw_fd();
        let fd_b = b.as_raw_fd();

        poller.add(&mut a, fd_a).expect("add should succeed");
        assert_eq!(poller.add(&mut b, fd_b), Err(NetError::CapacityFull));
    }

    #[test]
    fn readable_descriptor_is_reported() {
        let (poller, mut event_loop) =
            Poller::create(4, Duration::from_millis(100)).expect("create should succeed");
        let mut server = net::bind_udp(0).expect("bind should succeed");
        let fd = server.as_raw_fd();
        let port = server
            .local_addr()
            .expect("local_addr should succeed")
            .port();
        poller.add(&mut server, fd).expect("add should succeed");

        let client = net::connect_udp(Ipv4Addr::LOCALHOST, port).expect("connect should succeed");
        net::send_udp(client.as_raw_fd(), b"x", 3).expect("send should succeed");

        let mut ready = Vec::new();
        let deadline = Instant::now() + Duration::from_secs(2);
        while ready.is_empty() {
            assert!(Instant::now() < deadline, "event never arrived");
            event_loop.poll(&mut ready);
        }
        assert_eq!(ready, vec![fd]);
    }

    #[test]
    fn stop_wakes_an_idle_loop() {
        let (poller, mut event_loop) =
            Poller::create(4, Duration::from_secs(10)).expect("create should succeed");
        let worker = std::thread::spawn(move || {
            let start = Instant::now();
            let mut ready = Vec::new();
            while !event_loop.stopping() {
                event_loop.poll(&mut ready);
            }
            start.elapsed()
        });
        std::thread::sleep(Duration::from_millis(50));
        poller.stop();
        let elapsed = worker.join().expect("worker should not panic");
        assert!(elapsed < Duration::from_secs(5), "stop did not wake the loop");
    }
}
