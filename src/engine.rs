// SPDX-License-Identifier: Apache-2.0 OR MIT

//! The event engine.
//!
//! One worker thread multiplexes every handle. Ready descriptors are
//! dispatched one at a time: accepts for listeners, buffered reads for
//! clients and UDP endpoints, each surfaced to the caller through the
//! single notification callback registered at init.
//!
//! Dispatch checks the handle *out* of the registry under the engine
//! lock and checks it back in afterwards, so the callback always runs
//! with the lock released and may freely call back into
//! `create_*`/`close`/`send`, including for the handle being
//! dispatched. A close requested while a handle is checked out is
//! deferred to check-in, which makes the teardown single-owner: the
//! thread holding the handle is the only one that can free it.

use std::collections::HashMap;
use std::io::Read;
use std::net::{Ipv4Addr, SocketAddr};
use std::os::fd::{AsRawFd, RawFd};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};

use mio::event::Source;
use mio::net::{TcpListener, TcpStream, UdpSocket};
use parking_lot::Mutex;

use crate::config::EngineConfig;
use crate::error::{set_last_error, NetError};
use crate::net;
use crate::pool::{Block, BufPool};
use crate::poller::{EventLoop, Poller};
use crate::registry::{HashTable, MapBehavior};

/// Identity of a monitored handle. Stable for the handle's lifetime.
pub type HandleId = RawFd;

/// Caller-chosen tag passed back on every notification for the handle.
pub type Channel = u32;

/// What happened on a handle.
#[derive(Debug, PartialEq, Eq)]
pub enum Event<'a> {
    /// A listener produced a new client; the id in the notification is
    /// the new client's, already joined and monitored.
    Accept,
    /// Buffered received bytes. The callback returns how many it
    /// consumed; the rest stays buffered for the next notification.
    Data(&'a [u8]),
    /// The peer closed (or a zero-length datagram arrived); the handle
    /// is torn down after the callback returns.
    Close,
}

/// Notification callback. The return value is the consumed byte count,
/// meaningful only for [`Event::Data`].
pub type NotifyFn = dyn Fn(HandleId, Channel, Event<'_>) -> usize + Send + Sync;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum Role {
    TcpServer,
    TcpClient,
    Udp,
}

enum Endpoint {
    Listener(TcpListener),
    Stream(TcpStream),
    Udp(UdpSocket),
}

impl Endpoint {
    fn fd(&self) -> RawFd {
        match self {
            Endpoint::Listener(l) => l.as_raw_fd(),
            Endpoint::Stream(s) => s.as_raw_fd(),
            Endpoint::Udp(u) => u.as_raw_fd(),
        }
    }

    fn source(&mut self) -> &mut dyn Source {
        match self {
            Endpoint::Listener(l) => l,
            Endpoint::Stream(s) => s,
            Endpoint::Udp(u) => u,
        }
    }

    fn local_addr(&self) -> Option<SocketAddr> {
        match self {
            Endpoint::Listener(l) => l.local_addr().ok(),
            Endpoint::Stream(s) => s.local_addr().ok(),
            Endpoint::Udp(u) => u.local_addr().ok(),
        }
    }

    fn peer_addr(&self) -> Option<SocketAddr> {
        match self {
            Endpoint::Stream(s) => s.peer_addr().ok(),
            _ => None,
        }
    }
}

struct Handle {
    endpoint: Endpoint,
    role: Role,
    channel: Channel,
    buf: Option<Block>,
    buf_len: usize,
}

/// Registry behavior for engine handles: teardown closes the socket and
/// hands the receive buffer back to the pool.
struct HandleSlots {
    pool: Arc<BufPool>,
}

impl MapBehavior for HandleSlots {
    type Key = RawFd;
    type Val = Box<Handle>;

    fn hash(&self, key: &RawFd) -> u64 {
        let k = *key as i64;
        k.wrapping_shl(5).wrapping_add(k.wrapping_mul(2)) as u64
    }

    fn eq(&self, a: &RawFd, b: &RawFd) -> bool {
        a == b
    }

    fn release_val(&self, mut handle: Box<Handle>) {
        if let Some(block) = handle.buf.take() {
            let _ = self.pool.release(block);
        }
        // socket closes on drop
    }
}

struct FlightSlot {
    role: Role,
    close_requested: bool,
}

struct State {
    table: HashTable<HandleSlots>,
    in_flight: HashMap<RawFd, FlightSlot>,
    event_loop: Option<EventLoop>,
}

struct Inner {
    cfg: EngineConfig,
    pool: Arc<BufPool>,
    notify: Box<NotifyFn>,
    poller: Poller,
    state: Mutex<State>,
    running: AtomicBool,
}

/// Callback-driven non-blocking network engine.
pub struct Engine {
    inner: Arc<Inner>,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl Engine {
    /// Build the engine: allocator, registry and multiplexer. Nothing is
    /// left running if any piece fails.
    pub fn init<F>(cfg: EngineConfig, notify: F) -> Result<Engine, NetError>
    where
        F: Fn(HandleId, Channel, Event<'_>) -> usize + Send + Sync + 'static,
    {
        if cfg.max_handles == 0 || cfg.recv_buf_len == 0 {
            set_last_error(NetError::InvalidParam);
            return Err(NetError::InvalidParam);
        }
        let pool = Arc::new(BufPool::new(cfg.cached_blocks_per_class));
        let table = HashTable::new(cfg.max_handles, HandleSlots { pool: pool.clone() })?;
        let (poller, event_loop) = Poller::create(cfg.max_handles, cfg.poll_timeout)?;
        Ok(Engine {
            inner: Arc::new(Inner {
                cfg,
                pool,
                notify: Box::new(notify),
                poller,
                state: Mutex::new(State {
                    table,
                    in_flight: HashMap::new(),
                    event_loop: Some(event_loop),
                }),
                running: AtomicBool::new(false),
            }),
            worker: Mutex::new(None),
        })
    }

    /// Create and monitor a TCP handle on `channel`.
    ///
    /// `ip: None` binds a listener on `port`; `Some(ip)` connects a
    /// client (bounded wait, see [`EngineConfig::connect_timeout`]).
    pub fn create_tcp(
        &self,
        ip: Option<Ipv4Addr>,
        port: u16,
        channel: Channel,
    ) -> Result<HandleId, NetError> {
        match ip {
            None => {
                let listener = net::bind_tcp_listener(port, self.inner.cfg.listen_backlog)?;
                self.join(Endpoint::Listener(listener), Role::TcpServer, channel, None)
            }
            Some(ip) => {
                let stream = net::connect_tcp(ip, port, self.inner.cfg.connect_timeout)?;
                let buf = self.alloc_buf()?;
                self.join(Endpoint::Stream(stream), Role::TcpClient, channel, Some(buf))
            }
        }
    }

    /// Create and monitor a UDP handle on `channel`.
    ///
    /// `ip: None` binds `port`; `Some(ip)` connects toward `ip:port`.
    pub fn create_udp(
        &self,
        ip: Option<Ipv4Addr>,
        port: u16,
        channel: Channel,
    ) -> Result<HandleId, NetError> {
        let socket = match ip {
            None => net::bind_udp(port)?,
            Some(ip) => net::connect_udp(ip, port)?,
        };
        let buf = self.alloc_buf()?;
        self.join(Endpoint::Udp(socket), Role::Udp, channel, Some(buf))
    }

    fn alloc_buf(&self) -> Result<Block, NetError> {
        self.inner
            .pool
            .allocate(self.inner.cfg.recv_buf_len)
            .ok_or(NetError::AllocFailed)
    }

    fn join(
        &self,
        endpoint: Endpoint,
        role: Role,
        channel: Channel,
        buf: Option<Block>,
    ) -> Result<HandleId, NetError> {
        let handle = Box::new(Handle {
            endpoint,
            role,
            channel,
            buf,
            buf_len: 0,
        });
        join_handle(&self.inner, handle)
    }

    /// Stop monitoring `id` and free it.
    ///
    /// If the handle is being dispatched right now, teardown is deferred
    /// to the dispatch's check-in.
    pub fn close(&self, id: HandleId) -> Result<(), NetError> {
        let mut st = self.inner.state.lock();
        if let Some(slot) = st.in_flight.get_mut(&id) {
            slot.close_requested = true;
            return Ok(());
        }
        match st.table.take(&id) {
            Some(mut h) => {
                self.inner.poller.remove(h.endpoint.source(), id);
                drop(st);
                reclaim(&self.inner, h);
                log::debug!("[engine] handle {} closed", id);
                Ok(())
            }
            None => {
                set_last_error(NetError::HandleNotFound);
                Err(NetError::HandleNotFound)
            }
        }
    }

    /// Send `data` on `id`. Rejected for listeners and empty payloads.
    ///
    /// The engine lock is held across the send so the descriptor cannot
    /// be closed and reused underneath it. The hold is bounded: the
    /// socket is non-blocking and transient unavailability retries at
    /// most [`EngineConfig::send_retries`] times with a 1 ms pause.
    pub fn send(&self, id: HandleId, data: &[u8]) -> Result<usize, NetError> {
        if data.is_empty() {
            set_last_error(NetError::InvalidParam);
            return Err(NetError::InvalidParam);
        }
        let st = self.inner.state.lock();
        let role = if let Some(h) = st.table.find(&id) {
            h.role
        } else if let Some(slot) = st.in_flight.get(&id) {
            slot.role
        } else {
            set_last_error(NetError::HandleNotFound);
            return Err(NetError::HandleNotFound);
        };
        match role {
            Role::TcpServer => {
                set_last_error(NetError::InvalidParam);
                Err(NetError::InvalidParam)
            }
            Role::TcpClient => net::send_tcp(id, data, self.inner.cfg.send_retries),
            Role::Udp => net::send_udp(id, data, self.inner.cfg.send_retries),
        }
    }

    /// Start the worker thread. Fails with `AlreadyRunning` on a second
    /// call; an engine runs once.
    pub fn run(&self) -> Result<(), NetError> {
        if self.inner.running.swap(true, Ordering::AcqRel) {
            set_last_error(NetError::AlreadyRunning);
            return Err(NetError::AlreadyRunning);
        }
        let event_loop = match self.inner.state.lock().event_loop.take() {
            Some(el) => el,
            None => {
                set_last_error(NetError::AlreadyRunning);
                return Err(NetError::AlreadyRunning);
            }
        };
        let inner = self.inner.clone();
        match thread::Builder::new()
            .name("evio-worker".into())
            .spawn(move || worker_loop(inner, event_loop))
        {
            Ok(handle) => {
                *self.worker.lock() = Some(handle);
                Ok(())
            }
            Err(e) => {
                log::warn!("[engine] worker spawn failed: {}", e);
                self.inner.running.store(false, Ordering::Release);
                set_last_error(NetError::SpawnThread);
                Err(NetError::SpawnThread)
            }
        }
    }

    /// Stop the worker thread and wait for it to exit.
    ///
    /// Safe to call from the notification callback; in that case the
    /// worker exits on its own after the current dispatch.
    pub fn stop(&self) {
        self.inner.poller.stop();
        // Take the handle out before joining so a concurrent stop from
        // the callback never blocks behind the join.
        let worker = self.worker.lock().take();
        if let Some(worker) = worker {
            if worker.thread().id() == thread::current().id() {
                // self-stop from the callback: the loop exits after this
                // dispatch, nothing to join
            } else if worker.join().is_err() {
                log::warn!("[engine] worker panicked");
            }
        }
        self.inner.running.store(false, Ordering::Release);
    }

    /// Stop and free every remaining handle.
    pub fn release(&self) {
        self.stop();
        let mut st = self.inner.state.lock();
        for fd in st.table.keys() {
            if let Some(mut h) = st.table.take(&fd) {
                self.inner.poller.remove(h.endpoint.source(), fd);
                reclaim(&self.inner, h);
            }
        }
    }

    /// Number of live handles, checked-out ones included.
    pub fn handle_count(&self) -> usize {
        let st = self.inner.state.lock();
        st.table.count() + st.in_flight.len()
    }

    /// Number of descriptors registered with the multiplexer.
    pub fn mux_live(&self) -> usize {
        self.inner.poller.live()
    }

    /// Local address of `id`, if it is in the registry right now.
    pub fn local_addr(&self, id: HandleId) -> Option<SocketAddr> {
        self.inner
            .state
            .lock()
            .table
            .find(&id)
            .and_then(|h| h.endpoint.local_addr())
    }

    /// Peer address of `id` (connected TCP streams only).
    pub fn peer_addr(&self, id: HandleId) -> Option<SocketAddr> {
        self.inner
            .state
            .lock()
            .table
            .find(&id)
            .and_then(|h| h.endpoint.peer_addr())
    }

    /// Bytes currently buffered but not yet consumed on `id`.
    pub fn buffered_len(&self, id: HandleId) -> Option<usize> {
        self.inner.state.lock().table.find(&id).map(|h| h.buf_len)
    }

    /// Channel tag `id` was created with.
    pub fn channel(&self, id: HandleId) -> Option<Channel> {
        self.inner.state.lock().table.find(&id).map(|h| h.channel)
    }
}

impl Drop for Engine {
    fn drop(&mut self) {
        self.stop();
    }
}

fn reclaim(inner: &Inner, mut handle: Box<Handle>) {
    if let Some(block) = handle.buf.take() {
        let _ = inner.pool.release(block);
    }
}

/// Join atomically: registry first, multiplexer second, with the
/// registry entry rolled back if registration fails.
fn join_handle(inner: &Inner, handle: Box<Handle>) -> Result<HandleId, NetError> {
    let fd = handle.endpoint.fd();
    let role = handle.role;
    let mut st = inner.state.lock();
    st.table.add(fd, handle)?;
    let armed = match st.table.find_mut(&fd) {
        Some(h) => inner.poller.add(h.endpoint.source(), fd),
        None => Err(NetError::HandleNotFound),
    };
    if let Err(e) = armed {
        if let Some(h) = st.table.take(&fd) {
            drop(st);
            reclaim(inner, h);
        }
        return Err(e);
    }
    drop(st);
    log::debug!("[engine] handle {} joined ({:?})", fd, role);
    Ok(fd)
}

fn worker_loop(inner: Arc<Inner>, mut event_loop: EventLoop) {
    log::debug!("[engine] worker started");
    let mut ready = Vec::new();
    while !event_loop.stopping() {
        ready.clear();
        event_loop.poll(&mut ready);
        for &fd in &ready {
            dispatch(&inner, fd);
        }
    }
    log::debug!("[engine] worker exited");
}

/// Handle one ready descriptor: check the handle out, run the
/// role-specific path with the lock released, check it back in.
fn dispatch(inner: &Arc<Inner>, fd: RawFd) {
    let mut handle = {
        let mut st = inner.state.lock();
        match st.table.take(&fd) {
            Some(h) => {
                st.in_flight.insert(
                    fd,
                    FlightSlot {
                        role: h.role,
                        close_requested: false,
                    },
                );
                h
            }
            // stale event for a handle closed since the poll
            None => return,
        }
    };

    let keep = match handle.role {
        Role::TcpServer => {
            dispatch_accept(inner, &mut handle);
            true
        }
        Role::TcpClient | Role::Udp => dispatch_read(inner, &mut handle),
    };

    let mut st = inner.state.lock();
    let close_requested = st
        .in_flight
        .remove(&fd)
        .map_or(false, |slot| slot.close_requested);
    if close_requested || !keep {
        inner.poller.remove(handle.endpoint.source(), fd);
        drop(st);
        reclaim(inner, handle);
        log::debug!("[engine] handle {} torn down", fd);
    } else {
        inner.poller.rearm(handle.endpoint.source(), fd);
        if st.table.add(fd, handle).is_err() {
            log::warn!("[engine] check-in of handle {} failed", fd);
        }
    }
}

/// Drain the accept queue. Each new client is joined and monitored
/// before its `Accept` notification fires, and the notification carries
/// the client's own identity. A failed accept drops that client only;
/// the listener stays armed.
fn dispatch_accept(inner: &Arc<Inner>, handle: &mut Handle) {
    let channel = handle.channel;
    let Endpoint::Listener(listener) = &mut handle.endpoint else {
        return;
    };
    loop {
        match listener.accept() {
            Ok((stream, peer)) => {
                let buf = match inner.pool.allocate(inner.cfg.recv_buf_len) {
                    Some(b) => b,
                    None => {
                        log::warn!("[engine] no buffer for client from {}, dropping", peer);
                        continue;
                    }
                };
                let client = Box::new(Handle {
                    endpoint: Endpoint::Stream(stream),
                    role: Role::TcpClient,
                    channel,
                    buf: Some(buf),
                    buf_len: 0,
                });
                match join_handle(inner, client) {
                    Ok(id) => {
                        log::debug!("[engine] accepted {} as handle {}", peer, id);
                        (inner.notify)(id, channel, Event::Accept);
                    }
                    Err(e) => {
                        log::warn!("[engine] client from {} not monitored: {}", peer, e);
                        continue;
                    }
                }
            }
            Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => break,
            Err(e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
            Err(e) => {
                log::warn!("[engine] accept failed: {}", e);
                break;
            }
        }
    }
}

/// Read into the handle's buffer at its write offset, notify, and shift
/// out whatever the callback consumed. Returns false when the handle
/// must be torn down (peer closed).
fn dispatch_read(inner: &Arc<Inner>, handle: &mut Handle) -> bool {
    let fd = handle.endpoint.fd();
    let channel = handle.channel;
    let Some(block) = handle.buf.as_mut() else {
        log::warn!("[engine] handle {} has no buffer", fd);
        return true;
    };
    // The pool rounds the block up to its class size; reads still cap at
    // the configured buffer length.
    let cap = inner.cfg.recv_buf_len.min(block.size());

    loop {
        if handle.buf_len == cap {
            // full buffer: no further reads until the callback consumes
            break;
        }
        let res = match &mut handle.endpoint {
            Endpoint::Stream(s) => s.read(&mut block[handle.buf_len..]),
            Endpoint::Udp(u) => u.recv(&mut block[handle.buf_len..]),
            Endpoint::Listener(_) => return true,
        };
        match res {
            Ok(0) => {
                // TCP: orderly shutdown. UDP: a zero-length datagram is
                // treated the same way and closes the handle.
                (inner.notify)(fd, channel, Event::Close);
                return false;
            }
            Ok(n) => handle.buf_len += n,
            Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => break,
            Err(e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
            Err(e) => {
                log::warn!("[engine] recv on handle {} failed: {}", fd, e);
                set_last_error(NetError::Recv);
                break;
            }
        }
    }

    let occupied = handle.buf_len;
    if occupied == 0 {
        return true;
    }
    let consumed = (inner.notify)(fd, channel, Event::Data(&block[..occupied]));
    if consumed == 0 || consumed > occupied {
        log::warn!(
            "[engine] handle {} consumed {} of {} buffered, keeping buffer",
            fd,
            consumed,
            occupied
        );
        return true;
    }
    block.copy_within(consumed..occupied, 0);
    handle.buf_len = occupied - consumed;
    true
}

#[cfg(test)]
mod tests {
    use super::*;

    fn noop_engine(cfg: EngineConfig) -> Result<Engine, NetError> {
        Engine::init(cfg, |_, _, _| 0)
    }

    #[test]
    fn init_rejects_zero_capacity() {
        let cfg = EngineConfig {
            max_handles: 0,
            ..Default::default()
        };
        assert_eq!(noop_engine(cfg).err(), Some(NetError::InvalidParam));
    }

    #[test]
    fn listener_joins_and_counts() {
        let engine = noop_engine(EngineConfig::default()).expect("init should succeed");
        let id = engine
            .create_tcp(None, 0, 7)
            .expect("listener create should succeed");
        assert_eq!(engine.handle_count(), 1);
        assert_eq!(engine.mux_live(), 1);
        assert_eq!(engine.channel(id), Some(7));
        assert!(engine.local_addr(id).is_some());
        engine.close(id).expect("close should succeed");
        assert_eq!(engine.handle_count(), 0);
        assert_eq!(engine.mux_live(), 0);
    }

    #[test]
    fn send_rejects_listeners_and_empty_payloads() {
        let engine = noop_engine(EngineConfig::default()).expect("init should succeed");
        let id = engine
            .create_tcp(None, 0, 0)
            .expect("listener create should succeed");
        assert_eq!(engine.send(id, b"x"), Err(NetError::InvalidParam));
        assert_eq!(engine.send(id, b""), Err(NetError::InvalidParam));
        assert_eq!(engine.send(9999, b"x"), Err(NetError::HandleNotFound));
    }

    #[test]
    fn close_on_unknown_handle_fails() {
        let engine = noop_engine(EngineConfig::default()).expect("init should succeed");
        assert_eq!(engine.close(4242), Err(NetError::HandleNotFound));
    }

    #[test]
    fn run_twice_is_rejected() {
        let engine = noop_engine(EngineConfig::default()).expect("init should succeed");
        engine.run().expect("run should succeed");
        assert_eq!(engine.run(), Err(NetError::AlreadyRunning));
        engine.stop();
    }

    #[test]
    fn create_many_close_many_leaves_nothing() {
        let engine = noop_engine(EngineConfig::default()).expect("init should succeed");
        let mut ids = Vec::new();
        for i in 0..8 {
            ids.push(
                engine
                    .create_udp(None, 0, i)
                    .expect("udp create should succeed"),
            );
        }
        assert_eq!(engine.handle_count(), 8);
        assert_eq!(engine.mux_live(), 8);
        for id in ids {
            engine.close(id).expect("close should succeed");
        }
        assert_eq!(engine.handle_count(), 0);
        assert_eq!(engine.mux_live(), 0);
    }

    #[test]
    fn capacity_bounds_creation() {
        let cfg = EngineConfig {
            max_handles: 2,
            ..Default::default()
        };
        let engine = noop_engine(cfg).expect("init should succeed");
        engine.create_udp(None, 0, 0).expect("create should succeed");
        engine.create_udp(None, 0, 0).expect("create should succeed");
        assert_eq!(engine.create_udp(None, 0, 0), Err(NetError::CapacityFull));
    }
}
