// SPDX-License-Identifier: Apache-2.0 OR MIT

//! Socket creation and low-level send paths.
//!
//! Every socket is switched to non-blocking immediately after creation,
//! before any bind or connect, so no later operation can stall the
//! worker thread. Creation and options go through `socket2`; the
//! finished socket converts into the matching `mio` type for
//! registration with the multiplexer. Sends go through the raw
//! descriptor with `MSG_NOSIGNAL` so a dead peer surfaces as `EPIPE`
//! instead of killing the process.

use std::io;
use std::net::{IpAddr, Ipv4Addr, SocketAddr, ToSocketAddrs};
use std::os::fd::{AsRawFd, RawFd};
use std::time::Duration;

use mio::net::{TcpListener, TcpStream, UdpSocket};
use socket2::{Domain, Protocol, Socket, Type};

use crate::error::{set_last_error, NetError};

fn fail<T>(err: NetError) -> Result<T, NetError> {
    set_last_error(err);
    Err(err)
}

fn new_socket(kind: Type, protocol: Protocol) -> Result<Socket, NetError> {
    let socket = match Socket::new(Domain::IPV4, kind, Some(protocol)) {
        Ok(s) => s,
        Err(e) => {
            log::warn!("[net] socket create failed: {}", e);
            return fail(NetError::SocketCreate);
        }
    };
    if let Err(e) = socket.set_nonblocking(true) {
        log::warn!("[net] set_nonblocking failed: {}", e);
        return fail(NetError::SetNonBlocking);
    }
    Ok(socket)
}

/// Create a non-blocking TCP listener on `0.0.0.0:port` with
/// `SO_REUSEADDR` set. Port 0 binds an ephemeral port.
pub fn bind_tcp_listener(port: u16, backlog: i32) -> Result<TcpListener, NetError> {
    let socket = new_socket(Type::STREAM, Protocol::TCP)?;
    if let Err(e) = socket.set_reuse_address(true) {
        log::warn!("[net] SO_REUSEADDR failed: {}", e);
        return fail(NetError::Bind);
    }
    let addr = SocketAddr::from((Ipv4Addr::UNSPECIFIED, port));
    if let Err(e) = socket.bind(&addr.into()) {
        log::warn!("[net] bind {} failed: {}", addr, e);
        return fail(NetError::Bind);
    }
    if let Err(e) = socket.listen(backlog) {
        log::warn!("[net] listen on {} failed: {}", addr, e);
        return fail(NetError::Listen);
    }
    Ok(TcpListener::from_std(socket.into()))
}

/// Create a non-blocking UDP socket bound to `0.0.0.0:port`.
pub fn bind_udp(port: u16) -> Result<UdpSocket, NetError> {
    let socket = new_socket(Type::DGRAM, Protocol::UDP)?;
    if let Err(e) = socket.set_reuse_address(true) {
        log::warn!("[net] SO_REUSEADDR failed: {}", e);
        return fail(NetError::Bind);
    }
    let addr = SocketAddr::from((Ipv4Addr::UNSPECIFIED, port));
    if let Err(e) = socket.bind(&addr.into()) {
        log::warn!("[net] bind {} failed: {}", addr, e);
        return fail(NetError::Bind);
    }
    Ok(UdpSocket::from_std(socket.into()))
}

fn in_progress(e: &io::Error) -> bool {
    e.raw_os_error() == Some(libc::EINPROGRESS) || e.kind() == io::ErrorKind::WouldBlock
}

/// Wait for `fd` to become readable or writable, bounded by `timeout`.
/// `Ok(false)` means the wait elapsed.
fn wait_ready(fd: RawFd, timeout: Duration) -> Result<bool, NetError> {
    let mut pfd = libc::pollfd {
        fd,
        events: libc::POLLIN | libc::POLLOUT,
        revents: 0,
    };
    let ms = timeout.as_millis().min(i32::MAX as u128) as i32;
    loop {
        let rc = unsafe { libc::poll(&mut pfd, 1, ms) };
        if rc > 0 {
            return Ok(true);
        }
        if rc == 0 {
            return Ok(false);
        }
        let err = io::Error::last_os_error();
        if err.kind() == io::ErrorKind::Interrupted {
            continue;
        }
        log::warn!("[net] poll on fd {} failed: {}", fd, err);
        return fail(NetError::Connect);
    }
}

/// Non-blocking TCP connect with a bounded wait for the in-progress
/// case.
///
/// A wait that elapses is [`NetError::ConnectTimeout`]; a connect
/// resolved with a pending socket error (refused, unreachable) is
/// [`NetError::Connect`].
pub fn connect_tcp(ip: Ipv4Addr, port: u16, timeout: Duration) -> Result<TcpStream, NetError> {
    let socket = new_socket(Type::STREAM, Protocol::TCP)?;
    let addr = SocketAddr::from((ip, port));
    match socket.connect(&addr.into()) {
        Ok(()) => {}
        Err(e) if in_progress(&e) => {
            if !wait_ready(socket.as_raw_fd(), timeout)? {
                log::warn!("[net] connect to {} timed out", addr);
                return fail(NetError::ConnectTimeout);
            }
            match socket.take_error() {
                Ok(None) => {}
                Ok(Some(err)) => {
                    log::warn!("[net] connect to {} failed: {}", addr, err);
                    return fail(NetError::Connect);
                }
                Err(err) => {
                    log::warn!("[net] SO_ERROR on fd {} failed: {}", socket.as_raw_fd(), err);
                    return fail(NetError::Connect);
                }
            }
        }
        Err(e) => {
            log::warn!("[net] connect to {} failed: {}", addr, e);
            return fail(NetError::Connect);
        }
    }
    Ok(TcpStream::from_std(socket.into()))
}

/// Non-blocking connected UDP socket toward `ip:port`.
pub fn connect_udp(ip: Ipv4Addr, port: u16) -> Result<UdpSocket, NetError> {
    let socket = new_socket(Type::DGRAM, Protocol::UDP)?;
    let addr = SocketAddr::from((ip, port));
    if let Err(e) = socket.connect(&addr.into()) {
        log::warn!("[net] udp connect to {} failed: {}", addr, e);
        return fail(NetError::Connect);
    }
    Ok(UdpSocket::from_std(socket.into()))
}

/// Send the whole of `data` on a connected TCP descriptor.
///
/// Transient unavailability is retried `retries` times with a short
/// pause; `EPIPE` fails immediately. Returns the byte count sent.
pub fn send_tcp(fd: RawFd, data: &[u8], retries: u32) -> Result<usize, NetError> {
    let mut sent = 0;
    let mut budget = retries;
    while sent < data.len() {
        let rc = unsafe {
            libc::send(
                fd,
                data[sent..].as_ptr().cast(),
                data.len() - sent,
                libc::MSG_NOSIGNAL,
            )
        };
        if rc > 0 {
            sent += rc as usize;
            continue;
        }
        if rc == 0 {
            log::warn!("[net] send on fd {} made no progress", fd);
            return fail(NetError::Send);
        }
        let err = io::Error::last_os_error();
        match err.raw_os_error() {
            Some(libc::EINTR) => continue,
            Some(libc::EAGAIN) if budget > 0 => {
                budget -= 1;
                std::thread::sleep(Duration::from_millis(1));
            }
            Some(libc::EPIPE) => {
                log::warn!("[net] send on fd {}: peer closed", fd);
                return fail(NetError::Send);
            }
            _ => {
                log::warn!("[net] send on fd {} failed: {}", fd, err);
                return fail(NetError::Send);
            }
        }
    }
    Ok(sent)
}

/// Send one datagram on a connected UDP descriptor, with the same
/// bounded retry on transient unavailability.
pub fn send_udp(fd: RawFd, data: &[u8], retries: u32) -> Result<usize, NetError> {
    let mut budget = retries;
    loop {
        let rc = unsafe { libc::send(fd, data.as_ptr().cast(), data.len(), libc::MSG_NOSIGNAL) };
        if rc >= 0 {
            return Ok(rc as usize);
        }
        let err = io::Error::last_os_error();
        match err.raw_os_error() {
            Some(libc::EINTR) => continue,
            Some(libc::EAGAIN) if budget > 0 => {
                budget -= 1;
                std::thread::sleep(Duration::from_millis(1));
            }
            _ => {
                log::warn!("[net] udp send on fd {} failed: {}", fd, err);
                return fail(NetError::Send);
            }
        }
    }
}

/// Parse a dotted-quad string into its numeric (network-order) form.
pub fn ip_to_u32(ip: &str) -> Option<u32> {
    ip.parse::<Ipv4Addr>().ok().map(u32::from)
}

/// Numeric (network-order) IPv4 back to its address form.
pub fn u32_to_ip(value: u32) -> Ipv4Addr {
    Ipv4Addr::from(value)
}

/// Resolve `host` to its first IPv4 address.
pub fn host_ip(host: &str) -> Option<Ipv4Addr> {
    let addrs = (host, 0u16).to_socket_addrs().ok()?;
    for addr in addrs {
        if let IpAddr::V4(v4) = addr.ip() {
            return Some(v4);
        }
    }
    None
}

/// IP of the default local interface.
pub fn local_interface_ip() -> Option<IpAddr> {
    match local_ip_address::local_ip() {
        Ok(ip) => Some(ip),
        Err(e) => {
            log::warn!("[net] local interface lookup failed: {}", e);
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Instant;

    #[test]
    fn ip_u32_round_trip() {
        let n = ip_to_u32("192.168.1.10").expect("parse should succeed");
        assert_eq!(u32_to_ip(n), Ipv4Addr::new(192, 168, 1, 10));
        assert_eq!(ip_to_u32("not-an-ip"), None);
    }

    #[test]
    fn localhost_resolves() {
        assert_eq!(host_ip("localhost"), Some(Ipv4Addr::LOCALHOST));
    }

    #[test]
    fn listener_binds_ephemeral_port() {
        let listener = bind_tcp_listener(0, 10).expect("bind should succeed");
        let addr = listener.local_addr().expect("local_addr should succeed");
        assert_ne!(addr.port(), 0);
    }

    #[test]
    fn udp_pair_exchanges_a_datagram() {
        let server = bind_udp(0).expect("bind should succeed");
        let port = server
            .local_addr()
            .expect("local_addr should succeed")
            .port();
        let client = connect_udp(Ipv4Addr::LOCALHOST, port).expect("connect should succeed");

        let n = send_udp(client.as_raw_fd(), b"hello", 3).expect("send should succeed");
        assert_eq!(n, 5);

        // Non-blocking receive: poll briefly until the datagram lands.
        let mut buf = [0u8; 32];
        let deadline = Instant::now() + Duration::from_secs(2);
        loop {
            match server.recv_from(&mut buf) {
                Ok((len, _)) => {
                    assert_eq!(&buf[..len], b"hello");
                    break;
                }
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
                    assert!(Instant::now() < deadline, "datagram never arrived");
                    std::thread::sleep(Duration::from_millis(5));
                }
                Err(e) => panic!("recv failed: {}", e),
            }
        }
    }

    #[test]
    fn refused_connect_fails_without_hanging() {
        // Grab an ephemeral port and free it again so nothing listens.
        let port = {
            let l = bind_tcp_listener(0, 1).expect("bind should succeed");
            l.local_addr().expect("local_addr should succeed").port()
        };
        let start = Instant::now();
        let res = connect_tcp(Ipv4Addr::LOCALHOST, port, Duration::from_secs(5));
        assert!(res.is_err());
        assert!(start.elapsed() < Duration::from_secs(5));
    }
}
