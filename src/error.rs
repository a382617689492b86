// SPDX-License-Identifier: Apache-2.0 OR MIT

//! Error codes and the thread-local last-error slot.
//!
//! Public operations report failure by return value (`Result`/`Option`);
//! the thread-local slot additionally records the *specific* cause of the
//! most recent failure on the calling thread so that diagnostics do not
//! depend on threading an error type through every internal helper.

use std::cell::Cell;
use std::fmt;

/// Failure cause for an engine, socket, registry or pool operation.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum NetError {
    /// No error recorded.
    #[default]
    None,
    /// The worker thread is already running.
    AlreadyRunning,
    /// Registry or multiplexer is at its configured capacity.
    CapacityFull,
    /// No live handle with that identity.
    HandleNotFound,
    /// Setting the non-blocking flag on a socket failed.
    SetNonBlocking,
    /// A caller-supplied parameter was rejected.
    InvalidParam,
    /// Socket creation failed.
    SocketCreate,
    /// Binding a local address failed.
    Bind,
    /// Transition to listening failed.
    Listen,
    /// Hard connect failure (refused, unreachable, SO_ERROR set).
    Connect,
    /// The bounded connect wait elapsed without the socket becoming ready.
    ConnectTimeout,
    /// Send failed after the bounded retries, or the pipe is broken.
    Send,
    /// Receive failed with a hard error.
    Recv,
    /// The underlying system allocator could not satisfy a pool refill.
    AllocFailed,
    /// Spawning the worker thread failed.
    SpawnThread,
    /// Creating the native readiness facility failed.
    PollerCreate,
    /// Registering a descriptor with the multiplexer failed.
    Register,
    /// `add` with a key that is already present.
    DuplicateKey,
    /// `modify`/`del`/`find` with a key that is not present.
    KeyNotFound,
    /// A key or value failed the behavior set's validity check.
    RejectedEntry,
    /// A block handed back to the pool does not carry a power-of-two size.
    BadBlock,
}

impl fmt::Display for NetError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            NetError::None => "no error",
            NetError::AlreadyRunning => "worker already running",
            NetError::CapacityFull => "capacity reached",
            NetError::HandleNotFound => "handle not found",
            NetError::SetNonBlocking => "set non-blocking failed",
            NetError::InvalidParam => "invalid parameter",
            NetError::SocketCreate => "socket creation failed",
            NetError::Bind => "bind failed",
            NetError::Listen => "listen failed",
            NetError::Connect => "connect failed",
            NetError::ConnectTimeout => "connect timed out",
            NetError::Send => "send failed",
            NetError::Recv => "recv failed",
            NetError::AllocFailed => "system allocation failed",
            NetError::SpawnThread => "thread spawn failed",
            NetError::PollerCreate => "poller creation failed",
            NetError::Register => "descriptor registration failed",
            NetError::DuplicateKey => "key already present",
            NetError::KeyNotFound => "key not present",
            NetError::RejectedEntry => "entry rejected by behavior set",
            NetError::BadBlock => "block size is not a power of two",
        };
        f.write_str(s)
    }
}

impl std::error::Error for NetError {}

thread_local! {
    static LAST_ERROR: Cell<NetError> = const { Cell::new(NetError::None) };
}

/// Record `err` as this thread's most recent failure cause.
pub fn set_last_error(err: NetError) {
    LAST_ERROR.with(|slot| slot.set(err));
}

/// Most recent failure cause recorded on this thread.
pub fn last_error() -> NetError {
    LAST_ERROR.with(|slot| slot.get())
}

/// Read and clear this thread's most recent failure cause.
pub fn take_last_error() -> NetError {
    LAST_ERROR.with(|slot| slot.replace(NetError::None))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn last_error_is_per_thread() {
        set_last_error(NetError::Bind);
        assert_eq!(last_error(), NetError::Bind);

        let other = std::thread::spawn(|| last_error());
        assert_eq!(
            other.join().expect("thread should not panic"),
            NetError::None
        );
    }

    #[test]
    fn take_clears_the_slot() {
        set_last_error(NetError::Send);
        assert_eq!(take_last_error(), NetError::Send);
        assert_eq!(last_error(), NetError::None);
    }
}
