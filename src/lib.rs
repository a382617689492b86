// SPDX-License-Identifier: Apache-2.0 OR MIT

//! Event-driven non-blocking network I/O.
//!
//! `evio` monitors TCP and UDP sockets from a single worker thread and
//! surfaces everything that happens on them (new clients, received
//! bytes, peer closes) through one callback registered up front. All
//! sockets are non-blocking from the moment they are created; received
//! data lands in pooled buffers that the callback consumes at its own
//! pace, with unconsumed bytes carried over to the next notification.
//!
//! The building blocks are usable on their own:
//!
//! - [`pool::BufPool`]: size-class buffer pool with bounded caching
//! - [`registry::HashTable`]: fixed-bucket registry with injected
//!   per-entry behavior
//! - [`sync::Lock`] / [`sync::Signal`]: two-variant lock and a latched
//!   thread signal
//! - [`net`]: non-blocking socket creation and bounded send/connect
//! - [`poller::Poller`]: readiness multiplexer over `mio`
//!
//! # Example
//!
//! ```no_run
//! use evio::{Engine, EngineConfig, Event};
//!
//! let engine = Engine::init(EngineConfig::default(), |id, _channel, event| {
//!     match event {
//!         Event::Accept => println!("client {} connected", id),
//!         Event::Data(bytes) => return bytes.len(), // consume everything
//!         Event::Close => println!("client {} left", id),
//!     }
//!     0
//! })?;
//!
//! engine.create_tcp(None, 9000, 1)?; // listener on channel 1
//! engine.run()?;
//! # Ok::<(), evio::NetError>(())
//! ```

pub mod config;
pub mod error;
pub mod net;
pub mod pool;
pub mod registry;
pub mod sync;

pub mod engine;
pub mod poller;

pub use config::EngineConfig;
pub use engine::{Channel, Engine, Event, HandleId};
pub use error::{last_error, take_last_error, NetError};
