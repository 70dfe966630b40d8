//! Kernel-event-backed asynchronous I/O multiplexing: [`Channel`]s carrying
//! typed resources, multiplexed by an [`Array`] over one kqueue/epoll
//! instance per process thread that wants one (§1 overview).
//!
//! A [`Port`](port::Port) owns exactly one kernel file descriptor and is
//! shared by up to two channels of opposite polarity. An [`Array`] runs a
//! cycle (`enter`) that drains pending work from any thread, blocks on the
//! backend, and performs one I/O attempt per qualified channel, yielding a
//! [`Cycle`] describing what happened.
//!
//! This crate only targets Unix (kqueue on BSD/Darwin, epoll on Linux); it
//! does not provide connect/bind/listen/getaddrinfo helpers, TLS, or a
//! runtime/executor -- callers open their own descriptors and hand them to
//! an [`Array`]'s allocator methods.

#[macro_use]
mod macros;

pub mod array;
pub mod channel;
pub mod cycle;
pub mod datagram;
pub mod endpoint;
pub mod error;
pub mod port;
mod sys;

pub use array::Array;
pub use channel::{Channel, Polarity, Resource, Typology, Window};
pub use cycle::{ChannelEvent, Cycle};
pub use datagram::DatagramArray;
pub use endpoint::Endpoint;
pub use error::{CoreError, PortError, Result};
pub use port::Port;
