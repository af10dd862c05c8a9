//! # Mill-Loop
//! An event-driven TCP server engine: one or more single-threaded event loops
//! built on [`mio`], each owning its connections outright, with pluggable
//! framing codecs that turn byte streams into typed frames.
//!
//! ## Features
//! - **Multi-loop**: one loop per core in multicore mode, connections spread
//!   round-robin, by least connections, or by source-address hash
//! - **No async runtime**: hooks are plain callbacks on the owning loop thread
//! - **Pluggable framing**: the [`Codec`] trait, with a header-length codec and
//!   a versioned length-field codec included
//! - **Cross-thread replies**: [`ConnectionHandle`] injects writes into the
//!   owning loop through a lock-free task queue
//! - **Object pooling**: connection input buffers are recycled
//!
//! ## Architecture Overview
//! ```text
//! ┌──────────┐  Register   ┌─────────────┐   react()   ┌──────────────┐
//! │ Acceptor │───────────▶ │  EventLoop  │───────────▶ │ EventHandler │
//! └──────────┘  (Trigger)  │  (Poller)   │             └──────┬───────┘
//!      ▲                   └─────▲───────┘                    │ submit
//!      │ LoadBalancer            │ AsyncWrite (Trigger)       ▼
//!      │                         └─────────────────── ┌──────────────┐
//!                                                     │  WorkerPool  │
//!                                                     └──────────────┘
//! ```
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use mill_loop::prelude::*;
//! use mill_loop::codec::command;
//!
//! struct Echo;
//!
//! impl EventHandler for Echo {
//!     type Frame = HeaderFrame;
//!
//!     fn react(
//!         &self,
//!         frame: HeaderFrame,
//!         _conn: &mut Connection<HeaderFrame>,
//!     ) -> (Option<HeaderFrame>, Action) {
//!         (Some(HeaderFrame::new(command::PONG, frame.body)), Action::None)
//!     }
//! }
//!
//! fn main() -> mill_loop::error::Result<()> {
//!     let config = ServerConfig::builder()
//!         .address(parse_address("tcp://:9000")?)
//!         .multicore(true)
//!         .build();
//!
//!     serve(Echo, HeaderCodec::new(), config)
//! }
//! ```
//!
//! - [`server`]: [`Server`], [`ServerHandle`] and [`serve`]
//! - [`handler`]: the [`EventHandler`] hooks and [`Action`]
//! - [`codec`]: the [`Codec`] trait and bundled protocols
//! - [`net`]: acceptor, load balancing and [`ServerConfig`]
//! - [`poll`]: readiness poller and cross-thread [`Trigger`](poll::Trigger)
//! - [`thread_pool`]: [`WorkerPool`] for blocking application work

pub mod buffer;
pub mod codec;
pub mod connection;
pub mod error;
pub mod event;
pub mod event_loop;
pub mod handler;
pub mod net;
pub mod object_pool;
pub mod poll;
pub mod server;
pub mod thread_pool;

pub use buffer::{ReadBuffer, RingBuffer};
pub use codec::{Codec, HeaderCodec, HeaderFrame, VersionedCodec, VersionedFrame};
pub use connection::{Connection, ConnectionHandle, ConnectionId};
pub use error::{Error, Result};
pub use handler::{Action, EventHandler};
pub use net::{parse_address, LoadBalancing, ServerConfig};
pub use object_pool::{ObjectPool, PooledObject, Recycle};
pub use server::{serve, Server, ServerHandle, ServerInfo, Stopper};
pub use thread_pool::WorkerPool;

/// Commonly used types and traits.
///
/// ```rust
/// use mill_loop::prelude::*;
/// ```
pub mod prelude {
    pub use crate::buffer::ReadBuffer;
    pub use crate::codec::{Codec, HeaderCodec, HeaderFrame, VersionedCodec, VersionedFrame};
    pub use crate::connection::{Connection, ConnectionHandle, ConnectionId};
    pub use crate::handler::{Action, EventHandler};
    pub use crate::net::{parse_address, LoadBalancing, ServerConfig};
    pub use crate::server::{serve, Server, ServerHandle, ServerInfo};
    pub use crate::thread_pool::WorkerPool;
}
