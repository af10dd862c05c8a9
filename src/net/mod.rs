//! Listening side of the server.
//!
//! ```text
//!                      ┌──────────────┐
//!   connect ─────────▶ │   Acceptor   │  accept until WouldBlock
//!                      └──────┬───────┘
//!                             │ LoadBalancer::next(peer)
//!              ┌──────────────┼──────────────┐
//!              ▼              ▼              ▼
//!      Trigger(Register) Trigger(Register) Trigger(Register)
//!      ┌────────────┐  ┌────────────┐  ┌────────────┐
//!      │ mill-loop-0│  │ mill-loop-1│  │ mill-loop-N│
//!      └────────────┘  └────────────┘  └────────────┘
//! ```
//!
//! In single-loop mode the listener is registered on loop 0 and the acceptor
//! runs inside that loop; in multicore mode it has a thread and poller of its
//! own. Either way a connection is only ever registered by the loop that
//! will own it, through its task queue.

pub mod acceptor;
pub mod balancer;
pub mod config;

pub use balancer::{LoadBalancer, LoadBalancing};
pub use config::{parse_address, ServerConfig, ServerConfigBuilder};
