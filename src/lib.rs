//! # Edge Feed - Streaming Files over Edge-Triggered Sockets
//!
//! Edge Feed streams the contents of local files to a TCP server, one
//! connection per file, from a single thread. Instead of blocking I/O or a
//! thread per connection, every socket is registered with an edge-triggered
//! readiness multiplexer and driven with non-blocking reads and writes.
//!
//! ## Key Features
//!
//! - **Single-threaded**: one event loop owns every connection; the only
//!   blocking call is the wait on the multiplexer
//! - **Partial-send safe**: bytes a socket did not accept are kept and sent
//!   before anything new is read from the file
//! - **Drain to exhaustion**: readable and writable notifications are worked
//!   until the socket reports `WouldBlock`, as edge-triggered readiness
//!   requires
//! - **Acknowledged delivery**: optionally, a connection stays open after its
//!   file is exhausted until the server answers with `Ack\n`
//! - **Clean shutdown**: SIGINT/SIGTERM interrupt the wait and every
//!   connection is released exactly once
//!
//! ## How It Works
//!
//! Each connection moves through a small state machine:
//!
//! ```text
//! Streaming --[file exhausted]--> AwaitingAck --[Ack\n]--> Closed
//!     |                               |
//!     +--[peer shutdown / reset]------+------------------> Closed
//! ```
//!
//! The [`Engine`] waits on the [`Multiplexer`], hands each ready socket to the
//! state machine, and retires connections that reached `Closed` by
//! deregistering them and dropping the record, which closes the socket and
//! the file. The loop ends when no connection is left.
//!
//! ## Basic Usage
//!
//! ### Client Side
//!
//! ```rust,no_run
//! use edge_feed::{EngineConfig, FeedClient};
//!
//! let addr = "127.0.0.1:8080".parse().unwrap();
//! let mut client = FeedClient::connect(addr, &["a.txt", "b.txt"], EngineConfig::default())?;
//! client.run()?;
//! for outcome in client.outcomes() {
//!     println!("{}: {:?}", outcome.handle, outcome.reason);
//! }
//! # Ok::<(), edge_feed::FeedError>(())
//! ```
//!
//! ### Server Side
//!
//! ```rust,no_run
//! use edge_feed::{FeedServer, ServerConfig};
//!
//! let mut server = FeedServer::bind("0.0.0.0:8080", std::io::stdout(), ServerConfig::default())?;
//! server.serve(None)?;
//! # Ok::<(), edge_feed::FeedError>(())
//! ```
//!
//! ## Configuration
//!
//! [`EngineConfig`] sets the per-connection buffer capacity, the number of
//! events taken per wait, and the [`AckPolicy`]. Client and server must agree
//! on the acknowledgment: a client requiring it will wait on a server that
//! never sends it.

#![warn(missing_docs)]

mod client;
mod config;
mod connection;
mod engine;
mod error;
mod mux;
mod registry;
mod server;
mod transfer;

pub use client::FeedClient;
pub use config::*;
pub use connection::{ACK_TOKEN, Channel, Connection};
pub use engine::{Engine, Exit, Outcome};
pub use error::{FeedError, FeedResult};
pub use mux::{Interest, Multiplexer, Readiness, SIGNAL_KEY, Wait};
pub use registry::{Handle, Registry};
pub use server::FeedServer;
pub use transfer::{CloseReason, Cycle, ProtocolState, Progress};
