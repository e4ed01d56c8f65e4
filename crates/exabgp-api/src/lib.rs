//! Control channel for the ExaBGP routing daemon.
//!
//! This crate speaks both directions of the daemon's process API:
//!
//! - [`command`]: text commands written to the daemon (`announce route ...`)
//! - [`event`]: JSON events read from the daemon (state, update, acks)
//! - [`transport`]: serialized command writer and line-framed event reader
//!   over stdio or a pair of named pipes
//! - [`error`]: error types for codec and transport failures
//!
//! # Architecture
//!
//! ```text
//! announcer ──Command──> CommandWriter ──text line──> daemon
//! announcer <──Decoded── decode_loop <──JSON line─── daemon
//! ```
//!
//! # Example
//!
//! ```ignore
//! use exabgp_api::{Command, RouteAttributes, Transport};
//!
//! let transport = Transport::stdio();
//! let cmd = Command::announce("69::/32".parse()?, RouteAttributes::default());
//! transport.writer().send(&cmd).await?;
//! ```

pub mod command;
pub mod error;
pub mod event;
pub mod transport;

// Re-export commonly used items at crate root
pub use command::{Command, CommandKind, Origin, RouteAttributes};
pub use error::{ApiError, Result};
pub use event::{
    decode_line, decode_message, Ack, Direction, Event, FibOperation, FibPrefix, NeighborChange,
    PeerState, RouteUpdate,
};
#[cfg(unix)]
pub use transport::check_pipes;
pub use transport::{decode_loop, CommandWriter, Decoded, EventReader, PipePaths, Transport};
