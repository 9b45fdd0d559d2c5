//! Multi-room TCP Chat Server Library
//!
//! A line-oriented chat server: clients connect over TCP, join named rooms
//! and broadcast text lines to other members of the same room.
//!
//! # Features
//! - Non-blocking socket line bridge
//! - Generic timed mailbox for inter-task signaling
//! - Per-connection session actor (read loop + processing loop)
//! - Named rooms with create-or-fetch-once semantics
//! - Server lifecycle machine with graceful shutdown and drain timeout
//!
//! # Architecture
//! Each connection runs as an actor with its own `Mailbox`:
//! - The accept loop turns sockets into `ClientSession`s
//! - A session's read task feeds lines into its mailbox
//! - A session's processing task dispatches commands and room broadcasts
//! - Room posts are fire-and-forget enqueues into each member's mailbox
//!
//! # Example
//! ```ignore
//! use std::sync::Arc;
//! use std::time::Duration;
//! use chatrooms::ChatServer;
//!
//! #[tokio::main]
//! async fn main() {
//!     let server = Arc::new(ChatServer::new("127.0.0.1:8080".parse().unwrap()));
//!     server.run().await.unwrap();
//!     // ... operator console decides when to end:
//!     server.shutdown(Duration::from_secs(10)).await.unwrap();
//! }
//! ```

pub mod error;
pub mod mailbox;
pub mod net;
pub mod protocol;
pub mod room;
pub mod server;
pub mod session;
pub mod types;

// Re-export main types for convenience
pub use error::{ServerError, TakeTimeout};
pub use mailbox::Mailbox;
pub use net::{LineReader, LineWriter};
pub use protocol::{parse_client, parse_console, ClientLine, ConsoleLine};
pub use room::{Room, RoomRegistry};
pub use server::{ChatServer, ServerState, SHUTDOWN_NOTICE};
pub use session::{ClientSession, ControlMessage};
pub use types::ClientId;
