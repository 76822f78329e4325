//! Line-based relay for private messages between named clients.
//!
//! Clients connect over TCP, send their display name as the first line,
//! and from then on receive the full roster whenever someone joins or
//! leaves. A line of the form `Privado:<target>:<body>` is delivered to
//! `<target>` as `Privado:<sender>:<body>` and echoed back to the sender.
//!
//! - [`cli`] parses the command-line interface for server and client modes.
//! - [`server`] binds the listener and spawns one task per connection.
//! - [`router`] drives a connection from registration to teardown and routes
//!   private messages.
//! - [`registry`] maps display names to live sessions.
//! - [`session`] owns a client's outbound queue and its single writer task.
//! - [`protocol`] parses and formats the wire lines.
//! - [`client`] is a small terminal front end for the relay.
//! - [`error`] holds the typed errors shared by the modules above.

pub mod cli;
pub mod client;
pub mod error;
pub mod protocol;
pub mod registry;
pub mod router;
pub mod server;
pub mod session;
