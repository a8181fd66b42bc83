//! Realtime relay between chat clients and the messaging backend.
//!
//! Clients hold a WebSocket open, identified by `userId` and `deviceId`
//! query parameters. Every event a client sends is persisted through the
//! backend HTTP API, and the derived payload is pushed to the open sockets of
//! both conversation participants the backend names in its response.
//!
//! - [`cli`] parses command-line flags and environment into a [`server::RelayConfig`].
//! - [`server`] accepts WebSocket upgrades and runs one reader and one writer
//!   task per connection.
//! - [`registry`] tracks the live connection for each user and device.
//! - [`router`] decodes, forwards and fans out one event at a time.
//! - [`event`] holds the inbound envelopes and the payload shaping per kind.
//! - [`backend`] is the HTTP client for the backend routes and its shared
//!   response contract.

pub mod backend;
pub mod cli;
pub mod event;
pub mod registry;
pub mod router;
pub mod server;
