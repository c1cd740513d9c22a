//! JSON-RPC 2.0 tool-server router: one HTTP front door multiplexing many
//! MCP tool-server backends, each reachable over a spawned process or an
//! HTTP+SSE connection.
//!
//! The crate is organized around the path a request takes:
//! [`registry`] resolves an opaque key to a [`registry::ServerConfig`],
//! [`backend`] owns the correlated connection to that backend over a
//! [`transport`], [`session`] tracks per-client/per-session state across
//! requests, [`http`] exposes the client-facing endpoints, and
//! [`observability`] records completed tool calls. [`protocol`] and
//! [`error`] are the shared wire types and failure modes everything else
//! builds on; [`config`] loads the registry from disk at startup.

pub mod backend;
pub mod config;
pub mod error;
pub mod http;
pub mod observability;
pub mod protocol;
pub mod registry;
pub mod session;
pub mod transport;
