//! PostgreSQL wire protocol server
//!
//! Lets psql, ORMs and BI tools talk to the proxy as if it were PostgreSQL.
//!
//! ## Module Structure
//!
//! - `types` - Type name to OID/length mapping for RowDescription
//! - `messages` - Backend message builders
//! - `connection` - SSL decline, startup, auth passthrough, TCP keepalive
//! - `params` - Bind value decoding and inlining as SQL literals
//! - `extended` - Parse/Bind/Describe/Execute/Close handling
//! - `query_loop` - Message loop, Sync handling and the socket-backed result sink
//! - `server` - Listener, connection cap and per-client tasks

pub mod connection;
mod extended;
pub mod messages;
mod params;
mod query_loop;
mod server;
pub mod types;

pub use server::PgWireServer;
