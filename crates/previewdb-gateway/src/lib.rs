//! previewdb gateway
//!
//! Routing proxy in front of a production and a fresh (preview) PostgreSQL
//! store. Writes land on fresh; reads of federated tables see fresh rows
//! layered over production rows through postgres_fdw; other reads probe fresh
//! and fall back to production.

pub mod backend;
pub mod classifier;
pub mod errors;
pub mod federation;
pub mod http_api;
pub mod metrics;
pub mod pg_wire;
pub mod router;
pub mod telemetry;

pub use backend::{Backend, BackendRole, PgBackend};
pub use router::{QueryRouter, ResultSink};
