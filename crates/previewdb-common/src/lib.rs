//! previewdb Common Library
//!
//! Shared types used by the routing gateway: the service error type and the
//! configuration model with its file/environment loader.

pub mod config;
pub mod error;

// Re-export commonly used types
pub use config::{
    DbConfig, FederatedTableConfig, FederationConfig, LimitsConfig, ProxyConfig, ServerConfig,
    UnsupportedClausePolicy,
};
pub use error::{PreviewError, Result};
