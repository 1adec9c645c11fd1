//! Rich diagnostic error types for the infragraph engine.
//!
//! Each subsystem defines its own error type with miette `#[diagnostic]` derives,
//! providing error codes, help text, and source chains so callers know exactly
//! what went wrong and how to fix it. Subsystems with their own module
//! (`iql`, `sync`, `temporal`, `tenant`) keep their error next to the code.

use miette::Diagnostic;
use thiserror::Error;

pub use crate::iql::error::IqlError;
pub use crate::sync::error::{DiscoveryError, SyncError};
pub use crate::temporal::TemporalError;
pub use crate::tenant::TenantError;

/// Top-level error type for the engine.
///
/// Each variant wraps a subsystem-specific error, preserving the full diagnostic
/// chain (error codes, help text, source spans) through to the caller.
#[derive(Debug, Error, Diagnostic)]
pub enum InfraError {
    #[error(transparent)]
    #[diagnostic(transparent)]
    Model(#[from] ModelError),

    #[error(transparent)]
    #[diagnostic(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    #[diagnostic(transparent)]
    Graph(#[from] GraphError),

    #[error(transparent)]
    #[diagnostic(transparent)]
    Iql(#[from] IqlError),

    #[error(transparent)]
    #[diagnostic(transparent)]
    Sync(#[from] SyncError),

    #[error(transparent)]
    #[diagnostic(transparent)]
    Temporal(#[from] TemporalError),

    #[error(transparent)]
    #[diagnostic(transparent)]
    Tenant(#[from] TenantError),

    #[error(transparent)]
    #[diagnostic(transparent)]
    Config(#[from] ConfigError),
}

// ---------------------------------------------------------------------------
// Model errors
// ---------------------------------------------------------------------------

#[derive(Debug, Error, Diagnostic)]
pub enum ModelError {
    #[error("unknown {kind}: \"{value}\"")]
    #[diagnostic(
        code(infragraph::model::unknown_variant),
        help(
            "The value is not part of the closed vocabulary for this field. \
             Use snake_case names such as \"database\", \"load_balancer\" or \"depends_on\"."
        )
    )]
    UnknownVariant { kind: &'static str, value: String },
}

// ---------------------------------------------------------------------------
// Store errors
// ---------------------------------------------------------------------------

#[derive(Debug, Error, Diagnostic)]
pub enum StoreError {
    #[error("I/O error: {source}")]
    #[diagnostic(
        code(infragraph::store::io),
        help(
            "A filesystem operation failed. Check that the data directory exists, \
             has correct permissions, and that the disk is not full."
        )
    )]
    Io {
        #[source]
        source: std::io::Error,
    },

    #[error("redb transaction error: {message}")]
    #[diagnostic(
        code(infragraph::store::redb),
        help(
            "The embedded database encountered a transaction error. \
             This may indicate corruption; try a fresh data directory."
        )
    )]
    Redb { message: String },

    #[error("SQL backend error: {message}")]
    #[diagnostic(
        code(infragraph::store::sql),
        help(
            "The networked SQL backend rejected the operation. \
             Check the connection URL, credentials and that the server is reachable."
        )
    )]
    Sql { message: String },

    #[error("serialization error: {message}")]
    #[diagnostic(
        code(infragraph::store::serde),
        help(
            "Failed to serialize or deserialize a stored entity. \
             This usually means the stored format changed between versions."
        )
    )]
    Serialization { message: String },

    #[error("key not found: {key}")]
    #[diagnostic(
        code(infragraph::store::not_found),
        help("The requested entity does not exist in the store. Verify the id is correct.")
    )]
    NotFound { key: String },

    #[error("edge {edge_id} references missing node {missing}")]
    #[diagnostic(
        code(infragraph::store::dangling_edge),
        help("Both endpoints of an edge must be stored before the edge itself. Upsert the node first.")
    )]
    DanglingEdge { edge_id: String, missing: String },

    #[error(transparent)]
    #[diagnostic(
        code(infragraph::store::tenant),
        help(
            "The operation crossed a tenant boundary. Work through the owning tenant's scope, \
             or grant cross-tenant access in both tenants' isolation policies."
        )
    )]
    Tenant(Box<TenantError>),

    #[error("storage backend task failed: {message}")]
    #[diagnostic(
        code(infragraph::store::backend),
        help("A blocking storage task panicked or was cancelled. Check the logs for the cause.")
    )]
    Backend { message: String },
}

impl From<serde_json::Error> for StoreError {
    fn from(e: serde_json::Error) -> Self {
        StoreError::Serialization {
            message: e.to_string(),
        }
    }
}

impl From<TenantError> for StoreError {
    fn from(e: TenantError) -> Self {
        StoreError::Tenant(Box::new(e))
    }
}

// ---------------------------------------------------------------------------
// Graph errors
// ---------------------------------------------------------------------------

#[derive(Debug, Error, Diagnostic)]
pub enum GraphError {
    #[error("node not found in graph view: {node_id}")]
    #[diagnostic(
        code(infragraph::graph::node_not_found),
        help(
            "The node is not part of the subgraph the view was built from. \
             Widen the query that feeds the view or check the node id."
        )
    )]
    NodeNotFound { node_id: String },
}

// ---------------------------------------------------------------------------
// Config errors
// ---------------------------------------------------------------------------

#[derive(Debug, Error, Diagnostic)]
pub enum ConfigError {
    #[error("failed to read config: {path}")]
    #[diagnostic(
        code(infragraph::config::read),
        help("Ensure the config file exists and is valid TOML.")
    )]
    Read {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse config: {path}: {message}")]
    #[diagnostic(
        code(infragraph::config::parse),
        help("Check the TOML syntax and the field names in the config file.")
    )]
    Parse { path: String, message: String },

    #[error("failed to write config: {path}")]
    #[diagnostic(
        code(infragraph::config::write),
        help("Ensure you have write permissions to the config directory.")
    )]
    Write {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("invalid configuration: {message}")]
    #[diagnostic(code(infragraph::config::invalid), help("Check the EngineConfig fields. {message}"))]
    Invalid { message: String },
}

/// Convenience alias for functions returning engine results.
pub type InfraResult<T> = std::result::Result<T, InfraError>;
