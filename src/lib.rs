// thiserror's #[error("...{field}...")] format strings reference struct fields,
// but the compiler doesn't see through the derive macro and reports false positives.
#![allow(unused_assignments)]

//! # infragraph
//!
//! A provider-agnostic knowledge graph of cloud infrastructure: resources are
//! nodes, typed relationships are edges, and every change is kept as history.
//!
//! ## Architecture
//!
//! - **Storage** (`store`): one `GraphStorage` contract over memory, redb and SQL backends
//! - **Temporal** (`temporal`): version chains, snapshots, point-in-time topology, diffs, retention
//! - **Sync** (`sync`): incremental reconciliation of discovery adapter output
//! - **Query** (`iql`): the IQL query language
//! - **Graph** (`graph`): paths, blast radius, single points of failure, clusters
//! - **Tenancy** (`tenant`): tenant registry and isolation
//! - **Monitoring** (`monitor`): scheduled sync cycles and query-based alerts
//!
//! ## Library usage
//!
//! ```no_run
//! use infragraph::config::EngineConfig;
//! use infragraph::engine::Engine;
//! use infragraph::model::TenantId;
//!
//! # async fn run() -> infragraph::error::InfraResult<()> {
//! let engine = Engine::open(EngineConfig::memory()).await?;
//! let result = engine
//!     .query(&TenantId::default(), r#"FIND database WHERE tags.environment = "production""#)
//!     .await?;
//! println!("{} matches", result.match_count());
//! # Ok(())
//! # }
//! ```

pub mod cache;
pub mod config;
pub mod engine;
pub mod error;
pub mod export;
pub mod fields;
pub mod graph;
pub mod iql;
pub mod model;
pub mod monitor;
pub mod store;
pub mod sync;
pub mod temporal;
pub mod tenant;
