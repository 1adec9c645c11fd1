//! IQL, the infrastructure query language.
//!
//! Text goes through [`lexer`] → [`parser`] → [`executor`]:
//!
//! ```text
//! FIND database WHERE tags.environment = "production" AND cost > 100 LIMIT 10
//! FIND nodes WHERE is_spof() OR depends_on("orders-db")
//! SUMMARIZE compute BY provider, region
//! PATH FROM "web-1" TO "orders-db"
//! DIFF SINCE 1700000000000
//! ```
//!
//! Execution is read-only and all-or-nothing: a query either returns its
//! full result or an [`IqlError`] pointing at the offending token.

pub mod ast;
pub mod error;
pub mod executor;
pub mod lexer;
pub mod parser;

pub use ast::{CompareOp, Condition, Query, Span};
pub use error::{IqlError, IqlResult};
pub use executor::{Executor, QueryResult, Summary, SummaryGroup};
pub use parser::parse;

use crate::store::GraphStorage;

/// Parse and run `src` against `storage` with no tenant scope.
pub async fn query(storage: &dyn GraphStorage, src: &str) -> IqlResult<QueryResult> {
    Executor::new(storage).run(src).await
}
