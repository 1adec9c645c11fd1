//! Diagnostics for IQL lexing, parsing and execution.
//!
//! Syntax and evaluation errors carry the query text and a labelled span, so
//! miette renders them with the offending token underlined.

use miette::{Diagnostic, SourceSpan};
use thiserror::Error;

use crate::error::{GraphError, StoreError};
use crate::temporal::TemporalError;

use super::ast::Span;

#[derive(Debug, Error, Diagnostic)]
pub enum IqlError {
    #[error("syntax error at offset {position}: {message}")]
    #[diagnostic(
        code(infragraph::iql::syntax),
        help(
            "IQL queries look like `FIND database WHERE tags.env = \"prod\" LIMIT 10`, \
             `SUMMARIZE nodes BY provider, region`, `PATH FROM \"a\" TO \"b\"` or \
             `DIFF SINCE 1700000000000`."
        )
    )]
    Syntax {
        message: String,
        position: usize,
        #[source_code]
        src: String,
        #[label("here")]
        span: SourceSpan,
    },

    #[error("evaluation error at offset {position}: {message}")]
    #[diagnostic(
        code(infragraph::iql::evaluation),
        help(
            "The query parsed but cannot be evaluated. Check target and field names, \
             function names and arity, literal types and regular expressions."
        )
    )]
    Evaluation {
        message: String,
        position: usize,
        #[source_code]
        src: String,
        #[label("here")]
        span: SourceSpan,
    },

    #[error(transparent)]
    #[diagnostic(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    #[diagnostic(transparent)]
    Temporal(#[from] TemporalError),
}

impl IqlError {
    pub fn syntax(src: &str, span: Span, message: impl Into<String>) -> Self {
        IqlError::Syntax {
            message: message.into(),
            position: span.start,
            src: src.to_string(),
            span: span.into(),
        }
    }

    pub fn evaluation(src: &str, span: Span, message: impl Into<String>) -> Self {
        IqlError::Evaluation {
            message: message.into(),
            position: span.start,
            src: src.to_string(),
            span: span.into(),
        }
    }

    pub(crate) fn from_graph(src: &str, span: Span, err: GraphError) -> Self {
        Self::evaluation(src, span, err.to_string())
    }

    /// Byte offset the error points at, for syntax and evaluation errors.
    pub fn position(&self) -> Option<usize> {
        match self {
            IqlError::Syntax { position, .. } | IqlError::Evaluation { position, .. } => Some(*position),
            IqlError::Store(_) | IqlError::Temporal(_) => None,
        }
    }

    pub fn message(&self) -> String {
        match self {
            IqlError::Syntax { message, .. } | IqlError::Evaluation { message, .. } => message.clone(),
            other => other.to_string(),
        }
    }
}

/// Result type for IQL operations.
pub type IqlResult<T> = std::result::Result<T, IqlError>;
