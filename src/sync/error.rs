//! Error types for discovery adapters and sync cycles.

use miette::Diagnostic;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::error::StoreError;
use crate::temporal::TemporalError;

/// Failure reported by a discovery adapter for a page or a single record.
#[derive(Debug, Clone, PartialEq, Eq, Error, Diagnostic, Serialize, Deserialize)]
#[error("discovery failed: {message}")]
#[diagnostic(
    code(infragraph::sync::discovery),
    help(
        "The adapter could not list resources. Recoverable failures are recorded and \
         the cycle continues; check adapter credentials and upstream rate limits."
    )
)]
pub struct DiscoveryError {
    pub message: String,
    /// The cycle may continue past this failure.
    pub recoverable: bool,
    /// Cursor from which pagination can resume after a failed page.
    pub resume_cursor: Option<String>,
}

impl DiscoveryError {
    pub fn recoverable(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            recoverable: true,
            resume_cursor: None,
        }
    }

    pub fn fatal(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            recoverable: false,
            resume_cursor: None,
        }
    }

    /// Let pagination skip the failed page and continue at `cursor`.
    pub fn resume_at(mut self, cursor: impl Into<String>) -> Self {
        self.resume_cursor = Some(cursor.into());
        self
    }
}

/// Where in a cycle an issue was recorded.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IssueKind {
    /// A whole page failed to load.
    Page,
    /// The adapter reported a single record it could not read.
    Record,
    /// An edge referenced a node that does not exist.
    Edge,
    /// Pagination stopped making progress.
    Pagination,
    /// A record is stored under another tenant and was left untouched.
    Ownership,
}

/// One recorded, non-fatal problem in a sync cycle.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncIssue {
    pub kind: IssueKind,
    /// Resource type scope the issue occurred in (`None` = unscoped pass).
    pub scope: Option<String>,
    pub cursor: Option<String>,
    pub message: String,
    pub recoverable: bool,
}

impl SyncIssue {
    pub fn from_discovery(
        kind: IssueKind,
        scope: Option<String>,
        cursor: Option<String>,
        error: &DiscoveryError,
    ) -> Self {
        Self {
            kind,
            scope,
            cursor,
            message: error.message.clone(),
            recoverable: error.recoverable,
        }
    }
}

impl std::fmt::Display for SyncIssue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:?}", self.kind)?;
        if let Some(scope) = &self.scope {
            write!(f, " [{scope}]")?;
        }
        if let Some(cursor) = &self.cursor {
            write!(f, " @{cursor}")?;
        }
        write!(f, ": {}", self.message)
    }
}

/// Errors that end a sync cycle.
#[derive(Debug, Error, Diagnostic)]
pub enum SyncError {
    #[error("sync cycle for adapter \"{adapter_id}\" aborted (fail-fast): {issue}")]
    #[diagnostic(
        code(infragraph::sync::aborted),
        help(
            "fail_fast is set, so the first recorded issue ends the cycle. \
             Unset it to record issues and continue with the remaining pages."
        )
    )]
    Aborted { adapter_id: String, issue: String },

    #[error("no discovery adapter registered as \"{adapter_id}\"")]
    #[diagnostic(
        code(infragraph::sync::adapter_not_found),
        help("Register the adapter in the AdapterRegistry before scheduling it.")
    )]
    AdapterNotFound { adapter_id: String },

    #[error("sync worker failed: {message}")]
    #[diagnostic(
        code(infragraph::sync::worker),
        help("A pooled discovery task panicked or was aborted. Check the adapter implementation.")
    )]
    Worker { message: String },

    #[error(transparent)]
    #[diagnostic(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    #[diagnostic(transparent)]
    Temporal(#[from] TemporalError),
}

/// Result type for sync operations.
pub type SyncResult<T> = std::result::Result<T, SyncError>;
