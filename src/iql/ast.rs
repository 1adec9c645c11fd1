//! Abstract syntax tree for IQL queries.

use std::fmt;

use miette::SourceSpan;
use serde::{Deserialize, Serialize};

/// Byte-level source span for error reporting.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct Span {
    pub start: usize,
    pub end: usize,
}

impl Span {
    pub fn new(start: usize, end: usize) -> Self {
        Self { start, end }
    }

    /// Smallest span covering both.
    pub fn join(self, other: Span) -> Span {
        Span {
            start: self.start.min(other.start),
            end: self.end.max(other.end),
        }
    }
}

impl From<Span> for SourceSpan {
    fn from(span: Span) -> Self {
        (span.start, span.end.saturating_sub(span.start)).into()
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum Query {
    Find(FindQuery),
    Summarize(SummarizeQuery),
    Path(PathQuery),
    Diff(DiffQuery),
}

/// What a `FIND`/`SUMMARIZE` ranges over: `nodes`, `edges`, `*` or a
/// resource type name. Validated by the executor.
#[derive(Debug, Clone, PartialEq)]
pub struct Target {
    pub name: String,
    pub span: Span,
}

#[derive(Debug, Clone, PartialEq)]
pub struct FindQuery {
    pub target: Target,
    pub condition: Option<Condition>,
    pub limit: Option<usize>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct SummarizeQuery {
    pub target: Target,
    pub condition: Option<Condition>,
    pub group_by: Vec<FieldRef>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct PathQuery {
    pub from: Literal,
    pub to: Literal,
}

#[derive(Debug, Clone, PartialEq)]
pub struct DiffQuery {
    pub since: u64,
    pub until: Option<u64>,
    pub span: Span,
}

/// Dotted field path such as `tags.environment`.
#[derive(Debug, Clone, PartialEq)]
pub struct FieldRef {
    pub path: Vec<String>,
    pub span: Span,
}

impl fmt::Display for FieldRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.path.join("."))
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum LiteralValue {
    Str(String),
    Number(f64),
    Bool(bool),
    Null,
}

impl LiteralValue {
    pub fn type_name(&self) -> &'static str {
        match self {
            LiteralValue::Str(_) => "string",
            LiteralValue::Number(_) => "number",
            LiteralValue::Bool(_) => "boolean",
            LiteralValue::Null => "null",
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Literal {
    pub value: LiteralValue,
    pub span: Span,
}

impl Literal {
    pub fn as_str(&self) -> Option<&str> {
        match &self.value {
            LiteralValue::Str(s) => Some(s),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CompareOp {
    Eq,
    Ne,
    Gt,
    Lt,
    Ge,
    Le,
    Contains,
    Matches,
}

impl CompareOp {
    pub fn is_ordering(self) -> bool {
        matches!(self, CompareOp::Gt | CompareOp::Lt | CompareOp::Ge | CompareOp::Le)
    }
}

impl fmt::Display for CompareOp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            CompareOp::Eq => "=",
            CompareOp::Ne => "!=",
            CompareOp::Gt => ">",
            CompareOp::Lt => "<",
            CompareOp::Ge => ">=",
            CompareOp::Le => "<=",
            CompareOp::Contains => "CONTAINS",
            CompareOp::Matches => "MATCHES",
        })
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum Condition {
    Compare {
        field: FieldRef,
        op: CompareOp,
        value: Literal,
    },
    And(Box<Condition>, Box<Condition>),
    Or(Box<Condition>, Box<Condition>),
    Not(Box<Condition>),
    Function {
        name: String,
        args: Vec<Literal>,
        span: Span,
    },
}

impl Condition {
    /// Visit every function call in the tree, left to right.
    pub fn functions<'a>(&'a self, out: &mut Vec<(&'a str, &'a [Literal], Span)>) {
        match self {
            Condition::Compare { .. } => {}
            Condition::And(a, b) | Condition::Or(a, b) => {
                a.functions(out);
                b.functions(out);
            }
            Condition::Not(inner) => inner.functions(out),
            Condition::Function { name, args, span } => out.push((name.as_str(), args.as_slice(), *span)),
        }
    }
}
