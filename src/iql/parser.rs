//! Recursive-descent parser from tokens to [`Query`].
//!
//! ```text
//! query     := find | summarize | path | diff
//! find      := FIND target [WHERE cond] [LIMIT number]
//! summarize := SUMMARIZE target [WHERE cond] BY field ("," field)*
//! path      := PATH FROM string TO string
//! diff      := DIFF SINCE number [TO number]
//! cond      := and (OR and)*
//! and       := unary (AND unary)*
//! unary     := NOT unary | "(" cond ")" | call | compare
//! call      := IDENT "(" [literal ("," literal)*] ")"
//! compare   := field op literal
//! ```

use super::ast::{
    CompareOp, Condition, DiffQuery, FieldRef, FindQuery, Literal, LiteralValue, PathQuery, Query, Span,
    SummarizeQuery, Target,
};
use super::error::{IqlError, IqlResult};
use super::lexer::{Token, TokenKind, tokenize};

/// Parse IQL text into a query.
pub fn parse(src: &str) -> IqlResult<Query> {
    let tokens = tokenize(src)?;
    let mut parser = Parser { src, tokens, pos: 0 };
    let query = parser.query()?;
    parser.expect_eof()?;
    Ok(query)
}

struct Parser<'a> {
    src: &'a str,
    tokens: Vec<Token>,
    pos: usize,
}

impl<'a> Parser<'a> {
    fn peek(&self) -> &Token {
        // `tokenize` always ends with Eof, and `advance` never moves past it.
        &self.tokens[self.pos.min(self.tokens.len() - 1)]
    }

    fn advance(&mut self) -> Token {
        let token = self.peek().clone();
        if token.kind != TokenKind::Eof {
            self.pos += 1;
        }
        token
    }

    fn check(&self, kind: &TokenKind) -> bool {
        &self.peek().kind == kind
    }

    fn eat(&mut self, kind: &TokenKind) -> Option<Token> {
        if self.check(kind) { Some(self.advance()) } else { None }
    }

    fn error(&self, span: Span, message: impl Into<String>) -> IqlError {
        IqlError::syntax(self.src, span, message)
    }

    fn unexpected(&self, expected: &str) -> IqlError {
        let token = self.peek();
        self.error(token.span, format!("expected {expected}, found {}", token.kind.describe()))
    }

    fn expect(&mut self, kind: &TokenKind, expected: &str) -> IqlResult<Token> {
        self.eat(kind).ok_or_else(|| self.unexpected(expected))
    }

    fn expect_eof(&self) -> IqlResult<()> {
        if self.check(&TokenKind::Eof) {
            Ok(())
        } else {
            Err(self.unexpected("end of query"))
        }
    }

    fn query(&mut self) -> IqlResult<Query> {
        let kind = self.peek().kind.clone();
        match kind {
            TokenKind::Find => {
                self.advance();
                self.find().map(Query::Find)
            }
            TokenKind::Summarize => {
                self.advance();
                self.summarize().map(Query::Summarize)
            }
            TokenKind::Path => {
                self.advance();
                self.path().map(Query::Path)
            }
            TokenKind::Diff => {
                let start = self.advance().span;
                self.diff(start).map(Query::Diff)
            }
            _ => Err(self.unexpected("FIND, SUMMARIZE, PATH or DIFF")),
        }
    }

    fn target(&mut self) -> IqlResult<Target> {
        let token = self.peek().clone();
        match token.kind {
            TokenKind::Ident(name) => {
                self.advance();
                Ok(Target { name, span: token.span })
            }
            TokenKind::Star => {
                self.advance();
                Ok(Target {
                    name: "*".into(),
                    span: token.span,
                })
            }
            _ => Err(self.unexpected("a target (`nodes`, `edges`, `*` or a resource type)")),
        }
    }

    fn optional_where(&mut self) -> IqlResult<Option<Condition>> {
        if self.eat(&TokenKind::Where).is_some() {
            self.condition().map(Some)
        } else {
            Ok(None)
        }
    }

    fn find(&mut self) -> IqlResult<FindQuery> {
        let target = self.target()?;
        let condition = self.optional_where()?;
        let limit = if self.eat(&TokenKind::Limit).is_some() {
            Some(self.unsigned("a non-negative integer limit")? as usize)
        } else {
            None
        };
        Ok(FindQuery {
            target,
            condition,
            limit,
        })
    }

    fn summarize(&mut self) -> IqlResult<SummarizeQuery> {
        let target = self.target()?;
        let condition = self.optional_where()?;
        self.expect(&TokenKind::By, "BY")?;
        let mut group_by = vec![self.field()?];
        while self.eat(&TokenKind::Comma).is_some() {
            group_by.push(self.field()?);
        }
        Ok(SummarizeQuery {
            target,
            condition,
            group_by,
        })
    }

    fn path(&mut self) -> IqlResult<PathQuery> {
        self.expect(&TokenKind::From, "FROM")?;
        let from = self.string_literal()?;
        self.expect(&TokenKind::To, "TO")?;
        let to = self.string_literal()?;
        Ok(PathQuery { from, to })
    }

    fn diff(&mut self, start: Span) -> IqlResult<DiffQuery> {
        self.expect(&TokenKind::Since, "SINCE")?;
        let since = self.unsigned("a timestamp in milliseconds")?;
        let until = if self.eat(&TokenKind::To).is_some() {
            Some(self.unsigned("a timestamp in milliseconds")?)
        } else {
            None
        };
        let end = self.tokens[self.pos.saturating_sub(1)].span;
        Ok(DiffQuery {
            since,
            until,
            span: start.join(end),
        })
    }

    fn unsigned(&mut self, expected: &str) -> IqlResult<u64> {
        let token = self.peek().clone();
        match token.kind {
            TokenKind::Number(n) if n >= 0.0 && n.fract() == 0.0 && n <= u64::MAX as f64 => {
                self.advance();
                Ok(n as u64)
            }
            TokenKind::Number(_) => Err(self.error(token.span, format!("expected {expected}"))),
            _ => Err(self.unexpected(expected)),
        }
    }

    fn string_literal(&mut self) -> IqlResult<Literal> {
        let token = self.peek().clone();
        match token.kind {
            TokenKind::Str(s) => {
                self.advance();
                Ok(Literal {
                    value: LiteralValue::Str(s),
                    span: token.span,
                })
            }
            _ => Err(self.unexpected("a quoted node id")),
        }
    }

    // -- conditions -----------------------------------------------------------

    fn condition(&mut self) -> IqlResult<Condition> {
        let mut left = self.and()?;
        while self.eat(&TokenKind::Or).is_some() {
            let right = self.and()?;
            left = Condition::Or(Box::new(left), Box::new(right));
        }
        Ok(left)
    }

    fn and(&mut self) -> IqlResult<Condition> {
        let mut left = self.unary()?;
        while self.eat(&TokenKind::And).is_some() {
            let right = self.unary()?;
            left = Condition::And(Box::new(left), Box::new(right));
        }
        Ok(left)
    }

    fn unary(&mut self) -> IqlResult<Condition> {
        if self.eat(&TokenKind::Not).is_some() {
            return Ok(Condition::Not(Box::new(self.unary()?)));
        }
        if self.eat(&TokenKind::LParen).is_some() {
            let inner = self.condition()?;
            self.expect(&TokenKind::RParen, "`)`")?;
            return Ok(inner);
        }
        let is_call = matches!(self.peek().kind, TokenKind::Ident(_))
            && self
                .tokens
                .get(self.pos + 1)
                .is_some_and(|t| t.kind == TokenKind::LParen);
        if is_call { self.call() } else { self.compare() }
    }

    fn call(&mut self) -> IqlResult<Condition> {
        let name_token = self.advance();
        let TokenKind::Ident(name) = name_token.kind else {
            return Err(self.error(name_token.span, "expected a function name"));
        };
        self.expect(&TokenKind::LParen, "`(`")?;
        let mut args = Vec::new();
        if !self.check(&TokenKind::RParen) {
            args.push(self.literal()?);
            while self.eat(&TokenKind::Comma).is_some() {
                args.push(self.literal()?);
            }
        }
        let close = self.expect(&TokenKind::RParen, "`,` or `)`")?;
        Ok(Condition::Function {
            name,
            args,
            span: name_token.span.join(close.span),
        })
    }

    fn compare(&mut self) -> IqlResult<Condition> {
        let field = self.field()?;
        let op_token = self.advance();
        let op = match op_token.kind {
            TokenKind::Eq => CompareOp::Eq,
            TokenKind::Ne => CompareOp::Ne,
            TokenKind::Gt => CompareOp::Gt,
            TokenKind::Lt => CompareOp::Lt,
            TokenKind::Ge => CompareOp::Ge,
            TokenKind::Le => CompareOp::Le,
            TokenKind::Contains => CompareOp::Contains,
            TokenKind::Matches => CompareOp::Matches,
            other => {
                return Err(self.error(
                    op_token.span,
                    format!("expected a comparison operator after `{field}`, found {}", other.describe()),
                ));
            }
        };
        let value = self.literal()?;
        Ok(Condition::Compare { field, op, value })
    }

    /// Dotted path. Segments after the first may also be numbers (array
    /// indexes) or keywords (`tags.from`).
    fn field(&mut self) -> IqlResult<FieldRef> {
        let first = self.peek().clone();
        let TokenKind::Ident(head) = first.kind else {
            return Err(self.unexpected("a field name"));
        };
        self.advance();
        let mut path = vec![head];
        let mut span = first.span;

        while self.eat(&TokenKind::Dot).is_some() {
            let token = self.advance();
            let segment = match &token.kind {
                TokenKind::Ident(s) => s.clone(),
                TokenKind::Number(n) if n.fract() == 0.0 && *n >= 0.0 => format!("{}", *n as u64),
                TokenKind::Str(s) => s.clone(),
                TokenKind::Eof
                | TokenKind::Number(_)
                | TokenKind::Eq
                | TokenKind::Ne
                | TokenKind::Gt
                | TokenKind::Lt
                | TokenKind::Ge
                | TokenKind::Le
                | TokenKind::LParen
                | TokenKind::RParen
                | TokenKind::Comma
                | TokenKind::Dot
                | TokenKind::Star => {
                    return Err(self.error(token.span, "expected a field name after `.`"));
                }
                _keyword => self.src[token.span.start..token.span.end].to_string(),
            };
            path.push(segment);
            span = span.join(token.span);
        }
        Ok(FieldRef { path, span })
    }

    fn literal(&mut self) -> IqlResult<Literal> {
        let token = self.peek().clone();
        let value = match token.kind {
            TokenKind::Str(s) => LiteralValue::Str(s),
            TokenKind::Number(n) => LiteralValue::Number(n),
            TokenKind::True => LiteralValue::Bool(true),
            TokenKind::False => LiteralValue::Bool(false),
            TokenKind::Null => LiteralValue::Null,
            _ => return Err(self.unexpected("a literal (string, number, TRUE, FALSE or NULL)")),
        };
        self.advance();
        Ok(Literal {
            value,
            span: token.span,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn find(src: &str) -> FindQuery {
        match parse(src).unwrap() {
            Query::Find(q) => q,
            other => panic!("expected FIND, got {other:?}"),
        }
    }

    #[test]
    fn parses_find_with_where_and_limit() {
        let q = find(r#"FIND database WHERE tags.env = "prod" AND cost > 100 LIMIT 5"#);
        assert_eq!(q.target.name, "database");
        assert_eq!(q.limit, Some(5));
        let Some(Condition::And(left, right)) = q.condition else {
            panic!("expected AND");
        };
        assert!(matches!(*left, Condition::Compare { op: CompareOp::Eq, .. }));
        assert!(matches!(*right, Condition::Compare { op: CompareOp::Gt, .. }));
    }

    #[test]
    fn and_binds_tighter_than_or() {
        let q = find("FIND * WHERE a = 1 OR b = 2 AND c = 3");
        let Some(Condition::Or(_, right)) = q.condition else {
            panic!("expected OR at the root");
        };
        assert!(matches!(*right, Condition::And(_, _)));
    }

    #[test]
    fn parses_not_parens_and_calls() {
        let q = find(r#"FIND nodes WHERE NOT (is_orphan() OR has_tag("team", "core"))"#);
        let Some(Condition::Not(inner)) = q.condition else {
            panic!("expected NOT");
        };
        let Condition::Or(a, b) = *inner else {
            panic!("expected OR");
        };
        assert!(matches!(*a, Condition::Function { ref name, ref args, .. } if name == "is_orphan" && args.is_empty()));
        assert!(matches!(*b, Condition::Function { ref args, .. } if args.len() == 2));
    }

    #[test]
    fn parses_summarize_path_and_diff() {
        match parse("SUMMARIZE nodes BY provider, tags.env").unwrap() {
            Query::Summarize(q) => {
                assert_eq!(q.group_by.len(), 2);
                assert_eq!(q.group_by[1].path, vec!["tags", "env"]);
            }
            other => panic!("unexpected {other:?}"),
        }
        match parse(r#"PATH FROM "a" TO "b""#).unwrap() {
            Query::Path(q) => assert_eq!(q.to.as_str(), Some("b")),
            other => panic!("unexpected {other:?}"),
        }
        match parse("DIFF SINCE 100 TO 200").unwrap() {
            Query::Diff(q) => {
                assert_eq!((q.since, q.until), (100, Some(200)));
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn keyword_and_index_path_segments() {
        let q = find("FIND nodes WHERE tags.from = 'x' OR metadata.replicas.0 = 'r'");
        let Some(Condition::Or(a, b)) = q.condition else {
            panic!("expected OR");
        };
        assert!(matches!(*a, Condition::Compare { ref field, .. } if field.path == vec!["tags", "from"]));
        assert!(
            matches!(*b, Condition::Compare { ref field, .. } if field.path == vec!["metadata", "replicas", "0"])
        );
    }

    #[test]
    fn syntax_errors_carry_position() {
        let err = parse("FIND nodes WHERE name =").unwrap_err();
        assert_eq!(err.position(), Some(23));
        let err = parse("FIND nodes LIMIT -1").unwrap_err();
        assert_eq!(err.position(), Some(17));
        let err = parse("SUMMARIZE nodes").unwrap_err();
        assert!(err.message().contains("BY"));
        let err = parse("FIND nodes extra").unwrap_err();
        assert_eq!(err.position(), Some(11));
        assert!(matches!(parse("DELETE nodes"), Err(IqlError::Syntax { .. })));
    }
}
