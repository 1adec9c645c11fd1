//! Tokenizer for IQL.
//!
//! Keywords are case-insensitive. Identifiers may contain `-` after the first
//! character (`load-balancer`). Strings use `"` or `'` with backslash escapes.
//! Every token records its byte span for diagnostics.

use super::ast::Span;
use super::error::{IqlError, IqlResult};

#[derive(Debug, Clone, PartialEq)]
pub enum TokenKind {
    // Keywords
    Find,
    Summarize,
    Where,
    By,
    And,
    Or,
    Not,
    Contains,
    Matches,
    Limit,
    Path,
    From,
    To,
    Diff,
    Since,
    True,
    False,
    Null,
    // Atoms
    Ident(String),
    Str(String),
    Number(f64),
    // Punctuation
    Eq,
    Ne,
    Gt,
    Lt,
    Ge,
    Le,
    LParen,
    RParen,
    Comma,
    Dot,
    Star,
    Eof,
}

impl TokenKind {
    fn keyword(word: &str) -> Option<TokenKind> {
        Some(match word.to_ascii_uppercase().as_str() {
            "FIND" => TokenKind::Find,
            "SUMMARIZE" => TokenKind::Summarize,
            "WHERE" => TokenKind::Where,
            "BY" => TokenKind::By,
            "AND" => TokenKind::And,
            "OR" => TokenKind::Or,
            "NOT" => TokenKind::Not,
            "CONTAINS" => TokenKind::Contains,
            "MATCHES" => TokenKind::Matches,
            "LIMIT" => TokenKind::Limit,
            "PATH" => TokenKind::Path,
            "FROM" => TokenKind::From,
            "TO" => TokenKind::To,
            "DIFF" => TokenKind::Diff,
            "SINCE" => TokenKind::Since,
            "TRUE" => TokenKind::True,
            "FALSE" => TokenKind::False,
            "NULL" => TokenKind::Null,
            _ => return None,
        })
    }

    /// Human-readable name used in "expected ..." messages.
    pub fn describe(&self) -> String {
        match self {
            TokenKind::Ident(s) => format!("identifier `{s}`"),
            TokenKind::Str(s) => format!("string \"{s}\""),
            TokenKind::Number(n) => format!("number {n}"),
            TokenKind::Eq => "`=`".into(),
            TokenKind::Ne => "`!=`".into(),
            TokenKind::Gt => "`>`".into(),
            TokenKind::Lt => "`<`".into(),
            TokenKind::Ge => "`>=`".into(),
            TokenKind::Le => "`<=`".into(),
            TokenKind::LParen => "`(`".into(),
            TokenKind::RParen => "`)`".into(),
            TokenKind::Comma => "`,`".into(),
            TokenKind::Dot => "`.`".into(),
            TokenKind::Star => "`*`".into(),
            TokenKind::Eof => "end of query".into(),
            keyword => format!("{keyword:?}").to_uppercase(),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Token {
    pub kind: TokenKind,
    pub span: Span,
}

fn is_ident_start(c: char) -> bool {
    c.is_ascii_alphabetic() || c == '_'
}

fn is_ident_continue(c: char) -> bool {
    c.is_ascii_alphanumeric() || c == '_' || c == '-'
}

/// Split `src` into tokens, ending with [`TokenKind::Eof`].
pub fn tokenize(src: &str) -> IqlResult<Vec<Token>> {
    let mut tokens = Vec::new();
    let mut chars = src.char_indices().peekable();

    while let Some(&(start, c)) = chars.peek() {
        if c.is_whitespace() {
            chars.next();
            continue;
        }

        let single = |kind: TokenKind| Token {
            kind,
            span: Span::new(start, start + 1),
        };

        match c {
            '(' => {
                chars.next();
                tokens.push(single(TokenKind::LParen));
            }
            ')' => {
                chars.next();
                tokens.push(single(TokenKind::RParen));
            }
            ',' => {
                chars.next();
                tokens.push(single(TokenKind::Comma));
            }
            '.' => {
                chars.next();
                tokens.push(single(TokenKind::Dot));
            }
            '*' => {
                chars.next();
                tokens.push(single(TokenKind::Star));
            }
            '=' => {
                chars.next();
                // `==` is accepted as an alias.
                let end = if chars.next_if(|&(_, c)| c == '=').is_some() { start + 2 } else { start + 1 };
                tokens.push(Token {
                    kind: TokenKind::Eq,
                    span: Span::new(start, end),
                });
            }
            '!' => {
                chars.next();
                if chars.next_if(|&(_, c)| c == '=').is_none() {
                    return Err(IqlError::syntax(src, Span::new(start, start + 1), "expected `!=`"));
                }
                tokens.push(Token {
                    kind: TokenKind::Ne,
                    span: Span::new(start, start + 2),
                });
            }
            '<' | '>' => {
                chars.next();
                let with_eq = chars.next_if(|&(_, c)| c == '=').is_some();
                let kind = match (c, with_eq) {
                    ('<', false) => TokenKind::Lt,
                    ('<', true) => TokenKind::Le,
                    ('>', false) => TokenKind::Gt,
                    _ => TokenKind::Ge,
                };
                tokens.push(Token {
                    kind,
                    span: Span::new(start, start + if with_eq { 2 } else { 1 }),
                });
            }
            '"' | '\'' => tokens.push(lex_string(src, &mut chars, start, c)?),
            c if c.is_ascii_digit() || c == '-' => tokens.push(lex_number(src, &mut chars, start)?),
            c if is_ident_start(c) => {
                let mut end = start;
                while let Some(&(i, c)) = chars.peek() {
                    if !is_ident_continue(c) {
                        break;
                    }
                    end = i + c.len_utf8();
                    chars.next();
                }
                let word = &src[start..end];
                let kind = TokenKind::keyword(word).unwrap_or_else(|| TokenKind::Ident(word.to_string()));
                tokens.push(Token {
                    kind,
                    span: Span::new(start, end),
                });
            }
            other => {
                return Err(IqlError::syntax(
                    src,
                    Span::new(start, start + other.len_utf8()),
                    format!("unexpected character `{other}`"),
                ));
            }
        }
    }

    tokens.push(Token {
        kind: TokenKind::Eof,
        span: Span::new(src.len(), src.len()),
    });
    Ok(tokens)
}

type Chars<'a> = std::iter::Peekable<std::str::CharIndices<'a>>;

fn lex_string(src: &str, chars: &mut Chars<'_>, start: usize, quote: char) -> IqlResult<Token> {
    chars.next();
    let mut value = String::new();
    loop {
        let Some((i, c)) = chars.next() else {
            return Err(IqlError::syntax(src, Span::new(start, src.len()), "unterminated string literal"));
        };
        match c {
            c if c == quote => {
                return Ok(Token {
                    kind: TokenKind::Str(value),
                    span: Span::new(start, i + 1),
                });
            }
            '\\' => {
                let Some((j, escaped)) = chars.next() else {
                    return Err(IqlError::syntax(src, Span::new(start, src.len()), "unterminated string literal"));
                };
                value.push(match escaped {
                    'n' => '\n',
                    't' => '\t',
                    'r' => '\r',
                    '\\' | '"' | '\'' => escaped,
                    other => {
                        return Err(IqlError::syntax(
                            src,
                            Span::new(i, j + other.len_utf8()),
                            format!("unknown escape `\\{other}`"),
                        ));
                    }
                });
            }
            c => value.push(c),
        }
    }
}

fn lex_number(src: &str, chars: &mut Chars<'_>, start: usize) -> IqlResult<Token> {
    let mut end = start;
    if chars.next_if(|&(_, c)| c == '-').is_some() {
        end += 1;
    }
    let mut seen_dot = false;
    while let Some(&(i, c)) = chars.peek() {
        if c.is_ascii_digit() {
            end = i + 1;
            chars.next();
        } else if c == '.' && !seen_dot {
            // Only a fraction if a digit follows.
            let digit_follows = src[i + 1..].chars().next().is_some_and(|d| d.is_ascii_digit());
            if !digit_follows {
                break;
            }
            seen_dot = true;
            end = i + 1;
            chars.next();
        } else {
            break;
        }
    }
    let text = &src[start..end];
    let span = Span::new(start, end.max(start + 1));
    text.parse::<f64>()
        .map(|n| Token {
            kind: TokenKind::Number(n),
            span,
        })
        .map_err(|_| IqlError::syntax(src, span, format!("invalid number `{text}`")))
}
