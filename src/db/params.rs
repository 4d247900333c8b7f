//! Named-parameter handling for SQL templates.
//!
//! Callers write `@name` placeholders and pass a [`NamedParams`] map. A template is
//! scanned once, every distinct name is assigned a position, and the statement is
//! rewritten into the driver's positional form (`@P1` for SQL Server, `?1` for
//! SQLite). Values are always bound through the driver, never spliced into the text.
//!
//! The scanner leaves alone:
//! - string literals (`'it''s'`), bracketed (`[col]`) and double-quoted identifiers
//! - line (`--`) and block (`/* */`, nestable) comments
//! - system variables such as `@@ROWCOUNT`
//! - variables declared by the template itself (`DECLARE @total money`)

use crate::db::macros::Backend;
use crate::error::{DbError, DbResult};
use crate::models::{NamedParams, Value};
use sqlx::Sqlite;
use sqlx::sqlite::SqliteArguments;
use std::collections::HashSet;
use std::ops::Range;

/// Keywords that end a `DECLARE` list when seen outside parentheses.
const STATEMENT_KEYWORDS: &[&str] = &[
    "SELECT", "SET", "INSERT", "UPDATE", "DELETE", "IF", "WHILE", "BEGIN", "EXEC", "EXECUTE",
    "RETURN", "WITH", "MERGE", "PRINT",
];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum TokenKind {
    Word,
    Variable,
    /// Literals, quoted identifiers, comments and system variables
    Verbatim,
    Space,
    Punct(u8),
}

#[derive(Debug, Clone, Copy)]
struct Token {
    kind: TokenKind,
    start: usize,
    end: usize,
}

fn is_ident_char(b: u8) -> bool {
    b.is_ascii_alphanumeric() || matches!(b, b'_' | b'#' | b'$') || b >= 0x80
}

fn is_variable_start(b: u8) -> bool {
    b.is_ascii_alphabetic() || b == b'_' || b >= 0x80
}

/// Skip a delimited run starting at `start`; a doubled closing delimiter is an escape.
fn skip_delimited(bytes: &[u8], start: usize, close: u8) -> usize {
    let mut i = start + 1;
    while i < bytes.len() {
        if bytes[i] == close {
            if bytes.get(i + 1) == Some(&close) {
                i += 2;
                continue;
            }
            return i + 1;
        }
        i += 1;
    }
    bytes.len()
}

fn skip_block_comment(bytes: &[u8], start: usize) -> usize {
    let mut depth = 0usize;
    let mut i = start;
    while i < bytes.len() {
        if bytes[i] == b'/' && bytes.get(i + 1) == Some(&b'*') {
            depth += 1;
            i += 2;
        } else if bytes[i] == b'*' && bytes.get(i + 1) == Some(&b'/') {
            depth -= 1;
            i += 2;
            if depth == 0 {
                return i;
            }
        } else {
            i += 1;
        }
    }
    bytes.len()
}

fn tokenize(sql: &str) -> Vec<Token> {
    let bytes = sql.as_bytes();
    let mut tokens = Vec::new();
    let mut i = 0;

    while i < bytes.len() {
        let start = i;
        let next = bytes.get(i + 1).copied();
        let kind = match bytes[i] {
            b'\'' => {
                i = skip_delimited(bytes, i, b'\'');
                TokenKind::Verbatim
            }
            b'"' => {
                i = skip_delimited(bytes, i, b'"');
                TokenKind::Verbatim
            }
            b'[' => {
                i = skip_delimited(bytes, i, b']');
                TokenKind::Verbatim
            }
            b'-' if next == Some(b'-') => {
                while i < bytes.len() && bytes[i] != b'\n' {
                    i += 1;
                }
                TokenKind::Verbatim
            }
            b'/' if next == Some(b'*') => {
                i = skip_block_comment(bytes, i);
                TokenKind::Verbatim
            }
            b'@' if next == Some(b'@') => {
                i += 2;
                while i < bytes.len() && is_ident_char(bytes[i]) {
                    i += 1;
                }
                TokenKind::Verbatim
            }
            b'@' if next.is_some_and(is_variable_start)
                && !(i > 0 && is_ident_char(bytes[i - 1])) =>
            {
                i += 1;
                while i < bytes.len() && is_ident_char(bytes[i]) {
                    i += 1;
                }
                TokenKind::Variable
            }
            b if b.is_ascii_whitespace() => {
                while i < bytes.len() && bytes[i].is_ascii_whitespace() {
                    i += 1;
                }
                TokenKind::Space
            }
            b if is_ident_char(b) => {
                while i < bytes.len() && is_ident_char(bytes[i]) {
                    i += 1;
                }
                TokenKind::Word
            }
            b => {
                i += 1;
                TokenKind::Punct(b)
            }
        };
        tokens.push(Token {
            kind,
            start,
            end: i,
        });
    }
    tokens
}

/// Names introduced by `DECLARE` inside the template (lowercased, without `@`).
fn declared_variables(sql: &str, tokens: &[Token]) -> HashSet<String> {
    let mut declared = HashSet::new();
    let mut in_declare = false;
    let mut expect_variable = false;
    let mut depth = 0usize;

    for token in tokens {
        let text = &sql[token.start..token.end];
        match token.kind {
            TokenKind::Space | TokenKind::Verbatim => {}
            TokenKind::Word => {
                let upper = text.to_ascii_uppercase();
                if upper == "DECLARE" {
                    in_declare = true;
                    expect_variable = true;
                    depth = 0;
                    continue;
                }
                if in_declare && depth == 0 && STATEMENT_KEYWORDS.contains(&upper.as_str()) {
                    in_declare = false;
                }
                expect_variable = false;
            }
            TokenKind::Variable => {
                if in_declare && expect_variable {
                    declared.insert(text[1..].to_lowercase());
                }
                expect_variable = false;
            }
            TokenKind::Punct(b'(') => {
                depth += 1;
                expect_variable = false;
            }
            TokenKind::Punct(b')') => {
                depth = depth.saturating_sub(1);
                expect_variable = false;
            }
            TokenKind::Punct(b',') => expect_variable = in_declare && depth == 0,
            TokenKind::Punct(b';') => {
                in_declare = false;
                expect_variable = false;
            }
            TokenKind::Punct(_) => expect_variable = false,
        }
    }
    declared
}

#[derive(Debug, Clone)]
enum Piece {
    Text(Range<usize>),
    Param(usize),
}

/// A parsed SQL template with its `@name` placeholders located.
#[derive(Debug, Clone)]
pub struct SqlTemplate<'a> {
    sql: &'a str,
    pieces: Vec<Piece>,
    /// Placeholder names in order of first appearance, as written (without `@`).
    names: Vec<String>,
}

impl<'a> SqlTemplate<'a> {
    /// Scan `sql` for placeholders.
    pub fn parse(sql: &'a str) -> Self {
        let tokens = tokenize(sql);
        let declared = declared_variables(sql, &tokens);

        let mut pieces = Vec::new();
        let mut names: Vec<String> = Vec::new();
        let mut keys: Vec<String> = Vec::new();
        let mut text_start = 0;

        for token in tokens.iter().filter(|t| t.kind == TokenKind::Variable) {
            let name = &sql[token.start + 1..token.end];
            let key = name.to_lowercase();
            if declared.contains(&key) {
                continue;
            }
            let idx = match keys.iter().position(|k| *k == key) {
                Some(idx) => idx,
                None => {
                    keys.push(key);
                    names.push(name.to_string());
                    keys.len() - 1
                }
            };
            if text_start < token.start {
                pieces.push(Piece::Text(text_start..token.start));
            }
            pieces.push(Piece::Param(idx));
            text_start = token.end;
        }
        if text_start < sql.len() {
            pieces.push(Piece::Text(text_start..sql.len()));
        }

        Self { sql, pieces, names }
    }

    /// Distinct placeholder names in order of first appearance.
    pub fn parameter_names(&self) -> &[String] {
        &self.names
    }

    /// Resolve every placeholder against `params`, in positional order.
    ///
    /// Entries in `params` that the template does not reference are ignored.
    pub fn bind(&self, params: &NamedParams) -> DbResult<Vec<Value>> {
        self.names
            .iter()
            .map(|name| {
                params
                    .get(name)
                    .cloned()
                    .ok_or_else(|| DbError::missing_parameter(name.as_str()))
            })
            .collect()
    }

    /// Rewrite the template with the backend's positional placeholders.
    pub fn render(&self, backend: Backend) -> String {
        let mut out = String::with_capacity(self.sql.len() + self.names.len() * 2);
        for piece in &self.pieces {
            match piece {
                Piece::Text(range) => out.push_str(&self.sql[range.clone()]),
                Piece::Param(idx) => out.push_str(&backend.placeholder(idx + 1)),
            }
        }
        out
    }
}

/// A statement ready for a specific driver.
#[derive(Debug, Clone)]
pub struct BoundStatement {
    pub sql: String,
    pub values: Vec<Value>,
}

impl BoundStatement {
    /// Parse, bind and render in one step.
    pub fn prepare(sql: &str, params: &NamedParams, backend: Backend) -> DbResult<Self> {
        let template = SqlTemplate::parse(sql);
        let values = template.bind(params)?;
        Ok(Self {
            sql: template.render(backend),
            values,
        })
    }
}

/// Bind a value to a SQLite query.
pub(crate) fn bind_sqlite_value<'q>(
    query: sqlx::query::Query<'q, Sqlite, SqliteArguments<'q>>,
    value: &'q Value,
) -> sqlx::query::Query<'q, Sqlite, SqliteArguments<'q>> {
    match value {
        Value::Null => query.bind(None::<String>),
        Value::Bool(v) => query.bind(*v),
        Value::Int(v) => query.bind(*v),
        Value::Float(v) => query.bind(*v),
        Value::Decimal(v) | Value::String(v) => query.bind(v.as_str()),
        Value::DateTime(v) => query.bind(*v),
        Value::Date(v) => query.bind(*v),
        Value::Time(v) => query.bind(*v),
        Value::Bytes(v) => query.bind(v.as_slice()),
    }
}

/// Bind a value to a SQL Server query.
pub(crate) fn bind_mssql_value<'a>(query: &mut tiberius::Query<'a>, value: &'a Value) {
    match value {
        Value::Null => query.bind(Option::<&str>::None),
        Value::Bool(v) => query.bind(*v),
        Value::Int(v) => query.bind(*v),
        Value::Float(v) => query.bind(*v),
        // SQL Server converts the text to the column's decimal type exactly
        Value::Decimal(v) | Value::String(v) => query.bind(v.as_str()),
        Value::DateTime(v) => query.bind(*v),
        Value::Date(v) => query.bind(*v),
        Value::Time(v) => query.bind(*v),
        Value::Bytes(v) => query.bind(v.as_slice()),
    }
}
