//! Plain SQL migration files
//!
//! A file is split into an up and a down section by whole-line comment
//! markers: `-- up` / `-- down` or `-- Up migration` / `-- Down migration`,
//! optionally followed by `:`. Text before the first marker belongs to the up
//! section, so a file without markers is entirely up. Statements are executed
//! exactly as written.

use async_trait::async_trait;
use sqlparser::dialect::PostgreSqlDialect;
use sqlparser::tokenizer::{Location, Token, Tokenizer};
use std::fs;
use std::path::Path;

use super::script::Migration;
use crate::error::{OrmError, OrmResult};
use crate::transaction::TransactionHandle;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Section {
    Up,
    Down,
}

/// A migration backed by a `.sql` file
#[derive(Debug, Clone)]
pub struct SqlFileMigration {
    name: String,
    up: Vec<String>,
    down: Vec<String>,
}

impl SqlFileMigration {
    /// Read and parse a migration file
    pub fn load(path: &Path) -> OrmResult<Self> {
        let content = fs::read_to_string(path).map_err(|e| OrmError::io(path, e))?;
        let name = path
            .file_name()
            .and_then(|n| n.to_str())
            .unwrap_or_default()
            .to_string();
        Self::parse(name, &content)
    }

    pub fn parse(name: impl Into<String>, content: &str) -> OrmResult<Self> {
        let name = name.into();
        let (up_sql, down_sql) = parse_sections(content);
        let split = |sql: &str| {
            split_sql_statements(sql).map_err(|e| {
                OrmError::Migration(format!("Failed to parse migration {}: {}", name, e))
            })
        };
        let up = split(&up_sql)?;
        let down = split(&down_sql)?;
        Ok(Self { name, up, down })
    }

    pub fn up_statements(&self) -> &[String] {
        &self.up
    }

    pub fn down_statements(&self) -> &[String] {
        &self.down
    }

    async fn run(&self, handle: &mut TransactionHandle, statements: &[String]) -> OrmResult<()> {
        for statement in statements {
            handle
                .execute_update(statement, &[], None)
                .await
                .map_err(|e| {
                    OrmError::Migration(format!("Failed to execute migration {}: {}", self.name, e))
                })?;
        }
        Ok(())
    }
}

#[async_trait]
impl Migration for SqlFileMigration {
    async fn up(&self, handle: &mut TransactionHandle) -> OrmResult<()> {
        self.run(handle, &self.up).await
    }

    async fn down(&self, handle: &mut TransactionHandle) -> OrmResult<()> {
        self.run(handle, &self.down).await
    }
}

fn marker(line: &str) -> Option<Section> {
    let body = line.trim().strip_prefix("--")?.trim().to_lowercase();
    let label = body.strip_suffix(':').unwrap_or(&body).trim_end();

    match label {
        "up" | "up migration" => Some(Section::Up),
        "down" | "down migration" => Some(Section::Down),
        _ => None,
    }
}

/// Split file content into up and down SQL. Every line that is not a
/// marker is kept verbatim, line endings included.
fn parse_sections(content: &str) -> (String, String) {
    let mut up_sql = String::new();
    let mut down_sql = String::new();
    let mut current = Section::Up;

    for line in content.split_inclusive('\n') {
        if let Some(section) = marker(line) {
            current = section;
            continue;
        }

        match current {
            Section::Up => up_sql.push_str(line),
            Section::Down => down_sql.push_str(line),
        }
    }

    (up_sql, down_sql)
}

/// Split SQL into statements at top-level semicolons.
///
/// The PostgreSQL tokenizer decides what is top level, so semicolons inside
/// string literals, quoted identifiers, comments and dollar-quoted bodies do
/// not split. Each statement is a slice of the input; leading comments are
/// dropped and chunks holding only comments are skipped.
pub fn split_sql_statements(sql: &str) -> OrmResult<Vec<String>> {
    let dialect = PostgreSqlDialect {};
    let tokens = Tokenizer::new(&dialect, sql)
        .tokenize_with_location()
        .map_err(|e| OrmError::Migration(format!("Invalid SQL: {}", e)))?;

    let line_starts = line_starts(sql);
    let mut statements = Vec::new();
    let mut start: Option<usize> = None;

    for token in &tokens {
        match token.token {
            Token::SemiColon => {
                if let Some(begin) = start.take() {
                    let end = byte_offset(sql, &line_starts, &token.location);
                    push_statement(&mut statements, &sql[begin..end]);
                }
            }
            Token::Whitespace(_) | Token::EOF => {}
            _ => {
                if start.is_none() {
                    start = Some(byte_offset(sql, &line_starts, &token.location));
                }
            }
        }
    }

    if let Some(begin) = start {
        push_statement(&mut statements, &sql[begin..]);
    }

    Ok(statements)
}

fn push_statement(statements: &mut Vec<String>, text: &str) {
    let text = text.trim_end();
    if !text.is_empty() {
        statements.push(text.to_string());
    }
}

/// Byte offset of the first character of every line
fn line_starts(sql: &str) -> Vec<usize> {
    std::iter::once(0)
        .chain(sql.match_indices('\n').map(|(i, _)| i + 1))
        .collect()
}

/// Tokenizer locations are 1-based lines and character columns
fn byte_offset(sql: &str, line_starts: &[usize], location: &Location) -> usize {
    let line = (location.line as usize).saturating_sub(1);
    let column = (location.column as usize).saturating_sub(1);
    let Some(&start) = line_starts.get(line) else {
        return sql.len();
    };
    sql[start..]
        .char_indices()
        .nth(column)
        .map(|(i, _)| start + i)
        .unwrap_or(sql.len())
}
