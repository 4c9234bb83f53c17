//! Read-only gate for freeform SQL.
//!
//! Checks run on a masked copy of the statement where comments, string literals and quoted
//! identifiers are blanked out, so keywords hidden in them neither trigger nor evade the deny-list. The deny-list is
//! a fast path; the statement must then parse as exactly one PostgreSQL query. Every failure is
//! terminal. The only rewrite is the row cap on the top-level `LIMIT`.

use once_cell::sync::Lazy;
use regex::Regex;
use serde::Serialize;
use sqlparser::{ast::Statement, dialect::PostgreSqlDialect, parser::Parser};
use std::fmt;
use tracing::warn;

static ROW_LOCKING: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?i)\bFOR\s+(NO\s+KEY\s+UPDATE|KEY\s+SHARE|UPDATE|SHARE)\b")
        .expect("row locking pattern is valid")
});

static WRITE_KEYWORDS: Lazy<Regex> = Lazy::new(|| {
    Regex::new(
        r"(?i)\b(INSERT|UPDATE|DELETE|DROP|ALTER|TRUNCATE|GRANT|REVOKE|CREATE|MERGE|UPSERT|REPLACE\s+INTO|COPY|CALL|DO|EXEC|EXECUTE|PREPARE|DEALLOCATE|VACUUM|ANALYZE|REINDEX|CLUSTER|REFRESH|COMMENT|LOCK|LISTEN|NOTIFY|UNLISTEN|LOAD|IMPORT|SET|RESET|DISCARD|BEGIN|COMMIT|ROLLBACK|SAVEPOINT)\b",
    )
    .expect("write keyword pattern is valid")
});

static DENYLISTED_FUNCTIONS: Lazy<Regex> = Lazy::new(|| {
    Regex::new(
        r#"(?i)\b(pg_read_file|pg_read_binary_file|pg_ls_dir|pg_ls_\w+|pg_stat_file|pg_file_write|lo_import|lo_export|lo_get|lo_put|lo_from_bytea|dblink\w*|pg_sleep\w*|pg_terminate_backend|pg_cancel_backend|pg_reload_conf|pg_rotate_logfile|pg_promote|pg_advisory_\w+|set_config|query_to_xml\w*|table_to_xml\w*|inet_server_addr|inet_client_addr|pg_execute_server_program)"?\s*\("#,
    )
    .expect("denylisted function pattern is valid")
});

static SELECT_INTO: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?i)\bINTO\b").expect("into pattern is valid"));

static WORD: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"[A-Za-z_][A-Za-z0-9_$]*").expect("word pattern is valid"));

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SafetyCode {
    EmptyStatement,
    MultipleStatements,
    WriteOperation,
    DenylistedFunction,
    SelectInto,
    RowLocking,
    NotAQuery,
    UnparseableSql,
    NonLiteralLimit,
}

impl SafetyCode {
    pub fn as_str(self) -> &'static str {
        match self {
            SafetyCode::EmptyStatement => "EMPTY_STATEMENT",
            SafetyCode::MultipleStatements => "MULTIPLE_STATEMENTS",
            SafetyCode::WriteOperation => "WRITE_OPERATION",
            SafetyCode::DenylistedFunction => "DENYLISTED_FUNCTION",
            SafetyCode::SelectInto => "SELECT_INTO",
            SafetyCode::RowLocking => "ROW_LOCKING",
            SafetyCode::NotAQuery => "NOT_A_QUERY",
            SafetyCode::UnparseableSql => "UNPARSEABLE_SQL",
            SafetyCode::NonLiteralLimit => "NON_LITERAL_LIMIT",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SafetyRejection {
    pub code: SafetyCode,
    pub reason: String,
}

impl SafetyRejection {
    fn new(code: SafetyCode, reason: impl Into<String>) -> Self {
        Self {
            code,
            reason: reason.into(),
        }
    }
}

impl fmt::Display for SafetyRejection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.reason)
    }
}

impl std::error::Error for SafetyRejection {}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum LimitAction {
    Kept,
    Injected,
    Clamped,
}

/// A statement the gate accepted, with its effective row cap applied.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SafeSql {
    pub sql: String,
    pub limit: i64,
    pub limit_action: LimitAction,
}

#[derive(Debug, Clone, Copy)]
pub struct SqlSafetyGate {
    max_limit: i64,
}

impl SqlSafetyGate {
    pub fn new(max_limit: i64) -> Self {
        Self {
            max_limit: max_limit.max(1),
        }
    }

    pub fn check(&self, sql: &str) -> Result<SafeSql, SafetyRejection> {
        let result = self.inspect(sql);
        if let Err(rejection) = &result {
            warn!(code = rejection.code.as_str(), reason = %rejection.reason, "freeform sql rejected");
        }
        result
    }

    fn inspect(&self, sql: &str) -> Result<SafeSql, SafetyRejection> {
        let statement = single_statement(sql)?;
        let masked = mask_literals(&statement);

        if let Some(found) = ROW_LOCKING.find(&masked) {
            return Err(SafetyRejection::new(
                SafetyCode::RowLocking,
                format!("row locking clause '{}' is not allowed", found.as_str()),
            ));
        }
        if let Some(found) = WRITE_KEYWORDS.find(&masked) {
            return Err(SafetyRejection::new(
                SafetyCode::WriteOperation,
                format!(
                    "statement contains write or session keyword '{}'",
                    found.as_str().to_uppercase()
                ),
            ));
        }
        if let Some(found) = DENYLISTED_FUNCTIONS.captures(&masked).and_then(|caps| caps.get(1)) {
            return Err(SafetyRejection::new(
                SafetyCode::DenylistedFunction,
                format!("function '{}' is not allowed", found.as_str().to_lowercase()),
            ));
        }
        if SELECT_INTO.is_match(&masked) {
            return Err(SafetyRejection::new(
                SafetyCode::SelectInto,
                "SELECT ... INTO creates tables and is not allowed",
            ));
        }

        let leading = WORD
            .find(&masked)
            .map(|word| word.as_str().to_uppercase())
            .unwrap_or_default();
        if leading != "SELECT" && leading != "WITH" {
            return Err(SafetyRejection::new(
                SafetyCode::NotAQuery,
                "only SELECT or WITH queries are accepted",
            ));
        }

        let parsed = Parser::parse_sql(&PostgreSqlDialect {}, &statement).map_err(|err| {
            SafetyRejection::new(SafetyCode::UnparseableSql, format!("could not parse sql: {err}"))
        })?;
        match parsed.as_slice() {
            [Statement::Query(_)] => {}
            [_] => {
                return Err(SafetyRejection::new(
                    SafetyCode::NotAQuery,
                    "statement is not a read-only query",
                ))
            }
            _ => {
                return Err(SafetyRejection::new(
                    SafetyCode::MultipleStatements,
                    "exactly one statement is allowed",
                ))
            }
        }

        self.apply_row_cap(statement, &masked)
    }

    fn apply_row_cap(&self, statement: String, masked: &str) -> Result<SafeSql, SafetyRejection> {
        let top_level = top_level_words(masked);

        if top_level.iter().any(|(_, word)| word.eq_ignore_ascii_case("FETCH")) {
            return Err(SafetyRejection::new(
                SafetyCode::NonLiteralLimit,
                "use LIMIT instead of FETCH FIRST",
            ));
        }

        let Some(&(start, word)) = top_level
            .iter()
            .rev()
            .find(|(_, word)| word.eq_ignore_ascii_case("LIMIT"))
        else {
            return Ok(SafeSql {
                sql: format!("{statement}\nLIMIT {}", self.max_limit),
                limit: self.max_limit,
                limit_action: LimitAction::Injected,
            });
        };

        let after = start + word.len();
        let rest = &masked[after..];
        let value_start = after + (rest.len() - rest.trim_start().len());
        let value: String = masked[value_start..]
            .chars()
            .take_while(|ch| ch.is_ascii_alphanumeric())
            .collect();
        let value_end = value_start + value.len();

        let trailing = masked[value_end..].trim_start();
        let tail_ok = trailing.is_empty()
            || trailing
                .get(..6)
                .is_some_and(|head| head.eq_ignore_ascii_case("OFFSET"));

        if !tail_ok {
            return Err(SafetyRejection::new(
                SafetyCode::NonLiteralLimit,
                "LIMIT must be an integer literal",
            ));
        }
        let requested = if value.eq_ignore_ascii_case("ALL") {
            None
        } else if !value.is_empty() && value.chars().all(|ch| ch.is_ascii_digit()) {
            Some(value.parse::<i64>().unwrap_or(i64::MAX))
        } else {
            return Err(SafetyRejection::new(
                SafetyCode::NonLiteralLimit,
                "LIMIT must be an integer literal",
            ));
        };

        match requested {
            Some(limit) if limit <= self.max_limit => Ok(SafeSql {
                sql: statement,
                limit,
                limit_action: LimitAction::Kept,
            }),
            _ => {
                let mut sql = String::with_capacity(statement.len());
                sql.push_str(&statement[..value_start]);
                sql.push_str(&self.max_limit.to_string());
                sql.push_str(&statement[value_end..]);
                Ok(SafeSql {
                    sql,
                    limit: self.max_limit,
                    limit_action: LimitAction::Clamped,
                })
            }
        }
    }
}

/// Trims the statement and strips trailing terminators, rejecting anything stacked after a `;`.
fn single_statement(sql: &str) -> Result<String, SafetyRejection> {
    let trimmed = sql.trim();
    let masked = mask_literals(trimmed);
    if masked.trim().is_empty() {
        return Err(SafetyRejection::new(
            SafetyCode::EmptyStatement,
            "sql statement is empty",
        ));
    }

    let statement = match masked.find(';') {
        None => trimmed,
        Some(idx) => {
            let tail = &masked[idx..];
            if tail.chars().any(|ch| ch != ';' && !ch.is_whitespace()) {
                return Err(SafetyRejection::new(
                    SafetyCode::MultipleStatements,
                    "stacked statements are not allowed",
                ));
            }
            trimmed[..idx].trim_end()
        }
    };

    if statement.is_empty() {
        return Err(SafetyRejection::new(
            SafetyCode::EmptyStatement,
            "sql statement is empty",
        ));
    }
    Ok(statement.to_string())
}

/// Blanks comments, string literal bodies and double-quoted identifier bodies with spaces,
/// preserving byte offsets. A quoted name followed by `(` is a function call and stays visible
/// to the function deny-list.
fn mask_literals(sql: &str) -> String {
    let bytes = sql.as_bytes();
    let mut out = bytes.to_vec();
    let mut i = 0;

    let blank = |out: &mut Vec<u8>, from: usize, to: usize| {
        for byte in &mut out[from..to] {
            *byte = b' ';
        }
    };

    while i < bytes.len() {
        match bytes[i] {
            b'-' if bytes.get(i + 1) == Some(&b'-') => {
                let end = bytes[i..]
                    .iter()
                    .position(|b| *b == b'\n')
                    .map_or(bytes.len(), |pos| i + pos);
                blank(&mut out, i, end);
                i = end;
            }
            b'/' if bytes.get(i + 1) == Some(&b'*') => {
                let mut depth = 0usize;
                let mut j = i;
                while j < bytes.len() {
                    if bytes[j] == b'/' && bytes.get(j + 1) == Some(&b'*') {
                        depth += 1;
                        j += 2;
                    } else if bytes[j] == b'*' && bytes.get(j + 1) == Some(&b'/') {
                        depth -= 1;
                        j += 2;
                        if depth == 0 {
                            break;
                        }
                    } else {
                        j += 1;
                    }
                }
                let end = j.min(bytes.len());
                blank(&mut out, i, end);
                i = end;
            }
            b'\'' => {
                let backslash_escapes = i > 0 && matches!(bytes[i - 1], b'E' | b'e');
                let mut j = i + 1;
                while j < bytes.len() {
                    match bytes[j] {
                        b'\\' if backslash_escapes => j += 2,
                        b'\'' if bytes.get(j + 1) == Some(&b'\'') => j += 2,
                        b'\'' => break,
                        _ => j += 1,
                    }
                }
                let end = j.min(bytes.len());
                blank(&mut out, i + 1, end);
                i = end + 1;
            }
            b'"' => {
                let mut j = i + 1;
                while j < bytes.len() {
                    match bytes[j] {
                        b'"' if bytes.get(j + 1) == Some(&b'"') => j += 2,
                        b'"' => break,
                        _ => j += 1,
                    }
                }
                let end = j.min(bytes.len());
                if !quoted_call(bytes.get(end + 1..).unwrap_or_default()) {
                    blank(&mut out, i + 1, end);
                }
                i = end + 1;
            }
            b'$' => match dollar_tag(&bytes[i..]) {
                Some(tag_len) => {
                    let tag = &bytes[i..i + tag_len];
                    let body = i + tag_len;
                    let close = bytes[body..]
                        .windows(tag_len)
                        .position(|window| window == tag)
                        .map_or(bytes.len(), |pos| body + pos);
                    blank(&mut out, body, close);
                    i = (close + tag_len).min(bytes.len());
                }
                None => i += 1,
            },
            _ => i += 1,
        }
    }

    String::from_utf8(out).unwrap_or_else(|err| String::from_utf8_lossy(err.as_bytes()).into_owned())
}

/// Length of a `$tag$` opener at the start of `bytes`, if any.
fn dollar_tag(bytes: &[u8]) -> Option<usize> {
    let close = bytes[1..].iter().position(|b| *b == b'$')? + 1;
    let tag = &bytes[1..close];
    let valid = tag
        .iter()
        .enumerate()
        .all(|(idx, b)| b.is_ascii_alphabetic() || *b == b'_' || (idx > 0 && b.is_ascii_digit()));
    valid.then_some(close + 1)
}

/// Words outside any parentheses, with their byte offsets.
fn quoted_call(after: &[u8]) -> bool {
    after
        .iter()
        .find(|byte| !byte.is_ascii_whitespace())
        .is_some_and(|byte| *byte == b'(')
}

fn top_level_words(masked: &str) -> Vec<(usize, &str)> {
    let mut depth_at = Vec::with_capacity(masked.len() + 1);
    let mut depth = 0i32;
    for byte in masked.bytes() {
        depth_at.push(depth);
        match byte {
            b'(' => depth += 1,
            b')' => depth -= 1,
            _ => {}
        }
    }
    depth_at.push(depth);

    WORD.find_iter(masked)
        .filter(|word| depth_at[word.start()] == 0)
        .map(|word| (word.start(), word.as_str()))
        .collect()
}
