//! Read-only SQL guard for the `retrieve` tool's SQL mode.
//!
//! Anything that is not a single `SELECT` statement is rejected before it
//! reaches the database.

use crate::types::error::StorageError;

const FORBIDDEN_KEYWORDS: &[&str] = &[
    "INSERT", "UPDATE", "DELETE", "DROP", "CREATE", "ALTER", "TRUNCATE", "REPLACE", "ATTACH",
    "DETACH", "PRAGMA", "VACUUM", "REINDEX",
];

/// Validate that `sql` is exactly one `SELECT` statement.
pub fn validate_read_only(sql: &str) -> Result<(), StorageError> {
    let trimmed = sql.trim();
    if trimmed.is_empty() {
        return Err(rejected("query is empty"));
    }

    validate_single_statement(trimmed)?;

    match first_keyword(trimmed) {
        Some(kw) if kw == "SELECT" => {}
        _ => return Err(rejected("query must be a single SELECT statement")),
    }

    for token in tokens_upper(trimmed) {
        if FORBIDDEN_KEYWORDS.contains(&token.as_str()) {
            return Err(rejected(format!("query contains forbidden keyword: {token}")));
        }
    }

    Ok(())
}

/// Wrap a validated query so it returns at most `limit` rows.
pub fn apply_row_limit(sql: &str, limit: usize) -> String {
    let stripped = strip_trailing_semicolon(sql);
    format!("SELECT * FROM ({}) AS _q LIMIT {}", stripped.trim(), limit)
}

fn rejected(reason: impl Into<String>) -> StorageError {
    StorageError::RejectedQuery {
        reason: reason.into(),
    }
}

fn strip_trailing_semicolon(sql: &str) -> &str {
    let trimmed = sql.trim();
    trimmed
        .strip_suffix(';')
        .map(str::trim_end)
        .unwrap_or(trimmed)
}

fn validate_single_statement(sql: &str) -> Result<(), StorageError> {
    let mut semicolons = sql.match_indices(';').map(|(idx, _)| idx);
    let first = semicolons.next();
    if semicolons.next().is_some() {
        return Err(rejected("multiple statements are not allowed"));
    }
    if let Some(idx) = first {
        if sql[idx + 1..].chars().any(|c| !c.is_whitespace()) {
            return Err(rejected("multiple statements are not allowed"));
        }
    }
    Ok(())
}

fn first_keyword(sql: &str) -> Option<String> {
    let mut current = String::new();
    for ch in sql.chars() {
        if ch.is_ascii_alphabetic() {
            current.push(ch);
        } else if !current.is_empty() {
            break;
        }
    }
    if current.is_empty() {
        None
    } else {
        Some(current.to_ascii_uppercase())
    }
}

fn tokens_upper(sql: &str) -> Vec<String> {
    let mut tokens = Vec::new();
    let mut current = String::new();
    for ch in sql.chars() {
        if ch.is_ascii_alphanumeric() || ch == '_' {
            current.push(ch);
        } else if !current.is_empty() {
            tokens.push(std::mem::take(&mut current).to_ascii_uppercase());
        }
    }
    if !current.is_empty() {
        tokens.push(current.to_ascii_uppercase());
    }
    tokens
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn accepts_plain_select() {
        validate_read_only("SELECT id, query FROM reports ORDER BY id DESC").unwrap();
        validate_read_only("  select * from jobs;  ").unwrap();
    }

    #[test]
    fn rejects_writes() {
        assert!(validate_read_only("DELETE FROM reports").is_err());
        assert!(validate_read_only("INSERT INTO reports VALUES (1)").is_err());
        assert!(validate_read_only("UPDATE jobs SET status = 'queued'").is_err());
        assert!(validate_read_only("DROP TABLE reports").is_err());
    }

    #[test]
    fn rejects_multiple_statements() {
        assert!(validate_read_only("SELECT 1; SELECT 2").is_err());
        assert!(validate_read_only("SELECT 1; DROP TABLE reports").is_err());
    }

    #[test]
    fn rejects_non_select_prefixes() {
        // WITH and EXPLAIN are also rejected: the contract is a single SELECT.
        assert!(validate_read_only("WITH q AS (SELECT 1) SELECT * FROM q").is_err());
        assert!(validate_read_only("EXPLAIN SELECT 1").is_err());
        assert!(validate_read_only("").is_err());
    }

    #[test]
    fn rejects_embedded_keywords() {
        assert!(validate_read_only("SELECT * FROM reports WHERE id IN (DELETE FROM x)").is_err());
    }

    #[test]
    fn row_limit_wraps_query() {
        let wrapped = apply_row_limit("SELECT id FROM reports;", 50);
        assert_eq!(wrapped, "SELECT * FROM (SELECT id FROM reports) AS _q LIMIT 50");
    }
}
