//! Comment- and quote-aware statement splitting.
//!
//! [`split_statements`] cuts a script into individual statements at top-level
//! semicolons. Semicolons inside string literals, quoted identifiers,
//! dollar-quoted bodies (`$$ ... $$`, `$fn$ ... $fn$`), line comments and
//! (nested) block comments are ignored. Each statement keeps its terminating
//! semicolon and any comments that precede it; chunks made only of comments
//! and whitespace are dropped.
//!
//! ```
//! use dbpm_core::{StatementKind, leading_keyword, split_statements};
//!
//! let script = "CREATE TYPE a AS (x int); -- trailing\n\
//!               CREATE FUNCTION f() RETURNS int AS $$ SELECT 1; $$ LANGUAGE sql;";
//! let statements = split_statements(script);
//! assert_eq!(statements.len(), 2);
//! assert_eq!(leading_keyword(&statements[1]), StatementKind::Create);
//! ```

/// Coarse classification of a statement by its first keyword.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StatementKind {
    Create,
    Drop,
    Other,
}

/// Splits `source` into statements. See the module docs for the rules.
pub fn split_statements(source: &str) -> Vec<String> {
    let bytes = source.as_bytes();
    let mut statements = Vec::new();
    let mut start = 0;
    let mut has_code = false;
    let mut i = 0;

    while i < bytes.len() {
        match bytes[i] {
            b'-' if bytes.get(i + 1) == Some(&b'-') => {
                i = skip_line_comment(bytes, i);
                continue;
            }
            b'/' if bytes.get(i + 1) == Some(&b'*') => {
                i = skip_block_comment(bytes, i);
                continue;
            }
            quote @ (b'\'' | b'"') => {
                has_code = true;
                i = skip_quoted(bytes, i, quote);
                continue;
            }
            b'$' => {
                has_code = true;
                if let Some(end) = skip_dollar_quoted(source, i) {
                    i = end;
                    continue;
                }
            }
            b';' => {
                if has_code {
                    statements.push(source[start..=i].trim().to_string());
                }
                start = i + 1;
                has_code = false;
            }
            c if !c.is_ascii_whitespace() => has_code = true,
            _ => {}
        }
        i += 1;
    }

    if has_code {
        statements.push(source[start..].trim().to_string());
    }
    statements
}

/// Classifies a statement by its first keyword, skipping leading whitespace
/// and comments.
pub fn leading_keyword(statement: &str) -> StatementKind {
    let bytes = statement.as_bytes();
    let mut i = 0;
    while i < bytes.len() {
        if bytes[i].is_ascii_whitespace() {
            i += 1;
        } else if bytes[i] == b'-' && bytes.get(i + 1) == Some(&b'-') {
            i = skip_line_comment(bytes, i);
        } else if bytes[i] == b'/' && bytes.get(i + 1) == Some(&b'*') {
            i = skip_block_comment(bytes, i);
        } else {
            break;
        }
    }

    let word_end = bytes[i..]
        .iter()
        .position(|b| !b.is_ascii_alphabetic())
        .map_or(bytes.len(), |p| i + p);
    let word = &statement[i..word_end];
    if word.eq_ignore_ascii_case("create") {
        StatementKind::Create
    } else if word.eq_ignore_ascii_case("drop") {
        StatementKind::Drop
    } else {
        StatementKind::Other
    }
}

fn skip_line_comment(bytes: &[u8], start: usize) -> usize {
    bytes[start..]
        .iter()
        .position(|&b| b == b'\n')
        .map_or(bytes.len(), |p| start + p + 1)
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

/// Skips a `'...'` or `"..."` run; a doubled quote is an escaped quote.
fn skip_quoted(bytes: &[u8], start: usize, quote: u8) -> usize {
    let mut i = start + 1;
    while i < bytes.len() {
        if bytes[i] == quote {
            if bytes.get(i + 1) == Some(&quote) {
                i += 2;
                continue;
            }
            return i + 1;
        }
        i += 1;
    }
    bytes.len()
}

/// If a dollar-quote opening tag starts at `start`, returns the index just
/// past the matching closing tag (or the end of input when unterminated).
fn skip_dollar_quoted(source: &str, start: usize) -> Option<usize> {
    let bytes = source.as_bytes();
    if start > 0 && is_ident_byte(bytes[start - 1]) {
        return None;
    }
    let mut j = start + 1;
    while j < bytes.len() && is_ident_byte(bytes[j]) {
        j += 1;
    }
    if j >= bytes.len() || bytes[j] != b'$' {
        return None;
    }
    if j > start + 1 && bytes[start + 1].is_ascii_digit() {
        return None;
    }

    let tag = &source[start..=j];
    let body_start = j + 1;
    Some(
        source[body_start..]
            .find(tag)
            .map_or(bytes.len(), |p| body_start + p + tag.len()),
    )
}

fn is_ident_byte(b: u8) -> bool {
    b.is_ascii_alphanumeric() || b == b'_'
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_splits_on_top_level_semicolons() {
        let statements = split_statements("CREATE TYPE a AS (x int);\nDROP TYPE b;\n  SELECT 1");
        assert_eq!(
            statements,
            vec!["CREATE TYPE a AS (x int);", "DROP TYPE b;", "SELECT 1"]
        );
    }

    #[test]
    fn test_ignores_semicolons_in_literals_and_comments() {
        let script = r#"
            -- leading; comment
            INSERT INTO t VALUES ('a;b', 'it''s;'); /* block; /* nested; */ still; */
            CREATE TABLE "odd;name" (x int);
        "#;
        let statements = split_statements(script);
        assert_eq!(statements.len(), 2);
        assert!(statements[0].starts_with("-- leading; comment"));
        assert!(statements[0].ends_with("('a;b', 'it''s;');"));
        assert!(statements[1].contains("\"odd;name\""));
    }

    #[test]
    fn test_dollar_quoted_bodies_stay_whole() {
        let script = "CREATE FUNCTION f() RETURNS void AS $body$ BEGIN PERFORM 1; END; $body$ LANGUAGE plpgsql;\n\
                      CREATE FUNCTION g() RETURNS int AS $$ SELECT $1; $$ LANGUAGE sql;";
        let statements = split_statements(script);
        assert_eq!(statements.len(), 2);
        assert!(statements[0].ends_with("LANGUAGE plpgsql;"));
        assert!(statements[1].contains("SELECT $1;"));
    }

    #[test]
    fn test_comment_only_chunks_are_dropped() {
        assert!(split_statements("-- nothing here\n/* or here */ ;;  ").is_empty());
        assert!(split_statements("").is_empty());
    }

    #[test]
    fn test_leading_keyword_skips_comments() {
        assert_eq!(leading_keyword("  -- c\n/* d */ create type x;"), StatementKind::Create);
        assert_eq!(leading_keyword("DROP DOMAIN y;"), StatementKind::Drop);
        assert_eq!(leading_keyword("ALTER TYPE z ADD VALUE 'q';"), StatementKind::Other);
        assert_eq!(leading_keyword("createx"), StatementKind::Other);
        assert_eq!(leading_keyword(""), StatementKind::Other);
    }
}
