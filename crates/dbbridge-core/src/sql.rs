//! Helpers shared by the SQL connectors

const READ_KEYWORDS: &[&str] = &[
    "SELECT", "WITH", "SHOW", "DESCRIBE", "DESC", "EXPLAIN", "PRAGMA", "VALUES",
];

/// Whether the statement returns rows rather than an affected-row count
pub fn is_read_statement(sql: &str) -> bool {
    first_keyword(sql)
        .map(|kw| READ_KEYWORDS.iter().any(|read| kw.eq_ignore_ascii_case(read)))
        .unwrap_or(false)
}

/// First keyword, skipping whitespace, comments and opening parentheses
pub fn first_keyword(sql: &str) -> Option<&str> {
    let mut rest = sql;
    loop {
        rest = rest.trim_start_matches(|c: char| c.is_whitespace() || c == '(');
        if let Some(after) = rest.strip_prefix("--") {
            rest = after.split_once('\n').map(|(_, tail)| tail).unwrap_or("");
        } else if let Some(after) = rest.strip_prefix("/*") {
            rest = after.split_once("*/").map(|(_, tail)| tail).unwrap_or("");
        } else {
            break;
        }
    }

    let end = rest
        .find(|c: char| !(c.is_ascii_alphanumeric() || c == '_'))
        .unwrap_or(rest.len());
    (end > 0).then(|| &rest[..end])
}

/// Split a script into statements on top-level semicolons
///
/// Semicolons inside quotes, quoted identifiers and comments don't split.
/// Empty statements (and comment-only fragments) are dropped.
pub fn split_statements(sql: &str) -> Vec<String> {
    #[derive(Clone, Copy, PartialEq)]
    enum State {
        Normal,
        Quoted(char),
        LineComment,
        BlockComment,
    }

    let mut statements = Vec::new();
    let mut current = String::new();
    let mut state = State::Normal;
    let mut chars = sql.chars().peekable();

    while let Some(c) = chars.next() {
        match state {
            State::Normal => match c {
                '\'' | '"' | '`' => {
                    state = State::Quoted(c);
                    current.push(c);
                }
                '-' if chars.peek() == Some(&'-') => {
                    chars.next();
                    state = State::LineComment;
                    current.push_str("--");
                }
                '/' if chars.peek() == Some(&'*') => {
                    chars.next();
                    state = State::BlockComment;
                    current.push_str("/*");
                }
                ';' => {
                    push_statement(&mut statements, &current);
                    current.clear();
                }
                _ => current.push(c),
            },
            State::Quoted(quote) => {
                current.push(c);
                if c == quote {
                    // A doubled quote is an escaped quote
                    if chars.peek() == Some(&quote) {
                        if let Some(escaped) = chars.next() {
                            current.push(escaped);
                        }
                    } else {
                        state = State::Normal;
                    }
                }
            }
            State::LineComment => {
                current.push(c);
                if c == '\n' {
                    state = State::Normal;
                }
            }
            State::BlockComment => {
                current.push(c);
                if c == '*' && chars.peek() == Some(&'/') {
                    chars.next();
                    current.push('/');
                    state = State::Normal;
                }
            }
        }
    }
    push_statement(&mut statements, &current);
    statements
}

fn push_statement(statements: &mut Vec<String>, fragment: &str) {
    let trimmed = fragment.trim();
    if first_keyword(trimmed).is_some() {
        statements.push(trimmed.to_string());
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_read_detection() {
        assert!(is_read_statement("SELECT 1"));
        assert!(is_read_statement("  select * from t"));
        assert!(is_read_statement("-- header\nWITH x AS (SELECT 1) SELECT * FROM x"));
        assert!(is_read_statement("/* hint */ (SELECT 1) UNION (SELECT 2)"));
        assert!(is_read_statement("PRAGMA table_info(t)"));
        assert!(is_read_statement("explain select 1"));
        assert!(!is_read_statement("INSERT INTO t VALUES (1)"));
        assert!(!is_read_statement("update t set a = 1"));
        assert!(!is_read_statement(""));
        assert!(!is_read_statement("SELECTED_ROWS"));
    }

    #[test]
    fn test_split_statements() {
        assert_eq!(split_statements("SELECT 1"), vec!["SELECT 1"]);
        assert_eq!(
            split_statements("INSERT INTO t VALUES ('a;b'); SELECT 2;"),
            vec!["INSERT INTO t VALUES ('a;b')", "SELECT 2"]
        );
        assert_eq!(
            split_statements("SELECT 'it''s; fine' -- trailing; comment\n"),
            vec!["SELECT 'it''s; fine' -- trailing; comment"]
        );
        assert_eq!(split_statements("/* a; b */ SELECT 1; ;  "), vec!["/* a; b */ SELECT 1"]);
        assert_eq!(split_statements("SELECT 1; -- done"), vec!["SELECT 1"]);
        assert!(split_statements("  ;  ").is_empty());
    }
}
