//! Heuristic table-name extraction.
//!
//! A keyword scan, not a SQL parser. Subqueries, CTEs and multi-table joins
//! register every table mentioned after `FROM`/`JOIN`, which makes table
//! invalidation possibly over-broad but never under-broad for plain
//! statements. This approximation is deliberate; do not tighten it into
//! parser-grade semantics.

/// Tables a `SELECT` reads, in order of first mention, deduplicated.
#[must_use]
pub fn tables_read(sql: &str) -> Vec<String> {
    let mut tables = Vec::new();
    let mut tokens = sql.split_whitespace().peekable();

    while let Some(token) = tokens.next() {
        let keyword = token.to_ascii_uppercase();
        if (keyword == "FROM" || keyword == "JOIN")
            && let Some(&next) = tokens.peek()
            && let Some(table) = normalize_name(next)
            && !tables.contains(&table)
        {
            tables.push(table);
        }
    }

    tables
}

/// Target table of an `INSERT`/`UPDATE`/`DELETE`, if the statement is one.
#[must_use]
pub fn table_written(sql: &str) -> Option<String> {
    let mut tokens = sql.split_whitespace();
    let first = tokens.next()?.to_ascii_uppercase();

    let name = match first.as_str() {
        "INSERT" => {
            let into = tokens.next()?;
            if !into.eq_ignore_ascii_case("INTO") {
                return None;
            }
            tokens.next()?
        }
        "UPDATE" => tokens.next()?,
        "DELETE" => {
            let from = tokens.next()?;
            if !from.eq_ignore_ascii_case("FROM") {
                return None;
            }
            tokens.next()?
        }
        _ => return None,
    };

    normalize_name(name)
}

/// Strip quoting and trailing punctuation, lowercase the identifier.
/// Tokens opening a subquery produce no name.
fn normalize_name(token: &str) -> Option<String> {
    if token.starts_with('(') {
        return None;
    }
    let base = token.split('(').next().unwrap_or(token);
    let name = base
        .trim_end_matches([',', ';', ')'])
        .trim_matches(|c: char| c == '"' || c == '\'' || c == '`');
    if name.is_empty() {
        return None;
    }
    Some(name.to_ascii_lowercase())
}
