//! Cache key: normalized (query text, argument list) pair.

use std::fmt;
use std::sync::Arc;

use crate::driver::SqlParam;

/// Immutable key identifying one cached read.
///
/// The SQL text is shared via `Arc` so the invalidation index can reference
/// it without copying. Arguments are already normalized into [`SqlParam`]
/// at the API boundary, so equal argument lists always hash identically.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CacheKey {
    sql: Arc<str>,
    params: Arc<[SqlParam]>,
}

impl CacheKey {
    #[must_use]
    pub fn new(sql: &str, params: &[SqlParam]) -> Self {
        Self {
            sql: Arc::from(sql),
            params: Arc::from(params),
        }
    }

    #[must_use]
    pub fn sql(&self) -> &str {
        &self.sql
    }

    #[must_use]
    pub(crate) fn sql_arc(&self) -> Arc<str> {
        Arc::clone(&self.sql)
    }
}

impl fmt::Display for CacheKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} [{} arg(s)]", self.sql, self.params.len())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::params;

    #[test]
    fn test_equal_inputs_equal_keys() {
        let a = CacheKey::new("SELECT * FROM users WHERE id = $1", &params![1_i64]);
        let b = CacheKey::new("SELECT * FROM users WHERE id = $1", &params![1_i64]);
        assert_eq!(a, b);
    }

    #[test]
    fn test_different_args_different_keys() {
        let a = CacheKey::new("SELECT * FROM users WHERE id = $1", &params![1_i64]);
        let b = CacheKey::new("SELECT * FROM users WHERE id = $1", &params![2_i64]);
        assert_ne!(a, b);
    }

    #[test]
    fn test_different_sql_different_keys() {
        let a = CacheKey::new("SELECT * FROM users", &params![]);
        let b = CacheKey::new("SELECT * FROM orders", &params![]);
        assert_ne!(a, b);
    }

    #[test]
    fn test_nested_args_normalize() {
        let a = CacheKey::new("SELECT 1", &params![vec![1_i32, 2], "x"]);
        let b = CacheKey::new("SELECT 1", &params![vec![1_i32, 2], "x"]);
        assert_eq!(a, b);
    }

    #[test]
    fn test_display_hides_arg_values() {
        let key = CacheKey::new("SELECT 1", &params!["secret"]);
        let shown = key.to_string();
        assert!(shown.contains("SELECT 1"));
        assert!(!shown.contains("secret"));
    }
}
