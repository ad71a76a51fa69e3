//! Response parsing for LLM outputs.
//!
//! Extracts SQL from completions that may wrap it in markdown code blocks.

use regex::Regex;
use std::sync::OnceLock;

use crate::error::{QueryTalkError, Result};

fn fenced_sql() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"(?s)```(?i:sql)\s*(.*?)\s*```").expect("valid regex"))
}

fn bare_select() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"(?s)SELECT.*?;").expect("valid regex"))
}

/// Extracts the SQL statement from a completion.
///
/// Looks for, in order:
/// - the body of the first ```` ```sql ```` fenced block
/// - the first `SELECT` up to and including the next `;`
///
/// The result is trimmed. Anything else is `NoQueryFound` carrying the raw
/// completion.
pub fn extract_sql(completion: &str) -> Result<String> {
    if let Some(body) = fenced_sql()
        .captures(completion)
        .and_then(|caps| caps.get(1))
    {
        let sql = body.as_str().trim();
        if !sql.is_empty() {
            return Ok(sql.to_string());
        }
    }

    if let Some(found) = bare_select().find(completion) {
        return Ok(found.as_str().trim().to_string());
    }

    Err(QueryTalkError::NoQueryFound {
        raw: completion.to_string(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_extract_fenced_block() {
        let completion = "```sql SELECT 1; ```";
        assert_eq!(extract_sql(completion).unwrap(), "SELECT 1;");
    }

    #[test]
    fn test_extract_fenced_block_with_surrounding_text() {
        let completion = "Here you go:\n\n```sql\nSELECT name\nFROM users\nWHERE active;\n```\n\nThis lists active users.";
        assert_eq!(
            extract_sql(completion).unwrap(),
            "SELECT name\nFROM users\nWHERE active;"
        );
    }

    #[test]
    fn test_extract_uppercase_fence_tag() {
        let completion = "```SQL\nSELECT 2;\n```";
        assert_eq!(extract_sql(completion).unwrap(), "SELECT 2;");
    }

    #[test]
    fn test_first_fenced_block_wins() {
        let completion = "```sql\nSELECT 1;\n```\nor\n```sql\nSELECT 2;\n```";
        assert_eq!(extract_sql(completion).unwrap(), "SELECT 1;");
    }

    #[test]
    fn test_extract_bare_select() {
        let completion = "The query is SELECT * FROM t; and it returns everything.";
        assert_eq!(extract_sql(completion).unwrap(), "SELECT * FROM t;");
    }

    #[test]
    fn test_bare_select_spans_lines() {
        let completion = "SELECT id,\n  total\nFROM orders;\nDone.";
        assert_eq!(
            extract_sql(completion).unwrap(),
            "SELECT id,\n  total\nFROM orders;"
        );
    }

    #[test]
    fn test_lowercase_select_without_fence_is_not_found() {
        let result = extract_sql("select * from t;");
        assert!(matches!(result, Err(QueryTalkError::NoQueryFound { .. })));
    }

    #[test]
    fn test_no_query_keeps_raw_completion() {
        let completion = "I need more information about the sales table.";
        match extract_sql(completion) {
            Err(QueryTalkError::NoQueryFound { raw }) => assert_eq!(raw, completion),
            other => panic!("expected NoQueryFound, got {:?}", other),
        }
    }

    #[test]
    fn test_generic_fence_falls_back_to_select() {
        let completion = "```\nSELECT count(*) FROM orders;\n```";
        assert_eq!(
            extract_sql(completion).unwrap(),
            "SELECT count(*) FROM orders;"
        );
    }
}
