//! Read-only guard for generated SQL.
//!
//! Parses statements with sqlparser's PostgreSQL dialect and accepts only
//! plain queries. Anything that can write (DML, DDL, data-modifying CTEs,
//! `SELECT ... INTO`, row locks) or that fails to parse is refused.

use sqlparser::ast::{Query, Select, SetExpr, Statement, TableFactor, TableWithJoins};
use sqlparser::dialect::PostgreSqlDialect;
use sqlparser::parser::Parser;

use crate::error::{QueryTalkError, Result};

/// Fails with `UnsafeQuery` unless every statement in `sql` is a pure query.
pub fn ensure_read_only(sql: &str) -> Result<()> {
    let statements = Parser::parse_sql(&PostgreSqlDialect {}, sql)
        .map_err(|e| QueryTalkError::UnsafeQuery(format!("SQL parse error: {}", e)))?;

    if statements.is_empty() {
        return Err(QueryTalkError::UnsafeQuery("Empty SQL statement".to_string()));
    }

    for statement in &statements {
        let read_only = match statement {
            Statement::Query(query) => query_is_read_only(query),
            _ => false,
        };
        if !read_only {
            return Err(QueryTalkError::UnsafeQuery(format!(
                "Only SELECT queries may run: {}",
                first_keyword(&statement.to_string())
            )));
        }
    }

    Ok(())
}

fn first_keyword(statement: &str) -> &str {
    statement.split_whitespace().next().unwrap_or("")
}

fn query_is_read_only(query: &Query) -> bool {
    if !query.locks.is_empty() {
        return false;
    }

    let ctes_ok = query
        .with
        .as_ref()
        .map_or(true, |with| with.cte_tables.iter().all(|cte| query_is_read_only(&cte.query)));

    ctes_ok && set_expr_is_read_only(&query.body)
}

fn set_expr_is_read_only(set_expr: &SetExpr) -> bool {
    match set_expr {
        SetExpr::Select(select) => select_is_read_only(select),
        SetExpr::Query(query) => query_is_read_only(query),
        SetExpr::SetOperation { left, right, .. } => {
            set_expr_is_read_only(left) && set_expr_is_read_only(right)
        }
        SetExpr::Values(_) | SetExpr::Table(_) => true,
        // Insert, Update and any data-modifying body
        _ => false,
    }
}

fn select_is_read_only(select: &Select) -> bool {
    select.into.is_none() && select.from.iter().all(table_with_joins_is_read_only)
}

fn table_with_joins_is_read_only(twj: &TableWithJoins) -> bool {
    table_factor_is_read_only(&twj.relation)
        && twj
            .joins
            .iter()
            .all(|join| table_factor_is_read_only(&join.relation))
}

fn table_factor_is_read_only(factor: &TableFactor) -> bool {
    match factor {
        TableFactor::Derived { subquery, .. } => query_is_read_only(subquery),
        TableFactor::NestedJoin {
            table_with_joins, ..
        } => table_with_joins_is_read_only(table_with_joins),
        _ => true,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn assert_allowed(sql: &str) {
        assert!(ensure_read_only(sql).is_ok(), "expected '{}' to be allowed", sql);
    }

    fn assert_refused(sql: &str) {
        assert!(
            matches!(ensure_read_only(sql), Err(QueryTalkError::UnsafeQuery(_))),
            "expected '{}' to be refused",
            sql
        );
    }

    #[test]
    fn test_plain_selects_are_allowed() {
        assert_allowed("SELECT 1;");
        assert_allowed("SELECT * FROM orders WHERE created_at >= '2024-04-01'");
        assert_allowed(
            "SELECT o.id, c.name FROM orders o JOIN customers c ON o.customer_id = c.id",
        );
        assert_allowed("SELECT * FROM (SELECT id FROM orders) AS sub");
        assert_allowed("SELECT id FROM a UNION SELECT id FROM b");
    }

    #[test]
    fn test_read_only_cte_is_allowed() {
        assert_allowed(
            "WITH monthly AS (SELECT date_trunc('month', created_at) m, sum(amount) s FROM sales GROUP BY 1) SELECT * FROM monthly",
        );
    }

    #[test]
    fn test_writes_are_refused() {
        assert_refused("INSERT INTO users (name) VALUES ('x')");
        assert_refused("UPDATE users SET name = 'x'");
        assert_refused("DELETE FROM users");
        assert_refused("DROP TABLE users");
        assert_refused("TRUNCATE users");
        assert_refused("CREATE TABLE t (id int)");
    }

    #[test]
    fn test_data_modifying_cte_is_refused() {
        assert_refused("WITH gone AS (DELETE FROM users RETURNING *) SELECT * FROM gone");
    }

    #[test]
    fn test_select_into_and_locks_are_refused() {
        assert_refused("SELECT * INTO backup FROM users");
        assert_refused("SELECT * FROM users FOR UPDATE");
    }

    #[test]
    fn test_multiple_statements_with_write_are_refused() {
        assert_refused("SELECT 1; DROP TABLE users;");
    }

    #[test]
    fn test_unparsable_and_empty_are_refused() {
        assert_refused("SELEC * FROM");
        assert_refused("");
    }
}
