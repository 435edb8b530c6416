//! Best-effort classification of raw SQL into structured operations.
//!
//! Used by `execute_sql` when the gateway has no native SQL endpoint (or it
//! failed). Coverage is deliberately small: one table, at most one equality in
//! WHERE, one row per INSERT. Anything else is reported as unparseable and
//! nothing is executed.

use std::sync::OnceLock;

use regex::Regex;
use serde_json::{Map, Number, Value};

use crate::registry::{DataOperation, EqFilter, SelectArgs, MAX_SELECT_LIMIT};

pub const DEFAULT_SQL_SELECT_LIMIT: usize = 100;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DdlKind {
    Create,
    Alter,
    Drop,
}

#[derive(Debug, Clone, PartialEq)]
pub enum ParsedStatement {
    Select(SelectArgs),
    Insert {
        table_name: String,
        data: Map<String, Value>,
    },
    Update {
        table_name: String,
        filter: EqFilter,
        data: Map<String, Value>,
    },
    Delete {
        table_name: String,
        filter: EqFilter,
    },
    /// Schema changes cannot be expressed as row operations.
    Ddl(DdlKind),
}

impl ParsedStatement {
    /// The equivalent row-level operation; `None` for DDL.
    pub fn into_operation(self) -> Option<DataOperation> {
        match self {
            ParsedStatement::Select(args) => Some(DataOperation::SelectData(args)),
            ParsedStatement::Insert { table_name, data } => {
                Some(DataOperation::InsertData { table_name, data })
            }
            ParsedStatement::Update {
                table_name,
                filter,
                data,
            } => Some(DataOperation::UpdateData {
                table_name,
                filter,
                data,
            }),
            ParsedStatement::Delete { table_name, filter } => {
                Some(DataOperation::DeleteData { table_name, filter })
            }
            ParsedStatement::Ddl(_) => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum StatementError {
    #[error("could not parse this SQL statement: {0}")]
    Unparseable(String),
    #[error("INSERT lists {columns} column(s) but {values} value(s)")]
    ColumnCountMismatch { columns: usize, values: usize },
    #[error("{0} without a WHERE clause is not allowed")]
    MissingWhere(&'static str),
    #[error("only a single `column = value` condition is supported in WHERE, got: {0}")]
    UnsupportedWhere(String),
    #[error("multi-row INSERT is not supported; insert one row at a time")]
    MultiRowInsert,
}

struct Patterns {
    select: Regex,
    insert: Regex,
    update: Regex,
    delete: Regex,
    condition: Regex,
    assignment: Regex,
}

const IDENT: &str = r#"[A-Za-z_][A-Za-z0-9_]*"#;
const VALUE: &str = r#"'(?:[^']|'')*'|[^\s'=<>!;,()]+"#;

impl Patterns {
    fn build() -> Result<Self, regex::Error> {
        let table = format!(r#"["`]?(?P<table>{IDENT})["`]?"#);
        Ok(Self {
            select: Regex::new(&format!(
                r#"(?is)^select\s+(?P<cols>\*|{IDENT}(?:\s*,\s*{IDENT})*)\s+from\s+{table}(?:\s+where\s+(?P<where>.+?))?(?:\s+limit\s+(?P<limit>\d+))?$"#
            ))?,
            insert: Regex::new(&format!(
                r#"(?is)^insert\s+into\s+{table}\s*\((?P<cols>[^)]*)\)\s*values\s*(?P<rest>.*)$"#
            ))?,
            update: Regex::new(&format!(
                r#"(?is)^update\s+{table}\s+set\s+(?P<set>.+?)(?:\s+where\s+(?P<where>.+))?$"#
            ))?,
            delete: Regex::new(&format!(
                r#"(?is)^delete\s+from\s+{table}(?:\s+where\s+(?P<where>.+))?$"#
            ))?,
            condition: Regex::new(&format!(
                r#"(?s)^(?P<col>{IDENT})\s*=\s*(?P<val>{VALUE})$"#
            ))?,
            assignment: Regex::new(&format!(
                r#"(?s)^["`]?(?P<col>{IDENT})["`]?\s*=\s*(?P<val>.+)$"#
            ))?,
        })
    }
}

fn patterns() -> Result<&'static Patterns, StatementError> {
    static PATTERNS: OnceLock<Result<Patterns, regex::Error>> = OnceLock::new();
    PATTERNS
        .get_or_init(Patterns::build)
        .as_ref()
        .map_err(|e| StatementError::Unparseable(format!("statement patterns unavailable: {e}")))
}

/// Classify `sql` by its first word and extract a structured operation.
pub fn parse_statement(sql: &str) -> Result<ParsedStatement, StatementError> {
    let body = sql.trim().trim_end_matches(';').trim_end();
    let keyword = body
        .split(|c: char| c.is_whitespace() || c == '(')
        .next()
        .unwrap_or_default()
        .to_ascii_lowercase();

    let p = patterns()?;
    match keyword.as_str() {
        "select" => parse_select(p, body),
        "insert" => parse_insert(p, body),
        "update" => parse_update(p, body),
        "delete" => parse_delete(p, body),
        "create" => Ok(ParsedStatement::Ddl(DdlKind::Create)),
        "alter" => Ok(ParsedStatement::Ddl(DdlKind::Alter)),
        "drop" => Ok(ParsedStatement::Ddl(DdlKind::Drop)),
        "" => Err(StatementError::Unparseable("empty statement".to_string())),
        other => Err(StatementError::Unparseable(format!(
            "unsupported statement type `{other}`"
        ))),
    }
}

fn parse_select(p: &Patterns, body: &str) -> Result<ParsedStatement, StatementError> {
    let caps = p.select.captures(body).ok_or_else(|| {
        StatementError::Unparseable(
            "only `SELECT <columns> FROM <table> [WHERE col = value] [LIMIT n]` is supported"
                .to_string(),
        )
    })?;
    let cols = caps.name("cols").map_or("*", |m| m.as_str()).trim();
    let columns = if cols == "*" {
        None
    } else {
        Some(cols.split(',').map(|c| c.trim().to_string()).collect())
    };
    let filter = caps
        .name("where")
        .map(|w| parse_condition(p, w.as_str()))
        .transpose()?;
    // Digits only, so a parse failure means the value overflowed.
    let limit = caps.name("limit").map_or(DEFAULT_SQL_SELECT_LIMIT, |m| {
        m.as_str()
            .parse::<usize>()
            .map_or(MAX_SELECT_LIMIT, |n| n.min(MAX_SELECT_LIMIT))
    });
    Ok(ParsedStatement::Select(SelectArgs {
        table_name: caps["table"].to_string(),
        columns,
        filter,
        limit,
    }))
}

fn parse_insert(p: &Patterns, body: &str) -> Result<ParsedStatement, StatementError> {
    let caps = p.insert.captures(body).ok_or_else(|| {
        StatementError::Unparseable(
            "only `INSERT INTO <table> (<columns>) VALUES (<values>)` is supported".to_string(),
        )
    })?;

    let columns = caps["cols"]
        .split(',')
        .map(|c| c.trim().trim_matches(|q| q == '"' || q == '`').to_string())
        .collect::<Vec<_>>();
    if let Some(bad) = columns.iter().find(|c| !crate::registry::is_identifier(c)) {
        return Err(StatementError::Unparseable(format!(
            "invalid column name {bad:?}"
        )));
    }

    let (inner, trailing) = take_parenthesized(&caps["rest"])?;
    let trailing = trailing.trim();
    if trailing.starts_with(',') {
        return Err(StatementError::MultiRowInsert);
    }
    if !trailing.is_empty() {
        return Err(StatementError::Unparseable(format!(
            "unexpected text after VALUES: {trailing:?}"
        )));
    }

    let values = split_top_level(inner)?;
    if values.len() != columns.len() {
        return Err(StatementError::ColumnCountMismatch {
            columns: columns.len(),
            values: values.len(),
        });
    }

    let data = columns
        .into_iter()
        .zip(values.iter().map(|v| coerce_value(v)))
        .collect();
    Ok(ParsedStatement::Insert {
        table_name: caps["table"].to_string(),
        data,
    })
}

fn parse_update(p: &Patterns, body: &str) -> Result<ParsedStatement, StatementError> {
    let caps = p.update.captures(body).ok_or_else(|| {
        StatementError::Unparseable(
            "only `UPDATE <table> SET col = value[, ...] WHERE col = value` is supported"
                .to_string(),
        )
    })?;
    let where_clause = caps
        .name("where")
        .ok_or(StatementError::MissingWhere("UPDATE"))?;
    let filter = parse_condition(p, where_clause.as_str())?;

    let mut data = Map::new();
    for assignment in split_top_level(&caps["set"])? {
        let a = p.assignment.captures(&assignment).ok_or_else(|| {
            StatementError::Unparseable(format!("invalid SET assignment {assignment:?}"))
        })?;
        data.insert(a["col"].to_string(), coerce_value(&a["val"]));
    }

    Ok(ParsedStatement::Update {
        table_name: caps["table"].to_string(),
        filter,
        data,
    })
}

fn parse_delete(p: &Patterns, body: &str) -> Result<ParsedStatement, StatementError> {
    let caps = p.delete.captures(body).ok_or_else(|| {
        StatementError::Unparseable(
            "only `DELETE FROM <table> WHERE col = value` is supported".to_string(),
        )
    })?;
    let where_clause = caps
        .name("where")
        .ok_or(StatementError::MissingWhere("DELETE"))?;
    Ok(ParsedStatement::Delete {
        table_name: caps["table"].to_string(),
        filter: parse_condition(p, where_clause.as_str())?,
    })
}

fn parse_condition(p: &Patterns, clause: &str) -> Result<EqFilter, StatementError> {
    let clause = clause.trim();
    let unsupported = || StatementError::UnsupportedWhere(clause.to_string());
    let caps = p.condition.captures(clause).ok_or_else(unsupported)?;
    // Filters compare by text, so only quoted literals are rewritten.
    let raw = &caps["val"];
    let value = match unquote(raw) {
        Some(literal) => literal,
        None if raw.eq_ignore_ascii_case("null") => return Err(unsupported()),
        None => raw.to_string(),
    };
    Ok(EqFilter {
        column: caps["col"].to_string(),
        value,
    })
}

/// Body of a single-quoted literal with `''` unescaped.
fn unquote(token: &str) -> Option<String> {
    let inner = token.strip_prefix('\'')?.strip_suffix('\'')?;
    Some(inner.replace("''", "'"))
}

/// Coerce one SQL literal token to JSON.
///
/// Precedence: quoted literal, then `true`/`false`, then `null`, then a number,
/// then the raw token as a string.
pub fn coerce_value(token: &str) -> Value {
    let t = token.trim();
    if let Some(literal) = unquote(t) {
        return Value::String(literal);
    }
    if t.eq_ignore_ascii_case("true") {
        return Value::Bool(true);
    }
    if t.eq_ignore_ascii_case("false") {
        return Value::Bool(false);
    }
    if t.eq_ignore_ascii_case("null") {
        return Value::Null;
    }
    if let Ok(n) = t.parse::<i64>() {
        return Value::Number(n.into());
    }
    if let Some(n) = t
        .parse::<f64>()
        .ok()
        .filter(|f| f.is_finite())
        .and_then(Number::from_f64)
    {
        return Value::Number(n);
    }
    Value::String(t.to_string())
}

/// Split on commas that are outside single-quoted literals. Tokens are trimmed
/// but otherwise kept raw (quotes included).
fn split_top_level(s: &str) -> Result<Vec<String>, StatementError> {
    let mut out = Vec::new();
    let mut current = String::new();
    let mut in_quote = false;
    let mut chars = s.chars().peekable();

    while let Some(c) = chars.next() {
        match c {
            '\'' if in_quote && chars.peek() == Some(&'\'') => {
                current.push_str("''");
                chars.next();
            }
            '\'' => {
                in_quote = !in_quote;
                current.push(c);
            }
            ',' if !in_quote => out.push(std::mem::take(&mut current).trim().to_string()),
            _ => current.push(c),
        }
    }
    if in_quote {
        return Err(StatementError::Unparseable(
            "unterminated string literal".to_string(),
        ));
    }
    out.push(current.trim().to_string());
    if out.iter().any(|t| t.is_empty()) {
        return Err(StatementError::Unparseable("empty value in list".to_string()));
    }
    Ok(out)
}

/// `s` must start with `(`; returns the text inside the matching `)` and what follows it.
fn take_parenthesized(s: &str) -> Result<(&str, &str), StatementError> {
    let s = s.trim_start();
    if !s.starts_with('(') {
        return Err(StatementError::Unparseable(
            "expected `(` after VALUES".to_string(),
        ));
    }
    let mut depth = 0usize;
    let mut in_quote = false;
    for (idx, c) in s.char_indices() {
        match c {
            '\'' => in_quote = !in_quote,
            '(' if !in_quote => depth += 1,
            ')' if !in_quote => {
                depth -= 1;
                if depth == 0 {
                    return Ok((&s[1..idx], &s[idx + 1..]));
                }
            }
            _ => {}
        }
    }
    Err(StatementError::Unparseable(
        "unbalanced parentheses in VALUES".to_string(),
    ))
}

/// Script the user can run once to give the gateway a native SQL endpoint
/// named `rpc_name`.
pub fn setup_sql(rpc_name: &str) -> String {
    format!(
        r#"-- Run this once in your database's SQL editor:
CREATE OR REPLACE FUNCTION {rpc_name}(query text)
RETURNS json
LANGUAGE plpgsql
SECURITY DEFINER
AS $$
DECLARE
  result json;
BEGIN
  IF lower(ltrim(query)) LIKE 'select%' OR lower(ltrim(query)) LIKE 'with%' THEN
    EXECUTE format('SELECT coalesce(json_agg(t), ''[]''::json) FROM (%s) t', query) INTO result;
    RETURN json_build_object('success', true, 'data', result);
  END IF;
  EXECUTE query;
  RETURN json_build_object('success', true);
EXCEPTION WHEN OTHERS THEN
  RETURN json_build_object('success', false, 'error', SQLERRM);
END;
$$;

GRANT EXECUTE ON FUNCTION {rpc_name}(text) TO anon;
GRANT EXECUTE ON FUNCTION {rpc_name}(text) TO authenticated;
"#
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use serde_json::json;

    fn insert_data(sql: &str) -> Map<String, Value> {
        match parse_statement(sql).unwrap() {
            ParsedStatement::Insert { data, .. } => data,
            other => panic!("expected insert, got {other:?}"),
        }
    }

    #[test]
    fn insert_coerces_strings_and_numbers() {
        let parsed = parse_statement("INSERT INTO t (a,b) VALUES ('x', 5)").unwrap();
        let expected: Map<String, Value> =
            json!({"a": "x", "b": 5}).as_object().cloned().unwrap();
        assert_eq!(
            parsed,
            ParsedStatement::Insert {
                table_name: "t".into(),
                data: expected
            }
        );
    }

    #[test]
    fn insert_handles_quotes_commas_and_keywords() {
        let data = insert_data(
            "insert into notes (title, done, owner, score) values ('it''s, fine', TRUE, null, 2.5);",
        );
        assert_eq!(
            Value::Object(data),
            json!({"title": "it's, fine", "done": true, "owner": null, "score": 2.5})
        );
    }

    #[test]
    fn insert_rejects_mismatched_and_multi_row() {
        assert_eq!(
            parse_statement("INSERT INTO t (a, b) VALUES (1)").unwrap_err(),
            StatementError::ColumnCountMismatch {
                columns: 2,
                values: 1
            }
        );
        assert_eq!(
            parse_statement("INSERT INTO t (a) VALUES (1), (2)").unwrap_err(),
            StatementError::MultiRowInsert
        );
        assert!(matches!(
            parse_statement("INSERT INTO t VALUES (1)").unwrap_err(),
            StatementError::Unparseable(_)
        ));
    }

    #[test]
    fn ddl_is_classified_not_executed() {
        assert_eq!(
            parse_statement("DROP TABLE t").unwrap(),
            ParsedStatement::Ddl(DdlKind::Drop)
        );
        assert_eq!(
            parse_statement("  create table x (id int)").unwrap(),
            ParsedStatement::Ddl(DdlKind::Create)
        );
        assert_eq!(parse_statement("DROP TABLE t").unwrap().into_operation(), None);
        assert!(setup_sql("exec_sql").contains("CREATE OR REPLACE FUNCTION exec_sql(query text)"));
    }

    #[test]
    fn select_with_filter_and_limit() {
        assert_eq!(
            parse_statement("SELECT id, name FROM products WHERE category = 'lamps' LIMIT 5;")
                .unwrap(),
            ParsedStatement::Select(SelectArgs {
                table_name: "products".into(),
                columns: Some(vec!["id".into(), "name".into()]),
                filter: Some(EqFilter {
                    column: "category".into(),
                    value: "lamps".into()
                }),
                limit: 5,
            })
        );
        assert_eq!(
            parse_statement("select * from \"orders\"").unwrap(),
            ParsedStatement::Select(SelectArgs::all("orders", DEFAULT_SQL_SELECT_LIMIT))
        );
    }

    #[test]
    fn unsupported_selects_are_unparseable() {
        for sql in [
            "SELECT count(*) FROM orders",
            "SELECT * FROM a JOIN b ON a.id = b.a_id",
            "SELECT * FROM a, b",
            "SELECT * FROM orders ORDER BY id",
            "SELECT * FROM (SELECT * FROM t) x",
            "selection of things",
        ] {
            assert!(parse_statement(sql).is_err(), "{sql} should not parse");
        }
        assert!(matches!(
            parse_statement("SELECT * FROM t WHERE a = 1 AND b = 2").unwrap_err(),
            StatementError::UnsupportedWhere(_)
        ));
    }

    #[test]
    fn update_and_delete_require_single_equality() {
        assert_eq!(
            parse_statement("UPDATE users SET name = 'Ann', age = 31 WHERE id = 7").unwrap(),
            ParsedStatement::Update {
                table_name: "users".into(),
                filter: EqFilter {
                    column: "id".into(),
                    value: "7".into()
                },
                data: json!({"name": "Ann", "age": 31}).as_object().cloned().unwrap(),
            }
        );
        assert_eq!(
            parse_statement("UPDATE users SET active = false").unwrap_err(),
            StatementError::MissingWhere("UPDATE")
        );
        assert_eq!(
            parse_statement("DELETE FROM users").unwrap_err(),
            StatementError::MissingWhere("DELETE")
        );
        assert!(matches!(
            parse_statement("DELETE FROM users WHERE id = 1 OR 1 = 1").unwrap_err(),
            StatementError::UnsupportedWhere(_)
        ));
        assert!(matches!(
            parse_statement("DELETE FROM users WHERE id > 3").unwrap_err(),
            StatementError::UnsupportedWhere(_)
        ));
        assert_eq!(
            parse_statement("delete from users where email = 'a@b.c';").unwrap(),
            ParsedStatement::Delete {
                table_name: "users".into(),
                filter: EqFilter {
                    column: "email".into(),
                    value: "a@b.c".into()
                }
            }
        );
    }

    fn delete_filter(sql: &str) -> EqFilter {
        match parse_statement(sql).unwrap() {
            ParsedStatement::Delete { filter, .. } => filter,
            other => panic!("expected delete, got {other:?}"),
        }
    }

    #[test]
    fn where_values_are_kept_verbatim() {
        assert_eq!(
            delete_filter("DELETE FROM t WHERE id = 12345678901234567890").value,
            "12345678901234567890"
        );
        assert_eq!(delete_filter("DELETE FROM t WHERE code = 1e3").value, "1e3");
        assert_eq!(delete_filter("DELETE FROM t WHERE price = 2.50").value, "2.50");
        assert_eq!(delete_filter("DELETE FROM t WHERE name = 'O''Hara'").value, "O'Hara");
        assert_eq!(delete_filter("DELETE FROM t WHERE code = '007'").value, "007");
        for sql in [
            "DELETE FROM t WHERE owner = null",
            "UPDATE t SET a = 1 WHERE owner = NULL",
        ] {
            assert!(matches!(
                parse_statement(sql).unwrap_err(),
                StatementError::UnsupportedWhere(_)
            ));
        }
    }

    #[test]
    fn oversized_limit_is_clamped() {
        for sql in [
            "SELECT * FROM t LIMIT 99999999999999999999999",
            "SELECT * FROM t LIMIT 5000",
        ] {
            match parse_statement(sql).unwrap() {
                ParsedStatement::Select(args) => assert_eq!(args.limit, MAX_SELECT_LIMIT),
                other => panic!("expected select, got {other:?}"),
            }
        }
    }

    #[test]
    fn unknown_statements_are_unparseable() {
        assert!(matches!(
            parse_statement("TRUNCATE users").unwrap_err(),
            StatementError::Unparseable(_)
        ));
        assert!(matches!(
            parse_statement("   ").unwrap_err(),
            StatementError::Unparseable(_)
        ));
    }

    proptest! {
        #[test]
        fn integers_coerce_to_numbers(n in any::<i64>()) {
            prop_assert_eq!(coerce_value(&n.to_string()), json!(n));
        }

        #[test]
        fn quoted_literals_coerce_to_their_text(s in "[a-zA-Z0-9 ,'()]{0,16}") {
            let token = format!("'{}'", s.replace('\'', "''"));
            prop_assert_eq!(coerce_value(&token), Value::String(s));
        }

        #[test]
        fn bare_words_stay_strings(s in "[a-zA-Z_][a-zA-Z0-9_]{0,10}") {
            prop_assume!(!["true", "false", "null", "inf", "infinity", "nan"]
                .contains(&s.to_ascii_lowercase().as_str()));
            prop_assert_eq!(coerce_value(&s), Value::String(s.clone()));
        }
    }
}
