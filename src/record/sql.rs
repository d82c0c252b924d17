//! Self-contained SQL rendering for replicated writes.
//!
//! The local write goes through bound parameters; the copy shipped to other
//! nodes must travel as plain text, so every value is rendered here through
//! [`quote_literal`] / [`quote_ident`]. Rendered statements are safe to
//! re-execute: inserts and updates become upserts of the full row, deletes
//! target a single primary key.

use crate::config::SchemaConfig;
use super::Record;

/// Quote a string as a MySQL/MariaDB string literal.
///
/// Escapes the same characters as `mysql_real_escape_string`.
pub fn quote_literal(s: &str) -> String {
    let mut out = String::with_capacity(s.len() + 2);
    out.push('\'');
    for c in s.chars() {
        match c {
            '\0' => out.push_str("\\0"),
            '\n' => out.push_str("\\n"),
            '\r' => out.push_str("\\r"),
            '\\' => out.push_str("\\\\"),
            '\'' => out.push_str("\\'"),
            '"' => out.push_str("\\\""),
            '\x1a' => out.push_str("\\Z"),
            c => out.push(c),
        }
    }
    out.push('\'');
    out
}

/// Quote an identifier with backticks
pub fn quote_ident(name: &str) -> String {
    format!("`{}`", name.replace('`', "``"))
}

/// Leading part of a statement for log lines, cut on a char boundary
pub fn preview(sql: &str, max_chars: usize) -> &str {
    match sql.char_indices().nth(max_chars) {
        Some((idx, _)) => &sql[..idx],
        None => sql,
    }
}

/// Upsert of the full row: `INSERT ... ON DUPLICATE KEY UPDATE`
pub fn render_upsert(schema: &SchemaConfig, record: &Record) -> String {
    let mut columns = vec![quote_ident(&schema.key_column)];
    let mut values = vec![quote_literal(&record.key)];
    let mut updates = Vec::new();

    for column in &schema.columns {
        let Some(value) = record.fields.get(&column.name) else {
            continue;
        };
        let ident = quote_ident(&column.name);
        updates.push(format!("{} = VALUES({})", ident, ident));
        columns.push(ident);
        values.push(value.to_sql());
    }

    // A key-only row still needs a no-op update clause to stay idempotent
    if updates.is_empty() {
        let key = quote_ident(&schema.key_column);
        updates.push(format!("{} = {}", key, key));
    }

    format!(
        "INSERT INTO {} ({}) VALUES ({}) ON DUPLICATE KEY UPDATE {}",
        quote_ident(&schema.table),
        columns.join(", "),
        values.join(", "),
        updates.join(", ")
    )
}

/// Delete by primary key
pub fn render_delete(schema: &SchemaConfig, key: &str) -> String {
    format!(
        "DELETE FROM {} WHERE {} = {}",
        quote_ident(&schema.table),
        quote_ident(&schema.key_column),
        quote_literal(key)
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::tests::three_node_config;
    use crate::record::{Fields, Value};

    fn apple() -> Record {
        let mut fields = Fields::new();
        fields.insert("primary_title".into(), Value::Text("Apple".into()));
        fields.insert("start_year".into(), Value::Int(2001));
        fields.insert("genres".into(), Value::Null);
        Record::new("tt0000001", fields)
    }

    #[test]
    fn test_quote_literal_escapes() {
        assert_eq!(quote_literal("plain"), "'plain'");
        assert_eq!(quote_literal("it's"), r"'it\'s'");
        assert_eq!(quote_literal(r"a\b"), r"'a\\b'");
        assert_eq!(quote_literal("x\ny\0"), r"'x\ny\0'");
        assert_eq!(quote_literal("'; DROP TABLE titles; --"), r"'\'; DROP TABLE titles; --'");
    }

    #[test]
    fn test_preview_respects_char_boundaries() {
        assert_eq!(preview("DELETE FROM t", 6), "DELETE");
        assert_eq!(preview("short", 50), "short");
        assert_eq!(preview("ééé", 2), "éé");
    }

    #[test]
    fn test_quote_ident() {
        assert_eq!(quote_ident("titles"), "`titles`");
        assert_eq!(quote_ident("we`ird"), "`we``ird`");
    }

    #[test]
    fn test_render_upsert() {
        let schema = three_node_config().schema;
        let sql = render_upsert(&schema, &apple());
        assert_eq!(
            sql,
            "INSERT INTO `titles` (`tconst`, `primary_title`, `start_year`, `genres`) \
             VALUES ('tt0000001', 'Apple', 2001, NULL) \
             ON DUPLICATE KEY UPDATE `primary_title` = VALUES(`primary_title`), \
             `start_year` = VALUES(`start_year`), `genres` = VALUES(`genres`)"
        );
    }

    #[test]
    fn test_render_upsert_key_only() {
        let schema = three_node_config().schema;
        let sql = render_upsert(&schema, &Record::new("tt0000002", Fields::new()));
        assert!(sql.ends_with("ON DUPLICATE KEY UPDATE `tconst` = `tconst`"));
    }

    #[test]
    fn test_render_delete() {
        let schema = three_node_config().schema;
        assert_eq!(
            render_delete(&schema, "tt0000001"),
            "DELETE FROM `titles` WHERE `tconst` = 'tt0000001'"
        );
    }
}
