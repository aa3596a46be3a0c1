use comfy_table::{presets::UTF8_BORDERS_ONLY, Cell, ContentArrangement, Row, Table};
use quarry_rs_sdk::ParameterizedStatement;
use serde_json::Value as JsonValue;

pub fn print_rows_table(rows: &[JsonValue]) {
    if rows.is_empty() {
        println!("(0 rows)");
        return;
    }

    let columns = column_names(rows);
    let mut table = Table::new();
    table
        .load_preset(UTF8_BORDERS_ONLY)
        .set_content_arrangement(ContentArrangement::Dynamic);
    table.set_header(Row::from(columns.iter().map(Cell::new).collect::<Vec<_>>()));

    for row in rows {
        let rendered = columns
            .iter()
            .map(|column| Cell::new(cell_text(row.get(column))))
            .collect::<Vec<_>>();
        table.add_row(Row::from(rendered));
    }

    println!("{table}");
    println!("({} rows)", rows.len());
}

pub fn print_rows_json(rows: &[JsonValue]) {
    println!(
        "{}",
        serde_json::to_string_pretty(rows).unwrap_or_else(|_| "[]".to_string())
    );
}

pub fn print_statement(statement: &ParameterizedStatement) {
    println!("{}", statement.sql);
    println!("({} parameters)", statement.parameters.len());
}

pub fn print_statement_json(statement: &ParameterizedStatement) {
    let payload = serde_json::json!({
        "sql": statement.sql,
        "parameters": statement.parameters.iter().map(|value| value.to_json()).collect::<Vec<_>>(),
    });
    println!(
        "{}",
        serde_json::to_string_pretty(&payload).unwrap_or_else(|_| "{}".to_string())
    );
}

/// Top-level keys in first-seen order across all rows.
fn column_names(rows: &[JsonValue]) -> Vec<String> {
    let mut columns: Vec<String> = Vec::new();
    for row in rows {
        let Some(object) = row.as_object() else {
            continue;
        };
        for key in object.keys() {
            if !columns.contains(key) {
                columns.push(key.clone());
            }
        }
    }
    columns
}

// nested objects and arrays stay as compact JSON
fn cell_text(value: Option<&JsonValue>) -> String {
    match value {
        None | Some(JsonValue::Null) => "null".to_string(),
        Some(JsonValue::String(text)) => text.clone(),
        Some(other) => other.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::{cell_text, column_names};
    use serde_json::json;

    #[test]
    fn columns_follow_first_seen_key_order() {
        let rows = vec![
            json!({"id": 1, "title": "a"}),
            json!({"id": 2, "author": {"name": "Ada"}, "title": "b"}),
        ];
        assert_eq!(column_names(&rows), vec!["id", "title", "author"]);
    }

    #[test]
    fn renders_nested_values_as_json() {
        assert_eq!(cell_text(Some(&json!("plain"))), "plain");
        assert_eq!(cell_text(Some(&json!(null))), "null");
        assert_eq!(cell_text(None), "null");
        assert_eq!(cell_text(Some(&json!({"name": "Ada"}))), r#"{"name":"Ada"}"#);
        assert_eq!(cell_text(Some(&json!([1, 2]))), "[1,2]");
    }
}
