//! Converts the remote system's two wire encodings into a flat sequence of records.

use serde_json::Value as JsonValue;
use tracing::warn;
use vmsync_core::Record;
use vmsync_storage::DataTable;

/// Selects how a `DATASET` table is decoded. Callers pick the variant that
/// matches the query they issued and never branch on the payload shape.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResponseTransformer {
    /// Heading row zipped positionally onto each data row.
    Tabular,
    /// Single-column table holding consecutive fragments of one `FOR JSON PATH` document.
    ChunkedJson,
}

impl ResponseTransformer {
    pub fn transform(self, table: &DataTable) -> Vec<Record> {
        match self {
            Self::Tabular => transform_tabular(table),
            Self::ChunkedJson => transform_chunked_json(table),
        }
    }
}

pub fn transform_tabular(table: &DataTable) -> Vec<Record> {
    if table.heading.is_empty() {
        return Vec::new();
    }

    table
        .data
        .iter()
        .map(|row| {
            table
                .heading
                .iter()
                .enumerate()
                .map(|(idx, heading)| {
                    let value = row.get(idx).cloned().unwrap_or(JsonValue::Null);
                    (heading.clone(), value)
                })
                .collect()
        })
        .collect()
}

pub fn transform_chunked_json(table: &DataTable) -> Vec<Record> {
    let assembled = assemble_fragments(table);
    let cleaned = strip_control_chars(&assembled);
    let trimmed = cleaned.trim();
    if trimmed.is_empty() {
        return Vec::new();
    }

    match serde_json::from_str::<JsonValue>(trimmed) {
        Ok(JsonValue::Array(items)) => items
            .into_iter()
            .filter_map(|item| match item {
                JsonValue::Object(map) => Some(map),
                _ => None,
            })
            .collect(),
        Ok(JsonValue::Object(map)) => vec![map],
        Ok(other) => {
            warn!(kind = json_kind(&other), "chunked json payload is not an object or array");
            Vec::new()
        }
        Err(err) => {
            warn!(bytes = trimmed.len(), error = %err, "failed to parse chunked json payload");
            Vec::new()
        }
    }
}

fn assemble_fragments(table: &DataTable) -> String {
    let mut assembled = String::new();
    for row in &table.data {
        match row.first() {
            Some(JsonValue::String(fragment)) => assembled.push_str(fragment),
            Some(JsonValue::Null) | None => {}
            Some(other) => assembled.push_str(&other.to_string()),
        }
    }
    assembled
}

/// Drops ASCII control characters other than tab, line feed and carriage return.
pub fn strip_control_chars(input: &str) -> String {
    input
        .chars()
        .filter(|c| !matches!(*c, '\u{00}'..='\u{08}' | '\u{0B}'..='\u{0C}' | '\u{0E}'..='\u{1F}' | '\u{7F}'))
        .collect()
}

fn json_kind(value: &JsonValue) -> &'static str {
    match value {
        JsonValue::Null => "null",
        JsonValue::Bool(_) => "bool",
        JsonValue::Number(_) => "number",
        JsonValue::String(_) => "string",
        JsonValue::Array(_) => "array",
        JsonValue::Object(_) => "object",
    }
}
