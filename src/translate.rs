//! Conversion between local documents and remote-ready rows.

use chrono::{DateTime, SecondsFormat, Utc};
use serde_json::{Map, Value};

use crate::registry::Table;

/// Fields that only make sense on this device and never leave it.
pub const INTERNAL_FIELDS: &[&str] = &[
  "_local",
  "_dirty",
  "_syncError",
  "_retryCount",
  "_pendingSync",
  "localOnly",
];

/// Capture timestamp column stamped on every outgoing row.
pub const CAPTURED_AT: &str = "captured_at";

/// Prepare a local record (or list of records) for the remote table.
///
/// `captured` is when the write happened locally; it fills `created_at` and
/// `captured_at` when the record has none, so replaying a change only moves
/// `updated_at`.
pub fn prepare(record: &Value, owner_id: &str, table: Table, captured: DateTime<Utc>) -> Value {
  prepare_at(record, owner_id, table, captured, Utc::now())
}

/// Same as [`prepare`] with an explicit clock.
pub fn prepare_at(
  record: &Value,
  owner_id: &str,
  table: Table,
  captured: DateTime<Utc>,
  now: DateTime<Utc>,
) -> Value {
  let stamps = Stamps {
    captured: timestamp(captured),
    now: timestamp(now),
  };
  match record {
    Value::Array(items) => Value::Array(
      items
        .iter()
        .map(|item| prepare_one(item, owner_id, table, &stamps))
        .collect(),
    ),
    other => prepare_one(other, owner_id, table, &stamps),
  }
}

struct Stamps {
  captured: Value,
  now: Value,
}

fn timestamp(at: DateTime<Utc>) -> Value {
  Value::String(at.to_rfc3339_opts(SecondsFormat::Millis, true))
}

fn prepare_one(record: &Value, owner_id: &str, table: Table, stamps: &Stamps) -> Value {
  let mut row = match record {
    Value::Object(map) => map.clone(),
    // Scalars are wrapped so the row still carries ownership columns
    other => {
      let mut map = Map::new();
      map.insert("value".to_string(), other.clone());
      map
    }
  };

  for (local, remote) in table.field_map() {
    if let Some(value) = row.remove(*local) {
      row.insert((*remote).to_string(), value);
    }
  }

  row.insert("owner_id".to_string(), Value::String(owner_id.to_string()));
  row.insert("updated_at".to_string(), stamps.now.clone());
  if !has_value(&row, "created_at") {
    row.insert("created_at".to_string(), stamps.captured.clone());
  }
  if !has_value(&row, CAPTURED_AT) {
    row.insert(CAPTURED_AT.to_string(), stamps.captured.clone());
  }

  for field in INTERNAL_FIELDS {
    row.remove(*field);
  }

  Value::Object(row)
}

fn has_value(row: &Map<String, Value>, key: &str) -> bool {
  row.get(key).is_some_and(|v| !v.is_null())
}

/// Reverse the field map on a row pulled from the remote table.
pub fn to_local(row: &Value, table: Table) -> Value {
  match row {
    Value::Array(items) => Value::Array(items.iter().map(|item| to_local(item, table)).collect()),
    Value::Object(map) => {
      let mut record = map.clone();
      for (local, remote) in table.field_map() {
        if let Some(value) = record.remove(*remote) {
          record.insert((*local).to_string(), value);
        }
      }
      Value::Object(record)
    }
    other => other.clone(),
  }
}

/// Record id used by update and delete, if the record carries one.
pub fn record_id(record: &Value) -> Option<String> {
  match record.get("id")? {
    Value::String(s) if !s.is_empty() => Some(s.clone()),
    Value::Number(n) => Some(n.to_string()),
    _ => None,
  }
}
