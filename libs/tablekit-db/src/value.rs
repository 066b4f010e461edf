//! JSON record values and their typed `SeaORM` counterparts.

use sea_orm::Value;
use serde_json::{Map, Value as JsonValue};
use time::format_description::BorrowedFormatItem;
use time::format_description::well_known::Rfc3339;
use time::macros::format_description;
use time::{Date, OffsetDateTime};

use crate::config::TimestampUnit;
use crate::error::{ServiceError, ServiceResult};
use crate::model::{ColumnDef, ColumnKind};

/// A row keyed by logical column names.
pub type Record = Map<String, JsonValue>;

/// Typed null for a column kind.
#[must_use]
pub fn null_of(kind: ColumnKind) -> Value {
    match kind {
        ColumnKind::String => Value::String(None),
        ColumnKind::Integer => Value::BigInt(None),
        ColumnKind::Float => Value::Double(None),
        ColumnKind::Boolean => Value::Bool(None),
        ColumnKind::Uuid => Value::Uuid(None),
        ColumnKind::DateTime => Value::TimeDateTimeWithTimeZone(None),
        ColumnKind::Date => Value::TimeDate(None),
        ColumnKind::Json => Value::Json(None),
    }
}

/// Coerce a JSON value into the bind value for `column`.
///
/// # Errors
/// Returns `ServiceError::InvalidValue` if the value cannot represent the column type.
pub fn to_sea_value(column: &ColumnDef, v: &JsonValue) -> ServiceResult<Value> {
    let kind = column.kind();
    let invalid = |message: &str| ServiceError::invalid_value(column.name(), message);

    Ok(match (kind, v) {
        (_, JsonValue::Null) => null_of(kind),
        (ColumnKind::Json, other) => Value::from(other.clone()),

        (ColumnKind::String, JsonValue::String(s)) => Value::from(s.clone()),
        (ColumnKind::String, JsonValue::Number(n)) => Value::from(n.to_string()),
        (ColumnKind::String, JsonValue::Bool(b)) => Value::from(b.to_string()),

        (ColumnKind::Integer, JsonValue::Number(n)) => Value::from(
            n.as_i64()
                .or_else(|| n.as_u64().and_then(|u| i64::try_from(u).ok()))
                .ok_or_else(|| invalid("expected an integer"))?,
        ),
        (ColumnKind::Integer, JsonValue::String(s)) => Value::from(
            s.trim()
                .parse::<i64>()
                .map_err(|_| invalid("expected an integer"))?,
        ),
        (ColumnKind::Integer, JsonValue::Bool(b)) => Value::from(i64::from(*b)),

        (ColumnKind::Float, JsonValue::Number(n)) => {
            Value::from(n.as_f64().ok_or_else(|| invalid("expected a number"))?)
        }
        (ColumnKind::Float, JsonValue::String(s)) => Value::from(
            s.trim()
                .parse::<f64>()
                .map_err(|_| invalid("expected a number"))?,
        ),

        (ColumnKind::Boolean, JsonValue::Bool(b)) => Value::from(*b),
        (ColumnKind::Boolean, JsonValue::Number(n)) => Value::from(n.as_f64() != Some(0.0)),
        (ColumnKind::Boolean, JsonValue::String(s)) => match s.as_str() {
            "true" | "1" => Value::from(true),
            "false" | "0" | "" => Value::from(false),
            _ => return Err(invalid("expected a boolean")),
        },

        (ColumnKind::Uuid, JsonValue::String(s)) => {
            Value::from(uuid::Uuid::parse_str(s).map_err(|_| invalid("expected a uuid"))?)
        }

        (ColumnKind::DateTime, JsonValue::String(s)) => Value::from(
            OffsetDateTime::parse(s, &Rfc3339)
                .map_err(|_| invalid("expected an RFC 3339 timestamp"))?,
        ),
        (ColumnKind::DateTime, JsonValue::Number(n)) => {
            let secs = n.as_i64().ok_or_else(|| invalid("expected unix seconds"))?;
            Value::from(
                OffsetDateTime::from_unix_timestamp(secs)
                    .map_err(|_| invalid("timestamp out of range"))?,
            )
        }

        (ColumnKind::Date, JsonValue::String(s)) => {
            Value::from(parse_date(s).ok_or_else(|| invalid("expected YYYY-MM-DD"))?)
        }

        _ => return Err(invalid("unsupported value type")),
    })
}

/// Bind value for a column whose type is unknown (unresolved join references).
#[must_use]
pub fn loose_value(v: &JsonValue) -> Value {
    match v {
        JsonValue::Null => Value::String(None),
        JsonValue::Bool(b) => Value::from(*b),
        JsonValue::Number(n) => match n.as_i64() {
            Some(i) => Value::from(i),
            None => Value::from(n.as_f64().unwrap_or_default()),
        },
        JsonValue::String(s) => Value::from(s.clone()),
        other => Value::from(other.clone()),
    }
}

/// Normalize a value read back from the driver to the column's JSON shape
/// (`SQLite` hands booleans back as integers).
#[must_use]
pub fn from_db(kind: ColumnKind, v: JsonValue) -> JsonValue {
    match (kind, v) {
        (ColumnKind::Boolean, JsonValue::Number(n)) => JsonValue::Bool(n.as_f64() != Some(0.0)),
        (ColumnKind::Json, JsonValue::String(s)) => {
            serde_json::from_str(&s).unwrap_or(JsonValue::String(s))
        }
        (_, other) => other,
    }
}

const DATE_FORMAT: &[BorrowedFormatItem<'_>] = format_description!("[year]-[month]-[day]");

fn parse_date(s: &str) -> Option<Date> {
    Date::parse(s.get(..10).unwrap_or(s), DATE_FORMAT).ok()
}

/// JavaScript-style truthiness used by the diff synthesizer and the rank
/// operations: `null`, `false`, `0`, `""` are falsy, everything else is truthy.
#[must_use]
pub fn is_truthy(v: &JsonValue) -> bool {
    match v {
        JsonValue::Null => false,
        JsonValue::Bool(b) => *b,
        JsonValue::Number(n) => n.as_f64().is_some_and(|f| f != 0.0),
        JsonValue::String(s) => !s.is_empty(),
        JsonValue::Array(_) | JsonValue::Object(_) => true,
    }
}

/// Human-facing rendering of a value (strings without quotes).
#[must_use]
pub fn display_value(v: &JsonValue) -> String {
    match v {
        JsonValue::Null => String::new(),
        JsonValue::String(s) => s.clone(),
        other => other.to_string(),
    }
}

/// Loose equality used to match key values read back from different queries
/// (`1` and `"1"` compare equal).
#[must_use]
pub fn same_key(a: &JsonValue, b: &JsonValue) -> bool {
    a == b || (!a.is_null() && !b.is_null() && display_value(a) == display_value(b))
}

/// Stable string form of a record's primary key (`"7"`, `"3,12"`).
#[must_use]
pub fn key_string(record: &Record, pk: &[String]) -> String {
    pk.iter()
        .map(|k| record.get(k).map(display_value).unwrap_or_default())
        .collect::<Vec<_>>()
        .join(",")
}

/// Whether every primary key column carries a non-null value.
#[must_use]
pub fn has_key(record: &Record, pk: &[String]) -> bool {
    !pk.is_empty()
        && pk
            .iter()
            .all(|k| record.get(k).is_some_and(|v| !v.is_null()))
}

/// "Now" in the representation expected by a timestamp column.
#[must_use]
pub fn timestamp_now(kind: ColumnKind, unit: TimestampUnit) -> JsonValue {
    let now = OffsetDateTime::now_utc();
    match kind {
        ColumnKind::Integer | ColumnKind::Float => match unit {
            TimestampUnit::Seconds => JsonValue::from(now.unix_timestamp()),
            TimestampUnit::Millis => JsonValue::from(
                now.unix_timestamp() * 1000 + i64::from(now.millisecond()),
            ),
        },
        ColumnKind::Boolean => JsonValue::Bool(true),
        ColumnKind::Date => JsonValue::String(now.date().to_string()),
        ColumnKind::String
        | ColumnKind::Uuid
        | ColumnKind::DateTime
        | ColumnKind::Json => JsonValue::String(now.format(&Rfc3339).unwrap_or_default()),
    }
}
