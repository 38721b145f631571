//! Row decoding from sqlx rows to JSON maps.
//!
//! Each column is first classified from its type name into a [`TypeCategory`],
//! then decoded by trying the Rust types that category can hold, narrowest
//! backend-specific types first.

use crate::models::{DatabaseType, Row as JsonRow};
use serde_json::Value as JsonValue;
use sqlx::mysql::{MySqlRow, MySqlTypeInfo, MySqlValueRef};
use sqlx::postgres::{PgRow, PgTypeInfo, PgValueRef};
use sqlx::sqlite::SqliteRow;
use sqlx::{Column, Decode, Row, Type, TypeInfo};

/// Logical category for database column types.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TypeCategory {
    Integer,
    Float,
    Decimal,
    Boolean,
    Binary,
    Json,
    Unknown,
}

/// Classify a database type name into a logical category.
pub fn categorize_type(type_name: &str, db: DatabaseType) -> TypeCategory {
    let lower = type_name.to_lowercase();

    // Checked before floats, "numeric" overlaps
    if lower.contains("decimal") || lower.contains("numeric") {
        // SQLite's NUMERIC affinity stores floats
        if db == DatabaseType::SQLite && lower == "numeric" {
            return TypeCategory::Float;
        }
        return TypeCategory::Decimal;
    }
    if lower.contains("int") || lower.contains("serial") || lower.contains("tiny") {
        return TypeCategory::Integer;
    }
    if lower == "bool" || lower == "boolean" {
        return TypeCategory::Boolean;
    }
    if lower.contains("float") || lower.contains("double") || lower == "real" {
        return TypeCategory::Float;
    }
    if lower == "json" || lower == "jsonb" {
        return TypeCategory::Json;
    }
    if lower.contains("blob") || lower.contains("binary") || lower == "bytea" {
        return TypeCategory::Binary;
    }
    // varchar, text, char, date, time, uuid, ...
    TypeCategory::Unknown
}

/// DECIMAL/NUMERIC kept as the backend's exact text.
#[derive(Debug)]
pub struct RawDecimal(pub String);

impl Type<sqlx::MySql> for RawDecimal {
    fn type_info() -> MySqlTypeInfo {
        <String as Type<sqlx::MySql>>::type_info()
    }

    fn compatible(ty: &MySqlTypeInfo) -> bool {
        let name = ty.name().to_lowercase();
        name.contains("decimal") || name.contains("numeric")
    }
}

impl<'r> Decode<'r, sqlx::MySql> for RawDecimal {
    fn decode(value: MySqlValueRef<'r>) -> Result<Self, sqlx::error::BoxDynError> {
        let s = <&str as Decode<sqlx::MySql>>::decode(value)?;
        Ok(RawDecimal(s.to_string()))
    }
}

impl Type<sqlx::Postgres> for RawDecimal {
    fn type_info() -> PgTypeInfo {
        <String as Type<sqlx::Postgres>>::type_info()
    }

    fn compatible(ty: &PgTypeInfo) -> bool {
        let name = ty.name().to_lowercase();
        name.contains("numeric") || name.contains("decimal")
    }
}

impl<'r> Decode<'r, sqlx::Postgres> for RawDecimal {
    fn decode(value: PgValueRef<'r>) -> Result<Self, sqlx::error::BoxDynError> {
        let s = <&str as Decode<sqlx::Postgres>>::decode(value)?;
        Ok(RawDecimal(s.to_string()))
    }
}

/// Encode binary column data as a base64 JSON string.
pub fn decode_binary_value(bytes: &[u8]) -> JsonValue {
    use base64::{Engine as _, engine::general_purpose::STANDARD};

    JsonValue::String(STANDARD.encode(bytes))
}

/// Decode column `$idx` as the first of `$ty` that succeeds; NULL or no
/// match yields `JsonValue::Null`.
macro_rules! first_decoded {
    ($row:expr, $idx:expr, $($ty:ty),+ $(,)?) => {{
        let mut value = JsonValue::Null;
        $(
            if value.is_null() {
                if let Ok(Some(v)) = $row.try_get::<Option<$ty>, _>($idx) {
                    value = JsonValue::from(v);
                }
            }
        )+
        value
    }};
}

fn decimal_value(result: Result<Option<RawDecimal>, sqlx::Error>) -> JsonValue {
    match result {
        Ok(Some(v)) => JsonValue::String(v.0),
        Ok(None) => JsonValue::Null,
        Err(e) => {
            tracing::error!(error = %e, "Failed to decode DECIMAL");
            JsonValue::Null
        }
    }
}

fn binary_value(result: Result<Option<Vec<u8>>, sqlx::Error>) -> JsonValue {
    result
        .ok()
        .flatten()
        .map(|v| decode_binary_value(&v))
        .unwrap_or(JsonValue::Null)
}

/// Text columns; a JSON-ish declared type is parsed when it holds valid JSON.
fn text_value(result: Result<Option<String>, sqlx::Error>, type_name: &str) -> JsonValue {
    match result {
        Ok(Some(v)) => {
            if type_name.to_lowercase().contains("json") {
                if let Ok(json) = serde_json::from_str::<JsonValue>(&v) {
                    return json;
                }
            }
            JsonValue::String(v)
        }
        _ => JsonValue::Null,
    }
}

fn decode_columns<R, F>(row: &R, db: DatabaseType, decode: F) -> JsonRow
where
    R: Row,
    F: Fn(&R, usize, &str, TypeCategory) -> JsonValue,
{
    row.columns()
        .iter()
        .enumerate()
        .map(|(idx, col)| {
            let type_name = col.type_info().name();
            let category = categorize_type(type_name, db);
            (col.name().to_string(), decode(row, idx, type_name, category))
        })
        .collect()
}

/// Trait for converting database rows to JSON maps.
pub trait RowToJson {
    fn to_json_map(&self) -> JsonRow;
}

impl RowToJson for MySqlRow {
    fn to_json_map(&self) -> JsonRow {
        decode_columns(self, DatabaseType::MySQL, |row, idx, type_name, category| {
            match category {
                TypeCategory::Decimal => decimal_value(row.try_get(idx)),
                TypeCategory::Integer => {
                    first_decoded!(row, idx, i8, i16, i32, i64, u8, u16, u32, u64)
                }
                TypeCategory::Boolean => first_decoded!(row, idx, bool),
                TypeCategory::Float => first_decoded!(row, idx, f64, f32),
                TypeCategory::Binary => binary_value(row.try_get(idx)),
                TypeCategory::Json => first_decoded!(row, idx, JsonValue),
                TypeCategory::Unknown => text_value(row.try_get(idx), type_name),
            }
        })
    }
}

impl RowToJson for PgRow {
    fn to_json_map(&self) -> JsonRow {
        decode_columns(self, DatabaseType::PostgreSQL, |row, idx, type_name, category| {
            match category {
                TypeCategory::Decimal => decimal_value(row.try_get(idx)),
                TypeCategory::Integer => first_decoded!(row, idx, i16, i32, i64),
                TypeCategory::Boolean => first_decoded!(row, idx, bool),
                TypeCategory::Float => first_decoded!(row, idx, f64, f32),
                TypeCategory::Binary => binary_value(row.try_get(idx)),
                TypeCategory::Json => first_decoded!(row, idx, JsonValue),
                TypeCategory::Unknown => text_value(row.try_get(idx), type_name),
            }
        })
    }
}

impl RowToJson for SqliteRow {
    fn to_json_map(&self) -> JsonRow {
        decode_columns(self, DatabaseType::SQLite, |row, idx, type_name, category| {
            match category {
                TypeCategory::Integer => first_decoded!(row, idx, i64, i32),
                TypeCategory::Boolean => first_decoded!(row, idx, bool),
                TypeCategory::Float | TypeCategory::Decimal => first_decoded!(row, idx, f64),
                TypeCategory::Binary => binary_value(row.try_get(idx)),
                TypeCategory::Json | TypeCategory::Unknown => {
                    text_value(row.try_get(idx), type_name)
                }
            }
        })
    }
}
