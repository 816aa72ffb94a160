//! Column type definitions.

use crate::value::Value;
use serde::{Deserialize, Serialize};

/// Column types understood by the schema layer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SqlType {
    Boolean,
    Integer,
    BigInt,
    Double,
    Text,
    Blob,
    Timestamp,
    Json,
}

impl SqlType {
    /// Get the SQL type name for this type.
    pub const fn sql_name(&self) -> &'static str {
        match self {
            SqlType::Boolean => "BOOLEAN",
            SqlType::Integer => "INTEGER",
            SqlType::BigInt => "BIGINT",
            SqlType::Double => "DOUBLE PRECISION",
            SqlType::Text => "TEXT",
            SqlType::Blob => "BLOB",
            SqlType::Timestamp => "TIMESTAMP",
            SqlType::Json => "JSON",
        }
    }

    /// The value a non-nullable column of this type holds before anything is assigned.
    pub fn zero_value(&self) -> Value {
        match self {
            SqlType::Boolean => Value::Bool(false),
            SqlType::Integer => Value::Int(0),
            SqlType::BigInt => Value::BigInt(0),
            SqlType::Double => Value::Double(0.0),
            SqlType::Text => Value::Text(String::new()),
            SqlType::Blob => Value::Bytes(Vec::new()),
            SqlType::Timestamp => Value::Timestamp(0),
            SqlType::Json => Value::Json(serde_json::Value::Null),
        }
    }

    /// Check if this is an integer type usable for generated keys.
    pub const fn is_integer(&self) -> bool {
        matches!(self, SqlType::Integer | SqlType::BigInt)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn zero_values_match_type() {
        assert_eq!(SqlType::BigInt.zero_value(), Value::BigInt(0));
        assert_eq!(SqlType::Text.zero_value(), Value::Text(String::new()));
        assert!(SqlType::Integer.is_integer());
        assert!(!SqlType::Text.is_integer());
    }
}
