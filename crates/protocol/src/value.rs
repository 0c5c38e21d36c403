//! Typed values carried as call parameters and response payloads.
//!
//! Scalars, date/time, identifiers and byte strings are built in. Anything
//! richer travels as a [`Value::Composite`] whose logical type name must be
//! known to the [`TypeRegistry`] on both ends.

use std::any::{type_name, TypeId};
use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::{ProtocolError, Result};
use crate::trust::TrustLevel;

/// A single typed value.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "value", rename_all = "snake_case")]
pub enum Value {
    /// Explicit absence of a value.
    Null,
    /// Boolean.
    Bool(bool),
    /// Signed 64-bit integer.
    Int(i64),
    /// 64-bit float. NaN and the infinities travel as strings.
    Float(#[serde(with = "float_repr")] f64),
    /// UTF-8 text.
    Text(String),
    /// UTC timestamp (RFC 3339 on the wire).
    DateTime(DateTime<Utc>),
    /// 128-bit identifier.
    Id(Uuid),
    /// Raw bytes (base64 on the wire).
    Bytes(#[serde(with = "base64_bytes")] Vec<u8>),
    /// Ordered list of values.
    List(Vec<Value>),
    /// A registered composite type.
    Composite {
        /// Logical type name, as registered in the [`TypeRegistry`].
        type_name: String,
        /// Encoded body.
        data: serde_json::Value,
    },
}

impl Value {
    /// Short name of the value kind, used in error messages.
    pub fn kind(&self) -> &'static str {
        match self {
            Value::Null => "null",
            Value::Bool(_) => "bool",
            Value::Int(_) => "int",
            Value::Float(_) => "float",
            Value::Text(_) => "text",
            Value::DateTime(_) => "datetime",
            Value::Id(_) => "id",
            Value::Bytes(_) => "bytes",
            Value::List(_) => "list",
            Value::Composite { .. } => "composite",
        }
    }

    fn mismatch(&self, expected: &str) -> ProtocolError {
        ProtocolError::TypeMismatch {
            expected: expected.to_string(),
            got: self.kind().to_string(),
        }
    }
}

/// Serde support for byte strings (serializes as base64).
mod base64_bytes {
    use base64::Engine;
    use serde::{Deserialize, Deserializer, Serialize, Serializer};

    pub fn serialize<S>(bytes: &[u8], serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        base64::engine::general_purpose::STANDARD
            .encode(bytes)
            .serialize(serializer)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Vec<u8>, D::Error>
    where
        D: Deserializer<'de>,
    {
        let encoded: String = Deserialize::deserialize(deserializer)?;
        base64::engine::general_purpose::STANDARD
            .decode(&encoded)
            .map_err(serde::de::Error::custom)
    }
}

/// Serde support for floats that JSON numbers cannot express.
mod float_repr {
    use serde::{Deserialize, Deserializer, Serializer};

    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Repr {
        Number(f64),
        Special(String),
    }

    pub fn serialize<S>(value: &f64, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        if value.is_nan() {
            serializer.serialize_str("NaN")
        } else if value.is_infinite() && value.is_sign_positive() {
            serializer.serialize_str("inf")
        } else if value.is_infinite() {
            serializer.serialize_str("-inf")
        } else {
            serializer.serialize_f64(*value)
        }
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<f64, D::Error>
    where
        D: Deserializer<'de>,
    {
        match Repr::deserialize(deserializer)? {
            Repr::Number(n) => Ok(n),
            Repr::Special(text) => match text.as_str() {
                "NaN" => Ok(f64::NAN),
                "inf" => Ok(f64::INFINITY),
                "-inf" => Ok(f64::NEG_INFINITY),
                other => Err(serde::de::Error::custom(format!(
                    "invalid float literal: {other}"
                ))),
            },
        }
    }
}

// ============================================================================
// Conversions
// ============================================================================

/// Conversion of a Rust value into a [`Value`].
pub trait IntoValue {
    /// Performs the conversion.
    fn into_value(self) -> Value;
}

/// Fallible conversion of a [`Value`] into a Rust value.
pub trait FromValue: Sized {
    /// Performs the conversion.
    fn from_value(value: Value) -> Result<Self>;
}

impl IntoValue for Value {
    fn into_value(self) -> Value {
        self
    }
}

impl FromValue for Value {
    fn from_value(value: Value) -> Result<Self> {
        Ok(value)
    }
}

macro_rules! scalar_conversions {
    ($ty:ty, $variant:ident, $expected:literal) => {
        impl IntoValue for $ty {
            fn into_value(self) -> Value {
                Value::$variant(self)
            }
        }

        impl FromValue for $ty {
            fn from_value(value: Value) -> Result<Self> {
                match value {
                    Value::$variant(inner) => Ok(inner),
                    other => Err(other.mismatch($expected)),
                }
            }
        }
    };
}

scalar_conversions!(bool, Bool, "bool");
scalar_conversions!(i64, Int, "int");
scalar_conversions!(f64, Float, "float");
scalar_conversions!(String, Text, "text");
scalar_conversions!(DateTime<Utc>, DateTime, "datetime");
scalar_conversions!(Uuid, Id, "id");
scalar_conversions!(Vec<u8>, Bytes, "bytes");

impl IntoValue for &str {
    fn into_value(self) -> Value {
        Value::Text(self.to_string())
    }
}

impl IntoValue for u32 {
    fn into_value(self) -> Value {
        Value::Int(i64::from(self))
    }
}

impl FromValue for u32 {
    fn from_value(value: Value) -> Result<Self> {
        match value {
            Value::Int(n) => u32::try_from(n).map_err(|_| ProtocolError::TypeMismatch {
                expected: "u32".to_string(),
                got: format!("int {n}"),
            }),
            other => Err(other.mismatch("int")),
        }
    }
}

impl IntoValue for TrustLevel {
    fn into_value(self) -> Value {
        Value::Int(i64::from(self.as_u8()))
    }
}

impl FromValue for TrustLevel {
    fn from_value(value: Value) -> Result<Self> {
        match value {
            Value::Int(n) => {
                let raw = u8::try_from(n).map_err(|_| ProtocolError::TypeMismatch {
                    expected: "trust level".to_string(),
                    got: format!("int {n}"),
                })?;
                TrustLevel::new(raw)
            }
            other => Err(other.mismatch("int")),
        }
    }
}

impl<T: IntoValue> IntoValue for Option<T> {
    fn into_value(self) -> Value {
        match self {
            Some(inner) => inner.into_value(),
            None => Value::Null,
        }
    }
}

impl<T: FromValue> FromValue for Option<T> {
    fn from_value(value: Value) -> Result<Self> {
        match value {
            Value::Null => Ok(None),
            other => T::from_value(other).map(Some),
        }
    }
}

// ============================================================================
// Type registry
// ============================================================================

struct TypeEntry {
    check: fn(&serde_json::Value) -> Result<()>,
}

fn check_as<T: DeserializeOwned>(data: &serde_json::Value) -> Result<()> {
    T::deserialize(data).map(|_| ()).map_err(ProtocolError::from)
}

/// Registry of composite types that may travel inside a [`Value`].
///
/// Built once at startup and shared read-only afterwards.
#[derive(Default)]
pub struct TypeRegistry {
    by_name: HashMap<String, TypeEntry>,
    by_type: HashMap<TypeId, String>,
}

impl TypeRegistry {
    /// Creates an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers `T` under the logical name `name`.
    pub fn register<T>(&mut self, name: impl Into<String>) -> Result<()>
    where
        T: Serialize + DeserializeOwned + 'static,
    {
        let name = name.into();
        if self.by_name.contains_key(&name) || self.by_type.contains_key(&TypeId::of::<T>()) {
            return Err(ProtocolError::DuplicateType(name));
        }
        self.by_name.insert(
            name.clone(),
            TypeEntry {
                check: check_as::<T>,
            },
        );
        self.by_type.insert(TypeId::of::<T>(), name);
        Ok(())
    }

    /// Encodes a registered value as a composite.
    pub fn encode<T>(&self, value: &T) -> Result<Value>
    where
        T: Serialize + 'static,
    {
        let name = self
            .by_type
            .get(&TypeId::of::<T>())
            .ok_or_else(|| ProtocolError::UnregisteredType(type_name::<T>().to_string()))?;
        let data = serde_json::to_value(value)
            .map_err(|e| ProtocolError::Serialization(e.to_string()))?;
        Ok(Value::Composite {
            type_name: name.clone(),
            data,
        })
    }

    /// Decodes a composite back into `T`, checking the logical type name.
    pub fn decode<T>(&self, value: &Value) -> Result<T>
    where
        T: DeserializeOwned + 'static,
    {
        let expected = self
            .by_type
            .get(&TypeId::of::<T>())
            .ok_or_else(|| ProtocolError::UnregisteredType(type_name::<T>().to_string()))?;
        match value {
            Value::Composite { type_name, data } if type_name == expected => {
                T::deserialize(data).map_err(ProtocolError::from)
            }
            Value::Composite { type_name, .. } => Err(ProtocolError::TypeMismatch {
                expected: expected.clone(),
                got: type_name.clone(),
            }),
            other => Err(other.mismatch(expected)),
        }
    }

    /// Checks that every composite inside `value` is known and well formed.
    pub fn validate(&self, value: &Value) -> Result<()> {
        match value {
            Value::Composite { type_name, data } => {
                let entry = self
                    .by_name
                    .get(type_name)
                    .ok_or_else(|| ProtocolError::UnsupportedParameterType(type_name.clone()))?;
                (entry.check)(data)
            }
            Value::List(items) => items.iter().try_for_each(|item| self.validate(item)),
            _ => Ok(()),
        }
    }
}

impl std::fmt::Debug for TypeRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TypeRegistry")
            .field("types", &self.by_name.keys().collect::<Vec<_>>())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
    struct FileSnapshot {
        path: String,
        size: u64,
        hash: Option<String>,
    }

    #[derive(Debug, Serialize, Deserialize)]
    struct NotRegistered {
        field: u8,
    }

    fn registry() -> TypeRegistry {
        let mut registry = TypeRegistry::new();
        registry.register::<FileSnapshot>("FileSnapshot").unwrap();
        registry
    }

    fn roundtrip(value: Value) {
        let json = serde_json::to_string(&value).unwrap();
        let decoded: Value = serde_json::from_str(&json).unwrap();
        assert_eq!(value, decoded, "{json}");
    }

    #[test]
    fn test_every_kind_roundtrips() {
        let snapshot = FileSnapshot {
            path: "/srv/share/a.txt".to_string(),
            size: 1024,
            hash: None,
        };
        let values = [
            Value::Null,
            Value::Bool(true),
            Value::Int(-42),
            Value::Float(0.1),
            Value::Text("grüße".to_string()),
            Value::DateTime(Utc.with_ymd_and_hms(2024, 1, 1, 12, 30, 0).unwrap()),
            Value::Id(Uuid::new_v4()),
            Value::Bytes((0u8..=255).collect()),
            Value::List(vec![Value::Int(1), Value::Text("two".to_string())]),
            registry().encode(&snapshot).unwrap(),
        ];
        for value in values {
            roundtrip(value);
        }
    }

    #[test]
    fn test_non_finite_floats_roundtrip() {
        roundtrip(Value::Float(f64::INFINITY));
        roundtrip(Value::Float(f64::NEG_INFINITY));

        let json = serde_json::to_string(&Value::Float(f64::NAN)).unwrap();
        assert_eq!(json, r#"{"type":"float","value":"NaN"}"#);
        match serde_json::from_str::<Value>(&json).unwrap() {
            Value::Float(n) => assert!(n.is_nan()),
            other => panic!("expected float, got {other:?}"),
        }
    }

    #[test]
    fn test_unknown_float_literal_rejected() {
        let json = r#"{"type":"float","value":"lots"}"#;
        assert!(serde_json::from_str::<Value>(json).is_err());
    }

    #[test]
    fn test_bytes_are_base64_on_the_wire() {
        let json = serde_json::to_string(&Value::Bytes(b"hi".to_vec())).unwrap();
        assert_eq!(json, r#"{"type":"bytes","value":"aGk="}"#);
    }

    #[test]
    fn test_encode_unregistered_type_fails() {
        let err = registry().encode(&NotRegistered { field: 1 }).unwrap_err();
        assert!(matches!(err, ProtocolError::UnregisteredType(_)));
    }

    #[test]
    fn test_composite_roundtrip_through_registry() {
        let registry = registry();
        let snapshot = FileSnapshot {
            path: "/srv/share/b.bin".to_string(),
            size: 7,
            hash: Some("abcd".to_string()),
        };
        let value = registry.encode(&snapshot).unwrap();
        let decoded: FileSnapshot = registry.decode(&value).unwrap();
        assert_eq!(decoded, snapshot);
    }

    #[test]
    fn test_validate_unknown_composite() {
        let value = Value::List(vec![Value::Composite {
            type_name: "DirectoryDiff".to_string(),
            data: serde_json::json!({}),
        }]);
        let err = registry().validate(&value).unwrap_err();
        assert!(matches!(
            err,
            ProtocolError::UnsupportedParameterType(name) if name == "DirectoryDiff"
        ));
    }

    #[test]
    fn test_validate_malformed_composite_body() {
        let value = Value::Composite {
            type_name: "FileSnapshot".to_string(),
            data: serde_json::json!({ "path": 5 }),
        };
        assert!(registry().validate(&value).is_err());
    }

    #[test]
    fn test_duplicate_registration_rejected() {
        let mut registry = registry();
        assert!(matches!(
            registry.register::<FileSnapshot>("Other"),
            Err(ProtocolError::DuplicateType(_))
        ));
        assert!(matches!(
            registry.register::<NotRegistered>("FileSnapshot"),
            Err(ProtocolError::DuplicateType(_))
        ));
    }

    #[test]
    fn test_scalar_conversions() {
        assert_eq!(String::from_value("x".into_value()).unwrap(), "x");
        assert_eq!(u32::from_value(Value::Int(7)).unwrap(), 7);
        assert!(u32::from_value(Value::Int(-1)).is_err());
        assert_eq!(Option::<bool>::from_value(Value::Null).unwrap(), None);
        assert_eq!(
            TrustLevel::from_value(TrustLevel::USER_VERIFIED.into_value()).unwrap(),
            TrustLevel::USER_VERIFIED
        );
        assert!(matches!(
            bool::from_value(Value::Text("yes".to_string())),
            Err(ProtocolError::TypeMismatch { .. })
        ));
    }
}
