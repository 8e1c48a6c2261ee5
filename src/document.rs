//! Document model shared with the document store.
//!
//! Documents are JSON objects. Values that JSON cannot express natively use
//! the canonical extended-JSON wrappers: `{"$binary": {"base64", "subType"}}`
//! for binary data (key ids, ciphertext) and `{"$date": ...}` for dates.

use std::fmt;
use std::str::FromStr;

use base64::engine::general_purpose::STANDARD;
use base64::Engine as _;
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};

use crate::error::FieldVaultError;

/// A document: an ordered map of field names to extended-JSON values.
pub type Document = Map<String, Value>;

// ---------------------------------------------------------------------------
// Namespace
// ---------------------------------------------------------------------------

/// A `database.collection` pair.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Namespace {
    db: String,
    coll: String,
}

impl Namespace {
    pub fn new(db: impl Into<String>, coll: impl Into<String>) -> Self {
        Self {
            db: db.into(),
            coll: coll.into(),
        }
    }

    pub fn db(&self) -> &str {
        &self.db
    }

    pub fn coll(&self) -> &str {
        &self.coll
    }
}

impl fmt::Display for Namespace {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.db, self.coll)
    }
}

impl FromStr for Namespace {
    type Err = FieldVaultError;

    /// The collection part may itself contain dots (`fle_demo.__keystore`
    /// splits at the first one).
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.split_once('.') {
            Some((db, coll)) if !db.is_empty() && !coll.is_empty() => Ok(Self::new(db, coll)),
            _ => Err(FieldVaultError::Config(format!("malformed namespace: {s}"))),
        }
    }
}

impl TryFrom<String> for Namespace {
    type Error = FieldVaultError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<Namespace> for String {
    fn from(ns: Namespace) -> Self {
        ns.to_string()
    }
}

// ---------------------------------------------------------------------------
// Binary
// ---------------------------------------------------------------------------

/// Binary subtypes used by fieldvault.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BinarySubtype {
    Generic,
    Uuid,
    Encrypted,
    Other(u8),
}

impl BinarySubtype {
    pub fn as_u8(self) -> u8 {
        match self {
            Self::Generic => 0x00,
            Self::Uuid => 0x04,
            Self::Encrypted => 0x06,
            Self::Other(b) => b,
        }
    }

    pub fn from_u8(b: u8) -> Self {
        match b {
            0x00 => Self::Generic,
            0x04 => Self::Uuid,
            0x06 => Self::Encrypted,
            other => Self::Other(other),
        }
    }
}

/// A binary value with its subtype.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Binary {
    pub subtype: BinarySubtype,
    pub bytes: Vec<u8>,
}

impl Binary {
    pub fn new(subtype: BinarySubtype, bytes: Vec<u8>) -> Self {
        Self { subtype, bytes }
    }

    /// Canonical extended-JSON form.
    pub fn to_value(&self) -> Value {
        json!({
            "$binary": {
                "base64": STANDARD.encode(&self.bytes),
                "subType": format!("{:02x}", self.subtype.as_u8()),
            }
        })
    }

    /// Parse either the canonical form or the legacy
    /// `{"$binary": "<base64>", "$type": "<hex>"}` form. Returns `None` for
    /// anything that is not a binary value.
    pub fn from_value(value: &Value) -> Option<Self> {
        let obj = value.as_object()?;
        let inner = obj.get("$binary")?;
        let (b64, subtype) = match inner {
            Value::Object(fields) if obj.len() == 1 => (
                fields.get("base64")?.as_str()?,
                fields.get("subType")?.as_str()?,
            ),
            Value::String(b64) if obj.len() == 2 => (b64.as_str(), obj.get("$type")?.as_str()?),
            _ => return None,
        };
        let bytes = STANDARD.decode(b64).ok()?;
        let subtype = u8::from_str_radix(subtype, 16).ok()?;
        Some(Self::new(BinarySubtype::from_u8(subtype), bytes))
    }
}

/// True when `value` is an extended-JSON `$date`.
pub fn is_date(value: &Value) -> bool {
    value
        .as_object()
        .map(|obj| obj.len() == 1 && obj.contains_key("$date"))
        .unwrap_or(false)
}

/// True when `value` is an extended-JSON wrapper rather than a plain object.
pub fn is_extended_scalar(value: &Value) -> bool {
    is_date(value) || Binary::from_value(value).is_some()
}

/// True when `value` is an operator document such as `{"$in": [..]}`.
pub(crate) fn is_operator_document(value: &Value) -> bool {
    match value.as_object() {
        Some(obj) if !obj.is_empty() && !is_extended_scalar(value) => {
            obj.keys().all(|k| k.starts_with('$'))
        }
        _ => false,
    }
}

// ---------------------------------------------------------------------------
// BSON types
// ---------------------------------------------------------------------------

/// The declared type of an encrypted field.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum BsonType {
    Double,
    String,
    Object,
    Array,
    BinData,
    Bool,
    Date,
    Int,
    Long,
}

impl BsonType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Double => "double",
            Self::String => "string",
            Self::Object => "object",
            Self::Array => "array",
            Self::BinData => "binData",
            Self::Bool => "bool",
            Self::Date => "date",
            Self::Int => "int",
            Self::Long => "long",
        }
    }

    /// The BSON element type byte.
    pub fn code(&self) -> u8 {
        match self {
            Self::Double => 0x01,
            Self::String => 0x02,
            Self::Object => 0x03,
            Self::Array => 0x04,
            Self::BinData => 0x05,
            Self::Bool => 0x08,
            Self::Date => 0x09,
            Self::Int => 0x10,
            Self::Long => 0x12,
        }
    }

    pub fn from_code(code: u8) -> Option<Self> {
        Some(match code {
            0x01 => Self::Double,
            0x02 => Self::String,
            0x03 => Self::Object,
            0x04 => Self::Array,
            0x05 => Self::BinData,
            0x08 => Self::Bool,
            0x09 => Self::Date,
            0x10 => Self::Int,
            0x12 => Self::Long,
            _ => return None,
        })
    }

    /// The narrowest type `value` is an instance of. `None` for null.
    pub fn of(value: &Value) -> Option<Self> {
        Some(match value {
            Value::Null => return None,
            Value::Bool(_) => Self::Bool,
            Value::String(_) => Self::String,
            Value::Array(_) => Self::Array,
            Value::Number(_) if Self::Int.matches(value) => Self::Int,
            Value::Number(_) if Self::Long.matches(value) => Self::Long,
            Value::Number(_) => Self::Double,
            Value::Object(_) if is_date(value) => Self::Date,
            Value::Object(_) if Binary::from_value(value).is_some() => Self::BinData,
            Value::Object(_) => Self::Object,
        })
    }

    /// Whether `value` is an instance of this type.
    pub fn matches(&self, value: &Value) -> bool {
        match self {
            Self::Double => value.is_number(),
            Self::String => value.is_string(),
            Self::Object => value.is_object() && !is_extended_scalar(value),
            Self::Array => value.is_array(),
            Self::BinData => Binary::from_value(value).is_some(),
            Self::Bool => value.is_boolean(),
            Self::Date => is_date(value),
            Self::Int => value
                .as_i64()
                .map(|n| i32::try_from(n).is_ok())
                .unwrap_or(false),
            Self::Long => value.is_i64() || value.is_u64(),
        }
    }
}

impl fmt::Display for BsonType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for BsonType {
    type Err = FieldVaultError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(match s {
            "double" => Self::Double,
            "string" => Self::String,
            "object" => Self::Object,
            "array" => Self::Array,
            "binData" => Self::BinData,
            "bool" => Self::Bool,
            "date" => Self::Date,
            "int" => Self::Int,
            "long" => Self::Long,
            other => {
                return Err(FieldVaultError::InvalidSchema(format!(
                    "unknown bsonType: {other}"
                )))
            }
        })
    }
}
