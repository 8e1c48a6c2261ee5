//! Schema binding.
//!
//! A `FieldSchema` declares which fields of a collection are encrypted, with
//! which algorithm, under which key. Its canonical document form is a JSON
//! Schema fragment:
//!
//! ```text
//! { "bsonType": "object",
//!   "properties": {
//!     "ssn": { "encrypt": { "bsonType": "string",
//!                           "algorithm": "Deterministic",
//!                           "keyId": [ {"$binary": {..., "subType": "04"}} ] } } } }
//! ```
//!
//! The same fragment, wrapped in `{"$jsonSchema": ...}`, is what a server
//! uses as a collection validator.

use std::collections::BTreeMap;
use std::fmt;
use std::fs;
use std::path::Path;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};
use tracing::{debug, info};

use crate::document::{Binary, BsonType, Document, Namespace};
use crate::error::{FieldVaultError, Result};
use crate::keys::KeyId;
use crate::store::DocumentStore;

const LONG_DETERMINISTIC: &str = "AEAD_AES_256_CBC_HMAC_SHA_512-Deterministic";
const LONG_RANDOM: &str = "AEAD_AES_256_CBC_HMAC_SHA_512-Random";

/// Field encryption mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Algorithm {
    /// Same plaintext, same ciphertext. Supports equality filters.
    Deterministic,
    /// Fresh ciphertext on every encryption. Cannot be filtered.
    Random,
}

impl Algorithm {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Deterministic => "Deterministic",
            Self::Random => "Random",
        }
    }

    /// Tag stored in the first byte of an encrypted blob.
    pub(crate) fn code(&self) -> u8 {
        match self {
            Self::Deterministic => 1,
            Self::Random => 2,
        }
    }

    pub(crate) fn from_code(code: u8) -> Option<Self> {
        match code {
            1 => Some(Self::Deterministic),
            2 => Some(Self::Random),
            _ => None,
        }
    }
}

impl fmt::Display for Algorithm {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Algorithm {
    type Err = FieldVaultError;

    /// Accepts the short names and the driver's long names.
    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "Deterministic" | LONG_DETERMINISTIC => Ok(Self::Deterministic),
            "Random" | LONG_RANDOM => Ok(Self::Random),
            other => Err(FieldVaultError::UnknownAlgorithm(other.to_string())),
        }
    }
}

/// How one field is encrypted.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EncryptDirective {
    pub bson_type: BsonType,
    pub algorithm: Algorithm,
    pub key_id: KeyId,
}

/// An unvalidated directive, as a caller or a file supplies it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawDirective {
    pub bson_type: String,
    pub algorithm: String,
    pub key_id: KeyId,
}

impl RawDirective {
    pub fn new(bson_type: impl Into<String>, algorithm: impl Into<String>, key_id: KeyId) -> Self {
        Self {
            bson_type: bson_type.into(),
            algorithm: algorithm.into(),
            key_id,
        }
    }
}

/// Field name to directive. Immutable once built.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FieldSchema {
    fields: BTreeMap<String, EncryptDirective>,
}

/// Validate and assemble a schema.
///
/// Fails with `UnknownAlgorithm` for anything but Deterministic/Random, and
/// with `InvalidSchema` for unusable field names, unknown bsonTypes, or a
/// Deterministic directive on a type that cannot be compared by value.
pub fn build_schema<I, K>(directives: I) -> Result<FieldSchema>
where
    I: IntoIterator<Item = (K, RawDirective)>,
    K: Into<String>,
{
    let mut fields = BTreeMap::new();
    for (name, raw) in directives {
        let name = name.into();
        check_field_name(&name)?;

        let algorithm: Algorithm = raw.algorithm.parse()?;
        let bson_type: BsonType = raw.bson_type.parse()?;
        check_deterministic_type(&name, algorithm, bson_type)?;

        let directive = EncryptDirective {
            bson_type,
            algorithm,
            key_id: raw.key_id,
        };
        if fields.insert(name.clone(), directive).is_some() {
            return Err(FieldVaultError::InvalidSchema(format!(
                "field `{name}` declared twice"
            )));
        }
    }
    Ok(FieldSchema { fields })
}

fn check_field_name(name: &str) -> Result<()> {
    if name.is_empty() || name.starts_with('$') || name.contains('.') || name == "_id" {
        return Err(FieldVaultError::InvalidSchema(format!(
            "field `{name}` cannot be encrypted"
        )));
    }
    Ok(())
}

fn check_deterministic_type(name: &str, algorithm: Algorithm, bson_type: BsonType) -> Result<()> {
    let comparable = !matches!(
        bson_type,
        BsonType::Double | BsonType::Bool | BsonType::Object | BsonType::Array
    );
    if algorithm == Algorithm::Deterministic && !comparable {
        return Err(FieldVaultError::InvalidSchema(format!(
            "field `{name}`: bsonType {bson_type} cannot use the Deterministic algorithm"
        )));
    }
    Ok(())
}

impl FieldSchema {
    pub fn get(&self, field: &str) -> Option<&EncryptDirective> {
        self.fields.get(field)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &EncryptDirective)> {
        self.fields.iter().map(|(k, v)| (k.as_str(), v))
    }

    pub fn len(&self) -> usize {
        self.fields.len()
    }

    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }

    /// Canonical document form.
    pub fn to_document(&self) -> Document {
        let mut properties = Map::new();
        for (name, d) in &self.fields {
            properties.insert(
                name.clone(),
                json!({
                    "encrypt": {
                        "bsonType": d.bson_type.as_str(),
                        "algorithm": d.algorithm.as_str(),
                        "keyId": [d.key_id.to_binary().to_value()],
                    }
                }),
            );
        }

        let mut doc = Document::new();
        doc.insert("bsonType".into(), json!("object"));
        doc.insert("properties".into(), Value::Object(properties));
        doc
    }

    /// Parse the canonical document form. Properties without an `encrypt`
    /// block carry no directive and are skipped.
    pub fn from_document(doc: &Document) -> Result<Self> {
        if let Some(t) = doc.get("bsonType") {
            if t != "object" {
                return Err(FieldVaultError::InvalidSchema(
                    "top-level bsonType must be object".into(),
                ));
            }
        }
        let properties = match doc.get("properties") {
            None => return Ok(Self::default()),
            Some(Value::Object(p)) => p,
            Some(_) => {
                return Err(FieldVaultError::InvalidSchema(
                    "properties must be a document".into(),
                ))
            }
        };

        let mut directives = Vec::with_capacity(properties.len());
        for (name, prop) in properties {
            let Some(encrypt) = prop.get("encrypt") else {
                continue;
            };
            directives.push((name.clone(), parse_encrypt_block(name, encrypt)?));
        }
        build_schema(directives)
    }

    /// Write the canonical form as pretty-printed JSON.
    pub fn save(&self, path: impl AsRef<Path>) -> Result<()> {
        let path = path.as_ref();
        let text = serde_json::to_string_pretty(&Value::Object(self.to_document()))?;
        fs::write(path, text).map_err(|e| FieldVaultError::persistence(path, e))?;
        debug!(path = %path.display(), fields = self.len(), "schema saved");
        Ok(())
    }

    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let text = fs::read_to_string(path).map_err(|e| FieldVaultError::persistence(path, e))?;
        match serde_json::from_str::<Value>(&text)? {
            Value::Object(doc) => Self::from_document(&doc),
            _ => Err(FieldVaultError::InvalidSchema(
                "schema file must hold a document".into(),
            )),
        }
    }

    /// Collection validator form: `{"$jsonSchema": <canonical form>}`.
    pub fn to_validator(&self) -> Document {
        let mut validator = Document::new();
        validator.insert("$jsonSchema".into(), Value::Object(self.to_document()));
        validator
    }

    /// Extract the schema from a validator, if it carries one.
    pub fn from_validator(validator: &Document) -> Result<Option<Self>> {
        match validator.get("$jsonSchema") {
            Some(Value::Object(doc)) => Self::from_document(doc).map(Some),
            Some(_) => Err(FieldVaultError::InvalidSchema(
                "$jsonSchema must be a document".into(),
            )),
            None => Ok(None),
        }
    }
}

fn parse_encrypt_block(name: &str, encrypt: &Value) -> Result<RawDirective> {
    let invalid = |what: &str| FieldVaultError::InvalidSchema(format!("field `{name}`: {what}"));

    let bson_type = encrypt
        .get("bsonType")
        .and_then(Value::as_str)
        .ok_or_else(|| invalid("missing bsonType"))?;
    let algorithm = encrypt
        .get("algorithm")
        .and_then(Value::as_str)
        .ok_or_else(|| invalid("missing algorithm"))?;

    let key_value = match encrypt.get("keyId") {
        Some(Value::Array(ids)) if ids.len() == 1 => &ids[0],
        Some(Value::Array(_)) => return Err(invalid("keyId must list exactly one key")),
        Some(other) => other,
        None => return Err(invalid("missing keyId")),
    };
    let binary = Binary::from_value(key_value).ok_or_else(|| invalid("keyId must be binary"))?;

    Ok(RawDirective::new(
        bson_type,
        algorithm,
        KeyId::from_binary(&binary)?,
    ))
}

// ---------------------------------------------------------------------------
// Collection binding
// ---------------------------------------------------------------------------

/// The association of one namespace with one schema.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CollectionBinding {
    pub namespace: Namespace,
    pub schema: FieldSchema,
}

/// Declare that `namespace` is governed by `schema`. Touches nothing.
pub fn bind_to_collection(schema: FieldSchema, namespace: Namespace) -> CollectionBinding {
    CollectionBinding { namespace, schema }
}

impl CollectionBinding {
    /// Create the collection with the schema as its validator, so the store
    /// rejects unencrypted values in schema fields from any writer.
    pub fn apply_validator<S: DocumentStore>(&self, store: &S) -> Result<()> {
        store.create_collection(&self.namespace, Some(self.schema.to_validator()))?;
        info!(namespace = %self.namespace, fields = self.schema.len(), "schema applied as collection validator");
        Ok(())
    }
}
