//! The transparent codec gateway.
//!
//! A `Gateway` wraps a document store so that callers use it like an
//! unencrypted client:
//!
//! - **Writes** encrypt every schema field before the document leaves the
//!   gateway. Fields outside the schema pass through.
//! - **Filters** on Deterministic fields are encrypted so equality matching
//!   works on ciphertext. Any reference to a Random field fails with
//!   `NonFilterableField` before the store is contacted.
//! - **Reads** decrypt every encrypted value in the returned documents.
//!
//! A gateway is either `Unbound` (no schema: documents pass through
//! verbatim in both directions) or `Bound` (at least one collection
//! schema). The state is fixed at construction; build a new gateway to
//! change bindings.

use std::collections::BTreeMap;
use std::sync::Arc;

use serde_json::Value;
use tracing::{debug, info};

use crate::codec::{self, FieldCodec};
use crate::config::FieldVaultConfig;
use crate::document::{is_operator_document, Document, Namespace};
use crate::error::{FieldVaultError, Result};
use crate::keys::MasterKey;
use crate::schema::{Algorithm, CollectionBinding, EncryptDirective, FieldSchema};
use crate::store::{DeleteResult, DocumentStore, InsertManyResult, InsertOneResult, UpdateResult};

/// Whether a gateway applies any encryption.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GatewayState {
    Unbound,
    Bound,
}

/// Encryption settings for a bound gateway.
#[derive(Debug, Clone)]
pub struct GatewayOptions {
    key_vault_namespace: Namespace,
    schemas: BTreeMap<Namespace, FieldSchema>,
}

impl GatewayOptions {
    pub fn new(key_vault_namespace: Namespace) -> Self {
        Self {
            key_vault_namespace,
            schemas: BTreeMap::new(),
        }
    }

    pub fn from_config(config: &FieldVaultConfig) -> Self {
        Self::new(config.key_vault_namespace.clone())
    }

    /// Add a collection binding. A namespace takes at most one schema.
    pub fn bind(mut self, binding: CollectionBinding) -> Result<Self> {
        if self.schemas.contains_key(&binding.namespace) {
            return Err(FieldVaultError::DuplicateBinding(binding.namespace));
        }
        self.schemas.insert(binding.namespace, binding.schema);
        Ok(self)
    }

    /// Bind `namespace` to the schema held in its collection validator.
    /// A collection without one is left unbound.
    pub fn bind_remote<S: DocumentStore>(self, store: &S, namespace: Namespace) -> Result<Self> {
        let schema = match store.collection_validator(&namespace)? {
            Some(validator) => FieldSchema::from_validator(&validator)?,
            None => None,
        };
        match schema {
            Some(schema) => self.bind(CollectionBinding { namespace, schema }),
            None => {
                debug!(namespace = %namespace, "no server-side schema to bind");
                Ok(self)
            }
        }
    }
}

enum Binding<S> {
    Unbound,
    Bound {
        codec: FieldCodec<S>,
        schemas: BTreeMap<Namespace, FieldSchema>,
    },
}

/// A document-store client with automatic field-level encryption.
pub struct Gateway<S> {
    store: S,
    binding: Binding<S>,
}

impl<S: DocumentStore + Clone> Gateway<S> {
    /// A gateway that never encrypts or decrypts.
    pub fn unbound(store: S) -> Self {
        Self {
            store,
            binding: Binding::Unbound,
        }
    }

    /// A gateway using `master` and the bindings in `options`. Without any
    /// binding the gateway is `Unbound`, even though a key is supplied.
    pub fn new(store: S, master: Arc<MasterKey>, options: GatewayOptions) -> Self {
        if options.schemas.is_empty() {
            info!("gateway opened without a schema; documents pass through unencrypted");
            return Self::unbound(store);
        }
        info!(collections = options.schemas.len(), vault = %options.key_vault_namespace, "gateway opened");
        Self {
            binding: Binding::Bound {
                codec: FieldCodec::new(store.clone(), options.key_vault_namespace, master),
                schemas: options.schemas,
            },
            store,
        }
    }
}

impl<S: DocumentStore> Gateway<S> {
    pub fn state(&self) -> GatewayState {
        match self.binding {
            Binding::Unbound => GatewayState::Unbound,
            Binding::Bound { .. } => GatewayState::Bound,
        }
    }

    /// The schema bound to `ns`, if any.
    pub fn schema(&self, ns: &Namespace) -> Option<&FieldSchema> {
        match &self.binding {
            Binding::Unbound => None,
            Binding::Bound { schemas, .. } => schemas.get(ns),
        }
    }

    fn bound(&self, ns: &Namespace) -> Option<(&FieldCodec<S>, &FieldSchema)> {
        match &self.binding {
            Binding::Bound { codec, schemas } => schemas.get(ns).map(|s| (codec, s)),
            Binding::Unbound => None,
        }
    }

    // -----------------------------------------------------------------------
    // Writes
    // -----------------------------------------------------------------------

    pub fn insert_one(&self, ns: &Namespace, doc: Document) -> Result<InsertOneResult> {
        let doc = self.encrypt_document(ns, doc)?;
        Ok(self.store.insert_one(ns, doc)?)
    }

    /// Every document is encrypted before any is sent, so an encryption
    /// failure writes nothing.
    pub fn insert_many(&self, ns: &Namespace, docs: Vec<Document>) -> Result<InsertManyResult> {
        let docs = docs
            .into_iter()
            .map(|d| self.encrypt_document(ns, d))
            .collect::<Result<Vec<_>>>()?;
        Ok(self.store.insert_many(ns, docs)?)
    }

    pub fn update_one(
        &self,
        ns: &Namespace,
        filter: &Document,
        update: &Document,
    ) -> Result<UpdateResult> {
        let (filter, update) = self.prepare_update(ns, filter, update)?;
        Ok(self.store.update_one(ns, &filter, &update)?)
    }

    pub fn update_many(
        &self,
        ns: &Namespace,
        filter: &Document,
        update: &Document,
    ) -> Result<UpdateResult> {
        let (filter, update) = self.prepare_update(ns, filter, update)?;
        Ok(self.store.update_many(ns, &filter, &update)?)
    }

    pub fn delete_many(&self, ns: &Namespace, filter: &Document) -> Result<DeleteResult> {
        let filter = self.prepare_filter(ns, filter)?;
        Ok(self.store.delete_many(ns, &filter)?)
    }

    // -----------------------------------------------------------------------
    // Reads
    // -----------------------------------------------------------------------

    pub fn find(&self, ns: &Namespace, filter: &Document) -> Result<Vec<Document>> {
        let filter = self.prepare_filter(ns, filter)?;
        let docs = self.store.find(ns, &filter)?;
        docs.into_iter().map(|d| self.decrypt_document(d)).collect()
    }

    pub fn find_one(&self, ns: &Namespace, filter: &Document) -> Result<Option<Document>> {
        let filter = self.prepare_filter(ns, filter)?;
        self.store
            .find_one(ns, &filter)?
            .map(|d| self.decrypt_document(d))
            .transpose()
    }

    /// `$match` stages are rewritten like filters. A `$sort` on an encrypted
    /// field fails with `UnsupportedFilter`, since it would order by
    /// ciphertext. `$project`, `$skip`, `$limit` and `$count` pass through.
    /// Results are decrypted.
    pub fn aggregate(&self, ns: &Namespace, pipeline: &[Document]) -> Result<Vec<Document>> {
        let pipeline = match self.bound(ns) {
            Some((codec, schema)) => {
                for stage in pipeline {
                    check_stage(schema, stage)?;
                }
                let mut rewritten = Vec::with_capacity(pipeline.len());
                for stage in pipeline {
                    let mut stage = stage.clone();
                    if let Some(Value::Object(filter)) = stage.get("$match") {
                        let filter = encrypt_filter(codec, schema, filter)?;
                        stage.insert("$match".into(), Value::Object(filter));
                    }
                    rewritten.push(stage);
                }
                rewritten
            }
            None => pipeline.to_vec(),
        };
        let docs = self.store.aggregate(ns, &pipeline)?;
        docs.into_iter().map(|d| self.decrypt_document(d)).collect()
    }

    /// Consume the gateway. The store handle and the master key reference
    /// are released when it drops; this only marks the end of the session
    /// in the log.
    pub fn close(self) {
        info!(state = ?self.state(), "gateway closed");
    }

    // -----------------------------------------------------------------------
    // Transformation
    // -----------------------------------------------------------------------

    fn encrypt_document(&self, ns: &Namespace, mut doc: Document) -> Result<Document> {
        let Some((codec, schema)) = self.bound(ns) else {
            return Ok(doc);
        };
        let mut encrypted = 0;
        for (field, directive) in schema.iter() {
            if let Some(value) = doc.get_mut(field) {
                if codec::is_encrypted(value) {
                    continue;
                }
                *value = encrypt_field(codec, field, directive, value)?;
                encrypted += 1;
            }
        }
        debug!(namespace = %ns, encrypted, "document encrypted for write");
        Ok(doc)
    }

    fn decrypt_document(&self, doc: Document) -> Result<Document> {
        let Binding::Bound { codec, .. } = &self.binding else {
            return Ok(doc);
        };
        doc.into_iter()
            .map(|(k, v)| decrypt_value(codec, v).map(|v| (k, v)))
            .collect()
    }

    fn prepare_filter(&self, ns: &Namespace, filter: &Document) -> Result<Document> {
        match self.bound(ns) {
            Some((codec, schema)) => {
                check_filterable(schema, filter)?;
                encrypt_filter(codec, schema, filter)
            }
            None => Ok(filter.clone()),
        }
    }

    fn prepare_update(
        &self,
        ns: &Namespace,
        filter: &Document,
        update: &Document,
    ) -> Result<(Document, Document)> {
        let Some((codec, schema)) = self.bound(ns) else {
            return Ok((filter.clone(), update.clone()));
        };
        check_filterable(schema, filter)?;

        let mut rewritten = Document::new();
        for (op, fields) in update {
            let Value::Object(fields) = fields else {
                rewritten.insert(op.clone(), fields.clone());
                continue;
            };
            let mut out = Document::new();
            for (field, value) in fields {
                let value = match (schema.get(field), op.as_str()) {
                    (None, _) | (Some(_), "$unset") => value.clone(),
                    (Some(_), "$set") if codec::is_encrypted(value) => value.clone(),
                    (Some(d), "$set") => encrypt_field(codec, field, d, value)?,
                    (Some(_), other) => {
                        return Err(FieldVaultError::UnsupportedFilter(format!(
                            "{other} on encrypted field `{field}`"
                        )))
                    }
                };
                out.insert(field.clone(), value);
            }
            rewritten.insert(op.clone(), Value::Object(out));
        }

        Ok((encrypt_filter(codec, schema, filter)?, rewritten))
    }
}

fn encrypt_field<S: DocumentStore>(
    codec: &FieldCodec<S>,
    field: &str,
    directive: &EncryptDirective,
    value: &Value,
) -> Result<Value> {
    if !directive.bson_type.matches(value) {
        return Err(FieldVaultError::TypeMismatch {
            field: field.to_string(),
            expected: directive.bson_type.to_string(),
        });
    }
    codec.encrypt_as(value, directive.bson_type, directive.algorithm, &directive.key_id)
}

fn decrypt_value<S: DocumentStore>(codec: &FieldCodec<S>, value: Value) -> Result<Value> {
    if codec::is_encrypted(&value) {
        return codec.decrypt(&value);
    }
    match value {
        Value::Object(map) => map
            .into_iter()
            .map(|(k, v)| decrypt_value(codec, v).map(|v| (k, v)))
            .collect::<Result<Document>>()
            .map(Value::Object),
        Value::Array(items) => items
            .into_iter()
            .map(|v| decrypt_value(codec, v))
            .collect::<Result<Vec<_>>>()
            .map(Value::Array),
        other => Ok(other),
    }
}

/// The sub-filters of a logical operator, or `None` for any other key.
/// A logical operator whose argument is not an array of documents is an
/// error, never a silently narrowed filter.
fn logical_subfilters<'a>(key: &str, cond: &'a Value) -> Result<Option<Vec<&'a Document>>> {
    if !matches!(key, "$and" | "$or" | "$nor") {
        return Ok(None);
    }
    let malformed = || FieldVaultError::UnsupportedFilter(format!("{key} needs an array of documents"));
    cond.as_array()
        .ok_or_else(malformed)?
        .iter()
        .map(|sub| sub.as_object().ok_or_else(malformed))
        .collect::<Result<Vec<_>>>()
        .map(Some)
}

/// Reject any reference to a Random field. Runs before anything touches
/// the store or the key vault.
fn check_filterable(schema: &FieldSchema, filter: &Document) -> Result<()> {
    for (key, cond) in filter {
        if let Some(subs) = logical_subfilters(key, cond)? {
            for sub in subs {
                check_filterable(schema, sub)?;
            }
            continue;
        }
        if let Some(d) = schema.get(key) {
            if d.algorithm == Algorithm::Random {
                return Err(FieldVaultError::NonFilterableField(key.clone()));
            }
        }
    }
    Ok(())
}

/// Reject pipeline stages that cannot run over ciphertext.
fn check_stage(schema: &FieldSchema, stage: &Document) -> Result<()> {
    match stage.get("$match") {
        Some(Value::Object(filter)) => return check_filterable(schema, filter),
        Some(_) => return Err(FieldVaultError::UnsupportedFilter("$match needs a document".into())),
        None => {}
    }
    if let Some(Value::Object(keys)) = stage.get("$sort") {
        if let Some(field) = keys.keys().find(|k| schema.get(k).is_some()) {
            return Err(FieldVaultError::UnsupportedFilter(format!(
                "$sort on encrypted field `{field}`"
            )));
        }
    }
    Ok(())
}

/// Encrypt the values compared against Deterministic fields.
fn encrypt_filter<S: DocumentStore>(
    codec: &FieldCodec<S>,
    schema: &FieldSchema,
    filter: &Document,
) -> Result<Document> {
    let mut out = Document::new();
    for (key, cond) in filter {
        let rewritten = if let Some(subs) = logical_subfilters(key, cond)? {
            let subs = subs
                .into_iter()
                .map(|sub| encrypt_filter(codec, schema, sub).map(Value::Object))
                .collect::<Result<Vec<_>>>()?;
            Value::Array(subs)
        } else if let Some(d) = schema.get(key) {
            encrypt_condition(codec, key, d, cond)?
        } else {
            cond.clone()
        };
        out.insert(key.clone(), rewritten);
    }
    Ok(out)
}

fn encrypt_condition<S: DocumentStore>(
    codec: &FieldCodec<S>,
    field: &str,
    directive: &EncryptDirective,
    cond: &Value,
) -> Result<Value> {
    let Some(ops) = cond.as_object().filter(|_| is_operator_document(cond)) else {
        return encrypt_operand(codec, field, directive, cond);
    };

    let mut out = Document::new();
    for (op, arg) in ops {
        let value = match op.as_str() {
            "$eq" | "$ne" => encrypt_operand(codec, field, directive, arg)?,
            "$in" | "$nin" => {
                let Value::Array(items) = arg else {
                    return Err(FieldVaultError::UnsupportedFilter(format!(
                        "{op} on `{field}` needs an array"
                    )));
                };
                let items = items
                    .iter()
                    .map(|v| encrypt_operand(codec, field, directive, v))
                    .collect::<Result<Vec<_>>>()?;
                Value::Array(items)
            }
            "$exists" => arg.clone(),
            other => {
                return Err(FieldVaultError::UnsupportedFilter(format!(
                    "{other} on encrypted field `{field}`"
                )))
            }
        };
        out.insert(op.clone(), value);
    }
    Ok(Value::Object(out))
}

/// Null matches a missing field and is left alone.
fn encrypt_operand<S: DocumentStore>(
    codec: &FieldCodec<S>,
    field: &str,
    directive: &EncryptDirective,
    value: &Value,
) -> Result<Value> {
    if value.is_null() || codec::is_encrypted(value) {
        return Ok(value.clone());
    }
    encrypt_field(codec, field, directive, value)
}
