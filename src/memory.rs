//! In-process document store.
//!
//! `MemoryStore` implements [`DocumentStore`] over shared, lock-protected
//! collections. Clones share state, like handles to one server. It also
//! enforces `$jsonSchema` encrypt validators the way a server does: a
//! document whose schema field is not an encrypted value of the declared
//! type is rejected, whichever client wrote it.

use std::cmp::Ordering;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering as AtomicOrdering};
use std::sync::{Arc, RwLock};

use serde_json::{json, Value};
use uuid::Uuid;

use crate::codec::BlobHeader;
use crate::document::{is_operator_document, Binary, BinarySubtype, Document, Namespace};
use crate::schema::FieldSchema;
use crate::store::{
    DeleteResult, DocumentStore, InsertManyResult, InsertOneResult, StoreError, UpdateResult,
};

#[derive(Default)]
struct Collection {
    docs: Vec<Document>,
    validator: Option<Document>,
    schema: Option<FieldSchema>,
}

struct Inner {
    collections: RwLock<BTreeMap<Namespace, Collection>>,
    available: AtomicBool,
    operations: AtomicU64,
}

/// A shared in-memory document store.
#[derive(Clone)]
pub struct MemoryStore {
    inner: Arc<Inner>,
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryStore {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Inner {
                collections: RwLock::new(BTreeMap::new()),
                available: AtomicBool::new(true),
                operations: AtomicU64::new(0),
            }),
        }
    }

    /// Simulate losing (or regaining) the connection. While unavailable,
    /// every operation fails with `StoreError::Unavailable`.
    pub fn set_available(&self, available: bool) {
        self.inner.available.store(available, AtomicOrdering::SeqCst);
    }

    /// Number of operations issued against this store so far.
    pub fn operation_count(&self) -> u64 {
        self.inner.operations.load(AtomicOrdering::SeqCst)
    }

    fn begin(&self) -> Result<(), StoreError> {
        self.inner.operations.fetch_add(1, AtomicOrdering::SeqCst);
        if self.inner.available.load(AtomicOrdering::SeqCst) {
            Ok(())
        } else {
            Err(StoreError::Unavailable("connection refused".into()))
        }
    }

    fn read<R>(&self, f: impl FnOnce(&BTreeMap<Namespace, Collection>) -> R) -> Result<R, StoreError> {
        let guard = self
            .inner
            .collections
            .read()
            .map_err(|_| StoreError::Unavailable("store lock poisoned".into()))?;
        Ok(f(&guard))
    }

    fn write<R>(
        &self,
        f: impl FnOnce(&mut BTreeMap<Namespace, Collection>) -> Result<R, StoreError>,
    ) -> Result<R, StoreError> {
        let mut guard = self
            .inner
            .collections
            .write()
            .map_err(|_| StoreError::Unavailable("store lock poisoned".into()))?;
        f(&mut guard)
    }

    fn update(
        &self,
        ns: &Namespace,
        filter: &Document,
        update: &Document,
        multi: bool,
    ) -> Result<UpdateResult, StoreError> {
        self.begin()?;
        self.write(|collections| {
            let Some(coll) = collections.get_mut(ns) else {
                return Ok(UpdateResult {
                    matched_count: 0,
                    modified_count: 0,
                });
            };

            // Stage every change first so a validation failure leaves the
            // collection untouched.
            let mut staged = Vec::new();
            for (idx, doc) in coll.docs.iter().enumerate() {
                if matches_filter(doc, filter)? {
                    let mut next = doc.clone();
                    apply_update(&mut next, update)?;
                    if let Some(schema) = &coll.schema {
                        validate(schema, &next)?;
                    }
                    staged.push((idx, next));
                    if !multi {
                        break;
                    }
                }
            }

            let matched_count = staged.len() as u64;
            let mut modified_count = 0;
            for (idx, next) in staged {
                if coll.docs[idx] != next {
                    coll.docs[idx] = next;
                    modified_count += 1;
                }
            }
            Ok(UpdateResult {
                matched_count,
                modified_count,
            })
        })
    }
}

impl DocumentStore for MemoryStore {
    fn insert_one(&self, ns: &Namespace, doc: Document) -> Result<InsertOneResult, StoreError> {
        let mut result = self.insert_many(ns, vec![doc])?;
        Ok(InsertOneResult {
            inserted_id: result.inserted_ids.pop().unwrap_or(Value::Null),
        })
    }

    fn insert_many(
        &self,
        ns: &Namespace,
        docs: Vec<Document>,
    ) -> Result<InsertManyResult, StoreError> {
        self.begin()?;
        self.write(|collections| {
            let coll = collections.entry(ns.clone()).or_default();

            let mut prepared = Vec::with_capacity(docs.len());
            for mut doc in docs {
                if !doc.contains_key("_id") {
                    doc.insert("_id".into(), json!(Uuid::new_v4().simple().to_string()));
                }
                if let Some(schema) = &coll.schema {
                    validate(schema, &doc)?;
                }
                prepared.push(doc);
            }

            let inserted_ids = prepared
                .iter()
                .map(|d| d.get("_id").cloned().unwrap_or(Value::Null))
                .collect();
            coll.docs.extend(prepared);
            Ok(InsertManyResult { inserted_ids })
        })
    }

    fn update_one(
        &self,
        ns: &Namespace,
        filter: &Document,
        update: &Document,
    ) -> Result<UpdateResult, StoreError> {
        self.update(ns, filter, update, false)
    }

    fn update_many(
        &self,
        ns: &Namespace,
        filter: &Document,
        update: &Document,
    ) -> Result<UpdateResult, StoreError> {
        self.update(ns, filter, update, true)
    }

    fn delete_many(&self, ns: &Namespace, filter: &Document) -> Result<DeleteResult, StoreError> {
        self.begin()?;
        self.write(|collections| {
            let Some(coll) = collections.get_mut(ns) else {
                return Ok(DeleteResult { deleted_count: 0 });
            };
            // Evaluate the whole filter first so a bad operator deletes nothing.
            let hits = coll
                .docs
                .iter()
                .map(|doc| matches_filter(doc, filter))
                .collect::<Result<Vec<_>, _>>()?;
            let mut hits = hits.into_iter();
            let before = coll.docs.len();
            coll.docs.retain(|_| !hits.next().unwrap_or(false));
            Ok(DeleteResult {
                deleted_count: (before - coll.docs.len()) as u64,
            })
        })
    }

    fn find(&self, ns: &Namespace, filter: &Document) -> Result<Vec<Document>, StoreError> {
        self.begin()?;
        self.read(|collections| {
            let Some(coll) = collections.get(ns) else {
                return Ok(Vec::new());
            };
            let mut out = Vec::new();
            for doc in &coll.docs {
                if matches_filter(doc, filter)? {
                    out.push(doc.clone());
                }
            }
            Ok(out)
        })?
    }

    fn aggregate(
        &self,
        ns: &Namespace,
        pipeline: &[Document],
    ) -> Result<Vec<Document>, StoreError> {
        self.begin()?;
        let docs = self.read(|collections| {
            collections
                .get(ns)
                .map(|c| c.docs.clone())
                .unwrap_or_default()
        })?;
        pipeline.iter().try_fold(docs, run_stage)
    }

    fn create_collection(
        &self,
        ns: &Namespace,
        validator: Option<Document>,
    ) -> Result<(), StoreError> {
        self.begin()?;
        let schema = match &validator {
            Some(v) => FieldSchema::from_validator(v)
                .map_err(|e| StoreError::ValidationFailed(format!("invalid validator: {e}")))?,
            None => None,
        };
        self.write(|collections| {
            if collections.contains_key(ns) {
                return Err(StoreError::NamespaceExists(ns.clone()));
            }
            collections.insert(
                ns.clone(),
                Collection {
                    docs: Vec::new(),
                    validator,
                    schema,
                },
            );
            Ok(())
        })
    }

    fn collection_validator(&self, ns: &Namespace) -> Result<Option<Document>, StoreError> {
        self.begin()?;
        self.read(|collections| collections.get(ns).and_then(|c| c.validator.clone()))
    }

    fn drop_database(&self, db: &str) -> Result<(), StoreError> {
        self.begin()?;
        self.write(|collections| {
            collections.retain(|ns, _| ns.db() != db);
            Ok(())
        })
    }
}

// ---------------------------------------------------------------------------
// Validation
// ---------------------------------------------------------------------------

fn validate(schema: &FieldSchema, doc: &Document) -> Result<(), StoreError> {
    for (field, directive) in schema.iter() {
        let Some(value) = doc.get(field) else {
            continue;
        };
        let header = Binary::from_value(value)
            .filter(|b| b.subtype == BinarySubtype::Encrypted)
            .and_then(|b| BlobHeader::parse(&b.bytes));
        let Some(header) = header else {
            return Err(StoreError::ValidationFailed(format!(
                "field `{field}` must be encrypted"
            )));
        };
        if header.bson_type != directive.bson_type || header.algorithm != directive.algorithm {
            return Err(StoreError::ValidationFailed(format!(
                "field `{field}` is not encrypted as {} {}",
                directive.algorithm, directive.bson_type
            )));
        }
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// Filters
// ---------------------------------------------------------------------------

fn lookup<'a>(doc: &'a Document, path: &str) -> Option<&'a Value> {
    let mut parts = path.split('.');
    let mut current = doc.get(parts.next()?)?;
    for part in parts {
        current = current.as_object()?.get(part)?;
    }
    Some(current)
}

fn compare_values(a: &Value, b: &Value) -> Option<Ordering> {
    match (a, b) {
        (Value::Number(a), Value::Number(b)) => a.as_f64()?.partial_cmp(&b.as_f64()?),
        (Value::String(a), Value::String(b)) => Some(a.cmp(b)),
        (Value::Bool(a), Value::Bool(b)) => Some(a.cmp(b)),
        _ => None,
    }
}

/// Equality with array-membership and missing-equals-null semantics.
fn value_eq(actual: Option<&Value>, expected: &Value) -> bool {
    match actual {
        None => expected.is_null(),
        Some(v) if v == expected => true,
        Some(Value::Array(items)) => items.iter().any(|i| i == expected),
        Some(Value::Number(a)) => match expected {
            Value::Number(b) => a.as_f64() == b.as_f64(),
            _ => false,
        },
        Some(_) => false,
    }
}

fn matches_filter(doc: &Document, filter: &Document) -> Result<bool, StoreError> {
    for (key, cond) in filter {
        let ok = match key.as_str() {
            "$and" | "$or" | "$nor" => {
                let Some(subs) = cond.as_array() else {
                    return Err(StoreError::UnsupportedOperator(format!("{key} needs an array")));
                };
                let mut results = Vec::with_capacity(subs.len());
                for sub in subs {
                    let Some(sub) = sub.as_object() else {
                        return Err(StoreError::UnsupportedOperator(format!(
                            "{key} entries must be documents"
                        )));
                    };
                    results.push(matches_filter(doc, sub)?);
                }
                match key.as_str() {
                    "$and" => results.iter().all(|r| *r),
                    "$or" => results.iter().any(|r| *r),
                    _ => !results.iter().any(|r| *r),
                }
            }
            op if op.starts_with('$') => return Err(StoreError::UnsupportedOperator(op.into())),
            field => matches_condition(lookup(doc, field), cond)?,
        };
        if !ok {
            return Ok(false);
        }
    }
    Ok(true)
}

fn matches_condition(actual: Option<&Value>, cond: &Value) -> Result<bool, StoreError> {
    let Some(ops) = cond.as_object().filter(|_| is_operator_document(cond)) else {
        return Ok(value_eq(actual, cond));
    };

    for (op, arg) in ops {
        let ok = match op.as_str() {
            "$eq" => value_eq(actual, arg),
            "$ne" => !value_eq(actual, arg),
            "$gt" | "$gte" | "$lt" | "$lte" => match actual.and_then(|a| compare_values(a, arg)) {
                Some(ord) => match op.as_str() {
                    "$gt" => ord == Ordering::Greater,
                    "$gte" => ord != Ordering::Less,
                    "$lt" => ord == Ordering::Less,
                    _ => ord != Ordering::Greater,
                },
                None => false,
            },
            "$in" | "$nin" => {
                let Some(options) = arg.as_array() else {
                    return Err(StoreError::UnsupportedOperator(format!("{op} needs an array")));
                };
                let hit = options.iter().any(|o| value_eq(actual, o));
                if op == "$in" {
                    hit
                } else {
                    !hit
                }
            }
            "$exists" => actual.is_some() == arg.as_bool().unwrap_or(true),
            other => return Err(StoreError::UnsupportedOperator(other.into())),
        };
        if !ok {
            return Ok(false);
        }
    }
    Ok(true)
}

// ---------------------------------------------------------------------------
// Updates
// ---------------------------------------------------------------------------

fn apply_update(doc: &mut Document, update: &Document) -> Result<(), StoreError> {
    if update.is_empty() || !update.keys().all(|k| k.starts_with('$')) {
        return Err(StoreError::InvalidUpdate(
            "update must contain only operators".into(),
        ));
    }
    for (op, fields) in update {
        let Some(fields) = fields.as_object() else {
            return Err(StoreError::InvalidUpdate(format!("{op} needs a document")));
        };
        for (field, value) in fields {
            if field == "_id" {
                return Err(StoreError::InvalidUpdate("_id is immutable".into()));
            }
            match op.as_str() {
                "$set" => {
                    doc.insert(field.clone(), value.clone());
                }
                "$unset" => {
                    doc.remove(field);
                }
                "$inc" => {
                    let current = doc.get(field).cloned().unwrap_or(json!(0));
                    doc.insert(field.clone(), increment(field, &current, value)?);
                }
                other => return Err(StoreError::InvalidUpdate(format!("unknown operator {other}"))),
            }
        }
    }
    Ok(())
}

fn increment(field: &str, current: &Value, by: &Value) -> Result<Value, StoreError> {
    let not_numeric = || StoreError::InvalidUpdate(format!("$inc on non-numeric field `{field}`"));
    if let (Some(a), Some(b)) = (current.as_i64(), by.as_i64()) {
        return a.checked_add(b).map(Value::from).ok_or_else(not_numeric);
    }
    match (current.as_f64(), by.as_f64()) {
        (Some(a), Some(b)) => Ok(json!(a + b)),
        _ => Err(not_numeric()),
    }
}

// ---------------------------------------------------------------------------
// Pipelines
// ---------------------------------------------------------------------------

fn stage_usize(stage: &str, arg: &Value) -> Result<usize, StoreError> {
    arg.as_u64()
        .map(|n| n as usize)
        .ok_or_else(|| StoreError::UnsupportedStage(format!("{stage} needs a non-negative integer")))
}

fn run_stage(docs: Vec<Document>, stage: &Document) -> Result<Vec<Document>, StoreError> {
    let mut entries = stage.iter();
    let (Some((name, arg)), None) = (entries.next(), entries.next()) else {
        return Err(StoreError::UnsupportedStage(
            "a stage must have exactly one operator".into(),
        ));
    };

    match name.as_str() {
        "$match" => {
            let filter = arg
                .as_object()
                .ok_or_else(|| StoreError::UnsupportedStage("$match needs a document".into()))?;
            let mut out = Vec::new();
            for doc in docs {
                if matches_filter(&doc, filter)? {
                    out.push(doc);
                }
            }
            Ok(out)
        }
        "$sort" => {
            let keys = arg
                .as_object()
                .ok_or_else(|| StoreError::UnsupportedStage("$sort needs a document".into()))?;
            let mut docs = docs;
            docs.sort_by(|a, b| {
                for (field, dir) in keys {
                    let ord = match (lookup(a, field), lookup(b, field)) {
                        (None, None) => Ordering::Equal,
                        (None, Some(_)) => Ordering::Less,
                        (Some(_), None) => Ordering::Greater,
                        (Some(x), Some(y)) => compare_values(x, y).unwrap_or(Ordering::Equal),
                    };
                    let ord = if dir.as_i64() == Some(-1) { ord.reverse() } else { ord };
                    if ord != Ordering::Equal {
                        return ord;
                    }
                }
                Ordering::Equal
            });
            Ok(docs)
        }
        "$skip" => Ok(docs.into_iter().skip(stage_usize(name, arg)?).collect()),
        "$limit" => Ok(docs.into_iter().take(stage_usize(name, arg)?).collect()),
        "$project" => {
            let spec = arg
                .as_object()
                .ok_or_else(|| StoreError::UnsupportedStage("$project needs a document".into()))?;
            Ok(docs.into_iter().map(|d| project(d, spec)).collect())
        }
        "$count" => {
            let field = arg
                .as_str()
                .ok_or_else(|| StoreError::UnsupportedStage("$count needs a field name".into()))?;
            let mut out = Document::new();
            out.insert(field.to_string(), json!(docs.len()));
            Ok(vec![out])
        }
        other => Err(StoreError::UnsupportedStage(other.into())),
    }
}

fn truthy(v: &Value) -> bool {
    match v {
        Value::Bool(b) => *b,
        Value::Number(n) => n.as_f64().map(|f| f != 0.0).unwrap_or(false),
        _ => false,
    }
}

fn project(doc: Document, spec: &Document) -> Document {
    let inclusive = spec.iter().any(|(k, v)| k != "_id" && truthy(v));
    let keep_id = spec.get("_id").map(truthy).unwrap_or(true);

    doc.into_iter()
        .filter(|(k, _)| {
            if k == "_id" {
                keep_id
            } else if inclusive {
                spec.get(k).map(truthy).unwrap_or(false)
            } else {
                spec.get(k).map(truthy).unwrap_or(true)
            }
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ns() -> Namespace {
        Namespace::new("sample_mflix", "movies")
    }

    fn doc(v: Value) -> Document {
        v.as_object().unwrap().clone()
    }

    fn seeded() -> MemoryStore {
        let store = MemoryStore::new();
        store
            .insert_many(
                &ns(),
                vec![
                    doc(json!({"title": "Parasite", "year": 2020, "genres": ["Drama"]})),
                    doc(json!({"title": "Blacksmith Scene", "year": 1893})),
                    doc(json!({"title": "Roma", "year": 2018, "genres": ["Drama"]})),
                ],
            )
            .unwrap();
        store
    }

    #[test]
    fn test_insert_assigns_id() {
        let store = MemoryStore::new();
        let res = store.insert_one(&ns(), doc(json!({"title": "x"}))).unwrap();
        assert!(res.inserted_id.is_string());
        let found = store.find_one(&ns(), &doc(json!({"title": "x"}))).unwrap().unwrap();
        assert_eq!(found["_id"], res.inserted_id);
    }

    #[test]
    fn test_filter_operators() {
        let store = seeded();
        let count = |f: Value| store.find(&ns(), &doc(f)).unwrap().len();
        assert_eq!(count(json!({"year": {"$gte": 2018}})), 2);
        assert_eq!(count(json!({"genres": "Drama"})), 2);
        assert_eq!(count(json!({"title": {"$in": ["Roma", "Nope"]}})), 1);
        assert_eq!(count(json!({"genres": {"$exists": false}})), 1);
        assert_eq!(count(json!({"$or": [{"year": 1893}, {"title": "Roma"}]})), 2);
        assert_eq!(count(json!({"missing": null})), 3);
        assert!(store.find(&ns(), &doc(json!({"title": {"$regex": "R"}}))).is_err());
    }

    #[test]
    fn test_update_and_delete() {
        let store = seeded();
        let res = store
            .update_one(&ns(), &doc(json!({"title": "Parasite"})), &doc(json!({"$set": {"year": 2019}})))
            .unwrap();
        assert_eq!(res.modified_count, 1);
        let res = store
            .update_many(&ns(), &doc(json!({})), &doc(json!({"$inc": {"year": 1}})))
            .unwrap();
        assert_eq!(res.matched_count, 3);
        assert!(store.find_one(&ns(), &doc(json!({"year": 2020}))).unwrap().is_some());
        assert!(store
            .update_one(&ns(), &doc(json!({})), &doc(json!({"year": 1})))
            .is_err());

        let res = store.delete_many(&ns(), &doc(json!({"genres": "Drama"}))).unwrap();
        assert_eq!(res.deleted_count, 2);
    }

    #[test]
    fn test_failed_delete_leaves_collection_intact() {
        let store = seeded();
        assert!(matches!(
            store.delete_many(&ns(), &doc(json!({"title": {"$regex": "R"}}))),
            Err(StoreError::UnsupportedOperator(_))
        ));
        assert!(store
            .delete_many(&ns(), &doc(json!({"$nor": ["junk"]})))
            .is_err());
        assert_eq!(store.find(&ns(), &Document::new()).unwrap().len(), 3);
    }

    #[test]
    fn test_pipeline_stages() {
        let store = seeded();
        let pipeline = vec![
            doc(json!({"$match": {"year": {"$gt": 1900}}})),
            doc(json!({"$sort": {"year": -1}})),
            doc(json!({"$limit": 1})),
            doc(json!({"$project": {"_id": 0, "title": 1}})),
        ];
        let out = store.aggregate(&ns(), &pipeline).unwrap();
        assert_eq!(out, vec![doc(json!({"title": "Parasite"}))]);

        let counted = store.aggregate(&ns(), &[doc(json!({"$count": "n"}))]).unwrap();
        assert_eq!(counted[0]["n"], 3);
        assert!(store.aggregate(&ns(), &[doc(json!({"$group": {}}))]).is_err());
    }

    #[test]
    fn test_unavailable_store_fails_and_counts() {
        let store = seeded();
        let before = store.operation_count();
        store.set_available(false);
        assert!(matches!(
            store.find(&ns(), &Document::new()),
            Err(StoreError::Unavailable(_))
        ));
        assert_eq!(store.operation_count(), before + 1);
    }

    #[test]
    fn test_drop_database_and_duplicate_create() {
        let store = seeded();
        assert!(matches!(
            store.create_collection(&ns(), None),
            Err(StoreError::NamespaceExists(_))
        ));
        store.drop_database("sample_mflix").unwrap();
        assert!(store.find(&ns(), &Document::new()).unwrap().is_empty());
        store.create_collection(&ns(), None).unwrap();
    }
}
