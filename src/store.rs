//! The document-store collaborator.
//!
//! `DocumentStore` is the surface fieldvault consumes from a document
//! database client. Every method takes `&self`: a store is a cheap handle to
//! a shared connection, and clones of it address the same data.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

use crate::document::{Document, Namespace};

/// Errors raised by a document store.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum StoreError {
    /// The store could not be reached.
    #[error("store unavailable: {0}")]
    Unavailable(String),

    /// A collection validator rejected the document.
    #[error("document failed validation: {0}")]
    ValidationFailed(String),

    /// The update document was malformed.
    #[error("invalid update: {0}")]
    InvalidUpdate(String),

    /// A filter used an operator the store does not implement.
    #[error("unsupported query operator: {0}")]
    UnsupportedOperator(String),

    /// A pipeline used a stage the store does not implement.
    #[error("unsupported pipeline stage: {0}")]
    UnsupportedStage(String),

    /// A collection already exists where a new one was requested.
    #[error("namespace already exists: {0}")]
    NamespaceExists(Namespace),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InsertOneResult {
    pub inserted_id: Value,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InsertManyResult {
    pub inserted_ids: Vec<Value>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct UpdateResult {
    pub matched_count: u64,
    pub modified_count: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeleteResult {
    pub deleted_count: u64,
}

/// A document database client.
///
/// Filters use the usual query-document form (`{"field": value}`,
/// `{"field": {"$in": [..]}}`, `{"$or": [..]}`); updates use operator
/// documents (`{"$set": {..}}`); pipelines are a list of stage documents.
pub trait DocumentStore {
    fn insert_one(&self, ns: &Namespace, doc: Document) -> Result<InsertOneResult, StoreError>;

    fn insert_many(
        &self,
        ns: &Namespace,
        docs: Vec<Document>,
    ) -> Result<InsertManyResult, StoreError>;

    fn update_one(
        &self,
        ns: &Namespace,
        filter: &Document,
        update: &Document,
    ) -> Result<UpdateResult, StoreError>;

    fn update_many(
        &self,
        ns: &Namespace,
        filter: &Document,
        update: &Document,
    ) -> Result<UpdateResult, StoreError>;

    fn delete_many(&self, ns: &Namespace, filter: &Document) -> Result<DeleteResult, StoreError>;

    fn find(&self, ns: &Namespace, filter: &Document) -> Result<Vec<Document>, StoreError>;

    fn find_one(&self, ns: &Namespace, filter: &Document) -> Result<Option<Document>, StoreError> {
        Ok(self.find(ns, filter)?.into_iter().next())
    }

    fn aggregate(&self, ns: &Namespace, pipeline: &[Document])
        -> Result<Vec<Document>, StoreError>;

    /// Create a collection, optionally with a validator document
    /// (`{"$jsonSchema": {..}}`).
    fn create_collection(
        &self,
        ns: &Namespace,
        validator: Option<Document>,
    ) -> Result<(), StoreError>;

    /// The validator a collection was created with, if any.
    fn collection_validator(&self, ns: &Namespace) -> Result<Option<Document>, StoreError>;

    /// Drop a database and every collection in it.
    fn drop_database(&self, db: &str) -> Result<(), StoreError>;
}
