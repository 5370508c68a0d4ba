//! The results of write operations.

use std::collections::HashMap;

use crate::bson::Bson;

/// The result of an insert of multiple documents.
#[derive(Clone, Debug, Default)]
#[non_exhaustive]
pub struct InsertManyResult {
    /// The `_id` values of the inserted documents, keyed by their index in the input
    /// batch. Ids are generated by the driver when the documents do not carry one.
    pub inserted_ids: HashMap<usize, Bson>,
}

/// The result of an update operation.
#[derive(Clone, Debug, Default)]
#[non_exhaustive]
pub struct UpdateResult {
    /// The number of documents that matched the filter.
    pub matched_count: u64,

    /// The number of documents that were modified.
    pub modified_count: u64,

    /// The `_id` of the document inserted by an upsert, if one happened.
    pub upserted_id: Option<Bson>,
}

/// The result of a delete operation.
#[derive(Clone, Debug, Default)]
#[non_exhaustive]
pub struct DeleteResult {
    /// The number of documents deleted.
    pub deleted_count: u64,
}
