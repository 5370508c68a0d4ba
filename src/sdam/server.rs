//! A single monitored server and the operations that run against it.

use std::{
    collections::HashMap,
    sync::{Arc, RwLock},
};

use futures_core::future::BoxFuture;
use futures_util::FutureExt;
use serde::Deserialize;

use crate::{
    bson::{doc, oid::ObjectId, Bson, Document},
    client::session::ClientSession,
    cmap::{
        conn::{
            command::{Command, RawCommandResponse},
            wire::{
                legacy::{
                    OpDelete, OpGetMore, OpInsert, OpKillCursors, OpQuery, OpUpdate, DeleteFlags,
                    InsertFlags, QueryFlags, UpdateFlags,
                },
                next_request_id, ResponseMessage,
            },
            Connection,
        },
        options::ConnectionPoolOptions,
        ConnectionPool,
    },
    cursor::{CursorClient, GetMoreRequest, QueryResponse, QuerySpec},
    error::{
        BulkWriteError, BulkWriteFailure, Error, ErrorKind, Result, WriteConcernError,
    },
    options::{Namespace, ServerAddress},
    results::{DeleteResult, InsertManyResult, UpdateResult},
    sdam::description::server::ServerDescription,
};

/// A handle to a server in the topology: its connection pool, the most recent
/// heartbeat-derived description of it, and the operations that can be run on it.
/// Returned by server selection.
#[derive(Debug)]
pub struct Server {
    pub(crate) address: ServerAddress,
    pool: ConnectionPool,
    description: RwLock<ServerDescription>,
}

impl Server {
    pub(crate) fn new(address: ServerAddress, options: ConnectionPoolOptions) -> Arc<Self> {
        Arc::new(Self {
            address: address.clone(),
            description: RwLock::new(ServerDescription::new(address.clone())),
            pool: ConnectionPool::new(address, options),
        })
    }

    pub(crate) fn address(&self) -> &ServerAddress {
        &self.address
    }

    /// The latest monitored view of this server.
    pub fn description(&self) -> ServerDescription {
        match self.description.read() {
            Ok(description) => description.clone(),
            Err(_) => ServerDescription::new(self.address.clone()),
        }
    }

    pub(crate) fn update_description(&self, description: ServerDescription) {
        if let Ok(mut current) = self.description.write() {
            *current = description;
        }
    }

    pub(crate) async fn pool_generation(&self) -> u32 {
        self.pool.generation().await
    }

    /// Invalidates the pooled connections, e.g. after a network error indicated the server
    /// went away.
    pub(crate) async fn clear_pool(&self) {
        self.pool.clear().await;
    }

    pub(crate) async fn close(&self) {
        self.pool.close().await;
    }

    async fn connection(&self) -> Result<Arc<Connection>> {
        self.pool.check_out().await
    }

    /// Runs a command on this server and returns the raw response. The response is not
    /// checked for a command-level error.
    pub(crate) async fn run_command_raw(&self, command: Command) -> Result<RawCommandResponse> {
        let connection = self.connection().await?;
        connection.send_command(command).await
    }

    /// Runs a command and fails on command-level errors.
    pub(crate) async fn run_command(&self, command: Command) -> Result<RawCommandResponse> {
        let response = self.run_command_raw(command).await?;
        response.command_error()?;
        Ok(response)
    }

    /// Runs a command with a session attached.
    pub(crate) async fn run_command_with_session(
        &self,
        mut command: Command,
        session: &mut ClientSession,
    ) -> Result<RawCommandResponse> {
        session.apply_to_command(&mut command);
        let result = self.run_command(command).await;
        if let Err(error) = &result {
            if error.is_network_error() {
                session.mark_dirty();
            }
        }
        result
    }

    /// Inserts a batch of documents. Documents without an `_id` get a driver-generated
    /// ObjectId, so the returned map always has an id for every index.
    pub(crate) async fn insert(
        &self,
        namespace: &Namespace,
        documents: Vec<Document>,
        ordered: bool,
        session: Option<&mut ClientSession>,
        txn_number: Option<i64>,
    ) -> Result<InsertManyResult> {
        if documents.is_empty() {
            return Err(Error::invalid_argument("cannot insert an empty batch"));
        }

        let mut inserted_ids = HashMap::new();
        let documents: Vec<Document> = documents
            .into_iter()
            .enumerate()
            .map(|(index, mut document)| {
                let id = document
                    .get("_id")
                    .cloned()
                    .unwrap_or_else(|| Bson::ObjectId(ObjectId::new()));
                document.insert("_id", id.clone());
                inserted_ids.insert(index, id);
                document
            })
            .collect();

        let connection = self.connection().await?;
        if !connection.stream_description()?.supports_op_msg() {
            self.legacy_write(
                &connection,
                OpInsert {
                    namespace: namespace.to_string(),
                    flags: if ordered {
                        InsertFlags::empty()
                    } else {
                        InsertFlags::CONTINUE_ON_ERROR
                    },
                    documents,
                }
                .encode(
                    next_request_id(),
                    connection.stream_description()?.max_bson_object_size,
                )?,
                namespace,
            )
            .await?;
            return Ok(InsertManyResult { inserted_ids });
        }

        let mut command = Command::new(
            "insert",
            namespace.db.clone(),
            doc! { "insert": namespace.coll.clone(), "ordered": ordered },
        );
        command.add_document_sequence("documents", &documents)?;
        self.attach_write_session(&connection, &mut command, session, txn_number)?;

        let response = self.send_write(&connection, command).await?;
        let body: WriteResponseBody = response.body()?;
        body.validate(&response)?;

        Ok(InsertManyResult { inserted_ids })
    }

    pub(crate) async fn update(
        &self,
        namespace: &Namespace,
        filter: Document,
        update: Document,
        upsert: bool,
        multi: bool,
        session: Option<&mut ClientSession>,
        txn_number: Option<i64>,
    ) -> Result<UpdateResult> {
        let connection = self.connection().await?;
        if !connection.stream_description()?.supports_op_msg() {
            let mut flags = UpdateFlags::empty();
            if upsert {
                flags |= UpdateFlags::UPSERT;
            }
            if multi {
                flags |= UpdateFlags::MULTI_UPDATE;
            }
            let gle = self
                .legacy_write(
                    &connection,
                    OpUpdate {
                        namespace: namespace.to_string(),
                        flags,
                        selector: filter,
                        update,
                    }
                    .encode(
                        next_request_id(),
                        connection.stream_description()?.max_bson_object_size,
                    )?,
                    namespace,
                )
                .await?;
            let matched = gle.get_i64("n").or_else(|_| gle.get_i32("n").map(i64::from)).unwrap_or(0);
            let upserted_id = gle.get("upserted").cloned();
            return Ok(UpdateResult {
                matched_count: if upserted_id.is_some() { 0 } else { matched.max(0) as u64 },
                modified_count: matched.max(0) as u64,
                upserted_id,
            });
        }

        let mut command = Command::new(
            "update",
            namespace.db.clone(),
            doc! { "update": namespace.coll.clone() },
        );
        command.add_document_sequence(
            "updates",
            &[doc! { "q": filter, "u": update, "upsert": upsert, "multi": multi }],
        )?;
        self.attach_write_session(&connection, &mut command, session, txn_number)?;

        let response = self.send_write(&connection, command).await?;
        let body: UpdateResponseBody = response.body()?;
        body.write.validate(&response)?;

        let upserted_id = body
            .upserted
            .and_then(|upserted| upserted.into_iter().next())
            .map(|upserted| upserted.id);
        let matched_count = if upserted_id.is_some() { 0 } else { body.write.n };
        Ok(UpdateResult {
            matched_count,
            modified_count: body.n_modified,
            upserted_id,
        })
    }

    pub(crate) async fn delete(
        &self,
        namespace: &Namespace,
        filter: Document,
        multi: bool,
        session: Option<&mut ClientSession>,
        txn_number: Option<i64>,
    ) -> Result<DeleteResult> {
        let connection = self.connection().await?;
        if !connection.stream_description()?.supports_op_msg() {
            let flags = if multi {
                DeleteFlags::empty()
            } else {
                DeleteFlags::SINGLE_REMOVE
            };
            let gle = self
                .legacy_write(
                    &connection,
                    OpDelete {
                        namespace: namespace.to_string(),
                        flags,
                        selector: filter,
                    }
                    .encode(
                        next_request_id(),
                        connection.stream_description()?.max_bson_object_size,
                    )?,
                    namespace,
                )
                .await?;
            let deleted = gle.get_i64("n").or_else(|_| gle.get_i32("n").map(i64::from)).unwrap_or(0);
            return Ok(DeleteResult {
                deleted_count: deleted.max(0) as u64,
            });
        }

        let mut command = Command::new(
            "delete",
            namespace.db.clone(),
            doc! { "delete": namespace.coll.clone() },
        );
        command.add_document_sequence(
            "deletes",
            &[doc! { "q": filter, "limit": if multi { 0_i32 } else { 1_i32 } }],
        )?;
        self.attach_write_session(&connection, &mut command, session, txn_number)?;

        let response = self.send_write(&connection, command).await?;
        let body: WriteResponseBody = response.body()?;
        body.validate(&response)?;

        Ok(DeleteResult {
            deleted_count: body.n,
        })
    }

    fn attach_write_session(
        &self,
        connection: &Connection,
        command: &mut Command,
        session: Option<&mut ClientSession>,
        txn_number: Option<i64>,
    ) -> Result<()> {
        if let Some(session) = session {
            session.apply_to_command(command);
            // A retryable write's number overrides the one the session applied, if any.
            if let Some(txn_number) = txn_number {
                if !session.is_in_transaction()
                    && connection.stream_description()?.supports_retryable_writes()
                {
                    command.set_txn_number(txn_number);
                }
            }
        }
        Ok(())
    }

    async fn send_write(
        &self,
        connection: &Connection,
        command: Command,
    ) -> Result<RawCommandResponse> {
        let response = connection.send_command(command).await?;
        response.command_error()?;
        Ok(response)
    }

    /// Sends a legacy fire-and-forget write followed by getLastError on the same
    /// connection, returning the getLastError document.
    async fn legacy_write(
        &self,
        connection: &Connection,
        frame: Vec<u8>,
        namespace: &Namespace,
    ) -> Result<Document> {
        connection.send_frame_without_reply(frame).await?;

        let gle = Command::new(
            "getLastError",
            namespace.db.clone(),
            doc! { "getLastError": 1 },
        );
        let response = connection.send_command(gle).await?;
        response.command_error()?;
        let document = response.document()?;

        if let Ok(err) = document.get_str("err") {
            if !err.is_empty() {
                let code = document.get_i32("code").unwrap_or(0);
                return Err(ErrorKind::BulkWrite(BulkWriteFailure {
                    write_errors: vec![BulkWriteError {
                        index: 0,
                        code,
                        message: err.to_string(),
                    }],
                    write_concern_error: None,
                    successful_writes: 0,
                })
                .into());
            }
        }
        Ok(document)
    }
}

/// The shared shape of write command responses.
#[derive(Debug, Deserialize)]
struct WriteResponseBody {
    #[serde(default)]
    n: u64,

    #[serde(rename = "writeErrors", default)]
    write_errors: Option<Vec<BulkWriteError>>,

    #[serde(rename = "writeConcernError", default)]
    write_concern_error: Option<WriteConcernError>,
}

impl WriteResponseBody {
    /// Converts item-level failures reported in an `ok: 1` response into an error.
    fn validate(&self, response: &RawCommandResponse) -> Result<()> {
        let write_errors = self.write_errors.clone().unwrap_or_default();
        if write_errors.is_empty() && self.write_concern_error.is_none() {
            return Ok(());
        }

        let labels: Vec<String> = response
            .body::<LabelsBody>()
            .map(|body| body.error_labels)
            .unwrap_or_default();

        let mut error: Error = ErrorKind::BulkWrite(BulkWriteFailure {
            write_errors,
            write_concern_error: self.write_concern_error.clone(),
            successful_writes: self.n,
        })
        .into();
        for label in &labels {
            error = error.with_label(label);
        }
        Err(error)
    }
}

#[derive(Debug, Deserialize)]
struct UpdateResponseBody {
    #[serde(flatten)]
    write: WriteResponseBody,

    #[serde(rename = "nModified", default)]
    n_modified: u64,

    #[serde(default)]
    upserted: Option<Vec<UpsertedId>>,
}

#[derive(Debug, Deserialize)]
struct UpsertedId {
    #[serde(rename = "_id")]
    id: Bson,
}

#[derive(Debug, Deserialize)]
struct LabelsBody {
    #[serde(rename = "errorLabels", default)]
    error_labels: Vec<String>,
}

/// The `cursor` subdocument of find and getMore responses.
#[derive(Debug, Deserialize)]
struct CursorBody {
    cursor: CursorInfo,
}

#[derive(Debug, Deserialize)]
struct CursorInfo {
    id: i64,

    #[serde(rename = "firstBatch", default)]
    first_batch: Option<Vec<Document>>,

    #[serde(rename = "nextBatch", default)]
    next_batch: Option<Vec<Document>>,
}

impl CursorBody {
    fn into_response(self) -> QueryResponse {
        QueryResponse {
            cursor_id: self.cursor.id,
            documents: self
                .cursor
                .first_batch
                .or(self.cursor.next_batch)
                .unwrap_or_default(),
        }
    }
}

impl CursorClient for Server {
    /// Runs the initial query of a cursor: a find command against modern servers, an
    /// OP_QUERY against old ones.
    fn execute_query<'a>(&'a self, spec: &'a QuerySpec) -> BoxFuture<'a, Result<QueryResponse>> {
        async move {
            let connection = self.connection().await?;

            if !connection.stream_description()?.supports_op_msg() {
                let mut flags = QueryFlags::empty();
                if spec.tailable {
                    flags |= QueryFlags::TAILABLE_CURSOR;
                }
                if spec.await_data {
                    flags |= QueryFlags::AWAIT_DATA;
                }
                if spec.no_cursor_timeout {
                    flags |= QueryFlags::NO_CURSOR_TIMEOUT;
                }
                if spec.secondary_ok {
                    flags |= QueryFlags::SLAVE_OK;
                }

                let request_id = next_request_id();
                let frame = OpQuery {
                    namespace: spec.ns.to_string(),
                    flags,
                    number_to_skip: spec.skip.unwrap_or(0) as i32,
                    number_to_return: spec.initial_number_to_return(),
                    query: spec.filter.clone(),
                    projection: spec.projection.clone(),
                }
                .encode(
                    request_id,
                    connection.stream_description()?.max_bson_object_size,
                )?;
                return reply_to_response(connection.send_frame(request_id, frame).await?);
            }

            let mut body = doc! {
                "find": spec.ns.coll.clone(),
                "filter": spec.filter.clone(),
            };
            if let Some(projection) = &spec.projection {
                body.insert("projection", projection.clone());
            }
            if let Some(sort) = &spec.sort {
                body.insert("sort", sort.clone());
            }
            if let Some(skip) = spec.skip {
                body.insert("skip", skip);
            }
            if spec.limit > 0 {
                body.insert("limit", spec.limit);
            }
            if let Some(batch_size) = spec.effective_batch_size(0) {
                body.insert("batchSize", batch_size);
            }
            if spec.tailable {
                body.insert("tailable", true);
            }
            if spec.await_data {
                body.insert("awaitData", true);
            }
            if spec.no_cursor_timeout {
                body.insert("noCursorTimeout", true);
            }

            let command = Command::new("find", spec.ns.db.clone(), body);
            let response = connection.send_command(command).await?;
            response.command_error()?;
            initial_query_response(&response)
        }
        .boxed()
    }

    fn execute_get_more<'a>(
        &'a self,
        request: &'a GetMoreRequest,
    ) -> BoxFuture<'a, Result<QueryResponse>> {
        async move {
            let connection = self.connection().await?;

            if !connection.stream_description()?.supports_op_msg() {
                let request_id = next_request_id();
                let frame = OpGetMore {
                    namespace: request.ns.to_string(),
                    number_to_return: request.batch_size.unwrap_or(0),
                    cursor_id: request.cursor_id,
                }
                .encode(request_id)?;
                return reply_to_response(connection.send_frame(request_id, frame).await?);
            }

            let mut body = doc! {
                "getMore": request.cursor_id,
                "collection": request.ns.coll.clone(),
            };
            if let Some(batch_size) = request.batch_size {
                body.insert("batchSize", batch_size);
            }

            let command = Command::new("getMore", request.ns.db.clone(), body);
            let response = connection.send_command(command).await?;
            response.command_error()?;
            Ok(response.body::<CursorBody>()?.into_response())
        }
        .boxed()
    }

    fn execute_kill_cursors<'a>(
        &'a self,
        ns: &'a Namespace,
        cursor_id: i64,
    ) -> BoxFuture<'a, Result<()>> {
        async move {
            let connection = self.connection().await?;

            if !connection.stream_description()?.supports_op_msg() {
                let frame = OpKillCursors {
                    cursor_ids: vec![cursor_id],
                }
                .encode(next_request_id())?;
                // OP_KILL_CURSORS is never answered.
                return connection.send_frame_without_reply(frame).await;
            }

            let command = Command::new(
                "killCursors",
                ns.db.clone(),
                doc! { "killCursors": ns.coll.clone(), "cursors": [cursor_id] },
            );
            let response = connection.send_command(command).await?;
            response.command_error()
        }
        .boxed()
    }
}

/// Classifies the reply to a cursor-initiating command by shape, most specific first: a
/// `cursor` subdocument carries an id and batch; anything else is a plain single-document
/// result with no server-side cursor behind it.
fn initial_query_response(response: &RawCommandResponse) -> Result<QueryResponse> {
    let document = response.document()?;
    if document.get_document("cursor").is_ok() {
        return Ok(response.body::<CursorBody>()?.into_response());
    }
    Ok(QueryResponse {
        cursor_id: 0,
        documents: vec![document],
    })
}

fn reply_to_response(message: ResponseMessage) -> Result<QueryResponse> {
    match message {
        ResponseMessage::Reply(reply) => {
            use crate::cmap::conn::wire::ResponseFlags;
            if reply.response_flags.contains(ResponseFlags::CURSOR_NOT_FOUND) {
                return Err(cursor_not_found_error());
            }
            if reply.response_flags.contains(ResponseFlags::QUERY_FAILURE) {
                // from_reply turns the $err document into a command error.
                let error = match RawCommandResponse::from_reply(reply) {
                    Err(error) => error,
                    Ok(_) => Error::invalid_response("query failure without an error document"),
                };
                return Err(error);
            }
            Ok(QueryResponse {
                cursor_id: reply.cursor_id,
                documents: reply.documents()?,
            })
        }
        ResponseMessage::Msg(_) => Err(Error::invalid_response(
            "expected an OP_REPLY to a legacy operation",
        )),
    }
}

fn cursor_not_found_error() -> Error {
    ErrorKind::Command(crate::error::CommandError {
        code: 43,
        code_name: "CursorNotFound".to_string(),
        message: "cursor killed or timed out".to_string(),
        labels: Vec::new(),
    })
    .into()
}

#[cfg(test)]
mod test {
    use pretty_assertions::assert_eq;

    use super::*;
    use crate::cmap::conn::wire::{Reply, ResponseFlags};

    fn response(doc: Document) -> RawCommandResponse {
        RawCommandResponse::new(crate::bson::to_vec(&doc).unwrap())
    }

    #[test]
    fn cursor_subdocument_response_shape() {
        let raw = response(doc! {
            "ok": 1.0,
            "cursor": { "id": 42_i64, "firstBatch": [{ "a": 1 }, { "a": 2 }] },
        });
        let parsed = initial_query_response(&raw).unwrap();
        assert_eq!(parsed.cursor_id, 42);
        assert_eq!(parsed.documents, vec![doc! { "a": 1 }, doc! { "a": 2 }]);
    }

    #[test]
    fn plain_document_response_shape() {
        let body = doc! { "ok": 1.0, "values": ["x", "y"] };
        let parsed = initial_query_response(&response(body.clone())).unwrap();
        assert_eq!(parsed.cursor_id, 0);
        assert_eq!(parsed.documents, vec![body]);
    }

    #[test]
    fn legacy_inline_batch_response_shape() {
        let docs = [doc! { "a": 1 }, doc! { "b": 2 }];
        let reply = Reply {
            response_to: 1,
            response_flags: ResponseFlags::empty(),
            cursor_id: 77,
            starting_from: 0,
            number_returned: 2,
            document_bytes: docs
                .iter()
                .map(|doc| crate::bson::to_vec(doc).unwrap())
                .collect(),
        };
        let parsed = reply_to_response(ResponseMessage::Reply(reply)).unwrap();
        assert_eq!(parsed.cursor_id, 77);
        assert_eq!(parsed.documents, docs.to_vec());
    }

    #[test]
    fn kill_reply_listing_the_id_as_unknown_still_succeeds() {
        let raw = response(doc! {
            "ok": 1.0,
            "cursorsKilled": [],
            "cursorsNotFound": [],
            "cursorsUnknown": [55_i64],
        });
        // The kill path only checks command failure, not which array the id landed in.
        assert!(raw.command_error().is_ok());
    }
}
