//! Client-side cursors over server-side result sets.
//!
//! A [`Cursor`] wraps a 64-bit server-side cursor id and a locally buffered batch of
//! documents. The first call to [`Cursor::next`] runs the initiating query; subsequent
//! calls drain the buffer and issue getMore operations until the server reports a zero
//! cursor id. Construction is free of I/O, so a cursor can be built eagerly and driven
//! lazily.

use std::{collections::VecDeque, sync::Arc};

use futures_core::future::BoxFuture;
use typed_builder::TypedBuilder;

use crate::{
    bson::Document,
    error::{CommandError, Error, ErrorKind, Result},
    options::Namespace,
};

/// The operations a cursor needs from the server it was opened against.
///
/// `Server` is the production implementation; tests substitute scripted ones.
pub trait CursorClient: Send + Sync {
    /// Runs the initiating query and returns the first batch.
    fn execute_query<'a>(&'a self, spec: &'a QuerySpec) -> BoxFuture<'a, Result<QueryResponse>>;

    /// Retrieves the next batch of an open cursor.
    fn execute_get_more<'a>(
        &'a self,
        request: &'a GetMoreRequest,
    ) -> BoxFuture<'a, Result<QueryResponse>>;

    /// Closes a server-side cursor.
    fn execute_kill_cursors<'a>(
        &'a self,
        ns: &'a Namespace,
        cursor_id: i64,
    ) -> BoxFuture<'a, Result<()>>;
}

/// The parameters of a cursor-initiating query.
#[derive(Clone, Debug, TypedBuilder)]
#[builder(field_defaults(default))]
pub struct QuerySpec {
    #[builder(!default)]
    pub(crate) ns: Namespace,

    #[builder(!default)]
    pub(crate) filter: Document,

    pub(crate) projection: Option<Document>,

    pub(crate) sort: Option<Document>,

    pub(crate) skip: Option<i64>,

    /// Zero means no limit. A negative limit requests a single batch of that size and
    /// closes the server-side cursor (legacy framing only).
    pub(crate) limit: i64,

    pub(crate) batch_size: Option<i32>,

    pub(crate) tailable: bool,

    pub(crate) await_data: bool,

    pub(crate) no_cursor_timeout: bool,

    pub(crate) secondary_ok: bool,
}

impl QuerySpec {
    /// The `numberToReturn` of the initiating OP_QUERY.
    pub(crate) fn initial_number_to_return(&self) -> i32 {
        let batch_size = self.batch_size.unwrap_or(0);
        if self.limit < 0 {
            self.limit as i32
        } else if self.limit != 0 && self.limit < i64::from(batch_size) {
            self.limit as i32
        } else {
            batch_size
        }
    }

    /// The batch size for the next retrieval, clamped so that a positive limit is never
    /// overshot.
    pub(crate) fn effective_batch_size(&self, yielded: u64) -> Option<i32> {
        if self.limit > 0 {
            let remaining = (self.limit - yielded as i64).max(0);
            match self.batch_size {
                Some(batch_size) if i64::from(batch_size) <= remaining => Some(batch_size),
                _ => Some(remaining as i32),
            }
        } else {
            self.batch_size
        }
    }
}

/// A getMore against an open cursor.
#[derive(Clone, Debug)]
pub struct GetMoreRequest {
    pub(crate) ns: Namespace,
    pub(crate) cursor_id: i64,
    pub(crate) batch_size: Option<i32>,
}

/// One batch of a result set, as returned by a query or getMore in either framing.
#[derive(Clone, Debug)]
pub struct QueryResponse {
    /// Zero once the server-side cursor is exhausted.
    pub(crate) cursor_id: i64,
    pub(crate) documents: Vec<Document>,
}

#[derive(Clone, Copy, Debug, PartialEq)]
enum CursorStatus {
    /// The initiating query has not been sent.
    Uninitialized,

    /// The query succeeded; the server-side cursor may still be live.
    Open,

    /// The server-side cursor is gone (killed, errored, or reported id zero), but the
    /// caller has not observed the end of the stream yet.
    Dead,

    /// The caller has been handed the end of the stream or a terminal error. Any further
    /// `next` is a usage error.
    Notified,
}

/// A cursor over a server-side result set.
#[derive(Debug)]
pub struct Cursor<C: CursorClient> {
    client: Arc<C>,
    spec: QuerySpec,
    status: CursorStatus,
    cursor_id: i64,
    buffer: VecDeque<Document>,
    yielded: u64,
}

impl<C: CursorClient> Cursor<C> {
    pub fn new(client: Arc<C>, spec: QuerySpec) -> Self {
        Self {
            client,
            spec,
            status: CursorStatus::Uninitialized,
            cursor_id: 0,
            buffer: VecDeque::new(),
            yielded: 0,
        }
    }

    /// Resumes iteration of a cursor already opened on the server, e.g. the one returned
    /// in the first batch of an aggregate run elsewhere.
    pub fn from_existing(client: Arc<C>, spec: QuerySpec, cursor_id: i64) -> Self {
        Self {
            client,
            spec,
            status: CursorStatus::Open,
            cursor_id,
            buffer: VecDeque::new(),
            yielded: 0,
        }
    }

    /// The server-side cursor id. Zero before initialization and after exhaustion.
    pub fn id(&self) -> i64 {
        self.cursor_id
    }

    pub fn is_dead(&self) -> bool {
        matches!(self.status, CursorStatus::Dead | CursorStatus::Notified)
    }

    /// The number of documents buffered locally and retrievable without I/O.
    pub fn buffered_count(&self) -> usize {
        self.buffer.len()
    }

    /// Advances to the next document, running the initiating query or a getMore as
    /// needed. `Ok(None)` signals normal exhaustion exactly once; calling again after
    /// that is an error.
    ///
    /// On a tailable cursor a drained batch is reported as a transient error and the
    /// cursor stays live, so the caller can poll again.
    pub async fn next(&mut self) -> Result<Option<Document>> {
        if self.status == CursorStatus::Notified {
            return Err(Error::invalid_state("cursor is exhausted"));
        }

        loop {
            if self.limit_reached() {
                self.kill().await?;
                self.status = CursorStatus::Notified;
                return Ok(None);
            }

            if let Some(document) = self.buffer.pop_front() {
                self.yielded += 1;
                return Ok(Some(document));
            }

            match self.status {
                CursorStatus::Uninitialized => {
                    let response = self.client.execute_query(&self.spec).await?;
                    self.status = CursorStatus::Open;
                    self.absorb(response).await?;

                    if self.cursor_id == 0 && self.buffer.is_empty() && !self.spec.tailable {
                        // The query matched nothing.
                        self.status = CursorStatus::Notified;
                        return Ok(None);
                    }
                }
                CursorStatus::Open if self.cursor_id != 0 => {
                    let request = GetMoreRequest {
                        ns: self.spec.ns.clone(),
                        cursor_id: self.cursor_id,
                        batch_size: self.spec.effective_batch_size(self.yielded),
                    };
                    let response = self.client.execute_get_more(&request).await?;
                    self.absorb(response).await?;

                    if self.buffer.is_empty() {
                        if self.spec.tailable {
                            return Err(Error::invalid_state(
                                "no more documents in tailed cursor",
                            ));
                        }
                        if self.cursor_id == 0 {
                            self.status = CursorStatus::Notified;
                            return Ok(None);
                        }
                    }
                }
                CursorStatus::Open => {
                    // Id zero with a drained buffer.
                    if self.spec.tailable {
                        return Err(Error::invalid_state("no more documents in tailed cursor"));
                    }
                    self.status = CursorStatus::Notified;
                    return Ok(None);
                }
                CursorStatus::Dead => {
                    self.status = CursorStatus::Notified;
                    return Ok(None);
                }
                CursorStatus::Notified => {
                    return Err(Error::invalid_state("cursor is exhausted"));
                }
            }
        }
    }

    /// Drains up to `count` locally buffered documents without issuing any I/O, except
    /// for the kill sent when a positive limit is reached mid-buffer.
    pub async fn read_buffered(&mut self, count: usize) -> Result<Vec<Document>> {
        let mut count = count.min(self.buffer.len());
        if self.spec.limit > 0 {
            let remaining = (self.spec.limit as u64).saturating_sub(self.yielded) as usize;
            count = count.min(remaining);
        }

        let documents: Vec<Document> = self.buffer.drain(..count).collect();
        self.yielded += documents.len() as u64;

        if self.limit_reached() {
            self.kill().await?;
        }
        Ok(documents)
    }

    /// Closes the server-side cursor if one is live. Killing a dead or never-initialized
    /// cursor is a no-op.
    pub async fn kill(&mut self) -> Result<()> {
        if self.status != CursorStatus::Open {
            return Ok(());
        }
        self.status = CursorStatus::Dead;

        let cursor_id = std::mem::take(&mut self.cursor_id);
        if cursor_id != 0 {
            self.client
                .execute_kill_cursors(&self.spec.ns, cursor_id)
                .await?;
        }
        Ok(())
    }

    /// Restores the cursor to its uninitialized state, killing the server-side cursor
    /// first if one is live, so the same query can be re-issued from scratch.
    pub async fn rewind(&mut self) -> Result<()> {
        self.kill().await?;
        self.status = CursorStatus::Uninitialized;
        self.cursor_id = 0;
        self.buffer.clear();
        self.yielded = 0;
        Ok(())
    }

    fn limit_reached(&self) -> bool {
        self.spec.limit > 0 && self.yielded >= self.spec.limit as u64
    }

    /// Takes over a response's cursor id and batch. A `$err` document is an in-band
    /// query failure: the cursor is killed and the error surfaced as a command error.
    async fn absorb(&mut self, response: QueryResponse) -> Result<()> {
        self.cursor_id = response.cursor_id;

        if let Some(document) = response.documents.first() {
            if document.contains_key("$err") {
                let message = document
                    .get_str("$err")
                    .unwrap_or("unknown query failure")
                    .to_string();
                let code = document.get_i32("code").ok();

                let _ = self.kill().await;
                self.status = CursorStatus::Notified;
                return Err(ErrorKind::Command(CommandError::from_legacy_err(message, code)).into());
            }
        }

        self.buffer = response.documents.into();
        Ok(())
    }
}
