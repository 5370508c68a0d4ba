//! Database commands as sent over the wire, and the raw responses that come back.

use serde::de::DeserializeOwned;

use super::wire::{DocumentSequence, Message, Reply, ResponseFlags};
use crate::{
    bson::{Bson, Document},
    error::{CommandError, Error, ErrorKind, Result},
    selection_criteria::ReadPreference,
};

/// A command to be sent to the server. The `$db` field and any session or transaction
/// fields are folded into the body before encoding.
#[derive(Clone, Debug)]
pub(crate) struct Command {
    pub(crate) name: String,
    pub(crate) target_db: String,
    pub(crate) body: Document,
    pub(crate) exhaust_allowed: bool,
    pub(crate) document_sequences: Vec<DocumentSequence>,
}

impl Command {
    pub(crate) fn new(
        name: impl Into<String>,
        target_db: impl Into<String>,
        body: Document,
    ) -> Self {
        Self {
            name: name.into(),
            target_db: target_db.into(),
            body,
            exhaust_allowed: false,
            document_sequences: Vec::new(),
        }
    }

    pub(crate) fn set_session_id(&mut self, lsid: Document) {
        self.body.insert("lsid", lsid);
    }

    pub(crate) fn set_txn_number(&mut self, txn_number: i64) {
        self.body.insert("txnNumber", txn_number);
    }

    pub(crate) fn set_start_transaction(&mut self) {
        self.body.insert("startTransaction", true);
    }

    pub(crate) fn set_autocommit(&mut self) {
        self.body.insert("autocommit", false);
    }

    pub(crate) fn set_read_preference(&mut self, read_preference: &ReadPreference) {
        self.body
            .insert("$readPreference", read_preference.to_document());
    }

    /// Moves a batch of documents out of the body and into a payload type 1 section.
    pub(crate) fn add_document_sequence(
        &mut self,
        identifier: impl Into<String>,
        documents: &[Document],
    ) -> Result<()> {
        self.document_sequences
            .push(DocumentSequence::new(identifier, documents)?);
        Ok(())
    }

    /// The body as it goes on the wire, with `$db` appended.
    pub(crate) fn body_with_db(&self) -> Document {
        let mut body = self.body.clone();
        body.insert("$db", self.target_db.clone());
        body
    }
}

/// A response to a command, kept as raw BSON. Parsing is deferred and idempotent: callers
/// can deserialize the same bytes into different shapes without re-reading the socket.
#[derive(Clone, Debug)]
pub(crate) struct RawCommandResponse {
    source: Vec<u8>,
}

impl RawCommandResponse {
    pub(crate) fn new(source: Vec<u8>) -> Self {
        Self { source }
    }

    pub(crate) fn from_msg(message: Message) -> Self {
        Self {
            source: message.document_payload,
        }
    }

    /// Converts a legacy OP_REPLY into a command response. A reply carrying the
    /// queryFailure flag holds a single `$err` document instead of a command result.
    pub(crate) fn from_reply(reply: Reply) -> Result<Self> {
        if reply
            .response_flags
            .contains(ResponseFlags::CURSOR_NOT_FOUND)
        {
            return Err(ErrorKind::Command(CommandError {
                code: 43,
                code_name: "CursorNotFound".to_string(),
                message: "cursor killed or timed out".to_string(),
                labels: Vec::new(),
            })
            .into());
        }

        let first = reply.document_bytes.into_iter().next().ok_or_else(|| {
            Error::invalid_response("reply to a command contained no documents")
        })?;

        if reply.response_flags.contains(ResponseFlags::QUERY_FAILURE) {
            let err_doc: Document = crate::bson::from_slice(&first)?;
            let message = err_doc
                .get_str("$err")
                .unwrap_or("unknown query failure")
                .to_string();
            let code = err_doc.get_i32("code").ok();
            return Err(ErrorKind::Command(CommandError::from_legacy_err(message, code)).into());
        }

        Ok(Self { source: first })
    }

    /// Deserializes the response body into the given shape.
    pub(crate) fn body<T: DeserializeOwned>(&self) -> Result<T> {
        crate::bson::from_slice(&self.source).map_err(|err| {
            Error::invalid_response(format!("failed to deserialize server response: {}", err))
        })
    }

    pub(crate) fn document(&self) -> Result<Document> {
        self.body()
    }

    /// Checks the `ok` field, converting a failed command into an error that carries the
    /// server's code, codeName, errmsg and error labels.
    pub(crate) fn command_error(&self) -> Result<()> {
        let document = self.document()?;

        let ok = match document.get("ok") {
            Some(Bson::Double(value)) => *value == 1.0,
            Some(Bson::Int32(value)) => *value == 1,
            Some(Bson::Int64(value)) => *value == 1,
            Some(Bson::Boolean(value)) => *value,
            _ => {
                return Err(Error::invalid_response(
                    "server response was missing the ok field",
                ))
            }
        };

        if ok {
            return Ok(());
        }

        let command_error: CommandError = self.body()?;
        let labels = command_error.labels.clone();
        let mut error: Error = ErrorKind::Command(command_error).into();
        for label in &labels {
            error = error.with_label(label);
        }
        Err(error)
    }
}
