//! Encoders for the legacy opcode-based framing: OP_QUERY, OP_GET_MORE, OP_KILL_CURSORS, and
//! the pre-command write ops OP_INSERT, OP_UPDATE, OP_DELETE.

#[cfg(test)]
use std::io::Read;

use bitflags::bitflags;

#[cfg(test)]
use super::util::{read_cstring, read_document_bytes, SyncLittleEndianRead};
use super::{
    header::{Header, OpCode},
    util::write_cstring,
};
use crate::{
    bson::Document,
    error::{Error, ErrorKind, Result},
};

/// The default maximum size of a single BSON document, used until the server advertises its
/// own limit during the handshake.
pub(crate) const DEFAULT_MAX_BSON_OBJECT_SIZE: usize = 16 * 1024 * 1024;

bitflags! {
    /// The flag bits of an OP_QUERY message.
    #[derive(Clone, Copy, Debug, Eq, PartialEq)]
    pub(crate) struct QueryFlags: i32 {
        const TAILABLE_CURSOR   = 0b0000_0010;
        const SLAVE_OK          = 0b0000_0100;
        const NO_CURSOR_TIMEOUT = 0b0001_0000;
        const AWAIT_DATA        = 0b0010_0000;
        const EXHAUST           = 0b0100_0000;
        const PARTIAL           = 0b1000_0000;
    }
}

bitflags! {
    #[derive(Clone, Copy, Debug, Eq, PartialEq)]
    pub(crate) struct InsertFlags: i32 {
        const CONTINUE_ON_ERROR = 0b0001;
    }
}

bitflags! {
    #[derive(Clone, Copy, Debug, Eq, PartialEq)]
    pub(crate) struct UpdateFlags: i32 {
        const UPSERT       = 0b0001;
        const MULTI_UPDATE = 0b0010;
    }
}

bitflags! {
    #[derive(Clone, Copy, Debug, Eq, PartialEq)]
    pub(crate) struct DeleteFlags: i32 {
        const SINGLE_REMOVE = 0b0001;
    }
}

/// Serializes `doc`, enforcing the negotiated maximum document size. Oversized documents fail
/// before any bytes reach the transport.
fn encode_document(doc: &Document, max_bson_object_size: usize) -> Result<Vec<u8>> {
    let bytes = crate::bson::to_vec(doc)?;
    if bytes.len() > max_bson_object_size {
        return Err(ErrorKind::InvalidArgument {
            message: format!(
                "document exceeds maximum BSON object size ({} > {})",
                bytes.len(),
                max_bson_object_size
            ),
        }
        .into());
    }
    Ok(bytes)
}

/// Replaces the length placeholder at the front of a fully-built message.
fn finish_message(mut buf: Vec<u8>) -> Vec<u8> {
    let total_length = buf.len() as i32;
    buf[0..4].copy_from_slice(&total_length.to_le_bytes());
    buf
}

fn start_message(request_id: i32, op_code: OpCode) -> Vec<u8> {
    let mut buf = Vec::new();
    let header = Header {
        length: 0,
        request_id,
        response_to: 0,
        op_code,
    };
    header.write_to(&mut buf);
    buf
}

/// Represents an OP_QUERY wire protocol operation.
#[derive(Clone, Debug, PartialEq)]
pub(crate) struct OpQuery {
    pub(crate) namespace: String,
    pub(crate) flags: QueryFlags,
    pub(crate) number_to_skip: i32,
    pub(crate) number_to_return: i32,
    pub(crate) query: Document,
    pub(crate) projection: Option<Document>,
}

impl OpQuery {
    pub(crate) fn encode(&self, request_id: i32, max_bson_object_size: usize) -> Result<Vec<u8>> {
        let mut buf = start_message(request_id, OpCode::Query);
        buf.extend_from_slice(&self.flags.bits().to_le_bytes());
        write_cstring(&mut buf, &self.namespace)?;
        buf.extend_from_slice(&self.number_to_skip.to_le_bytes());
        buf.extend_from_slice(&self.number_to_return.to_le_bytes());
        buf.extend_from_slice(&encode_document(&self.query, max_bson_object_size)?);
        if let Some(ref projection) = self.projection {
            buf.extend_from_slice(&encode_document(projection, max_bson_object_size)?);
        }
        Ok(finish_message(buf))
    }

    /// Decodes the body of an OP_QUERY message (everything after the header).
    #[cfg(test)]
    pub(crate) fn decode_body<R: Read>(reader: &mut R, body_length: usize) -> Result<Self> {
        let mut counted = super::util::CountReader::new(reader);
        let flags = QueryFlags::from_bits_truncate(counted.read_i32_sync()?);
        let namespace = read_cstring(&mut counted)?;
        let number_to_skip = counted.read_i32_sync()?;
        let number_to_return = counted.read_i32_sync()?;
        let query: Document = crate::bson::from_slice(&read_document_bytes(&mut counted)?)
            .map_err(Error::from)?;
        let projection = if counted.bytes_read() < body_length {
            Some(
                crate::bson::from_slice(&read_document_bytes(&mut counted)?)
                    .map_err(Error::from)?,
            )
        } else {
            None
        };

        Ok(Self {
            namespace,
            flags,
            number_to_skip,
            number_to_return,
            query,
            projection,
        })
    }
}

/// Represents an OP_GET_MORE wire protocol operation.
#[derive(Clone, Debug, PartialEq)]
pub(crate) struct OpGetMore {
    pub(crate) namespace: String,
    pub(crate) number_to_return: i32,
    pub(crate) cursor_id: i64,
}

impl OpGetMore {
    pub(crate) fn encode(&self, request_id: i32) -> Result<Vec<u8>> {
        let mut buf = start_message(request_id, OpCode::GetMore);
        // 4 reserved zero bytes.
        buf.extend_from_slice(&0i32.to_le_bytes());
        write_cstring(&mut buf, &self.namespace)?;
        buf.extend_from_slice(&self.number_to_return.to_le_bytes());
        buf.extend_from_slice(&self.cursor_id.to_le_bytes());
        Ok(finish_message(buf))
    }

    #[cfg(test)]
    pub(crate) fn decode_body<R: Read>(reader: &mut R) -> Result<Self> {
        let _zero = reader.read_i32_sync()?;
        Ok(Self {
            namespace: read_cstring(reader)?,
            number_to_return: reader.read_i32_sync()?,
            cursor_id: reader.read_i64_sync()?,
        })
    }
}

/// Represents an OP_KILL_CURSORS wire protocol operation.
#[derive(Clone, Debug, PartialEq)]
pub(crate) struct OpKillCursors {
    pub(crate) cursor_ids: Vec<i64>,
}

impl OpKillCursors {
    pub(crate) fn encode(&self, request_id: i32) -> Result<Vec<u8>> {
        if self.cursor_ids.is_empty() {
            return Err(Error::invalid_argument(
                "killCursors requires at least one cursor id",
            ));
        }

        let mut buf = start_message(request_id, OpCode::KillCursors);
        buf.extend_from_slice(&0i32.to_le_bytes());
        buf.extend_from_slice(&(self.cursor_ids.len() as i32).to_le_bytes());
        for id in &self.cursor_ids {
            buf.extend_from_slice(&id.to_le_bytes());
        }
        Ok(finish_message(buf))
    }

    #[cfg(test)]
    pub(crate) fn decode_body<R: Read>(reader: &mut R) -> Result<Self> {
        let _zero = reader.read_i32_sync()?;
        let count = reader.read_i32_sync()?;
        let mut cursor_ids = Vec::with_capacity(count.max(0) as usize);
        for _ in 0..count {
            cursor_ids.push(reader.read_i64_sync()?);
        }
        Ok(Self { cursor_ids })
    }
}

/// Represents an OP_INSERT wire protocol operation.
#[derive(Clone, Debug, PartialEq)]
pub(crate) struct OpInsert {
    pub(crate) namespace: String,
    pub(crate) flags: InsertFlags,
    pub(crate) documents: Vec<Document>,
}

impl OpInsert {
    pub(crate) fn encode(&self, request_id: i32, max_bson_object_size: usize) -> Result<Vec<u8>> {
        if self.documents.is_empty() {
            return Err(Error::invalid_argument("cannot insert an empty batch"));
        }

        let mut buf = start_message(request_id, OpCode::Insert);
        buf.extend_from_slice(&self.flags.bits().to_le_bytes());
        write_cstring(&mut buf, &self.namespace)?;
        for doc in &self.documents {
            buf.extend_from_slice(&encode_document(doc, max_bson_object_size)?);
        }
        Ok(finish_message(buf))
    }
}

/// Represents an OP_UPDATE wire protocol operation.
#[derive(Clone, Debug, PartialEq)]
pub(crate) struct OpUpdate {
    pub(crate) namespace: String,
    pub(crate) flags: UpdateFlags,
    pub(crate) selector: Document,
    pub(crate) update: Document,
}

impl OpUpdate {
    pub(crate) fn encode(&self, request_id: i32, max_bson_object_size: usize) -> Result<Vec<u8>> {
        let mut buf = start_message(request_id, OpCode::Update);
        buf.extend_from_slice(&0i32.to_le_bytes());
        write_cstring(&mut buf, &self.namespace)?;
        buf.extend_from_slice(&self.flags.bits().to_le_bytes());
        buf.extend_from_slice(&encode_document(&self.selector, max_bson_object_size)?);
        buf.extend_from_slice(&encode_document(&self.update, max_bson_object_size)?);
        Ok(finish_message(buf))
    }
}

/// Represents an OP_DELETE wire protocol operation.
#[derive(Clone, Debug, PartialEq)]
pub(crate) struct OpDelete {
    pub(crate) namespace: String,
    pub(crate) flags: DeleteFlags,
    pub(crate) selector: Document,
}

impl OpDelete {
    pub(crate) fn encode(&self, request_id: i32, max_bson_object_size: usize) -> Result<Vec<u8>> {
        let mut buf = start_message(request_id, OpCode::Delete);
        buf.extend_from_slice(&0i32.to_le_bytes());
        write_cstring(&mut buf, &self.namespace)?;
        buf.extend_from_slice(&self.flags.bits().to_le_bytes());
        buf.extend_from_slice(&encode_document(&self.selector, max_bson_object_size)?);
        Ok(finish_message(buf))
    }
}
