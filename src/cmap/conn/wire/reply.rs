//! Decoding of the legacy OP_REPLY response framing, which servers use to answer OP_QUERY
//! and OP_GETMORE requests.

use std::io::Read;

use bitflags::bitflags;

use super::{
    header::Header,
    util::{read_document_bytes, CountReader, SyncLittleEndianRead},
};
use crate::{
    bson::Document,
    error::{Error, Result},
};

bitflags! {
    /// The response flags of an OP_REPLY message.
    #[derive(Clone, Copy, Debug, Eq, PartialEq)]
    pub(crate) struct ResponseFlags: u32 {
        const CURSOR_NOT_FOUND   = 0b_0000_0000_0000_0000_0000_0000_0000_0001;
        const QUERY_FAILURE      = 0b_0000_0000_0000_0000_0000_0000_0000_0010;
        const SHARD_CONFIG_STALE = 0b_0000_0000_0000_0000_0000_0000_0000_0100;
        const AWAIT_CAPABLE      = 0b_0000_0000_0000_0000_0000_0000_0000_1000;
    }
}

/// A decoded OP_REPLY message. Document bytes are retained raw; deserialization happens
/// when a caller asks for the documents and is idempotent.
#[derive(Clone, Debug)]
pub(crate) struct Reply {
    pub(crate) response_to: i32,
    pub(crate) response_flags: ResponseFlags,
    pub(crate) cursor_id: i64,
    pub(crate) starting_from: i32,
    pub(crate) number_returned: i32,
    pub(crate) document_bytes: Vec<Vec<u8>>,
}

impl Reply {
    /// Parses the body of an OP_REPLY message (everything after the header).
    pub(crate) fn read_body<R: Read>(
        mut reader: R,
        header: &Header,
        body_length: usize,
    ) -> Result<Self> {
        let mut count_reader = CountReader::new(&mut reader);

        let response_flags = ResponseFlags::from_bits_truncate(count_reader.read_u32_sync()?);
        let cursor_id = count_reader.read_i64_sync()?;
        let starting_from = count_reader.read_i32_sync()?;
        let number_returned = count_reader.read_i32_sync()?;

        if number_returned < 0 {
            return Err(Error::invalid_response(format!(
                "OP_REPLY reported a negative document count: {}",
                number_returned
            )));
        }

        let mut document_bytes = Vec::with_capacity(number_returned as usize);
        for _ in 0..number_returned {
            document_bytes.push(read_document_bytes(&mut count_reader)?);
        }

        if count_reader.bytes_read() != body_length {
            return Err(Error::invalid_response(format!(
                "header indicated a message of {} bytes but the reply body was {} bytes",
                header.length,
                count_reader.bytes_read(),
            )));
        }

        Ok(Self {
            response_to: header.response_to,
            response_flags,
            cursor_id,
            starting_from,
            number_returned,
            document_bytes,
        })
    }

    /// Deserializes the returned documents.
    pub(crate) fn documents(&self) -> Result<Vec<Document>> {
        self.document_bytes
            .iter()
            .map(|bytes| crate::bson::from_slice(bytes).map_err(Error::from))
            .collect()
    }
}
