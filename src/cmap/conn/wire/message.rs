//! Encoding and decoding of the OP_MSG multi-section framing, plus the OP_COMPRESSED
//! envelope wrapped around it when a compressor has been negotiated.

use std::io::Read;

use bitflags::bitflags;

use super::{
    header::{Header, OpCode},
    util::{read_cstring, read_document_bytes, CountReader, SyncLittleEndianRead},
};
use crate::{
    bson::Document,
    compression::{Compressor, Decoder},
    error::{Error, ErrorKind, Result},
};

/// Represents an OP_MSG wire protocol operation.
#[derive(Clone, Debug)]
pub(crate) struct Message {
    pub(crate) response_to: i32,
    pub(crate) flags: MessageFlags,
    pub(crate) checksum: Option<u32>,
    /// The single payload type 0 section, as raw BSON bytes. Deserialization is deferred
    /// until a caller asks for the document.
    pub(crate) document_payload: Vec<u8>,
    /// Payload type 1 sections.
    pub(crate) document_sequences: Vec<DocumentSequence>,
}

/// A payload type 1 section: a named sequence of documents sent outside the principal
/// command document, used for large write batches.
#[derive(Clone, Debug, PartialEq)]
pub(crate) struct DocumentSequence {
    pub(crate) identifier: String,
    pub(crate) documents: Vec<Vec<u8>>,
}

impl DocumentSequence {
    pub(crate) fn new(identifier: impl Into<String>, documents: &[Document]) -> Result<Self> {
        let mut encoded = Vec::with_capacity(documents.len());
        for doc in documents {
            encoded.push(crate::bson::to_vec(doc)?);
        }
        Ok(Self {
            identifier: identifier.into(),
            documents: encoded,
        })
    }
}

impl Message {
    /// Creates a message carrying the given command body.
    pub(crate) fn new(
        body: &Document,
        document_sequences: Vec<DocumentSequence>,
        exhaust_allowed: bool,
    ) -> Result<Self> {
        let mut flags = MessageFlags::empty();
        if exhaust_allowed {
            flags |= MessageFlags::EXHAUST_ALLOWED;
        }

        Ok(Self {
            response_to: 0,
            flags,
            checksum: None,
            document_payload: crate::bson::to_vec(body)?,
            document_sequences,
        })
    }

    /// Deserializes the payload type 0 section.
    pub(crate) fn single_document(&self) -> Result<Document> {
        crate::bson::from_slice(&self.document_payload).map_err(Error::from)
    }

    /// Enforces the negotiated maximum document size over the command body and every
    /// document sequence entry. Oversized documents fail before any bytes reach the
    /// transport.
    fn verify_document_sizes(&self, max_bson_object_size: usize) -> Result<()> {
        let oversized = std::iter::once(&self.document_payload)
            .chain(self.document_sequences.iter().flat_map(|s| &s.documents))
            .map(Vec::len)
            .find(|len| *len > max_bson_object_size);
        if let Some(len) = oversized {
            return Err(ErrorKind::InvalidArgument {
                message: format!(
                    "document exceeds maximum BSON object size ({} > {})",
                    len, max_bson_object_size
                ),
            }
            .into());
        }
        Ok(())
    }

    /// Serializes the message, with the given request id, into a complete frame.
    pub(crate) fn encode(&self, request_id: i32, max_bson_object_size: usize) -> Result<Vec<u8>> {
        self.verify_document_sizes(max_bson_object_size)?;
        let sections = self.sections_bytes();

        let total_length = Header::LENGTH
            + std::mem::size_of::<u32>()
            + sections.len()
            + self.checksum.map(|_| std::mem::size_of::<u32>()).unwrap_or(0);

        let mut buf = Vec::with_capacity(total_length);
        let header = Header {
            length: total_length as i32,
            request_id,
            response_to: self.response_to,
            op_code: OpCode::Message,
        };
        header.write_to(&mut buf);
        buf.extend_from_slice(&self.flags.bits().to_le_bytes());
        buf.extend_from_slice(&sections);
        if let Some(checksum) = self.checksum {
            buf.extend_from_slice(&checksum.to_le_bytes());
        }

        Ok(buf)
    }

    /// Serializes the message, compresses the flags-and-sections body, and wraps it in an
    /// OP_COMPRESSED envelope.
    pub(crate) fn encode_compressed(
        &self,
        request_id: i32,
        compressor: &Compressor,
        max_bson_object_size: usize,
    ) -> Result<Vec<u8>> {
        self.verify_document_sizes(max_bson_object_size)?;
        let sections = self.sections_bytes();

        let mut uncompressed = Vec::with_capacity(sections.len() + 4);
        uncompressed.extend_from_slice(&self.flags.bits().to_le_bytes());
        uncompressed.extend_from_slice(&sections);

        let compressed = compressor.compress(&uncompressed)?;

        let total_length = Header::LENGTH
            + std::mem::size_of::<i32>() // original opcode
            + std::mem::size_of::<i32>() // uncompressed size
            + std::mem::size_of::<u8>() // compressor id
            + compressed.len();

        let mut buf = Vec::with_capacity(total_length);
        let header = Header {
            length: total_length as i32,
            request_id,
            response_to: self.response_to,
            op_code: OpCode::Compressed,
        };
        header.write_to(&mut buf);
        buf.extend_from_slice(&(OpCode::Message as i32).to_le_bytes());
        buf.extend_from_slice(&(uncompressed.len() as i32).to_le_bytes());
        buf.push(compressor.id());
        buf.extend_from_slice(&compressed);

        Ok(buf)
    }

    /// Parses the body of an OP_MSG message (everything after the header).
    pub(crate) fn read_body<R: Read>(
        mut reader: R,
        header: &Header,
        body_length: usize,
    ) -> Result<Self> {
        let flags = MessageFlags::from_bits_truncate(reader.read_u32_sync()?);
        let mut length_remaining = body_length - std::mem::size_of::<u32>();

        let mut count_reader = CountReader::new(&mut reader);
        let mut document_payload = None;
        let mut document_sequences = Vec::new();
        while length_remaining - count_reader.bytes_read() > 4
            || (length_remaining - count_reader.bytes_read() > 0
                && !flags.contains(MessageFlags::CHECKSUM_PRESENT))
        {
            match MessageSection::read(&mut count_reader)? {
                MessageSection::Document(document) => {
                    if document_payload.is_some() {
                        return Err(Error::invalid_response(
                            "an OP_MSG response must contain exactly one payload type 0 section",
                        ));
                    }
                    document_payload = Some(document);
                }
                MessageSection::Sequence(sequence) => document_sequences.push(sequence),
            }
        }

        length_remaining -= count_reader.bytes_read();

        let mut checksum = None;
        if length_remaining == 4 && flags.contains(MessageFlags::CHECKSUM_PRESENT) {
            checksum = Some(reader.read_u32_sync()?);
        } else if length_remaining != 0 {
            return Err(Error::invalid_response(format!(
                "header indicated a message of {} bytes but the sections ended early",
                header.length,
            )));
        }

        Ok(Self {
            response_to: header.response_to,
            flags,
            checksum,
            document_payload: document_payload.ok_or_else(|| {
                Error::invalid_response(
                    "an OP_MSG response must contain exactly one payload type 0 section",
                )
            })?,
            document_sequences,
        })
    }

    /// Parses the body of an OP_COMPRESSED message, decompressing and re-parsing the inner
    /// OP_MSG.
    pub(crate) fn read_compressed_body<R: Read>(mut reader: R, header: &Header) -> Result<Self> {
        let original_opcode = reader.read_i32_sync()?;
        if original_opcode != OpCode::Message as i32 {
            return Err(Error::invalid_response(format!(
                "the original opcode of a compressed message must be {}, but was {}",
                OpCode::Message as i32,
                original_opcode,
            )));
        }

        let uncompressed_size = reader.read_i32_sync()?;
        let compressor_id = reader.read_u8_sync()?;
        let mut compressed = Vec::new();
        reader.read_to_end(&mut compressed)?;

        let decoder = Decoder::from_u8(compressor_id)?;
        let decompressed = decoder.decompress(&compressed)?;

        if decompressed.len() != uncompressed_size.max(0) as usize {
            return Err(Error::invalid_response(format!(
                "the server claimed an uncompressed length of {} but it was {}",
                uncompressed_size,
                decompressed.len(),
            )));
        }

        Self::read_body(decompressed.as_slice(), header, decompressed.len())
    }

    fn sections_bytes(&self) -> Vec<u8> {
        let mut sections = Vec::new();

        // Payload type 0.
        sections.push(0);
        sections.extend_from_slice(&self.document_payload);

        for sequence in &self.document_sequences {
            // Payload type 1.
            sections.push(1);

            let identifier_bytes = sequence.identifier.as_bytes();
            let documents_size: usize = sequence.documents.iter().map(Vec::len).sum();

            // Size bytes + identifier bytes + null terminator + document bytes.
            let size = 4 + identifier_bytes.len() + 1 + documents_size;
            sections.extend_from_slice(&(size as i32).to_le_bytes());
            sections.extend_from_slice(identifier_bytes);
            sections.push(0);
            for doc in &sequence.documents {
                sections.extend_from_slice(doc);
            }
        }

        sections
    }
}

bitflags! {
    /// Represents the bitwise flags of an OP_MSG message.
    #[derive(Clone, Copy, Debug, Eq, PartialEq)]
    pub(crate) struct MessageFlags: u32 {
        const CHECKSUM_PRESENT = 0b_0000_0000_0000_0000_0000_0000_0000_0001;
        const MORE_TO_COME     = 0b_0000_0000_0000_0000_0000_0000_0000_0010;
        const EXHAUST_ALLOWED  = 0b_0000_0000_0000_0001_0000_0000_0000_0000;
    }
}

/// A single section of an OP_MSG message.
#[derive(Debug)]
enum MessageSection {
    Document(Vec<u8>),
    Sequence(DocumentSequence),
}

impl MessageSection {
    /// Reads bytes from `reader` and deserializes them into a MessageSection.
    fn read<R: Read>(reader: &mut R) -> Result<Self> {
        let payload_type = reader.read_u8_sync()?;

        if payload_type == 0 {
            return Ok(MessageSection::Document(read_document_bytes(reader)?));
        }
        if payload_type != 1 {
            return Err(Error::invalid_response(format!(
                "invalid section payload type: {}",
                payload_type
            )));
        }

        let size = reader.read_i32_sync()?;
        if size < 4 {
            return Err(Error::invalid_response(format!(
                "invalid section length: {}",
                size
            )));
        }
        let length_remaining = size as usize - std::mem::size_of::<i32>();

        let mut count_reader = CountReader::new(reader);
        let identifier = read_cstring(&mut count_reader)?;

        let mut documents = Vec::new();
        while length_remaining > count_reader.bytes_read() {
            documents.push(read_document_bytes(&mut count_reader)?);
        }

        if length_remaining != count_reader.bytes_read() {
            return Err(ErrorKind::InvalidResponse {
                message: format!(
                    "the section indicated it would be {} bytes long but it was {}",
                    size,
                    count_reader.bytes_read() + std::mem::size_of::<i32>(),
                ),
            }
            .into());
        }

        Ok(MessageSection::Sequence(DocumentSequence {
            identifier,
            documents,
        }))
    }
}
