use std::{
    io::Read,
    sync::atomic::{AtomicI32, Ordering},
};

use crate::error::{Error, ErrorKind, Result};

static REQUEST_ID: AtomicI32 = AtomicI32::new(1);

/// Returns a new, unique request id drawn from the process-wide counter.
pub(crate) fn next_request_id() -> i32 {
    REQUEST_ID.fetch_add(1, Ordering::SeqCst)
}

/// Appends `string` to `buf` with a null terminator. Fails if the string itself contains a
/// null byte, which the wire format cannot represent.
pub(crate) fn write_cstring(buf: &mut Vec<u8>, string: &str) -> Result<()> {
    if string.contains('\0') {
        return Err(ErrorKind::InvalidArgument {
            message: format!("constructing message with illegal interior null byte: {:?}", string),
        }
        .into());
    }

    buf.extend_from_slice(string.as_bytes());
    buf.push(0);
    Ok(())
}

/// Reads a null-terminated string.
pub(crate) fn read_cstring<R: Read>(reader: &mut R) -> Result<String> {
    let mut bytes = Vec::new();
    loop {
        let b = reader.read_u8_sync()?;
        if b == 0 {
            break;
        }
        bytes.push(b);
    }

    String::from_utf8(bytes)
        .map_err(|_| Error::invalid_response("message contained non-UTF-8 string"))
}

/// Reads the bytes of a single BSON document, including its length prefix, without
/// deserializing it.
pub(crate) fn read_document_bytes<R: Read>(reader: &mut R) -> Result<Vec<u8>> {
    let length = reader.read_i32_sync()?;
    if length < 5 {
        return Err(Error::invalid_response(format!(
            "invalid document length: {}",
            length
        )));
    }

    let mut bytes = Vec::with_capacity(length as usize);
    bytes.extend_from_slice(&length.to_le_bytes());

    let mut remainder = reader.take(length as u64 - 4);
    remainder.read_to_end(&mut bytes)?;

    if bytes.len() != length as usize {
        return Err(Error::invalid_response(
            "message ended mid-document".to_string(),
        ));
    }

    Ok(bytes)
}

/// Little-endian primitive reads over any synchronous reader; message bodies are parsed from
/// already-reassembled in-memory frames.
pub(crate) trait SyncLittleEndianRead: Read {
    fn read_u8_sync(&mut self) -> Result<u8> {
        let mut buf = [0u8; 1];
        self.read_exact(&mut buf)?;
        Ok(buf[0])
    }

    fn read_u32_sync(&mut self) -> Result<u32> {
        let mut buf = [0u8; 4];
        self.read_exact(&mut buf)?;
        Ok(u32::from_le_bytes(buf))
    }

    fn read_i32_sync(&mut self) -> Result<i32> {
        let mut buf = [0u8; 4];
        self.read_exact(&mut buf)?;
        Ok(i32::from_le_bytes(buf))
    }

    fn read_i64_sync(&mut self) -> Result<i64> {
        let mut buf = [0u8; 8];
        self.read_exact(&mut buf)?;
        Ok(i64::from_le_bytes(buf))
    }
}

impl<R: Read> SyncLittleEndianRead for R {}

/// A reader wrapper that counts the bytes read through it.
pub(crate) struct CountReader<R> {
    reader: R,
    bytes_read: usize,
}

impl<R: Read> CountReader<R> {
    pub(crate) fn new(reader: R) -> Self {
        CountReader {
            reader,
            bytes_read: 0,
        }
    }

    /// Gets the number of bytes read so far.
    pub(crate) fn bytes_read(&self) -> usize {
        self.bytes_read
    }
}

impl<R: Read> Read for CountReader<R> {
    fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
        let bytes = self.reader.read(buf)?;
        self.bytes_read += bytes;
        Ok(bytes)
    }
}
