use std::time::Duration;

use crate::{
    cmap::conn::wire::legacy::DEFAULT_MAX_BSON_OBJECT_SIZE,
    compression::Compressor,
    hello::HelloReply,
    options::ServerAddress,
    sdam::ServerType,
};

/// The first wire version that supports OP_MSG.
pub(crate) const MIN_WIRE_VERSION_FOR_OP_MSG: i32 = 6;

pub(crate) const DEFAULT_MAX_MESSAGE_SIZE_BYTES: usize = 48 * 1000 * 1000;
pub(crate) const DEFAULT_MAX_WRITE_BATCH_SIZE: usize = 100_000;

/// Facts about a connection learned from its handshake. Fixed for the lifetime of the
/// connection.
#[derive(Clone, Debug)]
pub(crate) struct StreamDescription {
    pub(crate) server_address: ServerAddress,

    /// The type the server reported at handshake time. The monitor may learn otherwise
    /// later, but framing decisions on this connection use this value.
    pub(crate) initial_server_type: ServerType,

    pub(crate) min_wire_version: Option<i32>,
    pub(crate) max_wire_version: Option<i32>,

    pub(crate) max_bson_object_size: usize,
    pub(crate) max_message_size_bytes: usize,
    pub(crate) max_write_batch_size: usize,

    pub(crate) logical_session_timeout: Option<Duration>,

    pub(crate) hello_ok: bool,

    /// The compressor negotiated for this connection, if any.
    pub(crate) compressor: Option<Compressor>,
}

impl StreamDescription {
    pub(crate) fn from_hello_reply(reply: &HelloReply, compressor: Option<Compressor>) -> Self {
        let response = &reply.command_response;
        Self {
            server_address: reply.server_address.clone(),
            initial_server_type: response.server_type(),
            min_wire_version: response.min_wire_version,
            max_wire_version: response.max_wire_version,
            max_bson_object_size: response
                .max_bson_object_size
                .map(|size| size.max(0) as usize)
                .unwrap_or(DEFAULT_MAX_BSON_OBJECT_SIZE),
            max_message_size_bytes: response
                .max_message_size_bytes
                .map(|size| size.max(0) as usize)
                .unwrap_or(DEFAULT_MAX_MESSAGE_SIZE_BYTES),
            max_write_batch_size: response
                .max_write_batch_size
                .map(|size| size.max(0) as usize)
                .unwrap_or(DEFAULT_MAX_WRITE_BATCH_SIZE),
            logical_session_timeout: response.logical_session_timeout(),
            hello_ok: response.hello_ok.unwrap_or(false),
            compressor,
        }
    }

    pub(crate) fn supports_op_msg(&self) -> bool {
        self.max_wire_version
            .map_or(false, |version| version >= MIN_WIRE_VERSION_FOR_OP_MSG)
    }

    /// Whether operations on this connection can attach a session.
    pub(crate) fn supports_sessions(&self) -> bool {
        self.logical_session_timeout.is_some()
    }

    /// Retryable writes need sessions and a non-standalone server.
    pub(crate) fn supports_retryable_writes(&self) -> bool {
        self.supports_sessions()
            && self.supports_op_msg()
            && self.initial_server_type != ServerType::Standalone
    }
}
