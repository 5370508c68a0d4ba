pub(crate) mod command;
pub(crate) mod stream;
pub(crate) mod stream_description;
pub(crate) mod wire;

use std::{
    collections::HashMap,
    sync::{Arc, Mutex, OnceLock},
    time::Duration,
};

use tokio::{
    io::{AsyncReadExt, AsyncWriteExt},
    net::{tcp::OwnedWriteHalf, TcpStream},
    sync::{oneshot, Mutex as AsyncMutex},
    task::JoinHandle,
};

use self::{
    command::{Command, RawCommandResponse},
    stream::MessageBuffer,
    stream_description::{StreamDescription, DEFAULT_MAX_MESSAGE_SIZE_BYTES},
    wire::{
        legacy::{OpQuery, QueryFlags, DEFAULT_MAX_BSON_OBJECT_SIZE},
        next_request_id,
        Message,
        ResponseMessage,
    },
};
use crate::{
    error::{Error, Result},
    options::ServerAddress,
};

const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(10);
const READ_CHUNK_SIZE: usize = 16 * 1024;

/// Commands that must never be compressed, since they may carry credentials. Compared
/// against lowercased command names.
const UNCOMPRESSIBLE_COMMANDS: &[&str] = &[
    crate::hello::LEGACY_HELLO_COMMAND_NAME_LOWERCASE,
    "hello",
    "saslstart",
    "saslcontinue",
    "getnonce",
    "authenticate",
    "createuser",
    "updateuser",
];

type PendingRequests = Arc<Mutex<Option<HashMap<i32, oneshot::Sender<Result<ResponseMessage>>>>>>;

/// A single wire protocol connection. Requests are pipelined: any number of tasks may have
/// commands in flight at once, and a background reader routes each response to its waiter
/// by the `responseTo` field.
#[derive(Debug)]
pub(crate) struct Connection {
    pub(crate) id: u32,
    pub(crate) address: ServerAddress,

    /// The pool generation this connection was created in. A pool clear invalidates every
    /// connection from earlier generations.
    pub(crate) generation: u32,

    write_half: AsyncMutex<OwnedWriteHalf>,
    pending: PendingRequests,
    description: Arc<OnceLock<StreamDescription>>,
    socket_timeout: Option<Duration>,
    reader_handle: JoinHandle<()>,
}

impl Connection {
    /// Opens a TCP connection to the given address and starts its reader task. The
    /// connection cannot run OP_MSG traffic until a handshake has populated its stream
    /// description.
    pub(crate) async fn connect(
        address: ServerAddress,
        id: u32,
        generation: u32,
        connect_timeout: Option<Duration>,
        socket_timeout: Option<Duration>,
    ) -> Result<Self> {
        let timeout = connect_timeout.unwrap_or(DEFAULT_CONNECT_TIMEOUT);
        let target = (
            address.host().to_string(),
            address.port().unwrap_or(crate::options::DEFAULT_PORT),
        );
        let stream = tokio::time::timeout(timeout, TcpStream::connect(target))
            .await
            .map_err(|_| {
                Error::from(std::io::Error::new(
                    std::io::ErrorKind::TimedOut,
                    format!("timed out connecting to {}", address),
                ))
            })??;
        stream.set_nodelay(true)?;

        let (read_half, write_half) = stream.into_split();
        let pending: PendingRequests = Arc::new(Mutex::new(Some(HashMap::new())));
        let description = Arc::new(OnceLock::new());

        let reader_handle = tokio::spawn(reader_task(
            read_half,
            Arc::clone(&pending),
            Arc::clone(&description),
            address.clone(),
        ));

        Ok(Self {
            id,
            address,
            generation,
            write_half: AsyncMutex::new(write_half),
            pending,
            description,
            socket_timeout,
            reader_handle,
        })
    }

    pub(crate) fn stream_description(&self) -> Result<&StreamDescription> {
        self.description.get().ok_or_else(|| {
            Error::internal("stream description accessed before the handshake completed")
        })
    }

    /// Records the result of the handshake. May only be called once.
    pub(crate) fn set_stream_description(&self, description: StreamDescription) -> Result<()> {
        self.description
            .set(description)
            .map_err(|_| Error::internal("stream description set twice"))
    }

    pub(crate) fn is_closed(&self) -> bool {
        self.pending
            .lock()
            .map(|guard| guard.is_none())
            .unwrap_or(true)
    }

    /// Sends a command, framing it according to the wire version learned during the
    /// handshake. Before the handshake (or against old servers) commands go as OP_QUERY
    /// against the database's `$cmd` collection; afterwards as OP_MSG, compressed when a
    /// compressor was negotiated.
    pub(crate) async fn send_command(&self, command: Command) -> Result<RawCommandResponse> {
        let request_id = next_request_id();
        let description = self.description.get();

        let max_bson_object_size = description
            .map(|description| description.max_bson_object_size)
            .unwrap_or(DEFAULT_MAX_BSON_OBJECT_SIZE);

        let frame = match description {
            Some(description) if description.supports_op_msg() => {
                let message = Message::new(
                    &command.body_with_db(),
                    command.document_sequences.clone(),
                    command.exhaust_allowed,
                )?;
                match &description.compressor {
                    Some(compressor)
                        if !UNCOMPRESSIBLE_COMMANDS
                            .contains(&command.name.to_lowercase().as_str()) =>
                    {
                        message.encode_compressed(request_id, compressor, max_bson_object_size)?
                    }
                    _ => message.encode(request_id, max_bson_object_size)?,
                }
            }
            _ => {
                OpQuery {
                    namespace: format!("{}.$cmd", command.target_db),
                    flags: QueryFlags::SLAVE_OK,
                    number_to_skip: 0,
                    number_to_return: -1,
                    query: command.body.clone(),
                    projection: None,
                }
                .encode(request_id, max_bson_object_size)?
            }
        };

        let max_message_size = description
            .map(|description| description.max_message_size_bytes)
            .unwrap_or(DEFAULT_MAX_MESSAGE_SIZE_BYTES);
        if frame.len() > max_message_size {
            return Err(Error::invalid_argument(format!(
                "attempted to send a message of {} bytes, exceeding the server's limit of {}",
                frame.len(),
                max_message_size,
            )));
        }

        match self.send_frame(request_id, frame).await? {
            ResponseMessage::Msg(message) => Ok(RawCommandResponse::from_msg(message)),
            ResponseMessage::Reply(reply) => RawCommandResponse::from_reply(reply),
        }
    }

    /// Sends an already-encoded frame and waits for the response correlated to
    /// `request_id`.
    pub(crate) async fn send_frame(
        &self,
        request_id: i32,
        frame: Vec<u8>,
    ) -> Result<ResponseMessage> {
        let receiver = {
            let mut guard = self
                .pending
                .lock()
                .map_err(|_| Error::internal("connection state poisoned"))?;
            match guard.as_mut() {
                Some(map) => {
                    let (sender, receiver) = oneshot::channel();
                    map.insert(request_id, sender);
                    receiver
                }
                None => return Err(Error::connection_closed(&self.address)),
            }
        };

        if let Err(error) = self.write(&frame).await {
            self.fail(error.clone());
            return Err(error);
        }

        let response = match self.socket_timeout {
            Some(timeout) => match tokio::time::timeout(timeout, receiver).await {
                Ok(result) => result,
                Err(_) => {
                    // The reply may still arrive later, but the caller has given up on it.
                    // The stream cannot be reused.
                    let error = Error::from(std::io::Error::new(
                        std::io::ErrorKind::TimedOut,
                        format!("timed out waiting for a response from {}", self.address),
                    ));
                    self.fail(error.clone());
                    return Err(error);
                }
            },
            None => receiver.await,
        };

        response.map_err(|_| Error::connection_closed(&self.address))?
    }

    /// Sends an already-encoded frame without waiting for any response. Used for legacy
    /// operations that the server never answers, such as OP_KILL_CURSORS.
    pub(crate) async fn send_frame_without_reply(&self, frame: Vec<u8>) -> Result<()> {
        if self.is_closed() {
            return Err(Error::connection_closed(&self.address));
        }
        if let Err(error) = self.write(&frame).await {
            self.fail(error.clone());
            return Err(error);
        }
        Ok(())
    }

    async fn write(&self, frame: &[u8]) -> Result<()> {
        let mut write_half = self.write_half.lock().await;
        write_half.write_all(frame).await?;
        write_half.flush().await?;
        Ok(())
    }

    /// Fails every in-flight request and marks the connection terminally closed.
    fn fail(&self, error: Error) {
        fail_pending(&self.pending, error);
    }

    /// Closes the connection. In-flight requests fail with a connection closed error.
    /// Idempotent.
    pub(crate) fn close(&self) {
        self.fail(Error::connection_closed(&self.address));
        self.reader_handle.abort();
    }
}

impl Drop for Connection {
    fn drop(&mut self) {
        self.close();
    }
}

fn fail_pending(pending: &PendingRequests, error: Error) {
    let map = match pending.lock() {
        Ok(mut guard) => guard.take(),
        Err(_) => None,
    };
    if let Some(map) = map {
        for (_, sender) in map {
            let _ = sender.send(Err(error.clone()));
        }
    }
}

/// Reads off the socket until it closes or yields garbage, reassembling frames and routing
/// each one to the task that sent the matching request.
async fn reader_task(
    mut read_half: tokio::net::tcp::OwnedReadHalf,
    pending: PendingRequests,
    description: Arc<OnceLock<StreamDescription>>,
    address: ServerAddress,
) {
    let mut buffer = MessageBuffer::new();
    let mut chunk = vec![0u8; READ_CHUNK_SIZE];

    let error = loop {
        let bytes_read = match read_half.read(&mut chunk).await {
            Ok(0) => break Error::connection_closed(&address),
            Ok(bytes_read) => bytes_read,
            Err(error) => break Error::from(error),
        };
        buffer.extend(&chunk[..bytes_read]);

        let max_message_size = description
            .get()
            .map(|description| description.max_message_size_bytes)
            .unwrap_or(DEFAULT_MAX_MESSAGE_SIZE_BYTES);

        loop {
            match buffer.next_frame(max_message_size) {
                Ok(Some(frame)) => {
                    let response = match ResponseMessage::decode(&frame) {
                        Ok(response) => response,
                        Err(error) => {
                            fail_pending(&pending, error);
                            return;
                        }
                    };

                    let sender = pending.lock().ok().and_then(|mut guard| {
                        guard
                            .as_mut()
                            .and_then(|map| map.remove(&response.response_to()))
                    });
                    // A response nobody is waiting for is dropped.
                    if let Some(sender) = sender {
                        let _ = sender.send(Ok(response));
                    }
                }
                Ok(None) => break,
                Err(error) => {
                    fail_pending(&pending, error);
                    return;
                }
            }
        }
    };

    fail_pending(&pending, error);
}
