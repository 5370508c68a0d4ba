//! Events describing the lifecycle of connection pools and the connections they manage.

use crate::options::ServerAddress;

/// Emitted when a connection pool is created.
#[derive(Clone, Debug)]
#[non_exhaustive]
pub struct PoolCreatedEvent {
    /// The address of the server the pool's connections connect to.
    pub address: ServerAddress,

    /// The maximum number of connections the pool will hold.
    pub max_pool_size: u32,
}

/// Emitted when a connection pool is cleared, invalidating all of its existing
/// connections.
#[derive(Clone, Debug)]
#[non_exhaustive]
pub struct PoolClearedEvent {
    /// The address of the server whose pool was cleared.
    pub address: ServerAddress,
}

/// Emitted when a connection pool is closed.
#[derive(Clone, Debug)]
#[non_exhaustive]
pub struct PoolClosedEvent {
    /// The address of the server whose pool was closed.
    pub address: ServerAddress,
}

/// Emitted when a connection is created. The connection is not ready for use until it has
/// finished its handshake.
#[derive(Clone, Debug)]
#[non_exhaustive]
pub struct ConnectionCreatedEvent {
    /// The address of the server the connection connects to.
    pub address: ServerAddress,

    /// The unique id of the connection within its pool.
    pub connection_id: u32,
}

/// Emitted when a connection finishes its handshake and becomes available for operations.
#[derive(Clone, Debug)]
#[non_exhaustive]
pub struct ConnectionReadyEvent {
    /// The address of the server the connection connects to.
    pub address: ServerAddress,

    /// The unique id of the connection within its pool.
    pub connection_id: u32,
}

/// Emitted when a connection is closed.
#[derive(Clone, Debug)]
#[non_exhaustive]
pub struct ConnectionClosedEvent {
    /// The address of the server the connection connected to.
    pub address: ServerAddress,

    /// The unique id of the connection within its pool.
    pub connection_id: u32,

    /// Why the connection was closed.
    pub reason: ConnectionClosedReason,
}

/// The reason a connection was closed.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
#[non_exhaustive]
pub enum ConnectionClosedReason {
    /// The connection belonged to a previous pool generation.
    Stale,

    /// The connection encountered a network or protocol error.
    Error,

    /// The pool it belonged to was closed.
    PoolClosed,
}

/// An interface for handling connection pool events. Methods default to no-ops.
pub trait CmapEventHandler: Send + Sync {
    /// Handles a [`PoolCreatedEvent`].
    fn handle_pool_created_event(&self, _event: PoolCreatedEvent) {}

    /// Handles a [`PoolClearedEvent`].
    fn handle_pool_cleared_event(&self, _event: PoolClearedEvent) {}

    /// Handles a [`PoolClosedEvent`].
    fn handle_pool_closed_event(&self, _event: PoolClosedEvent) {}

    /// Handles a [`ConnectionCreatedEvent`].
    fn handle_connection_created_event(&self, _event: ConnectionCreatedEvent) {}

    /// Handles a [`ConnectionReadyEvent`].
    fn handle_connection_ready_event(&self, _event: ConnectionReadyEvent) {}

    /// Handles a [`ConnectionClosedEvent`].
    fn handle_connection_closed_event(&self, _event: ConnectionClosedEvent) {}
}
