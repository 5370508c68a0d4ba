//! Connection pooling. Because requests are pipelined, a pooled connection is never
//! exclusively checked out: the pool hands out shared references and spreads load across
//! its connections round-robin, growing up to its maximum size.

pub(crate) mod conn;
pub(crate) mod establish;
pub(crate) mod options;

use std::sync::Arc;

use tokio::sync::Mutex;

use self::{
    conn::Connection,
    establish::Handshaker,
    options::ConnectionPoolOptions,
};
use crate::{
    error::{Error, Result},
    event::cmap::{
        CmapEventHandler,
        ConnectionClosedEvent,
        ConnectionClosedReason,
        ConnectionCreatedEvent,
        ConnectionReadyEvent,
        PoolClearedEvent,
        PoolClosedEvent,
        PoolCreatedEvent,
    },
    options::ServerAddress,
};

/// A pool of connections to a single server.
#[derive(Debug)]
pub(crate) struct ConnectionPool {
    address: ServerAddress,
    options: ConnectionPoolOptions,
    handshaker: Handshaker,
    state: Mutex<PoolState>,
}

#[derive(Debug)]
struct PoolState {
    connections: Vec<Arc<Connection>>,
    /// Round-robin position.
    next: usize,
    next_connection_id: u32,
    /// Connections being established outside the lock. Counted toward the maximum size.
    pending: u32,
    generation: u32,
    closed: bool,
}

impl ConnectionPool {
    pub(crate) fn new(address: ServerAddress, options: ConnectionPoolOptions) -> Self {
        let handshaker = Handshaker::new(
            options.app_name.clone(),
            options.compressors.clone(),
            options.credential.clone(),
        );

        let pool = Self {
            address: address.clone(),
            options,
            handshaker,
            state: Mutex::new(PoolState {
                connections: Vec::new(),
                next: 0,
                next_connection_id: 1,
                pending: 0,
                generation: 0,
                closed: false,
            }),
        };
        pool.emit(|handler| {
            handler.handle_pool_created_event(PoolCreatedEvent {
                address,
                max_pool_size: pool.options.max_pool_size(),
            })
        });
        pool
    }

    pub(crate) fn address(&self) -> &ServerAddress {
        &self.address
    }

    pub(crate) async fn generation(&self) -> u32 {
        self.state.lock().await.generation
    }

    /// Returns a connection to run operations on. Grows the pool while it is below its
    /// maximum size; once full, spreads requests over the existing connections.
    ///
    /// Establishment happens without the pool lock held, so a slow connect never blocks
    /// checkouts that an already-established connection can serve.
    pub(crate) async fn check_out(&self) -> Result<Arc<Connection>> {
        let (id, generation) = {
            let mut state = self.state.lock().await;
            if state.closed {
                return Err(Error::pool_closed(&self.address));
            }

            let generation = state.generation;
            state.connections.retain(|connection| {
                let keep = !connection.is_closed() && connection.generation == generation;
                if !keep {
                    connection.close();
                }
                keep
            });

            let in_flight = state.connections.len() as u32 + state.pending;
            if in_flight >= self.options.max_pool_size() && !state.connections.is_empty() {
                state.next = (state.next + 1) % state.connections.len();
                return Ok(Arc::clone(&state.connections[state.next]));
            }

            // Reserve a slot for the connection established below.
            let id = state.next_connection_id;
            state.next_connection_id += 1;
            state.pending += 1;
            (id, generation)
        };

        let established = self.establish_connection(id, generation).await;

        let mut state = self.state.lock().await;
        state.pending -= 1;
        let connection = established?;

        if state.closed {
            connection.close();
            return Err(Error::pool_closed(&self.address));
        }
        // A connection from a cleared generation still serves this caller, but is not
        // pooled; the next checkout would prune it anyway.
        if connection.generation == state.generation {
            state.connections.push(Arc::clone(&connection));
        }
        Ok(connection)
    }

    async fn establish_connection(&self, id: u32, generation: u32) -> Result<Arc<Connection>> {
        self.emit(|handler| {
            handler.handle_connection_created_event(ConnectionCreatedEvent {
                address: self.address.clone(),
                connection_id: id,
            })
        });

        let connection = Arc::new(
            Connection::connect(
                self.address.clone(),
                id,
                generation,
                self.options.connect_timeout,
                self.options.socket_timeout,
            )
            .await?,
        );

        if let Err(error) = self.handshaker.handshake(&connection).await {
            connection.close();
            self.emit(|handler| {
                handler.handle_connection_closed_event(ConnectionClosedEvent {
                    address: self.address.clone(),
                    connection_id: id,
                    reason: ConnectionClosedReason::Error,
                })
            });
            return Err(error);
        }

        self.emit(|handler| {
            handler.handle_connection_ready_event(ConnectionReadyEvent {
                address: self.address.clone(),
                connection_id: id,
            })
        });

        Ok(connection)
    }

    /// Invalidates every current connection by bumping the pool's generation. Called after
    /// network errors to keep operations off connections to a server that just failed.
    pub(crate) async fn clear(&self) {
        let mut state = self.state.lock().await;
        if state.closed {
            return;
        }
        state.generation += 1;
        for connection in state.connections.drain(..) {
            let id = connection.id;
            connection.close();
            self.emit(|handler| {
                handler.handle_connection_closed_event(ConnectionClosedEvent {
                    address: self.address.clone(),
                    connection_id: id,
                    reason: ConnectionClosedReason::Stale,
                })
            });
        }
        self.emit(|handler| {
            handler.handle_pool_cleared_event(PoolClearedEvent {
                address: self.address.clone(),
            })
        });
    }

    /// Closes the pool and all of its connections. Idempotent; future check-outs fail.
    pub(crate) async fn close(&self) {
        let mut state = self.state.lock().await;
        if state.closed {
            return;
        }
        state.closed = true;
        for connection in state.connections.drain(..) {
            let id = connection.id;
            connection.close();
            self.emit(|handler| {
                handler.handle_connection_closed_event(ConnectionClosedEvent {
                    address: self.address.clone(),
                    connection_id: id,
                    reason: ConnectionClosedReason::PoolClosed,
                })
            });
        }
        self.emit(|handler| {
            handler.handle_pool_closed_event(PoolClosedEvent {
                address: self.address.clone(),
            })
        });
    }

    fn emit<F: FnOnce(&dyn CmapEventHandler)>(&self, emit: F) {
        if let Some(handler) = &self.options.cmap_event_handler {
            emit(handler.0.as_ref());
        }
    }
}

#[cfg(test)]
mod test {
    use std::time::Duration;

    use super::*;

    /// Accepts connections and holds them open without ever answering, so the handshake of
    /// a new connection stays in flight indefinitely.
    async fn silent_listener() -> (tokio::task::JoinHandle<()>, ServerAddress) {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let address = ServerAddress::parse(format!("127.0.0.1:{}", port)).unwrap();

        let accept = tokio::spawn(async move {
            let mut sockets = Vec::new();
            loop {
                let (socket, _) = listener.accept().await.unwrap();
                sockets.push(socket);
            }
        });
        (accept, address)
    }

    #[tokio::test]
    async fn slow_establishment_does_not_block_the_pool() {
        let (accept, address) = silent_listener().await;
        let pool = Arc::new(ConnectionPool::new(
            address,
            ConnectionPoolOptions::default(),
        ));

        let blocked = {
            let pool = Arc::clone(&pool);
            tokio::spawn(async move { pool.check_out().await })
        };

        // Give the blocked checkout time to reach the handshake.
        tokio::time::sleep(Duration::from_millis(100)).await;

        // Pool state stays reachable while establishment is in flight.
        tokio::time::timeout(Duration::from_secs(1), pool.generation())
            .await
            .expect("pool state stayed locked during establishment");
        tokio::time::timeout(Duration::from_secs(1), pool.clear())
            .await
            .expect("pool state stayed locked during establishment");

        blocked.abort();
        accept.abort();
    }
}
