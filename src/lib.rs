//! The connection, wire protocol, topology, cursor, and session core of an asynchronous
//! MongoDB client driver.
//!
//! This crate covers the layers between a socket and a driver's public collection API:
//!
//! - **Wire protocol**: encoding and decoding of `OP_MSG`, `OP_COMPRESSED`, and the
//!   legacy opcodes (`OP_QUERY`, `OP_GET_MORE`, `OP_KILL_CURSORS`, and the
//!   fire-and-forget write opcodes), with partial-frame reassembly over a streaming
//!   transport.
//! - **Connections and pooling**: pipelined connections that correlate concurrent
//!   responses by request id, and a round-robin pool per server.
//! - **Server discovery and monitoring**: heartbeat monitors feeding a
//!   [`TopologyDescription`](sdam::TopologyDescription) state machine that classifies
//!   the deployment (standalone, replica set, sharded) and drives read-preference-aware
//!   server selection.
//! - **Cursors**: the state machine over server-side result cursors, including tailable
//!   cursors, limits, and explicit kills.
//! - **Sessions and transactions**: pooled server sessions, retryable writes, and the
//!   multi-statement transaction state machine.
//!
//! The entry point is [`sdam::Topology`]: build one from [`options::ClientOptions`],
//! select servers against it, and run commands, writes, and cursors on the servers it
//! returns.
//!
//! ```no_run
//! use mongo_driver_core::{
//!     bson::doc,
//!     options::{ClientOptions, ServerAddress},
//!     sdam::Topology,
//! };
//!
//! # async fn example() -> mongo_driver_core::error::Result<()> {
//! let options = ClientOptions::builder()
//!     .hosts(vec![ServerAddress::parse("localhost:27017")?])
//!     .build();
//! let topology = Topology::new(options)?;
//!
//! let reply = topology
//!     .run_command("admin", doc! { "ping": 1 }, None, None)
//!     .await?;
//! assert_eq!(reply.get_f64("ok"), Ok(1.0));
//!
//! topology.shutdown().await;
//! # Ok(())
//! # }
//! ```

#![warn(missing_docs)]

pub mod client;
pub(crate) mod cmap;
pub(crate) mod compression;
pub mod cursor;
pub mod error;
pub mod event;
pub(crate) mod hello;
pub mod options;
pub mod results;
pub mod sdam;
pub mod selection_criteria;

pub use bson;

pub use crate::{
    client::session::{ClientSession, TransactionState},
    cursor::Cursor,
    error::{Error, ErrorKind, Result},
    options::{ClientOptions, Namespace, ServerAddress},
    sdam::Topology,
    selection_criteria::{ReadPreference, SelectionCriteria},
};
