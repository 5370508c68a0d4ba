//! Connection-level and client-level configuration.

use std::{
    fmt::{self, Display, Formatter},
    str::FromStr,
    time::Duration,
};

use serde::{Deserialize, Serialize};
use typed_builder::TypedBuilder;

use crate::{
    client::auth::Credential,
    error::{Error, ErrorKind, Result},
    event::{CmapEventHandlerRef, SdamEventHandlerRef},
    selection_criteria::SelectionCriteria,
};

pub(crate) const DEFAULT_PORT: u16 = 27017;

/// An address to a server in the deployment. The identity key for all per-server maps.
#[derive(Clone, Debug, Eq, Hash, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
#[non_exhaustive]
pub enum ServerAddress {
    /// A TCP/IP host and port combination.
    Tcp {
        /// The hostname or IP address.
        host: String,

        /// The port. `None` means the default port of 27017.
        port: Option<u16>,
    },
}

impl Default for ServerAddress {
    fn default() -> Self {
        Self::Tcp {
            host: "localhost".into(),
            port: None,
        }
    }
}

impl ServerAddress {
    /// Parses an address from a `host` or `host:port` string.
    pub fn parse(address: impl AsRef<str>) -> Result<Self> {
        let address = address.as_ref();
        let mut parts = address.split(':');
        let hostname = match parts.next() {
            Some(part) if !part.is_empty() => part,
            _ => {
                return Err(ErrorKind::InvalidArgument {
                    message: format!("invalid server address: \"{}\"", address),
                }
                .into())
            }
        };

        let port = match parts.next() {
            Some(part) => {
                let port = u16::from_str(part).map_err(|_| ErrorKind::InvalidArgument {
                    message: format!(
                        "port must be valid 16-bit unsigned integer, instead got: {}",
                        part
                    ),
                })?;
                Some(port)
            }
            None => None,
        };

        if parts.next().is_some() {
            return Err(ErrorKind::InvalidArgument {
                message: format!("invalid server address: \"{}\"", address),
            }
            .into());
        }

        Ok(Self::Tcp {
            host: hostname.to_lowercase(),
            port,
        })
    }

    pub(crate) fn host(&self) -> &str {
        match self {
            Self::Tcp { host, .. } => host.as_str(),
        }
    }

    pub(crate) fn port(&self) -> Option<u16> {
        match self {
            Self::Tcp { port, .. } => *port,
        }
    }
}

impl Display for ServerAddress {
    fn fmt(&self, fmt: &mut Formatter) -> fmt::Result {
        match self {
            Self::Tcp { host, port } => {
                write!(fmt, "{}:{}", host, port.unwrap_or(DEFAULT_PORT))
            }
        }
    }
}

impl FromStr for ServerAddress {
    type Err = Error;

    fn from_str(address: &str) -> Result<Self> {
        Self::parse(address)
    }
}

/// A database and collection pair addressed as a dotted string on the wire.
#[derive(Clone, Debug, Eq, Hash, PartialEq)]
pub struct Namespace {
    /// The database name.
    pub db: String,

    /// The collection name.
    pub coll: String,
}

impl Namespace {
    /// Creates a namespace from a database and collection name.
    pub fn new(db: impl Into<String>, coll: impl Into<String>) -> Self {
        Self {
            db: db.into(),
            coll: coll.into(),
        }
    }

    pub(crate) fn from_full_name(full: &str) -> Result<Self> {
        match full.split_once('.') {
            Some((db, coll)) if !db.is_empty() && !coll.is_empty() => Ok(Self {
                db: db.to_string(),
                coll: coll.to_string(),
            }),
            _ => Err(Error::invalid_argument(format!(
                "invalid namespace: \"{}\"",
                full
            ))),
        }
    }
}

impl Display for Namespace {
    fn fmt(&self, fmt: &mut Formatter) -> fmt::Result {
        write!(fmt, "{}.{}", self.db, self.coll)
    }
}

/// Contains the options that can be used to create a [`Topology`](crate::Topology).
#[derive(Clone, Debug, Default, TypedBuilder)]
#[builder(field_defaults(default, setter(into)))]
#[non_exhaustive]
pub struct ClientOptions {
    /// The initial list of seed addresses that the topology should connect to.
    #[builder(!default)]
    pub hosts: Vec<ServerAddress>,

    /// The application name to send to the server as part of the handshake. Appears in server
    /// logs and profiling output.
    pub app_name: Option<String>,

    /// Whether the topology should connect directly to the single seed given rather than
    /// discovering the rest of the deployment.
    pub direct_connection: Option<bool>,

    /// The name of the replica set the topology is expected to be a member of.
    pub repl_set_name: Option<String>,

    /// The interval between server heartbeats. Defaults to 10 seconds.
    pub heartbeat_freq: Option<Duration>,

    /// The amount of latency beyond that of the fastest suitable server that is acceptable
    /// when selecting a server; i.e. the width of the latency window. Defaults to 15ms.
    pub local_threshold: Option<Duration>,

    /// How long server selection may keep retrying before failing with a timeout error.
    /// Defaults to 30 seconds.
    pub server_selection_timeout: Option<Duration>,

    /// How long to wait for a new connection to be established before erroring.
    pub connect_timeout: Option<Duration>,

    /// How long to wait for the response to any single request before the connection is
    /// considered failed.
    pub socket_timeout: Option<Duration>,

    /// The maximum number of connections each server's pool will open. Defaults to 10.
    pub max_pool_size: Option<u32>,

    /// Whether writes executed with a session should be transparently retried once on
    /// transient failures. Defaults to true.
    pub retry_writes: Option<bool>,

    /// The default selection criteria applied to operations that do not specify one.
    pub selection_criteria: Option<SelectionCriteria>,

    /// The compressors offered to the server during the handshake, in preference order.
    pub compressors: Option<Vec<String>>,

    /// The credential used to authenticate new connections, if any.
    pub credential: Option<Credential>,

    /// A handler for connection pool events.
    pub cmap_event_handler: Option<CmapEventHandlerRef>,

    /// A handler for topology monitoring events.
    pub sdam_event_handler: Option<SdamEventHandlerRef>,
}

impl ClientOptions {
    /// Creates a default set of options with the given seed list.
    pub fn with_hosts(hosts: Vec<ServerAddress>) -> Self {
        Self::builder().hosts(hosts).build()
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn address_parsing() {
        let address = ServerAddress::parse("Example.com:12345").unwrap();
        assert_eq!(
            address,
            ServerAddress::Tcp {
                host: "example.com".into(),
                port: Some(12345),
            }
        );
        assert_eq!(address.to_string(), "example.com:12345");

        let address = ServerAddress::parse("localhost").unwrap();
        assert_eq!(address.port(), None);
        assert_eq!(address.to_string(), "localhost:27017");

        assert!(ServerAddress::parse("").is_err());
        assert!(ServerAddress::parse("host:port:extra").is_err());
        assert!(ServerAddress::parse("host:99999999").is_err());
    }

    #[test]
    fn namespace_parsing() {
        let ns = Namespace::from_full_name("db.some.coll").unwrap();
        assert_eq!(ns.db, "db");
        assert_eq!(ns.coll, "some.coll");
        assert!(Namespace::from_full_name("nodot").is_err());
    }
}
