use std::time::Duration;

use derive_more::Display;

use crate::{
    bson::oid::ObjectId,
    error::Error,
    hello::HelloReply,
    options::ServerAddress,
    selection_criteria::TagSet,
};

/// The oldest wire version the driver can speak to.
pub(crate) const MIN_SUPPORTED_WIRE_VERSION: i32 = 2;

/// The newest wire version the driver can speak to.
pub(crate) const MAX_SUPPORTED_WIRE_VERSION: i32 = 21;

/// The possible types for a server.
#[derive(Clone, Copy, Debug, Display, Eq, PartialEq)]
#[non_exhaustive]
pub enum ServerType {
    /// A single server not in a replica set or sharded cluster.
    Standalone,

    /// A router in a sharded cluster.
    Mongos,

    /// The primary of a replica set.
    RsPrimary,

    /// A secondary in a replica set.
    RsSecondary,

    /// An arbiter in a replica set.
    RsArbiter,

    /// A hidden, starting, or otherwise non-selectable replica set member.
    RsOther,

    /// A server started with --replSet that has not yet joined a set.
    RsGhost,

    /// A server whose type is not yet known or whose last check failed.
    Unknown,
}

impl ServerType {
    /// Whether this server holds data and can serve reads or writes.
    pub(crate) fn is_data_bearing(self) -> bool {
        matches!(
            self,
            ServerType::Standalone
                | ServerType::Mongos
                | ServerType::RsPrimary
                | ServerType::RsSecondary
        )
    }

    pub(crate) fn is_available(self) -> bool {
        self != ServerType::Unknown
    }
}

impl Default for ServerType {
    fn default() -> Self {
        ServerType::Unknown
    }
}

/// A description of the most up-to-date information known about a server, derived from its
/// last heartbeat. Immutable once constructed.
#[derive(Clone, Debug)]
pub struct ServerDescription {
    /// The address the client reaches this server at. Always lowercase.
    pub address: ServerAddress,

    /// The type of the server.
    pub server_type: ServerType,

    /// The exponentially-weighted moving average round trip time of the server's
    /// heartbeats. `None` until the first successful heartbeat.
    pub average_round_trip_time: Option<Duration>,

    /// The error that caused the server to become unknown, if any.
    pub(crate) error: Option<Error>,

    pub(crate) set_name: Option<String>,
    pub(crate) set_version: Option<i32>,
    pub(crate) election_id: Option<ObjectId>,

    /// The address this server believes it is known by.
    pub(crate) me: Option<String>,

    /// All set members this server reports, lowercased.
    pub(crate) hosts: Vec<String>,

    pub(crate) tags: Option<TagSet>,

    pub(crate) min_wire_version: Option<i32>,
    pub(crate) max_wire_version: Option<i32>,

    pub(crate) logical_session_timeout: Option<Duration>,
}

impl PartialEq for ServerDescription {
    fn eq(&self, other: &Self) -> bool {
        // Round trip time and the exact error value are excluded: two consecutive failed
        // heartbeats describe the same (unknown) server.
        self.address == other.address
            && self.server_type == other.server_type
            && self.error.is_some() == other.error.is_some()
            && self.set_name == other.set_name
            && self.set_version == other.set_version
            && self.election_id == other.election_id
            && self.me == other.me
            && self.hosts == other.hosts
            && self.tags == other.tags
            && self.min_wire_version == other.min_wire_version
            && self.max_wire_version == other.max_wire_version
    }
}

impl ServerDescription {
    /// A placeholder description for a server that has not been checked yet.
    pub(crate) fn new(address: ServerAddress) -> Self {
        Self {
            address: normalize_address(address),
            server_type: ServerType::Unknown,
            average_round_trip_time: None,
            error: None,
            set_name: None,
            set_version: None,
            election_id: None,
            me: None,
            hosts: Vec::new(),
            tags: None,
            min_wire_version: None,
            max_wire_version: None,
            logical_session_timeout: None,
        }
    }

    pub(crate) fn new_from_hello_reply(
        address: ServerAddress,
        reply: &HelloReply,
        average_round_trip_time: Duration,
    ) -> Self {
        let response = &reply.command_response;
        let mut description = Self::new(address);
        description.server_type = response.server_type();
        description.average_round_trip_time = Some(average_round_trip_time);
        description.set_name = response.set_name.clone();
        description.set_version = response.set_version;
        description.election_id = response.election_id;
        description.me = response.me.as_deref().map(str::to_lowercase);
        description.hosts = response.known_hosts().map(|host| host.to_lowercase()).collect();
        description.tags = response.tags.clone();
        description.min_wire_version = response.min_wire_version;
        description.max_wire_version = response.max_wire_version;
        description.logical_session_timeout = response.logical_session_timeout();
        description
    }

    /// The description of a server whose last check failed.
    pub(crate) fn new_from_error(address: ServerAddress, error: Error) -> Self {
        let mut description = Self::new(address);
        description.error = Some(error);
        description
    }

    /// Whether the client used an address for this server other than the one it believes
    /// it is known by. Such a member is removed from replica set topologies.
    pub(crate) fn invalid_me(&self) -> bool {
        match &self.me {
            Some(me) => me != &self.address.to_string(),
            None => false,
        }
    }

    /// An error message when this server's wire version range does not overlap the
    /// driver's, `None` when compatible.
    pub(crate) fn compatibility_error_message(&self) -> Option<String> {
        if self.server_type == ServerType::Unknown {
            return None;
        }
        let max = self.max_wire_version?;
        if max < MIN_SUPPORTED_WIRE_VERSION {
            return Some(format!(
                "server at {} reports maximum wire version {}, but this driver requires at \
                 least {}",
                self.address, max, MIN_SUPPORTED_WIRE_VERSION,
            ));
        }
        let min = self.min_wire_version?;
        if min > MAX_SUPPORTED_WIRE_VERSION {
            return Some(format!(
                "server at {} requires minimum wire version {}, but this driver supports at \
                 most {}",
                self.address, min, MAX_SUPPORTED_WIRE_VERSION,
            ));
        }
        None
    }

    /// Whether this server's tags contain every tag in the given set.
    pub(crate) fn matches_tag_set(&self, tag_set: &TagSet) -> bool {
        let tags = match &self.tags {
            Some(tags) => tags,
            None => return tag_set.is_empty(),
        };
        tag_set
            .iter()
            .all(|(key, value)| tags.get(key) == Some(value))
    }

    pub(crate) fn member_addresses(&self) -> crate::error::Result<Vec<ServerAddress>> {
        self.hosts
            .iter()
            .map(|host| ServerAddress::parse(host))
            .collect()
    }
}

fn normalize_address(address: ServerAddress) -> ServerAddress {
    match address {
        ServerAddress::Tcp { host, port } => ServerAddress::Tcp {
            host: host.to_lowercase(),
            port,
        },
    }
}
