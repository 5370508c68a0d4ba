pub(crate) mod server_selection;

use std::{collections::HashMap, time::Duration};

use derive_more::Display;

use super::server::{ServerDescription, ServerType};
use crate::{
    bson::oid::ObjectId,
    error::{Error, Result},
    options::{ClientOptions, ServerAddress},
};

/// The possible types for a topology.
#[derive(Clone, Copy, Debug, Display, Eq, PartialEq)]
#[non_exhaustive]
pub enum TopologyType {
    /// A topology connected directly to a single server. Once entered, never left.
    Single,

    /// A replica set with no known primary.
    ReplicaSetNoPrimary,

    /// A replica set with a known primary.
    ReplicaSetWithPrimary,

    /// A sharded cluster of one or more mongos routers.
    Sharded,

    /// The initial state, before any server has been classified.
    Unknown,
}

/// A description of the deployment as a whole. An immutable value: the topology publishes
/// a new description after each change, and `update` is a pure state transition apart from
/// mutating `self`.
#[derive(Clone, Debug)]
pub struct TopologyDescription {
    /// Whether the topology was seeded with a single address and directConnection was
    /// requested.
    pub(crate) single_seed: bool,

    /// The name of the replica set, once known.
    pub set_name: Option<String>,

    /// The type of the topology.
    pub topology_type: TopologyType,

    /// The highest replica set version reported by any primary seen so far.
    pub(crate) max_set_version: Option<i32>,

    /// The highest election id reported by any primary at the highest set version.
    pub(crate) max_election_id: Option<ObjectId>,

    /// Set when any server in the topology has a wire version range incompatible with the
    /// driver. Selection fails while this is set.
    pub(crate) compatibility_error: Option<String>,

    /// The intersection of the logical session timeouts of all data-bearing servers.
    /// `None` when any data-bearing server omits one.
    pub(crate) logical_session_timeout: Option<Duration>,

    pub(crate) local_threshold: Option<Duration>,

    /// The set of monitored servers, keyed by address.
    pub(crate) servers: HashMap<ServerAddress, ServerDescription>,
}

pub(crate) const DEFAULT_LOCAL_THRESHOLD: Duration = Duration::from_millis(15);

impl TopologyDescription {
    pub(crate) fn new(options: &ClientOptions) -> Result<Self> {
        if options.hosts.is_empty() {
            return Err(Error::invalid_argument("at least one seed address is required"));
        }

        let direct = options.direct_connection.unwrap_or(false);
        if direct && options.hosts.len() > 1 {
            return Err(Error::invalid_argument(
                "cannot connect directly to more than one address",
            ));
        }

        let topology_type = if direct {
            TopologyType::Single
        } else if options.repl_set_name.is_some() {
            TopologyType::ReplicaSetNoPrimary
        } else {
            TopologyType::Unknown
        };

        let servers = options
            .hosts
            .iter()
            .map(|address| {
                let description = ServerDescription::new(address.clone());
                (description.address.clone(), description)
            })
            .collect();

        Ok(Self {
            single_seed: direct,
            set_name: options.repl_set_name.clone(),
            topology_type,
            max_set_version: None,
            max_election_id: None,
            compatibility_error: None,
            logical_session_timeout: None,
            local_threshold: options.local_threshold,
            servers,
        })
    }

    /// The addresses of all servers currently in the topology.
    pub fn server_addresses(&self) -> impl Iterator<Item = &ServerAddress> {
        self.servers.keys()
    }

    pub(crate) fn get_server(&self, address: &ServerAddress) -> Option<&ServerDescription> {
        self.servers.get(address)
    }

    pub(crate) fn logical_session_timeout(&self) -> Option<Duration> {
        self.logical_session_timeout
    }

    pub(crate) fn compatibility_error(&self) -> Option<&str> {
        self.compatibility_error.as_deref()
    }

    /// Whether the given description differs from the one currently held for its address.
    pub(crate) fn is_changed(&self, description: &ServerDescription) -> bool {
        self.servers.get(&description.address) != Some(description)
    }

    /// Incorporates a new description of one server, applying the server discovery and
    /// monitoring transitions. Descriptions for servers no longer in the topology are
    /// ignored.
    pub(crate) fn update(&mut self, description: ServerDescription) -> Result<()> {
        if !self.servers.contains_key(&description.address) {
            return Ok(());
        }

        let server_type = description.server_type;
        let address = description.address.clone();
        self.servers.insert(address.clone(), description);

        match (self.topology_type, server_type) {
            // A direct connection tracks its one server and nothing else.
            (TopologyType::Single, _) => {}

            (TopologyType::Unknown, ServerType::Standalone) => {
                self.update_unknown_with_standalone(&address)
            }
            (TopologyType::Unknown, ServerType::Mongos) => {
                self.topology_type = TopologyType::Sharded;
            }
            (TopologyType::Unknown, ServerType::RsPrimary) => {
                self.update_rs_from_primary(&address)?
            }
            (
                TopologyType::Unknown,
                ServerType::RsSecondary | ServerType::RsArbiter | ServerType::RsOther,
            ) => {
                self.topology_type = TopologyType::ReplicaSetNoPrimary;
                self.update_rs_without_primary(&address)?;
            }
            (TopologyType::Unknown, ServerType::Unknown | ServerType::RsGhost) => {}

            (TopologyType::Sharded, ServerType::Mongos | ServerType::Unknown) => {}
            (TopologyType::Sharded, _) => {
                self.servers.remove(&address);
            }

            (
                TopologyType::ReplicaSetNoPrimary,
                ServerType::Standalone | ServerType::Mongos,
            ) => {
                self.servers.remove(&address);
            }
            (TopologyType::ReplicaSetNoPrimary, ServerType::RsPrimary) => {
                self.update_rs_from_primary(&address)?
            }
            (
                TopologyType::ReplicaSetNoPrimary,
                ServerType::RsSecondary | ServerType::RsArbiter | ServerType::RsOther,
            ) => self.update_rs_without_primary(&address)?,
            (TopologyType::ReplicaSetNoPrimary, ServerType::Unknown | ServerType::RsGhost) => {}

            (
                TopologyType::ReplicaSetWithPrimary,
                ServerType::Standalone | ServerType::Mongos,
            ) => {
                self.servers.remove(&address);
                self.check_if_has_primary();
            }
            (
                TopologyType::ReplicaSetWithPrimary,
                ServerType::Unknown | ServerType::RsGhost,
            ) => self.check_if_has_primary(),
            (TopologyType::ReplicaSetWithPrimary, ServerType::RsPrimary) => {
                self.update_rs_from_primary(&address)?
            }
            (
                TopologyType::ReplicaSetWithPrimary,
                ServerType::RsSecondary | ServerType::RsArbiter | ServerType::RsOther,
            ) => self.update_rs_with_primary_from_member(&address)?,
        }

        self.recompute_derived_state();
        Ok(())
    }

    /// A standalone discovered while scanning: keep it only if it was the topology's sole
    /// seed, otherwise it cannot be part of the deployment being looked for.
    fn update_unknown_with_standalone(&mut self, address: &ServerAddress) {
        if self.servers.len() == 1 {
            self.topology_type = TopologyType::Single;
            self.single_seed = true;
        } else {
            self.servers.remove(address);
        }
    }

    fn update_rs_without_primary(&mut self, address: &ServerAddress) -> Result<()> {
        let description = match self.servers.get(address) {
            Some(description) => description.clone(),
            None => return Ok(()),
        };

        if self.set_name.is_none() {
            self.set_name = description.set_name.clone();
        } else if self.set_name != description.set_name {
            self.servers.remove(address);
            return Ok(());
        }

        self.add_new_servers(&description)?;

        if description.invalid_me() {
            self.servers.remove(address);
        }

        Ok(())
    }

    fn update_rs_with_primary_from_member(&mut self, address: &ServerAddress) -> Result<()> {
        let description = match self.servers.get(address) {
            Some(description) => description.clone(),
            None => return Ok(()),
        };

        if self.set_name != description.set_name || description.invalid_me() {
            self.servers.remove(address);
        }

        self.check_if_has_primary();
        Ok(())
    }

    fn update_rs_from_primary(&mut self, address: &ServerAddress) -> Result<()> {
        let description = match self.servers.get(address) {
            Some(description) => description.clone(),
            None => return Ok(()),
        };

        if self.set_name.is_none() {
            self.set_name = description.set_name.clone();
        } else if self.set_name != description.set_name {
            self.servers.remove(address);
            self.check_if_has_primary();
            return Ok(());
        }

        if let Some(set_version) = description.set_version {
            if let Some(election_id) = description.election_id {
                if let (Some(max_set_version), Some(max_election_id)) =
                    (self.max_set_version, self.max_election_id)
                {
                    // A primary from a previous election may report in after the new one.
                    if max_set_version > set_version
                        || (max_set_version == set_version && max_election_id > election_id)
                    {
                        self.servers.insert(
                            address.clone(),
                            ServerDescription::new(address.clone()),
                        );
                        self.check_if_has_primary();
                        return Ok(());
                    }
                }
                self.max_election_id = Some(election_id);
            }

            if self
                .max_set_version
                .map_or(true, |max_set_version| set_version > max_set_version)
            {
                self.max_set_version = Some(set_version);
            }
        }

        // At most one primary: any other server still marked primary reverts to unknown
        // until its next heartbeat.
        let other_primaries: Vec<ServerAddress> = self
            .servers
            .iter()
            .filter(|(other_address, other)| {
                *other_address != address && other.server_type == ServerType::RsPrimary
            })
            .map(|(other_address, _)| other_address.clone())
            .collect();
        for other in other_primaries {
            self.servers
                .insert(other.clone(), ServerDescription::new(other));
        }

        self.add_new_servers(&description)?;

        // The primary's member list is authoritative: drop servers it does not name.
        let members: Result<Vec<ServerAddress>> = description.member_addresses();
        let members = members?;
        self.servers
            .retain(|server_address, _| members.contains(server_address));

        self.check_if_has_primary();
        Ok(())
    }

    fn check_if_has_primary(&mut self) {
        let has_primary = self
            .servers
            .values()
            .any(|server| server.server_type == ServerType::RsPrimary);
        self.topology_type = if has_primary {
            TopologyType::ReplicaSetWithPrimary
        } else {
            TopologyType::ReplicaSetNoPrimary
        };
    }

    /// Adds placeholder descriptions for any members the given server reports that are not
    /// yet monitored.
    fn add_new_servers(&mut self, description: &ServerDescription) -> Result<()> {
        for member in description.member_addresses()? {
            let normalized = ServerDescription::new(member);
            if !self.servers.contains_key(&normalized.address) {
                self.servers.insert(normalized.address.clone(), normalized);
            }
        }
        Ok(())
    }

    fn recompute_derived_state(&mut self) {
        self.compatibility_error = self
            .servers
            .values()
            .find_map(|server| server.compatibility_error_message());

        let mut timeout: Option<Duration> = None;
        let mut any_without = false;
        for server in self
            .servers
            .values()
            .filter(|server| server.server_type.is_data_bearing())
        {
            match server.logical_session_timeout {
                Some(server_timeout) => {
                    timeout = Some(match timeout {
                        Some(current) => current.min(server_timeout),
                        None => server_timeout,
                    });
                }
                None => any_without = true,
            }
        }
        self.logical_session_timeout = if any_without { None } else { timeout };
    }
}

#[cfg(test)]
mod test {
    use pretty_assertions::assert_eq;

    use super::*;
    use crate::hello::{HelloCommandResponse, HelloReply};

    fn address(s: &str) -> ServerAddress {
        ServerAddress::parse(s).unwrap()
    }

    fn options(hosts: &[&str]) -> ClientOptions {
        ClientOptions::with_hosts(hosts.iter().map(|h| address(h)).collect())
    }

    fn reply_description(
        addr: &str,
        response: HelloCommandResponse,
    ) -> ServerDescription {
        let reply = HelloReply {
            server_address: address(addr),
            command_response: response,
            round_trip_time: Duration::from_millis(5),
        };
        ServerDescription::new_from_hello_reply(
            address(addr),
            &reply,
            Duration::from_millis(5),
        )
    }

    fn primary_response(set_name: &str, hosts: &[&str]) -> HelloCommandResponse {
        HelloCommandResponse {
            is_writable_primary: Some(true),
            set_name: Some(set_name.to_string()),
            hosts: Some(hosts.iter().map(|h| h.to_string()).collect()),
            max_wire_version: Some(17),
            min_wire_version: Some(0),
            logical_session_timeout_minutes: Some(30),
            ..Default::default()
        }
    }

    fn secondary_response(set_name: &str, hosts: &[&str]) -> HelloCommandResponse {
        HelloCommandResponse {
            secondary: Some(true),
            set_name: Some(set_name.to_string()),
            hosts: Some(hosts.iter().map(|h| h.to_string()).collect()),
            max_wire_version: Some(17),
            min_wire_version: Some(0),
            logical_session_timeout_minutes: Some(30),
            ..Default::default()
        }
    }

    #[test]
    fn discovers_members_from_primary() {
        let mut topology = TopologyDescription::new(&options(&["a:27017"])).unwrap();
        assert_eq!(topology.topology_type, TopologyType::Unknown);

        let primary = reply_description(
            "a:27017",
            primary_response("rs", &["a:27017", "b:27017", "c:27017"]),
        );
        topology.update(primary).unwrap();

        assert_eq!(topology.topology_type, TopologyType::ReplicaSetWithPrimary);
        assert_eq!(topology.set_name.as_deref(), Some("rs"));
        assert_eq!(topology.servers.len(), 3);
        assert!(topology.servers.contains_key(&address("b:27017")));
        assert!(topology.servers.contains_key(&address("c:27017")));
    }

    #[test]
    fn sole_standalone_seed_yields_single() {
        let mut topology = TopologyDescription::new(&options(&["a:27017"])).unwrap();
        let standalone = reply_description(
            "a:27017",
            HelloCommandResponse {
                is_writable_primary: Some(true),
                max_wire_version: Some(6),
                min_wire_version: Some(0),
                ..Default::default()
            },
        );
        topology.update(standalone).unwrap();

        assert_eq!(topology.topology_type, TopologyType::Single);
        assert_eq!(topology.servers.len(), 1);
        assert_eq!(
            topology.get_server(&address("a:27017")).unwrap().server_type,
            ServerType::Standalone
        );
    }

    #[test]
    fn full_replica_set_scan_classifies_every_member() {
        let mut topology = TopologyDescription::new(&options(&["a:27017"])).unwrap();
        let hosts = ["a:27017", "b:27017", "c:27017"];
        topology
            .update(reply_description("a:27017", primary_response("rs0", &hosts)))
            .unwrap();
        topology
            .update(reply_description("b:27017", secondary_response("rs0", &hosts)))
            .unwrap();
        topology
            .update(reply_description("c:27017", secondary_response("rs0", &hosts)))
            .unwrap();

        assert_eq!(topology.topology_type, TopologyType::ReplicaSetWithPrimary);
        let mut primaries = 0;
        let mut secondaries = 0;
        for server in topology.servers.values() {
            match server.server_type {
                ServerType::RsPrimary => primaries += 1,
                ServerType::RsSecondary => secondaries += 1,
                other => panic!("unexpected server type {:?}", other),
            }
        }
        assert_eq!(primaries, 1);
        assert_eq!(secondaries, 2);
    }

    #[test]
    fn reapplying_the_same_description_changes_nothing() {
        let mut topology = TopologyDescription::new(&options(&["a:27017"])).unwrap();
        let primary = reply_description(
            "a:27017",
            primary_response("rs", &["a:27017", "b:27017"]),
        );
        topology.update(primary.clone()).unwrap();
        assert!(!topology.is_changed(&primary));

        let snapshot = topology.servers.clone();
        let type_before = topology.topology_type;
        topology.update(primary).unwrap();

        assert_eq!(topology.topology_type, type_before);
        assert_eq!(topology.servers, snapshot);
    }

    #[test]
    fn host_lists_are_lowercased() {
        let mut topology = TopologyDescription::new(&options(&["a:27017"])).unwrap();
        let primary = reply_description(
            "a:27017",
            primary_response("rs", &["a:27017", "B:27017"]),
        );
        topology.update(primary).unwrap();
        assert!(topology.servers.contains_key(&address("b:27017")));
    }

    #[test]
    fn single_is_sticky() {
        let mut options = options(&["a:27017"]);
        options.direct_connection = Some(true);
        let mut topology = TopologyDescription::new(&options).unwrap();
        assert_eq!(topology.topology_type, TopologyType::Single);

        // Even a mongos response does not change the type or the member set.
        let mongos = reply_description(
            "a:27017",
            HelloCommandResponse {
                msg: Some("isdbgrid".to_string()),
                max_wire_version: Some(17),
                min_wire_version: Some(0),
                ..Default::default()
            },
        );
        topology.update(mongos).unwrap();
        assert_eq!(topology.topology_type, TopologyType::Single);
        assert_eq!(topology.servers.len(), 1);
    }

    #[test]
    fn standalone_among_multiple_seeds_is_removed() {
        let mut topology =
            TopologyDescription::new(&options(&["a:27017", "b:27017"])).unwrap();
        let standalone = reply_description(
            "a:27017",
            HelloCommandResponse {
                is_writable_primary: Some(true),
                max_wire_version: Some(17),
                min_wire_version: Some(0),
                ..Default::default()
            },
        );
        topology.update(standalone).unwrap();
        assert_eq!(topology.topology_type, TopologyType::Unknown);
        assert!(!topology.servers.contains_key(&address("a:27017")));
    }

    #[test]
    fn at_most_one_primary() {
        let mut topology =
            TopologyDescription::new(&options(&["a:27017", "b:27017"])).unwrap();
        let hosts = ["a:27017", "b:27017"];
        topology
            .update(reply_description("a:27017", primary_response("rs", &hosts)))
            .unwrap();
        topology
            .update(reply_description("b:27017", primary_response("rs", &hosts)))
            .unwrap();

        let primaries: Vec<_> = topology
            .servers
            .values()
            .filter(|server| server.server_type == ServerType::RsPrimary)
            .collect();
        assert_eq!(primaries.len(), 1);
        assert_eq!(primaries[0].address, address("b:27017"));
        assert_eq!(topology.topology_type, TopologyType::ReplicaSetWithPrimary);
    }

    #[test]
    fn stale_primary_is_marked_unknown() {
        let mut topology =
            TopologyDescription::new(&options(&["a:27017", "b:27017"])).unwrap();
        let hosts = ["a:27017", "b:27017"];

        let first_id = ObjectId::new();
        let second_id = ObjectId::new();
        let (older, newer) = if first_id < second_id {
            (first_id, second_id)
        } else {
            (second_id, first_id)
        };

        let mut first = primary_response("rs", &hosts);
        first.set_version = Some(1);
        first.election_id = Some(newer);
        topology
            .update(reply_description("a:27017", first))
            .unwrap();

        let mut stale = primary_response("rs", &hosts);
        stale.set_version = Some(1);
        stale.election_id = Some(older);
        topology
            .update(reply_description("b:27017", stale))
            .unwrap();

        assert_eq!(
            topology.servers[&address("b:27017")].server_type,
            ServerType::Unknown
        );
        assert_eq!(
            topology.servers[&address("a:27017")].server_type,
            ServerType::RsPrimary
        );
    }

    #[test]
    fn primary_member_list_is_authoritative() {
        let mut topology = TopologyDescription::new(&options(&["a:27017", "b:27017"]))
            .unwrap();
        topology
            .update(reply_description("a:27017", primary_response("rs", &["a:27017"])))
            .unwrap();
        assert!(!topology.servers.contains_key(&address("b:27017")));
    }

    #[test]
    fn secondary_with_wrong_set_name_is_removed() {
        let mut options = options(&["a:27017"]);
        options.repl_set_name = Some("expected".to_string());
        let mut topology = TopologyDescription::new(&options).unwrap();
        assert_eq!(topology.topology_type, TopologyType::ReplicaSetNoPrimary);

        topology
            .update(reply_description(
                "a:27017",
                secondary_response("other", &["a:27017"]),
            ))
            .unwrap();
        assert!(topology.servers.is_empty());
    }

    #[test]
    fn me_mismatch_removes_secondary() {
        let mut topology = TopologyDescription::new(&options(&["a:27017"])).unwrap();
        let mut response = secondary_response("rs", &["b:27017"]);
        response.me = Some("b:27017".to_string());
        topology
            .update(reply_description("a:27017", response))
            .unwrap();

        assert!(!topology.servers.contains_key(&address("a:27017")));
        // The member it reported is still added for monitoring.
        assert!(topology.servers.contains_key(&address("b:27017")));
    }

    #[test]
    fn primary_demoted_on_unknown_heartbeat() {
        let mut topology = TopologyDescription::new(&options(&["a:27017"])).unwrap();
        topology
            .update(reply_description("a:27017", primary_response("rs", &["a:27017"])))
            .unwrap();
        assert_eq!(topology.topology_type, TopologyType::ReplicaSetWithPrimary);

        topology
            .update(ServerDescription::new_from_error(
                address("a:27017"),
                Error::internal("heartbeat failed"),
            ))
            .unwrap();
        assert_eq!(topology.topology_type, TopologyType::ReplicaSetNoPrimary);
    }

    #[test]
    fn updates_for_removed_servers_are_ignored() {
        let mut topology = TopologyDescription::new(&options(&["a:27017"])).unwrap();
        let before = topology.servers.len();
        topology
            .update(reply_description("z:27017", secondary_response("rs", &[])))
            .unwrap();
        assert_eq!(topology.servers.len(), before);
        assert_eq!(topology.topology_type, TopologyType::Unknown);
    }

    #[test]
    fn ghost_does_not_change_topology() {
        let mut topology = TopologyDescription::new(&options(&["a:27017"])).unwrap();
        topology
            .update(reply_description(
                "a:27017",
                HelloCommandResponse {
                    is_replica_set: Some(true),
                    max_wire_version: Some(17),
                    min_wire_version: Some(0),
                    ..Default::default()
                },
            ))
            .unwrap();
        assert_eq!(topology.topology_type, TopologyType::Unknown);
        assert_eq!(topology.servers.len(), 1);
    }

    #[test]
    fn incompatible_wire_version_sets_error() {
        let mut topology = TopologyDescription::new(&options(&["a:27017"])).unwrap();
        let mut response = primary_response("rs", &["a:27017"]);
        response.max_wire_version = Some(1);
        response.min_wire_version = Some(0);
        topology
            .update(reply_description("a:27017", response))
            .unwrap();
        assert!(topology.compatibility_error().is_some());
    }

    #[test]
    fn session_timeout_is_minimum_across_data_bearing_servers() {
        let mut topology =
            TopologyDescription::new(&options(&["a:27017", "b:27017"])).unwrap();
        let hosts = ["a:27017", "b:27017"];

        let mut primary = primary_response("rs", &hosts);
        primary.logical_session_timeout_minutes = Some(30);
        topology
            .update(reply_description("a:27017", primary))
            .unwrap();
        // The unchecked secondary does not yet count against the minimum.
        assert_eq!(
            topology.logical_session_timeout(),
            Some(Duration::from_secs(30 * 60))
        );

        let mut secondary = secondary_response("rs", &hosts);
        secondary.logical_session_timeout_minutes = Some(10);
        topology
            .update(reply_description("b:27017", secondary))
            .unwrap();
        assert_eq!(
            topology.logical_session_timeout(),
            Some(Duration::from_secs(10 * 60))
        );
    }

    #[test]
    fn sharded_removes_non_mongos() {
        let mut topology =
            TopologyDescription::new(&options(&["a:27017", "b:27017"])).unwrap();
        topology
            .update(reply_description(
                "a:27017",
                HelloCommandResponse {
                    msg: Some("isdbgrid".to_string()),
                    max_wire_version: Some(17),
                    min_wire_version: Some(0),
                    ..Default::default()
                },
            ))
            .unwrap();
        assert_eq!(topology.topology_type, TopologyType::Sharded);

        topology
            .update(reply_description(
                "b:27017",
                secondary_response("rs", &["b:27017"]),
            ))
            .unwrap();
        assert!(!topology.servers.contains_key(&address("b:27017")));
    }
}
