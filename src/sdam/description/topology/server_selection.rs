//! Filtering the topology down to the servers suitable for an operation.

use std::time::Duration;

use rand::seq::SliceRandom;

use super::{TopologyDescription, TopologyType, DEFAULT_LOCAL_THRESHOLD};
use crate::{
    error::{ErrorKind, Result},
    sdam::description::server::{ServerDescription, ServerType},
    selection_criteria::{ReadPreference, SelectionCriteria, TagSet},
};

impl TopologyDescription {
    /// Picks a random server out of those suitable for the given criteria. `Ok(None)`
    /// means no server is currently suitable; the caller retries until its deadline.
    pub(crate) fn select_server(
        &self,
        criteria: &SelectionCriteria,
    ) -> Result<Option<&ServerDescription>> {
        let suitable = self.suitable_servers_in_latency_window(criteria)?;
        Ok(suitable.choose(&mut rand::thread_rng()).copied())
    }

    /// All servers suitable for the criteria that also fall within the latency window:
    /// those whose average round trip time is within `local_threshold` of the fastest
    /// suitable server.
    pub(crate) fn suitable_servers_in_latency_window(
        &self,
        criteria: &SelectionCriteria,
    ) -> Result<Vec<&ServerDescription>> {
        if let Some(message) = self.compatibility_error() {
            return Err(ErrorKind::ServerSelection {
                message: message.to_string(),
            }
            .into());
        }

        let mut suitable = self.suitable_servers(criteria);

        let shortest = suitable
            .iter()
            .filter_map(|server| server.average_round_trip_time)
            .min();
        if let Some(shortest) = shortest {
            let threshold = self.local_threshold.unwrap_or(DEFAULT_LOCAL_THRESHOLD);
            suitable.retain(|server| match server.average_round_trip_time {
                Some(rtt) => rtt <= shortest + threshold,
                None => false,
            });
        }

        Ok(suitable)
    }

    fn suitable_servers(&self, criteria: &SelectionCriteria) -> Vec<&ServerDescription> {
        match self.topology_type {
            TopologyType::Unknown => Vec::new(),
            // A direct connection serves every operation from its one server.
            TopologyType::Single => self
                .servers
                .values()
                .filter(|server| server.server_type.is_available())
                .collect(),
            TopologyType::Sharded => self.servers_with_type(&[ServerType::Mongos]),
            TopologyType::ReplicaSetNoPrimary | TopologyType::ReplicaSetWithPrimary => {
                match criteria {
                    SelectionCriteria::ReadPreference(read_preference) => {
                        self.suitable_servers_for_read_preference(read_preference)
                    }
                    SelectionCriteria::Predicate(predicate) => self
                        .servers
                        .values()
                        .filter(|server| server.server_type.is_data_bearing())
                        .filter(|server| predicate(server))
                        .collect(),
                }
            }
        }
    }

    fn suitable_servers_for_read_preference(
        &self,
        read_preference: &ReadPreference,
    ) -> Vec<&ServerDescription> {
        match read_preference {
            ReadPreference::Primary => self.servers_with_type(&[ServerType::RsPrimary]),
            ReadPreference::Secondary { options } => {
                self.filter_by_tag_sets(
                    self.servers_with_type(&[ServerType::RsSecondary]),
                    options.tag_sets.as_deref(),
                )
            }
            ReadPreference::PrimaryPreferred { options } => {
                let primaries = self.servers_with_type(&[ServerType::RsPrimary]);
                if !primaries.is_empty() {
                    primaries
                } else {
                    self.filter_by_tag_sets(
                        self.servers_with_type(&[ServerType::RsSecondary]),
                        options.tag_sets.as_deref(),
                    )
                }
            }
            ReadPreference::SecondaryPreferred { options } => {
                let secondaries = self.filter_by_tag_sets(
                    self.servers_with_type(&[ServerType::RsSecondary]),
                    options.tag_sets.as_deref(),
                );
                if !secondaries.is_empty() {
                    secondaries
                } else {
                    self.servers_with_type(&[ServerType::RsPrimary])
                }
            }
            ReadPreference::Nearest { options } => self.filter_by_tag_sets(
                self.servers_with_type(&[ServerType::RsPrimary, ServerType::RsSecondary]),
                options.tag_sets.as_deref(),
            ),
        }
    }

    fn servers_with_type(&self, types: &[ServerType]) -> Vec<&ServerDescription> {
        self.servers
            .values()
            .filter(|server| types.contains(&server.server_type))
            .collect()
    }

    /// Applies an ordered list of tag sets: the first set matched by at least one server
    /// is the one used. An empty list, or an empty set within the list, matches everything.
    fn filter_by_tag_sets<'a>(
        &self,
        servers: Vec<&'a ServerDescription>,
        tag_sets: Option<&[TagSet]>,
    ) -> Vec<&'a ServerDescription> {
        let tag_sets = match tag_sets {
            Some(tag_sets) if !tag_sets.is_empty() => tag_sets,
            _ => return servers,
        };

        for tag_set in tag_sets {
            let matching: Vec<&ServerDescription> = servers
                .iter()
                .filter(|server| server.matches_tag_set(tag_set))
                .copied()
                .collect();
            if !matching.is_empty() {
                return matching;
            }
        }

        Vec::new()
    }
}

#[cfg(test)]
mod test {
    use std::{collections::HashMap, sync::Arc};

    use pretty_assertions::assert_eq;

    use super::*;
    use crate::{
        options::{ClientOptions, ServerAddress},
        selection_criteria::ReadPreferenceOptions,
    };

    fn address(s: &str) -> ServerAddress {
        ServerAddress::parse(s).unwrap()
    }

    fn server(
        addr: &str,
        server_type: ServerType,
        rtt_ms: u64,
        tags: Option<TagSet>,
    ) -> ServerDescription {
        let mut description = ServerDescription::new(address(addr));
        description.server_type = server_type;
        description.average_round_trip_time = Some(Duration::from_millis(rtt_ms));
        description.tags = tags;
        description
    }

    fn replica_set(servers: Vec<ServerDescription>) -> TopologyDescription {
        let addresses: Vec<ServerAddress> =
            servers.iter().map(|server| server.address.clone()).collect();
        let mut topology =
            TopologyDescription::new(&ClientOptions::with_hosts(addresses)).unwrap();
        let has_primary = servers
            .iter()
            .any(|server| server.server_type == ServerType::RsPrimary);
        topology.topology_type = if has_primary {
            TopologyType::ReplicaSetWithPrimary
        } else {
            TopologyType::ReplicaSetNoPrimary
        };
        topology.servers = servers
            .into_iter()
            .map(|server| (server.address.clone(), server))
            .collect();
        topology
    }

    fn tags(pairs: &[(&str, &str)]) -> TagSet {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect::<HashMap<_, _>>()
    }

    fn with_tag_sets(tag_sets: Vec<TagSet>) -> ReadPreferenceOptions {
        ReadPreferenceOptions::builder().tag_sets(Some(tag_sets)).build()
    }

    fn addresses(servers: &[&ServerDescription]) -> Vec<String> {
        let mut addresses: Vec<String> = servers
            .iter()
            .map(|server| server.address.to_string())
            .collect();
        addresses.sort();
        addresses
    }

    #[test]
    fn primary_read_preference() {
        let topology = replica_set(vec![
            server("a:27017", ServerType::RsPrimary, 10, None),
            server("b:27017", ServerType::RsSecondary, 10, None),
        ]);
        let criteria = SelectionCriteria::ReadPreference(ReadPreference::Primary);
        let suitable = topology.suitable_servers_in_latency_window(&criteria).unwrap();
        assert_eq!(addresses(&suitable), vec!["a:27017"]);
    }

    #[test]
    fn primary_preferred_falls_back_to_secondaries() {
        let topology = replica_set(vec![
            server("b:27017", ServerType::RsSecondary, 10, None),
            server("c:27017", ServerType::RsSecondary, 10, None),
        ]);
        let criteria = SelectionCriteria::ReadPreference(ReadPreference::PrimaryPreferred {
            options: ReadPreferenceOptions::default(),
        });
        let suitable = topology.suitable_servers_in_latency_window(&criteria).unwrap();
        assert_eq!(addresses(&suitable), vec!["b:27017", "c:27017"]);
    }

    #[test]
    fn secondary_preferred_falls_back_to_primary() {
        let topology = replica_set(vec![server("a:27017", ServerType::RsPrimary, 10, None)]);
        let criteria = SelectionCriteria::ReadPreference(ReadPreference::SecondaryPreferred {
            options: ReadPreferenceOptions::default(),
        });
        let suitable = topology.suitable_servers_in_latency_window(&criteria).unwrap();
        assert_eq!(addresses(&suitable), vec!["a:27017"]);
    }

    #[test]
    fn tag_sets_are_tried_in_order() {
        let topology = replica_set(vec![
            server("a:27017", ServerType::RsPrimary, 10, None),
            server(
                "b:27017",
                ServerType::RsSecondary,
                10,
                Some(tags(&[("dc", "west")])),
            ),
            server(
                "c:27017",
                ServerType::RsSecondary,
                10,
                Some(tags(&[("dc", "east")])),
            ),
        ]);

        // No server matches the first set, so the second is used.
        let criteria = SelectionCriteria::ReadPreference(ReadPreference::Secondary {
            options: with_tag_sets(vec![tags(&[("dc", "north")]), tags(&[("dc", "east")])]),
        });
        let suitable = topology.suitable_servers_in_latency_window(&criteria).unwrap();
        assert_eq!(addresses(&suitable), vec!["c:27017"]);

        // An empty tag set matches every secondary.
        let criteria = SelectionCriteria::ReadPreference(ReadPreference::Secondary {
            options: with_tag_sets(vec![tags(&[("dc", "north")]), tags(&[])]),
        });
        let suitable = topology.suitable_servers_in_latency_window(&criteria).unwrap();
        assert_eq!(addresses(&suitable), vec!["b:27017", "c:27017"]);

        // No set matches at all.
        let criteria = SelectionCriteria::ReadPreference(ReadPreference::Secondary {
            options: with_tag_sets(vec![tags(&[("dc", "north")])]),
        });
        let suitable = topology.suitable_servers_in_latency_window(&criteria).unwrap();
        assert!(suitable.is_empty());
    }

    #[test]
    fn latency_window_excludes_slow_servers() {
        let topology = replica_set(vec![
            server("a:27017", ServerType::RsSecondary, 10, None),
            server("b:27017", ServerType::RsSecondary, 20, None),
            server("c:27017", ServerType::RsSecondary, 100, None),
        ]);
        let criteria = SelectionCriteria::ReadPreference(ReadPreference::Secondary {
            options: ReadPreferenceOptions::default(),
        });
        let suitable = topology.suitable_servers_in_latency_window(&criteria).unwrap();
        // Window is fastest (10ms) plus the 15ms default threshold.
        assert_eq!(addresses(&suitable), vec!["a:27017", "b:27017"]);
    }

    #[test]
    fn predicate_criteria() {
        let topology = replica_set(vec![
            server("a:27017", ServerType::RsPrimary, 10, None),
            server("b:27017", ServerType::RsSecondary, 10, None),
            server("c:27017", ServerType::RsArbiter, 10, None),
        ]);
        let criteria = SelectionCriteria::Predicate(Arc::new(|server: &ServerDescription| {
            server.address.to_string() != "a:27017"
        }));
        let suitable = topology.suitable_servers_in_latency_window(&criteria).unwrap();
        // Arbiters are not data bearing and never selected.
        assert_eq!(addresses(&suitable), vec!["b:27017"]);
    }

    #[test]
    fn unknown_topology_has_no_suitable_servers() {
        let mut topology = replica_set(vec![server(
            "a:27017",
            ServerType::RsPrimary,
            10,
            None,
        )]);
        topology.topology_type = TopologyType::Unknown;
        let criteria = SelectionCriteria::ReadPreference(ReadPreference::Primary);
        assert!(topology
            .suitable_servers_in_latency_window(&criteria)
            .unwrap()
            .is_empty());
    }

    #[test]
    fn selection_is_random_within_the_window() {
        let topology = replica_set(vec![
            server("a:27017", ServerType::RsSecondary, 10, None),
            server("b:27017", ServerType::RsSecondary, 10, None),
        ]);
        let criteria = SelectionCriteria::ReadPreference(ReadPreference::Secondary {
            options: ReadPreferenceOptions::default(),
        });

        let mut seen = std::collections::HashSet::new();
        for _ in 0..200 {
            if let Some(server) = topology.select_server(&criteria).unwrap() {
                seen.insert(server.address.to_string());
            }
        }
        assert_eq!(seen.len(), 2);
    }
}
