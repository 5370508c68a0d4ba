//! Events describing changes to the driver's view of the deployment.

use std::time::Duration;

use crate::{
    error::Error,
    options::ServerAddress,
    sdam::{ServerDescription, TopologyDescription},
};

/// Emitted when the monitored view of a single server changes.
#[derive(Clone, Debug)]
#[non_exhaustive]
pub struct ServerDescriptionChangedEvent {
    /// The address of the server.
    pub address: ServerAddress,

    /// The description before the change.
    pub previous_description: ServerDescription,

    /// The description after the change.
    pub new_description: ServerDescription,
}

/// Emitted when the topology description as a whole changes.
#[derive(Clone, Debug)]
#[non_exhaustive]
pub struct TopologyDescriptionChangedEvent {
    /// The description before the change.
    pub previous_description: TopologyDescription,

    /// The description after the change.
    pub new_description: TopologyDescription,
}

/// Emitted when a server is added to the topology.
#[derive(Clone, Debug)]
#[non_exhaustive]
pub struct ServerOpeningEvent {
    /// The address of the server.
    pub address: ServerAddress,
}

/// Emitted when a server is removed from the topology.
#[derive(Clone, Debug)]
#[non_exhaustive]
pub struct ServerClosedEvent {
    /// The address of the server.
    pub address: ServerAddress,
}

/// Emitted when the topology starts monitoring.
#[derive(Clone, Debug)]
#[non_exhaustive]
pub struct TopologyOpeningEvent {}

/// Emitted when the topology shuts down.
#[derive(Clone, Debug)]
#[non_exhaustive]
pub struct TopologyClosedEvent {}

/// Emitted when a monitor begins a heartbeat.
#[derive(Clone, Debug)]
#[non_exhaustive]
pub struct ServerHeartbeatStartedEvent {
    /// The address of the server being checked.
    pub address: ServerAddress,
}

/// Emitted when a heartbeat completes successfully.
#[derive(Clone, Debug)]
#[non_exhaustive]
pub struct ServerHeartbeatSucceededEvent {
    /// The address of the server that was checked.
    pub address: ServerAddress,

    /// How long the check took.
    pub duration: Duration,
}

/// Emitted when a heartbeat fails. The monitor marks the server unknown when this fires.
#[derive(Clone, Debug)]
#[non_exhaustive]
pub struct ServerHeartbeatFailedEvent {
    /// The address of the server that was checked.
    pub address: ServerAddress,

    /// How long the check took before failing.
    pub duration: Duration,

    /// The error that caused the check to fail.
    pub failure: Error,
}

/// An interface for handling topology monitoring events. Methods default to no-ops.
pub trait SdamEventHandler: Send + Sync {
    /// Handles a [`ServerDescriptionChangedEvent`].
    fn handle_server_description_changed_event(&self, _event: ServerDescriptionChangedEvent) {}

    /// Handles a [`TopologyDescriptionChangedEvent`].
    fn handle_topology_description_changed_event(&self, _event: TopologyDescriptionChangedEvent) {}

    /// Handles a [`ServerOpeningEvent`].
    fn handle_server_opening_event(&self, _event: ServerOpeningEvent) {}

    /// Handles a [`ServerClosedEvent`].
    fn handle_server_closed_event(&self, _event: ServerClosedEvent) {}

    /// Handles a [`TopologyOpeningEvent`].
    fn handle_topology_opening_event(&self, _event: TopologyOpeningEvent) {}

    /// Handles a [`TopologyClosedEvent`].
    fn handle_topology_closed_event(&self, _event: TopologyClosedEvent) {}

    /// Handles a [`ServerHeartbeatStartedEvent`].
    fn handle_server_heartbeat_started_event(&self, _event: ServerHeartbeatStartedEvent) {}

    /// Handles a [`ServerHeartbeatSucceededEvent`].
    fn handle_server_heartbeat_succeeded_event(&self, _event: ServerHeartbeatSucceededEvent) {}

    /// Handles a [`ServerHeartbeatFailedEvent`].
    fn handle_server_heartbeat_failed_event(&self, _event: ServerHeartbeatFailedEvent) {}
}
