//! Server discovery and monitoring: tracking what kind of deployment is on the other end
//! of the seed addresses, keeping a live description of every server in it, and choosing
//! the right server for each operation.

pub(crate) mod description;
mod monitor;
mod server;
mod topology;

pub use self::{
    description::server::{ServerDescription, ServerType},
    description::topology::{TopologyDescription, TopologyType},
    server::Server,
    topology::Topology,
};
