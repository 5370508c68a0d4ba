//! Client-side collaborators that sit above the topology: credentials and
//! authentication, and sessions with their transaction state machine.

pub mod auth;
pub mod session;
