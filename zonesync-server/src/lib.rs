//! zonesync server - runs one zonesync node
//!
//! Loads the node configuration, opens the store, recovers interrupted
//! sessions and replicates with the configured peers until interrupted.

pub mod config;
