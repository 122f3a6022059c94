//! dbserver: the TCP metadata protocol (spec.md §4.7). `message` is the
//! wire framing, `client` is a single connection, `pool` is the
//! Connection Manager that probes for the port and shares connections
//! across callers.

pub mod client;
pub mod message;
pub mod pool;
