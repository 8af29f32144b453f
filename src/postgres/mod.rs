// ABOUTME: PostgreSQL utilities module
// ABOUTME: Exports pool construction and the per-environment connection manager

pub mod connection;
pub mod manager;

pub use connection::{build_pool, ping, server_version};
pub use manager::ConnectionManager;
