//! OS-facing collaborators: interface counters, the connection table, and
//! the startup checks that verify both plus the load generator.

pub mod connections;
pub mod counters;
pub mod preflight;
