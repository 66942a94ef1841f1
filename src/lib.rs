//! doltkeeper - supervisor and branch-isolated write coordination for a
//! shared Dolt SQL server

pub mod branch;
pub mod commands;
pub mod config;
pub mod error;
pub mod lock;
pub mod paths;
pub mod redispatch;
pub mod retry;
pub mod routing;
pub mod server;
pub mod signal;
pub mod sql;
pub mod subprocess;
pub mod supervisor;
pub mod telemetry;

#[cfg(test)]
mod testing;
