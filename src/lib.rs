pub mod assertions;
pub mod cli;
pub mod cloud;
pub mod cluster;
pub mod command;
pub mod config;
pub mod factory;
pub mod logging;
pub mod remote;
pub mod retry;
pub mod scenarios;
pub mod scheduler;

pub use crate::cluster::Cluster;
pub use crate::factory::{ClustersFactory, TeardownGuard};
