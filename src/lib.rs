//! Flotilla - run shell commands on a fleet of hosts in parallel

pub mod broadcast;
pub mod cli;
pub mod connect;
pub mod endpoints;
pub mod error;
pub mod executor;
pub mod input;
pub mod logging;
pub mod models;
pub mod output;
pub mod parser;
pub mod report;
pub mod runner;
pub mod signal;
pub mod tasks;
