//! Core library for the chamber_scan application.
//!
//! Drives a 3-axis measurement chamber and a vector network analyzer through a
//! spatial sweep, records S-parameter traces at every mesh point and writes them
//! to a self-describing result file. It is used by the `chamber_scan` binary and
//! by the integration tests, which run against the simulated hardware in
//! [`hardware::mock`].

pub mod config;
pub mod data;
pub mod error;
pub mod error_recovery;
pub mod experiment;
pub mod hardware;
pub mod metadata;
pub mod timing;
