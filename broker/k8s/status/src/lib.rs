//! Publishes each managed cluster's connectivity to its resource.
//!
//! Requests are coalesced per cluster and applied one at a time, retrying
//! failures with exponential backoff.

#![deny(warnings, rust_2018_idioms)]
#![forbid(unsafe_code)]

mod controller;
mod pending;

#[cfg(test)]
mod tests;

pub use self::controller::{Config, Controller, ControllerMetrics, Update};
