//! Wires the broker together: the client-facing request router, caller
//! authentication and authorization, and the process runtime.

#![deny(warnings, rust_2018_idioms)]
#![forbid(unsafe_code)]

pub use tunnel_broker_core as core;
pub use tunnel_broker_k8s_api as k8s;
pub use tunnel_broker_k8s_index as index;
pub use tunnel_broker_k8s_status as status;
pub use tunnel_broker_proxy as proxy;
pub use tunnel_broker_tunnel as tunnel;

mod args;
pub mod auth;
pub mod authz;
pub mod muxer;
pub mod server;

pub use self::{
    args::Args,
    muxer::{Config as MuxerConfig, Muxer, Route},
};
