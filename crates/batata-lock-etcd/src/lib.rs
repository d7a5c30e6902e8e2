//! Batata Lock etcd - etcd v3 coordination store
//!
//! Speaks the etcd JSON gateway so a `LockManager` can arbitrate locks
//! across processes and hosts.

pub mod client;
pub mod config;
pub mod model;

pub use client::EtcdStore;
pub use crate::config::EtcdConfig;
