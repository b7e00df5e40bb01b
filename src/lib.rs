// Library entry point for the V2Ray desktop core
pub mod app;
pub mod config;
pub mod controller;
pub mod error;
pub mod latency;
pub mod models;
pub mod pac;
pub mod system;
pub mod utils;
pub mod v2ray;

#[cfg(test)]
pub(crate) mod testing;
