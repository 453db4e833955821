pub mod config;
pub mod logging;
pub mod metrics;
pub mod server;
pub mod service;
pub mod work;
