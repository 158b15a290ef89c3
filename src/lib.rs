pub mod auth;
pub mod backplane;
pub mod config;
pub mod counters;
pub mod error;
pub mod lamport;
pub mod limiter;
pub mod metrics;
pub mod net;
pub mod proxy;
pub mod routing;
pub mod server;
pub mod stats;
pub mod swim;
pub mod upstream;
