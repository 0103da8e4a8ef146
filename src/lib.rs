pub mod api;
pub mod cache;
pub mod client;
pub mod config;
pub mod errors;
pub mod executor;
pub mod metrics;
pub mod response;
pub mod session;
pub mod utils;
pub mod worker;
