pub mod config;
pub mod error;
pub mod mirror;
pub mod store_client;
