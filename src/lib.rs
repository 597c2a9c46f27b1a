pub mod api;
pub mod archive;
pub mod auth;
pub mod config;
pub mod export;
pub mod hub;
pub mod server;
pub mod stats;
pub mod store;
pub mod warehouse;
