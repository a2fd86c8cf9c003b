pub mod audit;
pub mod auth;
pub mod config;
pub mod request_meta;
pub mod rpc;
pub mod security;
pub mod state;
