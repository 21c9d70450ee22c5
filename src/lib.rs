pub mod adaptors;
pub mod auth;
pub mod bridge;
pub mod cli;
pub mod models;
pub mod relay;
pub mod rerank;
pub mod selector;
pub mod server;
pub mod share;
pub mod store;
pub mod tasks;
pub mod usage;
