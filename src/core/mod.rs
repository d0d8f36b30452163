pub mod config;
pub mod connection;
pub mod persistence;
pub mod pipeline;
pub mod signaling;
