// ABOUTME: Library crate for mcpool exposing the pooling subsystem for testing and embedding

pub mod cli;
pub mod config;
pub mod mcp_pool;
