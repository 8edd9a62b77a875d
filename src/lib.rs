pub mod analytics;
pub mod cli;
pub mod config;
pub mod db;
pub mod error;
pub mod graph_store;
pub mod ingest;
pub mod mcp;
pub mod model;
pub mod narrator;
pub mod repository;
pub mod resources;
pub mod session;
pub mod summary;
pub mod transport;
