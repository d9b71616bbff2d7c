pub mod api;
pub mod config;
pub mod consistency;
pub mod db;
pub mod error;
pub mod ingest;
pub mod layout;
pub mod metadata;
pub mod model;
pub mod orchestrator;
pub mod outbox;
pub mod provider;
pub mod registry;
pub mod scheduler;
pub mod store;
