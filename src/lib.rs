pub mod config;
pub mod engine;
pub mod http;
pub mod image;
pub mod limits;
pub mod loader;
pub mod model;
pub mod observability;
pub mod reaper;
pub mod store;
pub mod wal;
