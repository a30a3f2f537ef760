pub mod args;
pub mod cache;
pub mod common;
pub mod config;
pub mod constants;
pub mod credentials;
pub mod enrich;
pub mod import;
pub mod legacy_export;
pub mod merge;
pub mod model;
pub mod patients_file;
pub mod progress;
pub mod scheduler;
pub mod session;
