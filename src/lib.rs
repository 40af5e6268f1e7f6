pub mod agent;
pub mod config;
pub mod error;
pub mod observability;
pub mod repo;
pub mod reporting;
pub mod selfupdate;
pub mod signature;
pub mod telemetry;
pub mod trust;
pub mod update;
