// Library exports for testing and modular access

pub mod caller;
pub mod config;
pub mod db;
pub mod error;
pub mod health;
pub mod lock;
pub mod metrics;
pub mod models;
pub mod services;
pub mod state;
pub mod store;
pub mod telemetry;
