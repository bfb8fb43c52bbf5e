pub mod configuration;
pub mod errors;
pub mod helpers;
pub mod models;
pub mod services;
pub mod startup;
pub mod telemetry;
