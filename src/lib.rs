pub mod cli;
pub mod config;
pub mod db;
pub mod registry;
pub mod services;
pub mod telemetry;
pub mod time;
