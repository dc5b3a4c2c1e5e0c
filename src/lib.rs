pub mod agent;
pub mod api;
pub mod camera;
pub mod config;
pub mod detection;
pub mod error;
pub mod status;
