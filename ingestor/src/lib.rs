pub mod auth;
pub mod config;
pub mod connection;
pub mod db;
pub mod errors;
pub mod ingest;
pub mod interpolate;
pub mod messages;
pub mod metrics;
pub mod model;
pub mod normalize;
pub mod pipeline;
pub mod rest;
pub mod snapshot;
pub mod state;
