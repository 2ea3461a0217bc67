// src/lib.rs

pub mod cache;
pub mod cli;
pub mod config;
pub mod controller;
pub mod errors;
pub mod informer;
pub mod queue;
pub mod reconcile;
pub mod router;

pub use cache::key::ResourceKey;
pub use controller::Controller;
pub use errors::ControllerError;
