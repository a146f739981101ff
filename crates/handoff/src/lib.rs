pub mod app;
pub mod assignment;
pub mod auth;
pub mod clock;
pub mod config;
pub mod db;
pub mod db_ops;
pub mod error;
pub mod events;
pub mod handlers;
pub mod inactivity;
pub mod messaging;
pub mod queue;
pub mod scheduler;
pub mod settings;
pub mod sla;
pub mod storage;
pub mod webhooks;

pub use handoff_models as models;
