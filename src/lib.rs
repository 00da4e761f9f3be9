pub mod db;
pub mod handlers;
pub mod jobs;
pub mod lock;
pub mod models;
pub mod registry;
pub mod services;
pub mod store;
